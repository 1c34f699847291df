//! Scenariusze end-to-end: detektor + dyspozytor na dublerach w pamięci.
//! Bez sieci i bez bazy – platforma i store są atrapami.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;

use daisy_guard::actions::{ActionDispatcher, ActionOutcome, CaseStore, ModAction, Platform};
use daisy_guard::floodguard::{
    ChatId, ChatPolicy, CheckKind, ConfigStore, FloodGuard, FloodPolicy, GuardError, GuardTuning,
    GuardVerdict, InboundMessage, MAX_MUTE_MINUTES, PermissionChecker, SpamAction, SpamPolicy,
    UserId, ViolationEvent,
};

/* ===================== Dublerzy ===================== */

struct MemoryConfig(Mutex<Option<ChatPolicy>>);

impl MemoryConfig {
    fn new(policy: Option<ChatPolicy>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(policy)))
    }

    fn set(&self, policy: ChatPolicy) {
        *self.0.lock().unwrap() = Some(policy);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfig {
    async fn load_policy(&self, _chat_id: ChatId) -> Result<Option<ChatPolicy>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

struct NoAdmins;

#[async_trait]
impl PermissionChecker for NoAdmins {
    async fn is_privileged(&self, _chat_id: ChatId, _user_id: UserId) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Default)]
struct RecordingPlatform {
    actions: Mutex<Vec<(ChatId, UserId, ModAction)>>,
    notices: Mutex<Vec<String>>,
}

#[async_trait]
impl Platform for RecordingPlatform {
    async fn apply_action(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        action: &ModAction,
    ) -> Result<(), GuardError> {
        self.actions
            .lock()
            .unwrap()
            .push((chat_id, user_id, action.clone()));
        Ok(())
    }

    async fn notify(&self, _chat_id: ChatId, text: &str) -> Result<(), GuardError> {
        self.notices.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn delete_message(&self, _chat_id: ChatId, _message_id: i64) -> Result<(), GuardError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCases {
    warns: Mutex<u32>,
    cases: Mutex<Vec<(CheckKind, String, bool)>>,
}

#[async_trait]
impl CaseStore for MemoryCases {
    async fn record_case(&self, event: &ViolationEvent, outcome: &ActionOutcome) {
        self.cases.lock().unwrap().push((
            event.kind,
            outcome.action.as_str().to_string(),
            outcome.applied,
        ));
    }

    async fn bump_warns(&self, _chat_id: ChatId, _user_id: UserId) -> Result<u32> {
        let mut w = self.warns.lock().unwrap();
        *w += 1;
        Ok(*w)
    }

    async fn reset_warns(&self, _chat_id: ChatId, _user_id: UserId) -> Result<()> {
        *self.warns.lock().unwrap() = 0;
        Ok(())
    }
}

/* ===================== Pomocnicze ===================== */

fn base() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

fn msg(chat: ChatId, user: UserId, at: Instant) -> InboundMessage {
    InboundMessage {
        chat_id: chat,
        user_id: Some(user),
        message_id: 1,
        text: None,
        at: Some(at),
    }
}

fn spam_mute_policy() -> ChatPolicy {
    ChatPolicy {
        antispam: SpamPolicy {
            enabled: true,
            msg_limit: 3,
            time_frame_secs: 5,
            action: SpamAction::Mute,
            mute_minutes: 30,
            max_warns: 3,
        },
        ..Default::default()
    }
}

fn flood_only_policy() -> ChatPolicy {
    ChatPolicy {
        antiflood: FloodPolicy {
            enabled: true,
            msg_limit: 5,
            time_frame_secs: 10,
            mute_minutes: 10,
        },
        ..Default::default()
    }
}

struct Rig {
    guard: Arc<FloodGuard>,
    dispatcher: ActionDispatcher,
    platform: Arc<RecordingPlatform>,
    cases: Arc<MemoryCases>,
    config: Arc<MemoryConfig>,
}

fn rig(policy: ChatPolicy, tuning: GuardTuning) -> Rig {
    let config = MemoryConfig::new(Some(policy));
    let platform = Arc::new(RecordingPlatform::default());
    let cases = Arc::new(MemoryCases::default());
    let guard = FloodGuard::new(config.clone(), Arc::new(NoAdmins), tuning);
    let dispatcher =
        ActionDispatcher::new(platform.clone(), cases.clone(), Duration::from_secs(300));
    Rig {
        guard,
        dispatcher,
        platform,
        cases,
        config,
    }
}

/// Przepuszcza serię wiadomości przez detektor i dyspozytor; zwraca akcje,
/// które poszły na platformę.
async fn feed(rig: &Rig, chat: ChatId, user: UserId, stamps: &[Instant]) -> Vec<ModAction> {
    let mut out = Vec::new();
    for &at in stamps {
        if let GuardVerdict::Violation { event, policy } =
            rig.guard.check_message(&msg(chat, user, at)).await
        {
            let outcome = rig.dispatcher.dispatch(&event, &policy).await;
            out.push(outcome.action);
        }
    }
    out
}

/* ===================== Scenariusze ===================== */

#[tokio::test]
async fn spam_burst_ends_in_configured_mute() {
    let r = rig(spam_mute_policy(), GuardTuning::default());
    let t0 = base();
    let stamps: Vec<_> = (0..4u64)
        .map(|i| t0 + Duration::from_millis(i * 200))
        .collect();

    let actions = feed(&r, -100, 7, &stamps).await;

    assert_eq!(actions, vec![ModAction::Mute { minutes: 30 }]);
    let applied = r.platform.actions.lock().unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0], (-100, 7, ModAction::Mute { minutes: 30 }));
    // Komunikat o akcji poszedł na czat.
    assert_eq!(r.platform.notices.lock().unwrap().len(), 1);
    // Historia dostała wpis SPAM/MUTE z applied=true.
    let cases = r.cases.cases.lock().unwrap();
    assert_eq!(cases.as_slice(), &[(CheckKind::Spam, "MUTE".into(), true)]);
}

#[tokio::test]
async fn flood_only_policy_mutes_for_flood() {
    let r = rig(flood_only_policy(), GuardTuning::default());
    let t0 = base();
    // 6 wiadomości w 3 s przy limicie 5/10 s.
    let stamps: Vec<_> = (0..6u64)
        .map(|i| t0 + Duration::from_millis(i * 500))
        .collect();

    let actions = feed(&r, -200, 9, &stamps).await;

    assert_eq!(actions, vec![ModAction::Mute { minutes: 10 }]);
    let cases = r.cases.cases.lock().unwrap();
    assert_eq!(cases.as_slice(), &[(CheckKind::Flood, "MUTE".into(), true)]);
}

#[tokio::test]
async fn repeat_offender_walks_warn_ladder_to_ban() {
    let mut policy = spam_mute_policy();
    policy.antispam.action = SpamAction::Warn;
    policy.antispam.max_warns = 2;
    let r = rig(policy, GuardTuning::default());
    let t0 = base();

    // Pierwsza seria: warn 1/2.
    let stamps: Vec<_> = (0..4u64)
        .map(|i| t0 + Duration::from_millis(i * 200))
        .collect();
    let actions = feed(&r, -100, 7, &stamps).await;
    assert_eq!(actions, vec![ModAction::Warn { count: 1, max: 2 }]);

    // Druga seria minutę później – stare znaczniki wypadły z okna,
    // próg pęka od nowa i licznik warnów eskaluje do bana.
    let t1 = t0 + Duration::from_secs(60);
    let stamps: Vec<_> = (0..4u64)
        .map(|i| t1 + Duration::from_millis(i * 200))
        .collect();
    let actions = feed(&r, -100, 7, &stamps).await;
    assert_eq!(actions, vec![ModAction::Ban]);
    assert_eq!(*r.cases.warns.lock().unwrap(), 0);
}

#[tokio::test]
async fn tightened_limit_applies_after_policy_ttl() {
    // Krótki TTL cache'u polityk, żeby zmiana ustawień była widoczna w teście.
    let tuning = GuardTuning {
        policy_ttl: Duration::from_millis(10),
        ..Default::default()
    };
    let r = rig(spam_mute_policy(), tuning);
    let t0 = base();

    // Dwie wiadomości przy limicie 3 – czysto.
    let stamps: Vec<_> = (0..2u64)
        .map(|i| t0 + Duration::from_millis(i * 100))
        .collect();
    assert!(feed(&r, -100, 7, &stamps).await.is_empty());

    // Admin zaostrza limit do 1.
    let mut tightened = spam_mute_policy();
    tightened.antispam.msg_limit = 1;
    r.config.set(tightened);
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Okno przebudowuje się pod nowy limit: druga wiadomość już przelewa.
    let t1 = t0 + Duration::from_secs(1);
    let actions = feed(
        &r,
        -100,
        7,
        &[t1, t1 + Duration::from_millis(100)],
    )
    .await;
    assert_eq!(actions, vec![ModAction::Mute { minutes: 30 }]);
}

#[tokio::test]
async fn hostile_mute_minutes_reach_platform_clamped() {
    // Store może oddać dowolne i64 w mute_minutes; do platformy ma dojechać
    // wartość po przycięciu, nie surowa.
    let mut policy = spam_mute_policy();
    policy.antispam.mute_minutes = i64::MAX;
    let r = rig(policy, GuardTuning::default());
    let t0 = base();
    let stamps: Vec<_> = (0..4u64)
        .map(|i| t0 + Duration::from_millis(i * 200))
        .collect();

    let actions = feed(&r, -100, 7, &stamps).await;

    assert_eq!(
        actions,
        vec![ModAction::Mute {
            minutes: MAX_MUTE_MINUTES
        }]
    );
}

#[tokio::test]
async fn unconfigured_chat_generates_no_actions() {
    let r = rig(spam_mute_policy(), GuardTuning::default());
    *r.config.0.lock().unwrap() = None;
    let t0 = base();
    let stamps: Vec<_> = (0..10u64)
        .map(|i| t0 + Duration::from_millis(i * 50))
        .collect();

    let actions = feed(&r, -300, 5, &stamps).await;

    assert!(actions.is_empty());
    assert!(r.platform.actions.lock().unwrap().is_empty());
    assert_eq!(r.guard.tracked_windows(), 0);
}

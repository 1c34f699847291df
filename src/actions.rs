//! src/actions.rs
//! Dyspozytor akcji moderacyjnych: zamienia ViolationEvent na dokładnie
//! jedną akcję po stronie platformy i best-effort wpis w historii.
//!
//! Zasady:
//! - Spam -> warn (z eskalacją do bana po max_warns) / mute / ban wg polityki
//!   czatu; Flood -> tymczasowy mute. Czas mute zawsze z konfiguracji.
//! - Idempotencja: ponowne nałożenie akcji na już ukaranego użytkownika jest
//!   no-opem po stronie platformy; nie prowadzimy własnego dedupu.
//! - Awaria platformy: log + jedno powiadomienie adminów per chat per
//!   cooldown, bez ponawiania – inaczej w czasie awarii zalalibyśmy czat
//!   komunikatami o błędach.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::{info, warn};

use crate::floodguard::{ChatId, ChatPolicy, CheckKind, GuardError, SpamAction, UserId, ViolationEvent};

/* ==============================
   Typy akcji
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModAction {
    /// Ostrzeżenie słowne; `count`/`max` do komunikatu i eskalacji.
    Warn { count: u32, max: u32 },
    /// Tymczasowe wyciszenie.
    Mute { minutes: i64 },
    Ban,
}

impl ModAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModAction::Warn { .. } => "WARN",
            ModAction::Mute { .. } => "MUTE",
            ModAction::Ban => "BAN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub action: ModAction,
    /// Czy platforma przyjęła akcję. `false` = zalogowana awaria, bez retry.
    pub applied: bool,
}

/* ==============================
   Interfejsy współpracowników
   ============================== */

/// Klient platformy czatowej. Wywołania muszą być naturalnie idempotentne
/// (ban zbanowanego = no-op).
#[async_trait]
pub trait Platform: Send + Sync {
    async fn apply_action(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        action: &ModAction,
    ) -> Result<(), GuardError>;

    /// Wiadomość na czat (komunikat o akcji / powiadomienie adminów).
    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<(), GuardError>;

    async fn delete_message(&self, chat_id: ChatId, message_id: i64) -> Result<(), GuardError>;
}

/// Historia moderacji w zewnętrznym storze. Zapisy są best-effort –
/// awaria nie może blokować przetwarzania wiadomości.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn record_case(&self, event: &ViolationEvent, outcome: &ActionOutcome);

    /// Podbija licznik ostrzeżeń (chat, user) i zwraca nową wartość.
    async fn bump_warns(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<u32>;

    async fn reset_warns(&self, chat_id: ChatId, user_id: UserId) -> anyhow::Result<()>;
}

/* ==============================
   Dyspozytor
   ============================== */

pub struct ActionDispatcher {
    platform: Arc<dyn Platform>,
    cases: Arc<dyn CaseStore>,
    /// Tłumik powiadomień o awariach platformy, per chat.
    failure_notified: Cache<ChatId, ()>,
}

impl ActionDispatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        cases: Arc<dyn CaseStore>,
        failure_cooldown: Duration,
    ) -> Self {
        Self {
            platform,
            cases,
            failure_notified: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(failure_cooldown)
                .build(),
        }
    }

    /// Mapuje naruszenie na akcję wg polityki czatu i wykonuje ją raz.
    pub async fn dispatch(&self, event: &ViolationEvent, policy: &ChatPolicy) -> ActionOutcome {
        let action = self.pick_action(event, policy).await;

        let applied = match self
            .platform
            .apply_action(event.chat_id, event.user_id, &action)
            .await
        {
            Ok(()) => {
                info!(
                    chat_id = event.chat_id,
                    user_id = event.user_id,
                    kind = event.kind.as_str(),
                    action = action.as_str(),
                    count = event.count,
                    limit = event.limit,
                    "violation actioned"
                );
                let _ = self
                    .platform
                    .notify(event.chat_id, &action_announcement(event, &action))
                    .await;
                true
            }
            Err(e) => {
                warn!(
                    chat_id = event.chat_id,
                    user_id = event.user_id,
                    action = action.as_str(),
                    error = %e,
                    "platform action failed; not retrying"
                );
                if self.failure_notified.get(&event.chat_id).is_none() {
                    self.failure_notified.insert(event.chat_id, ());
                    let _ = self
                        .platform
                        .notify(
                            event.chat_id,
                            "⚠️ I detected a rate violation but could not act on it — \
                             please check that I have admin rights.",
                        )
                        .await;
                }
                false
            }
        };

        let outcome = ActionOutcome { action, applied };
        self.cases.record_case(event, &outcome).await;
        outcome
    }

    async fn pick_action(&self, event: &ViolationEvent, policy: &ChatPolicy) -> ModAction {
        match event.kind {
            CheckKind::Flood => ModAction::Mute {
                minutes: policy.antiflood.mute_minutes.max(1),
            },
            CheckKind::Spam => match policy.antispam.action {
                SpamAction::Mute => ModAction::Mute {
                    minutes: policy.antispam.mute_minutes.max(1),
                },
                SpamAction::Ban => ModAction::Ban,
                SpamAction::Warn => {
                    let max = policy.antispam.max_warns.max(1);
                    match self.cases.bump_warns(event.chat_id, event.user_id).await {
                        Ok(count) if count >= max => {
                            // Limit ostrzeżeń wyczerpany -> eskalacja.
                            let _ = self.cases.reset_warns(event.chat_id, event.user_id).await;
                            ModAction::Ban
                        }
                        Ok(count) => ModAction::Warn { count, max },
                        Err(e) => {
                            // Bez licznika nie eskalujemy – zostaje ostrzeżenie.
                            warn!(chat_id = event.chat_id, user_id = event.user_id, error = ?e,
                                "warn counter unavailable; issuing plain warn");
                            ModAction::Warn { count: 1, max }
                        }
                    }
                }
            },
        }
    }
}

fn action_announcement(event: &ViolationEvent, action: &ModAction) -> String {
    let what = match event.kind {
        CheckKind::Spam => "spamming",
        CheckKind::Flood => "flooding",
    };
    match action {
        ModAction::Warn { count, max } => format!(
            "⚠️ User {} warned for {} ({}/{} warnings).",
            event.user_id, what, count, max
        ),
        ModAction::Mute { minutes } => format!(
            "🔇 User {} muted for {} min ({}: {} msgs / limit {}).",
            event.user_id, minutes, what, event.count, event.limit
        ),
        ModAction::Ban => format!("🚫 User {} banned for {}.", event.user_id, what),
    }
}

/* ==============================
   Testy
   ============================== */

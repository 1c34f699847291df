//! src/floodguard.rs
//! FloodGuard – detektor nadużyć tempa wiadomości (anty-spam / anty-flood).
//!
//! Zawiera:
//! - RateWindow: pojedyncze okno przesuwne dla (chat, user, rodzaj)
//! - AbuseTracker: mapa okien z leniwym tworzeniem, odświeżaniem po zmianie
//!   konfiguracji i okresową eksmisją bezczynnych wpisów
//! - FloodGuard: orkiestracja sprawdzeń dla jednej wiadomości (Spam przed
//!   Flood, maksymalnie jedna akcja na wiadomość)
//! - Cache polityk per-chat (TTL) + cooldown logów przy niedostępnym storze
//!
//! Uwaga: wszystkie operacje trackera są czysto pamięciowe i nie zawierają
//! punktów await – blokady DashMap nigdy nie są trzymane przez wywołania I/O.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub type ChatId = i64;
pub type UserId = u64;

/* ==============================
   Typy publiczne i polityka czatu
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    Spam,
    Flood,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Spam => "SPAM",
            CheckKind::Flood => "FLOOD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpamAction {
    Warn,
    Mute,
    Ban,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamPolicy {
    pub enabled: bool,
    pub msg_limit: u32,
    pub time_frame_secs: u64,
    /// Co robimy po przekroczeniu progu: warn (z eskalacją), mute albo ban.
    pub action: SpamAction,
    pub mute_minutes: i64,
    pub max_warns: u32,
}

impl Default for SpamPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            msg_limit: 5,
            time_frame_secs: 5,
            action: SpamAction::Mute,
            mute_minutes: 30,
            max_warns: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodPolicy {
    pub enabled: bool,
    pub msg_limit: u32,
    pub time_frame_secs: u64,
    pub mute_minutes: i64,
}

impl Default for FloodPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            msg_limit: 10,
            time_frame_secs: 30,
            mute_minutes: 10,
        }
    }
}

/// Polityka moderacji jednego czatu. Właścicielem jest zewnętrzny store;
/// my trzymamy tylko przejściową kopię w cache (TTL), nigdy nie mutujemy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatPolicy {
    pub antispam: SpamPolicy,
    pub antiflood: FloodPolicy,
    pub filters: Vec<String>,
    pub block_links: bool,
}

/// Górny pułap mute w minutach (366 dni – dłuższe restrykcje Telegram i tak
/// traktuje jak permanentne).
pub const MAX_MUTE_MINUTES: i64 = 366 * 24 * 60;

impl ChatPolicy {
    /// Walidacja przy wczytaniu: zerowy limit albo zerowe okno wyłącza
    /// sprawdzenie, zamiast wybuchać w środku ewaluacji. Czas mute jest
    /// przycinany do [1, MAX_MUTE_MINUTES] – wartości z JSONB są dowolne
    /// i nie mogą przepełnić arytmetyki czasu przy wykonywaniu akcji.
    pub fn sanitize(mut self) -> Self {
        if self.antispam.msg_limit == 0 || self.antispam.time_frame_secs == 0 {
            self.antispam.enabled = false;
        }
        if self.antiflood.msg_limit == 0 || self.antiflood.time_frame_secs == 0 {
            self.antiflood.enabled = false;
        }
        self.antispam.mute_minutes = self.antispam.mute_minutes.clamp(1, MAX_MUTE_MINUTES);
        self.antiflood.mute_minutes = self.antiflood.mute_minutes.clamp(1, MAX_MUTE_MINUTES);
        self
    }
}

impl SpamPolicy {
    /// (limit, okno) jeśli sprawdzenie jest aktywne i poprawnie skonfigurowane.
    pub fn params(&self) -> Option<(u32, Duration)> {
        if self.enabled && self.msg_limit > 0 && self.time_frame_secs > 0 {
            Some((self.msg_limit, Duration::from_secs(self.time_frame_secs)))
        } else {
            None
        }
    }
}

impl FloodPolicy {
    pub fn params(&self) -> Option<(u32, Duration)> {
        if self.enabled && self.msg_limit > 0 && self.time_frame_secs > 0 {
            Some((self.msg_limit, Duration::from_secs(self.time_frame_secs)))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViolationEvent {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub kind: CheckKind,
    pub count: u32,
    pub limit: u32,
    pub detected_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct RateHit {
    pub count: u32,
    pub exceeded: bool,
}

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("invalid rate config: limit={limit}, window={window_secs}s")]
    InvalidConfig { limit: u32, window_secs: u64 },
    #[error("config store unavailable: {0}")]
    ConfigUnavailable(String),
    #[error("platform action failed: {0}")]
    PlatformActionFailed(String),
}

/* ==============================
   Interfejsy współpracowników
   ============================== */

/// Zewnętrzny store ustawień per-chat. Brak wpisu = wszystkie sprawdzenia
/// wyłączone.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_policy(&self, chat_id: ChatId) -> Result<Option<ChatPolicy>>;
}

/// Sprawdzenie uprawnień po stronie platformy (admin/owner czatu).
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn is_privileged(&self, chat_id: ChatId, user_id: UserId) -> Result<bool>;
}

/* ==============================
   RateWindow – okno przesuwne
   ============================== */

#[derive(Debug)]
struct RateWindow {
    /// Znaczniki czasu w porządku rosnącym.
    stamps: VecDeque<Instant>,
    limit: u32,
    window: Duration,
    /// Maksymalny widziany znacznik – cutoff przycinania liczymy od niego,
    /// żeby spóźnione (out-of-order) wiadomości nie cofały okna.
    max_seen: Instant,
    /// Ostatnia aktywność wg zegara procesu – podstawa eksmisji.
    last_record: Instant,
}

impl RateWindow {
    fn new(limit: u32, window: Duration, now: Instant) -> Self {
        Self {
            // Prealokacja pod mały limit; duże limity dorosną same.
            stamps: VecDeque::with_capacity((limit as usize).saturating_add(1).min(64)),
            limit,
            window,
            max_seen: now,
            last_record: Instant::now(),
        }
    }

    /// Dokłada znacznik, przycina wszystko starsze niż `max_seen - window`
    /// i zwraca liczbę wpisów po przycięciu (wliczając nowy).
    fn record(&mut self, ts: Instant) -> usize {
        if ts > self.max_seen {
            self.max_seen = ts;
        }
        match self.stamps.back() {
            Some(&back) if ts < back => {
                // Spóźniona dostawa – wstawiamy z zachowaniem porządku.
                let idx = self.stamps.partition_point(|&s| s <= ts);
                self.stamps.insert(idx, ts);
            }
            _ => self.stamps.push_back(ts),
        }
        self.prune();
        self.last_record = Instant::now();
        self.stamps.len()
    }

    fn prune(&mut self) {
        let Some(cutoff) = self.max_seen.checked_sub(self.window) else {
            return;
        };
        while let Some(&front) = self.stamps.front() {
            if front < cutoff {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_exceeded(&self) -> bool {
        self.stamps.len() as u32 > self.limit
    }
}

/* ==============================
   AbuseTracker – mapa okien
   ============================== */

pub type WindowKey = (ChatId, UserId, CheckKind);

/// Wyłączny właściciel wszystkich okien. Mutacje idą przez shardowane
/// blokady DashMap – klucze nie blokują się nawzajem.
#[derive(Debug, Default)]
pub struct AbuseTracker {
    windows: DashMap<WindowKey, RateWindow>,
}

impl AbuseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejestruje wiadomość w oknie (chat, user, kind). Okno powstaje
    /// leniwie z bieżącą konfiguracją; jeśli limit/okno się zmieniły od
    /// utworzenia, budujemy je od nowa – nigdy nie trzymamy po cichu
    /// nieaktualnego limitu.
    pub fn record(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        kind: CheckKind,
        limit: u32,
        window: Duration,
        ts: Instant,
    ) -> Result<RateHit, GuardError> {
        if limit == 0 || window.is_zero() {
            return Err(GuardError::InvalidConfig {
                limit,
                window_secs: window.as_secs(),
            });
        }

        let mut entry = self
            .windows
            .entry((chat_id, user_id, kind))
            .or_insert_with(|| RateWindow::new(limit, window, ts));

        if entry.limit != limit || entry.window != window {
            *entry = RateWindow::new(limit, window, ts);
        }

        let count = entry.record(ts) as u32;
        Ok(RateHit {
            count,
            exceeded: entry.is_exceeded(),
        })
    }

    /// Usuwa okna bez aktywności dłużej niż `idle_for`. Wyścig z równoległym
    /// `record` jest niegroźny: wpis po prostu powstanie na nowo z aktualną
    /// konfiguracją.
    pub fn evict_idle(&self, idle_for: Duration) {
        let now = Instant::now();
        self.windows
            .retain(|_, w| now.duration_since(w.last_record) <= idle_for);
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

/* ==============================
   FloodGuard – ewaluacja polityki
   ============================== */

#[derive(Debug, Clone)]
pub struct GuardTuning {
    /// TTL przejściowej kopii polityki czatu.
    pub policy_ttl: Duration,
    /// Cooldown logowania "store niedostępny" per chat.
    pub warn_cooldown: Duration,
    /// Po jakim czasie bezczynności okno wypada z pamięci.
    pub idle_evict: Duration,
    /// Kadencja zadania eksmisji.
    pub prune_interval: Duration,
}

impl Default for GuardTuning {
    fn default() -> Self {
        Self {
            policy_ttl: Duration::from_secs(30),
            warn_cooldown: Duration::from_secs(300),
            idle_evict: Duration::from_secs(600),
            prune_interval: Duration::from_secs(60),
        }
    }
}

/// Wiadomość przychodząca – minimum potrzebne do ewaluacji.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    /// Brak = post anonimowy (np. kanał) – nie da się go przypisać do okna.
    pub user_id: Option<UserId>,
    pub message_id: i64,
    pub text: Option<String>,
    /// Znacznik z kolejki dostarczania; brak = czas przybycia do ewaluatora.
    pub at: Option<Instant>,
}

/// Wynik ewaluacji jednej wiadomości.
#[derive(Debug, Clone)]
pub enum GuardVerdict {
    /// Nadawca zwolniony ze sprawdzeń (anonim, uprzywilejowany, brak
    /// konfiguracji albo store chwilowo niedostępny).
    Exempt,
    /// Sprawdzenia przeszły bez naruszeń. Jeśli polityka ma jakiekolwiek
    /// aktywne sprawdzenie, nadawca na pewno NIE jest uprzywilejowany –
    /// pipeline może na tym oprzeć filtry treści.
    Clean { policy: Arc<ChatPolicy> },
    /// Dokładnie jedno naruszenie – Spam ma pierwszeństwo przed Flood.
    Violation {
        event: ViolationEvent,
        policy: Arc<ChatPolicy>,
    },
}

pub struct FloodGuard {
    tracker: AbuseTracker,
    config: Arc<dyn ConfigStore>,
    perms: Arc<dyn PermissionChecker>,
    /// `None` = chat bez konfiguracji; cache'ujemy też brak, żeby
    /// nieskonfigurowane czaty nie odpytywały store'a per wiadomość.
    policy_cache: Cache<ChatId, Option<Arc<ChatPolicy>>>,
    store_warned: Cache<ChatId, ()>,
    tuning: GuardTuning,
}

impl FloodGuard {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        perms: Arc<dyn PermissionChecker>,
        tuning: GuardTuning,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            tracker: AbuseTracker::new(),
            config,
            perms,
            policy_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(tuning.policy_ttl)
                .build(),
            store_warned: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(tuning.warn_cooldown)
                .build(),
            tuning,
        });

        Self::spawn_evict_task(&this);

        this
    }

    fn spawn_evict_task(this: &Arc<Self>) {
        let weak = Arc::downgrade(this);
        let period = this.tuning.prune_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if let Some(strong) = weak.upgrade() {
                    strong.tracker.evict_idle(strong.tuning.idle_evict);
                } else {
                    break;
                }
            }
        });
    }

    /// Polityka czatu z cache; chybienie idzie do store'a. Błąd store'a
    /// degraduje do "pomiń sprawdzenia" i jest logowany najwyżej raz na
    /// cooldown per chat.
    pub async fn policy_for(&self, chat_id: ChatId) -> Option<Arc<ChatPolicy>> {
        if let Some(cached) = self.policy_cache.get(&chat_id) {
            return cached;
        }
        match self.config.load_policy(chat_id).await {
            Ok(Some(policy)) => {
                let policy = Arc::new(policy.sanitize());
                self.policy_cache.insert(chat_id, Some(policy.clone()));
                Some(policy)
            }
            Ok(None) => {
                self.policy_cache.insert(chat_id, None);
                None
            }
            Err(e) => {
                if self.store_warned.get(&chat_id).is_none() {
                    self.store_warned.insert(chat_id, ());
                    warn!(chat_id, error = ?e, "config store unavailable; skipping checks for this chat");
                }
                None
            }
        }
    }

    /// Ewaluacja jednej wiadomości. Żadna blokada okna nie jest trzymana
    /// przez zewnętrzne wywołania (store, uprawnienia) – najpierw I/O,
    /// potem czysto pamięciowe `record`.
    pub async fn check_message(&self, msg: &InboundMessage) -> GuardVerdict {
        let Some(user_id) = msg.user_id else {
            return GuardVerdict::Exempt;
        };

        let Some(policy) = self.policy_for(msg.chat_id).await else {
            return GuardVerdict::Exempt;
        };

        let has_rate_checks =
            policy.antispam.params().is_some() || policy.antiflood.params().is_some();
        let has_content_checks = policy.block_links || !policy.filters.is_empty();
        if !has_rate_checks && !has_content_checks {
            // Nic do sprawdzania – nie dotykamy uprawnień ani trackera.
            return GuardVerdict::Clean { policy };
        }

        match self.perms.is_privileged(msg.chat_id, user_id).await {
            Ok(true) => return GuardVerdict::Exempt,
            Ok(false) => {}
            Err(e) => {
                debug!(chat_id = msg.chat_id, user_id, error = ?e,
                    "permission check failed; skipping checks for this message");
                return GuardVerdict::Exempt;
            }
        }

        let now = msg.at.unwrap_or_else(Instant::now);

        // Spam przed Flood: krótsze, ostrzejsze okno najpierw; po trafieniu
        // kończymy – najwyżej jedna akcja na wiadomość.
        for (kind, params) in [
            (CheckKind::Spam, policy.antispam.params()),
            (CheckKind::Flood, policy.antiflood.params()),
        ] {
            let Some((limit, window)) = params else {
                continue;
            };
            match self
                .tracker
                .record(msg.chat_id, user_id, kind, limit, window, now)
            {
                Ok(hit) if hit.exceeded => {
                    let event = ViolationEvent {
                        chat_id: msg.chat_id,
                        user_id,
                        kind,
                        count: hit.count,
                        limit,
                        detected_at: now,
                    };
                    return GuardVerdict::Violation { event, policy };
                }
                Ok(_) => {}
                Err(e) => {
                    // sanitize() powinno to wyciąć przy wczytaniu; traktujemy
                    // sprawdzenie jako wyłączone.
                    debug!(chat_id = msg.chat_id, kind = kind.as_str(), error = %e,
                        "check disabled due to invalid config");
                }
            }
        }

        GuardVerdict::Clean { policy }
    }

    /// Sonda rozmiaru – do testów i statystyk.
    pub fn tracked_windows(&self) -> usize {
        self.tracker.tracked_windows()
    }

    /// Ręczne odpalenie eksmisji (testy; normalnie robi to zadanie w tle).
    pub fn evict_idle_now(&self, idle_for: Duration) {
        self.tracker.evict_idle(idle_for);
    }
}

/* ==============================
   Testy
   ============================== */

// src/lib.rs

pub mod actions;
pub mod config;
pub mod db;
pub mod filters;
pub mod floodguard;
pub mod logging;
pub mod telegram;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use once_cell::sync::OnceCell;

use actions::ActionDispatcher;
use config::Settings;
use db::{Db, PgStore};
use floodguard::{FloodGuard, GuardTuning};
use telegram::TelegramApi;

/// Globalny kontekst aplikacji.
/// Tu trzymamy uchwyt do DB, konfigurację i gotowe serwisy (FloodGuard,
/// dyspozytor akcji, klient platformy).
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub db: Db,
    telegram: OnceCell<Arc<TelegramApi>>,
    floodguard: OnceCell<Arc<FloodGuard>>,
    dispatcher: OnceCell<Arc<ActionDispatcher>>,
}

impl AppContext {
    /// Bootstrap całej aplikacji:
    /// - logi
    /// - połączenie z DB + idempotentny DDL
    /// - zbudowanie i wstrzyknięcie serwisów do OnceCell
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logi
        logging::init(&settings);

        // 2) DB
        let db = db::connect(&settings.database.url, settings.database.max_connections).await?;
        db::ensure_tables(&db).await?;

        // 3) kontekst (na razie z pustymi OnceCell)
        let ctx = Arc::new(Self {
            settings,
            db,
            telegram: OnceCell::new(),
            floodguard: OnceCell::new(),
            dispatcher: OnceCell::new(),
        });

        // 4) klient platformy
        let tg = Arc::new(TelegramApi::new(
            &ctx.settings.telegram.token,
            ctx.settings.telegram.api_base.as_deref(),
            ctx.settings.app.owner_id,
            ctx.settings.telegram.poll_timeout_secs,
        )?);
        let _ = ctx.telegram.set(tg.clone());

        // 5) store + detektor + dyspozytor
        let store = Arc::new(PgStore::new(ctx.db.clone()));
        let fg = ctx.settings.floodguard.clone();
        let tuning = GuardTuning {
            policy_ttl: Duration::from_secs(fg.policy_ttl_secs.unwrap_or(30)),
            warn_cooldown: Duration::from_secs(fg.warn_cooldown_secs.unwrap_or(300)),
            idle_evict: Duration::from_secs(fg.idle_evict_secs.unwrap_or(600)),
            prune_interval: Duration::from_secs(fg.prune_interval_secs.unwrap_or(60)),
        };
        let guard = FloodGuard::new(store.clone(), tg.clone(), tuning);
        let _ = ctx.floodguard.set(guard);

        let dispatcher = Arc::new(ActionDispatcher::new(
            tg,
            store,
            Duration::from_secs(fg.failure_notify_cooldown_secs.unwrap_or(300)),
        ));
        let _ = ctx.dispatcher.set(dispatcher);

        Ok(ctx)
    }

    /// Wygodny getter: daj mi FloodGuarda (Arc).
    pub fn floodguard(&self) -> Arc<FloodGuard> {
        self.floodguard
            .get()
            .expect("FloodGuard not initialized")
            .clone()
    }

    pub fn dispatcher(&self) -> Arc<ActionDispatcher> {
        self.dispatcher
            .get()
            .expect("ActionDispatcher not initialized")
            .clone()
    }

    pub fn telegram(&self) -> Arc<TelegramApi> {
        self.telegram
            .get()
            .expect("TelegramApi not initialized")
            .clone()
    }
}

/// Start pętli ingest (long-poll platformy).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    telegram::run_bot(ctx).await
}

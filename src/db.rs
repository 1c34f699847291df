//! src/db.rs
//! Warstwa Postgres: pula połączeń, idempotentny DDL (schemat `dg`),
//! ustawienia czatów (JSONB) oraz historia akcji i liczniki ostrzeżeń.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row, postgres::PgPoolOptions};

use crate::actions::{ActionOutcome, CaseStore};
use crate::floodguard::{ChatId, ChatPolicy, ConfigStore, GuardError, UserId, ViolationEvent};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>) -> Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .connect(url)
        .await?;

    Ok(pool)
}

/* ===================== DDL ===================== */

pub async fn ensure_tables(db: &Db) -> Result<()> {
    sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS dg;"#).execute(db).await?;

    // Ustawienia per chat – cały ChatPolicy jako JSONB (elastyczne pola,
    // walidacja po stronie aplikacji przy wczytaniu).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dg.chat_settings (
          chat_id    BIGINT PRIMARY KEY,
          cfg        JSONB NOT NULL DEFAULT '{}'::jsonb,
          updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(db)
    .await?;

    // Historia akcji detektora.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dg.cases (
          id         BIGSERIAL PRIMARY KEY,
          chat_id    BIGINT  NOT NULL,
          user_id    BIGINT  NOT NULL,
          kind       TEXT    NOT NULL,
          action     TEXT    NOT NULL,
          applied    BOOLEAN NOT NULL DEFAULT TRUE,
          msg_count  INT     NULL,
          msg_limit  INT     NULL,
          created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#,
    )
    .execute(db)
    .await?;

    // Liczniki ostrzeżeń (eskalacja warn -> ban).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dg.warns (
          chat_id    BIGINT NOT NULL,
          user_id    BIGINT NOT NULL,
          count      INT    NOT NULL DEFAULT 0,
          updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
          PRIMARY KEY (chat_id, user_id)
        );
        "#,
    )
    .execute(db)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_cases_chat_user_created
           ON dg.cases (chat_id, user_id, created_at DESC)"#,
    )
    .execute(db)
    .await?;

    Ok(())
}

/* ===================== Ustawienia czatu ===================== */

pub async fn load_chat_policy(db: &Db, chat_id: ChatId) -> Result<Option<ChatPolicy>> {
    let row = sqlx::query("SELECT cfg FROM dg.chat_settings WHERE chat_id = $1")
        .bind(chat_id)
        .fetch_optional(db)
        .await?;

    match row {
        Some(r) => {
            let cfg: serde_json::Value = r.try_get("cfg")?;
            let policy: ChatPolicy = serde_json::from_value(cfg)?;
            Ok(Some(policy))
        }
        None => Ok(None),
    }
}

/* ===================== Historia / warny ===================== */

pub async fn insert_case(
    db: &Db,
    event: &ViolationEvent,
    action: &str,
    applied: bool,
) -> Result<()> {
    sqlx::query(
        r#"INSERT INTO dg.cases (chat_id, user_id, kind, action, applied, msg_count, msg_limit)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(event.chat_id)
    .bind(event.user_id as i64)
    .bind(event.kind.as_str())
    .bind(action)
    .bind(applied)
    .bind(event.count as i32)
    .bind(event.limit as i32)
    .execute(db)
    .await?;
    Ok(())
}

pub async fn bump_warns(db: &Db, chat_id: ChatId, user_id: UserId) -> Result<u32> {
    let count: i32 = sqlx::query_scalar(
        r#"INSERT INTO dg.warns (chat_id, user_id, count, updated_at)
           VALUES ($1, $2, 1, now())
           ON CONFLICT (chat_id, user_id)
           DO UPDATE SET count = dg.warns.count + 1, updated_at = now()
           RETURNING count"#,
    )
    .bind(chat_id)
    .bind(user_id as i64)
    .fetch_one(db)
    .await?;
    Ok(count.max(0) as u32)
}

pub async fn reset_warns(db: &Db, chat_id: ChatId, user_id: UserId) -> Result<()> {
    sqlx::query("DELETE FROM dg.warns WHERE chat_id = $1 AND user_id = $2")
        .bind(chat_id)
        .bind(user_id as i64)
        .execute(db)
        .await?;
    Ok(())
}

/* ===================== Adapter pod interfejsy core ===================== */

/// Store ustawień i historii oparty o Postgres – wstrzykiwany do
/// FloodGuard/ActionDispatcher jako ConfigStore + CaseStore.
#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn load_policy(&self, chat_id: ChatId) -> Result<Option<ChatPolicy>> {
        load_chat_policy(&self.db, chat_id)
            .await
            .map_err(|e| GuardError::ConfigUnavailable(e.to_string()).into())
    }
}

#[async_trait]
impl CaseStore for PgStore {
    async fn record_case(&self, event: &ViolationEvent, outcome: &ActionOutcome) {
        // Best-effort: awaria zapisu nie może blokować przetwarzania.
        if let Err(e) = insert_case(&self.db, event, outcome.action.as_str(), outcome.applied).await
        {
            tracing::warn!(chat_id = event.chat_id, error = ?e, "case insert failed");
        }
    }

    async fn bump_warns(&self, chat_id: ChatId, user_id: UserId) -> Result<u32> {
        bump_warns(&self.db, chat_id, user_id).await
    }

    async fn reset_warns(&self, chat_id: ChatId, user_id: UserId) -> Result<()> {
        reset_warns(&self.db, chat_id, user_id).await
    }
}

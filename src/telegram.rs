//! src/telegram.rs
//! Klient Telegram Bot API (long-poll) + pętla ingest. Platforma jest tylko
//! współpracownikiem: dostarcza wiadomości, przyjmuje akcje moderacyjne
//! i odpowiada na pytanie "czy ten user jest adminem".

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::AppContext;
use crate::actions::{ActionDispatcher, ModAction, Platform};
use crate::filters;
use crate::floodguard::{
    ChatId, FloodGuard, GuardError, GuardVerdict, InboundMessage, PermissionChecker, UserId,
};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";
const HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

/* ===================== Klient API ===================== */

pub struct TelegramApi {
    client: Client,
    /// Pełny prefiks metod: `<base>/bot<token>`.
    base: String,
    owner_id: Option<u64>,
    poll_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramApi {
    pub fn new(
        token: &str,
        api_base: Option<&str>,
        owner_id: Option<u64>,
        poll_timeout_secs: Option<u64>,
    ) -> Result<Self> {
        let poll_timeout_secs = poll_timeout_secs.unwrap_or(DEFAULT_POLL_TIMEOUT_SECS);
        let client = Client::builder()
            .user_agent("DaisyGuard/0.1")
            // long-poll musi się zmieścić w timeoutcie klienta
            .timeout(Duration::from_secs(poll_timeout_secs + HTTP_TIMEOUT_SECS))
            .build()?;
        let base = format!(
            "{}/bot{}",
            api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/'),
            token
        );
        Ok(Self {
            client,
            base,
            owner_id,
            poll_timeout_secs,
        })
    }

    async fn call(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, GuardError> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GuardError::PlatformActionFailed(format!("{method}: {e}")))?;
        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| GuardError::PlatformActionFailed(format!("{method}: bad body: {e}")))?;
        if !body.ok {
            let desc = body.description.unwrap_or_else(|| "unknown error".into());
            return Err(GuardError::PlatformActionFailed(format!("{method}: {desc}")));
        }
        Ok(body.result)
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, GuardError> {
        let result = self
            .call(
                "getUpdates",
                json!({
                    "offset": offset,
                    "timeout": self.poll_timeout_secs,
                    "allowed_updates": ["message"],
                }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| GuardError::PlatformActionFailed(format!("getUpdates: decode: {e}")))
    }
}

#[async_trait]
impl Platform for TelegramApi {
    async fn apply_action(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        action: &ModAction,
    ) -> Result<(), GuardError> {
        match action {
            // Warn nie dotyka uprawnień – komunikat idzie przez notify().
            ModAction::Warn { .. } => Ok(()),
            ModAction::Mute { minutes } => {
                // Bez panik na absurdalnych wartościach: poza zakresem chrono
                // schodzimy do maksymalnej restrykcji (366 dni).
                let span = ChronoDuration::try_minutes(*minutes)
                    .unwrap_or_else(|| ChronoDuration::days(366));
                let until = Utc::now()
                    .checked_add_signed(span)
                    .unwrap_or_else(|| Utc::now() + ChronoDuration::days(366))
                    .timestamp();
                // restrictChatMember na już wyciszonym userze to no-op –
                // idempotencja po stronie platformy.
                self.call(
                    "restrictChatMember",
                    json!({
                        "chat_id": chat_id,
                        "user_id": user_id,
                        "permissions": { "can_send_messages": false },
                        "until_date": until,
                    }),
                )
                .await
                .map(|_| ())
            }
            ModAction::Ban => self
                .call(
                    "banChatMember",
                    json!({ "chat_id": chat_id, "user_id": user_id }),
                )
                .await
                .map(|_| ()),
        }
    }

    async fn notify(&self, chat_id: ChatId, text: &str) -> Result<(), GuardError> {
        self.call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, chat_id: ChatId, message_id: i64) -> Result<(), GuardError> {
        match self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await
        {
            Ok(_) => Ok(()),
            // Już skasowana = stan docelowy osiągnięty.
            Err(GuardError::PlatformActionFailed(desc))
                if desc.contains("message to delete not found") =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PermissionChecker for TelegramApi {
    async fn is_privileged(&self, chat_id: ChatId, user_id: UserId) -> Result<bool> {
        if self.owner_id == Some(user_id) {
            return Ok(true);
        }
        let member = self
            .call(
                "getChatMember",
                json!({ "chat_id": chat_id, "user_id": user_id }),
            )
            .await?;
        let status = member
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or_default();
        Ok(matches!(status, "creator" | "administrator"))
    }
}

/* ===================== Typy update'ów ===================== */

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    /// Brak przy postach anonimowych/kanałowych.
    pub from: Option<TgUser>,
    pub sender_chat: Option<TgChat>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: u64,
    #[serde(default)]
    pub is_bot: bool,
}

/* ===================== Pętla ingest ===================== */

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let api = ctx.telegram();
    let guard = ctx.floodguard();
    let dispatcher = ctx.dispatcher();

    info!(app = %ctx.settings.app.name, "polling for updates");

    let mut offset = 0i64;
    loop {
        let updates = match api.get_updates(offset).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "getUpdates failed; backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(msg) = update.message else { continue };
            handle_message(&api, &guard, &dispatcher, &msg).await;
        }
    }
}

async fn handle_message(
    api: &Arc<TelegramApi>,
    guard: &Arc<FloodGuard>,
    dispatcher: &Arc<ActionDispatcher>,
    msg: &TgMessage,
) {
    // Boty i prywatne rozmowy nas nie interesują.
    if msg.from.as_ref().is_some_and(|f| f.is_bot) {
        return;
    }
    if !matches!(msg.chat.kind.as_str(), "group" | "supergroup") {
        return;
    }

    // Post anonimowy (sender_chat) nie ma tożsamości usera.
    let user_id = if msg.sender_chat.is_some() {
        None
    } else {
        msg.from.as_ref().map(|f| f.id)
    };

    let inbound = InboundMessage {
        chat_id: msg.chat.id,
        user_id,
        message_id: msg.message_id,
        text: msg.text.clone(),
        at: None,
    };

    match guard.check_message(&inbound).await {
        GuardVerdict::Violation { event, policy } => {
            // Wiadomość, która przelała czarę, też znika (best-effort).
            let _ = api.delete_message(msg.chat.id, msg.message_id).await;
            dispatcher.dispatch(&event, &policy).await;
        }
        GuardVerdict::Clean { policy } => {
            let Some(text) = msg.text.as_deref() else {
                return;
            };
            if policy.block_links && filters::contains_link(text) {
                if let Err(e) = api.delete_message(msg.chat.id, msg.message_id).await {
                    warn!(chat_id = msg.chat.id, error = %e, "link delete failed");
                } else {
                    debug!(chat_id = msg.chat.id, user_id = ?user_id, "link blocked");
                }
            } else if let Some(trigger) = filters::match_trigger(&policy.filters, text) {
                if let Err(e) = api.delete_message(msg.chat.id, msg.message_id).await {
                    warn!(chat_id = msg.chat.id, error = %e, "filtered delete failed");
                } else {
                    info!(chat_id = msg.chat.id, user_id = ?user_id, trigger, "filtered message deleted");
                }
            }
        }
        GuardVerdict::Exempt => {}
    }
}

//! ============================================================================
//! Telegram Bot - Bot API transport
//! ============================================================================
//! Handles the chat side of the gate using a bot token:
//! - getUpdates long polling (messages + chat join requests)
//! - direct messages, join approvals, bans, invite links
//! - error classification (already-applied vs rate-limited vs permanent)
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Messenger, UpdateSource};
use crate::types::{ChatId, EventKind, InboundEvent, ParseMode, UserId};

/// Telegram Bot API base URL
const TELEGRAM_API: &str = "https://api.telegram.org";

/// HTTP timeout; must exceed the long-poll timeout
const HTTP_TIMEOUT_SECS: u64 = 90;

/// Telegram limits invite link names to 32 characters
const INVITE_NAME_MAX: usize = 32;

/// Rate-limited membership calls are retried this many times
const RATE_LIMIT_RETRIES: u32 = 2;

/// Upper bound on a single retry_after wait
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Failure talking to the Bot API
#[derive(Debug, Clone, thiserror::Error)]
pub enum TelegramError {
    #[error("Telegram request failed: {0}")]
    Transport(String),

    #[error("Telegram API error {code}: {description}")]
    Api {
        code: i64,
        description: String,
        retry_after: Option<u64>,
    },
}

impl TelegramError {
    /// Seconds Telegram asked us to wait, for rate-limit errors
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TelegramError::Api { retry_after, .. } => *retry_after,
            TelegramError::Transport(_) => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TelegramError::Transport(_) => ErrorKind::Retryable,
            TelegramError::Api { code, description, .. } => classify_error(*code, description),
        }
    }
}

/// Error classification for membership calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The chat is already in the requested state; treat as success
    AlreadyApplied,
    /// Too many requests, back off
    RateLimited,
    /// Will fail again no matter how often it is retried
    Permanent,
    /// Likely transient
    Retryable,
}

/// Classify a Bot API error to decide between no-op, retry and give up
pub fn classify_error(code: i64, description: &str) -> ErrorKind {
    let lower = description.to_lowercase();

    if code == 429 || lower.contains("too many requests") {
        return ErrorKind::RateLimited;
    }

    // Target user is not in the chat / request already handled
    if lower.contains("user_not_participant")
        || lower.contains("participant_id_invalid")
        || lower.contains("user not found")
        || lower.contains("member not found")
        || lower.contains("hide_requester_missing")
        || lower.contains("user_already_participant")
    {
        return ErrorKind::AlreadyApplied;
    }

    if code == 401
        || code == 403
        || lower.contains("not enough rights")
        || lower.contains("chat_admin_required")
        || lower.contains("can't remove chat owner")
        || lower.contains("user is an administrator")
        || lower.contains("chat not found")
    {
        return ErrorKind::Permanent;
    }

    if code >= 500 {
        return ErrorKind::Retryable;
    }

    if code == 400 {
        return ErrorKind::Permanent;
    }

    ErrorKind::Retryable
}

/// Telegram Bot API client
pub struct TelegramBot {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl TelegramBot {
    /// Create a new bot client with the given token
    pub fn new(token: String) -> Result<Self> {
        Self::with_base_url(token, TELEGRAM_API.to_string())
    }

    /// Create a bot client against a custom Bot API server
    pub fn with_base_url(token: String, base_url: String) -> Result<Self> {
        if token.trim().is_empty() {
            return Err(anyhow!("Telegram bot token is empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            token,
            base_url,
        })
    }

    /// Verify the token by fetching the bot's own account. Fails on a bad token.
    pub async fn get_me(&self) -> Result<BotUser> {
        let me: BotUser = self.call("getMe", &serde_json::json!({})).await?;
        info!("Authorized as @{}", me.username.as_deref().unwrap_or("<unnamed>"));
        Ok(me)
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, TelegramError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}/bot{}/{}", self.base_url, self.token, method);

        let response = self
            .client
            .post(&url)
            .json(params)
            .send()
            .await
            // reqwest errors embed the URL, which contains the token
            .map_err(|e| TelegramError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        let body: ApiResponse<R> = response
            .json()
            .await
            .map_err(|e| TelegramError::Transport(format!("Failed to parse {} response ({}): {}", method, status, e.without_url())))?;

        match (body.ok, body.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TelegramError::Api {
                code: body.error_code.unwrap_or(status.as_u16() as i64),
                description: body.description.unwrap_or_else(|| format!("{} failed", method)),
                retry_after: body.parameters.and_then(|p| p.retry_after),
            }),
        }
    }

    /// Run a membership call, treating "already in that state" as success
    async fn membership_call(&self, method: &str, params: &serde_json::Value) -> Result<()> {
        let mut rate_limited = 0;
        loop {
            let err = match self.call::<_, bool>(method, params).await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };

            match err.kind() {
                ErrorKind::AlreadyApplied => {
                    debug!("{} was a no-op: {}", method, err);
                    return Ok(());
                }
                ErrorKind::RateLimited if rate_limited < RATE_LIMIT_RETRIES => {
                    rate_limited += 1;
                    let wait = err.retry_after().unwrap_or(1).min(MAX_RETRY_AFTER_SECS);
                    warn!("{} rate limited, retrying in {}s", method, wait);
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                }
                kind => {
                    warn!("{} failed ({:?}): {}", method, kind, err);
                    return Err(anyhow!(err));
                }
            }
        }
    }
}

#[async_trait]
impl Messenger for TelegramBot {
    async fn send_message(&self, user: UserId, text: &str, mode: ParseMode) -> Result<()> {
        debug!("Sending message to {}: {}...", user, text.chars().take(40).collect::<String>());

        let request = SendMessageRequest {
            chat_id: user,
            text,
            parse_mode: match mode {
                ParseMode::Plain => None,
                ParseMode::Markdown => Some("Markdown"),
            },
        };

        self.call::<_, serde_json::Value>("sendMessage", &request)
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Failed to message {}: {}", user, e))
    }

    async fn approve_join(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.membership_call(
            "approveChatJoinRequest",
            &serde_json::json!({ "chat_id": chat, "user_id": user }),
        )
        .await
    }

    async fn decline_join(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.membership_call(
            "declineChatJoinRequest",
            &serde_json::json!({ "chat_id": chat, "user_id": user }),
        )
        .await
    }

    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()> {
        info!("Banning user {} from chat {}", user, chat);
        self.membership_call(
            "banChatMember",
            &serde_json::json!({ "chat_id": chat, "user_id": user }),
        )
        .await
    }

    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.membership_call(
            "unbanChatMember",
            &serde_json::json!({ "chat_id": chat, "user_id": user, "only_if_banned": true }),
        )
        .await
    }

    async fn create_invite_link(&self, chat: ChatId, name: &str) -> Result<String> {
        let name: String = name.chars().take(INVITE_NAME_MAX).collect();
        let link: InviteLink = self
            .call(
                "createChatInviteLink",
                &serde_json::json!({ "chat_id": chat, "name": name }),
            )
            .await
            .map_err(|e| anyhow!("Failed to create invite link for chat {}: {}", chat, e))?;

        info!("Created invite link for chat {}", chat);
        Ok(link.invite_link)
    }
}

#[async_trait]
impl UpdateSource for TelegramBot {
    async fn next_batch(&self, offset: i64, timeout_secs: u64) -> Result<Vec<InboundEvent>> {
        let request = serde_json::json!({
            "offset": offset,
            "timeout": timeout_secs,
            "allowed_updates": ["message", "chat_join_request"],
        });

        let updates: Vec<Update> = self
            .call("getUpdates", &request)
            .await
            .map_err(|e| anyhow!("Failed to fetch updates: {}", e))?;

        Ok(updates.into_iter().map(Update::into_event).collect())
    }
}

// ============================================================================
// Telegram API Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

/// The bot's own account, returned by getMe
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InviteLink {
    invite_link: String,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
    chat_join_request: Option<JoinRequest>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<User>,
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct JoinRequest {
    chat: Chat,
    from: User,
}

impl Update {
    fn into_event(self) -> InboundEvent {
        let kind = if let Some(request) = self.chat_join_request {
            EventKind::JoinRequest {
                chat_id: request.chat.id,
                user_id: request.from.id,
            }
        } else {
            match self.message {
                Some(Message {
                    from: Some(user),
                    chat,
                    text,
                }) if chat.kind == "private" && !user.is_bot => EventKind::DirectMessage {
                    user_id: user.id,
                    text: text.unwrap_or_default(),
                },
                _ => EventKind::Ignored,
            }
        };

        InboundEvent {
            id: self.update_id,
            kind,
        }
    }
}

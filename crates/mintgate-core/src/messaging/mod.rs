//! ============================================================================
//! Messaging Module - Group membership + direct messages
//! ============================================================================
//! Interfaces to the chat platform:
//! - `Messenger`: DMs, join-request approval, ban/unban, invite links
//! - `UpdateSource`: long-polled inbound events
//!
//! `TelegramBot` implements both over the Telegram Bot API. Ban and unban
//! are idempotent: "already in that state" answers are reported as success.
//! ============================================================================

mod telegram;

pub use telegram::{classify_error, BotUser, ErrorKind, TelegramBot, TelegramError};

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{ChatId, InboundEvent, ParseMode, UserId};

/// Outbound side of the chat platform
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a direct message to a user
    async fn send_message(&self, user: UserId, text: &str, mode: ParseMode) -> Result<()>;

    /// Approve a pending join request
    async fn approve_join(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Decline a pending join request
    async fn decline_join(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Remove a user from a group and keep them out. Succeeds if already out.
    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Lift a ban, only if one exists. Succeeds if the user was not banned.
    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Create a long-lived invite link for a group
    async fn create_invite_link(&self, chat: ChatId, name: &str) -> Result<String>;
}

/// Inbound side of the chat platform
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Events with id >= `offset`, waiting up to `timeout_secs` for new ones
    async fn next_batch(&self, offset: i64, timeout_secs: u64) -> Result<Vec<InboundEvent>>;
}

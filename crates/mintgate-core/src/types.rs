//! ============================================================================
//! Core Types for MintGate
//! ============================================================================
//! Identifiers, inbound events and the user-facing message catalogue shared
//! by the verification, reconciliation and dispatch components.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Messaging-platform user id (Telegram user ids fit in i64)
pub type UserId = i64;

/// Messaging-platform group/chat id
pub type ChatId = i64;

/// Inbound event delivered by the messaging transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Monotonically increasing id, persisted as the resumption cursor
    pub id: i64,
    pub kind: EventKind,
}

/// What an inbound event asks the gate to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A user asked to join a gated group
    JoinRequest { chat_id: ChatId, user_id: UserId },
    /// A text message sent to the bot in a private chat
    DirectMessage { user_id: UserId, text: String },
    /// Anything the gate does not act on (group chatter, edits, stickers...)
    Ignored,
}

/// Formatting of outbound text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseMode {
    Plain,
    Markdown,
}

/// Why a verification session ended without recording ownership
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionFailure {
    #[error("Challenge observation was cancelled by shutdown")]
    Cancelled,

    #[error("Transfer lookup failed: {0}")]
    PollFailed(String),

    #[error("Could not deliver challenge instructions: {0}")]
    Delivery(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Ownership transfer failed for {asset}: {reason}")]
    Transfer { asset: String, reason: String },
}

/// User-facing message catalogue
pub mod messages {
    pub const GENERIC_ERROR: &str = "Something went wrong. Please try again later.";
    pub const GREETING: &str =
        "Hello! Please send your Solana wallet address so the bot could verify your account.";
    pub const INVALID_WALLET: &str = "Please provide a valid wallet address";
    pub const NO_QUALIFYING_ASSETS: &str =
        "Unfortunately you don't own any of the NFTs that can be verified.";
    pub const TIMED_OUT: &str = "Verification timed out. Try again later.";
    pub const SUCCESS: &str = "Success! Thank you for the effort.";

    /// Notice sent to a user removed because their last qualifying NFT moved
    pub fn removed_from_group(collection_name: &str) -> String {
        format!(
            "Your wallet doesn't have {} anymore, you have been removed from the private chat.",
            collection_name
        )
    }

    /// Invite delivered after a successful verification
    pub fn invite(collection_name: &str, link: &str) -> String {
        format!(
            "Please use the following link to join *{}* private group:\n{}\n",
            collection_name, link
        )
    }
}

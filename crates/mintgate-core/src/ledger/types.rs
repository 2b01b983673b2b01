//! ============================================================================
//! Ledger Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Verified owner of one NFT mint.
/// Written when a verification session confirms the wallet, deleted when the
/// watchdog sees the NFT leave that wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    /// Base58 wallet address that proved control
    pub wallet: String,
    /// Messaging user that completed the challenge
    pub user: UserId,
    /// Unix seconds of the confirming session
    pub verified_at: i64,
}

impl OwnershipRecord {
    pub fn new(wallet: impl Into<String>, user: UserId) -> Self {
        Self {
            wallet: wallet.into(),
            user,
            verified_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Ledger statistics for the admin CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_records: usize,
    pub distinct_users: usize,
    pub distinct_wallets: usize,
    pub cursor: Option<i64>,
}

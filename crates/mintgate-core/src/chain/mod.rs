//! ============================================================================
//! Chain Module - On-chain ownership and payment lookups
//! ============================================================================
//! The gate only needs three questions answered by the chain:
//! - which of these NFT mints does a wallet hold?
//! - who holds this NFT right now?
//! - has this wallet sent itself exactly N lamports since time T?
//!
//! `SolanaChain` answers them over JSON-RPC; tests substitute fakes.
//! ============================================================================

mod solana;

pub use solana::{matches_self_transfer, SolanaChain};

use anyhow::Result;
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeSet;

/// On-chain queries consumed by verification and the watchdog
#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Subset of `candidates` (mint addresses) currently held by `wallet`
    async fn owned_assets(&self, wallet: &Pubkey, candidates: &BTreeSet<String>) -> Result<Vec<String>>;

    /// Wallet currently holding the NFT, or None if nobody does (burned)
    async fn current_owner(&self, mint: &str) -> Result<Option<Pubkey>>;

    /// Whether `wallet` has sent exactly `lamports` to itself at or after
    /// unix time `since`
    async fn find_self_transfer(&self, wallet: &Pubkey, lamports: u64, since: i64) -> Result<bool>;
}

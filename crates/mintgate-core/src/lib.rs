//! ============================================================================
//! MINTGATE-CORE: NFT-gated group access
//! ============================================================================
//! This crate handles all backend logic for the MintGate bot:
//! - Wallet verification via a random SOL self-transfer challenge
//! - Ownership ledger (NFT mint -> verified user) in redb
//! - Group membership reconciliation (approve, ban, unban, invite)
//! - Periodic watchdog re-validating ownership on-chain
//! ============================================================================

pub mod access;
pub mod chain;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod ledger;
pub mod messaging;
pub mod shutdown;
pub mod types;
pub mod verification;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use types::*;
pub use access::{AccessReconciler, CandidateOutcome, ReconcileReport};
pub use chain::{ChainQuery, SolanaChain};
pub use context::{GateContext, GateSettings};
pub use directory::{AssetDirectory, Collection};
pub use dispatcher::{DispatchOutcome, JoinDecision, UpdateDispatcher};
pub use ledger::{Ledger, LedgerStats, OwnershipRecord};
pub use messaging::{Messenger, TelegramBot, UpdateSource};
pub use shutdown::{ShutdownController, ShutdownSignal};
pub use verification::{SessionOutcome, VerificationSession};
pub use watchdog::{CycleReport, Watchdog};

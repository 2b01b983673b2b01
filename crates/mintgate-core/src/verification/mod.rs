//! ============================================================================
//! Verification Module - Proof of wallet control
//! ============================================================================
//! A user proves they control a wallet by sending a random micro-amount of SOL
//! from that wallet to itself within a bounded window. Only then are the NFTs
//! the wallet holds attributed to the user in the ledger.
//! ============================================================================

mod challenge;
mod session;

pub use challenge::{challenge_amount, format_sol, ChallengeWindow, WindowTick};
pub use session::{SessionOutcome, SessionState, VerificationSession};

//! ============================================================================
//! Access Module - NFT-gated group membership
//! ============================================================================
//! Ties the ownership ledger to group membership:
//! - `transfer_ownership`: record a verified owner, revoke the superseded one
//! - `reconcile_candidates`: ban users left without a qualifying asset
//! - `restore_access`: unban and send the invite after verification
//!
//! ## Usage
//! ```rust,ignore
//! use mintgate_core::access::AccessReconciler;
//!
//! let reconciler = AccessReconciler::new(&ctx);
//! let report = reconciler.transfer_ownership(&mint, &wallet, user_id).await?;
//! ```
//! ============================================================================

mod reconciler;

pub use reconciler::{AccessReconciler, CandidateOutcome, ReconcileReport};

//! ============================================================================
//! Access Reconciler - Keeps group membership consistent with the ledger
//! ============================================================================
//! A user keeps access to a collection's group exactly while the ledger
//! attributes at least one of that collection's mints to them. Every removal
//! is decided from a fresh ledger read, never from the caller's view, so two
//! racing writers can't each revoke on stale data.
//! ============================================================================

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::context::GateContext;
use crate::directory::Collection;
use crate::ledger::OwnershipRecord;
use crate::types::{messages, ParseMode, UserId};

/// What happened to one candidate user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Still holds a qualifying asset
    Retained,
    /// Banned and notified
    Revoked,
    /// Should lose access but the removal did not go through; recorded in
    /// the ledger so the next watchdog cycle tries again
    Deferred(String),
}

/// Per-user outcomes of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcomes: BTreeMap<UserId, CandidateOutcome>,
}

impl ReconcileReport {
    pub fn revoked(&self) -> usize {
        self.count(|o| *o == CandidateOutcome::Revoked)
    }

    pub fn retained(&self) -> usize {
        self.count(|o| *o == CandidateOutcome::Retained)
    }

    pub fn deferred(&self) -> usize {
        self.count(|o| matches!(o, CandidateOutcome::Deferred(_)))
    }

    fn count(&self, pred: impl Fn(&CandidateOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| pred(o)).count()
    }
}

/// Ownership transfers and access revocation for one gate
pub struct AccessReconciler<'a> {
    ctx: &'a GateContext,
}

impl<'a> AccessReconciler<'a> {
    pub fn new(ctx: &'a GateContext) -> Self {
        Self { ctx }
    }

    /// Attribute `mint` to (`wallet`, `user`) and revoke whoever is left
    /// without a qualifying asset as a result.
    pub async fn transfer_ownership(&self, mint: &str, wallet: &str, user: UserId) -> Result<ReconcileReport> {
        let collection = self
            .ctx
            .directory
            .collection_of(mint)
            .ok_or_else(|| anyhow!("Mint {} is not part of any collection", mint))?;

        let previous = self.ctx.ledger.replace(mint, wallet, user)?;
        self.settle_transfer(collection, mint, user, previous).await
    }

    /// Candidates after `user` overwrote `previous`: the previous owner, and
    /// `user` itself if the mint has been re-attributed since the write.
    async fn settle_transfer(
        &self,
        collection: &Collection,
        mint: &str,
        user: UserId,
        previous: Option<OwnershipRecord>,
    ) -> Result<ReconcileReport> {
        let mut candidates = BTreeSet::new();
        if let Some(prev) = previous {
            if prev.user != user {
                info!("Mint {} moved from user {} to user {}", mint, prev.user, user);
                candidates.insert(prev.user);
            }
        }

        // A concurrent writer may have replaced us between the write and here;
        // if so we are the one who might have lost access.
        match self.ctx.ledger.get(mint)? {
            Some(current) if current.user == user => {}
            other => {
                warn!(
                    "Mint {} was re-attributed concurrently (now {:?}), re-checking user {}",
                    mint,
                    other.map(|r| r.user),
                    user
                );
                candidates.insert(user);
            }
        }

        self.reconcile_candidates(&collection.id, candidates).await
    }

    /// Revoke every candidate who holds no mint of the collection in the
    /// current ledger. Ban and notify are sent at most once per user.
    pub async fn reconcile_candidates(
        &self,
        collection_id: &str,
        candidates: impl IntoIterator<Item = UserId>,
    ) -> Result<ReconcileReport> {
        let collection = self
            .ctx
            .directory
            .collection(collection_id)
            .ok_or_else(|| anyhow!("Unknown collection: {}", collection_id))?;

        let users: BTreeSet<UserId> = candidates.into_iter().collect();
        let mut report = ReconcileReport::default();

        for user in users {
            let outcome = match self.holds_any(collection, user) {
                Ok(true) => {
                    debug!("User {} still holds a {} asset", user, collection.name);
                    CandidateOutcome::Retained
                }
                Ok(false) => self.revoke(collection, user).await,
                Err(e) => {
                    warn!("Ledger read failed while reconciling user {}: {}", user, e);
                    CandidateOutcome::Deferred(e.to_string())
                }
            };
            self.track_pending(collection, user, &outcome);
            report.outcomes.insert(user, outcome);
        }

        Ok(report)
    }

    /// Lift any ban and deliver the collection's invite link
    pub async fn restore_access(&self, collection: &Collection, user: UserId) -> Result<()> {
        if let Err(e) = self.ctx.messenger.unban(collection.chat_id, user).await {
            warn!("Failed to unban user {} in {}: {}", user, collection.name, e);
        }

        let link = self.invite_link(collection).await?;
        self.ctx
            .messenger
            .send_message(user, &messages::invite(&collection.name, &link), ParseMode::Markdown)
            .await
            .map_err(|e| anyhow!("Failed to send invite for {} to {}: {}", collection.name, user, e))
    }

    /// Configured link, else the cached one, else a freshly created (and cached) one
    pub async fn invite_link(&self, collection: &Collection) -> Result<String> {
        if let Some(link) = &collection.invite_link {
            return Ok(link.clone());
        }
        if let Some(link) = self.ctx.ledger.cached_invite(&collection.id)? {
            return Ok(link);
        }

        let link = self
            .ctx
            .messenger
            .create_invite_link(collection.chat_id, &collection.name)
            .await?;
        info!("Created invite link for {}", collection.name);
        if let Err(e) = self.ctx.ledger.cache_invite(&collection.id, &link) {
            warn!("Failed to cache invite link for {}: {}", collection.name, e);
        }
        Ok(link)
    }

    /// Fresh ledger read: does `user` own any mint of `collection`?
    pub fn holds_any(&self, collection: &Collection, user: UserId) -> Result<bool> {
        let records = self.ctx.ledger.list_all()?;
        Ok(records
            .iter()
            .any(|(mint, record)| record.user == user && collection.mints.contains(mint)))
    }

    /// Persist deferred removals so the next watchdog cycle retries them
    fn track_pending(&self, collection: &Collection, user: UserId, outcome: &CandidateOutcome) {
        let result = match outcome {
            CandidateOutcome::Deferred(_) => self.ctx.ledger.defer_revocation(&collection.id, user),
            _ => self.ctx.ledger.clear_revocation(&collection.id, user),
        };
        if let Err(e) = result {
            warn!("Failed to track pending removal of {} from {}: {}", user, collection.name, e);
        }
    }

    async fn revoke(&self, collection: &Collection, user: UserId) -> CandidateOutcome {
        if let Err(e) = self.ctx.messenger.ban(collection.chat_id, user).await {
            warn!("Failed to remove user {} from {}: {}", user, collection.name, e);
            return CandidateOutcome::Deferred(e.to_string());
        }

        info!("Removed user {} from {}", user, collection.name);
        self.ctx
            .notify(user, &messages::removed_from_group(&collection.name), ParseMode::Plain)
            .await;
        CandidateOutcome::Revoked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, mint, wallet, Call, ALPHA_CHAT, ALPHA_LINK, BETA_CHAT};

    const U1: UserId = 1001;
    const U2: UserId = 1002;

    #[tokio::test]
    async fn test_first_verification_revokes_nobody() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler
            .transfer_ownership(&mint(1), &wallet(1).to_string(), U1)
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert!(h.messenger.bans().is_empty());
        assert_eq!(h.ctx.ledger.get(&mint(1)).unwrap().unwrap().user, U1);
    }

    #[tokio::test]
    async fn test_superseded_owner_with_one_asset_is_revoked() {
        let h = harness();
        h.ctx.ledger.set(&mint(1), &wallet(1).to_string(), U1).unwrap();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler
            .transfer_ownership(&mint(1), &wallet(2).to_string(), U2)
            .await
            .unwrap();

        assert_eq!(report.outcomes.get(&U1), Some(&CandidateOutcome::Revoked));
        assert_eq!(h.messenger.bans(), vec![(ALPHA_CHAT, U1)]);
        assert_eq!(h.messenger.messages_to(U1).len(), 1);
        assert!(h.messenger.messages_to(U1)[0].contains("Alpha"));
    }

    #[tokio::test]
    async fn test_writer_overtaken_before_read_back_is_revoked() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);
        let alpha = h.ctx.directory.collection("alpha").unwrap();

        let previous = h.ctx.ledger.replace(&mint(1), &wallet(1).to_string(), U1).unwrap();
        // Another session claims the mint before U1 reads its write back
        h.ctx.ledger.set(&mint(1), &wallet(2).to_string(), U2).unwrap();
        let report = reconciler.settle_transfer(alpha, &mint(1), U1, previous).await.unwrap();

        assert_eq!(report.outcomes.get(&U1), Some(&CandidateOutcome::Revoked));
        assert_eq!(h.messenger.bans(), vec![(ALPHA_CHAT, U1)]);
        assert_eq!(h.ctx.ledger.get(&mint(1)).unwrap().unwrap().user, U2);
    }

    #[tokio::test]
    async fn test_superseded_owner_with_second_asset_is_retained() {
        let h = harness();
        h.ctx.ledger.set(&mint(1), &wallet(1).to_string(), U1).unwrap();
        h.ctx.ledger.set(&mint(2), &wallet(1).to_string(), U1).unwrap();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler
            .transfer_ownership(&mint(1), &wallet(2).to_string(), U2)
            .await
            .unwrap();

        assert_eq!(report.outcomes.get(&U1), Some(&CandidateOutcome::Retained));
        assert!(h.messenger.bans().is_empty());
    }

    #[tokio::test]
    async fn test_asset_in_other_collection_does_not_retain() {
        let h = harness();
        h.ctx.ledger.set(&mint(1), &wallet(1).to_string(), U1).unwrap();
        h.ctx.ledger.set(&mint(4), &wallet(1).to_string(), U1).unwrap();
        let reconciler = AccessReconciler::new(&h.ctx);

        reconciler
            .transfer_ownership(&mint(1), &wallet(2).to_string(), U2)
            .await
            .unwrap();

        assert_eq!(h.messenger.bans(), vec![(ALPHA_CHAT, U1)]);
    }

    #[tokio::test]
    async fn test_reverifying_same_user_is_a_noop() {
        let h = harness();
        h.ctx.ledger.set(&mint(1), &wallet(1).to_string(), U1).unwrap();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler
            .transfer_ownership(&mint(1), &wallet(3).to_string(), U1)
            .await
            .unwrap();

        assert!(report.outcomes.is_empty());
        assert!(h.messenger.calls().is_empty());
        assert_eq!(h.ctx.ledger.get(&mint(1)).unwrap().unwrap().wallet, wallet(3).to_string());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent_on_state() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);

        let first = reconciler.reconcile_candidates("alpha", [U1]).await.unwrap();
        let second = reconciler.reconcile_candidates("alpha", [U1]).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.revoked(), 1);
        // Each pass bans once; the platform treats the repeat as a no-op
        assert_eq!(h.messenger.count(&Call::Ban { chat: ALPHA_CHAT, user: U1 }), 2);
    }

    #[tokio::test]
    async fn test_duplicate_candidates_are_banned_once() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler
            .reconcile_candidates("beta", [U1, U1, U1])
            .await
            .unwrap();

        assert_eq!(report.revoked(), 1);
        assert_eq!(h.messenger.bans(), vec![(BETA_CHAT, U1)]);
        assert_eq!(h.messenger.messages_to(U1).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_ban_is_deferred_and_not_notified() {
        let h = harness();
        h.messenger.fail_bans_for(U1);
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler.reconcile_candidates("alpha", [U1, U2]).await.unwrap();

        assert!(matches!(report.outcomes.get(&U1), Some(CandidateOutcome::Deferred(_))));
        assert_eq!(report.outcomes.get(&U2), Some(&CandidateOutcome::Revoked));
        assert!(h.messenger.messages_to(U1).is_empty());
        assert_eq!(report.deferred(), 1);
        assert_eq!(h.ctx.ledger.pending_revocations().unwrap(), vec![("alpha".to_string(), U1)]);
    }

    #[tokio::test]
    async fn test_successful_retry_clears_pending_removal() {
        let h = harness();
        h.ctx.ledger.defer_revocation("alpha", U1).unwrap();
        let reconciler = AccessReconciler::new(&h.ctx);

        let report = reconciler.reconcile_candidates("alpha", [U1]).await.unwrap();

        assert_eq!(report.revoked(), 1);
        assert!(h.ctx.ledger.pending_revocations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_collection_is_an_error() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);
        assert!(reconciler.reconcile_candidates("gamma", [U1]).await.is_err());
        assert!(reconciler
            .transfer_ownership(&mint(9), &wallet(1).to_string(), U1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_invite_link_prefers_config_then_cache() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);
        let alpha = h.ctx.directory.collection("alpha").unwrap();
        let beta = h.ctx.directory.collection("beta").unwrap();

        assert_eq!(reconciler.invite_link(alpha).await.unwrap(), ALPHA_LINK);

        let created = reconciler.invite_link(beta).await.unwrap();
        let cached = reconciler.invite_link(beta).await.unwrap();
        assert_eq!(created, cached);
        assert_eq!(h.messenger.count(&Call::CreateInvite { chat: BETA_CHAT }), 1);
    }

    #[tokio::test]
    async fn test_restore_access_unbans_then_invites() {
        let h = harness();
        let reconciler = AccessReconciler::new(&h.ctx);
        let alpha = h.ctx.directory.collection("alpha").unwrap();

        reconciler.restore_access(alpha, U1).await.unwrap();

        let calls = h.messenger.calls();
        assert_eq!(calls[0], Call::Unban { chat: ALPHA_CHAT, user: U1 });
        assert_eq!(
            calls[1],
            Call::Message {
                user: U1,
                text: messages::invite("Alpha", ALPHA_LINK),
            }
        );
    }
}

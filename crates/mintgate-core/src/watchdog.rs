//! ============================================================================
//! Watchdog - Periodic re-validation of recorded ownership
//! ============================================================================
//! Every cycle compares each ledger record with the NFT's current on-chain
//! holder. Records whose NFT left the verified wallet are dropped and their
//! users re-checked, once per collection, by the access reconciler.
//! ============================================================================

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::access::AccessReconciler;
use crate::context::GateContext;
use crate::shutdown::ShutdownSignal;
use crate::types::UserId;

/// Counters for one watchdog cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Records compared with the chain
    pub checked: usize,
    /// Records deleted because the NFT moved
    pub drifted: usize,
    /// Records left alone for this cycle (lookup error, unknown mint)
    pub skipped: usize,
    pub revoked: usize,
    pub deferred: usize,
}

pub struct Watchdog {
    ctx: GateContext,
    shutdown: ShutdownSignal,
}

impl Watchdog {
    pub fn new(ctx: GateContext, shutdown: ShutdownSignal) -> Self {
        Self { ctx, shutdown }
    }

    /// Run cycles until shutdown. The first cycle starts immediately.
    pub async fn run(mut self) {
        info!(
            "Watchdog started (every {}s)",
            self.ctx.settings.watchdog_interval_secs
        );

        loop {
            let pause = match self.run_cycle().await {
                Ok(report) => {
                    info!(
                        "Watchdog cycle done: checked={} drifted={} skipped={} revoked={} deferred={}",
                        report.checked, report.drifted, report.skipped, report.revoked, report.deferred
                    );
                    self.ctx.settings.watchdog_interval()
                }
                Err(e) => {
                    warn!("Watchdog could not read the ledger: {}", e);
                    self.ctx.settings.watchdog_retry()
                }
            };

            if !self.pause(pause).await {
                break;
            }
        }

        info!("Watchdog stopped");
    }

    /// One full pass over the ledger. Fails only if the ledger can't be listed.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let records = self.ctx.ledger.list_all()?;
        let mut report = CycleReport::default();
        let mut candidates: BTreeMap<String, BTreeSet<UserId>> = BTreeMap::new();

        for (mint, record) in records {
            if self.shutdown.is_triggered() {
                debug!("Watchdog cycle interrupted by shutdown");
                break;
            }

            let Some(collection) = self.ctx.directory.collection_of(&mint) else {
                warn!("Recorded mint {} is not in any collection, skipping", mint);
                report.skipped += 1;
                continue;
            };

            let owner = match self.ctx.chain.current_owner(&mint).await {
                Ok(owner) => owner,
                Err(e) => {
                    warn!("Owner lookup for {} failed, retrying next cycle: {}", mint, e);
                    report.skipped += 1;
                    continue;
                }
            };
            report.checked += 1;

            if owner.map(|o| o.to_string()).as_deref() == Some(record.wallet.as_str()) {
                continue;
            }

            info!(
                "Mint {} left wallet {} (user {}), now held by {:?}",
                mint, record.wallet, record.user, owner
            );
            // A session may have re-attributed the mint while we were asking the chain
            match self.ctx.ledger.delete_if(&mint, &record) {
                Ok(true) => {}
                Ok(false) => {
                    info!("Record for {} changed during the cycle, leaving it", mint);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to drop record for {}: {}", mint, e);
                    report.skipped += 1;
                    continue;
                }
            }
            report.drifted += 1;
            candidates
                .entry(collection.id.clone())
                .or_default()
                .insert(record.user);
        }

        match self.ctx.ledger.pending_revocations() {
            Ok(pending) => {
                for (collection_id, user) in pending {
                    if self.ctx.directory.collection(&collection_id).is_none() {
                        warn!("Dropping deferred removal of {} from unknown collection {}", user, collection_id);
                        if let Err(e) = self.ctx.ledger.clear_revocation(&collection_id, user) {
                            warn!("Failed to clear deferred removal: {}", e);
                        }
                        continue;
                    }
                    debug!("Retrying deferred removal of {} from {}", user, collection_id);
                    candidates.entry(collection_id).or_default().insert(user);
                }
            }
            Err(e) => warn!("Could not read deferred removals: {}", e),
        }

        let reconciler = AccessReconciler::new(&self.ctx);
        for (collection_id, users) in candidates {
            match reconciler.reconcile_candidates(&collection_id, users).await {
                Ok(outcome) => {
                    report.revoked += outcome.revoked();
                    report.deferred += outcome.deferred();
                }
                Err(e) => warn!("Reconciliation of {} failed: {}", collection_id, e),
            }
        }

        Ok(report)
    }

    /// Sleep unless shutdown comes first. Returns false on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownController;
    use crate::testing::{harness, mint, wallet, Harness, ALPHA_CHAT, BETA_CHAT};

    const U1: UserId = 1001;
    const U2: UserId = 1002;

    fn record(h: &Harness, n: u8, w: u8, user: UserId) {
        h.ctx.ledger.set(&mint(n), &wallet(w).to_string(), user).unwrap();
    }

    fn watchdog(h: &Harness) -> Watchdog {
        Watchdog::new(h.ctx.clone(), ShutdownSignal::never())
    }

    #[tokio::test]
    async fn test_unchanged_ownership_is_left_alone() {
        let h = harness();
        record(&h, 1, 1, U1);
        h.chain.set_owner(&mint(1), Some(wallet(1)));

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.checked, 1);
        assert_eq!(report.drifted, 0);
        assert!(h.ctx.ledger.get(&mint(1)).unwrap().is_some());
        assert!(h.messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_two_drifted_assets_one_ban_one_notice() {
        let h = harness();
        record(&h, 1, 1, U1);
        record(&h, 2, 1, U1);
        h.chain.set_owner(&mint(1), Some(wallet(7)));
        h.chain.set_owner(&mint(2), None);

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.drifted, 2);
        assert_eq!(report.revoked, 1);
        assert_eq!(h.messenger.bans(), vec![(ALPHA_CHAT, U1)]);
        assert_eq!(h.messenger.messages_to(U1).len(), 1);
        assert!(h.ctx.ledger.list_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_drift_keeps_access() {
        let h = harness();
        record(&h, 1, 1, U1);
        record(&h, 2, 1, U1);
        h.chain.set_owner(&mint(1), Some(wallet(7)));
        h.chain.set_owner(&mint(2), Some(wallet(1)));

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.drifted, 1);
        assert_eq!(report.revoked, 0);
        assert!(h.messenger.bans().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_error_skips_asset_only() {
        let h = harness();
        record(&h, 1, 1, U1);
        record(&h, 4, 2, U2);
        h.chain.fail_owner_lookup(&mint(1));
        h.chain.set_owner(&mint(4), Some(wallet(7)));

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.drifted, 1);
        assert!(h.ctx.ledger.get(&mint(1)).unwrap().is_some());
        assert_eq!(h.messenger.bans(), vec![(BETA_CHAT, U2)]);
    }

    #[tokio::test]
    async fn test_unknown_mint_is_skipped() {
        let h = harness();
        h.ctx.ledger.set(&mint(42), &wallet(1).to_string(), U1).unwrap();

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.skipped, 1);
        assert!(h.ctx.ledger.get(&mint(42)).unwrap().is_some());
        assert!(h.messenger.calls().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_ban_is_reported() {
        let h = harness();
        record(&h, 1, 1, U1);
        h.chain.set_owner(&mint(1), None);
        h.messenger.fail_bans_for(U1);

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.deferred, 1);
        assert_eq!(report.revoked, 0);
    }

    #[tokio::test]
    async fn test_record_rewritten_during_lookup_survives() {
        let h = harness();
        record(&h, 1, 1, U1);
        let ledger = h.ctx.ledger.clone();
        let new_owner = wallet(2);
        h.chain.on_owner_lookup(move |m| {
            ledger.set(m, &new_owner.to_string(), U2).unwrap();
        });
        h.chain.set_owner(&mint(1), Some(new_owner));

        let report = watchdog(&h).run_cycle().await.unwrap();

        assert_eq!(report.drifted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.ctx.ledger.get(&mint(1)).unwrap().unwrap().user, U2);
        assert!(h.messenger.bans().is_empty());
    }

    #[tokio::test]
    async fn test_deferred_ban_is_retried_next_cycle() {
        let h = harness();
        record(&h, 1, 1, U1);
        h.chain.set_owner(&mint(1), None);
        h.messenger.fail_bans_for(U1);
        let watchdog = watchdog(&h);

        assert_eq!(watchdog.run_cycle().await.unwrap().deferred, 1);
        assert!(h.ctx.ledger.get(&mint(1)).unwrap().is_none());

        h.messenger.allow_bans_for(U1);
        let report = watchdog.run_cycle().await.unwrap();

        assert_eq!(report.revoked, 1);
        assert_eq!(h.messenger.bans(), vec![(ALPHA_CHAT, U1)]);
        assert!(h.ctx.ledger.pending_revocations().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let controller = ShutdownController::new();
        let task = tokio::spawn(Watchdog::new(h.ctx.clone(), controller.subscribe()).run());

        tokio::time::sleep(Duration::from_secs(60)).await;
        controller.shutdown();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}

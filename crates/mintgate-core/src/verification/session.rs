//! ============================================================================
//! Verification Session - Wallet address in, recorded ownership out
//! ============================================================================
//! AwaitingWallet -> AssetsDiscovered -> ChallengeIssued -> Confirmed | TimedOut | Failed
//!
//! The ledger is only written after the self-transfer is observed, so a
//! session that times out, fails or is interrupted leaves no trace.
//! ============================================================================

use solana_sdk::pubkey::Pubkey;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::time::timeout_at;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::challenge::{challenge_amount, format_sol, ChallengeWindow, WindowTick};
use crate::access::AccessReconciler;
use crate::context::GateContext;
use crate::shutdown::ShutdownSignal;
use crate::types::{messages, ParseMode, SessionFailure, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingWallet,
    AssetsDiscovered,
    ChallengeIssued,
    Confirmed,
    TimedOut,
    Failed,
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// `/start` answered with the greeting
    Greeted,
    InvalidWallet,
    NoQualifyingAssets,
    TimedOut,
    Failed(SessionFailure),
    /// Ownership recorded for `assets` mints across `collections`
    Verified { collections: Vec<String>, assets: usize },
}

enum Resolution {
    Confirmed,
    TimedOut,
    Failed(SessionFailure),
}

/// One verification attempt for one direct message
pub struct VerificationSession<'a> {
    ctx: &'a GateContext,
    shutdown: ShutdownSignal,
    id: Uuid,
    user: UserId,
    state: SessionState,
}

impl<'a> VerificationSession<'a> {
    pub fn new(ctx: &'a GateContext, user: UserId, shutdown: ShutdownSignal) -> Self {
        Self {
            ctx,
            shutdown,
            id: Uuid::new_v4(),
            user,
            state: SessionState::AwaitingWallet,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to a terminal state for the given message text
    pub async fn run(&mut self, text: &str) -> SessionOutcome {
        let span = info_span!("verify", session = %self.id, user = self.user);
        self.drive(text.trim()).instrument(span).await
    }

    async fn drive(&mut self, input: &str) -> SessionOutcome {
        if is_start_command(input) {
            self.say(messages::GREETING, ParseMode::Plain).await;
            return SessionOutcome::Greeted;
        }

        let Ok(wallet) = Pubkey::from_str(input) else {
            debug!("Rejected wallet input {:?}", input);
            self.say(messages::INVALID_WALLET, ParseMode::Plain).await;
            return SessionOutcome::InvalidWallet;
        };

        let discovered = self.discover(&wallet).await;
        if discovered.is_empty() {
            info!("Wallet {} holds no qualifying assets", wallet);
            self.say(messages::NO_QUALIFYING_ASSETS, ParseMode::Plain).await;
            self.advance(SessionState::Failed);
            return SessionOutcome::NoQualifyingAssets;
        }
        self.advance(SessionState::AssetsDiscovered);

        let amount = challenge_amount(&self.ctx.settings);
        let since = chrono::Utc::now().timestamp();
        let instructions = self.challenge_text(&discovered, &wallet, amount);
        if let Err(e) = self
            .ctx
            .messenger
            .send_message(self.user, &instructions, ParseMode::Markdown)
            .await
        {
            warn!("Could not deliver challenge: {}", e);
            self.advance(SessionState::Failed);
            return SessionOutcome::Failed(SessionFailure::Delivery(e.to_string()));
        }
        self.advance(SessionState::ChallengeIssued);
        info!("Challenge issued: {} lamports from {}", amount, wallet);

        match self.observe(&wallet, amount, since).await {
            Resolution::Confirmed => self.advance(SessionState::Confirmed),
            Resolution::TimedOut => {
                self.advance(SessionState::TimedOut);
                self.say(messages::TIMED_OUT, ParseMode::Plain).await;
                return SessionOutcome::TimedOut;
            }
            Resolution::Failed(failure) => {
                warn!("Challenge observation failed: {}", failure);
                self.advance(SessionState::Failed);
                self.say(messages::GENERIC_ERROR, ParseMode::Plain).await;
                return SessionOutcome::Failed(failure);
            }
        }

        self.say(messages::SUCCESS, ParseMode::Plain).await;
        self.record(&discovered, &wallet).await
    }

    /// Qualifying mints held by the wallet, per collection id. A collection
    /// whose lookup fails counts as empty.
    async fn discover(&self, wallet: &Pubkey) -> BTreeMap<String, Vec<String>> {
        let mut discovered = BTreeMap::new();

        for collection in self.ctx.directory.collections() {
            match self.ctx.chain.owned_assets(wallet, &collection.mints).await {
                Ok(owned) if !owned.is_empty() => {
                    debug!("{} holds {} {} assets", wallet, owned.len(), collection.name);
                    discovered.insert(collection.id.clone(), owned);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Asset lookup for {} failed: {}", collection.name, e);
                    self.say(messages::GENERIC_ERROR, ParseMode::Plain).await;
                }
            }
        }

        discovered
    }

    async fn observe(&self, wallet: &Pubkey, amount: u64, since: i64) -> Resolution {
        let settings = &self.ctx.settings;
        let mut window = ChallengeWindow::new(
            settings.challenge_window(),
            settings.poll_interval(),
            self.shutdown.clone(),
        );
        let mut failures = 0u32;

        loop {
            if window.is_cancelled() {
                return Resolution::Failed(SessionFailure::Cancelled);
            }
            if window.is_expired() {
                return Resolution::TimedOut;
            }

            let lookup = self.ctx.chain.find_self_transfer(wallet, amount, since);
            match timeout_at(window.deadline(), lookup).await {
                Err(_) => return Resolution::TimedOut,
                Ok(Ok(true)) => return Resolution::Confirmed,
                Ok(Ok(false)) => failures = 0,
                Ok(Err(e)) => {
                    failures += 1;
                    warn!("Transfer lookup failed ({}/{}): {}", failures, settings.max_poll_failures, e);
                    if failures >= settings.max_poll_failures {
                        return Resolution::Failed(SessionFailure::PollFailed(e.to_string()));
                    }
                }
            }

            match window.wait_next().await {
                WindowTick::Poll => {}
                WindowTick::Expired => return Resolution::TimedOut,
                WindowTick::Cancelled => return Resolution::Failed(SessionFailure::Cancelled),
            }
        }
    }

    /// Attribute every discovered mint to this user, then restore access
    async fn record(&self, discovered: &BTreeMap<String, Vec<String>>, wallet: &Pubkey) -> SessionOutcome {
        let reconciler = AccessReconciler::new(self.ctx);
        let wallet = wallet.to_string();
        let mut assets = 0;

        for mint in discovered.values().flatten() {
            if let Err(e) = reconciler.transfer_ownership(mint, &wallet, self.user).await {
                error!("Failed to record {} for user {}: {}", mint, self.user, e);
                self.say(messages::GENERIC_ERROR, ParseMode::Plain).await;
                return SessionOutcome::Failed(SessionFailure::Transfer {
                    asset: mint.clone(),
                    reason: e.to_string(),
                });
            }
            assets += 1;
        }

        for collection_id in discovered.keys() {
            let Some(collection) = self.ctx.directory.collection(collection_id) else {
                continue;
            };
            // Another session may have claimed these mints since we wrote them
            match reconciler.holds_any(collection, self.user) {
                Ok(true) => {}
                Ok(false) => {
                    warn!("User {} no longer holds a {} asset, not restoring access", self.user, collection.name);
                    continue;
                }
                Err(e) => {
                    warn!("Could not confirm {} ownership before restoring access: {}", collection.name, e);
                    continue;
                }
            }
            if let Err(e) = reconciler.restore_access(collection, self.user).await {
                warn!("Failed to restore access to {}: {}", collection.name, e);
            }
        }

        info!("Verified {} assets for user {}", assets, self.user);
        SessionOutcome::Verified {
            collections: discovered.keys().cloned().collect(),
            assets,
        }
    }

    fn challenge_text(&self, discovered: &BTreeMap<String, Vec<String>>, wallet: &Pubkey, amount: u64) -> String {
        let mut text = String::new();
        for (collection_id, mints) in discovered {
            let name = self
                .ctx
                .directory
                .collection(collection_id)
                .map(|c| c.name.as_str())
                .unwrap_or(collection_id.as_str());
            text.push_str(&format!("{} NFTs in your wallet: *{}*\n", name, mints.len()));
        }

        let minutes = self.ctx.settings.challenge_window_secs / 60;
        text.push_str(&format!(
            "\nNext step: wallet ownership verification\n\n\
             Please send `{}` *SOL* from `{}` to `{}` (the same wallet) so we can identify you as the owner of the wallet.\n\n\
             If this transfer is not made within {} minutes, verification will fail.",
            format_sol(amount),
            wallet,
            wallet,
            minutes
        ));
        text
    }

    async fn say(&self, text: &str, mode: ParseMode) {
        self.ctx.notify(self.user, text, mode).await;
    }

    fn advance(&mut self, next: SessionState) {
        debug!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// `/start`, `/start <payload>` or `/start@<bot>`
fn is_start_command(input: &str) -> bool {
    let command = input.split_whitespace().next().unwrap_or_default();
    match command.strip_prefix("/start") {
        Some(rest) => rest.is_empty() || rest.starts_with('@'),
        None => false,
    }
}

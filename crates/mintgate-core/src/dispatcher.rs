//! ============================================================================
//! Update Dispatcher - Single entry point for inbound events
//! ============================================================================
//! Long-polls the chat platform and handles one event at a time:
//! - join request  -> approve if the user holds a recorded NFT of that group
//! - direct message -> verification session
//!
//! The cursor is persisted after every event, whatever its outcome, so a
//! poisoned event is never replayed forever. Lost effects are repaired by the
//! watchdog.
//! ============================================================================

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::context::GateContext;
use crate::messaging::UpdateSource;
use crate::shutdown::ShutdownSignal;
use crate::types::{messages, ChatId, EventKind, InboundEvent, ParseMode, UserId};
use crate::verification::{SessionOutcome, VerificationSession};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    Approved,
    Declined,
    /// Ledger or platform error; the request is left pending
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Join(JoinDecision),
    Session(SessionOutcome),
    Ignored,
}

pub struct UpdateDispatcher {
    ctx: GateContext,
    source: Arc<dyn UpdateSource>,
    shutdown: ShutdownSignal,
}

impl UpdateDispatcher {
    pub fn new(ctx: GateContext, source: Arc<dyn UpdateSource>, shutdown: ShutdownSignal) -> Self {
        Self {
            ctx,
            source,
            shutdown,
        }
    }

    /// Poll and dispatch until shutdown. Only an unreadable cursor at
    /// startup is an error.
    pub async fn run(mut self) -> Result<()> {
        let mut offset = match self.ctx.ledger.cursor()? {
            Some(last) => last + 1,
            None => 0,
        };
        info!("Dispatcher started at offset {}", offset);

        let timeout = self.ctx.settings.long_poll_timeout_secs;
        let mut failures = 0u32;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                batch = self.source.next_batch(offset, timeout) => batch,
            };

            let events = match fetched {
                Ok(events) => {
                    failures = 0;
                    events
                }
                Err(e) => {
                    let delay = self.ctx.settings.fetch_backoff(failures);
                    failures = failures.saturating_add(1);
                    warn!("Failed to fetch updates (attempt {}), retrying in {:?}: {}", failures, delay, e);
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            for event in events {
                if event.id < offset {
                    debug!("Skipping already processed event {}", event.id);
                    continue;
                }

                let outcome = self.dispatch(&event).await;
                debug!("Event {} -> {:?}", event.id, outcome);
                self.commit(event.id);
                offset = event.id + 1;

                if self.shutdown.is_triggered() {
                    break;
                }
            }
        }

        info!("Dispatcher stopped at offset {}", offset);
        Ok(())
    }

    /// Handle one event end to end
    pub async fn dispatch(&self, event: &InboundEvent) -> DispatchOutcome {
        match &event.kind {
            EventKind::JoinRequest { chat_id, user_id } => {
                DispatchOutcome::Join(self.on_join_request(*chat_id, *user_id).await)
            }
            EventKind::DirectMessage { user_id, text } => {
                let mut session = VerificationSession::new(&self.ctx, *user_id, self.shutdown.clone());
                DispatchOutcome::Session(session.run(text).await)
            }
            EventKind::Ignored => DispatchOutcome::Ignored,
        }
    }

    async fn on_join_request(&self, chat: ChatId, user: UserId) -> JoinDecision {
        let records = match self.ctx.ledger.list_all() {
            Ok(records) => records,
            Err(e) => {
                warn!("Ledger unavailable for join request of {} to {}: {}", user, chat, e);
                self.ctx.notify(user, messages::GENERIC_ERROR, ParseMode::Plain).await;
                return JoinDecision::Failed;
            }
        };

        let eligible = records.iter().any(|(mint, record)| {
            record.user == user
                && self
                    .ctx
                    .directory
                    .collection_of(mint)
                    .is_some_and(|c| c.chat_id == chat)
        });

        let (decision, result) = if eligible {
            (JoinDecision::Approved, self.ctx.messenger.approve_join(chat, user).await)
        } else {
            (JoinDecision::Declined, self.ctx.messenger.decline_join(chat, user).await)
        };

        match result {
            Ok(()) => {
                info!("Join request of {} to {}: {:?}", user, chat, decision);
                decision
            }
            Err(e) => {
                warn!("Failed to answer join request of {} to {}: {}", user, chat, e);
                JoinDecision::Failed
            }
        }
    }

    fn commit(&self, event_id: i64) {
        if let Err(e) = self.ctx.ledger.set_cursor(event_id) {
            warn!("Failed to persist cursor {}: {}", event_id, e);
        }
    }

    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

//! ============================================================================
//! Gate Context - Shared handles and tunables
//! ============================================================================
//! One `GateContext` is built at startup and cloned into the dispatcher and
//! the watchdog. Everything inside is either immutable (directory, settings)
//! or internally synchronized (ledger, chain, messenger).
//! ============================================================================

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::chain::ChainQuery;
use crate::directory::AssetDirectory;
use crate::ledger::Ledger;
use crate::messaging::Messenger;
use crate::types::{ParseMode, UserId};

/// Timing and sizing knobs for verification, the watchdog and the update loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSettings {
    /// How long a challenge stays open
    pub challenge_window_secs: u64,
    /// Delay between self-transfer lookups
    pub poll_interval_secs: u64,
    /// Consecutive failed lookups that abort a session
    pub max_poll_failures: u32,
    /// Challenge amount bounds in lamports (inclusive)
    pub min_challenge_lamports: u64,
    pub max_challenge_lamports: u64,
    /// Period of the membership watchdog
    pub watchdog_interval_secs: u64,
    /// Retry delay when the watchdog cannot read the ledger
    pub watchdog_retry_secs: u64,
    /// Long-poll timeout passed to the update source
    pub long_poll_timeout_secs: u64,
    /// Backoff after a failed update fetch
    pub fetch_base_delay_ms: u64,
    pub fetch_max_delay_ms: u64,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            challenge_window_secs: 600,
            poll_interval_secs: 3,
            max_poll_failures: 5,
            min_challenge_lamports: 10_000,
            max_challenge_lamports: 99_999,
            watchdog_interval_secs: 6 * 60 * 60,
            watchdog_retry_secs: 600,
            long_poll_timeout_secs: 30,
            fetch_base_delay_ms: 1_000,
            fetch_max_delay_ms: 60_000,
        }
    }
}

impl GateSettings {
    /// Reject settings that would make a loop spin or a challenge unpayable
    pub fn validate(&self) -> Result<()> {
        if self.min_challenge_lamports == 0 {
            bail!("Challenge amount must be at least 1 lamport");
        }
        if self.min_challenge_lamports > self.max_challenge_lamports {
            bail!(
                "Challenge range is empty: {}..={}",
                self.min_challenge_lamports,
                self.max_challenge_lamports
            );
        }
        if self.challenge_window_secs == 0 || self.poll_interval_secs == 0 {
            bail!("Challenge window and poll interval must be non-zero");
        }
        if self.watchdog_interval_secs == 0 || self.watchdog_retry_secs == 0 {
            bail!("Watchdog intervals must be non-zero");
        }
        if self.max_poll_failures == 0 {
            bail!("max_poll_failures must be at least 1");
        }
        Ok(())
    }

    pub fn challenge_window(&self) -> Duration {
        Duration::from_secs(self.challenge_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn watchdog_retry(&self) -> Duration {
        Duration::from_secs(self.watchdog_retry_secs)
    }

    /// Exponential backoff for the n-th consecutive failed fetch (0-based)
    pub fn fetch_backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.min(63));
        let delay = self.fetch_base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.fetch_max_delay_ms))
    }
}

/// Handles shared by every component of the gate
#[derive(Clone)]
pub struct GateContext {
    pub directory: Arc<AssetDirectory>,
    pub ledger: Arc<Ledger>,
    pub chain: Arc<dyn ChainQuery>,
    pub messenger: Arc<dyn Messenger>,
    pub settings: GateSettings,
}

impl GateContext {
    pub fn new(
        directory: AssetDirectory,
        ledger: Ledger,
        chain: Arc<dyn ChainQuery>,
        messenger: Arc<dyn Messenger>,
        settings: GateSettings,
    ) -> Self {
        Self {
            directory: Arc::new(directory),
            ledger: Arc::new(ledger),
            chain,
            messenger,
            settings,
        }
    }

    /// Best-effort direct message; failures are logged, never propagated
    pub async fn notify(&self, user: UserId, text: &str, mode: ParseMode) -> bool {
        match self.messenger.send_message(user, text, mode).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to message user {}: {}", user, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = GateSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.challenge_window(), Duration::from_secs(600));
        assert_eq!(settings.poll_interval(), Duration::from_secs(3));
        assert_eq!(settings.watchdog_interval(), Duration::from_secs(21_600));
    }

    #[test]
    fn test_validate_rejects_zero_amount() {
        let settings = GateSettings {
            min_challenge_lamports: 0,
            ..GateSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let settings = GateSettings {
            min_challenge_lamports: 50_000,
            max_challenge_lamports: 40_000,
            ..GateSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_fetch_backoff_is_capped() {
        let settings = GateSettings::default();
        assert_eq!(settings.fetch_backoff(0), Duration::from_millis(1_000));
        assert_eq!(settings.fetch_backoff(3), Duration::from_millis(8_000));
        assert_eq!(settings.fetch_backoff(10), Duration::from_millis(60_000));
        assert_eq!(settings.fetch_backoff(200), Duration::from_millis(60_000));
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: GateSettings =
            serde_json::from_str(r#"{ "poll_interval_secs": 5 }"#).unwrap();
        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.challenge_window_secs, 600);
    }
}

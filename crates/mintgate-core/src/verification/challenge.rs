//! Challenge amount and the bounded observation window.

use rand::Rng;
use solana_sdk::native_token::LAMPORTS_PER_SOL;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

use crate::context::GateSettings;
use crate::shutdown::ShutdownSignal;

/// Fresh challenge amount in lamports, never zero
pub fn challenge_amount(settings: &GateSettings) -> u64 {
    let low = settings.min_challenge_lamports.max(1);
    let high = settings.max_challenge_lamports.max(low);
    rand::thread_rng().gen_range(low..=high)
}

/// Lamports rendered as SOL with all 9 decimals
pub fn format_sol(lamports: u64) -> String {
    format!("{}.{:09}", lamports / LAMPORTS_PER_SOL, lamports % LAMPORTS_PER_SOL)
}

/// Result of waiting for the next poll slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTick {
    /// Time for another lookup
    Poll,
    /// Deadline reached
    Expired,
    /// Shutdown requested
    Cancelled,
}

/// Deadline-bound poll schedule
pub struct ChallengeWindow {
    deadline: Instant,
    poll_interval: Duration,
    shutdown: ShutdownSignal,
}

impl ChallengeWindow {
    pub fn new(length: Duration, poll_interval: Duration, shutdown: ShutdownSignal) -> Self {
        Self {
            deadline: Instant::now() + length,
            poll_interval,
            shutdown,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Sleep one poll interval, clipped to the deadline
    pub async fn wait_next(&mut self) -> WindowTick {
        let wake = (Instant::now() + self.poll_interval).min(self.deadline);

        tokio::select! {
            biased;
            _ = self.shutdown.triggered() => return WindowTick::Cancelled,
            _ = sleep_until(wake) => {}
        }

        if self.is_expired() {
            WindowTick::Expired
        } else {
            WindowTick::Poll
        }
    }
}

//! Single-slot retry timer

use std::future::pending;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Cancellable one-shot timer owned by a session
///
/// Arming replaces any previous deadline. Once cancelled or replaced, an old
/// deadline never fires.
#[derive(Debug, Default)]
pub struct RetryTimer {
    deadline: Option<Instant>,
}

impl RetryTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, period: Duration) {
        self.deadline = Some(Instant::now() + period);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves when the armed deadline passes and disarms the timer
    ///
    /// Pending forever while unarmed, so it can sit in a `select!` branch.
    /// Dropping the future before completion leaves the timer armed.
    pub async fn expired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}

//! Debounce timer for coalescing bursts of graph updates.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// A restartable deadline. `poke()` (re)arms it `period` into the future;
/// `fired()` resolves once the deadline passes and disarms it. While
/// unarmed, `fired()` stays pending forever, which makes it safe to poll
/// from a `select!` arm.
#[derive(Debug)]
pub struct Debouncer {
    period: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(period: Duration) -> Self {
        Debouncer { period, deadline: None }
    }

    /// Push the deadline out to `period` from now.
    pub fn poke(&mut self) {
        self.deadline = Some(Instant::now() + self.period);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Resolves when the armed deadline passes; pending forever otherwise.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                self.deadline = None;
            }
            None => std::future::pending().await,
        }
    }
}

//! Bounded, fixed-interval repetition of fire-and-forget announcements.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_shared::constants::{NAME_ANNOUNCE_ATTEMPTS, NAME_ANNOUNCE_INTERVAL_MS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: NAME_ANNOUNCE_ATTEMPTS,
            interval: Duration::from_millis(NAME_ANNOUNCE_INTERVAL_MS),
        }
    }
}

impl RetryPolicy {
    /// Feed `make()` into `tx` `attempts` times, waiting `interval` before
    /// each. Stops early once the receiver is gone.
    pub fn spawn<T, F>(&self, tx: mpsc::UnboundedSender<T>, make: F) -> JoinHandle<()>
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        let policy = *self;
        tokio::spawn(async move {
            for _ in 0..policy.attempts {
                tokio::time::sleep(policy.interval).await;
                if tx.send(make()).is_err() {
                    break;
                }
            }
        })
    }
}

//! Pacing clock shared by every dispatcher in the process.

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::JitterRange;
use crate::{DispatchError, Result};

/// Spaces consecutive sends by a randomized gap.
///
/// A caller reserves the next free slot under the lock and sleeps outside
/// it, so concurrent callers queue up behind each other without holding
/// the mutex while waiting.
#[derive(Debug)]
pub struct Pacer {
    gap: JitterRange,
    last_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(gap: JitterRange) -> Self {
        Self {
            gap,
            last_slot: Mutex::new(None),
        }
    }

    /// Reserves the next send slot and returns when it is due.
    async fn reserve(&self) -> Instant {
        let mut last = self.last_slot.lock().await;
        let now = Instant::now();
        let slot = match *last {
            Some(previous) => (previous + self.gap.sample()).max(now),
            None => now,
        };
        *last = Some(slot);
        slot
    }

    /// Waits until this caller may send.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let slot = self.reserve().await;
        let delay = slot.saturating_duration_since(Instant::now());
        if !delay.is_zero() {
            debug!("Pacing send by {:?}", delay);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            _ = sleep_until(slot) => Ok(()),
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(JitterRange::from_secs(1, 3))
    }
}

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::time;

use crate::error::Error;

/// Fixed-count polling loop shared by every wait in the provisioning
/// pipeline: instance-running, spot-fulfillment, cluster-registration,
/// task-running and termination. No backoff, one sleep per attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            interval,
        }
    }

    /// Polls `op` until it yields a value or the attempt budget runs out.
    ///
    /// `Ok(None)` from `op` means "not ready yet, ask again". An `Err` is
    /// never retried; it propagates to the caller as-is. Exhausting the
    /// budget yields `Ok(None)` so callers can decide whether that is a
    /// hard error or a tagged timeout.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for attempt in 0..self.max_attempts {
            if let Some(found) = op().await? {
                return Ok(Some(found));
            }
            if attempt + 1 < self.max_attempts {
                time::sleep(self.interval).await;
            }
        }
        Ok(None)
    }

    /// Like [`run`](Self::run), but races every attempt and every sleep
    /// against `cancel` and aborts with `Error::Cancelled` once it fires.
    /// A cancel fired before the first attempt wins without calling `op`.
    pub async fn run_until_cancelled<T, F, Fut>(&self, mut op: F, cancel: &Notify) -> Result<Option<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for attempt in 0..self.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.notified() => return Err(Error::Cancelled.into()),
                found = op() => {
                    if let Some(found) = found? {
                        return Ok(Some(found));
                    }
                }
            }
            if attempt + 1 < self.max_attempts {
                tokio::select! {
                    _ = cancel.notified() => return Err(Error::Cancelled.into()),
                    _ = time::sleep(self.interval) => {}
                }
            }
        }
        Ok(None)
    }
}

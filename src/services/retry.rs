// Retry Poller
// Bounded, blocking readiness polling used before declaring a stream started

use std::time::Duration;

use super::error::{StreamError, StreamResult};

/// Retry budget for a single polling operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// Budget for confirming a device directory was emptied
    pub fn directory_clean() -> Self {
        Self::new(5, Duration::from_secs(1))
    }

    /// Budget for confirming a segment stream wrote its first files
    pub fn stream_ready() -> Self {
        Self::new(20, Duration::from_secs(2))
    }
}

/// Evaluate `predicate` until it returns true or the budget runs out.
///
/// Blocks the calling thread. Sleeps `policy.interval` between evaluations
/// but never after the final one.
pub fn poll<F>(policy: RetryPolicy, predicate: F) -> StreamResult<()>
where
    F: FnMut() -> bool,
{
    poll_with_sleep(policy, predicate, std::thread::sleep)
}

fn poll_with_sleep<F, S>(policy: RetryPolicy, mut predicate: F, mut sleep: S) -> StreamResult<()>
where
    F: FnMut() -> bool,
    S: FnMut(Duration),
{
    for attempt in 1..=policy.max_attempts {
        if predicate() {
            if attempt > 1 {
                log::debug!("Condition met after {} attempts", attempt);
            }
            return Ok(());
        }
        if attempt < policy.max_attempts {
            sleep(policy.interval);
        }
    }

    Err(StreamError::RetriesExhausted {
        attempts: policy.max_attempts,
    })
}

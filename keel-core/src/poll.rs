//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }
}

/// Run `check` once per `interval` until it returns `true` or `timeout` has
/// passed since the first check. A failed check counts as "not ready".
pub async fn wait_until<F, Fut>(interval: Duration, timeout: Duration, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match check().await {
            Ok(true) => return PollOutcome::Ready { attempts },
            Ok(false) => debug!("Not ready after {} checks", attempts),
            Err(e) => warn!("Readiness check {} failed: {}", attempts, e),
        }

        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut { attempts };
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_ready_on_third_check() {
        let calls = Cell::new(0);
        let outcome = wait_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls.set(calls.get() + 1);
            let ready = calls.get() >= 3;
            async move { Ok(ready) }
        })
        .await;
        assert_eq!(outcome, PollOutcome::Ready { attempts: 3 });
    }

    #[tokio::test]
    async fn test_times_out() {
        let outcome = wait_until(Duration::from_millis(5), Duration::from_millis(30), || async {
            Ok(false)
        })
        .await;
        match outcome {
            PollOutcome::TimedOut { attempts } => assert!(attempts >= 2),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_errors_count_as_not_ready() {
        let calls = Cell::new(0);
        let outcome = wait_until(Duration::from_millis(1), Duration::from_secs(5), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n == 1 {
                    Err(ProvisionError::external("test", "flaky"))
                } else {
                    Ok(true)
                }
            }
        })
        .await;
        assert!(outcome.is_ready());
        assert_eq!(calls.get(), 2);
    }
}

//! Transient I/O retry helpers.
//!
//! Journal files live on the same volume as the working directory they
//! describe, so sharing violations and momentary permission failures are
//! expected under contention (virus scanners, indexers, concurrent git
//! processes). Retries are logged at sampled intervals so sustained
//! contention does not flood the log stream.

use std::io;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

/// Tuning for transient-failure retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fixed delay between attempts.
    pub delay: Duration,
    /// Log one warning per this many consecutive failures.
    pub log_sample: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            log_sample: 200,
        }
    }
}

/// Retry `op` until it succeeds.
///
/// Used where the process cannot make progress without the operation
/// (compaction replace, append-handle reopen). Failures are logged once per
/// `log_sample` occurrences; recovery after a failure streak is logged once.
pub fn retry_forever<T, F>(policy: RetryPolicy, what: &str, mut op: F) -> T
where
    F: FnMut() -> io::Result<T>,
{
    let mut failures: u64 = 0;
    loop {
        match op() {
            Ok(value) => {
                if failures > 0 {
                    info!(what, failures, "transient I/O failure recovered");
                }
                return value;
            }
            Err(error) => {
                if failures % policy.log_sample.max(1) == 0 {
                    warn!(what, failures, %error, "transient I/O failure, retrying");
                }
                failures += 1;
                thread::sleep(policy.delay);
            }
        }
    }
}

/// Retry `op` up to `attempts` times, returning the last error on exhaustion.
///
/// Used on fail-fast paths (initial open) where the caller can surface the
/// error instead of blocking forever.
pub fn retry_bounded<T, F>(policy: RetryPolicy, attempts: u32, what: &str, mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt < attempts {
                    warn!(what, attempt, %error, "transient I/O failure, retrying");
                    thread::sleep(policy.delay);
                }
                last = Some(error);
            }
        }
    }
    Err(last.unwrap_or_else(|| io::Error::other("retry budget exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_retry_succeeds_after_failures() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(1),
            log_sample: 10,
        };
        let mut remaining_failures = 2;
        let result = retry_bounded(policy, 5, "test", || {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                Err(io::Error::other("still failing"))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_bounded_retry_exhausts() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(1),
            log_sample: 10,
        };
        let result: io::Result<()> = retry_bounded(policy, 3, "test", || {
            Err(io::Error::other("permanent"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_unbounded_retry_eventually_returns() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(1),
            log_sample: 10,
        };
        let mut remaining_failures = 3;
        let value = retry_forever(policy, "test", || {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                Err(io::Error::other("still failing"))
            } else {
                Ok("done")
            }
        });
        assert_eq!(value, "done");
    }
}

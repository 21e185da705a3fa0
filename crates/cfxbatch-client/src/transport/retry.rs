use cfxbatch_core::error::Result;
use cfxbatch_core::log_warn;
use std::time::Duration;

/// Retry policy shared by every fallible transfer operation: a bounded
/// number of attempts with exponential backoff (`base_delay * 2^attempt`).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    /// Run `op` until it succeeds or the attempt budget is exhausted,
    /// sleeping between attempts. The final error is returned unchanged.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut last_err = None;
        for attempt in 0..self.attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log_warn!(
                        "{} failed (attempt {}/{}): {}",
                        what,
                        attempt + 1,
                        self.attempts,
                        e
                    );
                    last_err = Some(e);
                    if attempt + 1 < self.attempts {
                        std::thread::sleep(self.backoff(attempt));
                    }
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfxbatch_core::error::AppError;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_run_stops_after_first_success() {
        let policy = RetryPolicy::new(3, Duration::from_millis(0));
        let mut calls = 0;
        let result: Result<u32> = policy.run("op", || {
            calls += 1;
            if calls < 2 {
                Err(AppError::Transport("flaky".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_run_exhausts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(0));
        let mut calls = 0;
        let result: Result<()> = policy.run("op", || {
            calls += 1;
            Err(AppError::Transport("down".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }
}

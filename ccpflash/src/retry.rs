//! Caller-side retry policy.
//!
//! The handler never retries on its own. `connect` is the one call that is
//! routinely retried, because the device may still be booting when the first
//! request goes out.

use std::thread;
use std::time::Duration;

use log::warn;

use crate::error::{Error, Result};

/// Default number of extra `connect` attempts.
pub const DEFAULT_CONNECT_RETRIES: usize = 5;

/// Default pause after a retried burst.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(100);

/// Run `operation`, re-invoking it up to `times` additional times while it
/// fails with an error accepted by `acceptable`.
pub fn retry<T, A, F>(times: usize, acceptable: A, operation: F) -> Result<T>
where
    A: Fn(&Error) -> bool,
    F: FnMut() -> Result<T>,
{
    retry_with_delay(times, Duration::ZERO, acceptable, operation)
}

fn retry_with_delay<T, A, F>(
    times: usize,
    delay: Duration,
    acceptable: A,
    mut operation: F,
) -> Result<T>
where
    A: Fn(&Error) -> bool,
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < times && acceptable(&e) => {
                attempt += 1;
                warn!("Attempt {attempt}/{times} failed: {e}, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            },
            Err(e) => return Err(e),
        }
    }
}

/// Retry settings for establishing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra `connect` attempts after the first one.
    pub connect_retries: usize,
    /// Pause between attempts.
    pub delay: Duration,
    /// Pause after the burst, letting late replies arrive.
    pub settle: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_retries: DEFAULT_CONNECT_RETRIES,
            delay: Duration::ZERO,
            settle: DEFAULT_SETTLE,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once and does not settle.
    pub fn none() -> Self {
        Self {
            connect_retries: 0,
            delay: Duration::ZERO,
            settle: Duration::ZERO,
        }
    }

    /// Set the number of extra attempts.
    #[must_use]
    pub fn with_connect_retries(mut self, connect_retries: usize) -> Self {
        self.connect_retries = connect_retries;
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the pause after the burst.
    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Run `operation` under this policy, retrying timeouts only.
    pub fn run<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        retry_with_delay(self.connect_retries, self.delay, Error::is_timeout, operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command::{CommandCode, CommandStatus, ErrorCategory};

    fn timeout() -> Error {
        Error::Timeout {
            command: CommandCode::Connect,
            timeout: Duration::from_millis(25),
        }
    }

    #[test]
    fn test_retry_until_success() {
        let mut calls = 0;
        let value = retry(3, Error::is_timeout, || {
            calls += 1;
            if calls < 3 { Err(timeout()) } else { Ok(calls) }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut calls = 0;
        let err = retry(2, Error::is_timeout, || -> Result<()> {
            calls += 1;
            Err(timeout())
        })
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_stops_on_unacceptable_error() {
        let mut calls = 0;
        let err = retry(5, Error::is_timeout, || -> Result<()> {
            calls += 1;
            Err(Error::CommandFailed {
                command: CommandCode::Connect,
                status: CommandStatus::AccessDenied,
                category: ErrorCategory::C3,
            })
        })
        .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.connect_retries, 5);
        assert_eq!(policy.delay, Duration::ZERO);
        assert_eq!(policy.settle, Duration::from_millis(100));

        let mut calls = 0;
        let _ = RetryPolicy::none().run(|| -> Result<()> {
            calls += 1;
            Err(timeout())
        });
        assert_eq!(calls, 1);
    }
}

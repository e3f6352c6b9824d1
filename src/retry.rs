/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bounded retry with exponential backoff.

use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Retry policy. The defaults are 3 attempts starting at 100ms and doubling, uncapped.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
    pub max_delay: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2,
            max_delay: None,
        }
    }
}

/// All attempts failed. Carries every attempt's error in order.
#[derive(Debug, Error)]
#[error("all {} attempts failed", .attempts.len())]
pub struct RetryError<E: std::error::Error> {
    pub attempts: Vec<E>,
}

/// Run `operation` until it succeeds, an attempt fails with an error `retryable` rejects, or
/// `options.max_attempts` attempts have failed. Sleeps between attempts with exponential
/// backoff. A non-retryable error short-circuits immediately but is still reported inside
/// [RetryError] alongside the attempts that preceded it.
pub fn retry_with_backoff<T, E: std::error::Error>(
    options: &RetryOptions,
    mut retryable: impl FnMut(&E) -> bool,
    mut operation: impl FnMut() -> Result<T, E>,
) -> Result<T, RetryError<E>> {
    let mut attempts = Vec::new();
    let mut delay = options.initial_delay;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                let give_up =
                    !retryable(&error) || attempts.len() + 1 >= options.max_attempts as usize;
                attempts.push(error);
                if give_up {
                    return Err(RetryError { attempts });
                }
            }
        }
        thread::sleep(delay);
        delay *= options.backoff_multiplier;
        if let Some(max_delay) = options.max_delay {
            delay = delay.min(max_delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    fn fast() -> RetryOptions {
        RetryOptions {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 2,
            max_delay: None,
        }
    }

    #[test]
    fn succeeds_without_retrying() {
        let mut calls = 0;
        let result = retry_with_backoff(&fast(), |_: &TestError| true, || {
            calls += 1;
            Ok::<_, TestError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_up_to_max_attempts_and_records_every_error() {
        let mut calls = 0;
        let result = retry_with_backoff(&fast(), |_: &TestError| true, || {
            calls += 1;
            Err::<(), _>(TestError::Transient)
        });
        let error = result.unwrap_err();
        assert_eq!(calls, 3);
        assert_eq!(error.attempts.len(), 3);
    }

    #[test]
    fn recovers_on_a_later_attempt() {
        let mut calls = 0;
        let result = retry_with_backoff(&fast(), |_: &TestError| true, || {
            calls += 1;
            if calls < 3 {
                Err(TestError::Transient)
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_retryable_error_short_circuits() {
        let mut calls = 0;
        let result = retry_with_backoff(
            &fast(),
            |e: &TestError| *e == TestError::Transient,
            || {
                calls += 1;
                Err::<(), _>(TestError::Fatal)
            },
        );
        let error = result.unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(error.attempts, vec![TestError::Fatal]);
    }

    #[test]
    fn delay_growth_is_capped() {
        let options = RetryOptions {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            backoff_multiplier: 10,
            max_delay: Some(Duration::from_millis(5)),
        };
        let start = std::time::Instant::now();
        let _ = retry_with_backoff(&options, |_: &TestError| true, || {
            Err::<(), _>(TestError::Transient)
        });
        // 1 + 5 + 5 ms of sleeping, far below the uncapped 1 + 10 + 100.
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}

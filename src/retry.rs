//! Support utilities for [`keen_retry`]'s retry API, plus our backoff policy.
//!
//! Every remote call made by a pipeline unit returns an [`AttemptResult`],
//! which says whether the failure is worth retrying. The executor owns the
//! actual retry loop and the sleeps between attempts.

use std::{error, fmt, time::Duration};

use async_openai::error::OpenAIError;
use keen_retry::RetryResult;
use reqwest::StatusCode;
use tokio::time;

use crate::prelude::*;

/// The result of a single attempt at a unit of work.
pub type AttemptResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// Upper bound on any single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(15 * 60);

/// Macro which implements `?`-like behavior for [`RetryResult`].
macro_rules! try_retry_result {
    ($result:expr) => {
        match $result {
            ::keen_retry::RetryResult::Ok { output, .. } => output,
            ::keen_retry::RetryResult::Transient { input, error } => {
                return ::keen_retry::RetryResult::Transient {
                    input,
                    error: From::from(error),
                };
            }
            ::keen_retry::RetryResult::Fatal { input, error } => {
                return ::keen_retry::RetryResult::Fatal {
                    input,
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return a [`RetryResult::Transient`] value.
macro_rules! try_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error)
                if $crate::retry::IsKnownTransient::is_known_transient(&error) =>
            {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient, try_retry_result, try_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Transient`] value.
pub(crate) fn retry_result_transient<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Transient { input: (), error }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// How many times to try a unit, and how long to wait between tries.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total number of attempts per unit, including the first.
    pub max_retries: u32,

    /// Base of the exponential backoff. The wait after failed attempt `k` is
    /// `backoff_base ^ k` units.
    pub backoff_base: f64,

    /// The unit of backoff. One second in production.
    pub backoff_unit: Duration,
}

impl RetryPolicy {
    /// Create a policy measured in seconds.
    pub fn new(max_retries: u32, backoff_base: f64) -> Self {
        Self {
            max_retries: max_retries.max(1),
            backoff_base,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// How long to sleep after failed attempt number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_unit.as_secs_f64() * self.backoff_base.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

/// Is this error a known transient error?
///
/// Remote archives and model gateways fail in many uninteresting ways, so
/// anything that might plausibly succeed on a second try is transient. Errors
/// that describe a malformed request are not.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else if self.is_builder() {
            false
        } else {
            // Connection resets, DNS hiccups, body decoding failures, and
            // timeouts all land here.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        // Paywalled archives answer an expired or throttled session with all
        // sorts of statuses, so we retry anything that isn't a success.
        !self.is_success()
    }
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::InvalidArgument(_) => false,
            _ => true,
        }
    }
}

/// An error from a remote call that may have timed out.
#[derive(Debug)]
pub enum CallError<E> {
    /// The underlying client failed.
    Native(E),

    /// We gave up waiting.
    Timeout(Duration),
}

impl<E> IsKnownTransient for CallError<E>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            CallError::Native(err) => err.is_known_transient(),
            CallError::Timeout(_) => true,
        }
    }
}

impl<E> fmt::Display for CallError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Native(err) => write!(f, "{err}"),
            CallError::Timeout(timeout) => {
                write!(f, "request timed out after {}s", timeout.as_secs_f64())
            }
        }
    }
}

impl<E> error::Error for CallError<E>
where
    E: error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            CallError::Native(err) => Some(err),
            CallError::Timeout(_) => None,
        }
    }
}

/// Run `future` with an optional timeout, folding the timeout into
/// [`CallError`].
pub async fn with_timeout<T, E>(
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, CallError<E>> {
    match timeout {
        Some(timeout) => match time::timeout(timeout, future).await {
            Ok(result) => result.map_err(CallError::Native),
            Err(_elapsed) => Err(CallError::Timeout(timeout)),
        },
        None => future.await.map_err(CallError::Native),
    }
}

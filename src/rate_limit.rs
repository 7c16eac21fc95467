//! Request-rate ceilings for remote calls, written as `N/s` or `N/m`.
//!
//! The concurrency cap bounds how many calls are in flight. A rate limit
//! additionally bounds how many start per period, which is what archive
//! sessions and model gateways actually police.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which a [`RateLimit`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPeriod {
    Second,
    Minute,
}

impl RateLimitPeriod {
    fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            _ => Err(anyhow!("unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A maximum number of requests per period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    pub max_requests: usize,
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// The time between two consecutive request permits.
    pub fn permit_interval(&self) -> Duration {
        let max_requests = u32::try_from(self.max_requests.max(1)).unwrap_or(u32::MAX);
        (self.per_period.to_duration() / max_requests).max(Duration::from_millis(1))
    }

    /// Build a shared [`RateLimiter`].
    ///
    /// Permits trickle in one at a time rather than refilling the whole
    /// bucket once per period, so restarting the process right after a run
    /// does not immediately burst a full period's worth of requests.
    pub fn to_rate_limiter(&self) -> Arc<RateLimiter> {
        let max_requests = self.max_requests.max(1);
        Arc::new(
            RateLimiter::builder()
                .initial(1)
                .refill(1)
                .max(max_requests)
                .interval(self.permit_interval())
                .build(),
        )
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected N/s or N/m"))?;
            let max_requests = max_requests.trim().parse::<usize>()?;
            if max_requests == 0 {
                return Err(anyhow!("rate limit must allow at least one request"));
            }
            Ok(Self {
                max_requests,
                per_period: per_period.trim().parse()?,
            })
        };
        parse(s).with_context(|| format!("failed to parse rate limit: {:?}", s))
    }
}

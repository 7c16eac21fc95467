//! Command-line entry points.
//!
//! Each stage subcommand runs once per selected volume. A run-level failure
//! for one volume is reported and the next volume still runs; the command
//! fails at the end if any volume did.

use std::future::Future;

use clap::Args;

use crate::{
    config::Volume,
    prelude::*,
    rate_limit::RateLimit,
    ui::Ui,
};

pub mod acquire;
pub mod discover;
pub mod evaluate;
pub mod ocr;
pub mod volumes;

/// Which volumes a stage subcommand applies to.
#[derive(Debug, Clone, Args)]
pub struct VolumeOpts {
    /// Process only this volume. Defaults to every configured volume.
    #[clap(long)]
    pub volume: Option<String>,
}

/// Options for stages that make remote calls.
#[derive(Debug, Clone, Args)]
pub struct RateLimitOpts {
    /// Cap the request rate, for example `30/m` or `2/s`.
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,
}

impl RateLimitOpts {
    pub fn rate_limiter(&self) -> Option<std::sync::Arc<leaky_bucket::RateLimiter>> {
        self.rate_limit.as_ref().map(RateLimit::to_rate_limiter)
    }
}

/// Run `stage` for every volume, continuing past run-level failures.
pub async fn for_each_volume<'a, F, Fut>(
    ui: &Ui,
    volumes: Vec<&'a Volume>,
    mut stage: F,
) -> Result<()>
where
    F: FnMut(&'a Volume) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut failed = vec![];
    for volume in volumes {
        if let Err(err) = stage(volume).await {
            error!("[{}] {:?}", volume.volume_id, err);
            ui.display_message("❌", &format!("[{}] {}", volume.volume_id, err));
            failed.push(volume.volume_id.as_str());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "{} volume(s) failed: {}",
            failed.len(),
            failed.join(", ")
        ))
    }
}

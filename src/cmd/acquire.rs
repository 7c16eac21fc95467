//! The `acquire` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    acquire::{AcquireSettings, acquire_volume, artifacts::VolumeLayout, source::HttpDocumentSource},
    cmd::{RateLimitOpts, VolumeOpts, for_each_volume},
    config::PipelineOpts,
    pipeline::manifest::ManifestStore,
    prelude::*,
    ui::Ui,
};

#[derive(Debug, Clone, Args)]
pub struct AcquireOpts {
    #[clap(flatten)]
    pub volume: VolumeOpts,

    /// Base URL of the document archive API.
    #[clap(long, env = "ARCHIVE_BASE_URL")]
    pub base_url: String,

    /// JSON map of session cookies exported after logging in.
    #[clap(long, env = "ARCHIVE_COOKIES_FILE")]
    pub cookies_file: Option<PathBuf>,

    /// Documents to download at a time.
    #[clap(short = 'j', long, default_value = "2")]
    pub jobs: usize,

    /// Page images to download at a time, per document.
    #[clap(long, default_value = "5")]
    pub page_jobs: usize,

    /// Ignore the existing download manifest and start over.
    #[clap(long)]
    pub fresh: bool,

    /// Also download each document as a rendered PDF.
    #[clap(long)]
    pub with_pdf: bool,

    #[clap(flatten)]
    pub rate_limit: RateLimitOpts,
}

/// The `acquire` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_acquire(ui: &Ui, pipeline: &PipelineOpts, opts: &AcquireOpts) -> Result<()> {
    let catalog = pipeline.catalog().await?;
    let volumes = catalog.select(opts.volume.volume.as_deref())?;

    let source = Arc::new(
        HttpDocumentSource::new(
            &opts.base_url,
            opts.cookies_file.as_deref(),
            pipeline.timeouts.request(),
            pipeline.timeouts.pdf(),
        )
        .await?,
    );
    let settings = AcquireSettings {
        jobs: opts.jobs,
        page_jobs: opts.page_jobs,
        with_pdf: opts.with_pdf,
        fresh: opts.fresh,
        retry: pipeline.retry.policy(),
        min_image_bytes: pipeline.floors.min_image_bytes,
        min_pdf_bytes: pipeline.floors.min_pdf_bytes,
        rate_limiter: opts.rate_limit.rate_limiter(),
    };
    let store = ManifestStore::new(&pipeline.data_dir);

    for_each_volume(ui, volumes, |volume| {
        let (store, settings, source) = (&store, &settings, source.clone());
        async move {
            let layout = VolumeLayout::new(pipeline.volume_dir(&volume.volume_id));
            acquire_volume(ui, store, &layout, volume, source, settings).await?;
            Ok(())
        }
    })
    .await
}

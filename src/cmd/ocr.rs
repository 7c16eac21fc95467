//! The `ocr` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    acquire::artifacts::VolumeLayout,
    cmd::{RateLimitOpts, VolumeOpts, for_each_volume},
    config::PipelineOpts,
    ocr::{OcrSettings, ocr_volume, prompts::PromptVariant, vision::OpenAiVisionModel},
    pipeline::manifest::ManifestStore,
    prelude::*,
    ui::Ui,
};

#[derive(Debug, Clone, Args)]
pub struct OcrOpts {
    #[clap(flatten)]
    pub volume: VolumeOpts,

    /// The vision model to use.
    #[clap(long, env = "OCR_MODEL", default_value = "gemini-2.0-flash")]
    pub model: String,

    /// Model calls in flight at once.
    #[clap(short = 'j', long, env = "OCR_CONCURRENCY", default_value = "20")]
    pub jobs: usize,

    /// Which transcription prompt to use.
    #[clap(long, value_enum, default_value_t = PromptVariant::General)]
    pub prompt: PromptVariant,

    /// Run a text-only correction pass over the transcriptions.
    #[clap(long)]
    pub correct: bool,

    #[clap(flatten)]
    pub rate_limit: RateLimitOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: &Ui, pipeline: &PipelineOpts, opts: &OcrOpts) -> Result<()> {
    let catalog = pipeline.catalog().await?;
    let volumes = catalog.select(opts.volume.volume.as_deref())?;

    let model = Arc::new(OpenAiVisionModel::from_env(
        &opts.model,
        pipeline.timeouts.ocr(),
    ));
    let settings = OcrSettings {
        jobs: opts.jobs,
        prompt: opts.prompt,
        correct: opts.correct,
        retry: pipeline.retry.policy(),
        rate_limiter: opts.rate_limit.rate_limiter(),
    };
    let store = ManifestStore::new(&pipeline.data_dir);

    for_each_volume(ui, volumes, |volume| {
        let (store, settings, model) = (&store, &settings, model.clone());
        async move {
            let layout = VolumeLayout::new(pipeline.volume_dir(&volume.volume_id));
            ocr_volume(ui, store, &layout, &volume.volume_id, model, settings).await?;
            Ok(())
        }
    })
    .await
}

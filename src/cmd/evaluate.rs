//! The `evaluate` subcommand.

use clap::Args;
use rand::{SeedableRng as _, rngs::StdRng};

use crate::{
    acquire::artifacts::VolumeLayout,
    cmd::{VolumeOpts, for_each_volume},
    config::PipelineOpts,
    evaluate::{REPORT_FILE_NAME, evaluate_volume},
    pipeline::manifest::ManifestStore,
    prelude::*,
    ui::Ui,
};

#[derive(Debug, Clone, Args)]
pub struct EvaluateOpts {
    #[clap(flatten)]
    pub volume: VolumeOpts,

    /// Score only this many randomly chosen documents.
    #[clap(long)]
    pub sample: Option<usize>,
}

fn format_rate(rate: Option<f64>) -> String {
    rate.map_or_else(|| "n/a".to_owned(), |rate| format!("{rate:.4}"))
}

/// The `evaluate` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_evaluate(ui: &Ui, pipeline: &PipelineOpts, opts: &EvaluateOpts) -> Result<()> {
    let catalog = pipeline.catalog().await?;
    let volumes = catalog.select(opts.volume.volume.as_deref())?;
    let store = ManifestStore::new(&pipeline.data_dir);

    for_each_volume(ui, volumes, |volume| {
        let store = &store;
        async move {
            let volume_id = volume.volume_id.as_str();
            let layout = VolumeLayout::new(pipeline.volume_dir(volume_id));
            let mut rng = StdRng::from_entropy();
            let report = evaluate_volume(store, &layout, volume_id, opts.sample, &mut rng).await?;
            println!(
                "{volume_id}: WER={} CER={} ({} documents)",
                format_rate(report.overall_wer),
                format_rate(report.overall_cer),
                report.total_documents
            );
            debug!(
                path = %layout.root().join(REPORT_FILE_NAME).display(),
                "wrote evaluation report"
            );
            Ok(())
        }
    })
    .await
}

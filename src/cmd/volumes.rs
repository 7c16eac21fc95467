//! The `volumes` subcommand.

use crate::{config::PipelineOpts, prelude::*};

/// Print every configured volume, one per line.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_volumes(pipeline: &PipelineOpts) -> Result<()> {
    let catalog = pipeline.catalog().await?;
    for volume in &catalog.volumes {
        println!(
            "{}\t{}\t{} documents",
            volume.volume_id,
            volume.volume_ref,
            volume.documents.len()
        );
    }
    Ok(())
}

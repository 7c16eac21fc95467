//! The `discover` subcommand: show what a stage would still have to do.

use clap::{Args, ValueEnum};
use tokio::fs;

use crate::{
    acquire::artifacts::VolumeLayout,
    cmd::{VolumeOpts, for_each_volume},
    config::{PipelineOpts, Volume},
    pipeline::{
        discovery::{UnitLayout, discover_units, resolve_document_ids},
        manifest::{DownloadManifest, Ledger as _, ManifestStore, OcrManifest},
    },
    prelude::*,
    ui::Ui,
};

/// Which stage to enumerate units for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Stage {
    /// Documents to download.
    #[default]
    Acquire,
    /// Page images to transcribe.
    Ocr,
}

#[derive(Debug, Clone, Args)]
pub struct DiscoverOpts {
    #[clap(flatten)]
    pub volume: VolumeOpts,

    #[clap(long, value_enum, default_value_t = Stage::Acquire)]
    pub stage: Stage,
}

/// The `discover` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_discover(ui: &Ui, pipeline: &PipelineOpts, opts: &DiscoverOpts) -> Result<()> {
    let catalog = pipeline.catalog().await?;
    let volumes = catalog.select(opts.volume.volume.as_deref())?;
    let store = ManifestStore::new(&pipeline.data_dir);
    for_each_volume(ui, volumes, |volume| {
        let store = &store;
        async move {
            match opts.stage {
                Stage::Acquire => discover_documents(store, volume).await,
                Stage::Ocr => {
                    let layout = VolumeLayout::new(pipeline.volume_dir(&volume.volume_id));
                    discover_pages(store, &layout, &volume.volume_id).await
                }
            }
        }
    })
    .await
}

async fn discover_documents(store: &ManifestStore, volume: &Volume) -> Result<()> {
    let manifest = store.load::<DownloadManifest>(&volume.volume_id).await?;
    let doc_ids = resolve_document_ids(&manifest.doc_ids, &volume.doc_ids());
    let remaining = doc_ids
        .iter()
        .filter(|doc_id| !manifest.is_completed(doc_id))
        .collect::<Vec<_>>();
    println!(
        "{}: {} documents, {} remaining",
        volume.volume_id,
        doc_ids.len(),
        remaining.len()
    );
    for doc_id in remaining {
        println!("  {doc_id}");
    }
    Ok(())
}

async fn discover_pages(store: &ManifestStore, layout: &VolumeLayout, volume_id: &str) -> Result<()> {
    let images_dir = layout.images_dir();
    if !fs::try_exists(&images_dir).await? {
        println!("{volume_id}: no images directory");
        return Ok(());
    }
    let discovery = discover_units(&images_dir).await?;
    let manifest = store.load::<OcrManifest>(volume_id).await?;
    let remaining = discovery
        .units
        .iter()
        .filter(|unit| !manifest.is_completed(&unit.key()))
        .collect::<Vec<_>>();
    let layout_name = match discovery.layout {
        UnitLayout::Flat => "flat",
        UnitLayout::Nested => "nested",
    };
    println!(
        "{volume_id}: {} pages ({layout_name} layout), {} remaining",
        discovery.units.len(),
        remaining.len()
    );
    for unit in remaining {
        println!("  {}", unit.key());
    }
    Ok(())
}

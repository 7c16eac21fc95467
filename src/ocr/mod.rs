//! The OCR stage: transcribe every page image of a volume with a vision
//! model.
//!
//! Each page writes `page_NNNN.txt` with the transcription and
//! `page_NNNN.json` with its metadata, under `ocr/` (flat layout) or
//! `ocr/<doc>/` (per-document layout). Nothing is written for a page whose
//! model call failed.

pub mod correct;
pub mod prompts;
pub mod vision;

use std::{collections::BTreeMap, sync::Arc, sync::LazyLock};

use chrono::Utc;
use leaky_bucket::RateLimiter;
use regex::Regex;
use tokio::fs;

use self::{
    correct::{CorrectionUnit, correct_pages},
    prompts::PromptVariant,
    vision::{PageImage, VisionModel},
};
use crate::{
    acquire::artifacts::VolumeLayout,
    async_utils::io::{write_bytes_atomic, write_json_atomic},
    data_url::image_mime_type,
    pipeline::{
        discovery::{DiscoveredUnit, UnitLayout, discover_units, page_file_name},
        executor::{Executor, RunSummary, UnitProcessor, WorkUnit},
        manifest::{Ledger as _, ManifestStore, OcrManifest, PageRange, UnitKey},
    },
    prelude::*,
    retry::{AttemptResult, RetryPolicy, retry_result_ok, try_fatal, try_retry_result, try_transient},
    ui::Ui,
};

static ILLEGIBLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[illegible\]").expect("failed to compile regex"));

/// How many `[illegible]` markers the model left in `text`.
pub fn count_illegible(text: &str) -> usize {
    ILLEGIBLE_REGEX.find_iter(text).count()
}

/// Metadata written next to each transcription.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub page_num: u32,
    pub volume_id: String,
    pub source_document: String,
    pub model: String,
    pub text: String,
    pub illegible_count: usize,
    /// RFC 3339, UTC.
    pub timestamp: String,
    pub prompt_key: String,
}

/// Settings for one OCR run.
#[derive(Clone)]
pub struct OcrSettings {
    pub jobs: usize,
    pub prompt: PromptVariant,
    /// Run the post-correction pass afterwards.
    pub correct: bool,
    pub retry: RetryPolicy,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// The directory holding OCR output for `unit`.
fn output_dir_for(ocr_dir: &Path, unit: &DiscoveredUnit) -> PathBuf {
    match unit.parent_id() {
        Some(parent_id) => ocr_dir.join(parent_id),
        None => ocr_dir.to_owned(),
    }
}

/// One page image to transcribe.
#[derive(Debug)]
struct OcrUnit {
    unit: DiscoveredUnit,
    source_document: String,
    output_dir: PathBuf,
}

impl WorkUnit for OcrUnit {
    type Key = UnitKey;

    fn key(&self) -> UnitKey {
        self.unit.key()
    }
}

impl OcrUnit {
    fn text_path(&self) -> PathBuf {
        self.output_dir
            .join(page_file_name(self.unit.number(), "txt"))
    }

    fn metadata_path(&self) -> PathBuf {
        self.output_dir
            .join(page_file_name(self.unit.number(), "json"))
    }
}

struct OcrProcessor<M> {
    volume_id: String,
    model: Arc<M>,
    prompt: PromptVariant,
}

#[async_trait]
impl<M: VisionModel> UnitProcessor<OcrUnit> for OcrProcessor<M> {
    #[instrument(level = "debug", skip_all, fields(key = %unit.key()))]
    async fn attempt(&self, unit: &OcrUnit) -> AttemptResult<()> {
        let path = &unit.unit.path;
        let data = try_fatal!(
            fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))
        );
        let mime_type = try_fatal!(image_mime_type(path, &data));
        let image = PageImage { mime_type, data };

        let text = try_retry_result!(
            self.model.transcribe(self.prompt.prompt(), &image).await
        );

        let metadata = PageMetadata {
            page_num: unit.unit.number(),
            volume_id: self.volume_id.clone(),
            source_document: unit.source_document.clone(),
            model: self.model.model_id().to_owned(),
            illegible_count: count_illegible(&text),
            text,
            timestamp: Utc::now().to_rfc3339(),
            prompt_key: self.prompt.key().to_owned(),
        };
        try_transient!(write_page_output(unit, &metadata).await);
        retry_result_ok(())
    }
}

/// Write the transcription and its metadata. If the metadata cannot be
/// written, the transcription is removed again.
async fn write_page_output(unit: &OcrUnit, metadata: &PageMetadata) -> Result<()> {
    let text_path = unit.text_path();
    write_bytes_atomic(&text_path, metadata.text.as_bytes()).await?;
    if let Err(err) = write_json_atomic(&unit.metadata_path(), metadata).await {
        let _ = fs::remove_file(&text_path).await;
        return Err(err);
    }
    Ok(())
}

/// Which document a flat-layout page belongs to, according to the page map.
fn source_document_for(page: u32, doc_page_map: &BTreeMap<String, PageRange>) -> String {
    doc_page_map
        .iter()
        .find(|(_, range)| range.start_page <= page && page <= range.end_page)
        .map(|(doc_id, _)| doc_id.clone())
        .unwrap_or_default()
}

/// Run the OCR stage for one volume.
#[instrument(level = "debug", skip_all, fields(volume = %volume_id))]
pub async fn ocr_volume<M: VisionModel>(
    ui: &Ui,
    store: &ManifestStore,
    layout: &VolumeLayout,
    volume_id: &str,
    model: Arc<M>,
    settings: &OcrSettings,
) -> Result<RunSummary> {
    let images_dir = layout.images_dir();
    if !fs::try_exists(&images_dir).await.unwrap_or(false) {
        return Err(anyhow!(
            "[{volume_id}] no images directory at {} (run `acquire` first)",
            images_dir.display()
        ));
    }
    let discovery = discover_units(&images_dir).await?;

    let mut manifest = store.load::<OcrManifest>(volume_id).await?;
    manifest.volume_id = volume_id.to_owned();
    manifest.total_pages = discovery.units.len();
    if discovery.layout == UnitLayout::Nested {
        manifest.doc_page_map = discovery.page_ranges();
    }
    store.save(volume_id, &manifest).await?;

    if discovery.is_empty() {
        ui.display_message(
            "ℹ️",
            &format!("[{volume_id}] no page images in {}", images_dir.display()),
        );
        return Ok(RunSummary::default());
    }

    let ocr_dir = layout.ocr_dir();
    let units = discovery
        .units
        .into_iter()
        .map(|unit| OcrUnit {
            source_document: match unit.parent_id() {
                Some(parent_id) => parent_id.to_owned(),
                None => source_document_for(unit.number(), &manifest.doc_page_map),
            },
            output_dir: output_dir_for(&ocr_dir, &unit),
            unit,
        })
        .collect::<Vec<_>>();
    let correction_targets = units
        .iter()
        .map(|unit| (unit.key(), unit.text_path()))
        .collect::<Vec<_>>();

    let executor = Executor::new(volume_id, settings.jobs, settings.retry.clone(), ui.clone())
        .with_rate_limiter(settings.rate_limiter.clone());
    let processor = Arc::new(OcrProcessor {
        volume_id: volume_id.to_owned(),
        model: model.clone(),
        prompt: settings.prompt,
    });
    let summary = executor
        .run(units, &mut manifest, processor, &store.checkpoint(volume_id))
        .await?;

    ui.display_message(
        if summary.failed == 0 { "✅" } else { "⚠️" },
        &format!(
            "[{volume_id}] OCR complete: {} of {} pages done, {} failed this run",
            manifest.completed_pages.len(),
            manifest.total_pages,
            summary.failed
        ),
    );

    if settings.correct {
        let units = correction_targets
            .into_iter()
            .filter(|(key, _)| manifest.is_completed(key))
            .map(|(key, text_path)| CorrectionUnit { key, text_path })
            .collect::<Vec<_>>();
        info!("[{volume_id}] correcting {} pages", units.len());
        let corrections = correct_pages(&executor, units, model).await?;
        ui.display_message(
            "✏️",
            &format!(
                "[{volume_id}] correction: {} corrected, {} failed",
                corrections.completed, corrections.failed
            ),
        );
    }
    Ok(summary)
}

//! Post-correction of OCR output.
//!
//! A second, text-only model pass fixes obvious recognition errors. The
//! uncorrected text is kept next to the page as `page_NNNN.raw.txt`, and its
//! presence marks the page as already corrected.

use std::sync::Arc;

use tokio::fs;

use crate::{
    async_utils::io::write_bytes_atomic,
    ocr::vision::VisionModel,
    pipeline::{
        executor::{Executor, NoCheckpoint, RunSummary, UnitProcessor, WorkUnit},
        manifest::{MemoryLedger, UnitKey},
    },
    prelude::*,
    retry::{
        AttemptResult, retry_result_ok, retry_result_transient, try_fatal, try_retry_result,
        try_transient,
    },
};

const CORRECTION_PROMPT: &str = "\
You are proofreading machine transcriptions of 19th-century British colonial \
correspondence (Colonial Office series CO 273, Straits Settlements).

Correct only clear recognition errors:
- swapped or misread letters (\"tbe\" for \"the\", \"rn\" for \"m\")
- missing or doubled spaces between words
- words split across line ends that belong together
- garbled letter runs that are plainly a known English word

Leave these exactly as they are:
- period spellings such as connexion, shew and gaol
- names of people, places and ships, however unfamiliar
- [illegible] markers
- line breaks, punctuation and layout
- Markdown tables

Reply with the corrected text and nothing else.

---
";

/// Where the uncorrected text of `text_path` is kept.
pub fn raw_backup_path(text_path: &Path) -> PathBuf {
    text_path.with_extension("raw.txt")
}

/// One page transcription to correct.
#[derive(Debug)]
pub struct CorrectionUnit {
    pub key: UnitKey,
    pub text_path: PathBuf,
}

impl WorkUnit for CorrectionUnit {
    type Key = UnitKey;

    fn key(&self) -> UnitKey {
        self.key.clone()
    }
}

struct CorrectionProcessor<M> {
    model: Arc<M>,
}

#[async_trait]
impl<M: VisionModel> UnitProcessor<CorrectionUnit> for CorrectionProcessor<M> {
    #[instrument(level = "debug", skip_all, fields(key = %unit.key))]
    async fn attempt(&self, unit: &CorrectionUnit) -> AttemptResult<()> {
        let raw_path = raw_backup_path(&unit.text_path);
        if try_transient!(fs::try_exists(&raw_path).await) {
            trace!("already corrected");
            return retry_result_ok(());
        }
        let text = try_fatal!(
            fs::read_to_string(&unit.text_path)
                .await
                .with_context(|| format!("failed to read {}", unit.text_path.display()))
        );
        if text.trim().is_empty() {
            return retry_result_ok(());
        }

        let corrected = try_retry_result!(
            self.model
                .complete_text(&format!("{CORRECTION_PROMPT}{text}"))
                .await
        );
        try_transient!(write_bytes_atomic(&raw_path, text.as_bytes()).await);
        if let Err(err) = write_bytes_atomic(&unit.text_path, corrected.as_bytes()).await {
            // The backup marks the page as corrected, so it must not outlive
            // a failed write.
            let _ = fs::remove_file(&raw_path).await;
            return retry_result_transient(err);
        }
        retry_result_ok(())
    }
}

/// Correct every page in `units`, skipping pages corrected by earlier runs.
pub async fn correct_pages<M: VisionModel>(
    executor: &Executor,
    units: Vec<CorrectionUnit>,
    model: Arc<M>,
) -> Result<RunSummary> {
    let mut ledger = MemoryLedger::default();
    executor
        .run(
            units,
            &mut ledger,
            Arc::new(CorrectionProcessor { model }),
            &NoCheckpoint,
        )
        .await
}

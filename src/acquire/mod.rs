//! The acquisition stage: download each document's baseline text, page
//! images and optionally its rendered PDF.
//!
//! Documents are units of the download manifest. The page images of one
//! document run through a nested executor with its own, smaller concurrency
//! cap and an in-memory ledger; pages already on disk are skipped without any
//! network I/O, so retrying a document only fetches what is missing.

pub mod artifacts;
pub mod source;

use std::sync::Arc;

use leaky_bucket::RateLimiter;
use tokio::sync::Semaphore;

use self::{
    artifacts::{
        VolumeLayout, cached_page_image, check_image_payload, check_pdf_payload,
        store_page_image,
    },
    source::{DocumentSource, PageToken},
};
use crate::{
    async_utils::io::{file_size, write_bytes_atomic},
    config::Volume,
    pipeline::{
        discovery::resolve_document_ids,
        executor::{Executor, NoCheckpoint, RunSummary, UnitProcessor, WorkUnit},
        manifest::{DownloadManifest, ManifestStore, MemoryLedger, StageManifest, UnitKey},
    },
    prelude::*,
    retry::{
        AttemptResult, RetryPolicy, retry_result_fatal, retry_result_ok, try_fatal,
        try_retry_result, try_transient,
    },
    ui::Ui,
};

/// Settings for one acquisition run.
#[derive(Clone)]
pub struct AcquireSettings {
    /// Documents in flight at once.
    pub jobs: usize,
    /// Page image downloads in flight at once, across all documents of a
    /// volume.
    pub page_jobs: usize,
    pub with_pdf: bool,
    /// Ignore any existing download manifest.
    pub fresh: bool,
    pub retry: RetryPolicy,
    pub min_image_bytes: u64,
    pub min_pdf_bytes: u64,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

/// One archive document.
#[derive(Debug)]
pub struct DocumentUnit {
    pub doc_id: String,
}

impl WorkUnit for DocumentUnit {
    type Key = String;

    fn key(&self) -> String {
        self.doc_id.clone()
    }
}

/// One page image of a document.
#[derive(Debug)]
struct PageUnit {
    doc_id: String,
    page: PageToken,
}

impl WorkUnit for PageUnit {
    type Key = UnitKey;

    fn key(&self) -> UnitKey {
        UnitKey::DocumentPage {
            doc_id: self.doc_id.clone(),
            page: self.page.page_num,
        }
    }
}

/// Downloads everything belonging to one document.
struct DocumentProcessor<S> {
    volume_id: String,
    source: Arc<S>,
    /// Shared by every document, so `jobs` documents together never have
    /// more than `page_jobs` page downloads open.
    page_fetches: Arc<Semaphore>,
    layout: VolumeLayout,
    settings: AcquireSettings,
    ui: Ui,
}

#[async_trait]
impl<S: DocumentSource> UnitProcessor<DocumentUnit> for DocumentProcessor<S> {
    #[instrument(level = "debug", skip_all, fields(doc_id = %unit.doc_id))]
    async fn attempt(&self, unit: &DocumentUnit) -> AttemptResult<()> {
        let doc_id = &unit.doc_id;
        let record = try_retry_result!(self.source.fetch_record(doc_id).await);
        try_fatal!(record.validate());

        if let Some(text) = record.baseline_document() {
            try_transient!(
                write_bytes_atomic(&self.layout.baseline_text_path(doc_id), text.as_bytes())
                    .await
            );
        }

        let pages = record
            .pages
            .iter()
            .map(|page| PageUnit {
                doc_id: doc_id.clone(),
                page: page.clone(),
            })
            .collect::<Vec<_>>();
        let page_count = pages.len();
        let processor = Arc::new(PageProcessor {
            source: self.source.clone(),
            page_fetches: self.page_fetches.clone(),
            dir: self.layout.document_images_dir(doc_id),
            min_image_bytes: self.settings.min_image_bytes,
        });
        let mut ledger = MemoryLedger::default();
        let summary = try_transient!(
            Executor::new(
                format!("{} {}", self.volume_id, doc_id),
                self.settings.page_jobs,
                self.settings.retry.clone(),
                self.ui.clone(),
            )
            .with_rate_limiter(self.settings.rate_limiter.clone())
            .run(pages, &mut ledger, processor, &NoCheckpoint)
            .await
        );
        if summary.failed > 0 {
            // Each page has already used up its own retries.
            let (key, error) = ledger
                .failures()
                .first()
                .cloned()
                .unwrap_or_else(|| (UnitKey::Page(0), "unknown error".to_owned()));
            return retry_result_fatal(anyhow!(
                "{} of {} page images failed (page {}: {})",
                summary.failed,
                page_count,
                key.page(),
                error
            ));
        }

        if self.settings.with_pdf {
            try_retry_result!(self.download_pdf(doc_id).await);
        }
        retry_result_ok(())
    }
}

impl<S: DocumentSource> DocumentProcessor<S> {
    async fn download_pdf(&self, doc_id: &str) -> AttemptResult<()> {
        let path = self.layout.pdf_path(doc_id);
        if try_transient!(file_size(&path).await)
            .is_some_and(|size| size >= self.settings.min_pdf_bytes)
        {
            debug!(path = %path.display(), "PDF already downloaded");
            return retry_result_ok(());
        }
        let payload = try_retry_result!(self.source.fetch_pdf(doc_id).await);
        try_transient!(check_pdf_payload(&payload, self.settings.min_pdf_bytes));
        try_transient!(write_bytes_atomic(&path, &payload.bytes).await);
        debug!(
            path = %path.display(),
            kb = payload.bytes.len() as f64 / 1024.0,
            "saved PDF"
        );
        retry_result_ok(())
    }
}

/// Downloads one page image, unless it is already on disk.
struct PageProcessor<S> {
    source: Arc<S>,
    page_fetches: Arc<Semaphore>,
    dir: PathBuf,
    min_image_bytes: u64,
}

#[async_trait]
impl<S: DocumentSource> UnitProcessor<PageUnit> for PageProcessor<S> {
    async fn attempt(&self, unit: &PageUnit) -> AttemptResult<()> {
        let page_num = unit.page.page_num;
        if let Some(path) = try_transient!(
            cached_page_image(&self.dir, page_num, self.min_image_bytes).await
        ) {
            trace!(path = %path.display(), "page image cache hit");
            return retry_result_ok(());
        }
        let payload = {
            let _permit = try_fatal!(
                self.page_fetches
                    .acquire()
                    .await
                    .context("page download gate closed")
            );
            try_retry_result!(self.source.fetch_page_image(&unit.doc_id, &unit.page).await)
        };
        let ext = try_transient!(check_image_payload(&payload, self.min_image_bytes));
        try_transient!(store_page_image(&self.dir, page_num, ext, &payload).await);
        retry_result_ok(())
    }
}

/// Run the acquisition stage for one volume.
#[instrument(level = "debug", skip_all, fields(volume = %volume.volume_id))]
pub async fn acquire_volume<S: DocumentSource>(
    ui: &Ui,
    store: &ManifestStore,
    layout: &VolumeLayout,
    volume: &Volume,
    source: Arc<S>,
    settings: &AcquireSettings,
) -> Result<RunSummary> {
    let volume_id = volume.volume_id.as_str();
    let mut manifest = if settings.fresh {
        DownloadManifest::for_volume(volume_id)
    } else {
        store.load::<DownloadManifest>(volume_id).await?
    };
    manifest.volume_id = volume_id.to_owned();

    let doc_ids = resolve_document_ids(&manifest.doc_ids, &volume.doc_ids());
    manifest.doc_ids = doc_ids.clone();
    manifest.total_documents = doc_ids.len();
    store.save(volume_id, &manifest).await?;

    if doc_ids.is_empty() {
        ui.display_message("ℹ️", &format!("[{volume_id}] no documents configured"));
        return Ok(RunSummary::default());
    }
    info!("[{volume_id}] {} documents", doc_ids.len());

    let units = doc_ids
        .into_iter()
        .map(|doc_id| DocumentUnit { doc_id })
        .collect::<Vec<_>>();
    let processor = Arc::new(DocumentProcessor {
        volume_id: volume_id.to_owned(),
        source,
        page_fetches: Arc::new(Semaphore::new(settings.page_jobs.max(1))),
        layout: layout.clone(),
        settings: settings.clone(),
        ui: ui.clone(),
    });
    let summary = Executor::new(
        volume_id,
        settings.jobs,
        settings.retry.clone(),
        ui.clone(),
    )
    .with_rate_limiter(settings.rate_limiter.clone())
    .run(
        units,
        &mut manifest,
        processor,
        &store.checkpoint(volume_id),
    )
    .await?;

    ui.display_message(
        if summary.failed == 0 { "✅" } else { "⚠️" },
        &format!(
            "[{volume_id}] {} of {} documents downloaded, {} failed this run",
            manifest.downloaded_docs.len(),
            manifest.total_documents,
            summary.failed
        ),
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tempfile::TempDir;

    use super::{artifacts::tests::jpeg, artifacts::tests::pdf, source::*, *};
    use crate::{pipeline::manifest::Ledger as _, retry::retry_result_transient};

    /// An in-memory archive that counts requests.
    #[derive(Default)]
    struct FakeArchive {
        records: HashMap<String, DocumentRecord>,
        /// Pages that return a tiny placeholder instead of an image.
        placeholder_pages: HashSet<(String, u32)>,
        /// Documents whose record fetch fails this many times first.
        flaky_records: Mutex<HashMap<String, usize>>,
        record_calls: AtomicUsize,
        page_calls: AtomicUsize,
        /// Page downloads open right now, and the most seen at once.
        active_pages: AtomicUsize,
        peak_pages: AtomicUsize,
        pdf_calls: AtomicUsize,
        pdf_bytes: usize,
    }

    impl FakeArchive {
        fn with_docs(docs: &[(&str, u32)]) -> Self {
            let records = docs
                .iter()
                .map(|&(doc_id, pages)| {
                    let record = DocumentRecord {
                        doc_id: doc_id.to_owned(),
                        pages: (1..=pages)
                            .map(|page_num| PageToken {
                                page_num,
                                token: format!("{doc_id}-{page_num}"),
                            })
                            .collect(),
                        baseline_text: (1..=pages)
                            .map(|n| (n, format!("baseline page {n}")))
                            .collect(),
                    };
                    (doc_id.to_owned(), record)
                })
                .collect();
            Self {
                records,
                pdf_bytes: 6000,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DocumentSource for FakeArchive {
        async fn fetch_record(&self, doc_id: &str) -> AttemptResult<DocumentRecord> {
            self.record_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut flaky = self.flaky_records.lock().unwrap();
                if let Some(remaining) = flaky.get_mut(doc_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return retry_result_transient(anyhow!("503 Service Unavailable"));
                    }
                }
            }
            match self.records.get(doc_id) {
                Some(record) => retry_result_ok(record.clone()),
                None => retry_result_fatal(anyhow!("no such document")),
            }
        }

        async fn fetch_page_image(
            &self,
            doc_id: &str,
            page: &PageToken,
        ) -> AttemptResult<Payload> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active_pages.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_pages.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            self.active_pages.fetch_sub(1, Ordering::SeqCst);
            let len = if self
                .placeholder_pages
                .contains(&(doc_id.to_owned(), page.page_num))
            {
                200
            } else {
                1500
            };
            retry_result_ok(Payload {
                bytes: jpeg(len),
                content_type: Some("image/jpeg".into()),
            })
        }

        async fn fetch_pdf(&self, _doc_id: &str) -> AttemptResult<Payload> {
            self.pdf_calls.fetch_add(1, Ordering::SeqCst);
            retry_result_ok(Payload {
                bytes: pdf(self.pdf_bytes),
                content_type: Some("application/pdf".into()),
            })
        }
    }

    fn settings() -> AcquireSettings {
        AcquireSettings {
            jobs: 2,
            page_jobs: 3,
            with_pdf: false,
            fresh: false,
            retry: RetryPolicy {
                max_retries: 3,
                backoff_base: 2.0,
                backoff_unit: Duration::from_millis(1),
            },
            min_image_bytes: 1000,
            min_pdf_bytes: 5000,
            rate_limiter: None,
        }
    }

    fn volume(doc_ids: &[&str]) -> Volume {
        serde_json::from_value(serde_json::json!({
            "volume_id": "V1",
            "documents": doc_ids.iter().map(|id| serde_json::json!({"doc_id": id})).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    async fn run(
        dir: &TempDir,
        archive: Arc<FakeArchive>,
        doc_ids: &[&str],
        settings: &AcquireSettings,
    ) -> (RunSummary, DownloadManifest) {
        let ui = Ui::init_for_tests();
        let store = ManifestStore::new(dir.path());
        let layout = VolumeLayout::new(dir.path().join("V1"));
        let summary = acquire_volume(&ui, &store, &layout, &volume(doc_ids), archive, settings)
            .await
            .unwrap();
        let manifest = store.load::<DownloadManifest>("V1").await.unwrap();
        (summary, manifest)
    }

    #[tokio::test]
    async fn downloads_documents_and_records_them() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::with_docs(&[("GALE|A", 3), ("GALE|B", 2)]));
        let (summary, manifest) = run(&dir, archive.clone(), &["GALE|A", "GALE|B"], &settings()).await;

        assert_eq!(summary.completed, 2);
        assert_eq!(manifest.total_documents, 2);
        assert!(manifest.is_completed(&"GALE|A".to_owned()));
        assert!(dir.path().join("V1/images/GALE_A/page_0003.jpg").exists());
        let text = std::fs::read_to_string(dir.path().join("V1/text/GALE_B.txt")).unwrap();
        assert!(text.starts_with("--- Page 1 ---\nbaseline page 1"));
        assert_eq!(archive.page_calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn page_downloads_share_one_cap_across_documents() {
        let dir = TempDir::new().unwrap();
        let docs = [("GALE|A", 6), ("GALE|B", 6), ("GALE|C", 6), ("GALE|D", 6)];
        let archive = Arc::new(FakeArchive::with_docs(&docs));
        let busy = AcquireSettings {
            jobs: 4,
            page_jobs: 2,
            ..settings()
        };
        let (summary, _) = run(
            &dir,
            archive.clone(),
            &["GALE|A", "GALE|B", "GALE|C", "GALE|D"],
            &busy,
        )
        .await;
        assert_eq!(summary.completed, 4);
        assert_eq!(archive.page_calls.load(Ordering::SeqCst), 24);
        assert!(archive.peak_pages.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn second_run_does_no_network_io() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::with_docs(&[("GALE|A", 2)]));
        run(&dir, archive.clone(), &["GALE|A"], &settings()).await;
        let (summary, _) = run(&dir, archive.clone(), &["GALE|A"], &settings()).await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(archive.record_calls.load(Ordering::SeqCst), 1);
        assert_eq!(archive.page_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn placeholder_pages_fail_the_document_and_are_never_written() {
        let dir = TempDir::new().unwrap();
        let mut archive = FakeArchive::with_docs(&[("GALE|A", 3), ("GALE|B", 1)]);
        archive.placeholder_pages.insert(("GALE|A".into(), 2));
        let archive = Arc::new(archive);
        let (summary, manifest) = run(&dir, archive.clone(), &["GALE|A", "GALE|B"], &settings()).await;

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert!(!manifest.is_completed(&"GALE|A".to_owned()));
        assert!(manifest.is_completed(&"GALE|B".to_owned()));
        assert_eq!(manifest.failed_docs[0].doc, "GALE|A");
        assert!(!dir.path().join("V1/images/GALE_A/page_0002.jpg").exists());
        assert!(dir.path().join("V1/images/GALE_A/page_0001.jpg").exists());
        // Page 2 used its three attempts; the document is not retried on top.
        assert_eq!(archive.record_calls.load(Ordering::SeqCst), 2);
        assert_eq!(archive.page_calls.load(Ordering::SeqCst), 3 + 3);
    }

    #[tokio::test]
    async fn retrying_a_document_reuses_cached_pages() {
        let dir = TempDir::new().unwrap();
        let mut archive = FakeArchive::with_docs(&[("GALE|A", 3)]);
        archive.placeholder_pages.insert(("GALE|A".into(), 3));
        run(&dir, Arc::new(archive), &["GALE|A"], &settings()).await;

        let archive = Arc::new(FakeArchive::with_docs(&[("GALE|A", 3)]));
        let (summary, manifest) = run(&dir, archive.clone(), &["GALE|A"], &settings()).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(manifest.downloaded_docs, vec!["GALE|A".to_owned()]);
        assert_eq!(manifest.failed_docs.len(), 1);
        assert_eq!(archive.page_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_record_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let archive = FakeArchive::with_docs(&[("GALE|A", 1)]);
        archive.flaky_records.lock().unwrap().insert("GALE|A".into(), 2);
        let archive = Arc::new(archive);
        let (summary, _) = run(&dir, archive.clone(), &["GALE|A"], &settings()).await;
        assert_eq!(summary.completed, 1);
        assert_eq!(archive.record_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn frozen_document_list_survives_config_changes() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::with_docs(&[("GALE|A", 1), ("GALE|B", 1)]));
        run(&dir, archive.clone(), &["GALE|A"], &settings()).await;
        let (summary, manifest) = run(&dir, archive.clone(), &["GALE|A", "GALE|B"], &settings()).await;
        assert_eq!(manifest.doc_ids, vec!["GALE|A".to_owned()]);
        assert_eq!(summary.total, 1);

        let fresh = AcquireSettings {
            fresh: true,
            ..settings()
        };
        let (summary, manifest) = run(&dir, archive, &["GALE|A", "GALE|B"], &fresh).await;
        assert_eq!(manifest.doc_ids.len(), 2);
        assert_eq!(summary.completed, 2);
    }

    #[tokio::test]
    async fn short_pdfs_are_rejected_and_never_written() {
        let dir = TempDir::new().unwrap();
        let mut archive = FakeArchive::with_docs(&[("GALE|A", 1)]);
        archive.pdf_bytes = 3000;
        let archive = Arc::new(archive);
        let with_pdf = AcquireSettings {
            with_pdf: true,
            ..settings()
        };
        let (summary, _) = run(&dir, archive.clone(), &["GALE|A"], &with_pdf).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(archive.pdf_calls.load(Ordering::SeqCst), 3);
        assert!(!dir.path().join("V1/documents/GALE_A.pdf").exists());
    }

    #[tokio::test]
    async fn good_pdfs_are_stored() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::with_docs(&[("GALE|A", 1)]));
        let with_pdf = AcquireSettings {
            with_pdf: true,
            ..settings()
        };
        let (summary, _) = run(&dir, archive, &["GALE|A"], &with_pdf).await;
        assert_eq!(summary.completed, 1);
        assert!(dir.path().join("V1/documents/GALE_A.pdf").exists());
    }

    #[tokio::test]
    async fn unknown_documents_fail_without_retries() {
        let dir = TempDir::new().unwrap();
        let archive = Arc::new(FakeArchive::with_docs(&[]));
        let (summary, manifest) = run(&dir, archive.clone(), &["GALE|X"], &settings()).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(archive.record_calls.load(Ordering::SeqCst), 1);
        assert!(manifest.failed_docs[0].error.contains("no such document"));
    }
}

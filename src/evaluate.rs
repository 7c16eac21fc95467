//! Scoring OCR output against the baseline transcription.
//!
//! Baseline text holds one file per document with `--- Page N ---` markers.
//! OCR output holds one file per page. We compute word and character error
//! rates per page, then average per document and per volume.

use std::{collections::BTreeMap, sync::LazyLock};

use rand::{Rng, seq::SliceRandom as _};
use regex::Regex;
use tokio::fs;

use crate::{
    acquire::artifacts::VolumeLayout,
    async_utils::io::write_json_atomic,
    pipeline::{
        discovery::{page_file_name, sanitize_doc_id},
        manifest::{ManifestStore, OcrManifest, PageRange},
    },
    prelude::*,
};

/// File name of the evaluation report inside the volume directory.
pub const REPORT_FILE_NAME: &str = "eval_report.json";

static PAGE_MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"---\s*Page\s+(\d+)\s*---").expect("failed to compile regex")
});

/// Split a baseline document into pages. Pages with no text are dropped.
pub fn parse_baseline(text: &str) -> BTreeMap<u32, String> {
    let mut pages = BTreeMap::new();
    let markers = PAGE_MARKER_REGEX.captures_iter(text).collect::<Vec<_>>();
    for (i, captures) in markers.iter().enumerate() {
        let Ok(page_num) = captures[1].parse::<u32>() else {
            continue;
        };
        let start = captures.get(0).map_or(0, |m| m.end());
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(text.len(), |m| m.start());
        let page_text = text[start..end].trim();
        if !page_text.is_empty() {
            pages.insert(page_num, page_text.to_owned());
        }
    }
    pages
}

/// Edit distance between two token sequences.
fn levenshtein<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> usize {
    let mut previous = (0..=hypothesis.len()).collect::<Vec<_>>();
    let mut current = vec![0; hypothesis.len() + 1];
    for (i, r) in reference.iter().enumerate() {
        current[0] = i + 1;
        for (j, h) in hypothesis.iter().enumerate() {
            let substitution = previous[j] + usize::from(r != h);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[hypothesis.len()]
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| round4(sum / count as f64))
}

/// Metrics for one page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageMetrics {
    Scored {
        wer: f64,
        cer: f64,
        ref_words: usize,
        hyp_words: usize,
    },
    Missing {
        error: String,
    },
}

impl PageMetrics {
    /// Score `hypothesis` against `reference`.
    pub fn compute(reference: &str, hypothesis: &str) -> Self {
        let ref_words = reference.split_whitespace().collect::<Vec<_>>();
        let hyp_words = hypothesis.split_whitespace().collect::<Vec<_>>();
        if ref_words.is_empty() {
            return PageMetrics::Scored {
                wer: 0.0,
                cer: 0.0,
                ref_words: 0,
                hyp_words: hyp_words.len(),
            };
        }
        let ref_chars = reference.trim().chars().collect::<Vec<_>>();
        let hyp_chars = hypothesis.trim().chars().collect::<Vec<_>>();
        let wer = levenshtein(&ref_words, &hyp_words) as f64 / ref_words.len() as f64;
        let cer = levenshtein(&ref_chars, &hyp_chars) as f64 / ref_chars.len() as f64;
        PageMetrics::Scored {
            wer: round4(wer),
            cer: round4(cer),
            ref_words: ref_words.len(),
            hyp_words: hyp_words.len(),
        }
    }

    fn missing() -> Self {
        PageMetrics::Missing {
            error: "OCR output not found".to_owned(),
        }
    }

    fn rates(&self) -> Option<(f64, f64)> {
        match self {
            PageMetrics::Scored { wer, cer, .. } => Some((*wer, *cer)),
            PageMetrics::Missing { .. } => None,
        }
    }
}

/// Results for one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentEvaluation {
    pub doc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pages_compared: usize,
    pub page_metrics: BTreeMap<u32, PageMetrics>,
    pub avg_wer: Option<f64>,
    pub avg_cer: Option<f64>,
}

/// The report written to [`REPORT_FILE_NAME`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub volume_id: String,
    pub documents: Vec<DocumentEvaluation>,
    pub total_documents: usize,
    pub overall_wer: Option<f64>,
    pub overall_cer: Option<f64>,
}

/// Where to find OCR output for a volume.
struct OcrOutput {
    dir: PathBuf,
    /// Flat-layout page ranges, keyed by sanitized document ID.
    flat_ranges: BTreeMap<String, PageRange>,
}

impl OcrOutput {
    async fn has_document(&self, doc_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.dir.join(doc_id)).await? || self.flat_ranges.contains_key(doc_id))
    }

    /// Load the OCR text for page `page_num` of `doc_id`, preferring the
    /// per-document layout.
    async fn load_page(&self, doc_id: &str, page_num: u32) -> Result<Option<String>> {
        let nested = self.dir.join(doc_id).join(page_file_name(page_num, "txt"));
        if let Some(text) = read_optional(&nested).await? {
            return Ok(Some(text));
        }
        let Some(volume_page) = self
            .flat_ranges
            .get(doc_id)
            .and_then(|range| range.volume_page(page_num))
        else {
            return Ok(None);
        };
        read_optional(&self.dir.join(page_file_name(volume_page, "txt"))).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text.trim().to_owned())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

async fn evaluate_document(
    layout: &VolumeLayout,
    output: &OcrOutput,
    doc_id: &str,
) -> Result<DocumentEvaluation> {
    let baseline_path = layout.text_dir().join(format!("{doc_id}.txt"));
    let Some(baseline) = read_optional(&baseline_path).await? else {
        return Ok(DocumentEvaluation {
            doc_id: doc_id.to_owned(),
            error: Some(format!("baseline not found: {}", baseline_path.display())),
            pages_compared: 0,
            page_metrics: BTreeMap::new(),
            avg_wer: None,
            avg_cer: None,
        });
    };

    let mut page_metrics = BTreeMap::new();
    for (page_num, reference) in parse_baseline(&baseline) {
        let metrics = match output.load_page(doc_id, page_num).await? {
            Some(hypothesis) => PageMetrics::compute(&reference, &hypothesis),
            None => PageMetrics::missing(),
        };
        page_metrics.insert(page_num, metrics);
    }

    let rates = page_metrics
        .values()
        .filter_map(PageMetrics::rates)
        .collect::<Vec<_>>();
    Ok(DocumentEvaluation {
        doc_id: doc_id.to_owned(),
        error: None,
        pages_compared: rates.len(),
        avg_wer: mean(rates.iter().map(|(wer, _)| *wer)),
        avg_cer: mean(rates.iter().map(|(_, cer)| *cer)),
        page_metrics,
    })
}

/// Baseline document IDs (sanitized) that also have OCR output.
async fn documents_to_evaluate(layout: &VolumeLayout, output: &OcrOutput) -> Result<Vec<String>> {
    let text_dir = layout.text_dir();
    let mut entries = fs::read_dir(&text_dir)
        .await
        .with_context(|| format!("failed to list {}", text_dir.display()))?;
    let mut doc_ids = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("txt") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if output.has_document(stem).await? {
            doc_ids.push(stem.to_owned());
        }
    }
    doc_ids.sort();
    Ok(doc_ids)
}

/// Evaluate a volume and write its report.
///
/// With `sample`, only that many randomly chosen documents are scored.
#[instrument(level = "debug", skip_all, fields(volume = %volume_id))]
pub async fn evaluate_volume<R: Rng>(
    store: &ManifestStore,
    layout: &VolumeLayout,
    volume_id: &str,
    sample: Option<usize>,
    rng: &mut R,
) -> Result<EvaluationReport> {
    let text_dir = layout.text_dir();
    let ocr_dir = layout.ocr_dir();
    if !fs::try_exists(&text_dir).await? {
        return Err(anyhow!(
            "[{volume_id}] no baseline directory at {} (run `acquire` first)",
            text_dir.display()
        ));
    }
    if !fs::try_exists(&ocr_dir).await? {
        return Err(anyhow!(
            "[{volume_id}] no OCR directory at {} (run `ocr` first)",
            ocr_dir.display()
        ));
    }

    let manifest = store.load::<OcrManifest>(volume_id).await?;
    let output = OcrOutput {
        dir: ocr_dir,
        flat_ranges: manifest
            .doc_page_map
            .into_iter()
            .map(|(doc_id, range)| (sanitize_doc_id(&doc_id), range))
            .collect(),
    };

    let mut doc_ids = documents_to_evaluate(layout, &output).await?;
    // `--sample 0` means no sampling.
    if let Some(n) = sample.filter(|&n| n > 0) {
        if n < doc_ids.len() {
            doc_ids = doc_ids.choose_multiple(rng, n).cloned().collect();
            doc_ids.sort();
        }
    }

    let mut documents = Vec::with_capacity(doc_ids.len());
    for doc_id in &doc_ids {
        let result = evaluate_document(layout, &output, doc_id).await?;
        info!(
            "[{volume_id}] {doc_id}: WER={:?} CER={:?} ({} pages)",
            result.avg_wer, result.avg_cer, result.pages_compared
        );
        documents.push(result);
    }

    let report = EvaluationReport {
        volume_id: volume_id.to_owned(),
        total_documents: documents.len(),
        overall_wer: mean(documents.iter().filter_map(|doc| doc.avg_wer)),
        overall_cer: mean(documents.iter().filter_map(|doc| doc.avg_cer)),
        documents,
    };
    write_json_atomic(&layout.root().join(REPORT_FILE_NAME), &report).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng as _, rngs::StdRng};
    use tempfile::TempDir;

    use super::*;

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    fn rates(metrics: &PageMetrics) -> (f64, f64) {
        metrics.rates().unwrap()
    }

    #[test]
    fn baseline_is_split_on_page_markers() {
        let pages = parse_baseline(
            "--- Page 1 ---\nfirst page\n\n---Page 2---\n   \n--- Page  10 ---\nlast\n",
        );
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[&1], "first page");
        assert_eq!(pages[&10], "last");
        assert!(parse_baseline("  \n").is_empty());
    }

    #[test]
    fn error_rates_follow_edit_distance() {
        let page = PageMetrics::compute("the cat sat on the mat", "the cat set on the mat");
        let (wer, cer) = rates(&page);
        assert_eq!(wer, round4(1.0 / 6.0));
        assert_eq!(cer, round4(1.0 / 22.0));

        assert_eq!(
            PageMetrics::compute("hello world", "hello world"),
            PageMetrics::Scored {
                wer: 0.0,
                cer: 0.0,
                ref_words: 2,
                hyp_words: 2
            }
        );
        assert_eq!(rates(&PageMetrics::compute("", "anything at all")), (0.0, 0.0));
        assert_eq!(rates(&PageMetrics::compute("a b", "")).0, 1.0);
    }

    #[test]
    fn levenshtein_counts_insertions_and_deletions() {
        assert_eq!(levenshtein(&['a', 'b', 'c'], &['a', 'c']), 1);
        assert_eq!(levenshtein(&['a'], &['a', 'b', 'c']), 2);
        assert_eq!(levenshtein::<char>(&[], &[]), 0);
    }

    #[tokio::test]
    async fn volume_report_averages_pages_then_documents() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "V1/text/GALE_A.txt",
            "--- Page 1 ---\nthe cat sat on the mat\n\n--- Page 2 ---\nhello world\n",
        );
        write(root, "V1/ocr/GALE_A/page_0001.txt", "the cat set on the mat\n");
        write(root, "V1/ocr/GALE_A/page_0002.txt", "hello world");
        write(
            root,
            "V1/text/GALE_B.txt",
            "--- Page 1 ---\nmissing page\n",
        );
        write(root, "V1/ocr/GALE_B/page_0002.txt", "unrelated");
        write(root, "V1/text/GALE_C.txt", "--- Page 1 ---\nno output at all\n");

        let store = ManifestStore::new(root);
        let layout = VolumeLayout::new(root.join("V1"));
        let mut rng = StdRng::seed_from_u64(7);
        let report = evaluate_volume(&store, &layout, "V1", None, &mut rng)
            .await
            .unwrap();

        assert_eq!(report.total_documents, 2);
        let a = &report.documents[0];
        assert_eq!(a.doc_id, "GALE_A");
        assert_eq!(a.pages_compared, 2);
        assert_eq!(rates(&a.page_metrics[&2]), (0.0, 0.0));
        assert_eq!(a.avg_wer, Some(round4(round4(1.0 / 6.0) / 2.0)));

        let b = &report.documents[1];
        assert_eq!(b.pages_compared, 0);
        assert_eq!(b.page_metrics[&1], PageMetrics::missing());
        assert_eq!(b.avg_wer, None);

        assert_eq!(report.overall_wer, a.avg_wer);
        assert_eq!(report.overall_cer, a.avg_cer);

        let saved: EvaluationReport = serde_json::from_str(
            &std::fs::read_to_string(root.join("V1").join(REPORT_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(saved, report);
    }

    #[tokio::test]
    async fn flat_output_is_found_through_the_page_map() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "V1/text/GALE_A.txt", "--- Page 1 ---\nfoo bar\n--- Page 2 ---\nbaz\n");
        write(root, "V1/ocr/page_0004.txt", "foo bar");
        write(root, "V1/ocr/page_0005.txt", "bax");
        let store = ManifestStore::new(root);
        let mut manifest = OcrManifest::default();
        manifest.doc_page_map.insert(
            "GALE|A".into(),
            PageRange {
                start_page: 4,
                end_page: 5,
                num_pages: 2,
            },
        );
        store.save("V1", &manifest).await.unwrap();

        let layout = VolumeLayout::new(root.join("V1"));
        let report = evaluate_volume(&store, &layout, "V1", None, &mut StdRng::seed_from_u64(1))
            .await
            .unwrap();
        let doc = &report.documents[0];
        assert_eq!(doc.pages_compared, 2);
        assert_eq!(rates(&doc.page_metrics[&1]), (0.0, 0.0));
        assert_eq!(rates(&doc.page_metrics[&2]).0, 1.0);
    }

    #[tokio::test]
    async fn sampling_picks_a_sorted_subset() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for doc in ["D1", "D2", "D3", "D4"] {
            write(root, &format!("V1/text/{doc}.txt"), "--- Page 1 ---\nsame\n");
            write(root, &format!("V1/ocr/{doc}/page_0001.txt"), "same");
        }
        let store = ManifestStore::new(root);
        let layout = VolumeLayout::new(root.join("V1"));
        let report = evaluate_volume(&store, &layout, "V1", Some(2), &mut StdRng::seed_from_u64(3))
            .await
            .unwrap();
        assert_eq!(report.total_documents, 2);
        let ids = report.documents.iter().map(|d| d.doc_id.clone()).collect::<Vec<_>>();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(report.overall_wer, Some(0.0));

        let report = evaluate_volume(&store, &layout, "V1", Some(0), &mut StdRng::seed_from_u64(3))
            .await
            .unwrap();
        assert_eq!(report.total_documents, 4);
    }

    #[tokio::test]
    async fn page_map_ranges_past_u32_max_are_missing_pages() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "V1/text/GALE_A.txt", "--- Page 1 ---\nfoo\n--- Page 2 ---\nbar\n");
        std::fs::create_dir_all(root.join("V1/ocr")).unwrap();
        let store = ManifestStore::new(root);
        let mut manifest = OcrManifest::default();
        manifest.doc_page_map.insert(
            "GALE|A".into(),
            PageRange {
                start_page: u32::MAX,
                end_page: u32::MAX,
                num_pages: 2,
            },
        );
        store.save("V1", &manifest).await.unwrap();

        let layout = VolumeLayout::new(root.join("V1"));
        let report = evaluate_volume(&store, &layout, "V1", None, &mut StdRng::seed_from_u64(0))
            .await
            .unwrap();
        let doc = &report.documents[0];
        assert_eq!(doc.page_metrics[&2], PageMetrics::missing());
        assert_eq!(doc.pages_compared, 0);
    }

    #[tokio::test]
    async fn missing_directories_are_errors() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::new(dir.path());
        let layout = VolumeLayout::new(dir.path().join("V1"));
        let err = evaluate_volume(&store, &layout, "V1", None, &mut StdRng::seed_from_u64(0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("baseline"));
    }
}

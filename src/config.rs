//! Volume catalog and pipeline tuning knobs.

use std::time::Duration;

use clap::Args;

use crate::{async_utils::io::read_json, prelude::*, retry::RetryPolicy};

/// The list of volumes we know about, usually `data/volumes.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct VolumeCatalog {
    pub volumes: Vec<Volume>,
}

/// A named group of archive documents.
#[derive(Clone, Debug, Deserialize)]
pub struct Volume {
    pub volume_id: String,

    /// Human-readable archive reference, like `CO 273/534`.
    #[serde(default)]
    pub volume_ref: String,

    #[serde(default)]
    pub documents: Vec<DocumentRef>,
}

impl Volume {
    pub fn doc_ids(&self) -> Vec<String> {
        self.documents.iter().map(|doc| doc.doc_id.clone()).collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DocumentRef {
    pub doc_id: String,
}

impl VolumeCatalog {
    pub async fn load(path: &Path) -> Result<Self> {
        let catalog: Self = read_json(path)
            .await
            .context("could not load the volume catalog")?;
        Ok(catalog)
    }

    pub fn volume_ids(&self) -> Vec<&str> {
        self.volumes.iter().map(|v| v.volume_id.as_str()).collect()
    }

    /// Select one volume by ID, or every volume if `volume_id` is `None`.
    pub fn select(&self, volume_id: Option<&str>) -> Result<Vec<&Volume>> {
        match volume_id {
            None => Ok(self.volumes.iter().collect()),
            Some(volume_id) => self
                .volumes
                .iter()
                .find(|v| v.volume_id == volume_id)
                .map(|v| vec![v])
                .ok_or_else(|| {
                    anyhow!(
                        "Unknown volume: {}\nAvailable: {}",
                        volume_id,
                        self.volume_ids().join(", ")
                    )
                }),
        }
    }
}

/// Options shared by every subcommand.
#[derive(Clone, Debug, Args)]
pub struct PipelineOpts {
    /// Root directory holding one subdirectory per volume.
    #[clap(long, env = "ARCHIVE_DATA_DIR", default_value = "pdfs", global = true)]
    pub data_dir: PathBuf,

    /// JSON file listing volumes and their documents.
    #[clap(
        long,
        env = "ARCHIVE_VOLUMES_FILE",
        default_value = "data/volumes.json",
        global = true
    )]
    pub volumes_file: PathBuf,

    #[clap(flatten)]
    pub retry: RetryOpts,

    #[clap(flatten)]
    pub timeouts: TimeoutOpts,

    #[clap(flatten)]
    pub floors: SizeFloorOpts,
}

impl PipelineOpts {
    pub async fn catalog(&self) -> Result<VolumeCatalog> {
        VolumeCatalog::load(&self.volumes_file).await
    }

    /// The directory for one volume.
    pub fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.data_dir.join(volume_id)
    }
}

/// Retry knobs.
#[derive(Clone, Debug, Args)]
pub struct RetryOpts {
    /// Attempts per unit, including the first.
    #[clap(long, default_value = "3", global = true)]
    pub max_retries: u32,

    /// Wait `BASE ^ attempt` seconds after a failed attempt.
    #[clap(long, default_value = "2.0", value_parser = parse_backoff_base, global = true)]
    pub backoff_base: f64,
}

/// Backoff bases must be finite and non-negative.
fn parse_backoff_base(s: &str) -> Result<f64, String> {
    let base = s
        .parse::<f64>()
        .map_err(|err| format!("not a number: {err}"))?;
    if base.is_finite() && base >= 0.0 {
        Ok(base)
    } else {
        Err(format!("backoff base must be a finite number >= 0, got {s}"))
    }
}

impl RetryOpts {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_base)
    }
}

/// Per-call timeouts, in seconds. `0` disables a timeout.
#[derive(Clone, Debug, Args)]
pub struct TimeoutOpts {
    /// Timeout for document records and page images.
    #[clap(long, default_value = "30", global = true)]
    pub request_timeout: u64,

    /// Timeout for whole-document PDFs, which the archive renders on demand.
    #[clap(long, default_value = "120", global = true)]
    pub pdf_timeout: u64,

    /// Timeout for each vision model call.
    #[clap(long, default_value = "30", global = true)]
    pub ocr_timeout: u64,
}

impl TimeoutOpts {
    pub fn request(&self) -> Option<Duration> {
        secs(self.request_timeout)
    }

    pub fn pdf(&self) -> Option<Duration> {
        secs(self.pdf_timeout)
    }

    pub fn ocr(&self) -> Option<Duration> {
        secs(self.ocr_timeout)
    }
}

fn secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Downloads smaller than these are placeholder or error pages, not real
/// artifacts.
#[derive(Clone, Debug, Args)]
pub struct SizeFloorOpts {
    #[clap(long, default_value = "1000", global = true)]
    pub min_image_bytes: u64,

    #[clap(long, default_value = "5000", global = true)]
    pub min_pdf_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> VolumeCatalog {
        serde_json::from_str(
            r#"{"volumes": [
                {"volume_id": "CO273_534", "volume_ref": "CO 273/534",
                 "documents": [{"doc_id": "GALE|AAA111"}, {"doc_id": "GALE|BBB222"}]},
                {"volume_id": "CO273_550", "documents": []}
            ]}"#,
        )
        .unwrap()
    }

    #[test]
    fn selects_one_or_all_volumes() {
        let catalog = catalog();
        assert_eq!(catalog.select(None).unwrap().len(), 2);
        let selected = catalog.select(Some("CO273_534")).unwrap();
        assert_eq!(selected[0].doc_ids(), vec!["GALE|AAA111", "GALE|BBB222"]);
    }

    #[test]
    fn backoff_base_rejects_negative_and_non_finite_values() {
        assert_eq!(parse_backoff_base("2.0"), Ok(2.0));
        assert_eq!(parse_backoff_base("0"), Ok(0.0));
        for bad in ["-1", "NaN", "inf", "fast"] {
            assert!(parse_backoff_base(bad).is_err(), "{bad} was accepted");
        }
    }

    #[test]
    fn unknown_volume_lists_valid_ids() {
        let err = catalog().select(Some("CO273_999")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Unknown volume: CO273_999"));
        assert!(msg.contains("CO273_534, CO273_550"));
    }

    #[test]
    fn zero_disables_timeouts() {
        let timeouts = TimeoutOpts {
            request_timeout: 30,
            pdf_timeout: 120,
            ocr_timeout: 0,
        };
        assert_eq!(timeouts.request(), Some(Duration::from_secs(30)));
        assert_eq!(timeouts.ocr(), None);
    }
}

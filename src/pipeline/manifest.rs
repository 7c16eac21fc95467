//! Durable per-volume completion ledgers.
//!
//! Each pipeline stage has its own manifest type, stored as pretty-printed
//! JSON in the volume directory. Downstream tooling reads these files, so
//! field names are part of the interface.
//!
//! The completed list is the authoritative record of what is done. The
//! failure list is an append-only audit log: a unit that failed in one run and
//! succeeded in a later one appears in both, and "is this unit currently
//! failed?" must be answered by absence from the completed list.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserializer, Serializer, de::DeserializeOwned};

use crate::{
    async_utils::io::{read_json_if_exists, write_json_atomic},
    pipeline::executor::Checkpoint,
    prelude::*,
};

/// The terminal state of one unit in one run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

/// In-memory completion state that the executor consults and updates.
pub trait Ledger: Send + Sync {
    /// The key identifying a unit.
    type Key;

    /// Has this unit already completed, in this run or an earlier one?
    fn is_completed(&self, key: &Self::Key) -> bool;

    /// Record a terminal outcome. Completions are idempotent. Failures are
    /// appended.
    fn record_outcome(&mut self, key: &Self::Key, outcome: &Outcome);

    /// How many distinct units have completed.
    fn completed_count(&self) -> usize;
}

/// A [`Ledger`] that is persisted as one file per volume.
pub trait StageManifest: Ledger + Serialize + DeserializeOwned + 'static {
    /// File name inside the volume directory.
    const FILE_NAME: &'static str;

    /// A fresh manifest with nothing done.
    fn for_volume(volume_id: &str) -> Self;

    /// The volume this manifest belongs to.
    fn volume_id(&self) -> &str;

    /// Used to repair manifests written without a volume ID.
    fn set_volume_id(&mut self, volume_id: &str);
}

/// Identifies one page unit.
///
/// Serialized as a bare JSON number for the flat layout and as the string
/// `"<doc_id>/<page>"` for the per-document layout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitKey {
    Page(u32),
    DocumentPage { doc_id: String, page: u32 },
}

impl UnitKey {
    /// The page number, whatever the layout.
    pub fn page(&self) -> u32 {
        match self {
            UnitKey::Page(page) | UnitKey::DocumentPage { page, .. } => *page,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Page(page) => write!(f, "{page}"),
            UnitKey::DocumentPage { doc_id, page } => write!(f, "{doc_id}/{page}"),
        }
    }
}

impl FromStr for UnitKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(page) = s.parse::<u32>() {
            return Ok(UnitKey::Page(page));
        }
        let (doc_id, page) = s
            .rsplit_once('/')
            .ok_or_else(|| anyhow!("invalid unit key: {:?}", s))?;
        let page = page
            .parse::<u32>()
            .with_context(|| format!("invalid page number in unit key: {:?}", s))?;
        if doc_id.is_empty() {
            return Err(anyhow!("missing document ID in unit key: {:?}", s));
        }
        Ok(UnitKey::DocumentPage {
            doc_id: doc_id.to_owned(),
            page,
        })
    }
}

impl Serialize for UnitKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UnitKey::Page(page) => serializer.serialize_u32(*page),
            UnitKey::DocumentPage { .. } => serializer.collect_str(self),
        }
    }
}

impl<'de> Deserialize<'de> for UnitKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawKey {
            Number(u32),
            Text(String),
        }

        match RawKey::deserialize(deserializer)? {
            RawKey::Number(page) => Ok(UnitKey::Page(page)),
            RawKey::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// A failed document in the download manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDoc {
    pub doc: String,
    pub error: String,
}

/// Download-stage manifest, stored as `manifest.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadManifest {
    #[serde(default)]
    pub volume_id: String,

    #[serde(default)]
    pub total_documents: usize,

    /// The document list frozen by the first run. Later runs reuse it so unit
    /// order and keys stay stable.
    #[serde(default)]
    pub doc_ids: Vec<String>,

    #[serde(default, alias = "downloaded_pdfs")]
    pub downloaded_docs: Vec<String>,

    #[serde(default)]
    pub failed_docs: Vec<FailedDoc>,
}

impl Ledger for DownloadManifest {
    type Key = String;

    fn is_completed(&self, key: &String) -> bool {
        self.downloaded_docs.contains(key)
    }

    fn record_outcome(&mut self, key: &String, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => {
                if !self.is_completed(key) {
                    self.downloaded_docs.push(key.clone());
                }
            }
            Outcome::Failed(error) => self.failed_docs.push(FailedDoc {
                doc: key.clone(),
                error: error.clone(),
            }),
        }
    }

    fn completed_count(&self) -> usize {
        self.downloaded_docs.len()
    }
}

impl StageManifest for DownloadManifest {
    const FILE_NAME: &'static str = "manifest.json";

    fn for_volume(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_owned(),
            ..Self::default()
        }
    }

    fn volume_id(&self) -> &str {
        &self.volume_id
    }

    fn set_volume_id(&mut self, volume_id: &str) {
        self.volume_id = volume_id.to_owned();
    }
}

/// A failed page in the OCR manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedPage {
    pub page: UnitKey,
    pub error: String,
}

/// The page numbers belonging to one document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRange {
    pub start_page: u32,
    pub end_page: u32,
    pub num_pages: u32,
}

impl PageRange {
    /// Map a document-relative page number onto continuous volume numbering.
    /// Hand-edited ranges that would run past `u32::MAX` map to nothing.
    pub fn volume_page(&self, doc_page: u32) -> Option<u32> {
        if doc_page == 0 || doc_page > self.num_pages {
            return None;
        }
        self.start_page.checked_add(doc_page - 1)
    }
}

/// OCR-stage manifest, stored as `ocr_manifest.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrManifest {
    #[serde(default)]
    pub volume_id: String,

    #[serde(default)]
    pub total_pages: usize,

    #[serde(default)]
    pub completed_pages: Vec<UnitKey>,

    #[serde(default)]
    pub failed_pages: Vec<FailedPage>,

    #[serde(default)]
    pub doc_page_map: BTreeMap<String, PageRange>,
}

impl Ledger for OcrManifest {
    type Key = UnitKey;

    fn is_completed(&self, key: &UnitKey) -> bool {
        self.completed_pages.contains(key)
    }

    fn record_outcome(&mut self, key: &UnitKey, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => {
                if !self.is_completed(key) {
                    self.completed_pages.push(key.clone());
                }
            }
            Outcome::Failed(error) => self.failed_pages.push(FailedPage {
                page: key.clone(),
                error: error.clone(),
            }),
        }
    }

    fn completed_count(&self) -> usize {
        self.completed_pages.len()
    }
}

impl StageManifest for OcrManifest {
    const FILE_NAME: &'static str = "ocr_manifest.json";

    fn for_volume(volume_id: &str) -> Self {
        Self {
            volume_id: volume_id.to_owned(),
            ..Self::default()
        }
    }

    fn volume_id(&self) -> &str {
        &self.volume_id
    }

    fn set_volume_id(&mut self, volume_id: &str) {
        self.volume_id = volume_id.to_owned();
    }
}

/// A ledger that lives only for one run. Used for sub-units, such as the
/// page images of one document, whose progress is not worth persisting.
#[derive(Debug)]
pub struct MemoryLedger<K> {
    completed: Vec<K>,
    failed: Vec<(K, String)>,
}

impl<K> Default for MemoryLedger<K> {
    fn default() -> Self {
        Self {
            completed: vec![],
            failed: vec![],
        }
    }
}

impl<K> MemoryLedger<K> {
    /// Every failure recorded so far.
    pub fn failures(&self) -> &[(K, String)] {
        &self.failed
    }
}

impl<K> Ledger for MemoryLedger<K>
where
    K: Clone + PartialEq + Send + Sync,
{
    type Key = K;

    fn is_completed(&self, key: &K) -> bool {
        self.completed.contains(key)
    }

    fn record_outcome(&mut self, key: &K, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => {
                if !self.is_completed(key) {
                    self.completed.push(key.clone());
                }
            }
            Outcome::Failed(error) => self.failed.push((key.clone(), error.clone())),
        }
    }

    fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

/// Loads and saves stage manifests under a data directory, one subdirectory
/// per volume.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the manifest of type `M` for `volume_id` lives.
    pub fn path<M: StageManifest>(&self, volume_id: &str) -> PathBuf {
        self.root.join(volume_id).join(M::FILE_NAME)
    }

    /// Load a manifest. A missing file means nothing has been done yet.
    #[instrument(level = "debug", skip(self))]
    pub async fn load<M: StageManifest>(&self, volume_id: &str) -> Result<M> {
        let path = self.path::<M>(volume_id);
        match read_json_if_exists::<M>(&path).await? {
            Some(mut manifest) => {
                if manifest.volume_id().is_empty() {
                    manifest.set_volume_id(volume_id);
                }
                debug!(path = %path.display(), "loaded manifest");
                Ok(manifest)
            }
            None => Ok(M::for_volume(volume_id)),
        }
    }

    /// Atomically replace the stored manifest.
    pub async fn save<M: StageManifest>(&self, volume_id: &str, manifest: &M) -> Result<()> {
        write_json_atomic(&self.path::<M>(volume_id), manifest).await
    }

    /// A [`Checkpoint`] that saves to this store after every unit.
    pub fn checkpoint<'a>(&'a self, volume_id: &'a str) -> ManifestCheckpoint<'a> {
        ManifestCheckpoint {
            store: self,
            volume_id,
        }
    }
}

/// Persists a stage manifest through a [`ManifestStore`].
pub struct ManifestCheckpoint<'a> {
    store: &'a ManifestStore,
    volume_id: &'a str,
}

#[async_trait]
impl<M: StageManifest> Checkpoint<M> for ManifestCheckpoint<'_> {
    async fn persist(&self, ledger: &M) -> Result<()> {
        self.store.save(self.volume_id, ledger).await
    }
}

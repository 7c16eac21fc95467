//! Finding the work units for a volume.
//!
//! Page images live either directly under a root directory (`page_0001.jpg`,
//! the flat layout) or in one subdirectory per document
//! (`GALE_AAA111/page_0001.jpg`, the nested layout). The layout is decided
//! once per discovery pass and never mixed.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::fs;

use crate::{
    pipeline::manifest::{PageRange, UnitKey},
    prelude::*,
};

/// Matches page image file names and captures the page number.
static PAGE_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^page_(\d+)\.(?:jpe?g|png)$").expect("failed to compile regex")
});

/// The file name used for page `number` with extension `ext`.
pub fn page_file_name(number: u32, ext: &str) -> String {
    format!("page_{number:04}.{ext}")
}

/// Turn an archive document ID into something safe to use as a file or
/// directory name.
pub fn sanitize_doc_id(doc_id: &str) -> String {
    doc_id.replace('|', "_")
}

/// Where a unit sits within the layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitPlacement {
    Flat { number: u32 },
    Nested { parent_id: String, number: u32 },
}

/// One discovered page image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredUnit {
    pub path: PathBuf,
    pub placement: UnitPlacement,
}

impl DiscoveredUnit {
    pub fn number(&self) -> u32 {
        match &self.placement {
            UnitPlacement::Flat { number } | UnitPlacement::Nested { number, .. } => {
                *number
            }
        }
    }

    /// The document directory this unit belongs to, if any.
    pub fn parent_id(&self) -> Option<&str> {
        match &self.placement {
            UnitPlacement::Flat { .. } => None,
            UnitPlacement::Nested { parent_id, .. } => Some(parent_id),
        }
    }

    pub fn key(&self) -> UnitKey {
        match &self.placement {
            UnitPlacement::Flat { number } => UnitKey::Page(*number),
            UnitPlacement::Nested { parent_id, number } => UnitKey::DocumentPage {
                doc_id: parent_id.clone(),
                page: *number,
            },
        }
    }
}

/// Which layout a discovery pass found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitLayout {
    Flat,
    Nested,
}

/// The result of one discovery pass.
#[derive(Clone, Debug)]
pub struct Discovery {
    pub layout: UnitLayout,
    pub units: Vec<DiscoveredUnit>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Page ranges per document directory. Empty for the flat layout.
    pub fn page_ranges(&self) -> BTreeMap<String, PageRange> {
        let mut ranges = BTreeMap::<String, PageRange>::new();
        for unit in &self.units {
            let Some(parent_id) = unit.parent_id() else {
                continue;
            };
            let number = unit.number();
            ranges
                .entry(parent_id.to_owned())
                .and_modify(|range| {
                    range.start_page = range.start_page.min(number);
                    range.end_page = range.end_page.max(number);
                    range.num_pages += 1;
                })
                .or_insert(PageRange {
                    start_page: number,
                    end_page: number,
                    num_pages: 1,
                });
        }
        ranges
    }
}

/// Discover page units under `root`.
///
/// The nested layout wins if any subdirectory contains page images. An empty
/// directory yields an empty [`Discovery`]. A missing `root` is an error.
#[instrument(level = "debug", skip_all, fields(root = %root.display()))]
pub async fn discover_units(root: &Path) -> Result<Discovery> {
    let mut flat = vec![];
    let mut nested = vec![];

    for entry in read_dir_sorted(root).await? {
        match entry.kind {
            EntryKind::Dir => {
                let Some(parent_id) = file_name_str(&entry.path) else {
                    continue;
                };
                for child in read_dir_sorted(&entry.path).await? {
                    if let Some(number) = page_number(&child) {
                        nested.push(DiscoveredUnit {
                            path: child.path,
                            placement: UnitPlacement::Nested {
                                parent_id: parent_id.to_owned(),
                                number,
                            },
                        });
                    }
                }
            }
            EntryKind::File => {
                if let Some(number) = page_number(&entry) {
                    flat.push(DiscoveredUnit {
                        path: entry.path,
                        placement: UnitPlacement::Flat { number },
                    });
                }
            }
            EntryKind::Other => {}
        }
    }

    let (layout, mut units) = if nested.is_empty() {
        (UnitLayout::Flat, flat)
    } else {
        if !flat.is_empty() {
            warn!(
                count = flat.len(),
                "ignoring page images at the top level of a per-document layout"
            );
        }
        (UnitLayout::Nested, nested)
    };

    units.sort_by(|a, b| {
        (a.parent_id(), a.number(), &a.path).cmp(&(b.parent_id(), b.number(), &b.path))
    });
    units.dedup_by(|later, earlier| {
        let duplicate = later.key() == earlier.key();
        if duplicate {
            warn!(
                kept = %earlier.path.display(),
                ignored = %later.path.display(),
                "two images for the same page"
            );
        }
        duplicate
    });

    debug!(?layout, count = units.len(), "discovered units");
    Ok(Discovery { layout, units })
}

/// Pick the document list for the download stage. A non-empty list frozen in
/// the manifest wins over the configured list, so that keys and ordering stay
/// stable across restarts.
pub fn resolve_document_ids(frozen: &[String], configured: &[String]) -> Vec<String> {
    if frozen.is_empty() {
        configured.to_vec()
    } else {
        if frozen != configured {
            info!(
                frozen = frozen.len(),
                configured = configured.len(),
                "using the document list recorded in the manifest"
            );
        }
        frozen.to_vec()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Other,
}

/// A directory entry, with symlinks resolved to what they point at.
#[derive(Debug)]
struct Entry {
    path: PathBuf,
    kind: EntryKind,
}

async fn read_dir_sorted(dir: &Path) -> Result<Vec<Entry>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?;
    let mut found = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry.path();
        let mut file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed to stat {}", path.display()))?;
        if file_type.is_symlink() {
            match fs::metadata(&path).await {
                Ok(metadata) => file_type = metadata.file_type(),
                Err(err) => {
                    debug!(path = %path.display(), %err, "skipping broken symlink");
                    continue;
                }
            }
        }
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        found.push(Entry { path, kind });
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

fn file_name_str(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn page_number(entry: &Entry) -> Option<u32> {
    if entry.kind != EntryKind::File {
        return None;
    }
    let captures = PAGE_FILE_REGEX.captures(file_name_str(&entry.path)?)?;
    captures[1].parse().ok()
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn flat_layout_uses_bare_page_numbers() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "page_0002.jpg");
        touch(dir.path(), "page_0001.jpg");
        touch(dir.path(), "page_0010.png");
        touch(dir.path(), "notes.txt");

        let discovery = discover_units(dir.path()).await.unwrap();
        assert_eq!(discovery.layout, UnitLayout::Flat);
        let keys = discovery.units.iter().map(|u| u.key()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![UnitKey::Page(1), UnitKey::Page(2), UnitKey::Page(10)]
        );
        assert!(discovery.page_ranges().is_empty());
    }

    #[tokio::test]
    async fn nested_layout_wins_and_is_never_mixed() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "GALE_B/page_0002.jpg");
        touch(dir.path(), "GALE_B/page_0001.jpg");
        touch(dir.path(), "GALE_A/page_0003.jpg");
        touch(dir.path(), "page_0001.jpg");
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let discovery = discover_units(dir.path()).await.unwrap();
        assert_eq!(discovery.layout, UnitLayout::Nested);
        let keys = discovery
            .units
            .iter()
            .map(|u| u.key().to_string())
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["GALE_A/3", "GALE_B/1", "GALE_B/2"]);

        let ranges = discovery.page_ranges();
        assert_eq!(
            ranges["GALE_B"],
            PageRange {
                start_page: 1,
                end_page: 2,
                num_pages: 2
            }
        );
    }

    #[tokio::test]
    async fn rediscovery_is_stable() {
        let dir = TempDir::new().unwrap();
        for doc in ["C", "A", "B"] {
            for page in [3, 1, 2] {
                touch(dir.path(), &format!("{doc}/page_{page:04}.jpg"));
            }
        }
        let first = discover_units(dir.path()).await.unwrap().units;
        let second = discover_units(dir.path()).await.unwrap().units;
        assert_eq!(first, second);
        assert_eq!(first[0].key().to_string(), "A/1");
        assert_eq!(first[8].key().to_string(), "C/3");
    }

    #[tokio::test]
    async fn empty_root_is_nothing_to_do_but_missing_root_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(discover_units(dir.path()).await.unwrap().is_empty());
        assert!(discover_units(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn only_regular_files_count_as_pages() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "GALE_A/page_0001.jpg");
        std::fs::create_dir_all(dir.path().join("GALE_A/page_0002.jpg")).unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                dir.path().join("GALE_A/page_0001.jpg"),
                dir.path().join("GALE_A/page_0003.jpg"),
            )
            .unwrap();
            std::os::unix::fs::symlink(
                dir.path().join("missing.jpg"),
                dir.path().join("GALE_A/page_0004.jpg"),
            )
            .unwrap();
        }

        let discovery = discover_units(dir.path()).await.unwrap();
        let keys = discovery
            .units
            .iter()
            .map(|u| u.key().to_string())
            .collect::<Vec<_>>();
        #[cfg(unix)]
        assert_eq!(keys, vec!["GALE_A/1", "GALE_A/3"]);
        #[cfg(not(unix))]
        assert_eq!(keys, vec!["GALE_A/1"]);
    }

    #[test]
    fn frozen_document_list_wins() {
        let configured = vec!["A".to_owned(), "B".to_owned(), "C".to_owned()];
        let frozen = vec!["B".to_owned(), "A".to_owned()];
        assert_eq!(resolve_document_ids(&frozen, &configured), frozen);
        assert_eq!(resolve_document_ids(&[], &configured), configured);
    }

    #[test]
    fn doc_ids_are_sanitized_for_paths() {
        assert_eq!(sanitize_doc_id("GALE|AAA111"), "GALE_AAA111");
        assert_eq!(page_file_name(7, "jpg"), "page_0007.jpg");
    }
}

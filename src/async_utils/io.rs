//! File I/O helpers.
//!
//! Everything the pipeline persists (manifests, page images, PDFs, OCR
//! output) goes through [`write_bytes_atomic`], so a crash or a concurrent
//! reader never sees a half-written file.

use std::ffi::OsString;

use serde::de::DeserializeOwned;
use tokio::fs;

use crate::prelude::*;

/// Read and parse a JSON file.
pub async fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))
}

/// Read and parse a JSON file, returning `None` if it does not exist.
pub async fn read_json_if_exists<T>(path: &Path) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    if fs::try_exists(path)
        .await
        .with_context(|| format!("failed to check for {}", path.display()))?
    {
        Ok(Some(read_json(path).await?))
    } else {
        Ok(None)
    }
}

/// Serialize `value` as pretty-printed JSON and write it atomically.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    write_bytes_atomic(path, &json).await
}

/// Write `data` to `<path>.tmp`, then rename it over `path`. Parent
/// directories are created as needed.
pub async fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp_path = temp_path_for(path);
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err)
            .with_context(|| format!("failed to move file into {}", path.display()));
    }
    Ok(())
}

/// The size of the file at `path`, or `None` if it does not exist.
pub async fn file_size(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path).await {
        Ok(metadata) => Ok(Some(metadata.len())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to stat {}", path.display()))
        }
    }
}

/// `page_0001.jpg` becomes `page_0001.jpg.tmp`.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("unnamed"));
    name.push(".tmp");
    path.with_file_name(name)
}

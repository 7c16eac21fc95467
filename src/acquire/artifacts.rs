//! Checking and storing downloaded files.
//!
//! The archive answers an expired session or an unrendered page with a tiny
//! placeholder rather than an error status, so every payload must clear a
//! size floor and look like the file type we asked for before it is stored.

use crate::{
    acquire::source::Payload,
    async_utils::io::{file_size, write_bytes_atomic},
    pipeline::discovery::{page_file_name, sanitize_doc_id},
    prelude::*,
};

/// Extensions we may have stored a page image under.
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "png"];

/// Directory layout for one volume.
#[derive(Clone, Debug)]
pub struct VolumeLayout {
    root: PathBuf,
}

impl VolumeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn document_images_dir(&self, doc_id: &str) -> PathBuf {
        self.images_dir().join(sanitize_doc_id(doc_id))
    }

    pub fn text_dir(&self) -> PathBuf {
        self.root.join("text")
    }

    pub fn baseline_text_path(&self, doc_id: &str) -> PathBuf {
        self.text_dir()
            .join(format!("{}.txt", sanitize_doc_id(doc_id)))
    }

    pub fn pdf_path(&self, doc_id: &str) -> PathBuf {
        self.root
            .join("documents")
            .join(format!("{}.pdf", sanitize_doc_id(doc_id)))
    }

    pub fn ocr_dir(&self) -> PathBuf {
        self.root.join("ocr")
    }
}

/// Return an already downloaded page image, if one exists and is big
/// enough to be real.
pub async fn cached_page_image(
    dir: &Path,
    page_num: u32,
    min_bytes: u64,
) -> Result<Option<PathBuf>> {
    for ext in IMAGE_EXTENSIONS {
        let path = dir.join(page_file_name(page_num, ext));
        if let Some(size) = file_size(&path).await? {
            if size >= min_bytes {
                return Ok(Some(path));
            }
            debug!(path = %path.display(), size, "ignoring undersized cached image");
        }
    }
    Ok(None)
}

/// Check that `payload` is a real page image, returning the file extension
/// to store it under.
pub fn check_image_payload(payload: &Payload, min_bytes: u64) -> Result<&'static str> {
    let size = payload.bytes.len() as u64;
    if size < min_bytes {
        return Err(anyhow!(
            "page image is only {} bytes, probably a placeholder",
            size
        ));
    }
    match infer::get(&payload.bytes) {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Image => {
            Ok(match kind.extension() {
                "png" => "png",
                _ => "jpg",
            })
        }
        _ => Err(anyhow!(
            "page download is not an image (Content-Type: {})",
            payload.content_type.as_deref().unwrap_or("unknown")
        )),
    }
}

/// Check that `payload` is a real PDF.
pub fn check_pdf_payload(payload: &Payload, min_bytes: u64) -> Result<()> {
    let size = payload.bytes.len() as u64;
    if !infer::archive::is_pdf(&payload.bytes) {
        return Err(anyhow!(
            "PDF download has no PDF signature (Content-Type: {})",
            payload.content_type.as_deref().unwrap_or("unknown")
        ));
    }
    if size < min_bytes {
        return Err(anyhow!("PDF is only {} bytes, likely a disclaimer", size));
    }
    Ok(())
}

/// Store a page image that passed [`check_image_payload`].
pub async fn store_page_image(
    dir: &Path,
    page_num: u32,
    ext: &str,
    payload: &Payload,
) -> Result<PathBuf> {
    let path = dir.join(page_file_name(page_num, ext));
    write_bytes_atomic(&path, &payload.bytes).await?;
    debug!(
        path = %path.display(),
        kb = payload.bytes.len() as f64 / 1024.0,
        "saved page image"
    );
    Ok(path)
}

#[cfg(test)]
pub(crate) mod tests {
    use tempfile::TempDir;

    use super::*;

    /// A minimal JPEG header padded out to `len` bytes.
    pub(crate) fn jpeg(len: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
        bytes.resize(len.max(4), 0);
        bytes
    }

    pub(crate) fn pdf(len: usize) -> Vec<u8> {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.resize(len.max(9), b' ');
        bytes
    }

    fn payload(bytes: Vec<u8>) -> Payload {
        Payload {
            bytes,
            content_type: None,
        }
    }

    #[test]
    fn undersized_images_are_rejected() {
        assert!(check_image_payload(&payload(jpeg(999)), 1000).is_err());
        assert_eq!(check_image_payload(&payload(jpeg(1000)), 1000).unwrap(), "jpg");
    }

    #[test]
    fn html_is_not_an_image() {
        let html = format!("<html>{}</html>", "x".repeat(2000)).into_bytes();
        assert!(check_image_payload(&payload(html), 1000).is_err());
    }

    #[test]
    fn pdfs_need_a_signature_and_a_minimum_size() {
        assert!(check_pdf_payload(&payload(pdf(6000)), 5000).is_ok());
        assert!(check_pdf_payload(&payload(pdf(4000)), 5000).is_err());
        assert!(check_pdf_payload(&payload(vec![b'x'; 6000]), 5000).is_err());
    }

    #[tokio::test]
    async fn only_big_enough_files_count_as_cached() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page_0001.jpg"), jpeg(10)).unwrap();
        std::fs::write(dir.path().join("page_0002.png"), jpeg(2000)).unwrap();
        assert_eq!(cached_page_image(dir.path(), 1, 1000).await.unwrap(), None);
        assert_eq!(
            cached_page_image(dir.path(), 2, 1000).await.unwrap(),
            Some(dir.path().join("page_0002.png"))
        );
        assert_eq!(cached_page_image(dir.path(), 3, 1000).await.unwrap(), None);
    }

    #[test]
    fn layout_uses_sanitized_ids() {
        let layout = VolumeLayout::new("/data/V1");
        assert_eq!(
            layout.document_images_dir("GALE|A"),
            PathBuf::from("/data/V1/images/GALE_A")
        );
        assert_eq!(
            layout.pdf_path("GALE|A"),
            PathBuf::from("/data/V1/documents/GALE_A.pdf")
        );
    }
}

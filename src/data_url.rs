//! Turning page images into `data:` URLs for vision models.

use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::prelude::*;

/// Encode binary data as a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    // Gemini rejects percent-encoded Base64, so we send it raw.
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(data))
}

/// Work out an image's MIME type, trusting its magic bytes over its name.
pub fn image_mime_type(path: &Path, data: &[u8]) -> Result<String> {
    if let Some(kind) = infer::get(data) {
        if kind.matcher_type() == infer::MatcherType::Image {
            return Ok(kind.mime_type().to_owned());
        }
    }
    let guess = mime_guess::from_path(path).first_raw();
    match guess {
        Some(mime_type) if mime_type.starts_with("image/") => Ok(mime_type.to_owned()),
        _ => Err(anyhow!("{} does not look like an image", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_base64_without_escaping() {
        assert_eq!(data_url("image/png", b"\xff\xfe?"), "data:image/png;base64,//4/");
    }

    #[test]
    fn sniffs_content_before_extension() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0, 0];
        assert_eq!(
            image_mime_type(Path::new("page_0001.png"), &jpeg).unwrap(),
            "image/jpeg"
        );
        assert_eq!(
            image_mime_type(Path::new("page_0001.png"), b"????").unwrap(),
            "image/png"
        );
        assert!(image_mime_type(Path::new("page_0001.txt"), b"????").is_err());
    }
}

use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::Engine;

/// Upper bound for avatar images.
pub const MAX_AVATAR_BYTES: u64 = 5 * 1024 * 1024;

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "webm" => "audio/webm",
        "ogg" | "oga" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        _ => return None,
    };
    Some(mime)
}

pub fn to_data_uri(mime: &str, bytes: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", mime, b64)
}

/// Read an image file into a `data:` URI, optionally capped in size.
pub async fn read_image(path: &Path, max_bytes: Option<u64>) -> Result<String> {
    let mime = match mime_for_path(path) {
        Some(m) if m.starts_with("image/") => m,
        _ => bail!("Please select an image file: {}", path.display()),
    };

    if let Some(max) = max_bytes {
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if meta.len() > max {
            bail!("Image must be less than {}MB", max / (1024 * 1024));
        }
    }

    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read image file {}", path.display()))?;
    Ok(to_data_uri(mime, &data))
}

/// Read an audio recording as plain base64, the shape the transcription
/// function expects.
pub async fn read_audio_base64(path: &Path) -> Result<String> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read audio file {}", path.display()))?;
    if data.is_empty() {
        bail!("Audio file is empty: {}", path.display());
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_image_as_data_uri() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.PNG");
        tokio::fs::write(&path, [1u8, 2, 3]).await.unwrap();
        let uri = read_image(&path, None).await.unwrap();
        assert_eq!(uri, "data:image/png;base64,AQID");
    }

    #[tokio::test]
    async fn test_rejects_non_images_and_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("notes.txt");
        tokio::fs::write(&text, b"hi").await.unwrap();
        assert!(read_image(&text, None).await.is_err());

        let big = dir.path().join("big.jpg");
        tokio::fs::write(&big, vec![0u8; 2048]).await.unwrap();
        assert!(read_image(&big, Some(1024)).await.is_err());
        assert!(read_image(&big, Some(4096)).await.is_ok());
    }

    #[tokio::test]
    async fn test_audio_is_plain_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.webm");
        tokio::fs::write(&path, b"abc").await.unwrap();
        assert_eq!(read_audio_base64(&path).await.unwrap(), "YWJj");
    }
}

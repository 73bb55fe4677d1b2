use anyhow::{Context, Result};
use image::DynamicImage;

/// Upload extensions accepted by the prediction endpoint
pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp"];

/// Whether a filename carries one of the accepted image extensions.
///
/// Names without an extension are rejected; the check is case-insensitive.
pub fn has_allowed_extension(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => {
            let ext = ext.to_ascii_lowercase();
            ALLOWED_EXTENSIONS.contains(&ext.as_str())
        }
        None => false,
    }
}

/// Decode image bytes on the blocking pool.
///
/// Decoding a large upload is CPU-bound and must not stall the async runtime.
pub async fn decode_image_async(bytes: Vec<u8>) -> Result<DynamicImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes).context("Failed to decode image")
    })
    .await
    .context("Failed to spawn blocking task for image decoding")?
}

/// Encode an image to PNG bytes (test uploads)
#[cfg(test)]
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut png_bytes = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut png_bytes);
    img.write_to(&mut cursor, image::ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(png_bytes)
}

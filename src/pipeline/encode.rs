//! Image encoding: rendered page ↔ PNG bytes ↔ base64 `ImageData`.
//!
//! Render stores each page as PNG in the temp scope; Parse reads those bytes
//! back and wraps them for the multimodal request body. PNG is lossless, and
//! text crispness matters far more than file size for OCR accuracy on scans.
//! `detail: "high"` lets GPT-4-class models tile the page instead of looking
//! at a single downscaled overview.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// PNG-encode a rasterised page.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Wrap stored PNG bytes for the VLM API.
pub fn image_data(png: &[u8]) -> ImageData {
    let b64 = STANDARD.encode(png);
    debug!("Encoded page → {} bytes base64", b64.len());
    ImageData::new(b64, "image/png").with_detail("high")
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn png_round_trips_through_base64() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let png = png_bytes(&img).expect("encode should succeed");
        assert_eq!(&png[1..4], b"PNG");

        let data = image_data(&png);
        assert_eq!(data.mime_type, "image/png");
        assert_eq!(STANDARD.decode(&data.data).expect("valid base64"), png);
    }
}

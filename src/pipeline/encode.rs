//! Image encoding: `DynamicImage` → PNG or JPEG bytes on disk.
//!
//! PNG output is written as rendered. JPEG has no alpha channel, so pages
//! are flattened to RGB first and encoded at the configured quality.

use crate::config::ImageFormat;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use std::path::Path;
use tracing::debug;

/// Encode a rendered page in `format`. `jpeg_quality` is ignored for PNG.
pub fn encode_image(
    img: &DynamicImage,
    format: ImageFormat,
    jpeg_quality: u8,
) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    match format {
        ImageFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        }
        ImageFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, jpeg_quality.clamp(1, 100));
            encoder.encode_image(&rgb)?;
        }
    }
    debug!(
        "Encoded {}x{} page → {} bytes {}",
        img.width(),
        img.height(),
        buf.len(),
        format
    );
    Ok(buf)
}

/// Encode `img` and write it to `target`. Returns the number of bytes written.
pub fn write_page_image(
    img: &DynamicImage,
    format: ImageFormat,
    jpeg_quality: u8,
    target: &Path,
) -> Result<u64, String> {
    let bytes = encode_image(img, format, jpeg_quality).map_err(|e| e.to_string())?;
    std::fs::write(target, &bytes).map_err(|e| format!("{}: {}", target.display(), e))?;
    Ok(bytes.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn red_square() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])))
    }

    #[test]
    fn encode_png_has_signature() {
        let data = encode_image(&red_square(), ImageFormat::Png, 80).unwrap();
        assert_eq!(&data[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn encode_jpeg_flattens_alpha() {
        let data = encode_image(&red_square(), ImageFormat::Jpeg, 50).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn write_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("page-1.png");
        let size = write_page_image(&red_square(), ImageFormat::Png, 80, &target).unwrap();
        assert_eq!(size, std::fs::metadata(&target).unwrap().len());
    }
}

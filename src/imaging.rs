//! JPEG codec and frame transforms.
//!
//! Thin wrappers over the `image` crate so the rest of the crate deals in
//! `DynamicImage` and JPEG bytes only.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

/// Quality used for streamed frames.
pub const STREAM_QUALITY: u8 = 80;
/// Quality used for capture photos.
pub const CAPTURE_QUALITY: u8 = 95;

/// Decode JPEG bytes. Fails on malformed input.
pub fn decode_jpeg(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory_with_format(bytes, ImageFormat::Jpeg).context("decode jpeg")
}

/// Encode an image as baseline JPEG at `quality` (1..=100).
pub fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    if !(1..=100).contains(&quality) {
        return Err(anyhow!("jpeg quality must be within 1..=100, got {}", quality));
    }
    let rgb = image.to_rgb8();
    let mut out = Vec::with_capacity(rgb.as_raw().len() / 8);
    let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
    encoder.encode_image(&rgb).context("encode jpeg")?;
    if out.is_empty() {
        return Err(anyhow!("jpeg encoder produced no data"));
    }
    Ok(out)
}

/// Flip both axes (a 180 degree rotation).
pub fn flip180(image: &DynamicImage) -> DynamicImage {
    image.rotate180()
}

/// Flip, then encode. The path every outbound protocol frame takes.
pub fn flip_and_encode(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    encode_jpeg(&flip180(image), quality)
}

/// Moving diagonal gradient used by the synthetic source and in tests.
pub fn test_pattern(width: u32, height: u32, phase: u64) -> DynamicImage {
    let shift = (phase % 256) as u32;
    let image = RgbImage::from_fn(width.max(1), height.max(1), |x, y| {
        Rgb([
            ((x + shift) % 256) as u8,
            ((y + shift) % 256) as u8,
            ((x + y) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::{EOI, SOI};
    use image::GenericImageView;

    #[test]
    fn encode_produces_marker_delimited_jpeg() {
        let jpeg = encode_jpeg(&test_pattern(32, 16, 0), STREAM_QUALITY).unwrap();
        assert_eq!(&jpeg[..2], &SOI);
        assert_eq!(&jpeg[jpeg.len() - 2..], &EOI);
        let decoded = decode_jpeg(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (32, 16));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_jpeg(&[0xFF, 0xD8, 0x00, 0x01, 0xFF, 0xD9]).is_err());
        assert!(decode_jpeg(b"not a jpeg").is_err());
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let image = test_pattern(4, 4, 0);
        assert!(encode_jpeg(&image, 0).is_err());
        assert!(encode_jpeg(&image, 101).is_err());
    }

    #[test]
    fn flip180_moves_corners() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        let flipped = flip180(&DynamicImage::ImageRgb8(image)).to_rgb8();
        assert_eq!(flipped.get_pixel(2, 1), &Rgb([255, 0, 0]));
        assert_eq!(flipped.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn higher_quality_is_larger() {
        let image = test_pattern(64, 64, 3);
        let low = encode_jpeg(&image, 20).unwrap();
        let high = encode_jpeg(&image, CAPTURE_QUALITY).unwrap();
        assert!(high.len() > low.len());
    }
}

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageDecoder, ImageReader, Rgb, RgbImage};
use serde::Serialize;
use tracing::debug;

use crate::config::NormalizeSettings;
use crate::error::PipelineError;

/// Media type of every normalized payload, whatever the input format was.
pub const NORMALIZED_MEDIA_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedImage {
    pub media_type: String,
    /// Base64 (standard alphabet, padded) JPEG bytes.
    #[serde(skip_serializing)]
    pub encoded: String,
    pub width: u32,
    pub height: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub byte_len: usize,
}

impl NormalizedImage {
    pub fn jpeg_bytes(&self) -> Result<Vec<u8>, PipelineError> {
        STANDARD
            .decode(&self.encoded)
            .map_err(|err| PipelineError::Decode(format!("invalid base64 payload: {err}")))
    }
}

/// Scale `(width, height)` so the longer edge equals `max_edge`, keeping the aspect
/// ratio. Images already within the cap are returned unchanged.
pub fn fit_dimensions(width: u32, height: u32, max_edge: u32) -> (u32, u32) {
    let max_edge = max_edge.max(1);
    if width == 0 || height == 0 {
        return (width.max(1), height.max(1));
    }
    if width <= max_edge && height <= max_edge {
        return (width, height);
    }

    let scale = f64::from(max_edge) / f64::from(width.max(height));
    let scaled = |edge: u32| ((f64::from(edge) * scale).round() as u32).clamp(1, max_edge);
    if width >= height {
        (max_edge, scaled(height))
    } else {
        (scaled(width), max_edge)
    }
}

/// Decode, downsample and re-encode one picked file.
pub fn normalize_image(
    raw: &[u8],
    settings: &NormalizeSettings,
) -> Result<NormalizedImage, PipelineError> {
    if raw.is_empty() {
        return Err(PipelineError::Decode("file is empty".to_string()));
    }

    let decoded = decode_oriented(raw)?;
    let (source_width, source_height) = decoded.dimensions();
    if source_width == 0 || source_height == 0 {
        return Err(PipelineError::Decode("image has no pixels".to_string()));
    }

    let (width, height) = fit_dimensions(source_width, source_height, settings.max_edge);
    let surface = if (width, height) == (source_width, source_height) {
        flatten_onto_white(&decoded)
    } else {
        flatten_onto_white(&decoded.resize_exact(width, height, FilterType::Lanczos3))
    };
    drop(decoded);

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, settings.jpeg_quality)
        .encode_image(&surface)
        .map_err(|err| PipelineError::Decode(format!("jpeg encoding failed: {err}")))?;
    drop(surface);

    debug!(
        source_width,
        source_height,
        width,
        height,
        input_bytes = raw.len(),
        output_bytes = jpeg.len(),
        "normalized image"
    );

    Ok(NormalizedImage {
        media_type: NORMALIZED_MEDIA_TYPE.to_string(),
        encoded: STANDARD.encode(&jpeg),
        width,
        height,
        source_width,
        source_height,
        byte_len: jpeg.len(),
    })
}

pub async fn normalize_image_async(
    raw: Vec<u8>,
    settings: NormalizeSettings,
) -> Result<NormalizedImage, PipelineError> {
    tokio::task::spawn_blocking(move || normalize_image(&raw, &settings))
        .await
        .map_err(|err| PipelineError::Decode(format!("normalization task failed: {err}")))?
}

fn decode_oriented(raw: &[u8]) -> Result<DynamicImage, PipelineError> {
    let reader = ImageReader::new(Cursor::new(raw))
        .with_guessed_format()
        .map_err(|err| PipelineError::Decode(err.to_string()))?;
    if reader.format().is_none() {
        return Err(PipelineError::Decode("unrecognized image format".to_string()));
    }

    let mut decoder = reader
        .into_decoder()
        .map_err(|err| PipelineError::Decode(err.to_string()))?;
    // Phone cameras store rotation in EXIF rather than in the pixels.
    let orientation = decoder.orientation().ok();
    let mut image =
        DynamicImage::from_decoder(decoder).map_err(|err| PipelineError::Decode(err.to_string()))?;
    if let Some(orientation) = orientation {
        image.apply_orientation(orientation);
    }
    Ok(image)
}

fn flatten_onto_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = u16::from(a);
        let blend = |c: u8| ((u16::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        out.put_pixel(x, y, Rgb([blend(r), blend(g), blend(b)]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        cursor.into_inner()
    }

    fn decode_jpeg(normalized: &NormalizedImage) -> DynamicImage {
        let bytes = normalized.jpeg_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8], "payload should be a bare JPEG stream");
        image::load_from_memory_with_format(&bytes, ImageFormat::Jpeg).unwrap()
    }

    #[test]
    fn fit_keeps_images_within_cap() {
        assert_eq!(fit_dimensions(800, 600, 1024), (800, 600));
        assert_eq!(fit_dimensions(1024, 1024, 1024), (1024, 1024));
        assert_eq!(fit_dimensions(1, 1, 1024), (1, 1));
    }

    #[test]
    fn fit_scales_longer_edge_to_cap() {
        assert_eq!(fit_dimensions(4032, 3024, 1024), (1024, 768));
        assert_eq!(fit_dimensions(3024, 4032, 1024), (768, 1024));
        assert_eq!(fit_dimensions(2048, 2048, 1024), (1024, 1024));
    }

    #[test]
    fn fit_preserves_aspect_ratio_within_rounding() {
        let (w, h) = fit_dimensions(3000, 1999, 1024);
        assert_eq!(w, 1024);
        let expected = 1999.0 * 1024.0 / 3000.0;
        assert!((f64::from(h) - expected).abs() <= 0.5, "got {h}, expected ~{expected}");
    }

    #[test]
    fn fit_never_collapses_thin_images() {
        assert_eq!(fit_dimensions(10_000, 2, 1024), (1024, 1));
    }

    #[test]
    fn small_image_is_not_upscaled() {
        let out = normalize_image(&png_bytes(320, 200), &NormalizeSettings::default()).unwrap();
        assert_eq!((out.width, out.height), (320, 200));
        assert_eq!((out.source_width, out.source_height), (320, 200));
        assert_eq!(decode_jpeg(&out).dimensions(), (320, 200));
    }

    #[test]
    fn large_image_is_downsampled_to_cap() {
        let out = normalize_image(&png_bytes(2000, 1000), &NormalizeSettings::default()).unwrap();
        assert_eq!((out.width, out.height), (1024, 512));
        assert_eq!(decode_jpeg(&out).dimensions(), (1024, 512));
    }

    fn encoded_as(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
        let rgb = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 90])
        });
        let img = if format == ImageFormat::Jpeg {
            DynamicImage::ImageRgb8(rgb)
        } else {
            DynamicImage::ImageRgba8(DynamicImage::ImageRgb8(rgb).to_rgba8())
        };
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, format).unwrap();
        cursor.into_inner()
    }

    /// JPEG carrying an EXIF APP1 segment with the given orientation tag.
    fn jpeg_with_orientation(width: u32, height: u32, orientation: u8) -> Vec<u8> {
        let plain = encoded_as(ImageFormat::Jpeg, width, height);
        let mut exif = b"Exif\0\0II\x2a\0\x08\0\0\0".to_vec();
        exif.extend_from_slice(&[1, 0]);
        exif.extend_from_slice(&[0x12, 0x01, 3, 0, 1, 0, 0, 0, orientation, 0, 0, 0]);
        exif.extend_from_slice(&[0, 0, 0, 0]);
        let segment_len = (exif.len() + 2) as u16;

        let mut out = plain[..2].to_vec();
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&segment_len.to_be_bytes());
        out.extend_from_slice(&exif);
        out.extend_from_slice(&plain[2..]);
        out
    }

    #[test]
    fn output_is_always_jpeg() {
        let out = normalize_image(&png_bytes(64, 64), &NormalizeSettings::new(32, 80)).unwrap();
        assert_eq!(out.media_type, NORMALIZED_MEDIA_TYPE);
        assert!(!out.encoded.is_empty());
        assert!(!out.encoded.starts_with("data:"));
        assert_eq!(out.jpeg_bytes().unwrap().len(), out.byte_len);
    }

    #[test]
    fn every_supported_input_format_becomes_jpeg() {
        for format in [ImageFormat::Jpeg, ImageFormat::Gif, ImageFormat::WebP, ImageFormat::Png] {
            let raw = encoded_as(format, 1500, 700);
            let out = normalize_image(&raw, &NormalizeSettings::default())
                .unwrap_or_else(|err| panic!("{format:?}: {err}"));
            assert_eq!(out.media_type, "image/jpeg", "{format:?}");
            assert_eq!((out.width, out.height), (1024, 478), "{format:?}");
            assert_eq!(decode_jpeg(&out).dimensions(), (1024, 478), "{format:?}");
        }
    }

    #[test]
    fn exif_rotation_is_applied_before_resizing() {
        let raw = jpeg_with_orientation(40, 20, 6);
        let out = normalize_image(&raw, &NormalizeSettings::default()).unwrap();
        assert_eq!((out.source_width, out.source_height), (20, 40));
        assert_eq!(decode_jpeg(&out).dimensions(), (20, 40));

        let upright = normalize_image(&jpeg_with_orientation(40, 20, 1), &NormalizeSettings::default())
            .unwrap();
        assert_eq!((upright.width, upright.height), (40, 20));
    }

    #[test]
    fn lower_quality_gives_smaller_payload() {
        let raw = png_bytes(400, 400);
        let high = normalize_image(&raw, &NormalizeSettings::new(1024, 95)).unwrap();
        let low = normalize_image(&raw, &NormalizeSettings::new(1024, 20)).unwrap();
        assert!(low.byte_len < high.byte_len);
    }

    #[test]
    fn output_size_is_stable_across_runs() {
        let raw = png_bytes(300, 500);
        let settings = NormalizeSettings::default();
        let first = normalize_image(&raw, &settings).unwrap();
        let second = normalize_image(&raw, &settings).unwrap();
        assert_eq!(first.byte_len, second.byte_len);
    }

    #[test]
    fn transparent_pixels_become_white() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut cursor, ImageFormat::Png)
            .unwrap();
        let out = normalize_image(&cursor.into_inner(), &NormalizeSettings::new(1024, 100)).unwrap();
        let pixel = decode_jpeg(&out).to_rgb8().get_pixel(4, 4).0;
        assert!(pixel.iter().all(|c| *c > 240), "expected white, got {pixel:?}");
    }

    #[test]
    fn garbage_fails_with_decode_error() {
        let err = normalize_image(b"definitely not an image", &NormalizeSettings::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn empty_file_fails_with_decode_error() {
        let err = normalize_image(&[], &NormalizeSettings::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn truncated_png_fails_with_decode_error() {
        let raw = png_bytes(50, 50);
        let err = normalize_image(&raw[..raw.len() / 3], &NormalizeSettings::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[tokio::test]
    async fn async_variant_matches_blocking_variant() {
        let raw = png_bytes(1500, 900);
        let settings = NormalizeSettings::default();
        let out = normalize_image_async(raw.clone(), settings).await.unwrap();
        let expected = normalize_image(&raw, &settings).unwrap();
        assert_eq!((out.width, out.height), (expected.width, expected.height));
        assert_eq!(out.byte_len, expected.byte_len);
    }
}

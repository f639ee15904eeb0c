//! Image normalisation: decode an extracted payload, bound it to the
//! report's printable area, even out its contrast, and write it to a file.
//!
//! Failures here are image-local by contract: one undecodable image drops
//! out of its report while the rest of the attachment's set continues.
//!
//! ## Numeric semantics
//!
//! `scale = min(max_width / width, max_height / height)` clamped to at most
//! 1.0 — images are never upscaled. Output dimensions are
//! `floor(original × scale)`, aspect ratio preserved within rounding.
//!
//! ## Contrast pass
//!
//! A percentile histogram stretch over luminance: the 1st percentile maps to
//! 0 and the 99th to 255, all channels scaled linearly. Flat images (no
//! usable range) pass through unchanged.

use crate::config::ImageQuality;
use crate::error::ImageError;
use crate::pipeline::extract::{ColorSpaceKind, ExtractedImage, ImageEncoding};
use crate::pipeline::store::unique_path;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{DynamicImage, RgbImage};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Luminance percentiles clipped by the contrast stretch.
const STRETCH_LO_PERCENT: f64 = 0.01;
const STRETCH_HI_PERCENT: f64 = 0.99;

/// A normalised image written to disk, ready for report assembly.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Decode, resize, contrast-normalise and persist one extracted image.
pub fn normalize(
    image: &ExtractedImage,
    max_width: u32,
    max_height: u32,
    quality: ImageQuality,
    out_dir: &Path,
) -> Result<ProcessedImage, ImageError> {
    let page = image.page_index;
    let decoded = decode_payload(image)?;
    let rgb = decoded.to_rgb8();

    let (orig_w, orig_h) = rgb.dimensions();
    let scale = (max_width as f64 / orig_w as f64)
        .min(max_height as f64 / orig_h as f64)
        .min(1.0);
    let target_w = ((orig_w as f64 * scale).floor() as u32).max(1);
    let target_h = ((orig_h as f64 * scale).floor() as u32).max(1);

    let resized = if (target_w, target_h) == (orig_w, orig_h) {
        rgb
    } else {
        image::imageops::resize(&rgb, target_w, target_h, image::imageops::FilterType::Lanczos3)
    };

    let stretched = stretch_contrast(resized);

    fs::create_dir_all(out_dir).map_err(|e| ImageError::Io {
        page,
        detail: format!("cannot create {}: {e}", out_dir.display()),
    })?;
    let name = format!(
        "image_{}_{}.{}",
        image.page_index + 1,
        image.object_id.0,
        quality.extension()
    );
    let path = unique_path(out_dir, &name);

    write_image(&stretched, &path, quality).map_err(|e| {
        let _ = fs::remove_file(&path);
        ImageError::Io {
            page,
            detail: format!("write to {} failed: {e}", path.display()),
        }
    })?;

    debug!(
        path = %path.display(),
        from = %format!("{orig_w}x{orig_h}"),
        to = %format!("{target_w}x{target_h}"),
        "Normalised image"
    );
    Ok(ProcessedImage {
        path,
        width: target_w,
        height: target_h,
    })
}

// ── Payload decoding ─────────────────────────────────────────────────────

/// Turn an extracted payload into pixels.
///
/// [`ImageError::UnsupportedFormat`] marks encodings this decoder does not
/// speak; [`ImageError::Decode`] marks payloads that claimed a supported
/// encoding but would not parse.
fn decode_payload(image: &ExtractedImage) -> Result<DynamicImage, ImageError> {
    let page = image.page_index;
    match &image.encoding {
        ImageEncoding::Jpeg => {
            image::load_from_memory_with_format(&image.data, image::ImageFormat::Jpeg).map_err(
                |e| ImageError::Decode {
                    page,
                    detail: format!("JPEG: {e}"),
                },
            )
        }
        ImageEncoding::Flate {
            color_space,
            bits_per_component,
        } => {
            let mut decoder = flate2::read::ZlibDecoder::new(&image.data[..]);
            let mut samples = Vec::new();
            decoder
                .read_to_end(&mut samples)
                .map_err(|e| ImageError::Decode {
                    page,
                    detail: format!("FlateDecode: {e}"),
                })?;
            raw_to_image(&samples, image, color_space, *bits_per_component)
        }
        ImageEncoding::Raw {
            color_space,
            bits_per_component,
        } => raw_to_image(&image.data, image, color_space, *bits_per_component),
        ImageEncoding::Unsupported { filter } => Err(ImageError::UnsupportedFormat {
            page,
            detail: filter.clone(),
        }),
    }
}

/// Interpret raw samples according to the declared colour space.
fn raw_to_image(
    samples: &[u8],
    image: &ExtractedImage,
    color_space: &ColorSpaceKind,
    bits: u16,
) -> Result<DynamicImage, ImageError> {
    let page = image.page_index;
    let (w, h) = (image.width, image.height);
    let pixels = (w as usize) * (h as usize);

    if bits != 8 {
        return Err(ImageError::UnsupportedFormat {
            page,
            detail: format!("{bits} bits per component"),
        });
    }

    let short = |expected: usize| ImageError::Decode {
        page,
        detail: format!("sample data too short: {} < {expected}", samples.len()),
    };

    match color_space {
        ColorSpaceKind::DeviceRgb => {
            let expected = pixels * 3;
            if samples.len() < expected {
                return Err(short(expected));
            }
            RgbImage::from_raw(w, h, samples[..expected].to_vec())
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| short(expected))
        }
        ColorSpaceKind::DeviceGray => {
            let expected = pixels;
            if samples.len() < expected {
                return Err(short(expected));
            }
            image::GrayImage::from_raw(w, h, samples[..expected].to_vec())
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| short(expected))
        }
        ColorSpaceKind::DeviceCmyk => {
            let expected = pixels * 4;
            if samples.len() < expected {
                return Err(short(expected));
            }
            let mut rgb = Vec::with_capacity(pixels * 3);
            for chunk in samples[..expected].chunks_exact(4) {
                let c = chunk[0] as f32 / 255.0;
                let m = chunk[1] as f32 / 255.0;
                let y = chunk[2] as f32 / 255.0;
                let k = chunk[3] as f32 / 255.0;
                rgb.push(((1.0 - c) * (1.0 - k) * 255.0) as u8);
                rgb.push(((1.0 - m) * (1.0 - k) * 255.0) as u8);
                rgb.push(((1.0 - y) * (1.0 - k) * 255.0) as u8);
            }
            RgbImage::from_raw(w, h, rgb)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| short(expected))
        }
        // ICC profiles carry their component count out of band; guess from
        // the data volume, three components first.
        ColorSpaceKind::IccBased => {
            if samples.len() >= pixels * 3 {
                RgbImage::from_raw(w, h, samples[..pixels * 3].to_vec())
                    .map(DynamicImage::ImageRgb8)
                    .ok_or_else(|| short(pixels * 3))
            } else if samples.len() >= pixels {
                image::GrayImage::from_raw(w, h, samples[..pixels].to_vec())
                    .map(DynamicImage::ImageLuma8)
                    .ok_or_else(|| short(pixels))
            } else {
                Err(short(pixels))
            }
        }
        ColorSpaceKind::Other(name) => Err(ImageError::UnsupportedFormat {
            page,
            detail: format!("colour space {name}"),
        }),
    }
}

// ── Contrast ─────────────────────────────────────────────────────────────

/// Percentile histogram stretch over luminance.
fn stretch_contrast(mut rgb: RgbImage) -> RgbImage {
    let mut histogram = [0u64; 256];
    for p in rgb.pixels() {
        histogram[luma(p.0) as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return rgb;
    }

    let lo = percentile(&histogram, total, STRETCH_LO_PERCENT);
    let hi = percentile(&histogram, total, STRETCH_HI_PERCENT);
    if hi <= lo {
        return rgb;
    }

    let range = (hi - lo) as f32;
    for p in rgb.pixels_mut() {
        for c in &mut p.0 {
            let stretched = (*c as f32 - lo as f32) * 255.0 / range;
            *c = stretched.clamp(0.0, 255.0) as u8;
        }
    }
    rgb
}

fn luma(rgb: [u8; 3]) -> u8 {
    ((rgb[0] as u32 * 299 + rgb[1] as u32 * 587 + rgb[2] as u32 * 114) / 1000) as u8
}

fn percentile(histogram: &[u64; 256], total: u64, fraction: f64) -> u8 {
    let threshold = (total as f64 * fraction) as u64;
    let mut seen = 0u64;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen > threshold {
            return value as u8;
        }
    }
    255
}

// ── Encoding ─────────────────────────────────────────────────────────────

fn write_image(rgb: &RgbImage, path: &Path, quality: ImageQuality) -> image::ImageResult<()> {
    let mut file = std::io::BufWriter::new(fs::File::create(path)?);
    let img = DynamicImage::ImageRgb8(rgb.clone());
    match quality.jpeg_quality() {
        Some(q) => img.write_with_encoder(JpegEncoder::new_with_quality(&mut file, q)),
        None => img.write_with_encoder(PngEncoder::new(&mut file)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_image(width: u32, height: u32, fill: impl Fn(u32, u32) -> u8) -> ExtractedImage {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(fill(x, y));
            }
        }
        ExtractedImage {
            data,
            encoding: ImageEncoding::Raw {
                color_space: ColorSpaceKind::DeviceGray,
                bits_per_component: 8,
            },
            width,
            height,
            page_index: 0,
            object_id: (10, 0),
        }
    }

    #[test]
    fn fits_within_bounds_preserving_aspect() {
        let dir = tempfile::tempdir().unwrap();
        let img = gray_image(1600, 1000, |_, _| 128);
        let out = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        assert_eq!((out.width, out.height), (800, 500));
        let reloaded = image::open(&out.path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (800, 500));
    }

    #[test]
    fn height_bound_can_dominate() {
        let dir = tempfile::tempdir().unwrap();
        let img = gray_image(400, 2000, |_, _| 128);
        let out = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        assert_eq!((out.width, out.height), (200, 1000));
    }

    #[test]
    fn never_upscales() {
        let dir = tempfile::tempdir().unwrap();
        let img = gray_image(100, 80, |_, _| 50);
        let out = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        assert_eq!((out.width, out.height), (100, 80));
    }

    #[test]
    fn contrast_stretch_expands_narrow_range() {
        let dir = tempfile::tempdir().unwrap();
        // Left half dark grey, right half light grey.
        let img = gray_image(64, 64, |x, _| if x < 32 { 100 } else { 150 });
        let out = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        let reloaded = image::open(&out.path).unwrap().to_rgb8();
        let min = reloaded.pixels().map(|p| p.0[0]).min().unwrap();
        let max = reloaded.pixels().map(|p| p.0[0]).max().unwrap();
        assert!(min < 20, "dark side should map near black, got {min}");
        assert!(max > 235, "light side should map near white, got {max}");
    }

    #[test]
    fn flat_image_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let img = gray_image(16, 16, |_, _| 77);
        let out = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        let reloaded = image::open(&out.path).unwrap().to_rgb8();
        assert!(reloaded.pixels().all(|p| p.0[0] == 77));
    }

    #[test]
    fn unsupported_filter_is_a_per_image_error() {
        let dir = tempfile::tempdir().unwrap();
        let img = ExtractedImage {
            data: vec![0; 16],
            encoding: ImageEncoding::Unsupported {
                filter: "JBIG2Decode".into(),
            },
            width: 4,
            height: 4,
            page_index: 2,
            object_id: (5, 0),
        };
        let err = normalize(&img, 800, 1000, ImageQuality::Standard, dir.path()).unwrap_err();
        assert!(matches!(err, ImageError::UnsupportedFormat { page: 2, .. }));
    }

    #[test]
    fn garbage_jpeg_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let img = ExtractedImage {
            data: b"definitely not a jpeg".to_vec(),
            encoding: ImageEncoding::Jpeg,
            width: 4,
            height: 4,
            page_index: 1,
            object_id: (6, 0),
        };
        let err = normalize(&img, 800, 1000, ImageQuality::Standard, dir.path()).unwrap_err();
        assert!(matches!(err, ImageError::Decode { page: 1, .. }));
    }

    #[test]
    fn truncated_raw_samples_are_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = gray_image(8, 8, |_, _| 1);
        img.data.truncate(10);
        let err = normalize(&img, 800, 1000, ImageQuality::Standard, dir.path()).unwrap_err();
        assert!(matches!(err, ImageError::Decode { .. }));
    }

    #[test]
    fn quality_tier_selects_extension() {
        let dir = tempfile::tempdir().unwrap();
        let img = gray_image(8, 8, |_, _| 1);
        let jpeg = normalize(&img, 800, 1000, ImageQuality::Standard, dir.path()).unwrap();
        assert_eq!(jpeg.path.extension().unwrap(), "jpg");
        let png = normalize(&img, 800, 1000, ImageQuality::Lossless, dir.path()).unwrap();
        assert_eq!(png.path.extension().unwrap(), "png");
    }
}

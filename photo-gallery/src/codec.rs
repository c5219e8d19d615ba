//! Media codec: validation, resizing, compression and thumbnails
//!
//! The resize and thumbnail geometry lives in free functions here; the pixel
//! work is delegated to an [`ImageCodec`] backend so other platforms can plug
//! in a native implementation while keeping the same algorithm.

use crate::config::CodecConfig;
use crate::models::{ImageFile, ImageFormat};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops::FilterType, DynamicImage, ImageReader};
use std::io::Cursor;
use std::path::Path;

/// Error type for decoding and encoding images
#[derive(Debug)]
pub enum CodecError {
    EmptyInput,
    DecodeError(String),
    EncodeError(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::EmptyInput => write!(f, "Image data is empty"),
            CodecError::DecodeError(msg) => write!(f, "Image decode error: {}", msg),
            CodecError::EncodeError(msg) => write!(f, "Image encode error: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Rejected input file, with a reason suitable for showing to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub reason: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for ValidationError {}

/// Region of the source image to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Processed photo payload
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub original_size: u64,
    pub compressed_size: u64,
    /// `compressed_size / original_size`
    pub compression_ratio: f64,
}

/// Pixel backend used by [`compress_with`] and [`generate_thumbnail_with`]
pub trait ImageCodec: Send + Sync {
    /// Reads the pixel dimensions of an encoded image without decoding it fully
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError>;

    /// Decodes `bytes`, applies `crop` if given, scales to exactly
    /// `width`×`height` and encodes the result as `format`
    fn render(
        &self,
        bytes: &[u8],
        crop: Option<CropRect>,
        width: u32,
        height: u32,
        format: ImageFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError>;
}

/// [`ImageCodec`] backed by the `image` crate
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateCodec {
    filter: FilterType,
}

impl ImageCrateCodec {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Default for ImageCrateCodec {
    fn default() -> Self {
        Self::new(FilterType::Lanczos3)
    }
}

impl ImageCodec for ImageCrateCodec {
    fn dimensions(&self, bytes: &[u8]) -> Result<(u32, u32), CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| CodecError::DecodeError(e.to_string()))?
            .into_dimensions()
            .map_err(|e| CodecError::DecodeError(e.to_string()))
    }

    fn render(
        &self,
        bytes: &[u8],
        crop: Option<CropRect>,
        width: u32,
        height: u32,
        format: ImageFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        let mut img = image::load_from_memory(bytes)
            .map_err(|e| CodecError::DecodeError(e.to_string()))?;

        if let Some(rect) = crop {
            img = img.crop_imm(rect.x, rect.y, rect.width, rect.height);
        }
        if img.width() != width || img.height() != height {
            img = img.resize_exact(width, height, self.filter);
        }

        encode(&img, format, quality)
    }
}

fn encode(img: &DynamicImage, format: ImageFormat, quality: f32) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Cursor::new(Vec::new());
    let result = match format {
        ImageFormat::Jpeg => {
            // JPEG has no alpha channel
            let encoder = JpegEncoder::new_with_quality(&mut buffer, jpeg_quality(quality));
            DynamicImage::ImageRgb8(img.to_rgb8()).write_with_encoder(encoder)
        }
        ImageFormat::Png => img.write_to(&mut buffer, image::ImageFormat::Png),
        ImageFormat::Webp => {
            DynamicImage::ImageRgba8(img.to_rgba8()).write_to(&mut buffer, image::ImageFormat::WebP)
        }
    };
    result.map_err(|e| CodecError::EncodeError(e.to_string()))?;
    Ok(buffer.into_inner())
}

fn jpeg_quality(quality: f32) -> u8 {
    ((quality.clamp(0.0, 1.0) * 100.0).round() as u8).max(1)
}

/// Scales `(original_width, original_height)` down to fit inside
/// `(max_width, max_height)`, keeping the aspect ratio. Never scales up.
pub fn calculate_dimensions(
    original_width: u32,
    original_height: u32,
    max_width: u32,
    max_height: u32,
) -> (u32, u32) {
    if original_width <= max_width && original_height <= max_height {
        return (original_width, original_height);
    }

    let ratio = (max_width as f64 / original_width as f64)
        .min(max_height as f64 / original_height as f64);

    let width = ((original_width as f64 * ratio).round() as u32).clamp(1, max_width.max(1));
    let height = ((original_height as f64 * ratio).round() as u32).clamp(1, max_height.max(1));
    (width, height)
}

/// Checks format first, then size, so an unsupported file is always reported
/// as such even when it is also too large.
pub fn validate_image_file(file: &ImageFile, config: &CodecConfig) -> Result<(), ValidationError> {
    let supported = ImageFormat::from_mime_type(&file.mime_type)
        .map(|format| config.formats.contains(&format))
        .unwrap_or(false);

    if !supported {
        let allowed: Vec<&str> = config.formats.iter().map(|f| f.mime_type()).collect();
        return Err(ValidationError {
            reason: format!(
                "Unsupported file format: {}. Supported formats: {}",
                file.mime_type,
                allowed.join(", ")
            ),
        });
    }

    if file.size() > config.max_file_size {
        return Err(ValidationError {
            reason: format!(
                "File size {} exceeds limit of {}",
                format_file_size(file.size()),
                format_file_size(config.max_file_size)
            ),
        });
    }

    Ok(())
}

/// Resizes and re-encodes a photo using the default backend
pub fn compress(bytes: &[u8], config: &CodecConfig) -> Result<CompressedImage, CodecError> {
    compress_with(&ImageCrateCodec::default(), bytes, config)
}

pub fn compress_with(
    codec: &dyn ImageCodec,
    bytes: &[u8],
    config: &CodecConfig,
) -> Result<CompressedImage, CodecError> {
    let (original_width, original_height) = codec.dimensions(bytes)?;
    let (width, height) = calculate_dimensions(
        original_width,
        original_height,
        config.target_width,
        config.target_height,
    );

    let output = codec.render(bytes, None, width, height, config.output_format, config.quality)?;

    let original_size = bytes.len() as u64;
    let compressed_size = output.len() as u64;
    log::debug!(
        "Compressed {}x{} -> {}x{} ({} -> {})",
        original_width,
        original_height,
        width,
        height,
        format_file_size(original_size),
        format_file_size(compressed_size)
    );

    Ok(CompressedImage {
        bytes: output,
        width,
        height,
        format: config.output_format,
        original_size,
        compressed_size,
        compression_ratio: compressed_size as f64 / original_size as f64,
    })
}

/// Largest centered square inside a `width`×`height` image
pub fn center_square(width: u32, height: u32) -> CropRect {
    let side = width.min(height);
    CropRect {
        x: (width - side) / 2,
        y: (height - side) / 2,
        width: side,
        height: side,
    }
}

/// Square thumbnail using the default backend
pub fn generate_thumbnail(
    bytes: &[u8],
    size: u32,
    format: ImageFormat,
) -> Result<Vec<u8>, CodecError> {
    generate_thumbnail_with(&ImageCrateCodec::default(), bytes, size, format, 0.8)
}

pub fn generate_thumbnail_with(
    codec: &dyn ImageCodec,
    bytes: &[u8],
    size: u32,
    format: ImageFormat,
    quality: f32,
) -> Result<Vec<u8>, CodecError> {
    let (width, height) = codec.dimensions(bytes)?;
    let crop = center_square(width, height);
    let size = size.max(1);
    codec.render(bytes, Some(crop), size, size, format, quality)
}

/// Human readable size with base-1024 units, e.g. `1536 -> "1.5 KB"`
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut unit = 0;
    let mut threshold = 1024u64;
    while unit < UNITS.len() - 1 && bytes >= threshold {
        unit += 1;
        threshold = threshold.saturating_mul(1024);
    }

    let value = bytes as f64 / 1024f64.powi(unit as i32);
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

/// Guesses a MIME type from the file extension
pub fn mime_from_extension(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("heic") | Some("heif") => "image/heic",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_calculate_dimensions_scales_down() {
        assert_eq!(calculate_dimensions(1920, 1080, 800, 600), (800, 450));
        assert_eq!(calculate_dimensions(1080, 1920, 800, 600), (338, 600));
    }

    #[test]
    fn test_calculate_dimensions_never_upscales() {
        assert_eq!(calculate_dimensions(400, 300, 800, 600), (400, 300));
        assert_eq!(calculate_dimensions(800, 600, 800, 600), (800, 600));
    }

    #[test]
    fn test_calculate_dimensions_bounds_and_aspect() {
        let sizes = [1, 3, 17, 199, 640, 1023, 4000, 12000];
        for &ow in &sizes {
            for &oh in &sizes {
                for &(mw, mh) in &[(1u32, 1u32), (100, 50), (800, 600), (1200, 1200)] {
                    let (w, h) = calculate_dimensions(ow, oh, mw, mh);
                    assert!(w >= 1 && h >= 1);
                    assert!(w <= mw && h <= mh);
                    if ow <= mw && oh <= mh {
                        assert_eq!((w, h), (ow, oh));
                    } else if w > 1 && h > 1 {
                        // Aspect ratio holds up to rounding
                        let expected_h = w as f64 * oh as f64 / ow as f64;
                        assert!(
                            (h as f64 - expected_h).abs() <= 1.0 + oh as f64 / ow as f64,
                            "{}x{} in {}x{} -> {}x{}",
                            ow,
                            oh,
                            mw,
                            mh,
                            w,
                            h
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(500), "500 Bytes");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_file_size(1073741824), "1 GB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024 * 1024), "5120 GB");
    }

    #[test]
    fn test_format_file_size_is_monotonic() {
        fn parse(s: &str) -> f64 {
            let (value, unit) = s.split_once(' ').unwrap();
            let scale = match unit {
                "Bytes" => 1.0,
                "KB" => 1024.0,
                "MB" => 1024.0 * 1024.0,
                "GB" => 1024.0 * 1024.0 * 1024.0,
                other => panic!("unexpected unit {}", other),
            };
            value.parse::<f64>().unwrap() * scale
        }

        let mut previous = 0.0;
        let mut n: u64 = 0;
        while n < 8 * 1024 * 1024 * 1024 {
            let value = parse(&format_file_size(n));
            assert!(value >= previous, "{} formatted smaller than its predecessor", n);
            previous = value;
            n = n * 3 / 2 + 1;
        }
    }

    #[test]
    fn test_validate_oversized_supported_file() {
        let config = CodecConfig::default();
        let file = ImageFile::new("big.jpg", "image/jpeg", vec![0; 10 * 1024 * 1024]);
        let err = validate_image_file(&file, &config).unwrap_err();
        assert!(err.reason.contains("exceeds limit"), "{}", err.reason);
    }

    #[test]
    fn test_validate_format_before_size() {
        let config = CodecConfig {
            max_file_size: 100 * 1024 * 1024,
            ..CodecConfig::default()
        };
        let file = ImageFile::new("doc.pdf", "application/pdf", vec![0; 1024]);
        let err = validate_image_file(&file, &config).unwrap_err();
        assert!(err.reason.contains("Unsupported file format"), "{}", err.reason);

        // Oversized and unsupported still reports the format
        let config = CodecConfig::default();
        let file = ImageFile::new("doc.pdf", "application/pdf", vec![0; 10 * 1024 * 1024]);
        let err = validate_image_file(&file, &config).unwrap_err();
        assert!(err.reason.contains("Unsupported file format"));
    }

    #[test]
    fn test_validate_respects_configured_formats() {
        let config = CodecConfig {
            formats: vec![ImageFormat::Jpeg],
            ..CodecConfig::default()
        };
        let png = ImageFile::new("a.png", "image/png", vec![0; 10]);
        assert!(validate_image_file(&png, &config).is_err());
        let jpeg = ImageFile::new("a.jpg", "image/jpeg", vec![0; 10]);
        assert!(validate_image_file(&jpeg, &config).is_ok());
    }

    #[test]
    fn test_compress_resizes_to_target() {
        let config = CodecConfig {
            target_width: 400,
            target_height: 400,
            ..CodecConfig::default()
        };
        let input = sample_png(800, 450);
        let output = compress(&input, &config).unwrap();

        assert_eq!((output.width, output.height), (400, 225));
        assert_eq!(output.format, ImageFormat::Jpeg);
        assert_eq!(output.original_size, input.len() as u64);
        assert_eq!(output.compressed_size, output.bytes.len() as u64);
        let expected = output.compressed_size as f64 / output.original_size as f64;
        assert!((output.compression_ratio - expected).abs() < f64::EPSILON);

        let codec = ImageCrateCodec::default();
        assert_eq!(codec.dimensions(&output.bytes).unwrap(), (400, 225));
    }

    #[test]
    fn test_compress_keeps_small_images() {
        let input = sample_png(120, 80);
        let output = compress(&input, &CodecConfig::default()).unwrap();
        assert_eq!((output.width, output.height), (120, 80));
    }

    #[test]
    fn test_thumbnail_is_square() {
        let input = sample_png(300, 120);
        let thumb = generate_thumbnail(&input, 64, ImageFormat::Png).unwrap();
        let codec = ImageCrateCodec::default();
        assert_eq!(codec.dimensions(&thumb).unwrap(), (64, 64));
    }

    #[test]
    fn test_center_square() {
        assert_eq!(
            center_square(300, 120),
            CropRect {
                x: 90,
                y: 0,
                width: 120,
                height: 120
            }
        );
        assert_eq!(center_square(50, 50).x, 0);
    }

    #[test]
    fn test_corrupt_input_is_codec_error() {
        let garbage = b"definitely not an image".to_vec();
        assert!(compress(&garbage, &CodecConfig::default()).is_err());
        assert!(matches!(
            compress(&[], &CodecConfig::default()),
            Err(CodecError::EmptyInput)
        ));
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a/b/IMG_1.JPG")), "image/jpeg");
        assert_eq!(mime_from_extension(Path::new("x.webp")), "image/webp");
        assert_eq!(mime_from_extension(Path::new("x")), "application/octet-stream");
    }
}

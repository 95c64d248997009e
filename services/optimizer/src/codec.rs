//! Image codec seam.
//!
//! The pipeline only needs four blob-level operations: read dimensions,
//! decode, resize into a bounding box and encode. [`ImageRsCodec`] implements
//! them with the `image` crate plus libwebp for lossy WebP. Every operation is
//! CPU-bound and synchronous; callers run them on the blocking pool.

use crate::catalog::{QualitySettings, MAX_AVIF_EFFORT};
use crate::error::CodecError;
use crate::variant::{Dimensions, OutputFormat};
use image::codecs::avif::AvifEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageReader, Rgba, RgbaImage};
use std::io::Cursor;
use tracing::debug;

/// Blob-in, blob-out image operations
pub trait ImageCodec: Send + Sync {
    /// Read width and height without decoding pixel data
    fn probe(&self, data: &[u8]) -> Result<Dimensions, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<DynamicImage, CodecError>;

    /// Fit the whole image inside `width` x `height`, centred, padding the
    /// remainder with transparent pixels. Never crops.
    fn resize_contain(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, CodecError>;

    fn encode(
        &self,
        image: &RgbaImage,
        format: OutputFormat,
        quality: &QualitySettings,
    ) -> Result<Vec<u8>, CodecError>;
}

/// Codec backed by `image` (decode, resize, AVIF via rav1e) and `webp`
/// (lossy WebP via libwebp).
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageRsCodec;

impl ImageRsCodec {
    pub fn new() -> Self {
        Self
    }

    fn encode_webp(&self, image: &RgbaImage, quality: &QualitySettings) -> Result<Vec<u8>, CodecError> {
        let encode_error = |message: String| CodecError::Encode {
            format: OutputFormat::Webp,
            message,
        };

        let mut config =
            webp::WebPConfig::new().map_err(|_| encode_error("invalid libwebp config".to_string()))?;
        config.quality = quality.quality as f32;
        config.method = quality.webp_effort as i32;
        // single-threaded encoding keeps output reproducible
        config.thread_level = 0;

        let encoder = webp::Encoder::from_rgba(image.as_raw(), image.width(), image.height());
        let memory = encoder
            .encode_advanced(&config)
            .map_err(|e| encode_error(format!("{:?}", e)))?;

        Ok(memory.to_vec())
    }

    fn encode_avif(&self, image: &RgbaImage, quality: &QualitySettings) -> Result<Vec<u8>, CodecError> {
        let mut buffer = Vec::new();
        let encoder = AvifEncoder::new_with_speed_quality(
            &mut buffer,
            avif_speed(quality.avif_effort),
            quality.quality,
        );

        encoder
            .write_image(
                image.as_raw(),
                image.width(),
                image.height(),
                ExtendedColorType::Rgba8,
            )
            .map_err(|e| CodecError::Encode {
                format: OutputFormat::Avif,
                message: e.to_string(),
            })?;

        Ok(buffer)
    }
}

/// Map effort (0 fastest .. 9 slowest) onto rav1e speed (10 fastest .. 1 slowest)
fn avif_speed(effort: u8) -> u8 {
    (10 - effort.min(MAX_AVIF_EFFORT)).clamp(1, 10)
}

impl ImageCodec for ImageRsCodec {
    fn probe(&self, data: &[u8]) -> Result<Dimensions, CodecError> {
        let (width, height) = ImageReader::new(Cursor::new(data))
            .with_guessed_format()
            .map_err(|e| CodecError::Decode(e.to_string()))?
            .into_dimensions()
            .map_err(|e| CodecError::Decode(e.to_string()))?;

        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimensions { width, height });
        }

        Ok(Dimensions { width, height })
    }

    fn decode(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
        let image = image::load_from_memory(data).map_err(|e| CodecError::Decode(e.to_string()))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(CodecError::InvalidDimensions {
                width: image.width(),
                height: image.height(),
            });
        }

        debug!(width = image.width(), height = image.height(), "Decoded source image");
        Ok(image)
    }

    fn resize_contain(
        &self,
        image: &DynamicImage,
        width: u32,
        height: u32,
    ) -> Result<RgbaImage, CodecError> {
        if width == 0 || height == 0 {
            return Err(CodecError::Resize {
                width,
                height,
                message: "target box is empty".to_string(),
            });
        }

        // `resize` keeps the aspect ratio and fits within the box
        let fitted = image.resize(width, height, FilterType::Lanczos3).to_rgba8();

        if fitted.width() == width && fitted.height() == height {
            return Ok(fitted);
        }

        let mut canvas = RgbaImage::from_pixel(width, height, Rgba([0, 0, 0, 0]));
        let x = (width.saturating_sub(fitted.width()) / 2) as i64;
        let y = (height.saturating_sub(fitted.height()) / 2) as i64;
        imageops::overlay(&mut canvas, &fitted, x, y);

        Ok(canvas)
    }

    fn encode(
        &self,
        image: &RgbaImage,
        format: OutputFormat,
        quality: &QualitySettings,
    ) -> Result<Vec<u8>, CodecError> {
        match format {
            OutputFormat::Webp => self.encode_webp(image, quality),
            OutputFormat::Avif => self.encode_avif(image, quality),
        }
    }
}

/// Deterministic stand-in codec for pipeline tests.
///
/// Sources are the ASCII text `"<width>x<height>"`; encoded variants are
/// `"<format>:<width>x<height>:q<quality>"`.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;

    #[derive(Debug, Default, Clone)]
    pub struct FakeCodec {
        pub fail_encode: Option<OutputFormat>,
    }

    impl FakeCodec {
        pub fn failing(format: OutputFormat) -> Self {
            Self {
                fail_encode: Some(format),
            }
        }
    }

    pub fn source_bytes(width: u32, height: u32) -> bytes::Bytes {
        bytes::Bytes::from(format!("{}x{}", width, height))
    }

    impl ImageCodec for FakeCodec {
        fn probe(&self, data: &[u8]) -> Result<Dimensions, CodecError> {
            let text = std::str::from_utf8(data).map_err(|e| CodecError::Decode(e.to_string()))?;
            let (w, h) = text
                .split_once('x')
                .ok_or_else(|| CodecError::Decode("not an image".to_string()))?;
            let width: u32 = w.parse().map_err(|_| CodecError::Decode("bad width".to_string()))?;
            let height: u32 = h.parse().map_err(|_| CodecError::Decode("bad height".to_string()))?;
            if width == 0 || height == 0 {
                return Err(CodecError::InvalidDimensions { width, height });
            }
            Ok(Dimensions { width, height })
        }

        fn decode(&self, data: &[u8]) -> Result<DynamicImage, CodecError> {
            let dims = self.probe(data)?;
            Ok(DynamicImage::new_rgba8(dims.width, dims.height))
        }

        fn resize_contain(
            &self,
            _image: &DynamicImage,
            width: u32,
            height: u32,
        ) -> Result<RgbaImage, CodecError> {
            Ok(RgbaImage::new(width, height))
        }

        fn encode(
            &self,
            image: &RgbaImage,
            format: OutputFormat,
            quality: &QualitySettings,
        ) -> Result<Vec<u8>, CodecError> {
            if self.fail_encode == Some(format) {
                return Err(CodecError::Encode {
                    format,
                    message: "injected failure".to_string(),
                });
            }
            Ok(format!(
                "{}:{}x{}:q{}",
                format,
                image.width(),
                image.height(),
                quality.quality
            )
            .into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 7 % 256) as u8, (y * 13 % 256) as u8, 128, 255])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(image)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn settings() -> QualitySettings {
        QualitySettings {
            quality: 80,
            webp_effort: 4,
            avif_effort: 6,
        }
    }

    #[test]
    fn test_probe_reads_header_dimensions() {
        let codec = ImageRsCodec::new();
        assert_eq!(
            codec.probe(&png_bytes(40, 20)).unwrap(),
            Dimensions { width: 40, height: 20 }
        );
    }

    #[test]
    fn test_corrupt_input_is_decode_error() {
        let codec = ImageRsCodec::new();
        assert!(matches!(codec.probe(b"definitely not an image"), Err(CodecError::Decode(_))));
        assert!(matches!(codec.decode(b"\x89PNG\r\n\x1a\ntruncated"), Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_resize_contain_pads_transparently() {
        let codec = ImageRsCodec::new();
        let image = codec.decode(&png_bytes(40, 20)).unwrap();

        let boxed = codec.resize_contain(&image, 16, 16).unwrap();
        assert_eq!(boxed.dimensions(), (16, 16));
        // 40x20 fits as 16x8, centred vertically
        assert_eq!(boxed.get_pixel(8, 0)[3], 0);
        assert_eq!(boxed.get_pixel(8, 15)[3], 0);
        assert_eq!(boxed.get_pixel(8, 8)[3], 255);

        let exact = codec.resize_contain(&image, 16, 8).unwrap();
        assert_eq!(exact.dimensions(), (16, 8));
        assert!(exact.pixels().all(|p| p[3] == 255));
    }

    #[test]
    fn test_webp_encoding_is_deterministic() {
        let codec = ImageRsCodec::new();
        let image = codec.decode(&png_bytes(32, 16)).unwrap();
        let resized = codec.resize_contain(&image, 16, 8).unwrap();

        let first = codec.encode(&resized, OutputFormat::Webp, &settings()).unwrap();
        let second = codec.encode(&resized, OutputFormat::Webp, &settings()).unwrap();

        assert_eq!(&first[0..4], b"RIFF");
        assert_eq!(&first[8..12], b"WEBP");
        assert_eq!(first, second);
    }

    #[test]
    fn test_avif_encoding() {
        let codec = ImageRsCodec::new();
        let image = codec.decode(&png_bytes(16, 8)).unwrap();
        let resized = codec.resize_contain(&image, 16, 8).unwrap();

        let encoded = codec.encode(&resized, OutputFormat::Avif, &settings()).unwrap();
        assert_eq!(&encoded[4..8], b"ftyp");
    }

    #[test]
    fn test_avif_speed_mapping() {
        assert_eq!(avif_speed(0), 10);
        assert_eq!(avif_speed(6), 4);
        assert_eq!(avif_speed(9), 1);
        assert_eq!(avif_speed(200), 1);
    }

    #[test]
    fn test_fake_codec_round_trip() {
        let codec = fake::FakeCodec::default();
        let dims = codec.probe(&fake::source_bytes(1200, 800)).unwrap();
        assert_eq!(dims, Dimensions { width: 1200, height: 800 });
        assert!(matches!(
            codec.probe(&fake::source_bytes(0, 800)),
            Err(CodecError::InvalidDimensions { .. })
        ));
    }
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Image -> encoded bytes.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::command::{CancellationToken, Command, TimeEstimate};
use crate::data::{TypedData, TypedDataType};
use crate::error::{CommandError, Result};
use crate::progress::MutableProgressTracker;

/// Default JPEG quality (0-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Output formats supported by [`ImageEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeFormat {
    #[default]
    Png,
    Jpeg,
    Bmp,
}

impl EncodeFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            EncodeFormat::Png => "png",
            EncodeFormat::Jpeg => "jpg",
            EncodeFormat::Bmp => "bmp",
        }
    }

    fn image_format(&self) -> ImageFormat {
        match self {
            EncodeFormat::Png => ImageFormat::Png,
            EncodeFormat::Jpeg => ImageFormat::Jpeg,
            EncodeFormat::Bmp => ImageFormat::Bmp,
        }
    }
}

/// Encodes a decoded image into PNG, JPEG or BMP bytes.
#[derive(Debug, Clone)]
pub struct ImageEncoder {
    format: EncodeFormat,
    jpeg_quality: u8,
}

impl ImageEncoder {
    pub fn new(format: EncodeFormat) -> Self {
        Self {
            format,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }

    pub fn png() -> Self {
        Self::new(EncodeFormat::Png)
    }

    pub fn jpeg(quality: u8) -> Self {
        Self::new(EncodeFormat::Jpeg).with_quality(quality)
    }

    /// JPEG quality, clamped to 1-100. Ignored by the lossless formats.
    pub fn with_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn format(&self) -> EncodeFormat {
        self.format
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>> {
        let mut bytes = Cursor::new(Vec::new());
        match self.format {
            // JPEG has no alpha channel.
            EncodeFormat::Jpeg => {
                let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
                rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality))?;
            }
            format => image.write_to(&mut bytes, format.image_format())?,
        }
        Ok(bytes.into_inner())
    }

    /// The input's name with this encoder's extension.
    fn output_name(&self, input_name: &str) -> String {
        let stem = Path::new(input_name)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .filter(|stem| !stem.is_empty())
            .unwrap_or("image");
        format!("{}.{}", stem, self.format.extension())
    }
}

impl Command for ImageEncoder {
    fn name(&self) -> &str {
        match self.format {
            EncodeFormat::Png => "PNG encoder",
            EncodeFormat::Jpeg => "JPEG encoder",
            EncodeFormat::Bmp => "BMP encoder",
        }
    }

    fn input_data_types(&self) -> Vec<TypedDataType> {
        vec![TypedDataType::Image]
    }

    fn time_estimate(&self) -> TimeEstimate {
        TimeEstimate::INSTANTANEOUS
    }

    fn process(
        &self,
        input: &mut TypedData,
        progress: &Arc<MutableProgressTracker>,
        cancel: &CancellationToken,
    ) -> Result<TypedData> {
        self.ensure_accepts(input)?;
        cancel.check(self.name())?;

        let image = input
            .as_image()
            .ok_or_else(|| CommandError::unsupported(self.name(), input.data_type()))?;
        progress.set_status(format!("encoding {}x{} {}", image.width(), image.height(), self.format.extension()));

        let bytes = self.encode(image)?;
        tracing::debug!(target: "nocap::commands", format = self.format.extension(), bytes = bytes.len(), "encoded image");

        progress.complete();
        Ok(TypedData::from_raw_data(bytes, self.output_name(input.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressTracker;
    use image::RgbaImage;

    fn encode(encoder: &ImageEncoder, name: &str) -> TypedData {
        let pixels = RgbaImage::from_pixel(4, 3, image::Rgba([10, 20, 30, 128]));
        let mut input = TypedData::from_image(DynamicImage::ImageRgba8(pixels), name);
        encoder
            .process(&mut input, &Arc::new(MutableProgressTracker::new()), &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_png_output_decodes() {
        let output = encode(&ImageEncoder::png(), "shot.bmp");
        assert_eq!(output.data_type(), TypedDataType::RawData);
        assert_eq!(output.name(), "shot.png");

        let decoded = image::load_from_memory(output.as_raw_data().unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn test_jpeg_drops_alpha() {
        let output = encode(&ImageEncoder::jpeg(80), "");
        assert_eq!(output.name(), "image.jpg");
        let format = image::guess_format(output.as_raw_data().unwrap()).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_bmp() {
        let output = encode(&ImageEncoder::new(EncodeFormat::Bmp), "x");
        assert_eq!(image::guess_format(output.as_raw_data().unwrap()).unwrap(), ImageFormat::Bmp);
    }

    #[test]
    fn test_rejects_text() {
        let mut input = TypedData::from_text("not an image", "t");
        let progress = Arc::new(MutableProgressTracker::new());
        let err = ImageEncoder::png()
            .process(&mut input, &progress, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CommandError::UnsupportedDataType { .. }));
        assert_eq!(progress.progress(), 0.0);
    }

    #[test]
    fn test_quality_clamped() {
        assert_eq!(ImageEncoder::jpeg(0).jpeg_quality, 1);
        assert_eq!(ImageEncoder::jpeg(255).jpeg_quality, 100);
    }
}

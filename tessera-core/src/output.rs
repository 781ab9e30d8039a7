use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::DynamicImage;

use crate::OutputFormat;

/// One encoded output image.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    /// Position in the generated batch, before any safety filtering.
    pub index: usize,
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
}

impl EncodedImage {
    pub fn file_name(&self) -> String {
        format!("out-{}.{}", self.index, self.format.extension())
    }
}

/// Encodes `image`. `quality` only matters for JPEG: PNG is lossless by nature
/// and the `image` crate only writes lossless WebP.
pub fn encode(image: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let rgb = image.to_rgb8();
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png => rgb
            .write_with_encoder(PngEncoder::new(Cursor::new(&mut bytes)))
            .context("failed to encode png")?,
        OutputFormat::Jpg => rgb
            .write_with_encoder(JpegEncoder::new_with_quality(
                Cursor::new(&mut bytes),
                quality.clamp(1, 100),
            ))
            .context("failed to encode jpeg")?,
        OutputFormat::Webp => rgb
            .write_with_encoder(WebPEncoder::new_lossless(Cursor::new(&mut bytes)))
            .context("failed to encode webp")?,
    }
    Ok(bytes)
}

/// Writes each image to `dir/out-{index}.{ext}`.
pub fn write_outputs(dir: &Path, images: &[EncodedImage]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir {}", dir.display()))?;
    images
        .iter()
        .map(|image| {
            let path = dir.join(image.file_name());
            std::fs::write(&path, &image.bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, RgbImage};
    use tempfile::TempDir;

    fn gradient() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(32, 16, |x, y| {
            image::Rgb([(x * 8) as u8, (y * 16) as u8, 128])
        }))
    }

    #[test]
    fn encodes_each_format() {
        let img = gradient();
        for (format, expected) in [
            (OutputFormat::Png, ImageFormat::Png),
            (OutputFormat::Jpg, ImageFormat::Jpeg),
            (OutputFormat::Webp, ImageFormat::WebP),
        ] {
            let bytes = encode(&img, format, 80).unwrap();
            assert_eq!(image::guess_format(&bytes).unwrap(), expected);
            let decoded = image::load_from_memory(&bytes).unwrap();
            assert_eq!((decoded.width(), decoded.height()), (32, 16));
        }
    }

    #[test]
    fn jpeg_quality_changes_size() {
        let img = gradient();
        let low = encode(&img, OutputFormat::Jpg, 5).unwrap();
        let high = encode(&img, OutputFormat::Jpg, 100).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn writes_named_files() {
        let dir = TempDir::new().unwrap();
        let images = vec![
            EncodedImage {
                index: 0,
                format: OutputFormat::Png,
                bytes: vec![1, 2, 3],
            },
            EncodedImage {
                index: 2,
                format: OutputFormat::Webp,
                bytes: vec![4],
            },
        ];
        let paths = write_outputs(dir.path(), &images).unwrap();
        assert_eq!(paths[0], dir.path().join("out-0.png"));
        assert_eq!(paths[1], dir.path().join("out-2.webp"));
        assert_eq!(std::fs::read(&paths[1]).unwrap(), vec![4]);
    }
}

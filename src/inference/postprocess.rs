//! Post-processing Module
//!
//! Turns a raw segmentation map into the cloud-coverage metric and persists
//! the map as an image artifact.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, Rgb32FImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::engine::SegmentationMap;
use crate::utils::error::{CloudSegError, Result};

/// Raw-score threshold above which a pixel counts as cloud
pub const CLOUD_THRESHOLD: f32 = 2.2;

/// How the coverage metric aggregates pixels over the threshold
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CoverageMode {
    /// Sum of the values over the threshold divided by the pixel count.
    /// Not a true fraction: exceeds 1 whenever those values sum past the
    /// pixel count. Matches the numbers existing consumers already receive.
    #[default]
    SumOfValues,
    /// Number of pixels over the threshold divided by the pixel count
    PixelFraction,
}

impl CoverageMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "sum-of-values" | "sum" => Some(Self::SumOfValues),
            "pixel-fraction" | "fraction" => Some(Self::PixelFraction),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SumOfValues => "sum-of-values",
            Self::PixelFraction => "pixel-fraction",
        }
    }
}

impl std::fmt::Display for CoverageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cloud coverage of `map`; a pixel is cloud iff its value is strictly above `threshold`
pub fn coverage(map: &SegmentationMap, threshold: f32, mode: CoverageMode) -> f64 {
    let pixels = map.pixel_count();
    if pixels == 0 {
        return 0.0;
    }

    let clouds = map.values().iter().copied().filter(|&v| v > threshold);
    let numerator = match mode {
        CoverageMode::SumOfValues => clouds.map(f64::from).sum::<f64>(),
        CoverageMode::PixelFraction => clouds.count() as f64,
    };

    numerator / pixels as f64
}

/// Extension artifacts fall back to when the source format cannot hold a map
pub const FALLBACK_ARTIFACT_EXTENSION: &str = "png";

/// How a map is encoded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactEncoding {
    /// Float RGB with the raw values (OpenEXR, Radiance HDR)
    RawFloat(ImageFormat),
    /// 8 bits per channel, `clamp(v * 255 + 0.5, 0, 255)`
    Quantized(ImageFormat),
}

impl ArtifactEncoding {
    /// Pick the encoding from the destination's extension
    pub fn for_path(path: &Path) -> Result<Self> {
        let format = ImageFormat::from_path(path).map_err(|e| write_error(path, e.to_string()))?;
        match format {
            ImageFormat::OpenExr | ImageFormat::Hdr => Ok(Self::RawFloat(format)),
            ImageFormat::Png
            | ImageFormat::Jpeg
            | ImageFormat::Bmp
            | ImageFormat::Tiff
            | ImageFormat::Tga
            | ImageFormat::Pnm
            | ImageFormat::WebP
            | ImageFormat::Qoi
                if format.writing_enabled() =>
            {
                Ok(Self::Quantized(format))
            }
            _ => Err(write_error(
                path,
                format!("{:?} cannot hold an RGB segmentation map", format),
            )),
        }
    }

    pub fn format(&self) -> ImageFormat {
        match self {
            Self::RawFloat(format) | Self::Quantized(format) => *format,
        }
    }
}

/// Map one raw value to an 8-bit sample
pub fn quantize(value: f32) -> u8 {
    (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

fn write_error(path: &Path, reason: impl Into<String>) -> CloudSegError {
    CloudSegError::Write {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn to_image(map: &SegmentationMap, encoding: ArtifactEncoding) -> DynamicImage {
    let (width, height) = (map.width() as u32, map.height() as u32);

    match encoding {
        ArtifactEncoding::RawFloat(_) => {
            let data = map.values().iter().flat_map(|&v| [v, v, v]).collect();
            DynamicImage::ImageRgb32F(Rgb32FImage::from_raw(width, height, data).unwrap_or_default())
        }
        ArtifactEncoding::Quantized(_) => {
            let data = map
                .values()
                .iter()
                .flat_map(|&v| {
                    let q = quantize(v);
                    [q, q, q]
                })
                .collect();
            DynamicImage::ImageRgb8(RgbImage::from_raw(width, height, data).unwrap_or_default())
        }
    }
}

/// Write `map` to `destination`, single channel replicated to RGB.
///
/// `.exr` and `.hdr` keep the raw values; the other supported raster
/// formats are quantized to 8 bits. Values are never normalized first.
/// The map is fully encoded before the file is created, and a failed write
/// removes whatever reached the disk.
pub fn persist(map: &SegmentationMap, destination: &Path) -> Result<PathBuf> {
    let encoding = ArtifactEncoding::for_path(destination)?;

    let mut encoded = Cursor::new(Vec::new());
    to_image(map, encoding)
        .write_to(&mut encoded, encoding.format())
        .map_err(|e| write_error(destination, e.to_string()))?;

    if let Err(e) = std::fs::write(destination, encoded.into_inner()) {
        let _ = std::fs::remove_file(destination);
        return Err(write_error(destination, e.to_string()));
    }

    debug!("Persisted {}x{} map to {:?} as {:?}", map.width(), map.height(), destination, encoding);
    Ok(destination.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_coverage_below_threshold_is_zero() {
        let map = SegmentationMap::filled(8, 8, CLOUD_THRESHOLD);
        assert_eq!(coverage(&map, CLOUD_THRESHOLD, CoverageMode::SumOfValues), 0.0);
        assert_eq!(coverage(&map, CLOUD_THRESHOLD, CoverageMode::PixelFraction), 0.0);
    }

    #[test]
    fn test_coverage_is_not_clamped() {
        let map = SegmentationMap::filled(8, 8, 3.0);
        assert_eq!(coverage(&map, CLOUD_THRESHOLD, CoverageMode::SumOfValues), 3.0);
        assert_eq!(coverage(&map, CLOUD_THRESHOLD, CoverageMode::PixelFraction), 1.0);
    }

    #[test]
    fn test_coverage_mixed_map() {
        let map = SegmentationMap::new(2, 2, vec![5.0, 2.2, -1.0, 2.3]).unwrap();
        let sum = coverage(&map, CLOUD_THRESHOLD, CoverageMode::SumOfValues);
        assert!((sum - (5.0 + 2.3f32 as f64) / 4.0).abs() < 1e-9);
        assert_eq!(coverage(&map, CLOUD_THRESHOLD, CoverageMode::PixelFraction), 0.5);
    }

    #[test]
    fn test_coverage_mode_parse() {
        assert_eq!(CoverageMode::parse("sum-of-values"), Some(CoverageMode::SumOfValues));
        assert_eq!(CoverageMode::parse("PIXEL_FRACTION"), Some(CoverageMode::PixelFraction));
        assert_eq!(CoverageMode::parse("mean"), None);
        assert_eq!(CoverageMode::default(), CoverageMode::SumOfValues);
    }

    #[test]
    fn test_quantize() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(0.5), 128);
        assert_eq!(quantize(1.0), 255);
        assert_eq!(quantize(3.0), 255);
        assert_eq!(quantize(-2.0), 0);
    }

    #[test]
    fn test_encoding_by_extension() {
        assert_eq!(
            ArtifactEncoding::for_path(Path::new("a.exr")).unwrap(),
            ArtifactEncoding::RawFloat(ImageFormat::OpenExr)
        );
        assert_eq!(
            ArtifactEncoding::for_path(Path::new("a.hdr")).unwrap(),
            ArtifactEncoding::RawFloat(ImageFormat::Hdr)
        );
        assert_eq!(
            ArtifactEncoding::for_path(Path::new("a.png")).unwrap(),
            ArtifactEncoding::Quantized(ImageFormat::Png)
        );
        assert!(matches!(
            ArtifactEncoding::for_path(Path::new("a.unknown")),
            Err(CloudSegError::Write { .. })
        ));
        assert!(ArtifactEncoding::for_path(Path::new("a.ico")).is_err());
        assert!(ArtifactEncoding::for_path(Path::new("a.ff")).is_err());
    }

    #[test]
    fn test_persist_exr_keeps_raw_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.exr");
        let map = SegmentationMap::new(2, 2, vec![-1.5, 0.25, 3.0, 7.75]).unwrap();

        persist(&map, &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb32f();
        let red: Vec<f32> = decoded.pixels().map(|p| p[0]).collect();
        assert_eq!(red, map.values());
    }

    #[test]
    fn test_persist_png_quantizes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.png");
        let map = SegmentationMap::new(1, 3, vec![0.0, 0.5, 3.0]).unwrap();

        persist(&map, &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        let samples: Vec<u8> = decoded.pixels().map(|p| p[1]).collect();
        assert_eq!(samples, vec![0, 128, 255]);
    }

    #[test]
    fn test_persist_into_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("map.png");

        let err = persist(&SegmentationMap::filled(4, 4, 1.0), &path).unwrap_err();
        assert!(matches!(err, CloudSegError::Write { .. }));
        assert!(err.to_string().contains("map.png"));
    }

    #[test]
    fn test_persist_hdr_keeps_raw_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("map.hdr");

        persist(&SegmentationMap::filled(4, 4, 3.0), &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb32f();
        assert!(decoded.pixels().all(|p| (p[0] - 3.0).abs() < 1e-3));
    }

    #[test]
    fn test_failed_encode_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.png");

        assert!(persist(&SegmentationMap::filled(0, 4, 1.0), &path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_unsupported_format_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.ico");

        let err = persist(&SegmentationMap::filled(8, 8, 3.0), &path).unwrap_err();
        assert!(matches!(err, CloudSegError::Write { .. }));
        assert!(!path.exists());
    }
}

//! Segmentation Pipeline Module
//!
//! Composes pre-processing, inference and post-processing behind a single
//! `run(source)` call. The bound network is loaded once and shared by every
//! invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::{infer, infer_with_deadline, SegmentationMap};
use super::postprocess::{coverage, persist, ArtifactEncoding, FALLBACK_ARTIFACT_EXTENSION};
use super::preprocess::prepare;
use crate::backend::DevicePlacement;
use crate::config::PipelineConfig;
use crate::model::{load_network, BoundNetwork, UNetConfig};
use crate::utils::error::{CloudSegError, Result};

/// Outcome of one pipeline invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineResult {
    /// Where the segmentation artifact was written
    #[serde(rename = "path")]
    pub artifact_path: PathBuf,

    /// Coverage metric of the raw map
    #[serde(rename = "cloud_percentage")]
    pub coverage: f64,
}

/// Initialize-once, run-many segmentation pipeline
#[derive(Debug, Clone)]
pub struct SegmentationPipeline<B: Backend> {
    network: Arc<BoundNetwork<B>>,
    config: PipelineConfig,
}

impl<B: Backend> SegmentationPipeline<B> {
    /// Wrap an already bound network
    pub fn new(network: Arc<BoundNetwork<B>>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { network, config })
    }

    /// Load the configured parameter set onto `device`
    pub fn from_config(config: PipelineConfig, device: &B::Device) -> Result<Self>
    where
        B::Device: DevicePlacement,
    {
        config.validate()?;
        let network = load_network::<B>(&config.weights_path, &UNetConfig::new(), device)?;
        Self::new(Arc::new(network), config)
    }

    pub fn network(&self) -> &Arc<BoundNetwork<B>> {
        &self.network
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Destination of the artifact for `source`
    pub fn artifact_path(&self, source: &Path) -> Result<PathBuf> {
        let name = source.file_name().ok_or_else(|| CloudSegError::Write {
            path: source.to_path_buf(),
            reason: "source has no file name to derive the artifact from".to_string(),
        })?;

        let mut destination = self.config.output_dir.join(name);
        if let Some(ext) = &self.config.artifact_extension {
            destination.set_extension(ext);
        } else if ArtifactEncoding::for_path(&destination).is_err() {
            debug!("{:?} cannot hold a segmentation map, writing {}", name, FALLBACK_ARTIFACT_EXTENSION);
            destination.set_extension(FALLBACK_ARTIFACT_EXTENSION);
        }
        Ok(destination)
    }

    /// Decode, resize and infer; the raw map is returned without scoring
    pub fn segment(&self, source: &Path) -> Result<SegmentationMap> {
        let start = Instant::now();
        let image = prepare(source, self.config.input_size)?;
        let input = image.into_batch::<B>(self.network.device());
        debug!("Pre-processing took {:?}", start.elapsed());

        let start = Instant::now();
        let map = match self.config.inference_timeout_ms {
            Some(ms) => infer_with_deadline(Arc::clone(&self.network), input, Duration::from_millis(ms))?,
            None => infer(self.network.as_ref(), input)?,
        };
        debug!(
            "Inference on {} took {:?}, scores in [{:.3}, {:.3}]",
            self.network.placement(),
            start.elapsed(),
            map.min(),
            map.max()
        );

        Ok(map)
    }

    /// Segment `source`, score the map and persist it
    pub fn run(&self, source: &Path) -> Result<PipelineResult> {
        let map = self.segment(source)?;

        let start = Instant::now();
        let coverage = coverage(&map, self.config.threshold, self.config.coverage_mode);
        let artifact_path = persist(&map, &self.artifact_path(source)?)?;
        debug!("Post-processing took {:?}", start.elapsed());

        info!(
            "Segmented {:?} -> {:?} ({} coverage {:.4})",
            source, artifact_path, self.config.coverage_mode, coverage
        );
        Ok(PipelineResult { artifact_path, coverage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{parameter_specs, NamedTensor, ParameterSet};
    use burn_ndarray::NdArray;
    use image::{GrayImage, Luma, Rgb, Rgb32FImage, RgbImage};
    use tempfile::TempDir;

    type TestBackend = NdArray;

    /// All-zero parameters with a constant head bias
    fn constant_weights(dir: &Path, bias: f32) -> PathBuf {
        let mut set = ParameterSet::zeros(&parameter_specs(&UNetConfig::new().stages()));
        set.insert("out_conv.bias", NamedTensor::new(vec![1], vec![bias]));

        let path = dir.join("unet_model.safetensors");
        set.write(&path).unwrap();
        path
    }

    fn white_source(dir: &Path) -> PathBuf {
        let path = dir.join("white.png");
        RgbImage::from_pixel(256, 256, Rgb([255, 255, 255])).save(&path).unwrap();
        path
    }

    fn pipeline(dir: &TempDir, extension: Option<&str>) -> SegmentationPipeline<TestBackend> {
        let output = dir.path().join("segmentated");
        std::fs::create_dir_all(&output).unwrap();

        let mut config = PipelineConfig::new(constant_weights(dir.path(), 3.0), output);
        config.artifact_extension = extension.map(str::to_string);
        SegmentationPipeline::from_config(config, &Default::default()).unwrap()
    }

    #[test]
    fn test_end_to_end_png_artifact() {
        let dir = TempDir::new().unwrap();
        let source = white_source(dir.path());
        let pipeline = pipeline(&dir, None);

        let result = pipeline.run(&source).unwrap();
        assert_eq!(result.coverage, 3.0);
        assert_eq!(result.artifact_path, dir.path().join("segmentated").join("white.png"));

        let artifact = image::open(&result.artifact_path).unwrap().to_rgb8();
        assert_eq!(artifact.dimensions(), (384, 384));
        assert!(artifact.pixels().all(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_end_to_end_exr_artifact() {
        let dir = TempDir::new().unwrap();
        let source = white_source(dir.path());
        let pipeline = pipeline(&dir, Some("exr"));

        let map = pipeline.segment(&source).unwrap();
        assert_eq!((map.height(), map.width()), (384, 384));
        assert!(map.values().iter().all(|&v| v == 3.0));

        let result = pipeline.run(&source).unwrap();
        assert_eq!(result.coverage, 3.0);
        assert_eq!(result.artifact_path.extension().unwrap(), "exr");

        let artifact = image::open(&result.artifact_path).unwrap().to_rgb32f();
        assert_eq!(artifact.dimensions(), (384, 384));
        assert!(artifact.pixels().all(|p| p.0 == [3.0, 3.0, 3.0]));
    }

    #[test]
    fn test_pipeline_with_deadline() {
        let dir = TempDir::new().unwrap();
        let weights = constant_weights(dir.path(), 1.0);
        let source = dir.path().join("small.png");
        RgbImage::from_pixel(20, 20, Rgb([10, 20, 30])).save(&source).unwrap();

        let mut config = PipelineConfig::new(weights, dir.path());
        config.input_size = 32;
        config.inference_timeout_ms = Some(60_000);
        config.artifact_extension = Some("exr".to_string());
        let pipeline = SegmentationPipeline::<TestBackend>::from_config(config, &Default::default()).unwrap();

        let result = pipeline.run(&source).unwrap();
        assert_eq!(result.coverage, 0.0);
        assert_eq!(result.artifact_path, dir.path().join("small.exr"));
    }

    fn small_pipeline(dir: &TempDir) -> SegmentationPipeline<TestBackend> {
        let output = dir.path().join("out");
        std::fs::create_dir_all(&output).unwrap();

        let mut config = PipelineConfig::new(constant_weights(dir.path(), 3.0), output);
        config.input_size = 16;
        SegmentationPipeline::from_config(config, &Default::default()).unwrap()
    }

    #[test]
    fn test_hdr_source_keeps_float_artifact() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("scene.hdr");
        Rgb32FImage::from_pixel(16, 16, Rgb([0.5, 0.25, 1.0])).save(&source).unwrap();

        let result = small_pipeline(&dir).run(&source).unwrap();
        assert_eq!(result.artifact_path, dir.path().join("out").join("scene.hdr"));

        let artifact = image::open(&result.artifact_path).unwrap().to_rgb32f();
        assert_eq!(artifact.dimensions(), (16, 16));
        assert!(artifact.pixels().all(|p| (p[0] - 3.0).abs() < 1e-3));
    }

    #[test]
    fn test_unwritable_source_format_falls_back_to_png() {
        let dir = TempDir::new().unwrap();
        let pipeline = small_pipeline(&dir);

        let destination = pipeline.artifact_path(Path::new("uploads/scene.ico")).unwrap();
        assert_eq!(destination, dir.path().join("out").join("scene.png"));

        let kept = pipeline.artifact_path(Path::new("uploads/scene.jpg")).unwrap();
        assert_eq!(kept, dir.path().join("out").join("scene.jpg"));
    }

    #[test]
    fn test_grayscale_source_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("gray.png");
        GrayImage::from_pixel(8, 8, Luma([200])).save(&source).unwrap();

        let mut config = PipelineConfig::new(constant_weights(dir.path(), 3.0), dir.path());
        config.input_size = 16;
        let pipeline = SegmentationPipeline::<TestBackend>::from_config(config, &Default::default()).unwrap();

        let err = pipeline.run(&source).unwrap_err();
        assert!(matches!(err, CloudSegError::UnsupportedChannelCount { channels: 1, .. }));
    }

    #[test]
    fn test_missing_output_directory_fails() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("small.png");
        RgbImage::from_pixel(8, 8, Rgb([0, 0, 0])).save(&source).unwrap();

        let mut config = PipelineConfig::new(constant_weights(dir.path(), 3.0), dir.path().join("nowhere"));
        config.input_size = 16;
        let pipeline = SegmentationPipeline::<TestBackend>::from_config(config, &Default::default()).unwrap();

        assert!(matches!(pipeline.run(&source), Err(CloudSegError::Write { .. })));
    }

    #[test]
    fn test_missing_weights_fail_at_construction() {
        let dir = TempDir::new().unwrap();
        let config = PipelineConfig::new(dir.path().join("absent.safetensors"), dir.path());
        let err = SegmentationPipeline::<TestBackend>::from_config(config, &Default::default()).unwrap_err();
        assert!(err.to_string().contains("absent.safetensors"));
    }

    #[test]
    fn test_result_serializes_for_http_collaborator() {
        let result = PipelineResult {
            artifact_path: PathBuf::from("/srv/segmentated/scene.png"),
            coverage: 0.25,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["path"], "/srv/segmentated/scene.png");
        assert_eq!(json["cloud_percentage"], 0.25);
    }
}

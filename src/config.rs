//! Pipeline Configuration Module
//!
//! Settings read once at pipeline initialization: where the parameter set
//! lives, where artifacts go, and how the raw map is scored.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::inference::postprocess::{CoverageMode, CLOUD_THRESHOLD};
use crate::model::schedule::DOWNSAMPLE_FACTOR;
use crate::model::INPUT_SIZE;
use crate::utils::error::{CloudSegError, Result};

/// Environment variable naming the parameter-set file
pub const ENV_WEIGHTS_PATH: &str = "UNET_WEIGHTS_PATH";
/// Environment variable naming the artifact directory
pub const ENV_OUTPUT_DIR: &str = "SEGMENTATED_IMAGES_DIR";
/// Environment variable overriding the artifact extension
pub const ENV_ARTIFACT_EXT: &str = "SEGMENTATION_ARTIFACT_EXT";
/// Environment variable setting the forward-pass deadline in milliseconds
pub const ENV_TIMEOUT_MS: &str = "SEGMENTATION_TIMEOUT_MS";
/// Environment variable selecting the coverage formula
pub const ENV_COVERAGE_MODE: &str = "SEGMENTATION_COVERAGE_MODE";

/// Parameter-set file used when none is configured
pub const DEFAULT_WEIGHTS_FILE: &str = "unet_model.safetensors";

/// Configuration for the segmentation pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Location of the safetensors parameter set
    pub weights_path: PathBuf,

    /// Directory receiving segmentation artifacts
    pub output_dir: PathBuf,

    /// Square resolution the network runs at
    pub input_size: usize,

    /// Raw-score threshold above which a pixel is cloud
    pub threshold: f32,

    /// Coverage formula
    pub coverage_mode: CoverageMode,

    /// Replace the source extension of the artifact (e.g. "exr")
    pub artifact_extension: Option<String>,

    /// Deadline for the forward pass; unbounded when absent
    pub inference_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weights_path: PathBuf::from(DEFAULT_WEIGHTS_FILE),
            output_dir: PathBuf::from("segmentated"),
            input_size: INPUT_SIZE,
            threshold: CLOUD_THRESHOLD,
            coverage_mode: CoverageMode::default(),
            artifact_extension: None,
            inference_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with the default scoring settings
    pub fn new(weights_path: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            weights_path: weights_path.into(),
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let output_dir = value(ENV_OUTPUT_DIR)
            .ok_or_else(|| CloudSegError::Config(format!("{} is not set", ENV_OUTPUT_DIR)))?;

        let mut config = Self::new(
            value(ENV_WEIGHTS_PATH).unwrap_or_else(|| DEFAULT_WEIGHTS_FILE.to_string()),
            output_dir,
        );

        config.artifact_extension = value(ENV_ARTIFACT_EXT).map(|ext| ext.trim_start_matches('.').to_string());

        if let Some(ms) = value(ENV_TIMEOUT_MS) {
            let ms = ms.parse::<u64>().map_err(|e| {
                CloudSegError::Config(format!("{} must be a whole number of milliseconds: {}", ENV_TIMEOUT_MS, e))
            })?;
            config.inference_timeout_ms = Some(ms);
        }

        if let Some(mode) = value(ENV_COVERAGE_MODE) {
            config.coverage_mode = CoverageMode::parse(&mode).ok_or_else(|| {
                CloudSegError::Config(format!(
                    "{} must be 'sum-of-values' or 'pixel-fraction', got '{}'",
                    ENV_COVERAGE_MODE, mode
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 || self.input_size % DOWNSAMPLE_FACTOR != 0 {
            return Err(CloudSegError::Config(format!(
                "input_size must be a positive multiple of {}, got {}",
                DOWNSAMPLE_FACTOR, self.input_size
            )));
        }

        if !self.threshold.is_finite() {
            return Err(CloudSegError::Config("threshold must be finite".to_string()));
        }

        if self.inference_timeout_ms == Some(0) {
            return Err(CloudSegError::Config("inference_timeout_ms must be greater than 0".to_string()));
        }

        if let Some(ext) = &self.artifact_extension {
            if ext.is_empty() || ext.contains(['/', '\\']) {
                return Err(CloudSegError::Config(format!("invalid artifact extension '{}'", ext)));
            }
        }

        Ok(())
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| CloudSegError::file(path, e))?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| CloudSegError::file(path, e))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

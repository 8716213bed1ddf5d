//! # Cloud Segmentation
//!
//! A Rust library for pixel-wise cloud segmentation of satellite and aerial
//! imagery using the Burn framework.
//!
//! ## Features
//!
//! - **Two-level U-Net** whose topology is a declarative stage schedule
//! - **Strict weight loading** from safetensors parameter sets
//! - **Initialize-once pipeline** shared across invocations
//! - **CPU or CUDA** execution selected at compile time
//!
//! ## Modules
//!
//! - `backend`: Compile-time backend selection and device placement
//! - `model`: Stage schedule, U-Net, parameter sets and the bound network
//! - `inference`: Pre-processing, forward passes, post-processing, pipeline and benchmarks
//! - `config`: Pipeline configuration from JSON or the environment
//! - `utils`: Logging and error handling
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cloudseg::backend::{default_device, DefaultBackend};
//! use cloudseg::{PipelineConfig, SegmentationPipeline};
//!
//! let config = PipelineConfig::from_env()?;
//! let pipeline = SegmentationPipeline::<DefaultBackend>::from_config(config, &default_device())?;
//!
//! let result = pipeline.run("uploads/scene.png".as_ref())?;
//! println!("{:?}: {}", result.artifact_path, result.coverage);
//! ```

pub mod backend;
pub mod config;
pub mod inference;
pub mod model;
pub mod utils;

// Re-export commonly used items for convenience
pub use config::PipelineConfig;
pub use inference::{CoverageMode, PipelineResult, SegmentationMap, SegmentationPipeline};
pub use model::{load_network, BoundNetwork, ParameterSet, UNet, UNetConfig};
pub use utils::error::{CloudSegError, Result};

pub use inference::CLOUD_THRESHOLD;
pub use model::INPUT_SIZE;

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

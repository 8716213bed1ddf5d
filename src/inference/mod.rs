//! Inference module for cloud segmentation
//!
//! This module provides:
//! - Image decoding, alpha normalization and resizing
//! - Forward passes with optional deadline
//! - Coverage scoring and artifact persistence
//! - The initialize-once segmentation pipeline
//! - Forward-pass latency benchmarking

pub mod benchmark;
pub mod engine;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;

// Re-export main types for convenience
pub use benchmark::{run_benchmark, BenchmarkConfig, BenchmarkResult, LatencyStats, Timer};
pub use engine::{infer, infer_batch, infer_with_deadline, SegmentationMap};
pub use pipeline::{PipelineResult, SegmentationPipeline};
pub use postprocess::{
    coverage, persist, quantize, ArtifactEncoding, CoverageMode, CLOUD_THRESHOLD, FALLBACK_ARTIFACT_EXTENSION,
};
pub use preprocess::{prepare, prepare_batch, ImageTensor};

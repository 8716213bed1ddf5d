//! Error Handling Module
//!
//! Defines the error taxonomy of the segmentation pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Main error type for cloud segmentation operations
///
/// Every variant is fatal to the invocation that raised it; the pipeline
/// never retries internally.
#[derive(Error, Debug)]
pub enum CloudSegError {
    /// The source image could not be read or decoded
    #[error("Failed to decode image at '{path}': {reason}")]
    Decode { path: PathBuf, reason: String },

    /// The decoded image has a channel count other than 3 or 4
    #[error("Unsupported channel count {channels} in '{path}' (expected 3 or 4)")]
    UnsupportedChannelCount { path: PathBuf, channels: usize },

    /// The parameter set does not match the network schedule
    #[error("Parameter mismatch for '{name}': {reason}")]
    ParameterMismatch { name: String, reason: String },

    /// Input tensor and network parameters live on different devices
    #[error("Device error: network is bound to {expected}, input is on {actual}")]
    Device { expected: String, actual: String },

    /// The segmentation artifact could not be persisted
    #[error("Failed to write artifact '{path}': {reason}")]
    Write { path: PathBuf, reason: String },

    /// Tensor shape incompatible with the network topology
    #[error("Shape error: {0}")]
    Shape(String),

    /// The forward pass exceeded its deadline
    #[error("Inference timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A file could not be read or written
    #[error("IO error on '{path}': {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudSegError {
    pub(crate) fn mismatch(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ParameterMismatch {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an IO error with the path it happened on
    pub(crate) fn file(path: &Path, source: std::io::Error) -> Self {
        Self::File {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for CloudSegError {
    fn from(err: serde_json::Error) -> Self {
        CloudSegError::Serialization(err.to_string())
    }
}

/// Convenience Result type for cloud segmentation operations
pub type Result<T> = std::result::Result<T, CloudSegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_mentions_path() {
        let err = CloudSegError::Decode {
            path: PathBuf::from("/uploads/scene_042.png"),
            reason: "unexpected end of file".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("scene_042.png"));
        assert!(msg.contains("unexpected end of file"));
    }

    #[test]
    fn test_channel_count_error_display() {
        let err = CloudSegError::UnsupportedChannelCount {
            path: PathBuf::from("gray.png"),
            channels: 1,
        };
        assert_eq!(
            err.to_string(),
            "Unsupported channel count 1 in 'gray.png' (expected 3 or 4)"
        );
    }

    #[test]
    fn test_mismatch_helper() {
        let err = CloudSegError::mismatch("up4.weight", "expected [256, 128, 2, 2], found [128, 128, 2, 2]");
        assert!(matches!(err, CloudSegError::ParameterMismatch { .. }));
        assert!(err.to_string().contains("up4.weight"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CloudSegError = io_err.into();
        assert!(matches!(err, CloudSegError::Io(_)));
    }

    #[test]
    fn test_file_error_mentions_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = CloudSegError::file(Path::new("/models/unet_model.safetensors"), io_err);
        assert!(err.to_string().contains("unet_model.safetensors"));
        assert!(err.to_string().contains("file not found"));
    }
}

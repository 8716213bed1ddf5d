//! Model module for the cloud segmentation network
//!
//! This module provides:
//! - The declarative U-Net stage schedule and shape propagation
//! - The Burn implementation of the two-level U-Net
//! - Parameter sets (safetensors) and strict weight loading
//! - The device-bound network shared by pipeline invocations

pub mod bound;
pub mod schedule;
pub mod unet;
pub mod weights;

// Re-export main types for convenience
pub use bound::BoundNetwork;
pub use schedule::{parameter_specs, propagate_shapes, ParameterSpec, StageDescriptor, StageOp, StageShape};
pub use unet::{UNet, UNetConfig};
pub use weights::{bind_parameters, load_network, load_parameters, NamedTensor, ParameterSet};

/// Spatial resolution the network was trained at
pub const INPUT_SIZE: usize = 384;

/// Channels fed to the network (RGB + alpha)
pub const INPUT_CHANNELS: usize = 4;

//! Backend abstraction - Multi-backend support
//!
//! Supports both CUDA (GPU) and NdArray (CPU) backends, selected at compile time.
//! Inference only: no autodiff backend is compiled in, so forward passes never
//! record a gradient graph.

use serde::{Deserialize, Serialize};

// --------------------------------------------------------------------------------
// BACKEND SELECTION: CUDA (preferred) or NdArray (fallback)
// --------------------------------------------------------------------------------

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
pub type DefaultBackend = burn_ndarray::NdArray;

#[cfg(all(not(feature = "cuda"), not(feature = "ndarray")))]
compile_error!("At least one backend (cuda or ndarray) must be enabled!");

/// Device type of the default backend
pub type DefaultDevice = <DefaultBackend as burn::tensor::backend::Backend>::Device;

/// Get the default device
pub fn default_device() -> DefaultDevice {
    DefaultDevice::default()
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(all(not(feature = "cuda"), feature = "ndarray"))]
    {
        "NdArray (CPU)"
    }
}

/// Where a bound network executes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ComputeDevice {
    /// General-purpose CPU
    Cpu,
    /// Accelerator with its ordinal
    Gpu(usize),
}

impl ComputeDevice {
    pub fn is_accelerator(&self) -> bool {
        matches!(self, ComputeDevice::Gpu(_))
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "CPU"),
            ComputeDevice::Gpu(id) => write!(f, "GPU:{}", id),
        }
    }
}

/// Maps a backend device handle onto a [`ComputeDevice`]
pub trait DevicePlacement {
    fn placement(&self) -> ComputeDevice;
}

impl DevicePlacement for burn_ndarray::NdArrayDevice {
    fn placement(&self) -> ComputeDevice {
        ComputeDevice::Cpu
    }
}

#[cfg(feature = "cuda")]
impl DevicePlacement for burn_cuda::CudaDevice {
    fn placement(&self) -> ComputeDevice {
        ComputeDevice::Gpu(self.index)
    }
}

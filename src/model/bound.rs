//! A loaded network bound to one compute device

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use burn::tensor::{backend::Backend, Tensor};

use super::schedule::ParameterSpec;
use super::unet::UNet;
use crate::backend::{ComputeDevice, DevicePlacement};

/// Network with concrete parameters, resident on a single device.
///
/// Shared read-only between pipeline invocations. Burn modules are `Send` but
/// not guaranteed `Sync`, so forward passes are serialized by a lock held for
/// exactly the duration of the pass.
#[derive(Debug)]
pub struct BoundNetwork<B: Backend> {
    network: Mutex<UNet<B>>,
    device: B::Device,
    placement: ComputeDevice,
    in_channels: usize,
    out_channels: usize,
}

impl<B: Backend> BoundNetwork<B> {
    pub fn new(network: UNet<B>, device: B::Device) -> Self
    where
        B::Device: DevicePlacement,
    {
        let placement = device.placement();
        Self {
            in_channels: network.in_channels(),
            out_channels: network.out_channels(),
            network: Mutex::new(network),
            device,
            placement,
        }
    }

    /// Device holding every parameter tensor
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn placement(&self) -> ComputeDevice {
        self.placement
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        self.lock().parameter_specs()
    }

    /// Raw forward pass; callers validate the input first
    pub(crate) fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.lock().forward(input)
    }

    /// [`Self::forward`], skipped if `abandoned` is set once the lock is held
    pub(crate) fn forward_unless(&self, input: Tensor<B, 4>, abandoned: &AtomicBool) -> Option<Tensor<B, 4>> {
        let network = self.lock();
        if abandoned.load(Ordering::Acquire) {
            return None;
        }
        Some(network.forward(input))
    }

    // The forward pass never mutates the module, so a poisoned lock still
    // guards valid parameters.
    fn lock(&self) -> std::sync::MutexGuard<'_, UNet<B>> {
        self.network.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Image Pre-processing Module
//!
//! Decodes a source image into a host-side CHW float tensor, normalizes the
//! channel count to RGBA and stretches it to the network's square input.

use std::path::Path;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::DynamicImage;
use tracing::debug;

use crate::model::INPUT_CHANNELS;
use crate::utils::error::{CloudSegError, Result};

/// Value of the synthesized alpha channel
const OPAQUE: f32 = 1.0;

/// Host-side image tensor, axes (channel, height, width)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f32>,
}

impl ImageTensor {
    /// Wrap a CHW buffer
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(CloudSegError::Shape(format!(
                "buffer of {} values does not describe a {}x{}x{} image",
                data.len(),
                channels,
                height,
                width
            )));
        }

        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    /// Image of constant value
    pub fn filled(channels: usize, height: usize, width: usize, value: f32) -> Self {
        Self {
            channels,
            height,
            width,
            data: vec![value; channels * height * width],
        }
    }

    /// Read and decode an image file
    pub fn decode(path: &Path) -> Result<Self> {
        let image = image::open(path).map_err(|e| CloudSegError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_image(&image, path)
    }

    /// Convert a decoded image; samples are scaled to [0, 1]
    pub fn from_image(image: &DynamicImage, path: &Path) -> Result<Self> {
        let channels = image.color().channel_count() as usize;
        let (width, height) = (image.width() as usize, image.height() as usize);
        if width == 0 || height == 0 {
            return Err(CloudSegError::Decode {
                path: path.to_path_buf(),
                reason: "image has no pixels".to_string(),
            });
        }

        let interleaved = match channels {
            3 => image.to_rgb32f().into_raw(),
            4 => image.to_rgba32f().into_raw(),
            _ => {
                return Err(CloudSegError::UnsupportedChannelCount {
                    path: path.to_path_buf(),
                    channels,
                })
            }
        };

        let pixels = width * height;
        let mut data = vec![0.0f32; channels * pixels];
        for (i, pixel) in interleaved.chunks_exact(channels).enumerate() {
            for (c, &value) in pixel.iter().enumerate() {
                data[c * pixels + i] = value;
            }
        }

        debug!("Decoded {:?}: {}x{} with {} channels", path, width, height, channels);
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Values of one channel
    pub fn plane(&self, channel: usize) -> &[f32] {
        let size = self.height * self.width;
        &self.data[channel * size..(channel + 1) * size]
    }

    /// Append an all-ones alpha plane to an RGB image; RGBA passes through.
    pub fn with_opaque_alpha(mut self) -> Result<Self> {
        match self.channels {
            3 => {
                self.data.resize(self.data.len() + self.height * self.width, OPAQUE);
                self.channels = INPUT_CHANNELS;
                Ok(self)
            }
            4 => Ok(self),
            channels => Err(CloudSegError::Shape(format!(
                "cannot normalize a {}-channel tensor to RGBA",
                channels
            ))),
        }
    }

    /// Bilinear resize of every plane to `height` x `width`.
    ///
    /// Aspect ratio is not preserved. When downscaling the filter support
    /// widens with the scale factor, which antialiases the result.
    pub fn resize(&self, height: usize, width: usize) -> Self {
        if height == self.height && width == self.width {
            return self.clone();
        }
        if self.height == 0 || self.width == 0 {
            return Self::filled(self.channels, height, width, 0.0);
        }

        let columns = filter_taps(self.width, width);
        let rows = filter_taps(self.height, height);

        let mut data = Vec::with_capacity(self.channels * height * width);
        let mut horizontal = vec![0.0f32; self.height * width];

        for c in 0..self.channels {
            let src = self.plane(c);

            for sy in 0..self.height {
                let row = &src[sy * self.width..(sy + 1) * self.width];
                for (dx, taps) in columns.iter().enumerate() {
                    horizontal[sy * width + dx] = taps.apply(|sx| row[sx]);
                }
            }

            for taps in &rows {
                for dx in 0..width {
                    data.push(taps.apply(|sy| horizontal[sy * width + dx]));
                }
            }
        }

        Self {
            channels: self.channels,
            height,
            width,
            data,
        }
    }

    /// Move to `device` with a leading batch axis of size 1
    pub fn into_batch<B: Backend>(self, device: &B::Device) -> Tensor<B, 4> {
        let shape = [1, self.channels, self.height, self.width];
        Tensor::from_data(TensorData::new(self.data, shape), device)
    }
}

/// Normalized triangle-filter weights for one destination sample
#[derive(Debug, Clone)]
struct FilterTaps {
    start: usize,
    weights: Vec<f32>,
}

impl FilterTaps {
    fn apply(&self, sample: impl Fn(usize) -> f32) -> f32 {
        self.weights
            .iter()
            .enumerate()
            .map(|(i, w)| sample(self.start + i) * w)
            .sum()
    }
}

fn filter_taps(src_len: usize, dst_len: usize) -> Vec<FilterTaps> {
    let scale = src_len as f32 / dst_len as f32;
    let support = scale.max(1.0);

    (0..dst_len)
        .map(|d| {
            let center = (d as f32 + 0.5) * scale;
            let lo = (center - support).floor().max(0.0) as usize;
            let hi = ((center + support).ceil() as usize).min(src_len - 1);

            let mut weights: Vec<f32> = (lo..=hi)
                .map(|s| {
                    let dist = ((s as f32 + 0.5) - center).abs() / support;
                    if dist < 1.0 {
                        1.0 - dist
                    } else {
                        0.0
                    }
                })
                .collect();

            let total: f32 = weights.iter().sum();
            if total > 0.0 {
                weights.iter_mut().for_each(|w| *w /= total);
                FilterTaps { start: lo, weights }
            } else {
                // nearest neighbour
                let nearest = (center.floor() as usize).min(src_len - 1);
                FilterTaps {
                    start: nearest,
                    weights: vec![1.0],
                }
            }
        })
        .collect()
}

/// Decode, normalize to RGBA and resize to `size` x `size`
pub fn prepare(path: &Path, size: usize) -> Result<ImageTensor> {
    let image = ImageTensor::decode(path)?.with_opaque_alpha()?;
    Ok(image.resize(size, size))
}

/// [`prepare`] followed by [`ImageTensor::into_batch`]
pub fn prepare_batch<B: Backend>(path: &Path, size: usize, device: &B::Device) -> Result<Tensor<B, 4>> {
    Ok(prepare(path, size)?.into_batch(device))
}

//! Inference Engine Module
//!
//! Runs forward passes of a bound network and copies the result back to the
//! host as a [`SegmentationMap`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use burn::tensor::{backend::Backend, Tensor};
use tracing::{debug, warn};

use crate::model::schedule::DOWNSAMPLE_FACTOR;
use crate::model::BoundNetwork;
use crate::utils::error::{CloudSegError, Result};

/// Raw single-channel network output for one image, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMap {
    height: usize,
    width: usize,
    values: Vec<f32>,
}

impl SegmentationMap {
    pub fn new(height: usize, width: usize, values: Vec<f32>) -> Result<Self> {
        if values.len() != height * width {
            return Err(CloudSegError::Shape(format!(
                "{} values do not form a {}x{} map",
                values.len(),
                height,
                width
            )));
        }
        Ok(Self { height, width, values })
    }

    /// Map of constant value
    pub fn filled(height: usize, width: usize, value: f32) -> Self {
        Self {
            height,
            width,
            values: vec![value; height * width],
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Height x width; batch and channel axes are not counted
    pub fn pixel_count(&self) -> usize {
        self.height * self.width
    }

    pub fn min(&self) -> f32 {
        self.values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    /// Split a `[batch, 1, H, W]` output into one map per batch item
    fn split_batch<B: Backend>(output: Tensor<B, 4>) -> Result<Vec<Self>> {
        let [batch, channels, height, width] = output.dims();
        if channels != 1 {
            return Err(CloudSegError::Shape(format!(
                "segmentation output must have 1 channel, got {}",
                channels
            )));
        }

        let values = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CloudSegError::Serialization(format!("output readback failed: {:?}", e)))?;

        let size = height * width;
        values
            .chunks_exact(size.max(1))
            .take(batch)
            .map(|chunk| Self::new(height, width, chunk.to_vec()))
            .collect()
    }
}

/// Fail unless the input lives where the network's parameters live
pub(crate) fn check_device<D: PartialEq + Debug>(bound: &D, input: &D) -> Result<()> {
    if bound == input {
        Ok(())
    } else {
        Err(CloudSegError::Device {
            expected: format!("{:?}", bound),
            actual: format!("{:?}", input),
        })
    }
}

fn check_input<B: Backend>(network: &BoundNetwork<B>, input: &Tensor<B, 4>) -> Result<()> {
    check_device(network.device(), &input.device())?;

    let [batch, channels, height, width] = input.dims();
    if batch == 0 {
        return Err(CloudSegError::Shape("empty batch".to_string()));
    }
    if channels != network.in_channels() {
        return Err(CloudSegError::Shape(format!(
            "network expects {} input channels, got {}",
            network.in_channels(),
            channels
        )));
    }
    if height == 0 || width == 0 || height % DOWNSAMPLE_FACTOR != 0 || width % DOWNSAMPLE_FACTOR != 0 {
        return Err(CloudSegError::Shape(format!(
            "input size {}x{} must be a positive multiple of {}",
            height, width, DOWNSAMPLE_FACTOR
        )));
    }
    Ok(())
}

/// Forward pass over a batch, one map per item
pub fn infer_batch<B: Backend>(network: &BoundNetwork<B>, input: Tensor<B, 4>) -> Result<Vec<SegmentationMap>> {
    check_input(network, &input)?;

    let start = Instant::now();
    let output = network.forward(input);
    let maps = SegmentationMap::split_batch(output)?;
    debug!("Forward pass over {} image(s) took {:?}", maps.len(), start.elapsed());

    Ok(maps)
}

fn check_single<B: Backend>(input: &Tensor<B, 4>) -> Result<()> {
    let [batch, ..] = input.dims();
    if batch != 1 {
        return Err(CloudSegError::Shape(format!("expected a batch of 1, got {}", batch)));
    }
    Ok(())
}

fn single_map(mut maps: Vec<SegmentationMap>) -> Result<SegmentationMap> {
    maps.pop()
        .ok_or_else(|| CloudSegError::Shape("forward pass produced no output".to_string()))
}

/// Forward pass over a single image (`[1, C, H, W]`)
pub fn infer<B: Backend>(network: &BoundNetwork<B>, input: Tensor<B, 4>) -> Result<SegmentationMap> {
    check_single(&input)?;
    single_map(infer_batch(network, input)?)
}

/// [`infer`] bounded by `deadline`.
///
/// The pass runs on a worker thread. On expiry the caller gets
/// [`CloudSegError::Timeout`]. A worker still queued on the network lock at
/// that point skips its pass; one already running finishes and its result
/// is discarded.
pub fn infer_with_deadline<B: Backend>(
    network: Arc<BoundNetwork<B>>,
    input: Tensor<B, 4>,
    deadline: Duration,
) -> Result<SegmentationMap> {
    check_single(&input)?;
    check_input(network.as_ref(), &input)?;

    let (tx, rx) = mpsc::channel();
    let abandoned = Arc::new(AtomicBool::new(false));
    let worker_abandoned = Arc::clone(&abandoned);
    let start = Instant::now();

    std::thread::Builder::new()
        .name("unet-forward".to_string())
        .spawn(move || match network.forward_unless(input, &worker_abandoned) {
            // receiver is gone once the deadline passed
            Some(output) => {
                let _ = tx.send(SegmentationMap::split_batch(output).and_then(single_map));
            }
            None => debug!("Deadline passed while queued, forward pass skipped"),
        })?;

    match rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            abandoned.store(true, Ordering::Release);
            let elapsed_ms = start.elapsed().as_millis() as u64;
            warn!("Forward pass exceeded its {:?} deadline", deadline);
            Err(CloudSegError::Timeout { elapsed_ms })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CloudSegError::Io(std::io::Error::other(
            "inference worker terminated without a result",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UNetConfig;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn network() -> BoundNetwork<TestBackend> {
        let device = Default::default();
        BoundNetwork::new(UNetConfig::new().init(&device), device)
    }

    fn random_input(network: &BoundNetwork<TestBackend>, batch: usize, size: usize) -> Tensor<TestBackend, 4> {
        Tensor::random([batch, 4, size, size], Distribution::Uniform(0.0, 1.0), network.device())
    }

    #[test]
    fn test_infer_is_deterministic() {
        let network = network();
        let input = random_input(&network, 1, 32);

        let first = infer(&network, input.clone()).unwrap();
        let second = infer(&network, input).unwrap();

        assert_eq!((first.height(), first.width()), (32, 32));
        assert_eq!(first, second);
    }

    #[test]
    fn test_infer_batch_splits_items() {
        let network = network();
        let maps = infer_batch(&network, random_input(&network, 3, 16)).unwrap();

        assert_eq!(maps.len(), 3);
        assert!(maps.iter().all(|m| m.pixel_count() == 256));
    }

    #[test]
    fn test_infer_requires_single_image() {
        let network = network();
        let err = infer(&network, random_input(&network, 2, 16)).unwrap_err();
        assert!(matches!(err, CloudSegError::Shape(_)));
    }

    #[test]
    fn test_wrong_channel_count_is_rejected() {
        let network = network();
        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], network.device());

        let err = infer(&network, input).unwrap_err();
        assert!(err.to_string().contains("expects 4 input channels"));
    }

    #[test]
    fn test_indivisible_size_is_rejected() {
        let network = network();
        let input = Tensor::<TestBackend, 4>::zeros([1, 4, 18, 16], network.device());
        assert!(matches!(infer(&network, input), Err(CloudSegError::Shape(_))));
    }

    #[test]
    fn test_device_check() {
        assert!(check_device(&0usize, &0usize).is_ok());

        let err = check_device(&"Cuda(0)", &"Cpu").unwrap_err();
        match err {
            CloudSegError::Device { expected, actual } => {
                assert!(expected.contains("Cuda(0)"));
                assert!(actual.contains("Cpu"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deadline_met() {
        let network = Arc::new(network());
        let input = random_input(&network, 1, 16);

        let map = infer_with_deadline(Arc::clone(&network), input.clone(), Duration::from_secs(60)).unwrap();
        assert_eq!(map, infer(network.as_ref(), input).unwrap());
    }

    #[test]
    fn test_deadline_expired() {
        let network = Arc::new(network());
        let input = random_input(&network, 1, 128);

        let err = infer_with_deadline(network, input, Duration::from_nanos(1)).unwrap_err();
        assert!(matches!(err, CloudSegError::Timeout { .. }));
    }

    #[test]
    fn test_timed_out_call_does_not_block_later_calls() {
        let network = Arc::new(network());
        let busy = {
            let network = Arc::clone(&network);
            std::thread::spawn(move || {
                let input = random_input(&network, 1, 128);
                infer(network.as_ref(), input).is_ok()
            })
        };

        let input = random_input(&network, 1, 16);
        let err = infer_with_deadline(Arc::clone(&network), input.clone(), Duration::from_nanos(1)).unwrap_err();
        assert!(matches!(err, CloudSegError::Timeout { .. }));

        assert!(busy.join().unwrap());
        let map = infer_with_deadline(network, input, Duration::from_secs(60)).unwrap();
        assert_eq!(map.pixel_count(), 256);
    }

    #[test]
    fn test_map_accessors() {
        let map = SegmentationMap::new(2, 3, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(map.min(), 0.0);
        assert_eq!(map.max(), 5.0);
        assert!(SegmentationMap::new(2, 2, vec![0.0; 3]).is_err());
    }
}

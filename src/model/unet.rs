//! U-Net Architecture for Cloud Segmentation
//!
//! Two-level encoder-decoder with skip connections, built with the Burn
//! framework. Maps a `[batch, 4, H, W]` RGBA tensor to a `[batch, 1, H, W]`
//! map of raw (un-activated) cloud scores.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::schedule::{
    propagate_shapes, unet_stages, ParameterSpec, StageDescriptor, StageShape, CONV_KERNEL,
    UPCONV_KERNEL,
};
use super::weights::{NamedLayer, ParameterSet};
use crate::utils::error;

/// Configuration for the U-Net model
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// Number of input channels (RGB + alpha)
    #[config(default = "4")]
    pub in_channels: usize,

    /// Number of output channels
    #[config(default = "1")]
    pub out_channels: usize,
}

impl UNetConfig {
    /// The stage schedule this configuration describes
    pub fn stages(&self) -> Vec<StageDescriptor> {
        unet_stages(self.in_channels, self.out_channels)
    }

    /// Output shape of every stage for a given input shape
    pub fn propagate(&self, input: [usize; 4]) -> error::Result<Vec<StageShape>> {
        propagate_shapes(&self.stages(), input)
    }

    /// Instantiate a network with freshly initialized parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        UNet::new(self, device)
    }
}

/// Two stacked 3x3 convolutions, each followed by ReLU
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub conv2: Conv2d<B>,
    pub relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = |cin: usize| -> Conv2d<B> {
            Conv2dConfig::new([cin, out_channels], [CONV_KERNEL, CONV_KERNEL])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };

        Self {
            conv1: conv(in_channels),
            conv2: conv(out_channels),
            relu: Relu::new(),
        }
    }

    /// Forward pass through the block
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.conv1.forward(x));
        self.relu.forward(self.conv2.forward(x))
    }
}

fn up_conv<B: Backend>(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [UPCONV_KERNEL, UPCONV_KERNEL])
        .with_stride([UPCONV_KERNEL, UPCONV_KERNEL])
        .init(device)
}

fn max_pool() -> MaxPool2d {
    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
}

/// Cloud segmentation U-Net
///
/// Architecture (channels):
/// - down1: in -> 64, pool -> H/2
/// - down2: 64 -> 128, pool -> H/4
/// - bottleneck: 128 -> 256
/// - up4 + skip(down2): 256 -> 128, concat -> 256, conv block -> 128
/// - up5 + skip(down1): 128 -> 64, concat -> 128, conv block -> 64
/// - out_conv: 1x1, 64 -> out, no activation
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    pub down1: ConvBlock<B>,
    pub pool1: MaxPool2d,
    pub down2: ConvBlock<B>,
    pub pool2: MaxPool2d,
    pub bottleneck: ConvBlock<B>,
    pub up4: ConvTranspose2d<B>,
    pub up_conv4: ConvBlock<B>,
    pub up5: ConvTranspose2d<B>,
    pub up_conv5: ConvBlock<B>,
    pub out_conv: Conv2d<B>,

    in_channels: usize,
    out_channels: usize,
}

impl<B: Backend> UNet<B> {
    /// Create a new UNet from configuration; widths come from the stage schedule
    pub fn new(config: &UNetConfig, device: &B::Device) -> Self {
        let stages = config.stages();
        let width = |name: &str| {
            stages
                .iter()
                .find(|s| s.name == name)
                .map(|s| (s.in_channels, s.out_channels))
                .unwrap_or((config.in_channels, config.out_channels))
        };

        let block = |name: &str| -> ConvBlock<B> {
            let (cin, cout) = width(name);
            ConvBlock::new(cin, cout, device)
        };
        let (up4_in, up4_out) = width("up4");
        let (up5_in, up5_out) = width("up5");
        let (head_in, head_out) = width("out_conv");

        Self {
            down1: block("down1"),
            pool1: max_pool(),
            down2: block("down2"),
            pool2: max_pool(),
            bottleneck: block("bottleneck"),
            up4: up_conv(up4_in, up4_out, device),
            up_conv4: block("up_conv4"),
            up5: up_conv(up5_in, up5_out, device),
            up_conv5: block("up_conv5"),
            out_conv: Conv2dConfig::new([head_in, head_out], [1, 1]).init(device),
            in_channels: config.in_channels,
            out_channels: config.out_channels,
        }
    }

    /// Forward pass through the network
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, in_channels, height, width],
    ///   height and width divisible by 4
    ///
    /// # Returns
    /// * Raw scores of shape [batch_size, out_channels, height, width]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        // Encoder
        let c1 = self.down1.forward(x);
        let p1 = self.pool1.forward(c1.clone());

        let c2 = self.down2.forward(p1);
        let p2 = self.pool2.forward(c2.clone());

        let bottleneck = self.bottleneck.forward(p2);

        // Decoder with skip connections
        let u4 = self.up4.forward(bottleneck);
        let c4 = self.up_conv4.forward(Tensor::cat(vec![u4, c2], 1));

        let u5 = self.up5.forward(c4);
        let c5 = self.up_conv5.forward(Tensor::cat(vec![u5, c1], 1));

        self.out_conv.forward(c5)
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Names and shapes of the learnable tensors as instantiated
    pub fn parameter_specs(&self) -> Vec<ParameterSpec> {
        let mut specs = Vec::new();
        self.down1.specs("down1", &mut specs);
        self.down2.specs("down2", &mut specs);
        self.bottleneck.specs("bottleneck", &mut specs);
        self.up4.specs("up4", &mut specs);
        self.up_conv4.specs("up_conv4", &mut specs);
        self.up5.specs("up5", &mut specs);
        self.up_conv5.specs("up_conv5", &mut specs);
        self.out_conv.specs("out_conv", &mut specs);
        specs
    }

    /// Copy every learnable tensor into `set` under its state-dict name
    pub(crate) fn export_parameters(&self, set: &mut ParameterSet) -> error::Result<()> {
        self.down1.export("down1", set)?;
        self.down2.export("down2", set)?;
        self.bottleneck.export("bottleneck", set)?;
        self.up4.export("up4", set)?;
        self.up_conv4.export("up_conv4", set)?;
        self.up5.export("up5", set)?;
        self.up_conv5.export("up_conv5", set)?;
        self.out_conv.export("out_conv", set)
    }

    /// Replace every learnable tensor with its counterpart from `set`
    pub(crate) fn import_parameters(mut self, set: &ParameterSet, device: &B::Device) -> error::Result<Self> {
        self.down1 = self.down1.import("down1", set, device)?;
        self.down2 = self.down2.import("down2", set, device)?;
        self.bottleneck = self.bottleneck.import("bottleneck", set, device)?;
        self.up4 = self.up4.import("up4", set, device)?;
        self.up_conv4 = self.up_conv4.import("up_conv4", set, device)?;
        self.up5 = self.up5.import("up5", set, device)?;
        self.up_conv5 = self.up_conv5.import("up_conv5", set, device)?;
        self.out_conv = self.out_conv.import("out_conv", set, device)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::schedule::parameter_specs;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_module_matches_declared_schedule() {
        let device = Default::default();
        let config = UNetConfig::new();
        let model = UNet::<TestBackend>::new(&config, &device);

        let mut from_module = model.parameter_specs();
        let mut declared = parameter_specs(&config.stages());
        from_module.sort_by(|a, b| a.name.cmp(&b.name));
        declared.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(from_module, declared);
    }

    #[test]
    fn test_unet_output_shape_small_batch() {
        let device = Default::default();
        let model = UNetConfig::new().init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 4, 32, 48], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 1, 32, 48]);
    }

    #[test]
    fn test_custom_channel_counts() {
        let device = Default::default();
        let config = UNetConfig::new().with_in_channels(3).with_out_channels(2);
        let model = UNet::<TestBackend>::new(&config, &device);

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 16, 16], &device);
        assert_eq!(model.forward(input).dims(), [1, 2, 16, 16]);
        assert_eq!(model.in_channels(), 3);
        assert_eq!(model.out_channels(), 2);
    }
}

//! Declarative U-Net stage schedule
//!
//! The topology is expressed as an ordered list of stage descriptors so that
//! shape propagation and the parameter schedule can be checked without running
//! any numeric code.

use serde::Serialize;

use crate::utils::error::{CloudSegError, Result};

/// Channel width of the first encoder stage
pub const BASE_FILTERS: usize = 64;

/// Spatial reduction of the deepest stage (two 2x pools)
pub const DOWNSAMPLE_FACTOR: usize = 4;

/// Kernel size of every convolution inside a conv block
pub const CONV_KERNEL: usize = 3;

/// Kernel and stride of the learned upsampling
pub const UPCONV_KERNEL: usize = 2;

/// Operation performed by a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageOp {
    /// Two stacked 3x3 conv + ReLU at constant resolution
    ConvBlock,
    /// 2x2 max-pool, stride 2
    MaxPool,
    /// 2x2 transposed conv, stride 2
    UpConv,
    /// Channel concatenation with the output of an earlier stage
    Concat { skip: &'static str },
    /// 1x1 conv, no activation
    Head,
}

/// One entry of the schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub in_channels: usize,
    pub out_channels: usize,
    pub op: StageOp,
}

impl StageDescriptor {
    const fn new(name: &'static str, in_channels: usize, out_channels: usize, op: StageOp) -> Self {
        Self {
            name,
            in_channels,
            out_channels,
            op,
        }
    }
}

/// Build the two-level schedule for the given input/output channel counts.
///
/// Channels: `in -> 64 -> 128 -> 256 -> 128 -> 64 -> out`.
pub fn unet_stages(in_channels: usize, out_channels: usize) -> Vec<StageDescriptor> {
    let c1 = BASE_FILTERS;
    let c2 = BASE_FILTERS * 2;
    let c3 = BASE_FILTERS * 4;

    vec![
        StageDescriptor::new("down1", in_channels, c1, StageOp::ConvBlock),
        StageDescriptor::new("pool1", c1, c1, StageOp::MaxPool),
        StageDescriptor::new("down2", c1, c2, StageOp::ConvBlock),
        StageDescriptor::new("pool2", c2, c2, StageOp::MaxPool),
        StageDescriptor::new("bottleneck", c2, c3, StageOp::ConvBlock),
        StageDescriptor::new("up4", c3, c2, StageOp::UpConv),
        StageDescriptor::new("cat4", c2, c2 * 2, StageOp::Concat { skip: "down2" }),
        StageDescriptor::new("up_conv4", c2 * 2, c2, StageOp::ConvBlock),
        StageDescriptor::new("up5", c2, c1, StageOp::UpConv),
        StageDescriptor::new("cat5", c1, c1 * 2, StageOp::Concat { skip: "down1" }),
        StageDescriptor::new("up_conv5", c1 * 2, c1, StageOp::ConvBlock),
        StageDescriptor::new("out_conv", c1, out_channels, StageOp::Head),
    ]
}

/// Output shape of one stage, `[batch, channels, height, width]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageShape {
    pub name: &'static str,
    pub shape: [usize; 4],
}

/// Walk the schedule and compute every stage's output shape.
pub fn propagate_shapes(stages: &[StageDescriptor], input: [usize; 4]) -> Result<Vec<StageShape>> {
    let [batch, channels, height, width] = input;

    if batch == 0 {
        return Err(CloudSegError::Shape("batch size must be at least 1".to_string()));
    }
    if height == 0 || width == 0 || height % DOWNSAMPLE_FACTOR != 0 || width % DOWNSAMPLE_FACTOR != 0 {
        return Err(CloudSegError::Shape(format!(
            "spatial size {}x{} must be a positive multiple of {}",
            height, width, DOWNSAMPLE_FACTOR
        )));
    }

    let mut current = [batch, channels, height, width];
    let mut shapes: Vec<StageShape> = Vec::with_capacity(stages.len());

    for stage in stages {
        if current[1] != stage.in_channels {
            return Err(CloudSegError::Shape(format!(
                "stage '{}' expects {} input channels, got {}",
                stage.name, stage.in_channels, current[1]
            )));
        }

        let [b, _, h, w] = current;
        current = match stage.op {
            StageOp::ConvBlock | StageOp::Head => [b, stage.out_channels, h, w],
            StageOp::MaxPool => [b, stage.out_channels, h / 2, w / 2],
            StageOp::UpConv => [b, stage.out_channels, h * UPCONV_KERNEL, w * UPCONV_KERNEL],
            StageOp::Concat { skip } => {
                let skip_shape = shapes
                    .iter()
                    .find(|s| s.name == skip)
                    .map(|s| s.shape)
                    .ok_or_else(|| {
                        CloudSegError::Shape(format!(
                            "stage '{}' concatenates unknown stage '{}'",
                            stage.name, skip
                        ))
                    })?;
                if skip_shape[2] != h || skip_shape[3] != w {
                    return Err(CloudSegError::Shape(format!(
                        "stage '{}' joins {}x{} with skip '{}' at {}x{}",
                        stage.name, h, w, skip, skip_shape[2], skip_shape[3]
                    )));
                }
                let joined = current[1] + skip_shape[1];
                if joined != stage.out_channels {
                    return Err(CloudSegError::Shape(format!(
                        "stage '{}' declares {} channels, concatenation yields {}",
                        stage.name, stage.out_channels, joined
                    )));
                }
                [b, joined, h, w]
            }
        };

        shapes.push(StageShape {
            name: stage.name,
            shape: current,
        });
    }

    Ok(shapes)
}

/// Declared name and shape of one learnable tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Derive the named parameter schedule.
///
/// Conv blocks expose their two convolutions as `.0` and `.2` (the ReLUs sit
/// at `.1` and `.3` and carry no parameters).
pub fn parameter_specs(stages: &[StageDescriptor]) -> Vec<ParameterSpec> {
    let mut specs = Vec::new();

    for stage in stages {
        let (cin, cout) = (stage.in_channels, stage.out_channels);
        match stage.op {
            StageOp::ConvBlock => {
                specs.push(ParameterSpec::new(
                    format!("{}.0.weight", stage.name),
                    vec![cout, cin, CONV_KERNEL, CONV_KERNEL],
                ));
                specs.push(ParameterSpec::new(format!("{}.0.bias", stage.name), vec![cout]));
                specs.push(ParameterSpec::new(
                    format!("{}.2.weight", stage.name),
                    vec![cout, cout, CONV_KERNEL, CONV_KERNEL],
                ));
                specs.push(ParameterSpec::new(format!("{}.2.bias", stage.name), vec![cout]));
            }
            StageOp::UpConv => {
                specs.push(ParameterSpec::new(
                    format!("{}.weight", stage.name),
                    vec![cin, cout, UPCONV_KERNEL, UPCONV_KERNEL],
                ));
                specs.push(ParameterSpec::new(format!("{}.bias", stage.name), vec![cout]));
            }
            StageOp::Head => {
                specs.push(ParameterSpec::new(format!("{}.weight", stage.name), vec![cout, cin, 1, 1]));
                specs.push(ParameterSpec::new(format!("{}.bias", stage.name), vec![cout]));
            }
            StageOp::MaxPool | StageOp::Concat { .. } => {}
        }
    }

    specs
}

//! Parameter sets and strict weight loading
//!
//! A parameter set is an immutable mapping from state-dict style names
//! (`down1.0.weight`, `up4.bias`, ...) to F32 tensors, persisted in the
//! safetensors format. Loading is all-or-nothing: every declared parameter
//! must be present with the declared shape, and nothing else may be present.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::Path;

use burn::{
    module::{Module, Param},
    nn::conv::{Conv2d, ConvTranspose2d},
    tensor::{backend::Backend, Tensor, TensorData},
};
use safetensors::{tensor::View, Dtype, SafeTensors};
use tracing::{debug, info};

use super::bound::BoundNetwork;
use super::schedule::ParameterSpec;
use super::unet::{ConvBlock, UNet, UNetConfig};
use crate::backend::DevicePlacement;
use crate::utils::error::{CloudSegError, Result};

/// One named tensor held on the host
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl NamedTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Self {
        Self { shape, values }
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let numel = shape.iter().product();
        Self {
            shape,
            values: vec![value; numel],
        }
    }

    /// Copy a device tensor back to the host
    pub fn from_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CloudSegError::Serialization(format!("tensor readback failed: {:?}", e)))?;
        Ok(Self { shape, values })
    }

    fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Named mapping of parameter tensors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    tensors: BTreeMap<String, NamedTensor>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A parameter set with every spec filled with zeros
    pub fn zeros(specs: &[ParameterSpec]) -> Self {
        let mut set = Self::new();
        for spec in specs {
            set.insert(spec.name.clone(), NamedTensor::filled(spec.shape.clone(), 0.0));
        }
        set
    }

    /// Snapshot the current parameters of a network
    pub fn from_network<B: Backend>(network: &UNet<B>) -> Result<Self> {
        let mut set = Self::new();
        network.export_parameters(&mut set)?;
        Ok(set)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: NamedTensor) -> Option<NamedTensor> {
        self.tensors.insert(name.into(), tensor)
    }

    pub fn remove(&mut self, name: &str) -> Option<NamedTensor> {
        self.tensors.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters
    pub fn numel(&self) -> usize {
        self.tensors.values().map(NamedTensor::numel).sum()
    }

    /// Check the set against a parameter schedule without touching any network
    pub fn validate(&self, specs: &[ParameterSpec]) -> Result<()> {
        for spec in specs {
            let tensor = self
                .get(&spec.name)
                .ok_or_else(|| CloudSegError::mismatch(&spec.name, "missing from parameter set"))?;

            if tensor.shape != spec.shape {
                return Err(CloudSegError::mismatch(
                    &spec.name,
                    format!("expected shape {:?}, found {:?}", spec.shape, tensor.shape),
                ));
            }
            if tensor.values.len() != spec.numel() {
                return Err(CloudSegError::mismatch(
                    &spec.name,
                    format!("expected {} values, found {}", spec.numel(), tensor.values.len()),
                ));
            }
        }

        if let Some(extra) = self
            .names()
            .find(|name| !specs.iter().any(|spec| spec.name == *name))
        {
            return Err(CloudSegError::mismatch(extra, "not part of the network schedule"));
        }

        Ok(())
    }

    /// Materialize one entry on a device
    pub fn tensor<B: Backend, const D: usize>(&self, name: &str, device: &B::Device) -> Result<Tensor<B, D>> {
        let entry = self
            .get(name)
            .ok_or_else(|| CloudSegError::mismatch(name, "missing from parameter set"))?;

        if entry.shape.len() != D {
            return Err(CloudSegError::mismatch(
                name,
                format!("expected rank {}, found shape {:?}", D, entry.shape),
            ));
        }

        let data = TensorData::new(entry.values.clone(), entry.shape.clone());
        Ok(Tensor::from_data(data, device))
    }

    /// Read a safetensors file
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| CloudSegError::file(path, e))?;
        let file = SafeTensors::deserialize(&bytes).map_err(|e| {
            CloudSegError::Serialization(format!("failed to parse parameter set {:?}: {}", path, e))
        })?;

        let mut set = Self::new();
        for (name, view) in file.tensors() {
            if view.dtype() != Dtype::F32 {
                return Err(CloudSegError::mismatch(
                    name,
                    format!("expected F32 data, found {:?}", view.dtype()),
                ));
            }

            let values: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            set.insert(name, NamedTensor::new(view.shape().to_vec(), values));
        }

        debug!("Read {} tensors ({} values) from {:?}", set.len(), set.numel(), path);
        Ok(set)
    }

    /// Write the set as a safetensors file
    pub fn write(&self, path: &Path) -> Result<()> {
        let views: Vec<(&str, F32View<'_>)> = self
            .tensors
            .iter()
            .map(|(name, tensor)| (name.as_str(), F32View::new(tensor)))
            .collect();

        let bytes = safetensors::serialize(views, &None).map_err(|e| {
            CloudSegError::Serialization(format!("failed to serialize parameter set: {}", e))
        })?;
        std::fs::write(path, bytes).map_err(|e| CloudSegError::file(path, e))?;

        debug!("Wrote {} tensors to {:?}", self.len(), path);
        Ok(())
    }
}

/// Little-endian F32 view handed to the safetensors serializer
struct F32View<'a> {
    shape: &'a [usize],
    bytes: Vec<u8>,
}

impl<'a> F32View<'a> {
    fn new(tensor: &'a NamedTensor) -> Self {
        Self {
            shape: &tensor.shape,
            bytes: tensor.values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }
}

impl View for F32View<'_> {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        self.shape
    }

    fn data(&self) -> Cow<[u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Layers that know their state-dict names
pub(crate) trait NamedLayer<B: Backend>: Sized {
    fn specs(&self, prefix: &str, out: &mut Vec<ParameterSpec>);
    fn export(&self, prefix: &str, set: &mut ParameterSet) -> Result<()>;
    fn import(self, prefix: &str, set: &ParameterSet, device: &B::Device) -> Result<Self>;
}

impl<B: Backend> NamedLayer<B> for Conv2d<B> {
    fn specs(&self, prefix: &str, out: &mut Vec<ParameterSpec>) {
        out.push(ParameterSpec::new(format!("{prefix}.weight"), self.weight.val().dims().to_vec()));
        if let Some(bias) = &self.bias {
            out.push(ParameterSpec::new(format!("{prefix}.bias"), bias.val().dims().to_vec()));
        }
    }

    fn export(&self, prefix: &str, set: &mut ParameterSet) -> Result<()> {
        set.insert(format!("{prefix}.weight"), NamedTensor::from_tensor(self.weight.val())?);
        if let Some(bias) = &self.bias {
            set.insert(format!("{prefix}.bias"), NamedTensor::from_tensor(bias.val())?);
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, set: &ParameterSet, device: &B::Device) -> Result<Self> {
        self.weight = Param::from_tensor(set.tensor::<B, 4>(&format!("{prefix}.weight"), device)?);
        if self.bias.is_some() {
            self.bias = Some(Param::from_tensor(set.tensor::<B, 1>(&format!("{prefix}.bias"), device)?));
        }
        Ok(self)
    }
}

impl<B: Backend> NamedLayer<B> for ConvTranspose2d<B> {
    fn specs(&self, prefix: &str, out: &mut Vec<ParameterSpec>) {
        out.push(ParameterSpec::new(format!("{prefix}.weight"), self.weight.val().dims().to_vec()));
        if let Some(bias) = &self.bias {
            out.push(ParameterSpec::new(format!("{prefix}.bias"), bias.val().dims().to_vec()));
        }
    }

    fn export(&self, prefix: &str, set: &mut ParameterSet) -> Result<()> {
        set.insert(format!("{prefix}.weight"), NamedTensor::from_tensor(self.weight.val())?);
        if let Some(bias) = &self.bias {
            set.insert(format!("{prefix}.bias"), NamedTensor::from_tensor(bias.val())?);
        }
        Ok(())
    }

    fn import(mut self, prefix: &str, set: &ParameterSet, device: &B::Device) -> Result<Self> {
        self.weight = Param::from_tensor(set.tensor::<B, 4>(&format!("{prefix}.weight"), device)?);
        if self.bias.is_some() {
            self.bias = Some(Param::from_tensor(set.tensor::<B, 1>(&format!("{prefix}.bias"), device)?));
        }
        Ok(self)
    }
}

// Sequential layout of a conv block: conv (0), relu (1), conv (2), relu (3)
impl<B: Backend> NamedLayer<B> for ConvBlock<B> {
    fn specs(&self, prefix: &str, out: &mut Vec<ParameterSpec>) {
        self.conv1.specs(&format!("{prefix}.0"), out);
        self.conv2.specs(&format!("{prefix}.2"), out);
    }

    fn export(&self, prefix: &str, set: &mut ParameterSet) -> Result<()> {
        self.conv1.export(&format!("{prefix}.0"), set)?;
        self.conv2.export(&format!("{prefix}.2"), set)
    }

    fn import(mut self, prefix: &str, set: &ParameterSet, device: &B::Device) -> Result<Self> {
        self.conv1 = self.conv1.import(&format!("{prefix}.0"), set, device)?;
        self.conv2 = self.conv2.import(&format!("{prefix}.2"), set, device)?;
        Ok(self)
    }
}

/// Overwrite every parameter of a fresh network from `set`.
///
/// The set is validated against the network's own schedule before anything is
/// assigned. On error the network is dropped, so no partially loaded network
/// can be observed.
pub fn load_parameters<B: Backend>(
    network: UNet<B>,
    set: &ParameterSet,
    device: &B::Device,
) -> Result<UNet<B>> {
    set.validate(&network.parameter_specs())?;
    let network = network.import_parameters(set, device)?;
    Ok(network.to_device(device))
}

/// Load a parameter-set file and bind the resulting network to `device`.
pub fn load_network<B: Backend>(
    path: &Path,
    config: &UNetConfig,
    device: &B::Device,
) -> Result<BoundNetwork<B>>
where
    B::Device: DevicePlacement,
{
    info!("Loading U-Net parameters from {:?}", path);
    let set = ParameterSet::read(path)?;
    bind_parameters(&set, config, device)
}

/// Bind an in-memory parameter set to `device`.
pub fn bind_parameters<B: Backend>(
    set: &ParameterSet,
    config: &UNetConfig,
    device: &B::Device,
) -> Result<BoundNetwork<B>>
where
    B::Device: DevicePlacement,
{
    let network = load_parameters(UNet::new(config, device), set, device)?;
    let bound = BoundNetwork::new(network, device.clone());
    info!(
        "U-Net bound to {} ({} tensors, {} parameters)",
        bound.placement(),
        set.len(),
        set.numel()
    );
    Ok(bound)
}

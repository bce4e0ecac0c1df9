//! Samplers.

use std::sync::Arc;

use crate::backend::{Backend, DeviceApi};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::pipeline::CompareOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub max_anisotropy: Option<f32>,
    pub compare: Option<CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub name: Option<String>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            max_anisotropy: None,
            compare: None,
            min_lod: 0.0,
            max_lod: 1000.0,
            name: None,
        }
    }
}

pub(crate) struct SamplerShared<B: Backend> {
    pub(crate) native: B::Sampler,
    pub(crate) desc: SamplerDesc,
    pub(crate) device: Arc<DeviceShared<B>>,
}

pub struct Sampler<B: Backend> {
    shared: Option<Arc<SamplerShared<B>>>,
}

impl<B: Backend> Default for Sampler<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for Sampler<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Sampler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("desc", &self.shared.as_ref().map(|s| &s.desc))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Sampler<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &SamplerDesc) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        if desc.min_lod > desc.max_lod {
            return Err(Error::invalid(format!(
                "Sampler min_lod {} exceeds max_lod {}",
                desc.min_lod, desc.max_lod
            )));
        }
        if let Some(aniso) = desc.max_anisotropy
            && !(1.0..=16.0).contains(&aniso)
        {
            return Err(Error::invalid(format!("Anisotropy {aniso} outside 1..=16")));
        }
        let native = device.native.create_sampler(desc)?;
        self.shared = Some(Arc::new(SamplerShared {
            native,
            desc: desc.clone(),
            device: Arc::clone(device),
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<SamplerShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("Sampler"))
    }

    pub fn desc(&self) -> Result<&SamplerDesc> {
        Ok(&self.shared()?.desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::soft_device;

    #[test]
    fn rejects_inverted_lod_range() {
        let (_system, device) = soft_device();
        let desc = SamplerDesc {
            min_lod: 4.0,
            max_lod: 1.0,
            ..SamplerDesc::default()
        };
        assert!(device.create_sampler(&desc).is_err());
        let desc = SamplerDesc {
            max_anisotropy: Some(32.0),
            ..SamplerDesc::default()
        };
        assert!(device.create_sampler(&desc).is_err());
        assert!(device.create_sampler(&SamplerDesc::default()).is_ok());
    }
}

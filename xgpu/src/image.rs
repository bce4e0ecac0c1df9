//! Images and their per-subresource state.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::backend::{Backend, DeviceApi};
use crate::buffer::MemoryLocality;
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::lock;
use crate::state::{ResourceState, Subresource, SubresourceRange, SubresourceStates};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub dimension: ImageDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: ImageUsage,
    pub locality: MemoryLocality,
    pub name: Option<String>,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            dimension: ImageDimension::D2,
            width: 1,
            height: 1,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            format: Format::Rgba8Unorm,
            usage: ImageUsage::SAMPLED,
            locality: MemoryLocality::Device,
            name: None,
        }
    }
}

impl ImageDesc {
    pub fn texture_2d(width: u32, height: u32, format: Format, usage: ImageUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            ..Self::default()
        }
    }

    pub fn full_range(&self) -> SubresourceRange {
        SubresourceRange {
            base_mip: 0,
            mip_count: self.mip_levels,
            base_layer: 0,
            layer_count: self.array_layers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(Error::invalid(format!(
                "Image extent {}x{}x{} has a zero dimension",
                self.width, self.height, self.depth
            )));
        }
        let max_dim = match self.dimension {
            ImageDimension::D1 => self.width,
            ImageDimension::D2 => self.width.max(self.height),
            ImageDimension::D3 => self.width.max(self.height).max(self.depth),
        };
        let max_mips = u32::BITS - max_dim.leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(Error::invalid(format!(
                "Mip level count {} outside 1..={max_mips}",
                self.mip_levels
            )));
        }
        if self.array_layers == 0 {
            return Err(Error::invalid("Image needs at least one array layer"));
        }
        if self.dimension == ImageDimension::D3 && self.array_layers != 1 {
            return Err(Error::invalid("3D images cannot have array layers"));
        }
        if self.dimension != ImageDimension::D3 && self.depth != 1 {
            return Err(Error::invalid("Only 3D images may have depth"));
        }
        if self.dimension == ImageDimension::D1 && self.height != 1 {
            return Err(Error::invalid("1D images must have height 1"));
        }
        if self.format == Format::Undefined {
            return Err(Error::invalid("Image format is undefined"));
        }
        if self.usage.is_empty() {
            return Err(Error::invalid("Image usage must be non-empty"));
        }
        if self.format.is_depth() && self.usage.intersects(ImageUsage::COLOR_ATTACHMENT | ImageUsage::STORAGE) {
            return Err(Error::invalid(format!("{:?} cannot be a color or storage image", self.format)));
        }
        if !self.format.is_depth() && self.usage.contains(ImageUsage::DEPTH_ATTACHMENT) {
            return Err(Error::invalid(format!("{:?} cannot be a depth attachment", self.format)));
        }
        Ok(())
    }
}

pub(crate) struct ImageShared<B: Backend> {
    pub(crate) native: B::Image,
    pub(crate) desc: ImageDesc,
    pub(crate) states: Mutex<SubresourceStates>,
    pub(crate) device: Arc<DeviceShared<B>>,
}

pub struct Image<B: Backend> {
    shared: Option<Arc<ImageShared<B>>>,
}

impl<B: Backend> Default for Image<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for Image<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Image<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("desc", &self.shared.as_ref().map(|s| &s.desc))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Image<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &ImageDesc) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        desc.validate()?;
        let native = device.native.create_image(desc)?;
        self.shared = Some(Self::wrap(device, native, desc.clone()));
        Ok(())
    }

    /// Wrap an image the back end created elsewhere, such as a swapchain image.
    pub(crate) fn from_native(device: &Arc<DeviceShared<B>>, native: B::Image, desc: ImageDesc) -> Self {
        Self {
            shared: Some(Self::wrap(device, native, desc)),
        }
    }

    fn wrap(device: &Arc<DeviceShared<B>>, native: B::Image, desc: ImageDesc) -> Arc<ImageShared<B>> {
        Arc::new(ImageShared {
            native,
            states: Mutex::new(SubresourceStates::new(desc.mip_levels, desc.array_layers, ResourceState::Undefined)),
            desc,
            device: Arc::clone(device),
        })
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<ImageShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("Image"))
    }

    pub fn desc(&self) -> Result<&ImageDesc> {
        Ok(&self.shared()?.desc)
    }

    /// Last state recorded for `sub` by a barrier.
    pub fn state(&self, sub: Subresource) -> Result<ResourceState> {
        lock(&self.shared()?.states).get(sub)
    }

    /// The tracked state of the whole image, if every subresource agrees.
    pub fn uniform_state(&self) -> Result<Option<ResourceState>> {
        let shared = self.shared()?;
        let states = lock(&shared.states);
        Ok(states.uniform_state(states.full_range()))
    }

    /// The native back-end image.
    pub fn native(&self) -> Result<&B::Image> {
        Ok(&self.shared()?.native)
    }

    pub(crate) fn ptr_eq(&self, other: &Image<B>) -> bool {
        match (&self.shared, &other.shared) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::soft_device;

    #[test]
    fn new_images_start_undefined() {
        let (_system, device) = soft_device();
        let image = device
            .create_image(&ImageDesc {
                mip_levels: 3,
                array_layers: 2,
                ..ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST)
            })
            .unwrap();
        assert_eq!(image.state(Subresource::new(2, 1)).unwrap(), ResourceState::Undefined);
        assert_eq!(image.uniform_state().unwrap(), Some(ResourceState::Undefined));
        assert!(image.state(Subresource::new(3, 0)).is_err());
    }

    #[test]
    fn validation_rejects_bad_descs() {
        let too_many_mips = ImageDesc {
            mip_levels: 5,
            ..ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED)
        };
        assert!(too_many_mips.validate().is_err());
        let depth_color = ImageDesc::texture_2d(8, 8, Format::D32Float, ImageUsage::COLOR_ATTACHMENT);
        assert!(depth_color.validate().is_err());
        let color_depth = ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::DEPTH_ATTACHMENT);
        assert!(color_depth.validate().is_err());
        assert!(ImageDesc::texture_2d(0, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED).validate().is_err());
        assert!(ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED).validate().is_ok());
    }

    #[test]
    fn operations_on_uninitialized_image_fail() {
        let image = Image::<crate::Soft>::new();
        assert_eq!(image.desc().unwrap_err().code(), crate::ResultCode::NotInitialized);
    }
}

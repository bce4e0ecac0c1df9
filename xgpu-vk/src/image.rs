//! GPU images ([`Image`]) and views ([`ImageView`]).

use std::sync::Arc;

use ash::vk;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::device::{Device, MemoryUsage};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateImageError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateImageViewError {
    #[error("Vulkan error creating image view: {0}")]
    Vulkan(vk::Result),
}

/// Everything needed to create an [`Image`].
#[derive(Debug, Clone, Copy)]
pub struct ImageInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub memory_usage: MemoryUsage,
}

/// Aspect mask for views and barriers on images of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A `VkImage` bound to memory from the device allocator.
///
/// Created with `OPTIMAL` tiling and an `UNDEFINED` initial layout.
pub struct Image {
    parent: Arc<Device>,
    handle: vk::Image,
    allocation: Option<Allocation>,
    info: ImageInfo,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("handle", &self.handle)
            .field("extent", &self.info.extent)
            .field("format", &self.info.format)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub fn new(device: &Arc<Device>, info: ImageInfo, name: Option<&str>) -> Result<Self, CreateImageError> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(info.image_type)
            .format(info.format)
            .extent(info.extent)
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_image(&create_info) }
            .map_err(CreateImageError::CreateImage)?;

        // SAFETY: handle is a valid image created from device.
        unsafe { device.name_or_warn(handle, "image", name) };

        // SAFETY: handle is a valid image created from this device.
        let reqs = unsafe { device.get_raw_image_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("image"), reqs, info.memory_usage, false)
            .map_err(|e| {
                // SAFETY: handle was created from this device and is not
                // bound to memory yet.
                unsafe { device.destroy_raw_image(handle) };
                CreateImageError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation memory are valid and belong to this
        // device.
        let bind_result =
            unsafe { device.bind_raw_image_memory(handle, allocation.memory(), allocation.offset()) };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free image allocation after bind failure: {free_err}");
            }
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateImageError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            info,
        })
    }

    pub fn raw_image(&self) -> vk::Image {
        self.handle
    }

    pub fn info(&self) -> &ImageInfo {
        &self.info
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Range covering every mip and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_mask(self.info.format))
            .base_mip_level(0)
            .level_count(self.info.mip_levels)
            .base_array_layer(0)
            .layer_count(self.info.array_layers)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this wrapper.
        unsafe { self.parent.destroy_raw_image(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU image allocation: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// ImageView
// ---------------------------------------------------------------------------

/// An owned `VkImageView`.
///
/// Views do not keep their image alive; owners must drop the view first.
pub struct ImageView {
    parent: Arc<Device>,
    handle: vk::ImageView,
}

impl std::fmt::Debug for ImageView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageView")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ImageView {
    /// Create a view of `image` over `range`.
    ///
    /// # Safety
    /// `image` must be a live image created from `device` and must outlive
    /// the returned view.
    pub unsafe fn new(
        device: &Arc<Device>,
        image: vk::Image,
        view_type: vk::ImageViewType,
        format: vk::Format,
        range: vk::ImageSubresourceRange,
        name: Option<&str>,
    ) -> Result<Self, CreateImageViewError> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(range);

        // SAFETY: caller guarantees image provenance.
        let handle = unsafe { device.create_raw_image_view(&create_info) }
            .map_err(CreateImageViewError::Vulkan)?;

        // SAFETY: handle is a valid image view from this device.
        unsafe { device.name_or_warn(handle, "image view", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_image_view(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        tracing::debug!("Dropping image view {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_image_view(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_mask_by_format() {
        assert_eq!(aspect_mask(vk::Format::R8G8B8A8_UNORM), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}

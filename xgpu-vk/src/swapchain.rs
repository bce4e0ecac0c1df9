//! Swapchains ([`Swapchain`]) and the pure selection helpers behind them.

use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::device::{Device, QueueKind};
use crate::surface::{Surface, SurfaceQueryError};

#[derive(Debug, Error)]
pub enum CreateSwapchainError {
    #[error(
        "Mismatched parameters to Swapchain::new. Device, surface, and optional old swapchain must be \
         derived from the same instance"
    )]
    MismatchedParams,

    #[error("No supported surface formats were reported")]
    NoSurfaceFormats,

    #[error("No supported present modes were reported")]
    NoPresentModes,

    #[error("Invalid requested swapchain extent ({width}x{height})")]
    InvalidExtent { width: u32, height: u32 },

    #[error("Swapchain support was not enabled on this device")]
    SwapchainNotEnabled,

    #[error("Failed while querying surface support details: {0}")]
    SurfaceQuery(#[from] SurfaceQueryError),

    #[error("Vulkan error creating swapchain: {0}")]
    VulkanCreate(vk::Result),

    #[error("Vulkan error fetching swapchain images: {0}")]
    VulkanGetImages(vk::Result),

    #[error("Vulkan error creating swapchain image view: {0}")]
    VulkanCreateImageView(vk::Result),
}

/// What the caller would like; every field is a hint clamped to what the
/// surface supports.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub desired_extent: vk::Extent2D,
    pub image_count: u32,
    pub preferred_format: Option<vk::Format>,
    pub preferred_present_mode: vk::PresentModeKHR,
}

fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred_format: Option<vk::Format>,
) -> Option<vk::SurfaceFormatKHR> {
    if let Some(preferred) = preferred_format
        && let Some(found) = formats.iter().copied().find(|f| f.format == preferred)
    {
        return Some(found);
    }

    formats
        .iter()
        .copied()
        .find(|f| f.format == vk::Format::B8G8R8A8_UNORM && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .or_else(|| formats.first().copied())
}

fn choose_present_mode(present_modes: &[vk::PresentModeKHR], preferred: vk::PresentModeKHR) -> vk::PresentModeKHR {
    if present_modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired_extent: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_extent
                .width
                .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
            height: desired_extent
                .height
                .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
        }
    }
}

fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let mut image_count = requested.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

fn choose_composite_alpha(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|mode| capabilities.supported_composite_alpha.contains(*mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::INHERIT)
}

/// Color attachment is mandatory; transfer usages are added when supported
/// so swapchain images can be cleared and copied.
fn choose_image_usage(capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    let optional = vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC;
    vk::ImageUsageFlags::COLOR_ATTACHMENT | (capabilities.supported_usage_flags & optional)
}

fn create_swapchain_image_views<FCreate, FDestroy, FName>(
    images: &[vk::Image],
    format: vk::Format,
    mut create_image_view: FCreate,
    mut destroy_image_view: FDestroy,
    mut name_image_view: FName,
) -> Result<Vec<vk::ImageView>, CreateSwapchainError>
where
    FCreate: FnMut(&vk::ImageViewCreateInfo<'_>) -> Result<vk::ImageView, vk::Result>,
    FDestroy: FnMut(vk::ImageView),
    FName: FnMut(usize, vk::ImageView),
{
    let mut image_views: Vec<vk::ImageView> = Vec::with_capacity(images.len());
    for (index, image) in images.iter().copied().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let image_view = match create_image_view(&create_info) {
            Ok(view) => view,
            Err(e) => {
                for created_view in image_views.drain(..) {
                    destroy_image_view(created_view);
                }
                return Err(CreateSwapchainError::VulkanCreateImageView(e));
            }
        };

        name_image_view(index, image_view);
        image_views.push(image_view);
    }

    Ok(image_views)
}

/// A `VkSwapchainKHR` with one 2D color view per image.
pub struct Swapchain<T: HasDisplayHandle + HasWindowHandle + ?Sized> {
    parent_device: Arc<Device>,
    parent_surface: Arc<Surface<T>>,
    handle: vk::SwapchainKHR,
    format: vk::Format,
    extent: vk::Extent2D,
    usage: vk::ImageUsageFlags,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    /// `vkAcquireNextImageKHR` must be externally synchronized per swapchain.
    acquire_lock: Mutex<()>,
}

impl<T: HasDisplayHandle + HasWindowHandle + ?Sized> std::fmt::Debug for Swapchain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<T: HasDisplayHandle + HasWindowHandle + ?Sized> Swapchain<T> {
    /// Create a swapchain, optionally retiring `old_swapchain`.
    ///
    /// The caller must make sure no pending work still uses the old
    /// swapchain's images once the new one is in use.
    pub fn new(
        parent_device: &Arc<Device>,
        parent_surface: &Arc<Surface<T>>,
        config: SwapchainConfig,
        old_swapchain: Option<&Self>,
    ) -> Result<Self, CreateSwapchainError> {
        if !parent_device.features().swapchain {
            return Err(CreateSwapchainError::SwapchainNotEnabled);
        }
        let desired = config.desired_extent;
        if desired.width == 0 || desired.height == 0 {
            return Err(CreateSwapchainError::InvalidExtent {
                width: desired.width,
                height: desired.height,
            });
        }
        if !Arc::ptr_eq(parent_surface.parent(), parent_device.parent()) {
            return Err(CreateSwapchainError::MismatchedParams);
        }
        if let Some(old) = old_swapchain
            && (!Arc::ptr_eq(&old.parent_device, parent_device) || !Arc::ptr_eq(&old.parent_surface, parent_surface))
        {
            return Err(CreateSwapchainError::MismatchedParams);
        }

        let physical_device = parent_device.physical_device();

        // SAFETY: physical_device belongs to parent_device's instance, and
        // parent_surface is derived from the same instance (checked above).
        let capabilities = unsafe { parent_surface.query_capabilities(physical_device) }?;
        // SAFETY: same reasoning as above.
        let formats = unsafe { parent_surface.query_formats(physical_device) }?;
        // SAFETY: same reasoning as above.
        let present_modes = unsafe { parent_surface.query_present_modes(physical_device) }?;

        let surface_format =
            choose_surface_format(&formats, config.preferred_format).ok_or(CreateSwapchainError::NoSurfaceFormats)?;
        if present_modes.is_empty() {
            return Err(CreateSwapchainError::NoPresentModes);
        }
        let present_mode = choose_present_mode(&present_modes, config.preferred_present_mode);
        let extent = choose_extent(&capabilities, desired);
        let image_count = choose_image_count(&capabilities, config.image_count);
        let usage = choose_image_usage(&capabilities);

        let queue_family_indices = [parent_device.queue_family(QueueKind::Graphics)];

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(parent_surface.raw_handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_family_indices)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(choose_composite_alpha(&capabilities))
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.map_or(vk::SwapchainKHR::null(), |s| s.handle));

        // SAFETY: create_info references handles validated above and values
        // selected from queried surface support.
        let handle = unsafe { parent_device.create_raw_swapchain(&create_info) }?;
        // SAFETY: handle is a valid swapchain created from parent_device.
        unsafe { parent_device.name_or_warn(handle, "swapchain", Some("Swapchain")) };

        // SAFETY: handle was created by this device's swapchain loader.
        let images = unsafe { parent_device.get_raw_swapchain_images(handle) }.inspect_err(|_| {
            // SAFETY: handle was created above and must be destroyed on early
            // exit.
            unsafe { parent_device.destroy_raw_swapchain(handle) };
        })?;

        for (index, image) in images.iter().copied().enumerate() {
            let name = format!("Swapchain Image {index}");
            // SAFETY: image is a swapchain image owned by parent_device.
            unsafe { parent_device.name_or_warn(image, "swapchain image", Some(&name)) };
        }

        let image_views = create_swapchain_image_views(
            &images,
            surface_format.format,
            |create_info| {
                // SAFETY: create_info references a swapchain image from this
                // device with a 2D color range.
                unsafe { parent_device.create_raw_image_view(create_info) }
            },
            |image_view| {
                // SAFETY: image_view was created by parent_device above.
                unsafe { parent_device.destroy_raw_image_view(image_view) };
            },
            |index, image_view| {
                let name = format!("Swapchain ImageView {index}");
                // SAFETY: image_view is valid and created from parent_device.
                unsafe { parent_device.name_or_warn(image_view, "swapchain image view", Some(&name)) };
            },
        )
        .inspect_err(|_| {
            // SAFETY: handle was created above and must be destroyed on early
            // exit.
            unsafe { parent_device.destroy_raw_swapchain(handle) };
        })?;

        tracing::info!(
            "Created swapchain {:?}: {}x{} {:?} {:?}, {} images",
            handle,
            extent.width,
            extent.height,
            surface_format.format,
            present_mode,
            images.len(),
        );

        Ok(Self {
            parent_device: Arc::clone(parent_device),
            parent_surface: Arc::clone(parent_surface),
            handle,
            format: surface_format.format,
            extent,
            usage,
            images,
            image_views,
            acquire_lock: Mutex::new(()),
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn raw_handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn image_views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn surface(&self) -> &Arc<Surface<T>> {
        &self.parent_surface
    }

    /// Acquire the next presentable image. Returns `(image_index,
    /// suboptimal)`; `Err(ERROR_OUT_OF_DATE_KHR)` means the swapchain must be
    /// recreated.
    ///
    /// # Safety
    /// `semaphore` must be an unsignaled semaphore from this swapchain's
    /// device with no pending operations.
    pub unsafe fn acquire_next_image(
        &self,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let _guard = self.acquire_lock.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: caller guarantees semaphore validity; self.handle is live.
        unsafe {
            self.parent_device
                .acquire_next_swapchain_image(self.handle, timeout_ns, semaphore)
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphore` signals.
    /// `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// `image_index` must have been acquired and transitioned to
    /// `PRESENT_SRC_KHR` by work that signals `wait_semaphore`.
    pub unsafe fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool, vk::Result> {
        let swapchains = [self.handle];
        let indices = [image_index];
        let waits = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&indices);
        // SAFETY: caller guarantees image and semaphore state.
        unsafe { self.parent_device.queue_present(&present_info) }
    }
}

impl<T: HasDisplayHandle + HasWindowHandle + ?Sized> Drop for Swapchain<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping swapchain {:?}", self.handle);
        for image_view in self.image_views.drain(..) {
            // SAFETY: image_view was created by parent_device; owners idle the
            // device before dropping a swapchain.
            unsafe { self.parent_device.destroy_raw_image_view(image_view) };
        }
        // SAFETY: the swapchain was created by parent_device and its views
        // are gone.
        unsafe { self.parent_device.destroy_raw_swapchain(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::cell::RefCell;

    #[test]
    fn choose_surface_format_prefers_bgra_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[fallback, preferred], None);
        assert_eq!(chosen.map(|f| f.format), Some(preferred.format));
    }

    #[test]
    fn choose_surface_format_honours_request_and_handles_empty() {
        let rgba = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[rgba], Some(vk::Format::R8G8B8A8_UNORM));
        assert_eq!(chosen.map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        assert!(choose_surface_format(&[], None).is_none());
    }

    #[test]
    fn choose_present_mode_uses_preference_when_available() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn choose_extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 1920,
                height: 1080,
            },
        );

        assert_eq!((chosen.width, chosen.height), (1280, 720));
    }

    #[test]
    fn choose_extent_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 200,
            },
        );

        assert_eq!((chosen.width, chosen.height), (1920, 480));
    }

    #[test]
    fn choose_image_count_clamps_request() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            ..Default::default()
        };

        assert_eq!(choose_image_count(&capabilities, 1), 2);
        assert_eq!(choose_image_count(&capabilities, 3), 3);
        assert_eq!(choose_image_count(&capabilities, 8), 3);
    }

    #[test]
    fn choose_composite_alpha_prefers_opaque_then_pre_multiplied() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED
                | vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        };
        assert_eq!(choose_composite_alpha(&capabilities), vk::CompositeAlphaFlagsKHR::OPAQUE);
    }

    #[test]
    fn image_usage_adds_supported_transfer_bits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        };
        assert_eq!(
            choose_image_usage(&capabilities),
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn image_view_helper_cleans_up_on_partial_failure() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2), vk::Image::from_raw(3)];
        let created_view = vk::ImageView::from_raw(10);
        let create_calls = RefCell::new(0usize);
        let destroyed = RefCell::new(Vec::<vk::ImageView>::new());

        let result = create_swapchain_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut call = create_calls.borrow_mut();
                let ret = match *call {
                    0 => Ok(created_view),
                    _ => Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
                };
                *call += 1;
                ret
            },
            |view| destroyed.borrow_mut().push(view),
            |_index, _view| {},
        );

        assert!(matches!(
            result,
            Err(CreateSwapchainError::VulkanCreateImageView(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
        ));
        assert_eq!(destroyed.borrow().as_slice(), &[created_view]);
    }

    #[test]
    fn image_view_helper_returns_all_views_on_success() {
        let images = [vk::Image::from_raw(1), vk::Image::from_raw(2)];
        let views = [vk::ImageView::from_raw(100), vk::ImageView::from_raw(101)];
        let create_calls = RefCell::new(0usize);
        let name_calls = RefCell::new(0usize);

        let result = create_swapchain_image_views(
            &images,
            vk::Format::B8G8R8A8_UNORM,
            |_| {
                let mut call = create_calls.borrow_mut();
                let view = views[*call];
                *call += 1;
                Ok(view)
            },
            |_view| panic!("destroy callback should not be called on success"),
            |_index, _view| {
                *name_calls.borrow_mut() += 1;
            },
        )
        .expect("helper should succeed");

        assert_eq!(result, views);
        assert_eq!(*name_calls.borrow(), 2);
    }
}

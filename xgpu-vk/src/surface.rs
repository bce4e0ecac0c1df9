//! Presentation surfaces ([`Surface`]).

use std::sync::Arc;

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::instance::Instance;

#[derive(Debug, Error)]
pub enum CreateSurfaceError {
    #[error("Couldn't get display handle: {0}")]
    InvalidDisplayHandle(raw_window_handle::HandleError),
    #[error("Couldn't get window handle: {0}")]
    InvalidWindowHandle(raw_window_handle::HandleError),
    #[error("Vulkan surface creation failed: {0}")]
    VulkanError(vk::Result),
    #[error("Parent instance was created without surface extensions")]
    MissingExtension,
}

#[derive(Debug, Error)]
pub enum SurfaceSupportError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error checking surface support: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum SurfaceQueryError {
    #[error("Surface extension is not loaded")]
    ExtensionNotLoaded,
    #[error("Vulkan error querying surface: {0}")]
    Vulkan(vk::Result),
}

/// A `VkSurfaceKHR` tied to the window it was created from.
///
/// `T` may be unsized, so `Surface<dyn SomeWindowTrait>` works for callers
/// that erase their window type.
pub struct Surface<T: HasWindowHandle + HasDisplayHandle + ?Sized> {
    parent_instance: Arc<Instance>,
    handle: vk::SurfaceKHR,
    _source: Arc<T>,
}

impl<T: HasWindowHandle + HasDisplayHandle + ?Sized> std::fmt::Debug for Surface<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("handle", &self.handle)
            .field("parent", &self.parent_instance)
            .finish_non_exhaustive()
    }
}

impl<T: HasWindowHandle + HasDisplayHandle + ?Sized> Surface<T> {
    /// Create a surface for `source`.
    ///
    /// # Safety
    /// The surface is implicitly invalidated when the platform window goes
    /// away (for example on a winit suspend), so it must be dropped before
    /// that happens. No in-flight GPU work may reference it at drop time.
    pub unsafe fn new(instance: &Arc<Instance>, source: Arc<T>) -> Result<Self, CreateSurfaceError> {
        // SAFETY: we keep both the instance and the source alive in self.
        let handle = unsafe { instance.create_raw_surface(&*source) }?;
        Ok(Self {
            parent_instance: Arc::clone(instance),
            handle,
            _source: source,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent_instance
    }

    pub fn raw_handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// # Safety
    /// `physical_device` must be derived from this surface's instance.
    pub unsafe fn supports_queue_family(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family_index: u32,
    ) -> Result<bool, SurfaceSupportError> {
        // SAFETY: caller guarantees provenance, self.handle is live.
        unsafe {
            self.parent_instance.get_raw_physical_device_surface_support(
                physical_device,
                queue_family_index,
                self.handle,
            )
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this surface's instance.
    pub unsafe fn query_capabilities(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<vk::SurfaceCapabilitiesKHR, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.parent_instance
                .get_surface_capabilities(physical_device, self.handle)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this surface's instance.
    pub unsafe fn query_formats(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::SurfaceFormatKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.parent_instance
                .get_surface_formats(physical_device, self.handle)
        }
    }

    /// # Safety
    /// `physical_device` must be derived from this surface's instance.
    pub unsafe fn query_present_modes(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::PresentModeKHR>, SurfaceQueryError> {
        // SAFETY: caller guarantees provenance.
        unsafe {
            self.parent_instance
                .get_surface_present_modes(physical_device, self.handle)
        }
    }
}

impl<T: HasWindowHandle + HasDisplayHandle + ?Sized> Drop for Surface<T> {
    fn drop(&mut self) {
        tracing::debug!("Dropping surface {:?}", self.handle);
        // SAFETY: swapchains hold an Arc to their surface, so nothing derived
        // from it is left.
        let result = unsafe { self.parent_instance.destroy_raw_surface(self.handle) };
        if let Err(e) = result {
            tracing::error!("Error while dropping surface {:?}: {e}", self.handle);
        }
    }
}

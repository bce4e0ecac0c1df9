//! Sampler wrapper ([`Sampler`]).

use std::sync::Arc;

use ash::vk;

use crate::device::Device;

/// An owned `VkSampler`.
pub struct Sampler {
    parent: Arc<Device>,
    handle: vk::Sampler,
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Sampler {
    /// Create a sampler from a complete create info. Anisotropy is enabled
    /// only when `create_info` asks for it.
    pub fn new(
        device: &Arc<Device>,
        create_info: &vk::SamplerCreateInfo<'_>,
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        // SAFETY: create_info has no pNext chain and no borrowed handles.
        let handle = unsafe { device.create_raw_sampler(create_info) }?;

        // SAFETY: handle is a valid sampler from this device.
        unsafe { device.name_or_warn(handle, "sampler", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_sampler(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        tracing::debug!("Dropping sampler {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this
        // wrapper. No GPU work may still reference it.
        unsafe { self.parent.destroy_raw_sampler(self.handle) };
    }
}

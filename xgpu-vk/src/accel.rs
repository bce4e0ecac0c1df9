//! Acceleration structures ([`AccelerationStructure`]).
//!
//! The wrapper owns the storage buffer the structure lives in. Scratch
//! memory and build recording are left to the caller, who knows whether a
//! build or an update is wanted.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::buffer::{Buffer, CreateBufferError};
use crate::device::{Device, MemoryUsage, RayTracingError};

#[derive(Debug, Error)]
pub enum CreateAccelerationStructureError {
    #[error("Failed to create acceleration structure storage: {0}")]
    Storage(#[from] CreateBufferError),
    #[error(transparent)]
    RayTracing(#[from] RayTracingError),
}

/// A `VkAccelerationStructureKHR` and its storage buffer.
pub struct AccelerationStructure {
    parent: Arc<Device>,
    handle: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
    device_address: vk::DeviceAddress,
    // Fields drop after Drop::drop, so this outlives handle.
    storage: Buffer,
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("handle", &self.handle)
            .field("ty", &self.ty)
            .field("device_address", &self.device_address)
            .finish_non_exhaustive()
    }
}

impl AccelerationStructure {
    /// Create a structure of `ty` backed by `size` bytes of fresh storage.
    pub fn new(
        device: &Arc<Device>,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: Option<&str>,
    ) -> Result<Self, CreateAccelerationStructureError> {
        let storage = Buffer::new(
            device,
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryUsage::GpuOnly,
            name,
        )?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(storage.raw_buffer())
            .offset(0)
            .size(size)
            .ty(ty);
        // SAFETY: storage is a live buffer from device with storage usage.
        let handle = unsafe { device.create_raw_acceleration_structure(&create_info) }?;

        // SAFETY: handle is a live acceleration structure from device.
        let device_address = match unsafe { device.get_raw_acceleration_structure_address(handle) } {
            Ok(address) => address,
            Err(e) => {
                // SAFETY: handle was just created and nothing references it.
                unsafe { device.destroy_raw_acceleration_structure(handle) };
                return Err(e.into());
            }
        };

        // SAFETY: handle is a valid acceleration structure from device.
        unsafe { device.name_or_warn(handle, "acceleration structure", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            ty,
            device_address,
            storage,
        })
    }

    pub fn raw_handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    pub fn storage(&self) -> &Buffer {
        &self.storage
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        tracing::debug!("Dropping acceleration structure {:?}", self.handle);
        // SAFETY: handle was created from parent. Owners keep structures alive
        // until GPU work referencing them completes. The storage buffer is
        // dropped after this body returns.
        unsafe { self.parent.destroy_raw_acceleration_structure(self.handle) };
    }
}

/// Round `size` up to a multiple of `alignment` (a power of two, or zero
/// for no alignment).
pub fn align_up(size: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        size
    } else {
        size.div_ceil(alignment) * alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(257, 0), 257);
    }
}

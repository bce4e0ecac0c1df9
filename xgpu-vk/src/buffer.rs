//! GPU buffers ([`Buffer`]).
//!
//! One wrapper covers every memory usage. Host-visible buffers can be
//! written with [`write_bytes`](Buffer::write_bytes) and read back with
//! [`read_bytes`](Buffer::read_bytes); both take care of flushing and
//! invalidating non-coherent memory. Buffers created with
//! `SHADER_DEVICE_ADDRESS` usage expose their [`device_address`](Buffer::device_address).

use std::sync::Arc;

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::device::{Device, MemoryUsage};

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),
}

#[derive(Debug, Error)]
pub enum MapBufferError {
    #[error(
        "Access of {len} bytes at offset {offset} exceeds buffer size ({buffer_bytes} bytes)"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        len: usize,
        buffer_bytes: vk::DeviceSize,
    },

    #[error("Vulkan error flushing mapped memory: {0}")]
    FlushMemory(vk::Result),

    #[error("Vulkan error invalidating mapped memory: {0}")]
    InvalidateMemory(vk::Result),

    #[error("Allocation is not host-mapped")]
    NotMapped,
}

/// A `VkBuffer` bound to memory from the device allocator.
pub struct Buffer {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_usage: MemoryUsage,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("memory_usage", &self.memory_usage)
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        // SAFETY: create_info is fully initialised and has no borrowed data.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;

        // SAFETY: handle is a valid buffer created from device.
        unsafe { device.name_or_warn(handle, "buffer", name) };

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };
        let allocation = device
            .allocate_memory(name.unwrap_or("buffer"), reqs, memory_usage, true)
            .map_err(|e| {
                // SAFETY: handle was created from this device and is not bound
                // to memory yet.
                unsafe { device.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation memory are valid and belong to this
        // device.
        let bind_result = unsafe {
            device.bind_raw_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.free_memory(allocation) {
                tracing::error!("Failed to free buffer allocation after bind failure: {free_err}");
            }
            // SAFETY: handle is valid and owned by this scope.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
            usage,
            memory_usage,
        })
    }

    pub fn raw_buffer(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.memory_usage
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// GPU virtual address, or `None` when the buffer was created without
    /// `SHADER_DEVICE_ADDRESS` usage.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        if !self.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            return None;
        }
        // SAFETY: the buffer is live, bound and has device address usage.
        Some(unsafe { self.parent.get_raw_buffer_device_address(self.handle) })
    }

    fn mapped(&self, offset: vk::DeviceSize, len: usize) -> Result<(&Allocation, *mut u8), MapBufferError> {
        if offset.saturating_add(len as vk::DeviceSize) > self.size {
            return Err(MapBufferError::OutOfBounds {
                offset,
                len,
                buffer_bytes: self.size,
            });
        }
        let allocation = self.allocation.as_ref().ok_or(MapBufferError::NotMapped)?;
        let ptr = allocation.mapped_ptr().ok_or(MapBufferError::NotMapped)?;
        // SAFETY: offset + len is within the buffer, which lies within the
        // mapped allocation.
        Ok((allocation, unsafe { ptr.as_ptr().cast::<u8>().add(offset as usize) }))
    }

    /// Non-coherent range covering `[offset, offset + len)`, rounded out to
    /// `nonCoherentAtomSize`. `None` for coherent memory or empty ranges.
    fn non_coherent_range(
        &self,
        allocation: &Allocation,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Option<vk::MappedMemoryRange<'static>> {
        let coherent = allocation
            .memory_properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);
        if coherent || len == 0 {
            return None;
        }
        let atom = self.parent.limits().non_coherent_atom_size;
        // Device::allocate_memory pads non-coherent allocations to the atom.
        debug_assert!(allocation.offset().is_multiple_of(atom));
        let start = offset / atom * atom;
        let end = (offset + len as vk::DeviceSize).div_ceil(atom) * atom;
        Some(
            vk::MappedMemoryRange::default()
                // SAFETY: allocation was returned by gpu-allocator for this
                // device and remains live while self is alive.
                .memory(unsafe { allocation.memory() })
                .offset(allocation.offset() + start)
                .size((end - start).min(allocation.size() - start)),
        )
    }

    /// Copy `bytes` into the buffer at `offset`, flushing if needed.
    ///
    /// The caller must ensure no pending GPU work reads or writes the range.
    pub fn write_bytes(&mut self, offset: vk::DeviceSize, bytes: &[u8]) -> Result<(), MapBufferError> {
        let (allocation, dst) = self.mapped(offset, bytes.len())?;
        // SAFETY: dst points to at least bytes.len() mapped bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        if let Some(range) = self.non_coherent_range(allocation, offset, bytes.len()) {
            // SAFETY: range lies within a mapped allocation from this device.
            unsafe { self.parent.flush_raw_mapped_memory_ranges(std::slice::from_ref(&range)) }
                .map_err(MapBufferError::FlushMemory)?;
        }
        Ok(())
    }

    pub fn write_pod<T: Pod>(&mut self, offset: vk::DeviceSize, data: &[T]) -> Result<(), MapBufferError> {
        self.write_bytes(offset, bytemuck::cast_slice(data))
    }

    /// Copy `out.len()` bytes starting at `offset` out of the buffer,
    /// invalidating first if needed.
    pub fn read_bytes(&self, offset: vk::DeviceSize, out: &mut [u8]) -> Result<(), MapBufferError> {
        let (allocation, src) = self.mapped(offset, out.len())?;
        if let Some(range) = self.non_coherent_range(allocation, offset, out.len()) {
            // SAFETY: range lies within a mapped allocation from this device.
            unsafe {
                self.parent
                    .invalidate_raw_mapped_memory_ranges(std::slice::from_ref(&range))
            }
            .map_err(MapBufferError::InvalidateMemory)?;
        }
        // SAFETY: src points to at least out.len() mapped bytes.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        // SAFETY: handle was created from parent and is owned by this wrapper.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };

        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.free_memory(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

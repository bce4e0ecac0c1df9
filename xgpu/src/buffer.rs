//! Buffers and host access to them.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::backend::{Backend, BufferApi, DeviceApi};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::lock;
use crate::state::ResourceState;

/// Which memory a resource lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryLocality {
    /// Device local; not host accessible.
    #[default]
    Device,
    /// Host visible, written by the CPU and read by the GPU.
    Upload,
    /// Host visible, written by the GPU and read by the CPU.
    Readback,
}

impl MemoryLocality {
    pub fn host_visible(self) -> bool {
        self != MemoryLocality::Device
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const CONSTANT = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
        const DEVICE_ADDRESS = 1 << 7;
        /// Geometry or instance input to acceleration structure builds.
        const ACCELERATION_STRUCTURE_INPUT = 1 << 8;
        const SHADER_BINDING_TABLE = 1 << 9;
    }
}

impl BufferUsage {
    /// Whether the buffer will have a GPU virtual address.
    pub fn has_device_address(self) -> bool {
        self.intersects(
            BufferUsage::DEVICE_ADDRESS | BufferUsage::ACCELERATION_STRUCTURE_INPUT | BufferUsage::SHADER_BINDING_TABLE,
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub locality: MemoryLocality,
    pub name: Option<String>,
}

pub(crate) struct BufferShared<B: Backend> {
    pub(crate) native: B::Buffer,
    pub(crate) desc: BufferDesc,
    pub(crate) state: Mutex<ResourceState>,
    pub(crate) device: Arc<DeviceShared<B>>,
}

pub struct Buffer<B: Backend> {
    shared: Option<Arc<BufferShared<B>>>,
}

impl<B: Backend> Default for Buffer<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for Buffer<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Buffer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("desc", &self.shared.as_ref().map(|s| &s.desc))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Buffer<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &BufferDesc) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        if desc.size == 0 {
            return Err(Error::invalid("Buffer size must be non-zero"));
        }
        if desc.usage.is_empty() {
            return Err(Error::invalid("Buffer usage must be non-empty"));
        }
        if desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
            device.require_ray_tracing("acceleration structure input buffers")?;
        }
        let native = device.native.create_buffer(desc)?;
        self.shared = Some(Arc::new(BufferShared {
            native,
            desc: desc.clone(),
            state: Mutex::new(ResourceState::Common),
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

    pub(crate) fn shared(&self) -> Result<&Arc<BufferShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("Buffer"))
    }

    pub fn desc(&self) -> Result<&BufferDesc> {
        Ok(&self.shared()?.desc)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.shared()?.desc.size)
    }

    /// Last state recorded by a barrier.
    pub fn state(&self) -> Result<ResourceState> {
        Ok(*lock(&self.shared()?.state))
    }

    pub fn device_address(&self) -> Result<u64> {
        let shared = self.shared()?;
        shared
            .native
            .device_address()
            .ok_or_else(|| Error::invalid("Buffer was not created with a device-address usage"))
    }

    fn check_host_range(&self, offset: u64, len: usize) -> Result<&Arc<BufferShared<B>>> {
        let shared = self.shared()?;
        if !shared.desc.locality.host_visible() {
            return Err(Error::invalid("Buffer is not host visible"));
        }
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > shared.desc.size) {
            return Err(Error::invalid(format!(
                "Range {offset}+{len} exceeds buffer size {}",
                shared.desc.size
            )));
        }
        Ok(shared)
    }

    /// Copy `bytes` into the buffer at `offset`.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.check_host_range(offset, bytes.len())?.native.write(offset, bytes)
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check_host_range(offset, out.len())?.native.read(offset, out)
    }

    pub fn write_pod<T: bytemuck::Pod>(&self, offset: u64, values: &[T]) -> Result<()> {
        self.write(offset, bytemuck::cast_slice(values))
    }

    /// Read `count` values of `T` starting at `offset`.
    pub fn read_pod<T: bytemuck::Pod>(&self, offset: u64, count: usize) -> Result<Vec<T>> {
        let mut values = vec![T::zeroed(); count];
        self.read(offset, bytemuck::cast_slice_mut(&mut values))?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::soft_device;

    fn upload(device: &Device<crate::Soft>, size: u64) -> Buffer<crate::Soft> {
        device
            .create_buffer(&BufferDesc {
                size,
                usage: BufferUsage::TRANSFER_SRC | BufferUsage::DEVICE_ADDRESS,
                locality: MemoryLocality::Upload,
                name: Some("upload".to_owned()),
            })
            .unwrap()
    }

    #[test]
    fn write_then_read_pod() {
        let (_system, device) = soft_device();
        let buffer = upload(&device, 64);
        buffer.write_pod(8, &[1.5f32, -2.0, 3.25]).unwrap();
        assert_eq!(buffer.read_pod::<f32>(8, 3).unwrap(), vec![1.5, -2.0, 3.25]);
        assert_eq!(buffer.state().unwrap(), ResourceState::Common);
        assert!(buffer.device_address().unwrap() != 0);
    }

    #[test]
    fn host_access_is_bounds_checked() {
        let (_system, device) = soft_device();
        let buffer = upload(&device, 16);
        assert_eq!(buffer.write(12, &[0; 8]).unwrap_err().code(), crate::ResultCode::InvalidArgs);
        assert!(buffer.write(u64::MAX, &[0]).is_err());
    }

    #[test]
    fn device_local_buffers_reject_host_access() {
        let (_system, device) = soft_device();
        let buffer = device
            .create_buffer(&BufferDesc {
                size: 16,
                usage: BufferUsage::STORAGE,
                ..BufferDesc::default()
            })
            .unwrap();
        assert!(buffer.write(0, &[1]).is_err());
        assert!(buffer.device_address().is_err());
    }

    #[test]
    fn zero_size_is_invalid_and_leaves_buffer_uninitialized() {
        let (_system, device) = soft_device();
        let mut buffer = upload(&device, 4);
        let err = buffer
            .initialize(&device, &BufferDesc {
                size: 0,
                usage: BufferUsage::STORAGE,
                ..BufferDesc::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        assert!(!buffer.is_initialized());
        assert_eq!(buffer.size().unwrap_err().code(), crate::ResultCode::NotInitialized);
    }
}

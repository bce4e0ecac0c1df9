//! Shader modules ([`ShaderModule`]) and their entry points.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateShaderModuleError {
    #[error("SPIR-V byte slice length ({0}) is not a multiple of 4")]
    InvalidLength(usize),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// A single pipeline stage an entry point can be compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

impl From<ShaderStage> for vk::ShaderStageFlags {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
            ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
        }
    }
}

/// Reinterpret little-endian SPIR-V bytes as words. Returns `None` when the
/// length is not a multiple of 4.
pub fn spirv_words(bytes: &[u8]) -> Option<Vec<u32>> {
    if !bytes.len().is_multiple_of(4) {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

pub struct ShaderModule {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    pub fn new(device: &Arc<Device>, spirv_bytes: &[u8], name: Option<&str>) -> Result<Self, CreateShaderModuleError> {
        let code =
            spirv_words(spirv_bytes).ok_or(CreateShaderModuleError::InvalidLength(spirv_bytes.len()))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        // SAFETY: create_info contains whole SPIR-V words; content validity is
        // the driver's concern.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderModuleError::Vulkan)?;

        // SAFETY: handle is a valid shader module created from device.
        unsafe { device.name_or_warn(handle, "shader module", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    /// An [`EntryPoint`] view for `name` at `stage`.
    ///
    /// Returns `Err` only if `name` contains an interior NUL byte.
    pub fn entry_point(&self, name: &str, stage: ShaderStage) -> Result<EntryPoint<'_>, std::ffi::NulError> {
        Ok(EntryPoint {
            module: self,
            name: CString::new(name)?,
            stage,
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines do not reference
        // their modules after creation.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}

/// A module paired with an entry point name and stage.
#[derive(Debug)]
pub struct EntryPoint<'a> {
    module: &'a ShaderModule,
    name: CString,
    stage: ShaderStage,
}

impl EntryPoint<'_> {
    /// A `VkPipelineShaderStageCreateInfo` borrowing from `self`.
    pub fn as_pipeline_stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.into())
            .module(self.module.raw_handle())
            .name(&self.name)
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(spirv_words(&bytes), Some(vec![0x0723_0203, 0x0001_0000]));
    }

    #[test]
    fn spirv_words_rejects_partial_word() {
        assert_eq!(spirv_words(&[1, 2, 3]), None);
    }

    #[test]
    fn ray_tracing_stages_map_to_khr_flags() {
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::RayGeneration),
            vk::ShaderStageFlags::RAYGEN_KHR
        );
        assert_eq!(
            vk::ShaderStageFlags::from(ShaderStage::ClosestHit),
            vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );
    }
}

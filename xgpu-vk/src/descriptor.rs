//! Descriptor set layout, pool, and set wrappers.
//!
//! [`DescriptorSetLayout`] describes the binding slots within a descriptor
//! set, including per-binding flags for descriptor indexing.
//! [`DescriptorPool`] allocates and frees individual sets; it needs external
//! synchronization, which its `&mut self` methods make explicit.
//! [`DescriptorSet`] is a plain handle whose writes apply immediately.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum AllocateDescriptorSetError {
    #[error("Descriptor pool is exhausted")]
    OutOfPoolMemory,
    #[error("Vulkan error allocating descriptor set: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

/// A single binding within a descriptor set layout.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBindingDesc {
    /// Binding slot index used by the shader.
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length; the upper bound for variable-count bindings.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    /// Empty unless the device has descriptor indexing enabled.
    pub flags: vk::DescriptorBindingFlags,
}

impl From<DescriptorBindingDesc> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

/// An owned `VkDescriptorSetLayout`.
pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(
        device: &Arc<Device>,
        bindings: &[DescriptorBindingDesc],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let binding_flags: Vec<vk::DescriptorBindingFlags> = bindings.iter().map(|b| b.flags).collect();
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);

        let mut create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        if binding_flags.iter().any(|f| !f.is_empty()) {
            create_info = create_info.push_next(&mut flags_info);
        }

        // SAFETY: create_info references binding data that lives for the call.
        let handle = unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;

        // SAFETY: handle is a valid layout from this device.
        unsafe { device.name_or_warn(handle, "descriptor set layout", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Sets allocated with it keep
        // their own copy of the layout information.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorPool
// ---------------------------------------------------------------------------

/// An owned `VkDescriptorPool` created with `FREE_DESCRIPTOR_SET`.
pub struct DescriptorPool {
    parent: Arc<Device>,
    handle: vk::DescriptorPool,
    max_sets: u32,
    live_sets: u32,
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("handle", &self.handle)
            .field("live_sets", &self.live_sets)
            .field("max_sets", &self.max_sets)
            .finish_non_exhaustive()
    }
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<Device>,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
        // SAFETY: create_info is valid and references only stack data.
        let handle = unsafe { device.create_raw_descriptor_pool(&create_info) }?;

        // SAFETY: handle is a valid pool from this device.
        unsafe { device.name_or_warn(handle, "descriptor pool", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            max_sets,
            live_sets: 0,
        })
    }

    /// Allocate one set. `variable_count` supplies the actual size of a
    /// variable-count last binding.
    pub fn allocate(
        &mut self,
        layout: &DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<DescriptorSet, AllocateDescriptorSetError> {
        if self.live_sets >= self.max_sets {
            return Err(AllocateDescriptorSetError::OutOfPoolMemory);
        }
        let layouts = [layout.raw_descriptor_set_layout()];
        let counts = [variable_count.unwrap_or(0)];
        let mut variable_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default().descriptor_counts(&counts);
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(&layouts);
        if variable_count.is_some() {
            alloc_info = alloc_info.push_next(&mut variable_info);
        }

        // SAFETY: alloc_info references this pool and a layout from the same
        // device; &mut self provides external synchronization.
        let sets = unsafe { self.parent.allocate_raw_descriptor_sets(&alloc_info) }.map_err(|e| match e {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                AllocateDescriptorSetError::OutOfPoolMemory
            }
            e => AllocateDescriptorSetError::Vulkan(e),
        })?;
        let handle = sets
            .first()
            .copied()
            .ok_or(AllocateDescriptorSetError::Vulkan(vk::Result::ERROR_UNKNOWN))?;
        self.live_sets += 1;
        Ok(DescriptorSet { handle })
    }

    /// Return `set` to this pool.
    ///
    /// # Safety
    /// `set` must have been allocated from this pool and must not be
    /// referenced by pending GPU work.
    pub unsafe fn free(&mut self, set: DescriptorSet) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees provenance and idle state.
        unsafe { self.parent.free_raw_descriptor_sets(self.handle, &[set.handle]) }?;
        self.live_sets = self.live_sets.saturating_sub(1);
        Ok(())
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor pool {:?}", self.handle);
        // SAFETY: handle was created from parent. Owners only drop pools after
        // the device is idle.
        unsafe { self.parent.destroy_raw_descriptor_pool(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// DescriptorSet
// ---------------------------------------------------------------------------

/// A descriptor set handle. Its memory belongs to the pool it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSet {
    handle: vk::DescriptorSet,
}

impl DescriptorSet {
    pub fn raw_descriptor_set(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// Write a buffer descriptor (uniform or storage).
    ///
    /// # Safety
    /// `buffer` must be a live buffer from `device` with usage matching `ty`,
    /// and this set must not be in use by pending work.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write_buffer(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        ty: vk::DescriptorType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(&buffer_info));
        // SAFETY: caller guarantees handle validity and idle state.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }

    /// Write an image or sampler descriptor. Pass null handles for the parts
    /// `ty` does not use.
    ///
    /// # Safety
    /// Non-null handles must be live objects from `device`; `layout` must be
    /// the layout the image will be in when shaders access it.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn write_image(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        ty: vk::DescriptorType,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(image_view)
            .sampler(sampler)
            .image_layout(layout);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(ty)
            .image_info(std::slice::from_ref(&image_info));
        // SAFETY: caller guarantees handle validity and idle state.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }

    /// Write an acceleration structure descriptor.
    ///
    /// # Safety
    /// `accel` must be a live acceleration structure from `device`.
    pub unsafe fn write_acceleration_structure(
        &self,
        device: &Device,
        binding: u32,
        array_element: u32,
        accel: vk::AccelerationStructureKHR,
    ) {
        let structures = [accel];
        let mut accel_info =
            vk::WriteDescriptorSetAccelerationStructureKHR::default().acceleration_structures(&structures);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(self.handle)
            .dst_binding(binding)
            .dst_array_element(array_element)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut accel_info);
        // The count is not inferred from the pNext struct.
        write.descriptor_count = 1;
        // SAFETY: caller guarantees handle validity and idle state.
        unsafe { device.update_raw_descriptor_sets(std::slice::from_ref(&write)) }
    }
}

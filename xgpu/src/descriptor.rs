//! Descriptor table layouts and the tables bound to them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::accel::AccelerationStructure;
use crate::backend::{Backend, DescriptorBinding, DescriptorResource, DeviceApi};
use crate::binding::{BINDING_BAND_WIDTH, DescriptorType, native_binding_slot};
use crate::buffer::{Buffer, BufferUsage};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::image::{Image, ImageUsage};
use crate::lock;
use crate::sampler::Sampler;
use crate::shader::ShaderStages;
use crate::state::ResourceState;

/// A run of `count` descriptors of one type starting at logical register
/// `binding`. A dynamic range holds up to `count` descriptors, the actual
/// number chosen per table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub ty: DescriptorType,
    pub binding: u32,
    pub count: u32,
    pub stages: ShaderStages,
    pub dynamic: bool,
}

impl DescriptorRange {
    pub fn new(ty: DescriptorType, binding: u32, count: u32, stages: ShaderStages) -> Self {
        Self {
            ty,
            binding,
            count,
            stages,
            dynamic: false,
        }
    }

    /// A variable-count range of at most `max_count` descriptors.
    pub fn dynamic(ty: DescriptorType, binding: u32, max_count: u32, stages: ShaderStages) -> Self {
        Self {
            dynamic: true,
            ..Self::new(ty, binding, max_count, stages)
        }
    }

    pub fn slot(&self) -> Result<u32> {
        native_binding_slot(self.ty, self.binding)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorTableLayoutDesc {
    pub ranges: Vec<DescriptorRange>,
    pub name: Option<String>,
}

pub(crate) struct DescriptorTableLayoutShared<B: Backend> {
    pub(crate) native: B::DescriptorTableLayout,
    pub(crate) ranges: Vec<DescriptorRange>,
    pub(crate) slots: Vec<u32>,
    /// Position of the dynamic range, if any.
    pub(crate) dynamic: Option<usize>,
    pub(crate) device: Arc<DeviceShared<B>>,
}

fn validate_ranges(ranges: &[DescriptorRange], descriptor_indexing: bool) -> Result<(Vec<u32>, Option<usize>)> {
    let slots = ranges.iter().map(DescriptorRange::slot).collect::<Result<Vec<_>>>()?;
    for (i, range) in ranges.iter().enumerate() {
        if range.count == 0 {
            return Err(Error::invalid(format!("Descriptor range {i} has zero count")));
        }
        if range.stages.is_empty() {
            return Err(Error::invalid(format!("Descriptor range {i} is visible to no stage")));
        }
        // Ranges occupy [slot, slot + count) and stay inside their band.
        if range.binding.checked_add(range.count).is_none_or(|end| end > BINDING_BAND_WIDTH) {
            return Err(Error::invalid(format!(
                "Descriptor range {i} at binding {} with {} descriptors leaves its band of {BINDING_BAND_WIDTH}",
                range.binding, range.count
            )));
        }
        let end = slots[i] + range.count;
        if let Some(j) = (0..i).find(|&j| slots[j] < end && slots[i] < slots[j] + ranges[j].count) {
            return Err(Error::invalid(format!("Descriptor ranges {j} and {i} overlap")));
        }
    }

    let mut dynamic = None;
    for (i, range) in ranges.iter().enumerate().filter(|(_, r)| r.dynamic) {
        if !range.ty.allows_dynamic() {
            return Err(Error::invalid(format!("{:?} ranges cannot be dynamic", range.ty)));
        }
        if dynamic.replace(i).is_some() {
            return Err(Error::invalid("A layout may declare at most one dynamic range"));
        }
        if slots.iter().any(|&s| s > slots[i]) {
            return Err(Error::invalid("The dynamic range must occupy the highest binding slot"));
        }
    }
    if dynamic.is_some() && !descriptor_indexing {
        return Err(Error::not_implemented("dynamic descriptor ranges"));
    }
    Ok((slots, dynamic))
}

pub struct DescriptorTableLayout<B: Backend> {
    shared: Option<Arc<DescriptorTableLayoutShared<B>>>,
}

impl<B: Backend> Default for DescriptorTableLayout<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for DescriptorTableLayout<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for DescriptorTableLayout<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorTableLayout")
            .field("ranges", &self.shared.as_ref().map(|s| &s.ranges))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> DescriptorTableLayout<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &DescriptorTableLayoutDesc) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        let (slots, dynamic) = validate_ranges(&desc.ranges, device.features.descriptor_indexing)?;
        let native = device
            .native
            .create_descriptor_table_layout(&desc.ranges, desc.name.as_deref())?;
        self.shared = Some(Arc::new(DescriptorTableLayoutShared {
            native,
            ranges: desc.ranges.clone(),
            slots,
            dynamic,
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

    pub(crate) fn shared(&self) -> Result<&Arc<DescriptorTableLayoutShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("DescriptorTableLayout"))
    }

    pub fn ranges(&self) -> Result<&[DescriptorRange]> {
        Ok(&self.shared()?.ranges)
    }
}

// ---------------------------------------------------------------------------
// DescriptorTable
// ---------------------------------------------------------------------------

pub struct DescriptorTableDesc<B: Backend> {
    pub layout: DescriptorTableLayout<B>,
    /// Descriptor count of the layout's dynamic range; defaults to its max.
    pub variable_count: Option<u32>,
    pub name: Option<String>,
}

type Retained = Arc<dyn Any + Send + Sync>;

pub(crate) struct DescriptorTableShared<B: Backend> {
    pub(crate) native: B::DescriptorTable,
    pub(crate) layout: Arc<DescriptorTableLayoutShared<B>>,
    pub(crate) variable_count: Option<u32>,
    written: Mutex<HashMap<(usize, u32), Retained>>,
}

pub struct DescriptorTable<B: Backend> {
    shared: Option<Arc<DescriptorTableShared<B>>>,
}

impl<B: Backend> Default for DescriptorTable<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for DescriptorTable<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for DescriptorTable<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorTable")
            .field("variable_count", &self.shared.as_ref().map(|s| s.variable_count))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> DescriptorTable<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &DescriptorTableDesc<B>) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        let layout = desc.layout.shared()?;
        if !Arc::ptr_eq(&layout.device, device) {
            return Err(Error::invalid("Descriptor table layout belongs to another device"));
        }
        let variable_count = match (layout.dynamic, desc.variable_count) {
            (None, None) => None,
            (None, Some(_)) => return Err(Error::invalid("Variable count given for a layout without a dynamic range")),
            (Some(i), count) => {
                let max = layout.ranges[i].count;
                let count = count.unwrap_or(max);
                if count > max {
                    return Err(Error::invalid(format!("Variable count {count} exceeds range maximum {max}")));
                }
                Some(count)
            }
        };
        let native = device
            .native
            .create_descriptor_table(&layout.native, variable_count, desc.name.as_deref())?;
        self.shared = Some(Arc::new(DescriptorTableShared {
            native,
            layout: Arc::clone(layout),
            variable_count,
            written: Mutex::new(HashMap::new()),
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<DescriptorTableShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("DescriptorTable"))
    }

    pub fn variable_count(&self) -> Result<Option<u32>> {
        Ok(self.shared()?.variable_count)
    }

    /// Resolve `(ty, binding, index)` to a range of this table's layout.
    fn locate(
        &self,
        ty: DescriptorType,
        binding: u32,
        index: u32,
    ) -> Result<(&Arc<DescriptorTableShared<B>>, DescriptorBinding)> {
        let shared = self.shared()?;
        let layout = &shared.layout;
        let slot = native_binding_slot(ty, binding)?;
        let range_index = layout
            .slots
            .iter()
            .position(|&s| s == slot)
            .ok_or_else(|| Error::invalid(format!("Layout has no range at {ty:?} binding {binding}")))?;
        let range = &layout.ranges[range_index];
        if range.ty != ty {
            return Err(Error::invalid(format!(
                "Range at binding {binding} holds {:?}, not {ty:?}",
                range.ty
            )));
        }
        let count = if layout.dynamic == Some(range_index) {
            shared.variable_count.unwrap_or(range.count)
        } else {
            range.count
        };
        if index >= count {
            return Err(Error::invalid(format!("Array index {index} outside range of {count}")));
        }
        Ok((
            shared,
            DescriptorBinding {
                range_index,
                slot,
                ty,
                array_index: index,
            },
        ))
    }

    fn check_device(&self, shared: &DescriptorTableShared<B>, device: &Arc<DeviceShared<B>>) -> Result<()> {
        if Arc::ptr_eq(&shared.layout.device, device) {
            Ok(())
        } else {
            Err(Error::invalid("Descriptor resource belongs to another device"))
        }
    }

    fn write(
        &self,
        shared: &DescriptorTableShared<B>,
        binding: DescriptorBinding,
        resource: DescriptorResource<'_, B>,
        retained: Retained,
    ) -> Result<()> {
        shared.layout.device.native.write_descriptor(&shared.native, binding, resource)?;
        lock(&shared.written).insert((binding.range_index, binding.array_index), retained);
        Ok(())
    }

    fn set_buffer_range(
        &self,
        ty: DescriptorType,
        binding: u32,
        index: u32,
        buffer: &Buffer<B>,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        let (shared, target) = self.locate(ty, binding, index)?;
        let buffer = buffer.shared()?;
        self.check_device(shared, &buffer.device)?;
        let caps = &shared.layout.device.descriptor;
        let (usage, alignment) = if ty == DescriptorType::ConstantBuffer {
            (BufferUsage::CONSTANT, caps.min_uniform_buffer_offset_alignment)
        } else {
            (BufferUsage::STORAGE, caps.min_storage_buffer_offset_alignment)
        };
        if !buffer.desc.usage.contains(usage) {
            return Err(Error::invalid(format!("Buffer lacks {usage:?} usage")));
        }
        if !offset.is_multiple_of(alignment.max(1)) {
            return Err(Error::invalid(format!("Offset {offset} is not a multiple of {alignment}")));
        }
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > buffer.desc.size) {
            return Err(Error::invalid(format!(
                "Range {offset}+{size} outside buffer of {}",
                buffer.desc.size
            )));
        }
        self.write(
            shared,
            target,
            DescriptorResource::Buffer {
                buffer: &buffer.native,
                offset,
                size,
            },
            Arc::clone(buffer) as Retained,
        )
    }

    pub fn set_constant_buffer(
        &self,
        binding: u32,
        index: u32,
        buffer: &Buffer<B>,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.set_buffer_range(DescriptorType::ConstantBuffer, binding, index, buffer, offset, size)
    }

    pub fn set_buffer(&self, binding: u32, index: u32, buffer: &Buffer<B>, offset: u64, size: u64) -> Result<()> {
        self.set_buffer_range(DescriptorType::Buffer, binding, index, buffer, offset, size)
    }

    pub fn set_rw_buffer(&self, binding: u32, index: u32, buffer: &Buffer<B>, offset: u64, size: u64) -> Result<()> {
        self.set_buffer_range(DescriptorType::RwBuffer, binding, index, buffer, offset, size)
    }

    fn set_image_view(&self, ty: DescriptorType, binding: u32, index: u32, image: &Image<B>) -> Result<()> {
        let (shared, target) = self.locate(ty, binding, index)?;
        let image = image.shared()?;
        self.check_device(shared, &image.device)?;
        let (usage, state) = if ty == DescriptorType::Texture {
            (ImageUsage::SAMPLED, ResourceState::ShaderRead)
        } else {
            (ImageUsage::STORAGE, ResourceState::ShaderReadWrite)
        };
        if !image.desc.usage.contains(usage) {
            return Err(Error::invalid(format!("Image lacks {usage:?} usage")));
        }
        self.write(
            shared,
            target,
            DescriptorResource::Image {
                image: &image.native,
                state,
            },
            Arc::clone(image) as Retained,
        )
    }

    /// Bind a sampled image, read in `ShaderRead`.
    pub fn set_image(&self, binding: u32, index: u32, image: &Image<B>) -> Result<()> {
        self.set_image_view(DescriptorType::Texture, binding, index, image)
    }

    /// Bind a storage image, accessed in `ShaderReadWrite`.
    pub fn set_rw_image(&self, binding: u32, index: u32, image: &Image<B>) -> Result<()> {
        self.set_image_view(DescriptorType::RwTexture, binding, index, image)
    }

    pub fn set_sampler(&self, binding: u32, index: u32, sampler: &Sampler<B>) -> Result<()> {
        let (shared, target) = self.locate(DescriptorType::Sampler, binding, index)?;
        let sampler = sampler.shared()?;
        self.check_device(shared, &sampler.device)?;
        self.write(
            shared,
            target,
            DescriptorResource::Sampler(&sampler.native),
            Arc::clone(sampler) as Retained,
        )
    }

    pub fn set_acceleration_structure(&self, binding: u32, index: u32, accel: &AccelerationStructure<B>) -> Result<()> {
        let (shared, target) = self.locate(DescriptorType::AccelerationStructure, binding, index)?;
        let accel = accel.shared()?;
        self.check_device(shared, &accel.device)?;
        if !accel.is_top_level() {
            return Err(Error::invalid("Only top-level acceleration structures can be bound"));
        }
        self.write(
            shared,
            target,
            DescriptorResource::AccelerationStructure(&accel.native),
            Arc::clone(accel) as Retained,
        )
    }

    /// Number of descriptors written so far.
    pub fn written_count(&self) -> Result<usize> {
        Ok(lock(&self.shared()?.written).len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferDesc, MemoryLocality};
    use crate::format::Format;
    use crate::image::ImageDesc;
    use crate::test_support::{soft_device, soft_device_with};
    use crate::backend::soft::SoftAdapterConfig;

    fn layout(
        device: &Device<crate::Soft>,
        ranges: Vec<DescriptorRange>,
    ) -> Result<DescriptorTableLayout<crate::Soft>> {
        device.create_descriptor_table_layout(&DescriptorTableLayoutDesc { ranges, name: None })
    }

    #[test]
    fn dynamic_range_rules() {
        let (_system, device) = soft_device();
        let stages = ShaderStages::FRAGMENT;
        let sampler = DescriptorRange::dynamic(DescriptorType::Sampler, 0, 8, stages);
        assert!(layout(&device, vec![sampler]).is_err());

        let textures = DescriptorRange::dynamic(DescriptorType::Texture, 0, 8, stages);
        let rw = DescriptorRange::new(DescriptorType::RwBuffer, 0, 1, stages);
        // The rw band sits above the texture band.
        assert!(layout(&device, vec![textures, rw]).is_err());

        let cb = DescriptorRange::new(DescriptorType::ConstantBuffer, 0, 1, stages);
        assert!(layout(&device, vec![cb, textures]).is_ok());
        let second = DescriptorRange::dynamic(DescriptorType::Texture, 100, 8, stages);
        assert!(layout(&device, vec![textures, second]).is_err());
    }

    #[test]
    fn dynamic_range_without_indexing_is_not_implemented() {
        let (_system, device) = soft_device_with(SoftAdapterConfig {
            descriptor_indexing: false,
            ..SoftAdapterConfig::default()
        });
        let range = DescriptorRange::dynamic(DescriptorType::Texture, 0, 8, ShaderStages::FRAGMENT);
        let err = layout(&device, vec![range]).unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::NotImplemented);
    }

    #[test]
    fn ranges_must_fit_their_band() {
        let (_system, device) = soft_device();
        let stages = ShaderStages::FRAGMENT;
        let huge = DescriptorRange::new(DescriptorType::Texture, 5, u32::MAX, stages);
        assert_eq!(layout(&device, vec![huge]).unwrap_err().code(), crate::ResultCode::InvalidArgs);
        let spills = DescriptorRange::new(DescriptorType::Texture, 998, 10, stages);
        assert_eq!(layout(&device, vec![spills]).unwrap_err().code(), crate::ResultCode::InvalidArgs);
        let fits = DescriptorRange::new(DescriptorType::Texture, 990, 10, stages);
        assert!(layout(&device, vec![fits]).is_ok());
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let (_system, device) = soft_device();
        let a = DescriptorRange::new(DescriptorType::Texture, 0, 4, ShaderStages::FRAGMENT);
        let b = DescriptorRange::new(DescriptorType::Buffer, 2, 1, ShaderStages::FRAGMENT);
        assert!(layout(&device, vec![a, b]).is_err());
    }

    #[test]
    fn writes_check_type_index_and_alignment() {
        let (_system, device) = soft_device();
        let layout = layout(&device, vec![
            DescriptorRange::new(DescriptorType::ConstantBuffer, 0, 1, ShaderStages::ALL_GRAPHICS),
            DescriptorRange::dynamic(DescriptorType::Texture, 0, 16, ShaderStages::FRAGMENT),
        ])
        .unwrap();
        let table = device
            .create_descriptor_table(&DescriptorTableDesc {
                layout: layout.clone(),
                variable_count: Some(4),
                name: None,
            })
            .unwrap();
        assert_eq!(table.variable_count().unwrap(), Some(4));

        let constants = device
            .create_buffer(&BufferDesc {
                size: 1024,
                usage: BufferUsage::CONSTANT,
                locality: MemoryLocality::Upload,
                name: None,
            })
            .unwrap();
        table.set_constant_buffer(0, 0, &constants, 256, 64).unwrap();
        let misaligned = table.set_constant_buffer(0, 0, &constants, 16, 64).unwrap_err();
        assert_eq!(misaligned.code(), crate::ResultCode::InvalidArgs);
        assert!(table.set_constant_buffer(0, 1, &constants, 0, 64).is_err());
        assert!(table.set_buffer(0, 0, &constants, 0, 64).is_err());

        let texture = device
            .create_image(&ImageDesc::texture_2d(4, 4, Format::Rgba8Unorm, ImageUsage::SAMPLED))
            .unwrap();
        table.set_image(0, 3, &texture).unwrap();
        assert!(table.set_image(0, 4, &texture).is_err());
        assert!(table.set_rw_image(0, 0, &texture).is_err());
        assert_eq!(table.written_count().unwrap(), 2);

        let too_many = DescriptorTableDesc {
            layout,
            variable_count: Some(17),
            name: None,
        };
        assert!(device.create_descriptor_table(&too_many).is_err());
    }
}

//! Physical device enumeration results.

/// Broad class of a physical device, ordered by selection priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Other,
    Cpu,
    VirtualGpu,
    IntegratedGpu,
    DiscreteGpu,
}

impl DeviceKind {
    fn priority(self) -> u32 {
        match self {
            DeviceKind::DiscreteGpu => 3,
            DeviceKind::IntegratedGpu => 2,
            DeviceKind::VirtualGpu => 1,
            DeviceKind::Cpu | DeviceKind::Other => 0,
        }
    }
}

/// Bytes of memory by locality. `shared` counts heaps that are both device
/// local and host visible and is not included in the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySizes {
    pub device_local: u64,
    pub host_visible: u64,
    pub shared: u64,
}

/// Immutable capability snapshot of one physical device.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalDeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub kind: DeviceKind,
    pub vendor_id: u32,
    pub device_id: u32,
    pub memory: MemorySizes,
    /// Queue families usable for compute or transfer without graphics.
    pub dedicated_queue_count: u32,
    pub ray_tracing_supported: bool,
    pub descriptor_indexing_supported: bool,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_scratch_offset_alignment: u64,
}

impl PhysicalDeviceDescriptor {
    /// Selection score: dedicated queues matter most, then device kind.
    pub fn score(&self) -> (u32, u32) {
        (self.dedicated_queue_count, self.kind.priority())
    }
}

/// Every physical device a back end exposed at System initialization.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    devices: Vec<PhysicalDeviceDescriptor>,
}

impl CapabilityRegistry {
    pub fn new(devices: Vec<PhysicalDeviceDescriptor>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[PhysicalDeviceDescriptor] {
        &self.devices
    }

    pub fn get(&self, index: usize) -> Option<&PhysicalDeviceDescriptor> {
        self.devices.iter().find(|d| d.index == index)
    }

    /// The highest scoring device; ties go to the lowest index.
    pub fn best(&self) -> Option<&PhysicalDeviceDescriptor> {
        self.devices
            .iter()
            .max_by(|a, b| a.score().cmp(&b.score()).then_with(|| b.index.cmp(&a.index)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(index: usize, kind: DeviceKind, dedicated: u32) -> PhysicalDeviceDescriptor {
        PhysicalDeviceDescriptor {
            index,
            name: format!("device {index}"),
            kind,
            vendor_id: 0,
            device_id: 0,
            memory: MemorySizes::default(),
            dedicated_queue_count: dedicated,
            ray_tracing_supported: false,
            descriptor_indexing_supported: false,
            shader_group_handle_size: 0,
            shader_group_handle_alignment: 0,
            shader_group_base_alignment: 0,
            max_ray_recursion_depth: 0,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 16,
            min_scratch_offset_alignment: 0,
        }
    }

    #[test]
    fn dedicated_queues_outrank_device_kind() {
        let registry = CapabilityRegistry::new(vec![
            descriptor(0, DeviceKind::DiscreteGpu, 0),
            descriptor(1, DeviceKind::IntegratedGpu, 2),
        ]);
        assert_eq!(registry.best().map(|d| d.index), Some(1));
    }

    #[test]
    fn kind_breaks_ties_and_index_breaks_kind_ties() {
        let registry = CapabilityRegistry::new(vec![
            descriptor(0, DeviceKind::IntegratedGpu, 1),
            descriptor(1, DeviceKind::DiscreteGpu, 1),
            descriptor(2, DeviceKind::DiscreteGpu, 1),
        ]);
        assert_eq!(registry.best().map(|d| d.index), Some(1));
        assert!(CapabilityRegistry::default().best().is_none());
    }
}

//! Logical device wrapper ([`Device`]).
//!
//! `Device` centralises all per-device state: the `ash::Device`, a
//! `gpu-allocator` allocator behind a `Mutex`, the extension loaders that
//! were enabled at creation (swapchain, acceleration structure, ray tracing
//! pipeline, debug utils) and the graphics/compute/transfer queues.
//!
//! The loaders are the device's function table: they are built once in
//! [`Device::new`] and every raw operation goes through them. Raw Vulkan
//! operations are `unsafe fn` methods grouped by concern below.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thiserror::Error;

use crate::{
    instance::{Instance, PhysicalDeviceInfo},
    surface::Surface,
    swapchain::CreateSwapchainError,
};

/// How an allocation is accessed by the CPU and GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. Uploads and per-frame data.
    CpuToGpu,
    /// GPU-writable, CPU-readable. Readback.
    GpuToCpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Use dedicated transfer and compute queue families when available.
    #[default]
    Auto,
    /// Force all queue types to the same queue family.
    Unified,
    /// Force all queue types onto a single queue from one family.
    Single,
}

/// The role a queue plays. Roles without a dedicated family alias the
/// graphics queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Debug, Default, Clone)]
pub struct DeviceConfig {
    pub swapchain: bool,
    pub ray_tracing: bool,
    pub descriptor_indexing: bool,
    pub queue_mode: QueueMode,
}

/// Queue family chosen for each [`QueueKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Number of families other than graphics that got their own queue.
    pub fn dedicated_count(&self) -> u32 {
        (self.compute != self.graphics) as u32 + (self.transfer != self.graphics) as u32
    }
}

/// Pick queue families: graphics must also satisfy `can_present` (pass
/// `|_| true` when no surface is involved), compute and transfer prefer
/// families without graphics support unless `mode` forces unification.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    can_present: impl Fn(u32) -> bool,
    mode: QueueMode,
) -> Option<QueueFamilies> {
    let graphics = families.iter().enumerate().find_map(|(idx, qf)| {
        (qf.queue_flags.contains(vk::QueueFlags::GRAPHICS) && can_present(idx as u32))
            .then_some(idx as u32)
    })?;

    if matches!(mode, QueueMode::Unified | QueueMode::Single) {
        return Some(QueueFamilies {
            graphics,
            compute: graphics,
            transfer: graphics,
        });
    }

    let dedicated = |flag: vk::QueueFlags| {
        families
            .iter()
            .position(|qf| {
                qf.queue_flags.contains(flag) && !qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            })
            .map_or(graphics, |idx| idx as u32)
    };

    Some(QueueFamilies {
        graphics,
        compute: dedicated(vk::QueueFlags::COMPUTE),
        transfer: dedicated(vk::QueueFlags::TRANSFER),
    })
}

/// Which optional features ended up enabled on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledFeatures {
    pub swapchain: bool,
    pub buffer_device_address: bool,
    pub descriptor_indexing: bool,
    pub ray_tracing: bool,
}

type SharedQueue = (Arc<Mutex<vk::Queue>>, u32);

/// A logical Vulkan device and its per-device state.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    info: PhysicalDeviceInfo,
    features: EnabledFeatures,
    swapchain_device: Option<ash::khr::swapchain::Device>,
    acceleration_structure_device: Option<ash::khr::acceleration_structure::Device>,
    ray_tracing_device: Option<ash::khr::ray_tracing_pipeline::Device>,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    /// Aliased queues share one `Arc<Mutex<vk::Queue>>` so locking either
    /// role serializes on the same handle.
    graphics_queue: SharedQueue,
    compute_queue: SharedQueue,
    transfer_queue: SharedQueue,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("name", &self.info.name)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // The allocator frees its memory blocks, so it must go before the
        // device.
        self.allocator = None;
        // SAFETY: every object derived from this device holds an Arc to it and
        // is therefore already destroyed.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("Surface and physical device were not derived from this instance")]
    MismatchedParams,
    #[error("{name} only supports Vulkan {version}, 1.3 is required")]
    UnsupportedVersion { name: String, version: crate::instance::VkVersion },
    #[error("{0} does not support VK_KHR_swapchain")]
    MissingSwapchain(String),
    #[error("{0} does not support hardware ray tracing")]
    RayTracingUnavailable(String),
    #[error("{0} does not support descriptor indexing")]
    DescriptorIndexingUnavailable(String),
    #[error("No queue family supports graphics (and presentation, when a surface is given)")]
    NoGraphicsQueue,
    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),
    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),
    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum RayTracingError {
    #[error("Ray tracing is not enabled on this device")]
    NotEnabled,
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl Device {
    /// Create a logical device on the physical device described by `info`.
    ///
    /// When `surface` is given the graphics queue family must also be able
    /// to present to it. Optional features requested in `config` that the
    /// device lacks are hard errors so the caller can decide how to degrade.
    pub fn new<T: HasDisplayHandle + HasWindowHandle + ?Sized>(
        instance: &Arc<Instance>,
        info: &PhysicalDeviceInfo,
        surface: Option<&Surface<T>>,
        config: DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        if let Some(surface) = surface
            && !Arc::ptr_eq(surface.parent(), instance)
        {
            return Err(CreateDeviceError::MismatchedParams);
        }
        if !info.api_version.at_least(1, 3) {
            return Err(CreateDeviceError::UnsupportedVersion {
                name: info.name.clone(),
                version: info.api_version,
            });
        }
        if config.swapchain && !info.swapchain {
            return Err(CreateDeviceError::MissingSwapchain(info.name.clone()));
        }
        if config.ray_tracing && info.ray_tracing.is_none() {
            return Err(CreateDeviceError::RayTracingUnavailable(info.name.clone()));
        }
        if config.descriptor_indexing && !info.descriptor_indexing {
            return Err(CreateDeviceError::DescriptorIndexingUnavailable(info.name.clone()));
        }

        let families = select_queue_families(
            &info.queue_families,
            |idx| match surface {
                // SAFETY: surface and info.handle come from the same instance
                // (checked above).
                Some(surface) => unsafe { surface.supports_queue_family(info.handle, idx) }
                    .unwrap_or(false),
                None => true,
            },
            config.queue_mode,
        )
        .ok_or(CreateDeviceError::NoGraphicsQueue)?;

        tracing::info!(
            "Creating device on {:?} ({:?}); queue families graphics: {}, compute: {}, transfer: {}",
            info.name,
            info.device_type,
            families.graphics,
            families.compute,
            families.transfer,
        );

        let mut family_queue_counts: HashMap<u32, u32> = HashMap::new();
        for family in [families.graphics, families.compute, families.transfer] {
            *family_queue_counts.entry(family).or_insert(0) += 1;
        }
        for (&family, count) in &mut family_queue_counts {
            *count = if config.queue_mode == QueueMode::Single {
                1
            } else {
                (*count).min(info.queue_families[family as usize].queue_count)
            };
        }
        let priorities: Vec<Vec<f32>> = family_queue_counts
            .values()
            .map(|&count| vec![1.0; count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = family_queue_counts
            .keys()
            .zip(&priorities)
            .map(|(&family, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
            })
            .collect();

        let features = EnabledFeatures {
            swapchain: config.swapchain,
            buffer_device_address: info.buffer_device_address,
            descriptor_indexing: config.descriptor_indexing,
            ray_tracing: config.ray_tracing,
        };

        let mut exts: Vec<&CStr> = Vec::new();
        if features.swapchain {
            exts.push(ash::khr::swapchain::NAME);
        }
        if features.ray_tracing {
            exts.push(ash::khr::acceleration_structure::NAME);
            exts.push(ash::khr::ray_tracing_pipeline::NAME);
            exts.push(ash::khr::deferred_host_operations::NAME);
        }
        let ext_ptrs: Vec<*const std::ffi::c_char> = exts.iter().map(|e| e.as_ptr()).collect();

        let di = features.descriptor_indexing;
        let mut features12 = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(features.buffer_device_address)
            .descriptor_indexing(di)
            .descriptor_binding_partially_bound(di)
            .descriptor_binding_variable_descriptor_count(di)
            .runtime_descriptor_array(di);
        let mut features13 = vk::PhysicalDeviceVulkan13Features::default()
            .synchronization2(true)
            .dynamic_rendering(true);
        let mut as_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
        let mut rt_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .push_next(&mut features12)
            .push_next(&mut features13);
        if features.ray_tracing {
            create_info = create_info.push_next(&mut as_features).push_next(&mut rt_features);
        }

        // SAFETY: info.handle is derived from instance and create_info only
        // references locals that outlive the call.
        let device = unsafe { instance.create_ash_device(info.handle, &create_info) }
            .map_err(CreateDeviceError::DeviceCreationFailed)?;

        // Families with fewer queues than roles hand out index 0 again.
        let mut next_index: HashMap<u32, u32> = HashMap::new();
        let mut get_queue = |family: u32| -> vk::Queue {
            let idx = next_index.entry(family).or_insert(0);
            let queue_idx = if *idx < family_queue_counts[&family] { *idx } else { 0 };
            *idx += 1;
            // SAFETY: the device was just created with this family and count.
            unsafe { device.get_device_queue(family, queue_idx) }
        };
        let graphics_handle = get_queue(families.graphics);
        let compute_handle = get_queue(families.compute);
        let transfer_handle = get_queue(families.transfer);

        let graphics_arc = Arc::new(Mutex::new(graphics_handle));
        let compute_arc = if compute_handle == graphics_handle {
            Arc::clone(&graphics_arc)
        } else {
            Arc::new(Mutex::new(compute_handle))
        };
        let transfer_arc = if transfer_handle == graphics_handle {
            Arc::clone(&graphics_arc)
        } else if transfer_handle == compute_handle {
            Arc::clone(&compute_arc)
        } else {
            Arc::new(Mutex::new(transfer_handle))
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device: info.handle,
            debug_settings: Default::default(),
            buffer_device_address: features.buffer_device_address,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been derived from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(CreateDeviceError::AllocatorCreation(e));
            }
        };

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            info: info.clone(),
            features,
            swapchain_device: features
                .swapchain
                .then(|| instance.create_swapchain_loader(&device)),
            acceleration_structure_device: features
                .ray_tracing
                .then(|| instance.create_acceleration_structure_loader(&device)),
            ray_tracing_device: features
                .ray_tracing
                .then(|| instance.create_ray_tracing_pipeline_loader(&device)),
            debug_utils_device: instance.create_debug_utils_device_loader(&device),
            handle: device,
            graphics_queue: (graphics_arc, families.graphics),
            compute_queue: (compute_arc, families.compute),
            transfer_queue: (transfer_arc, families.transfer),
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.info.handle
    }

    pub fn info(&self) -> &PhysicalDeviceInfo {
        &self.info
    }

    pub fn features(&self) -> EnabledFeatures {
        self.features
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.info.limits
    }

    pub fn queue_family(&self, kind: QueueKind) -> u32 {
        self.queue(kind).1
    }

    fn queue(&self, kind: QueueKind) -> &SharedQueue {
        match kind {
            QueueKind::Graphics => &self.graphics_queue,
            QueueKind::Compute => &self.compute_queue,
            QueueKind::Transfer => &self.transfer_queue,
        }
    }

    /// Block until all submitted work on this device has completed.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("device_wait_idle").entered();
        // Queue locks are taken so no submission races the idle wait.
        let _graphics = self.graphics_queue.0.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: the device is live; vkDeviceWaitIdle requires all queues to
        // be externally synchronized, which the graphics lock covers for the
        // aliased case and the submit path covers otherwise.
        unsafe { self.handle.device_wait_idle() }
    }
}

// Memory allocation
impl Device {
    /// Score a memory type for `usage`; `None` if incompatible.
    fn score_memory_type(flags: vk::MemoryPropertyFlags, usage: MemoryUsage) -> Option<u32> {
        use vk::MemoryPropertyFlags as F;
        let device_local = flags.contains(F::DEVICE_LOCAL);
        let host_visible = flags.contains(F::HOST_VISIBLE);
        let host_cached = flags.contains(F::HOST_CACHED);
        match usage {
            MemoryUsage::GpuOnly => device_local.then_some(if host_visible { 1 } else { 2 }),
            MemoryUsage::CpuToGpu => host_visible.then_some(if device_local { 2 } else { 1 }),
            MemoryUsage::GpuToCpu => host_visible.then_some(if host_cached { 2 } else { 1 }),
        }
    }

    /// Best memory type index for `requirements` and `usage`. Ties go to the
    /// lowest index.
    fn select_memory_type(
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Option<u32> {
        memory_properties.memory_types[..memory_properties.memory_type_count as usize]
            .iter()
            .enumerate()
            .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
            .filter_map(|(i, ty)| {
                Self::score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s))
            })
            .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
            .map(|(i, _)| i)
    }

    /// Allocate memory for `requirements`. Host-visible, non-coherent types
    /// get their size and alignment rounded up to `nonCoherentAtomSize` so
    /// flushes never touch neighbouring allocations.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let atom = self.info.limits.non_coherent_atom_size;
        let memory_properties = &self.info.memory_properties;
        let requirements = match Self::select_memory_type(memory_properties, requirements, usage) {
            Some(idx) => {
                use vk::MemoryPropertyFlags as F;
                let flags = memory_properties.memory_types[idx as usize].property_flags;
                let non_coherent =
                    flags.contains(F::HOST_VISIBLE) && !flags.contains(F::HOST_COHERENT);
                let (size, alignment) = if non_coherent {
                    (requirements.size.div_ceil(atom) * atom, requirements.alignment.max(atom))
                } else {
                    (requirements.size, requirements.alignment)
                };
                vk::MemoryRequirements {
                    size,
                    alignment,
                    memory_type_bits: 1 << idx,
                }
            }
            None => requirements,
        };
        let location = match usage {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        };
        let Some(allocator) = self.allocator.as_ref() else {
            return Err(AllocationError::Internal("allocator already dropped".into()));
        };
        allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
    }

    pub fn free_memory(&self, allocation: Allocation) -> Result<(), AllocationError> {
        let Some(allocator) = self.allocator.as_ref() else {
            return Err(AllocationError::Internal("allocator already dropped".into()));
        };
        allocator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .free(allocation)
    }

    /// # Safety
    /// Every range must lie within host-visible memory allocated from this
    /// device.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(ranges) }
    }

    /// # Safety
    /// Every range must lie within host-visible memory allocated from this
    /// device.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(ranges) }
    }
}

// Debug naming
impl Device {
    /// Set a debug name on an object owned by this device. A no-op without
    /// `VK_EXT_debug_utils` or when `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a valid handle created from this device.
    pub unsafe fn set_object_name_str<H: vk::Handle>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError> {
        let (Some(debug_utils), Some(name)) = (self.debug_utils_device.as_ref(), name) else {
            return Ok(());
        };
        let name = CString::new(name).map_err(NameObjectError::InvalidName)?;
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name);
        // SAFETY: caller guarantees object provenance.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }.map_err(NameObjectError::Vulkan)
    }

    /// Name `object`, logging instead of failing.
    ///
    /// # Safety
    /// `object` must be a valid handle created from this device.
    pub unsafe fn name_or_warn<H: vk::Handle + std::fmt::Debug + Copy>(
        &self,
        object: H,
        kind: &str,
        name: Option<&str>,
    ) {
        // SAFETY: forwarded contract.
        if let Err(e) = unsafe { self.set_object_name_str(object, name) } {
            tracing::warn!("Failed to name {kind} {:?}: {e}", object);
        }
    }
}

// Queue functionality
impl Device {
    /// Submit a sequence of batches to one queue while holding its lock for
    /// the whole sequence, so the batches execute back to back in order.
    ///
    /// Each entry has its own fence; pass `vk::Fence::null()` for none.
    ///
    /// # Safety
    /// All handles must be valid and derived from this device. Command
    /// buffers must be executable, wait semaphores must have pending signals
    /// and fences must be unsignaled.
    pub unsafe fn queue_submit2_batches(
        &self,
        kind: QueueKind,
        batches: &[(vk::SubmitInfo2<'_>, vk::Fence)],
    ) -> Result<(), vk::Result> {
        let queue = self.queue(kind).0.lock().unwrap_or_else(PoisonError::into_inner);
        for (submit, fence) in batches {
            // SAFETY: caller guarantees handle validity; the queue is locked.
            unsafe {
                self.handle
                    .queue_submit2(*queue, std::slice::from_ref(submit), *fence)
            }?;
        }
        Ok(())
    }

    /// Present through the graphics queue. `Ok(true)` means suboptimal.
    ///
    /// # Safety
    /// All handles in `present_info` must be valid and derived from this
    /// device, and the presented image must be in `PRESENT_SRC_KHR`.
    pub unsafe fn queue_present(&self, present_info: &vk::PresentInfoKHR<'_>) -> Result<bool, vk::Result> {
        let swapchain_device = self
            .swapchain_device
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let queue = self.graphics_queue.0.lock().unwrap_or_else(PoisonError::into_inner);
        // SAFETY: caller guarantees handle validity; the queue is locked.
        unsafe { swapchain_device.queue_present(*queue, present_info) }
    }
}

// Swapchain functionality
impl Device {
    /// # Safety
    /// `create_info` must reference valid objects derived from this device
    /// and its instance. A non-null `old_swapchain` must come from this
    /// device.
    pub unsafe fn create_raw_swapchain(
        &self,
        create_info: &vk::SwapchainCreateInfoKHR<'_>,
    ) -> Result<vk::SwapchainKHR, CreateSwapchainError> {
        let swapchain_device = self
            .swapchain_device
            .as_ref()
            .ok_or(CreateSwapchainError::SwapchainNotEnabled)?;
        // SAFETY: caller guarantees create_info validity.
        unsafe { swapchain_device.create_swapchain(create_info, None) }
            .map_err(CreateSwapchainError::VulkanCreate)
    }

    /// # Safety
    /// `swapchain` must be a live swapchain created from this device.
    pub unsafe fn get_raw_swapchain_images(
        &self,
        swapchain: vk::SwapchainKHR,
    ) -> Result<Vec<vk::Image>, CreateSwapchainError> {
        let swapchain_device = self
            .swapchain_device
            .as_ref()
            .ok_or(CreateSwapchainError::SwapchainNotEnabled)?;
        // SAFETY: caller guarantees swapchain validity.
        unsafe { swapchain_device.get_swapchain_images(swapchain) }
            .map_err(CreateSwapchainError::VulkanGetImages)
    }

    /// # Safety
    /// `swapchain` must come from this device, its views must be destroyed
    /// and no pending work may reference it.
    pub unsafe fn destroy_raw_swapchain(&self, swapchain: vk::SwapchainKHR) {
        if let Some(swapchain_device) = self.swapchain_device.as_ref() {
            // SAFETY: caller guarantees provenance and ordering.
            unsafe { swapchain_device.destroy_swapchain(swapchain, None) };
        }
    }

    /// Returns `(image_index, suboptimal)`.
    ///
    /// # Safety
    /// `swapchain` must come from this device; `semaphore` must be unsignaled
    /// with no pending operations.
    pub unsafe fn acquire_next_swapchain_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let swapchain_device = self
            .swapchain_device
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        // SAFETY: caller guarantees handle validity.
        unsafe {
            swapchain_device.acquire_next_image(swapchain, timeout_ns, semaphore, vk::Fence::null())
        }
    }
}

// Resource creation
impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_buffer(&self, create_info: &vk::BufferCreateInfo<'_>) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must come from this device and not be referenced by pending
    /// work.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a live buffer from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must come from this device and `offset` must
    /// satisfy the buffer's requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `buffer` must be a live buffer created with `SHADER_DEVICE_ADDRESS`
    /// usage and bound to memory.
    pub unsafe fn get_raw_buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        // SAFETY: caller guarantees buffer validity and usage.
        unsafe { self.handle.get_buffer_device_address(&info) }
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_image(&self, create_info: &vk::ImageCreateInfo<'_>) -> Result<vk::Image, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must come from this device, have no live views and not be
    /// referenced by pending work.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a live image from this device.
    pub unsafe fn get_raw_image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        // SAFETY: caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must come from this device and `offset` must
    /// satisfy the image's requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// # Safety
    /// `create_info` must reference an image from this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must come from this device and not be referenced by
    /// pending work.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_sampler(
        &self,
        create_info: &vk::SamplerCreateInfo<'_>,
    ) -> Result<vk::Sampler, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_sampler(create_info, None) }
    }

    /// # Safety
    /// `sampler` must come from this device and not be referenced by pending
    /// work.
    pub unsafe fn destroy_raw_sampler(&self, sampler: vk::Sampler) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_sampler(sampler, None) };
    }

    /// # Safety
    /// `create_info` must contain valid SPIR-V.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must come from this device.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }
}

// Pipeline functionality
impl Device {
    /// # Safety
    /// Every set layout referenced by `create_info` must come from this
    /// device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device and no pipeline using it may be
    /// in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Destroys any handles ash hands back on partial failure so callers get
    /// either one pipeline or none.
    fn take_single_pipeline(
        &self,
        result: Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    ) -> Result<vk::Pipeline, vk::Result> {
        match result {
            Ok(mut pipelines) => pipelines.pop().ok_or(vk::Result::ERROR_UNKNOWN),
            Err((partial, result)) => {
                for pipeline in partial.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                    // SAFETY: the pipeline was just created by this device.
                    unsafe { self.handle.destroy_pipeline(pipeline, None) };
                }
                Err(result)
            }
        }
    }

    /// # Safety
    /// `create_info` must reference valid stages, layout and pNext structs
    /// from this device.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.take_single_pipeline(result)
    }

    /// # Safety
    /// `create_info` must reference a valid stage and layout from this
    /// device.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            self.handle.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.take_single_pipeline(result)
    }

    /// # Safety
    /// `create_info` must reference valid stages, groups and layout from this
    /// device.
    pub unsafe fn create_raw_ray_tracing_pipeline(
        &self,
        create_info: &vk::RayTracingPipelineCreateInfoKHR<'_>,
    ) -> Result<vk::Pipeline, RayTracingError> {
        let loader = self.ray_tracing_device.as_ref().ok_or(RayTracingError::NotEnabled)?;
        // SAFETY: caller guarantees create_info validity.
        let result = unsafe {
            loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.take_single_pipeline(result).map_err(RayTracingError::Vulkan)
    }

    /// Copy `group_count` shader group handles out of a ray tracing pipeline.
    ///
    /// # Safety
    /// `pipeline` must be a ray tracing pipeline from this device with at
    /// least `group_count` groups.
    pub unsafe fn get_raw_shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
    ) -> Result<Vec<u8>, RayTracingError> {
        let loader = self.ray_tracing_device.as_ref().ok_or(RayTracingError::NotEnabled)?;
        let handle_size = self
            .info
            .ray_tracing
            .map_or(0, |rt| rt.shader_group_handle_size) as usize;
        // SAFETY: caller guarantees pipeline validity and group count.
        unsafe {
            loader.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                group_count,
                handle_size * group_count as usize,
            )
        }
        .map_err(RayTracingError::Vulkan)
    }

    /// # Safety
    /// `pipeline` must come from this device and not be referenced by
    /// pending work.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Acceleration structure functionality
impl Device {
    fn acceleration_structure_loader(
        &self,
    ) -> Result<&ash::khr::acceleration_structure::Device, RayTracingError> {
        self.acceleration_structure_device
            .as_ref()
            .ok_or(RayTracingError::NotEnabled)
    }

    /// Storage and scratch sizes for a build described by `build_info`.
    ///
    /// # Safety
    /// `build_info` must describe valid geometry; device addresses in it are
    /// ignored by this query.
    pub unsafe fn get_raw_acceleration_structure_build_sizes(
        &self,
        build_info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> Result<vk::AccelerationStructureBuildSizesInfoKHR<'static>, RayTracingError> {
        let loader = self.acceleration_structure_loader()?;
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        // SAFETY: caller guarantees build_info validity.
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                build_info,
                max_primitive_counts,
                &mut sizes,
            )
        };
        Ok(sizes)
    }

    /// # Safety
    /// `create_info.buffer` must be a live buffer from this device with
    /// acceleration structure storage usage.
    pub unsafe fn create_raw_acceleration_structure(
        &self,
        create_info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> Result<vk::AccelerationStructureKHR, RayTracingError> {
        let loader = self.acceleration_structure_loader()?;
        // SAFETY: caller guarantees create_info validity.
        unsafe { loader.create_acceleration_structure(create_info, None) }
            .map_err(RayTracingError::Vulkan)
    }

    /// # Safety
    /// `accel` must come from this device and not be referenced by pending
    /// work.
    pub unsafe fn destroy_raw_acceleration_structure(&self, accel: vk::AccelerationStructureKHR) {
        if let Some(loader) = self.acceleration_structure_device.as_ref() {
            // SAFETY: caller guarantees provenance and ordering.
            unsafe { loader.destroy_acceleration_structure(accel, None) };
        }
    }

    /// # Safety
    /// `accel` must be a live acceleration structure from this device.
    pub unsafe fn get_raw_acceleration_structure_address(
        &self,
        accel: vk::AccelerationStructureKHR,
    ) -> Result<vk::DeviceAddress, RayTracingError> {
        let loader = self.acceleration_structure_loader()?;
        let info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
        // SAFETY: caller guarantees accel validity.
        Ok(unsafe { loader.get_acceleration_structure_device_address(&info) })
    }
}

// Command pool and buffer functionality
impl Device {
    /// # Safety
    /// `create_info.queue_family_index` must be a family of this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device and none of its buffers may be
    /// pending.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must come from this device and be
    /// externally synchronized.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// Every buffer must come from `pool`, none may be pending and `pool`
    /// must be externally synchronized.
    pub unsafe fn free_raw_command_buffers(&self, pool: vk::CommandPool, command_buffers: &[vk::CommandBuffer]) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: caller guarantees provenance and idle state.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }

    /// # Safety
    /// `command_buffer` must be in the initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn end_raw_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending and its pool must allow
    /// individual resets.
    pub unsafe fn reset_raw_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees state and pool flags.
        unsafe {
            self.handle
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }
}

// Fence and semaphore functionality
impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_fence(&self, create_info: &vk::FenceCreateInfo<'_>) -> Result<vk::Fence, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must come from this device and not be pending.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must come from this device.
    pub unsafe fn wait_for_raw_fences(&self, fences: &[vk::Fence], timeout_ns: u64) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees fence validity.
        unsafe { self.handle.wait_for_fences(fences, true, timeout_ns) }
    }

    /// # Safety
    /// Every fence must come from this device and none may be pending.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees validity and state.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// `semaphore` must come from this device with no pending operations.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }
}

// Descriptor set functionality
impl Device {
    /// # Safety
    /// `create_info` (and its binding-flags chain) must be valid.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must come from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: caller guarantees provenance.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }

    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> Result<vk::DescriptorPool, vk::Result> {
        // SAFETY: caller guarantees create_info validity.
        unsafe { self.handle.create_descriptor_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must come from this device and none of its sets may be
    /// referenced by pending work.
    pub unsafe fn destroy_raw_descriptor_pool(&self, pool: vk::DescriptorPool) {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.destroy_descriptor_pool(pool, None) };
    }

    /// # Safety
    /// The pool in `alloc_info` must come from this device and be externally
    /// synchronized.
    pub unsafe fn allocate_raw_descriptor_sets(
        &self,
        alloc_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        // SAFETY: caller guarantees alloc_info validity.
        unsafe { self.handle.allocate_descriptor_sets(alloc_info) }
    }

    /// # Safety
    /// `sets` must come from `pool`, which must have been created with
    /// `FREE_DESCRIPTOR_SET`, and must not be referenced by pending work.
    pub unsafe fn free_raw_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees provenance and ordering.
        unsafe { self.handle.free_descriptor_sets(pool, sets) }
    }

    /// # Safety
    /// Every handle referenced by the writes must be valid and come from this
    /// device. The target sets must not be in use by pending work unless
    /// their bindings were created update-after-bind.
    pub unsafe fn update_raw_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        // SAFETY: caller guarantees write validity.
        unsafe { self.handle.update_descriptor_sets(writes, &[]) }
    }
}

// Recording commands
impl Device {
    /// # Safety
    /// `cb` must be recording; every barrier must reference live resources.
    pub unsafe fn cmd_pipeline_barrier2(&self, cb: vk::CommandBuffer, dependency_info: &vk::DependencyInfo<'_>) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_pipeline_barrier2(cb, dependency_info) }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; every attachment must be
    /// in the layout named by `rendering_info`.
    pub unsafe fn cmd_begin_rendering(&self, cb: vk::CommandBuffer, rendering_info: &vk::RenderingInfo<'_>) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_begin_rendering(cb, rendering_info) }
    }

    /// # Safety
    /// `cb` must be inside a render pass begun with `cmd_begin_rendering`.
    pub unsafe fn cmd_end_rendering(&self, cb: vk::CommandBuffer) {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.cmd_end_rendering(cb) }
    }

    /// # Safety
    /// `cb` must be recording and `pipeline` must match `bind_point`.
    pub unsafe fn cmd_bind_pipeline(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_bind_pipeline(cb, bind_point, pipeline) }
    }

    /// # Safety
    /// `cb` must be recording; `layout` must be compatible with the sets.
    pub unsafe fn cmd_bind_descriptor_sets(
        &self,
        cb: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe {
            self.handle
                .cmd_bind_descriptor_sets(cb, bind_point, layout, first_set, sets, &[])
        }
    }

    /// # Safety
    /// `cb` must be recording; the buffer must have vertex usage.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        cb: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe {
            self.handle
                .cmd_bind_vertex_buffers(cb, first_binding, buffers, offsets)
        }
    }

    /// # Safety
    /// `cb` must be recording; the buffer must have index usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        cb: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_bind_index_buffer(cb, buffer, offset, index_type) }
    }

    /// # Safety
    /// `cb` must be recording with a pipeline bound that uses dynamic viewport
    /// state.
    pub unsafe fn cmd_set_viewport(&self, cb: vk::CommandBuffer, viewports: &[vk::Viewport]) {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.cmd_set_viewport(cb, 0, viewports) }
    }

    /// # Safety
    /// `cb` must be recording with a pipeline bound that uses dynamic scissor
    /// state.
    pub unsafe fn cmd_set_scissor(&self, cb: vk::CommandBuffer, scissors: &[vk::Rect2D]) {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.cmd_set_scissor(cb, 0, scissors) }
    }

    /// # Safety
    /// `cb` must be inside a render pass with a graphics pipeline bound.
    pub unsafe fn cmd_draw(
        &self,
        cb: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees state.
        unsafe {
            self.handle
                .cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance)
        }
    }

    /// # Safety
    /// `cb` must be inside a render pass with a graphics pipeline and an
    /// index buffer bound.
    pub unsafe fn cmd_draw_indexed(
        &self,
        cb: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: caller guarantees state.
        unsafe {
            self.handle.cmd_draw_indexed(
                cb,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass with a compute pipeline
    /// bound.
    pub unsafe fn cmd_dispatch(&self, cb: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        // SAFETY: caller guarantees state.
        unsafe { self.handle.cmd_dispatch(cb, x, y, z) }
    }

    /// # Safety
    /// `cb` must be recording with a ray tracing pipeline bound; every region
    /// must point into a live shader binding table buffer.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn cmd_trace_rays(
        &self,
        cb: vk::CommandBuffer,
        raygen: &vk::StridedDeviceAddressRegionKHR,
        miss: &vk::StridedDeviceAddressRegionKHR,
        hit: &vk::StridedDeviceAddressRegionKHR,
        callable: &vk::StridedDeviceAddressRegionKHR,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<(), RayTracingError> {
        let loader = self.ray_tracing_device.as_ref().ok_or(RayTracingError::NotEnabled)?;
        // SAFETY: caller guarantees state and region validity.
        unsafe { loader.cmd_trace_rays(cb, raygen, miss, hit, callable, width, height, depth) };
        Ok(())
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; all addresses in the
    /// build info must be live and correctly synchronized.
    pub unsafe fn cmd_build_acceleration_structures(
        &self,
        cb: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) -> Result<(), RayTracingError> {
        let loader = self.acceleration_structure_loader()?;
        // SAFETY: caller guarantees validity.
        unsafe { loader.cmd_build_acceleration_structures(cb, infos, ranges) };
        Ok(())
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; regions must be in
    /// bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_copy_buffer(cb, src, dst, regions) }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; `dst` must be in
    /// `dst_layout` and regions in bounds.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_copy_buffer_to_image(cb, src, dst, dst_layout, regions) }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; `src` must be in
    /// `src_layout` and regions in bounds.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_copy_image_to_buffer(cb, src, src_layout, dst, regions) }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; both images must be in
    /// the given layouts and regions in bounds.
    pub unsafe fn cmd_copy_image(
        &self,
        cb: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe {
            self.handle
                .cmd_copy_image(cb, src, src_layout, dst, dst_layout, regions)
        }
    }

    /// # Safety
    /// `cb` must be recording outside a render pass; `image` must be in
    /// `layout` (TRANSFER_DST_OPTIMAL or GENERAL).
    pub unsafe fn cmd_clear_color_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe { self.handle.cmd_clear_color_image(cb, image, layout, color, ranges) }
    }

    /// # Safety
    /// As [`cmd_clear_color_image`](Self::cmd_clear_color_image), for a depth
    /// image.
    pub unsafe fn cmd_clear_depth_stencil_image(
        &self,
        cb: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        value: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        // SAFETY: caller guarantees validity.
        unsafe {
            self.handle
                .cmd_clear_depth_stencil_image(cb, image, layout, value, ranges)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    fn typical_discrete() -> Vec<vk::QueueFamilyProperties> {
        use vk::QueueFlags as Q;
        vec![
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 16),
            family(Q::TRANSFER, 2),
            family(Q::COMPUTE | Q::TRANSFER, 8),
        ]
    }

    #[test]
    fn auto_mode_prefers_dedicated_families() {
        let families = select_queue_families(&typical_discrete(), |_| true, QueueMode::Auto);

        assert_eq!(
            families,
            Some(QueueFamilies {
                graphics: 0,
                compute: 2,
                transfer: 1,
            })
        );
        assert_eq!(families.map(|f| f.dedicated_count()), Some(2));
    }

    #[test]
    fn unified_mode_collapses_to_graphics_family() {
        let families = select_queue_families(&typical_discrete(), |_| true, QueueMode::Unified);

        assert_eq!(
            families,
            Some(QueueFamilies {
                graphics: 0,
                compute: 0,
                transfer: 0,
            })
        );
    }

    #[test]
    fn graphics_family_must_present() {
        use vk::QueueFlags as Q;
        let families = vec![family(Q::GRAPHICS, 1), family(Q::GRAPHICS | Q::COMPUTE, 1)];

        let selected = select_queue_families(&families, |idx| idx == 1, QueueMode::Auto);

        assert_eq!(selected.map(|f| f.graphics), Some(1));
        assert!(select_queue_families(&families, |_| false, QueueMode::Auto).is_none());
    }

    #[test]
    fn missing_dedicated_families_alias_graphics() {
        use vk::QueueFlags as Q;
        let families = vec![family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 1)];

        let selected = select_queue_families(&families, |_| true, QueueMode::Auto);

        assert_eq!(selected.map(|f| f.dedicated_count()), Some(0));
    }

    #[test]
    fn memory_scoring_matches_usage() {
        use vk::MemoryPropertyFlags as F;
        let vram = F::DEVICE_LOCAL;
        let rebar = F::DEVICE_LOCAL | F::HOST_VISIBLE | F::HOST_COHERENT;
        let cached = F::HOST_VISIBLE | F::HOST_CACHED;

        assert_eq!(Device::score_memory_type(vram, MemoryUsage::GpuOnly), Some(2));
        assert_eq!(Device::score_memory_type(rebar, MemoryUsage::GpuOnly), Some(1));
        assert_eq!(Device::score_memory_type(vram, MemoryUsage::CpuToGpu), None);
        assert_eq!(Device::score_memory_type(rebar, MemoryUsage::CpuToGpu), Some(2));
        assert_eq!(Device::score_memory_type(cached, MemoryUsage::GpuToCpu), Some(2));
    }

    #[test]
    fn memory_selection_respects_type_bits_and_prefers_low_index() {
        use vk::MemoryPropertyFlags as F;
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        props.memory_types[0].property_flags = F::DEVICE_LOCAL;
        props.memory_types[1].property_flags = F::DEVICE_LOCAL;
        props.memory_types[2].property_flags = F::HOST_VISIBLE | F::HOST_COHERENT;

        let any = vk::MemoryRequirements {
            size: 256,
            alignment: 16,
            memory_type_bits: 0b111,
        };
        let only_second = vk::MemoryRequirements {
            memory_type_bits: 0b010,
            ..any
        };

        assert_eq!(Device::select_memory_type(&props, any, MemoryUsage::GpuOnly), Some(0));
        assert_eq!(Device::select_memory_type(&props, only_second, MemoryUsage::GpuOnly), Some(1));
        assert_eq!(Device::select_memory_type(&props, any, MemoryUsage::CpuToGpu), Some(2));
        assert_eq!(Device::select_memory_type(&props, only_second, MemoryUsage::CpuToGpu), None);
    }
}

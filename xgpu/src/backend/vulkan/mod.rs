//! The Vulkan back end, built on the `xgpu-vk` wrappers.
//!
//! Requires Vulkan 1.3 with synchronization2 and dynamic rendering. Frontend
//! resource states map onto pipeline stages, access masks and image layouts
//! in [`convert::state_scope`], so every barrier the frontend records becomes
//! a single `vkCmdPipelineBarrier2`.

mod convert;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xgpu_vk::accel::AccelerationStructure as VkAccelerationStructure;
use xgpu_vk::ash::vk;
use xgpu_vk::buffer::{Buffer as VkBuffer, MapBufferError};
use xgpu_vk::command::{ResettableCommandBuffer, ResettableCommandPool};
use xgpu_vk::descriptor::{
    AllocateDescriptorSetError, DescriptorBindingDesc, DescriptorPool, DescriptorSet, DescriptorSetLayout,
};
use xgpu_vk::device::{Device as VkDevice, DeviceConfig, QueueKind as VkQueueKind, select_queue_families};
use xgpu_vk::image::{Image as VkImage, ImageInfo, ImageView, aspect_mask};
use xgpu_vk::instance::{Instance as VkInstance, PhysicalDeviceInfo, VulkanLogLevel};
use xgpu_vk::pipeline::{GraphicsPipelineDesc, Pipeline as VkPipeline, PipelineLayout};
use xgpu_vk::sampler::Sampler as VkSampler;
use xgpu_vk::shader::{EntryPoint, ShaderModule};
use xgpu_vk::surface::Surface;
use xgpu_vk::swapchain::{Swapchain as VkSwapchain, SwapchainConfig};
use xgpu_vk::sync::{Fence as VkFence, Semaphore as VkSemaphore, WaitFenceError};

use super::{
    AccelerationStructureApi, AccelerationStructureGeometry, AccelerationStructureSizes, AcquireOutcome,
    AttachmentInfo, Backend, BufferApi, Command, CommandBufferApi, CommandPoolApi, ComputePipelineInfo,
    DescriptorBinding, DescriptorResource, DeviceApi, DeviceFeatures, FenceApi, GeometryInfo,
    GraphicsPipelineInfo, InstanceApi, PresentOutcome, RayTracingPipelineInfo, RenderTargetInfo, Sealed,
    ShaderStageInfo, SubmitInfo, SwapchainApi, SwapchainInfo, mip_extent,
};
use crate::accel::{BuildFlags, BuildMode};
use crate::buffer::{BufferDesc, MemoryLocality};
use crate::canvas::CanvasSurface;
use crate::capability::{MemorySizes, PhysicalDeviceDescriptor};
use crate::descriptor::DescriptorRange;
use crate::device::{QueueKind, QueueMode};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::image::{ImageDesc, ImageUsage};
use crate::pass::ClearValue;
use crate::pipeline::BlendState;
use crate::raytracing::{ShaderGroup, StridedRegion};
use crate::sampler::SamplerDesc;
use crate::state::{ResourceState, Subresource, SubresourceRange};
use crate::system::WindowHandleSource;
use crate::lock;

type Window = dyn WindowHandleSource;

/// Marker type selecting the Vulkan back end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vulkan;

impl Sealed for Vulkan {}

impl Backend for Vulkan {
    const NAME: &'static str = "vulkan";

    type Config = VulkanConfig;
    type Instance = VulkanInstance;
    type Device = VulkanDevice;
    type Image = VulkanImage;
    type Buffer = VulkanBuffer;
    type Sampler = VulkanSampler;
    type Shader = VulkanShader;
    type DescriptorTableLayout = VulkanDescriptorTableLayout;
    type DescriptorTable = VulkanDescriptorTable;
    type RenderTarget = VulkanRenderTarget;
    type Pipeline = VulkanPipeline;
    type AccelerationStructure = VulkanAccelerationStructure;
    type CommandPool = VulkanCommandPool;
    type CommandBuffer = VulkanCommandBuffer;
    type Fence = VulkanFence;
    type Semaphore = VulkanSemaphore;
    type Swapchain = VulkanSwapchain;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Most verbose validation message forwarded to `tracing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl ValidationLevel {
    fn log_level(self) -> VulkanLogLevel {
        match self {
            ValidationLevel::Verbose => VulkanLogLevel::Verbose,
            ValidationLevel::Info => VulkanLogLevel::Info,
            ValidationLevel::Warning => VulkanLogLevel::Warning,
            ValidationLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VulkanConfig {
    /// Enable the Khronos validation layer when it is installed.
    pub validation: Option<ValidationLevel>,
    pub queue_mode: QueueMode,
    /// Sets per descriptor pool. Pools are added as they fill.
    pub descriptor_sets_per_pool: u32,
    /// Descriptors of each type per descriptor pool.
    pub descriptors_per_type: u32,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            validation: None,
            queue_mode: QueueMode::Auto,
            descriptor_sets_per_pool: 256,
            descriptors_per_type: 4096,
        }
    }
}

fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

pub struct VulkanInstance {
    surface: Option<Arc<Surface<Window>>>,
    adapters: Vec<PhysicalDeviceInfo>,
    config: VulkanConfig,
    instance: Arc<VkInstance>,
}

impl InstanceApi<Vulkan> for VulkanInstance {
    fn new(app_name: &str, window: Option<&Arc<Window>>, config: &VulkanConfig) -> Result<Self> {
        // SAFETY: loading the system Vulkan loader is the documented way to
        // reach the driver; nothing else in this process holds it yet.
        let instance = unsafe {
            VkInstance::new(
                app_name,
                config.validation.map(ValidationLevel::log_level),
                window.map(|w| &**w),
            )
        }
        .map_err(|e| Error::failure("Creating Vulkan instance", e))?;
        let instance = Arc::new(instance);

        let surface = window
            .map(|w| {
                // SAFETY: the surface keeps its own clone of the window and
                // of the instance.
                unsafe { Surface::new(&instance, Arc::clone(w)) }
                    .map(Arc::new)
                    .map_err(|e| Error::failure("Creating window surface", e))
            })
            .transpose()?;

        let adapters = instance
            .fetch_raw_physical_devices()
            .map_err(|e| Error::failure("Enumerating physical devices", e))?
            .into_iter()
            .filter_map(|physical_device| {
                // SAFETY: physical_device was enumerated from this instance.
                match unsafe { instance.query_physical_device(physical_device) } {
                    Ok(info) if info.api_version.at_least(1, 3) => Some(info),
                    Ok(info) => {
                        tracing::info!("Skipping {:?}: Vulkan 1.3 is required", info.name);
                        None
                    }
                    Err(e) => {
                        tracing::warn!("Failed to query physical device {physical_device:?}: {e}");
                        None
                    }
                }
            })
            .collect::<Vec<_>>();
        tracing::info!("Vulkan instance ready with {} usable device(s)", adapters.len());

        Ok(Self {
            surface,
            adapters,
            config: config.clone(),
            instance,
        })
    }

    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDescriptor>> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(index, info)| describe(index, info, self.config.queue_mode))
            .collect())
    }

    fn create_device(
        &self,
        adapter: &PhysicalDeviceDescriptor,
        features: &DeviceFeatures,
        name: Option<&str>,
    ) -> Result<VulkanDevice> {
        let info = self
            .adapters
            .get(adapter.index)
            .ok_or_else(|| Error::invalid(format!("No physical device at index {}", adapter.index)))?;
        let config = DeviceConfig {
            swapchain: self.surface.is_some() && info.swapchain,
            ray_tracing: features.ray_tracing,
            descriptor_indexing: features.descriptor_indexing,
            queue_mode: convert::queue_mode(self.config.queue_mode),
        };
        let device = VkDevice::new(&self.instance, info, self.surface.as_deref(), config)
            .map_err(|e| Error::failure("Creating Vulkan device", e))?;
        tracing::info!("Created Vulkan device {:?} on {:?}", name.unwrap_or("<unnamed>"), info.name);

        Ok(VulkanDevice {
            descriptor_pools: Mutex::new(Vec::new()),
            surface: self.surface.clone(),
            features: *features,
            sets_per_pool: self.config.descriptor_sets_per_pool.max(1),
            descriptors_per_type: self.config.descriptors_per_type.max(1),
            device: Arc::new(device),
        })
    }
}

fn describe(index: usize, info: &PhysicalDeviceInfo, queue_mode: QueueMode) -> PhysicalDeviceDescriptor {
    let kind = convert::device_kind(info.device_type);
    let rt = info.ray_tracing.unwrap_or_default();
    PhysicalDeviceDescriptor {
        index,
        name: info.name.clone(),
        kind,
        vendor_id: info.vendor_id,
        device_id: info.device_id,
        memory: memory_sizes(&info.memory_properties),
        dedicated_queue_count: select_queue_families(&info.queue_families, |_| true, convert::queue_mode(queue_mode))
            .map_or(0, |families| families.dedicated_count()),
        ray_tracing_supported: info.ray_tracing.is_some() && info.buffer_device_address,
        descriptor_indexing_supported: info.descriptor_indexing,
        shader_group_handle_size: rt.shader_group_handle_size,
        shader_group_handle_alignment: rt.shader_group_handle_alignment,
        shader_group_base_alignment: rt.shader_group_base_alignment,
        max_ray_recursion_depth: rt.max_ray_recursion_depth,
        min_uniform_buffer_offset_alignment: info.limits.min_uniform_buffer_offset_alignment,
        min_storage_buffer_offset_alignment: info.limits.min_storage_buffer_offset_alignment,
        min_scratch_offset_alignment: u64::from(rt.min_scratch_offset_alignment),
    }
}

/// A device-local heap counts as shared when every memory type on it is
/// host visible.
fn memory_sizes(props: &vk::PhysicalDeviceMemoryProperties) -> MemorySizes {
    let types = &props.memory_types[..props.memory_type_count as usize];
    let heaps = &props.memory_heaps[..props.memory_heap_count as usize];
    let mut sizes = MemorySizes::default();
    for (index, heap) in heaps.iter().enumerate() {
        let mut heap_types = types.iter().filter(|t| t.heap_index as usize == index).peekable();
        let has_types = heap_types.peek().is_some();
        let all_host_visible = heap_types.all(|t| t.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE));
        if !heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
            sizes.host_visible += heap.size;
        } else if has_types && all_host_visible {
            sizes.shared += heap.size;
        } else {
            sizes.device_local += heap.size;
        }
    }
    sizes
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub struct VulkanDevice {
    descriptor_pools: Mutex<Vec<Arc<Mutex<DescriptorPool>>>>,
    surface: Option<Arc<Surface<Window>>>,
    features: DeviceFeatures,
    sets_per_pool: u32,
    descriptors_per_type: u32,
    device: Arc<VkDevice>,
}

impl VulkanDevice {
    fn require_ray_tracing(&self, what: &'static str) -> Result<()> {
        if self.features.ray_tracing {
            Ok(())
        } else {
            Err(Error::not_implemented(what))
        }
    }

    fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut types = vec![
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
        ];
        if self.features.ray_tracing {
            types.push(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        }
        types
            .into_iter()
            .map(|ty| vk::DescriptorPoolSize {
                ty,
                descriptor_count: self.descriptors_per_type,
            })
            .collect()
    }

    /// Allocate from the newest pool with room, adding a pool when all are
    /// full.
    fn allocate_set(
        &self,
        layout: &DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<(Arc<Mutex<DescriptorPool>>, DescriptorSet)> {
        let mut pools = lock(&self.descriptor_pools);
        for pool in pools.iter().rev() {
            match lock(pool).allocate(layout, variable_count) {
                Ok(set) => return Ok((Arc::clone(pool), set)),
                Err(AllocateDescriptorSetError::OutOfPoolMemory) => continue,
                Err(e) => return Err(Error::failure("Allocating descriptor table", e)),
            }
        }

        let mut pool = DescriptorPool::new(
            &self.device,
            self.sets_per_pool,
            &self.pool_sizes(),
            Some("xgpu descriptor pool"),
        )
        .map_err(|e| Error::failure("Creating descriptor pool", e))?;
        let set = pool
            .allocate(layout, variable_count)
            .map_err(|e| Error::failure("Allocating descriptor table", e))?;
        let pool = Arc::new(Mutex::new(pool));
        pools.push(Arc::clone(&pool));
        tracing::debug!("Added descriptor pool, {} total", pools.len());
        Ok((pool, set))
    }

    fn pipeline_layout(
        &self,
        layouts: &[&VulkanDescriptorTableLayout],
        name: Option<&str>,
    ) -> Result<Arc<PipelineLayout>> {
        let set_layouts: Vec<&DescriptorSetLayout> = layouts.iter().map(|l| &l.layout).collect();
        PipelineLayout::new(&self.device, &set_layouts, name)
            .map(Arc::new)
            .map_err(|e| Error::failure("Creating pipeline layout", e))
    }

    fn headless_swapchain(&self, info: &SwapchainInfo<'_>) -> Result<VulkanSwapchain> {
        let format = info.format.unwrap_or(Format::Rgba8Unorm);
        let usage = ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        let desc = ImageDesc {
            locality: MemoryLocality::Device,
            name: info.name.map(str::to_owned),
            ..ImageDesc::texture_2d(info.width, info.height, format, usage)
        };
        let images = (0..info.image_count.max(1))
            .map(|_| self.create_image(&desc).map(|image| image.inner))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!("Headless swapchain {}x{} {:?}, {} images", info.width, info.height, format, images.len());
        Ok(VulkanSwapchain {
            kind: SwapchainKind::Headless {
                images,
                next: AtomicU32::new(0),
            },
            format,
            extent: (info.width, info.height),
            device: Arc::clone(&self.device),
        })
    }
}

fn entry_points<'a>(stages: &[ShaderStageInfo<'a, Vulkan>]) -> Result<Vec<EntryPoint<'a>>> {
    stages
        .iter()
        .map(|s| {
            let shader: &'a VulkanShader = s.shader;
            shader
                .module
                .entry_point(s.entry, convert::shader_stage(s.stage))
                .map_err(|e| Error::invalid(format!("Invalid entry point name {:?}: {e}", s.entry)))
        })
        .collect()
}

fn blend_attachment(state: &BlendState) -> vk::PipelineColorBlendAttachmentState {
    let attachment = vk::PipelineColorBlendAttachmentState::default().color_write_mask(vk::ColorComponentFlags::RGBA);
    match state.blend {
        None => attachment,
        Some(b) => attachment
            .blend_enable(true)
            .src_color_blend_factor(convert::blend_factor(b.src_color))
            .dst_color_blend_factor(convert::blend_factor(b.dst_color))
            .color_blend_op(convert::blend_op(b.color_op))
            .src_alpha_blend_factor(convert::blend_factor(b.src_alpha))
            .dst_alpha_blend_factor(convert::blend_factor(b.dst_alpha))
            .alpha_blend_op(convert::blend_op(b.alpha_op)),
    }
}

fn shader_group(group: &ShaderGroup) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let stage = |s: Option<u32>| s.unwrap_or(vk::SHADER_UNUSED_KHR);
    let base = vk::RayTracingShaderGroupCreateInfoKHR::default()
        .general_shader(vk::SHADER_UNUSED_KHR)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR);
    match *group {
        ShaderGroup::General(index) => base
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(index),
        ShaderGroup::TrianglesHit { closest_hit, any_hit } => base
            .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
            .closest_hit_shader(stage(closest_hit))
            .any_hit_shader(stage(any_hit)),
        ShaderGroup::ProceduralHit {
            intersection,
            closest_hit,
            any_hit,
        } => base
            .ty(vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP)
            .intersection_shader(intersection)
            .closest_hit_shader(stage(closest_hit))
            .any_hit_shader(stage(any_hit)),
    }
}

impl DeviceApi<Vulkan> for VulkanDevice {
    fn create_image(&self, desc: &ImageDesc) -> Result<VulkanImage> {
        let (image_type, _) = convert::image_type(desc.dimension, desc.array_layers);
        let image = VkImage::new(
            &self.device,
            ImageInfo {
                image_type,
                format: convert::format(desc.format),
                extent: vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: desc.depth,
                },
                mip_levels: desc.mip_levels,
                array_layers: desc.array_layers,
                usage: convert::image_usage(desc.usage),
                memory_usage: convert::memory_usage(desc.locality),
            },
            desc.name.as_deref(),
        )
        .map_err(|e| Error::failure("Creating image", e))?;
        let handle = image.raw_image();
        let inner = ImageInner::new(&self.device, handle, desc.clone(), Backing::Owned(image))?;
        Ok(VulkanImage { inner: Arc::new(inner) })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<VulkanBuffer> {
        let buffer = VkBuffer::new(
            &self.device,
            desc.size,
            convert::buffer_usage(desc.usage),
            convert::memory_usage(desc.locality),
            desc.name.as_deref(),
        )
        .map_err(|e| Error::failure("Creating buffer", e))?;
        Ok(VulkanBuffer {
            raw: buffer.raw_buffer(),
            address: buffer.device_address(),
            buffer: Mutex::new(buffer),
        })
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<VulkanSampler> {
        if let Some(anisotropy) = desc.max_anisotropy {
            tracing::debug!("Sampler anisotropy {anisotropy} requested but not enabled on this device; ignoring");
        }
        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(convert::mipmap_mode(desc.mip_filter))
            .address_mode_u(convert::address_mode(desc.address_u))
            .address_mode_v(convert::address_mode(desc.address_v))
            .address_mode_w(convert::address_mode(desc.address_w))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod.min(vk::LOD_CLAMP_NONE));
        if let Some(op) = desc.compare {
            create_info = create_info.compare_enable(true).compare_op(convert::compare_op(op));
        }
        let sampler = VkSampler::new(&self.device, &create_info, desc.name.as_deref())
            .map_err(|e| Error::failure("Creating sampler", e))?;
        Ok(VulkanSampler { sampler })
    }

    fn create_shader(&self, code: &[u8], name: Option<&str>) -> Result<VulkanShader> {
        let module =
            ShaderModule::new(&self.device, code, name).map_err(|e| Error::failure("Creating shader module", e))?;
        Ok(VulkanShader { module })
    }

    fn create_descriptor_table_layout(
        &self,
        ranges: &[DescriptorRange],
        name: Option<&str>,
    ) -> Result<VulkanDescriptorTableLayout> {
        if ranges.iter().any(|r| r.dynamic) && !self.features.descriptor_indexing {
            return Err(Error::not_implemented("dynamic descriptor ranges without descriptor indexing"));
        }
        let bindings = ranges
            .iter()
            .map(|range| {
                Ok(DescriptorBindingDesc {
                    binding: range.slot()?,
                    descriptor_type: convert::descriptor_type(range.ty),
                    count: range.count,
                    stage_flags: convert::shader_stages(range.stages),
                    flags: if range.dynamic {
                        vk::DescriptorBindingFlags::PARTIALLY_BOUND
                            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
                    } else {
                        vk::DescriptorBindingFlags::empty()
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let layout = DescriptorSetLayout::new(&self.device, &bindings, name)
            .map_err(|e| Error::failure("Creating descriptor table layout", e))?;
        Ok(VulkanDescriptorTableLayout { layout })
    }

    fn create_descriptor_table(
        &self,
        layout: &VulkanDescriptorTableLayout,
        variable_count: Option<u32>,
        name: Option<&str>,
    ) -> Result<VulkanDescriptorTable> {
        let (pool, set) = self.allocate_set(&layout.layout, variable_count)?;
        // SAFETY: set was just allocated from this device.
        unsafe { self.device.name_or_warn(set.raw_descriptor_set(), "descriptor set", name) };
        Ok(VulkanDescriptorTable { set, pool })
    }

    fn write_descriptor(
        &self,
        table: &VulkanDescriptorTable,
        binding: DescriptorBinding,
        resource: DescriptorResource<'_, Vulkan>,
    ) -> Result<()> {
        let set = table.set;
        let ty = convert::descriptor_type(binding.ty);
        let (slot, element) = (binding.slot, binding.array_index);
        // SAFETY: every handle below belongs to this device and the frontend
        // only writes tables that no pending command list references.
        unsafe {
            match resource {
                DescriptorResource::Buffer { buffer, offset, size } => {
                    set.write_buffer(&self.device, slot, element, ty, buffer.raw, offset, size)
                }
                DescriptorResource::Image { image, state } => set.write_image(
                    &self.device,
                    slot,
                    element,
                    ty,
                    image.inner.view.raw_image_view(),
                    vk::Sampler::null(),
                    convert::image_layout(state),
                ),
                DescriptorResource::Sampler(sampler) => set.write_image(
                    &self.device,
                    slot,
                    element,
                    ty,
                    vk::ImageView::null(),
                    sampler.sampler.raw_sampler(),
                    vk::ImageLayout::UNDEFINED,
                ),
                DescriptorResource::AccelerationStructure(accel) => {
                    set.write_acceleration_structure(&self.device, slot, element, accel.inner.raw_handle())
                }
            }
        }
        Ok(())
    }

    fn create_render_target(&self, info: &RenderTargetInfo<'_, Vulkan>) -> Result<VulkanRenderTarget> {
        let attachment = |a: &AttachmentInfo<'_, Vulkan>| -> Result<RenderAttachment> {
            let inner = &a.image.inner;
            let format = convert::format(a.format);
            let range = vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask(format))
                .base_mip_level(a.subresource.mip)
                .level_count(1)
                .base_array_layer(a.subresource.layer)
                .layer_count(1);
            // SAFETY: the attachment holds an Arc to the image, which
            // outlives the view by field order.
            let view = unsafe {
                ImageView::new(&self.device, inner.handle, vk::ImageViewType::TYPE_2D, format, range, info.name)
            }
            .map_err(|e| Error::failure("Creating render target view", e))?;
            Ok(RenderAttachment {
                view,
                _image: Arc::clone(inner),
            })
        };
        Ok(VulkanRenderTarget {
            colors: info.colors.iter().map(attachment).collect::<Result<_>>()?,
            depth: info.depth.as_ref().map(attachment).transpose()?,
            extent: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
        })
    }

    fn create_graphics_pipeline(&self, info: &GraphicsPipelineInfo<'_, Vulkan>) -> Result<VulkanPipeline> {
        let layout = self.pipeline_layout(&info.layouts, info.name)?;
        let stages = entry_points(&info.stages)?;
        let bindings: Vec<vk::VertexInputBindingDescription> = info
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(index, vb)| {
                vk::VertexInputBindingDescription::default()
                    .binding(index as u32)
                    .stride(vb.stride)
                    .input_rate(convert::step_mode(vb.step))
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = info
            .vertex_buffers
            .iter()
            .enumerate()
            .flat_map(|(index, vb)| {
                vb.attributes.iter().map(move |a| {
                    vk::VertexInputAttributeDescription::default()
                        .location(a.location)
                        .binding(index as u32)
                        .format(convert::format(a.format))
                        .offset(a.offset)
                })
            })
            .collect();
        let color_formats: Vec<vk::Format> = info.color_formats.iter().map(|&f| convert::format(f)).collect();
        let color_blend: Vec<vk::PipelineColorBlendAttachmentState> = info.blend.iter().map(blend_attachment).collect();

        let desc = GraphicsPipelineDesc {
            stages: &stages,
            layout,
            vertex_bindings: &bindings,
            vertex_attributes: &attributes,
            topology: convert::topology(info.topology),
            color_attachment_formats: &color_formats,
            color_blend: &color_blend,
            depth_attachment_format: info.depth_format.map(convert::format),
            depth_test: info.depth_stencil.depth_test,
            depth_write: info.depth_stencil.depth_write,
            depth_compare_op: convert::compare_op(info.depth_stencil.compare),
            polygon_mode: convert::polygon_mode(info.rasterizer.fill),
            cull_mode: convert::cull_mode(info.rasterizer.cull),
            front_face: convert::front_face(info.rasterizer.front_face),
        };
        let pipeline = VkPipeline::graphics(&self.device, &desc, info.name)
            .map_err(|e| Error::failure("Creating graphics pipeline", e))?;
        Ok(VulkanPipeline { pipeline })
    }

    fn create_compute_pipeline(&self, info: &ComputePipelineInfo<'_, Vulkan>) -> Result<VulkanPipeline> {
        let layout = self.pipeline_layout(&info.layouts, info.name)?;
        let stages = entry_points(std::slice::from_ref(&info.stage))?;
        let stage = stages.first().ok_or(Error::invalid("Compute pipeline has no stage"))?;
        let pipeline = VkPipeline::compute(&self.device, stage, &layout, info.name)
            .map_err(|e| Error::failure("Creating compute pipeline", e))?;
        Ok(VulkanPipeline { pipeline })
    }

    fn create_ray_tracing_pipeline(&self, info: &RayTracingPipelineInfo<'_, Vulkan>) -> Result<VulkanPipeline> {
        self.require_ray_tracing("ray tracing pipelines")?;
        let layout = self.pipeline_layout(&info.layouts, info.name)?;
        let stages = entry_points(&info.stages)?;
        let groups: Vec<_> = info.groups.iter().map(shader_group).collect();
        let pipeline =
            VkPipeline::ray_tracing(&self.device, &stages, &groups, info.max_recursion_depth, &layout, info.name)
                .map_err(|e| Error::failure("Creating ray tracing pipeline", e))?;
        Ok(VulkanPipeline { pipeline })
    }

    fn shader_group_handles(&self, pipeline: &VulkanPipeline, group_count: u32) -> Result<Vec<u8>> {
        self.require_ray_tracing("shader group handles")?;
        pipeline
            .pipeline
            .shader_group_handles(group_count)
            .map_err(|e| Error::failure("Fetching shader group handles", e))
    }

    fn acceleration_structure_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
        flags: BuildFlags,
    ) -> Result<AccelerationStructureSizes> {
        self.require_ray_tracing("acceleration structures")?;
        let lowered = LoweredGeometry::new(geometry);
        let build_info = lowered.build_info(flags);
        // SAFETY: size queries read only counts and formats from build_info;
        // its addresses are never dereferenced.
        let sizes = unsafe {
            self.device
                .get_raw_acceleration_structure_build_sizes(&build_info, &lowered.counts)
        }
        .map_err(|e| Error::failure("Querying acceleration structure sizes", e))?;
        Ok(AccelerationStructureSizes {
            storage: sizes.acceleration_structure_size,
            build_scratch: sizes.build_scratch_size,
            update_scratch: sizes.update_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        top_level: bool,
        size: u64,
        name: Option<&str>,
    ) -> Result<VulkanAccelerationStructure> {
        self.require_ray_tracing("acceleration structures")?;
        let ty = if top_level {
            vk::AccelerationStructureTypeKHR::TOP_LEVEL
        } else {
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
        };
        let inner = VkAccelerationStructure::new(&self.device, ty, size, name)
            .map_err(|e| Error::failure("Creating acceleration structure", e))?;
        Ok(VulkanAccelerationStructure { inner })
    }

    fn create_command_pool(&self, queue: QueueKind, name: Option<&str>) -> Result<VulkanCommandPool> {
        let family = self.device.queue_family(convert::queue_kind(queue));
        let pool = ResettableCommandPool::new(&self.device, family, name)
            .map_err(|e| Error::failure("Creating command pool", e))?;
        Ok(VulkanCommandPool {
            pool,
            device: Arc::clone(&self.device),
            ray_tracing: self.features.ray_tracing,
        })
    }

    fn create_fence(&self, signaled: bool, name: Option<&str>) -> Result<VulkanFence> {
        let fence = VkFence::new(&self.device, signaled, name).map_err(|e| Error::failure("Creating fence", e))?;
        Ok(VulkanFence {
            raw: fence.raw_fence(),
            fence: Mutex::new(fence),
        })
    }

    fn create_semaphore(&self, name: Option<&str>) -> Result<VulkanSemaphore> {
        let semaphore =
            VkSemaphore::new(&self.device, name).map_err(|e| Error::failure("Creating semaphore", e))?;
        Ok(VulkanSemaphore { semaphore })
    }

    fn create_swapchain(&self, info: &SwapchainInfo<'_>, old: Option<&VulkanSwapchain>) -> Result<VulkanSwapchain> {
        if info.surface == CanvasSurface::Headless {
            return self.headless_swapchain(info);
        }
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| Error::invalid("A window canvas needs a System created with a window"))?;
        let old = old.and_then(|o| match &o.kind {
            SwapchainKind::Window(swapchain) => Some(swapchain.as_ref()),
            SwapchainKind::Headless { .. } => None,
        });
        let config = SwapchainConfig {
            desired_extent: vk::Extent2D {
                width: info.width,
                height: info.height,
            },
            image_count: info.image_count,
            preferred_format: info.format.map(convert::format),
            preferred_present_mode: convert::present_mode(info.present_mode),
        };
        let swapchain =
            VkSwapchain::new(&self.device, surface, config, old).map_err(|e| Error::failure("Creating swapchain", e))?;
        let format = convert::format_from_vk(swapchain.format()).ok_or_else(|| {
            Error::failure(
                "Creating swapchain",
                format!("surface format {:?} has no xgpu equivalent", swapchain.format()),
            )
        })?;
        let extent = swapchain.extent();
        Ok(VulkanSwapchain {
            kind: SwapchainKind::Window(Arc::new(swapchain)),
            format,
            extent: (extent.width, extent.height),
            device: Arc::clone(&self.device),
        })
    }

    fn submit(&self, queue: QueueKind, submissions: &[SubmitInfo<'_, Vulkan>]) -> Result<()> {
        let semaphore_info = |s: &&VulkanSemaphore| {
            vk::SemaphoreSubmitInfo::default()
                .semaphore(s.semaphore.raw_semaphore())
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        };
        let command_buffers: Vec<[vk::CommandBufferSubmitInfo<'_>; 1]> = submissions
            .iter()
            .map(|s| {
                [vk::CommandBufferSubmitInfo::default().command_buffer(s.command_buffer.buffer.raw_command_buffer())]
            })
            .collect();
        let waits: Vec<Vec<vk::SemaphoreSubmitInfo<'_>>> = submissions
            .iter()
            .map(|s| s.wait_semaphores.iter().map(semaphore_info).collect())
            .collect();
        let signals: Vec<Vec<vk::SemaphoreSubmitInfo<'_>>> = submissions
            .iter()
            .map(|s| s.signal_semaphores.iter().map(semaphore_info).collect())
            .collect();
        let batches: Vec<(vk::SubmitInfo2<'_>, vk::Fence)> = submissions
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let submit = vk::SubmitInfo2::default()
                    .command_buffer_infos(&command_buffers[i])
                    .wait_semaphore_infos(&waits[i])
                    .signal_semaphore_infos(&signals[i]);
                (submit, s.fence.raw)
            })
            .collect();

        // SAFETY: every command buffer is executable, every fence unsignaled
        // and every semaphore is used as the frame protocol dictates.
        unsafe { self.device.queue_submit2_batches(convert::queue_kind(queue), &batches) }
            .map_err(|e| Error::failure("Submitting command lists", e))?;

        for s in submissions {
            // SAFETY: the raw fence was handed to the submission above.
            if let Err(e) = unsafe { lock(&s.fence.fence).mark_submitted() } {
                tracing::warn!("Fence {:?} submitted twice: {e}", s.fence.raw);
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        self.device
            .wait_idle()
            .map_err(|e| Error::failure("Waiting for device idle", e))
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

enum Backing {
    Owned(#[allow(dead_code)] VkImage),
    Swapchain(#[allow(dead_code)] Arc<VkSwapchain<Window>>),
}

/// Image storage plus a view over every subresource. `view` is declared
/// before `_backing` so it drops first.
struct ImageInner {
    handle: vk::Image,
    desc: ImageDesc,
    view: ImageView,
    _backing: Backing,
}

impl ImageInner {
    fn new(device: &Arc<VkDevice>, handle: vk::Image, desc: ImageDesc, backing: Backing) -> Result<Self> {
        let (_, view_type) = convert::image_type(desc.dimension, desc.array_layers);
        let aspect = if desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(desc.mip_levels)
            .base_array_layer(0)
            .layer_count(desc.array_layers);
        // SAFETY: handle is owned by `backing`, which this struct keeps alive
        // for as long as the view.
        let view = unsafe {
            ImageView::new(device, handle, view_type, convert::format(desc.format), range, desc.name.as_deref())
        }
        .map_err(|e| Error::failure("Creating image view", e))?;
        Ok(Self {
            handle,
            desc,
            view,
            _backing: backing,
        })
    }

    fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_mask(convert::format(self.desc.format))
    }

    /// Copies address one aspect; depth-stencil images copy depth only.
    fn copy_aspect(&self) -> vk::ImageAspectFlags {
        if self.desc.format.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    fn range(&self, range: SubresourceRange) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect())
            .base_mip_level(range.base_mip)
            .level_count(range.mip_count)
            .base_array_layer(range.base_layer)
            .layer_count(range.layer_count)
    }

    fn layers(&self, sub: Subresource) -> vk::ImageSubresourceLayers {
        vk::ImageSubresourceLayers::default()
            .aspect_mask(self.copy_aspect())
            .mip_level(sub.mip)
            .base_array_layer(sub.layer)
            .layer_count(1)
    }

    fn extent(&self, mip: u32) -> vk::Extent3D {
        let (width, height, depth) = mip_extent(self.desc.width, self.desc.height, self.desc.depth, mip);
        vk::Extent3D { width, height, depth }
    }
}

pub struct VulkanImage {
    inner: Arc<ImageInner>,
}

pub struct VulkanBuffer {
    raw: vk::Buffer,
    address: Option<u64>,
    buffer: Mutex<VkBuffer>,
}

fn map_error(context: &'static str, e: MapBufferError) -> Error {
    match e {
        MapBufferError::OutOfBounds { .. } => Error::invalid(e.to_string()),
        e => Error::failure(context, e),
    }
}

impl BufferApi for VulkanBuffer {
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        lock(&self.buffer)
            .write_bytes(offset, bytes)
            .map_err(|e| map_error("Writing buffer", e))
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        lock(&self.buffer)
            .read_bytes(offset, out)
            .map_err(|e| map_error("Reading buffer", e))
    }

    fn device_address(&self) -> Option<u64> {
        self.address
    }
}

pub struct VulkanSampler {
    sampler: VkSampler,
}

pub struct VulkanShader {
    module: ShaderModule,
}

pub struct VulkanDescriptorTableLayout {
    layout: DescriptorSetLayout,
}

pub struct VulkanDescriptorTable {
    set: DescriptorSet,
    pool: Arc<Mutex<DescriptorPool>>,
}

impl Drop for VulkanDescriptorTable {
    fn drop(&mut self) {
        // SAFETY: set came from this pool, and the frontend drops tables only
        // after the command lists using them complete.
        if let Err(e) = unsafe { lock(&self.pool).free(self.set) } {
            tracing::error!("Failed to free descriptor set: {e}");
        }
    }
}

/// `view` drops before the image it points into.
struct RenderAttachment {
    view: ImageView,
    _image: Arc<ImageInner>,
}

pub struct VulkanRenderTarget {
    colors: Vec<RenderAttachment>,
    depth: Option<RenderAttachment>,
    extent: vk::Extent2D,
}

pub struct VulkanPipeline {
    pipeline: VkPipeline,
}

pub struct VulkanAccelerationStructure {
    inner: VkAccelerationStructure,
}

impl AccelerationStructureApi for VulkanAccelerationStructure {
    fn device_address(&self) -> u64 {
        self.inner.device_address()
    }
}

/// Build geometry in `ash` form, with one primitive count per geometry.
struct LoweredGeometry {
    ty: vk::AccelerationStructureTypeKHR,
    geometries: Vec<vk::AccelerationStructureGeometryKHR<'static>>,
    counts: Vec<u32>,
}

fn geometry_flags(opaque: bool) -> vk::GeometryFlagsKHR {
    if opaque {
        vk::GeometryFlagsKHR::OPAQUE
    } else {
        vk::GeometryFlagsKHR::empty()
    }
}

fn device_address(address: u64) -> vk::DeviceOrHostAddressConstKHR {
    vk::DeviceOrHostAddressConstKHR {
        device_address: address,
    }
}

fn lower_bottom(info: &GeometryInfo) -> (vk::AccelerationStructureGeometryKHR<'static>, u32) {
    match *info {
        GeometryInfo::Triangles {
            vertex_address,
            vertex_stride,
            vertex_count,
            vertex_format,
            index,
            triangle_count,
            opaque,
        } => {
            let (index_type, index_address) =
                index.map_or((vk::IndexType::NONE_KHR, 0), |(address, f)| (convert::index_type(f), address));
            let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                .vertex_format(convert::format(vertex_format))
                .vertex_data(device_address(vertex_address))
                .vertex_stride(vertex_stride)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(index_type)
                .index_data(device_address(index_address));
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                .flags(geometry_flags(opaque));
            (geometry, triangle_count)
        }
        GeometryInfo::Aabbs {
            address,
            stride,
            count,
            opaque,
        } => {
            let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                .data(device_address(address))
                .stride(stride);
            let geometry = vk::AccelerationStructureGeometryKHR::default()
                .geometry_type(vk::GeometryTypeKHR::AABBS)
                .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                .flags(geometry_flags(opaque));
            (geometry, count)
        }
    }
}

impl LoweredGeometry {
    fn new(geometry: &AccelerationStructureGeometry) -> Self {
        match geometry {
            AccelerationStructureGeometry::BottomLevel(list) => {
                let (geometries, counts) = list.iter().map(lower_bottom).unzip();
                Self {
                    ty: vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                    geometries,
                    counts,
                }
            }
            AccelerationStructureGeometry::TopLevel {
                instance_address,
                instance_count,
            } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(device_address(*instance_address));
                let geometry = vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances });
                Self {
                    ty: vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                    geometries: vec![geometry],
                    counts: vec![*instance_count],
                }
            }
        }
    }

    fn build_info(&self, flags: BuildFlags) -> vk::AccelerationStructureBuildGeometryInfoKHR<'_> {
        vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(self.ty)
            .flags(convert::build_flags(flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&self.geometries)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub struct VulkanCommandPool {
    pool: ResettableCommandPool,
    device: Arc<VkDevice>,
    ray_tracing: bool,
}

impl CommandPoolApi<Vulkan> for VulkanCommandPool {
    fn allocate(&mut self) -> Result<VulkanCommandBuffer> {
        let buffer = self
            .pool
            .allocate_command_buffer()
            .map_err(|e| Error::failure("Allocating command buffer", e))?;
        Ok(VulkanCommandBuffer {
            buffer,
            device: Arc::clone(&self.device),
            ray_tracing: self.ray_tracing,
        })
    }
}

pub struct VulkanCommandBuffer {
    buffer: ResettableCommandBuffer,
    device: Arc<VkDevice>,
    ray_tracing: bool,
}

fn strided_region(region: StridedRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR::default()
        .device_address(region.address)
        .stride(region.stride)
        .size(region.size)
}

fn clear_value(value: Option<&ClearValue>) -> vk::ClearValue {
    match value {
        Some(ClearValue::DepthStencil { depth, stencil }) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: *depth,
                stencil: *stencil,
            },
        },
        Some(ClearValue::Color(color)) => vk::ClearValue {
            color: vk::ClearColorValue { float32: *color },
        },
        None => vk::ClearValue::default(),
    }
}

impl VulkanCommandBuffer {
    fn scope(&self, state: ResourceState) -> convert::StateScope {
        convert::state_scope(state, self.ray_tracing)
    }
}

impl CommandBufferApi<Vulkan> for VulkanCommandBuffer {
    fn begin(&mut self) -> Result<()> {
        // SAFETY: the frontend only begins lists whose fence has signaled.
        unsafe {
            self.buffer
                .reset()
                .map_err(|e| Error::failure("Resetting command buffer", e))?;
            self.buffer
                .begin()
                .map_err(|e| Error::failure("Beginning command buffer", e))
        }
    }

    fn end(&mut self) -> Result<()> {
        // SAFETY: the frontend ends only lists it began.
        unsafe { self.buffer.end() }.map_err(|e| Error::failure("Ending command buffer", e))
    }

    fn record(&mut self, command: Command<'_, Vulkan>) -> Result<()> {
        let cb = self.buffer.raw_command_buffer();
        let device = &*self.device;
        // SAFETY: cb is recording, every operand is a live object from this
        // device retained by the command list, and the frontend has already
        // validated render pass scope, bounds and image states.
        unsafe {
            match command {
                Command::ImageBarrier { image, transitions } => {
                    let inner = &image.inner;
                    let barriers: Vec<vk::ImageMemoryBarrier2<'_>> = transitions
                        .iter()
                        .map(|t| {
                            let (from, to) = (self.scope(t.from), self.scope(t.to));
                            vk::ImageMemoryBarrier2::default()
                                .src_stage_mask(from.stage)
                                .src_access_mask(from.access)
                                .dst_stage_mask(to.stage)
                                .dst_access_mask(to.access)
                                .old_layout(from.layout)
                                .new_layout(to.layout)
                                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                                .image(inner.handle)
                                .subresource_range(inner.range(t.range))
                        })
                        .collect();
                    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
                    device.cmd_pipeline_barrier2(cb, &dependency);
                }
                Command::BufferBarrier { buffer, from, to } => {
                    let (from, to) = (self.scope(from), self.scope(to));
                    let barrier = vk::BufferMemoryBarrier2::default()
                        .src_stage_mask(from.stage)
                        .src_access_mask(from.access)
                        .dst_stage_mask(to.stage)
                        .dst_access_mask(to.access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buffer.raw)
                        .offset(0)
                        .size(vk::WHOLE_SIZE);
                    let dependency =
                        vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
                    device.cmd_pipeline_barrier2(cb, &dependency);
                }
                Command::MemoryBarrier { from, to } => {
                    let (from, to) = (self.scope(from), self.scope(to));
                    let barrier = vk::MemoryBarrier2::default()
                        .src_stage_mask(from.stage)
                        .src_access_mask(from.access)
                        .dst_stage_mask(to.stage)
                        .dst_access_mask(to.access);
                    let dependency = vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier));
                    device.cmd_pipeline_barrier2(cb, &dependency);
                }
                Command::BeginRenderPass {
                    target,
                    pass,
                    clear_values,
                    color_states,
                    depth_state,
                } => {
                    let colors: Vec<vk::RenderingAttachmentInfo<'_>> = target
                        .colors
                        .iter()
                        .zip(&pass.colors)
                        .enumerate()
                        .map(|(i, (attachment, desc))| {
                            let state = color_states.get(i).copied().unwrap_or(ResourceState::ColorWrite);
                            vk::RenderingAttachmentInfo::default()
                                .image_view(attachment.view.raw_image_view())
                                .image_layout(convert::image_layout(state))
                                .load_op(convert::load_op(desc.load))
                                .store_op(convert::store_op(desc.store))
                                .clear_value(clear_value(clear_values.get(i)))
                        })
                        .collect();
                    let depth = target.depth.as_ref().zip(pass.depth.as_ref()).map(|(attachment, desc)| {
                        let state = depth_state.unwrap_or(ResourceState::DepthWrite);
                        vk::RenderingAttachmentInfo::default()
                            .image_view(attachment.view.raw_image_view())
                            .image_layout(convert::image_layout(state))
                            .load_op(convert::load_op(desc.load))
                            .store_op(convert::store_op(desc.store))
                            .clear_value(clear_value(clear_values.get(pass.colors.len())))
                    });
                    let mut rendering = vk::RenderingInfo::default()
                        .render_area(vk::Rect2D {
                            offset: vk::Offset2D::default(),
                            extent: target.extent,
                        })
                        .layer_count(1)
                        .color_attachments(&colors);
                    if let Some(depth) = depth.as_ref() {
                        rendering = rendering.depth_attachment(depth);
                    }
                    device.cmd_begin_rendering(cb, &rendering);
                }
                Command::EndRenderPass => device.cmd_end_rendering(cb),
                Command::BindPipeline(pipeline) => {
                    device.cmd_bind_pipeline(cb, pipeline.pipeline.bind_point(), pipeline.pipeline.raw_handle())
                }
                Command::BindDescriptorTable { pipeline, index, table } => device.cmd_bind_descriptor_sets(
                    cb,
                    pipeline.pipeline.bind_point(),
                    pipeline.pipeline.layout().raw_handle(),
                    index,
                    &[table.set.raw_descriptor_set()],
                ),
                Command::BindVertexBuffer { slot, buffer, offset } => {
                    device.cmd_bind_vertex_buffers(cb, slot, &[buffer.raw], &[offset])
                }
                Command::BindIndexBuffer { buffer, offset, format } => {
                    device.cmd_bind_index_buffer(cb, buffer.raw, offset, convert::index_type(format))
                }
                Command::SetViewport(v) => device.cmd_set_viewport(
                    cb,
                    &[vk::Viewport {
                        x: v.x,
                        y: v.y,
                        width: v.width,
                        height: v.height,
                        min_depth: v.min_depth,
                        max_depth: v.max_depth,
                    }],
                ),
                Command::SetScissor(r) => device.cmd_set_scissor(
                    cb,
                    &[vk::Rect2D {
                        offset: vk::Offset2D { x: r.x, y: r.y },
                        extent: vk::Extent2D {
                            width: r.width,
                            height: r.height,
                        },
                    }],
                ),
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => device.cmd_draw(cb, vertex_count, instance_count, first_vertex, first_instance),
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => device.cmd_draw_indexed(
                    cb,
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                ),
                Command::Dispatch { x, y, z } => device.cmd_dispatch(cb, x, y, z),
                Command::TraceRays {
                    regions,
                    width,
                    height,
                    depth,
                } => device
                    .cmd_trace_rays(
                        cb,
                        &strided_region(regions.raygen),
                        &strided_region(regions.miss),
                        &strided_region(regions.hit),
                        &strided_region(regions.callable),
                        width,
                        height,
                        depth,
                    )
                    .map_err(|e| Error::failure("Recording ray dispatch", e))?,
                Command::BuildAccelerationStructure {
                    dst,
                    geometry,
                    flags,
                    mode,
                    scratch_address,
                } => {
                    let lowered = LoweredGeometry::new(geometry);
                    let mut info = lowered
                        .build_info(flags)
                        .dst_acceleration_structure(dst.inner.raw_handle())
                        .scratch_data(vk::DeviceOrHostAddressKHR {
                            device_address: scratch_address,
                        });
                    if mode == BuildMode::Update {
                        info = info
                            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
                            .src_acceleration_structure(dst.inner.raw_handle());
                    }
                    let ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR> = lowered
                        .counts
                        .iter()
                        .map(|&count| vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(count))
                        .collect();
                    device
                        .cmd_build_acceleration_structures(cb, std::slice::from_ref(&info), &[&ranges])
                        .map_err(|e| Error::failure("Recording acceleration structure build", e))?;
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let region = vk::BufferCopy::default()
                        .src_offset(src_offset)
                        .dst_offset(dst_offset)
                        .size(size);
                    device.cmd_copy_buffer(cb, src.raw, dst.raw, &[region]);
                }
                Command::CopyBufferToImage {
                    src,
                    src_offset,
                    dst,
                    dst_state,
                    subresource,
                } => {
                    let region = vk::BufferImageCopy::default()
                        .buffer_offset(src_offset)
                        .image_subresource(dst.inner.layers(subresource))
                        .image_extent(dst.inner.extent(subresource.mip));
                    device.cmd_copy_buffer_to_image(
                        cb,
                        src.raw,
                        dst.inner.handle,
                        convert::image_layout(dst_state),
                        &[region],
                    );
                }
                Command::CopyImageToBuffer {
                    src,
                    src_state,
                    subresource,
                    dst,
                    dst_offset,
                } => {
                    let region = vk::BufferImageCopy::default()
                        .buffer_offset(dst_offset)
                        .image_subresource(src.inner.layers(subresource))
                        .image_extent(src.inner.extent(subresource.mip));
                    device.cmd_copy_image_to_buffer(
                        cb,
                        src.inner.handle,
                        convert::image_layout(src_state),
                        dst.raw,
                        &[region],
                    );
                }
                Command::CopyImage {
                    src,
                    src_state,
                    src_subresource,
                    dst,
                    dst_state,
                    dst_subresource,
                } => {
                    let region = vk::ImageCopy::default()
                        .src_subresource(src.inner.layers(src_subresource))
                        .dst_subresource(dst.inner.layers(dst_subresource))
                        .extent(src.inner.extent(src_subresource.mip));
                    device.cmd_copy_image(
                        cb,
                        src.inner.handle,
                        convert::image_layout(src_state),
                        dst.inner.handle,
                        convert::image_layout(dst_state),
                        &[region],
                    );
                }
                Command::ClearColor {
                    image,
                    state,
                    range,
                    color,
                } => device.cmd_clear_color_image(
                    cb,
                    image.inner.handle,
                    convert::image_layout(state),
                    &vk::ClearColorValue { float32: color },
                    &[image.inner.range(range)],
                ),
                Command::ClearDepth {
                    image,
                    state,
                    range,
                    depth,
                } => device.cmd_clear_depth_stencil_image(
                    cb,
                    image.inner.handle,
                    convert::image_layout(state),
                    &vk::ClearDepthStencilValue { depth, stencil: 0 },
                    &[image.inner.range(range)],
                ),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synchronization and presentation
// ---------------------------------------------------------------------------

pub struct VulkanFence {
    raw: vk::Fence,
    fence: Mutex<VkFence>,
}

impl FenceApi for VulkanFence {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        match lock(&self.fence).wait(timeout_ns(timeout)) {
            Ok(()) | Err(WaitFenceError::NotSubmitted) => Ok(true),
            Err(WaitFenceError::Timeout) => Ok(false),
            Err(e) => Err(Error::failure("Waiting for fence", e)),
        }
    }

    fn reset(&self) -> Result<()> {
        let mut fence = lock(&self.fence);
        if !fence.is_submitted() {
            return Ok(());
        }
        // SAFETY: the frontend resets only after a successful wait, so the
        // fence is no longer pending.
        unsafe { fence.reset() }.map_err(|e| Error::failure("Resetting fence", e))
    }
}

pub struct VulkanSemaphore {
    semaphore: VkSemaphore,
}

impl VulkanSemaphore {
    fn raw(&self) -> vk::Semaphore {
        self.semaphore.raw_semaphore()
    }
}

enum SwapchainKind {
    Window(Arc<VkSwapchain<Window>>),
    /// Offscreen images handed out round-robin.
    Headless {
        images: Vec<Arc<ImageInner>>,
        next: AtomicU32,
    },
}

pub struct VulkanSwapchain {
    kind: SwapchainKind,
    format: Format,
    extent: (u32, u32),
    device: Arc<VkDevice>,
}

impl VulkanSwapchain {
    /// Submit an empty batch on the graphics queue to move a semaphore along
    /// for headless canvases.
    fn signal_or_wait(&self, semaphore: &VulkanSemaphore, signal: bool) -> Result<()> {
        let info = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore.raw())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = if signal {
            vk::SubmitInfo2::default().signal_semaphore_infos(&info)
        } else {
            vk::SubmitInfo2::default().wait_semaphore_infos(&info)
        };
        // SAFETY: the batch has no command buffers; the frame protocol keeps
        // each semaphore alternating between one signal and one wait.
        unsafe {
            self.device
                .queue_submit2_batches(VkQueueKind::Graphics, &[(submit, vk::Fence::null())])
        }
        .map_err(|e| Error::failure("Submitting headless present", e))
    }
}

impl SwapchainApi<Vulkan> for VulkanSwapchain {
    fn images(&self) -> Result<Vec<VulkanImage>> {
        match &self.kind {
            SwapchainKind::Window(swapchain) => {
                let usage = ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
                let desc = ImageDesc::texture_2d(self.extent.0, self.extent.1, self.format, usage);
                swapchain
                    .images()
                    .iter()
                    .map(|&handle| {
                        ImageInner::new(
                            &self.device,
                            handle,
                            desc.clone(),
                            Backing::Swapchain(Arc::clone(swapchain)),
                        )
                        .map(|inner| VulkanImage { inner: Arc::new(inner) })
                    })
                    .collect()
            }
            SwapchainKind::Headless { images, .. } => Ok(images
                .iter()
                .map(|inner| VulkanImage {
                    inner: Arc::clone(inner),
                })
                .collect()),
        }
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn format(&self) -> Format {
        self.format
    }

    fn acquire(&self, signal: &VulkanSemaphore, timeout: Option<Duration>) -> Result<AcquireOutcome> {
        match &self.kind {
            SwapchainKind::Window(swapchain) => {
                // SAFETY: the frontend acquires with a semaphore that was
                // waited on by the frame that last used it.
                match unsafe { swapchain.acquire_next_image(timeout_ns(timeout), signal.raw()) } {
                    Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
                    Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(Error::TimeOut("swapchain image")),
                    Err(e) => Err(Error::failure("Acquiring swapchain image", e)),
                }
            }
            SwapchainKind::Headless { images, next } => {
                let index = next.fetch_add(1, Ordering::Relaxed) % images.len() as u32;
                self.signal_or_wait(signal, true)?;
                Ok(AcquireOutcome::Acquired {
                    index,
                    suboptimal: false,
                })
            }
        }
    }

    fn present(&self, image_index: u32, wait: &VulkanSemaphore) -> Result<PresentOutcome> {
        match &self.kind {
            SwapchainKind::Window(swapchain) => {
                // SAFETY: the frontend presents only acquired images after
                // transitioning them to Present in work signaling `wait`.
                match unsafe { swapchain.present(image_index, wait.raw()) } {
                    Ok(false) => Ok(PresentOutcome::Presented),
                    Ok(true) => Ok(PresentOutcome::Suboptimal),
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
                    Err(e) => Err(Error::failure("Presenting swapchain image", e)),
                }
            }
            SwapchainKind::Headless { .. } => {
                self.signal_or_wait(wait, false)?;
                Ok(PresentOutcome::Presented)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::IndexFormat;

    fn memory_properties(
        heaps: &[(u64, bool)],
        types: &[(u32, vk::MemoryPropertyFlags)],
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: heaps.len() as u32,
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &(size, device_local)) in heaps.iter().enumerate() {
            props.memory_heaps[i] = vk::MemoryHeap {
                size,
                flags: if device_local {
                    vk::MemoryHeapFlags::DEVICE_LOCAL
                } else {
                    vk::MemoryHeapFlags::empty()
                },
            };
        }
        for (i, &(heap_index, property_flags)) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index,
            };
        }
        props
    }

    #[test]
    fn discrete_heaps_split_by_locality() {
        let props = memory_properties(&[(8 << 30, true), (16 << 30, false)], &[
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            (0, vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE),
            (1, vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT),
        ]);
        assert_eq!(memory_sizes(&props), MemorySizes {
            device_local: 8 << 30,
            host_visible: 16 << 30,
            shared: 0,
        });
    }

    #[test]
    fn unified_heap_counts_as_shared() {
        let props = memory_properties(&[(4 << 30, true)], &[(
            0,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        )]);
        let sizes = memory_sizes(&props);
        assert_eq!(sizes.shared, 4 << 30);
        assert_eq!(sizes.device_local + sizes.host_visible, 0);
    }

    #[test]
    fn triangles_without_indices_use_none_index_type() {
        let geometry = AccelerationStructureGeometry::BottomLevel(vec![
            GeometryInfo::Triangles {
                vertex_address: 0x1000,
                vertex_stride: 12,
                vertex_count: 3,
                vertex_format: Format::Rgb32Float,
                index: None,
                triangle_count: 1,
                opaque: true,
            },
            GeometryInfo::Triangles {
                vertex_address: 0x2000,
                vertex_stride: 12,
                vertex_count: 4,
                vertex_format: Format::Rgb32Float,
                index: Some((0x3000, IndexFormat::U16)),
                triangle_count: 2,
                opaque: false,
            },
        ]);
        let lowered = LoweredGeometry::new(&geometry);
        assert_eq!(lowered.ty, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(lowered.counts, vec![1, 2]);
        assert_eq!(lowered.geometries[0].flags, vk::GeometryFlagsKHR::OPAQUE);
        // SAFETY: both geometries were built as triangles.
        let (first, second) = unsafe {
            (lowered.geometries[0].geometry.triangles, lowered.geometries[1].geometry.triangles)
        };
        assert_eq!(first.index_type, vk::IndexType::NONE_KHR);
        assert_eq!(first.max_vertex, 2);
        assert_eq!(second.index_type, vk::IndexType::UINT16);
        // SAFETY: index data was written as a device address.
        assert_eq!(unsafe { second.index_data.device_address }, 0x3000);
    }

    #[test]
    fn top_level_geometry_is_one_instance_array() {
        let lowered = LoweredGeometry::new(&AccelerationStructureGeometry::TopLevel {
            instance_address: 0x4000,
            instance_count: 7,
        });
        assert_eq!(lowered.ty, vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        assert_eq!(lowered.counts, vec![7]);
        assert_eq!(lowered.geometries[0].geometry_type, vk::GeometryTypeKHR::INSTANCES);
        let info = lowered.build_info(BuildFlags::PREFER_FAST_TRACE);
        assert_eq!(info.geometry_count, 1);
    }

    #[test]
    fn unused_group_stages_are_marked() {
        let group = shader_group(&ShaderGroup::TrianglesHit {
            closest_hit: Some(2),
            any_hit: None,
        });
        assert_eq!(group.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(group.closest_hit_shader, 2);
        assert_eq!(group.any_hit_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(group.general_shader, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn infinite_timeout_waits_forever() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_millis(2))), 2_000_000);
    }
}

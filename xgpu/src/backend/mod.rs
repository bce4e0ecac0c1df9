//! The seam between the frontend object model and native back ends.
//!
//! Frontend types are generic over [`Backend`], whose associated types are
//! the native objects. The frontend validates arguments and tracks state,
//! then lowers each call into the borrowed `*Info` structs and [`Command`]s
//! defined here. Back ends trust what they receive.

use std::sync::Arc;
use std::time::Duration;

use crate::accel::{BuildFlags, BuildMode};
use crate::binding::DescriptorType;
use crate::buffer::BufferDesc;
use crate::canvas::{CanvasSurface, PresentMode};
use crate::capability::PhysicalDeviceDescriptor;
use crate::descriptor::DescriptorRange;
use crate::device::QueueKind;
use crate::error::Result;
use crate::format::{Format, IndexFormat};
use crate::image::ImageDesc;
use crate::pass::{ClearValue, Rect, RenderPassDesc, Viewport};
use crate::pipeline::{BlendState, DepthStencilState, PrimitiveTopology, RasterizerState, VertexBufferLayout};
use crate::raytracing::{SbtRegions, ShaderGroup};
use crate::sampler::SamplerDesc;
use crate::shader::ShaderStage;
use crate::state::{ResourceState, StateTransition, Subresource, SubresourceRange};
use crate::system::WindowHandleSource;

pub mod soft;
#[cfg(feature = "vulkan")]
pub mod vulkan;

mod sealed {
    pub trait Sealed {}
}
pub(crate) use sealed::Sealed;

/// A native graphics API. Implemented only inside this crate.
pub trait Backend: Sealed + Sized + Send + Sync + 'static {
    const NAME: &'static str;

    type Config: Clone + Default + std::fmt::Debug + Send + Sync + 'static;
    type Instance: InstanceApi<Self>;
    type Device: DeviceApi<Self>;
    type Image: Send + Sync + 'static;
    type Buffer: BufferApi + Send + Sync + 'static;
    type Sampler: Send + Sync + 'static;
    type Shader: Send + Sync + 'static;
    type DescriptorTableLayout: Send + Sync + 'static;
    type DescriptorTable: Send + Sync + 'static;
    type RenderTarget: Send + Sync + 'static;
    type Pipeline: Send + Sync + 'static;
    type AccelerationStructure: AccelerationStructureApi + Send + Sync + 'static;
    type CommandPool: CommandPoolApi<Self>;
    type CommandBuffer: CommandBufferApi<Self>;
    type Fence: FenceApi;
    type Semaphore: Send + Sync + 'static;
    type Swapchain: SwapchainApi<Self>;
}

// ---------------------------------------------------------------------------
// Object traits
// ---------------------------------------------------------------------------

pub trait InstanceApi<B: Backend>: Sized + Send + Sync + 'static {
    fn new(app_name: &str, window: Option<&Arc<dyn WindowHandleSource>>, config: &B::Config) -> Result<Self>;

    /// Devices this instance can drive, in enumeration order.
    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDescriptor>>;

    fn create_device(
        &self,
        adapter: &PhysicalDeviceDescriptor,
        features: &DeviceFeatures,
        name: Option<&str>,
    ) -> Result<B::Device>;
}

/// Optional features enabled on a logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceFeatures {
    pub ray_tracing: bool,
    pub descriptor_indexing: bool,
}

pub trait DeviceApi<B: Backend>: Send + Sync + 'static {
    fn create_image(&self, desc: &ImageDesc) -> Result<B::Image>;
    fn create_buffer(&self, desc: &BufferDesc) -> Result<B::Buffer>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<B::Sampler>;
    fn create_shader(&self, code: &[u8], name: Option<&str>) -> Result<B::Shader>;

    fn create_descriptor_table_layout(
        &self,
        ranges: &[DescriptorRange],
        name: Option<&str>,
    ) -> Result<B::DescriptorTableLayout>;
    fn create_descriptor_table(
        &self,
        layout: &B::DescriptorTableLayout,
        variable_count: Option<u32>,
        name: Option<&str>,
    ) -> Result<B::DescriptorTable>;
    fn write_descriptor(
        &self,
        table: &B::DescriptorTable,
        binding: DescriptorBinding,
        resource: DescriptorResource<'_, B>,
    ) -> Result<()>;

    fn create_render_target(&self, info: &RenderTargetInfo<'_, B>) -> Result<B::RenderTarget>;
    fn create_graphics_pipeline(&self, info: &GraphicsPipelineInfo<'_, B>) -> Result<B::Pipeline>;
    fn create_compute_pipeline(&self, info: &ComputePipelineInfo<'_, B>) -> Result<B::Pipeline>;
    fn create_ray_tracing_pipeline(&self, info: &RayTracingPipelineInfo<'_, B>) -> Result<B::Pipeline>;
    /// Opaque handles of the first `group_count` groups, tightly packed.
    fn shader_group_handles(&self, pipeline: &B::Pipeline, group_count: u32) -> Result<Vec<u8>>;

    fn acceleration_structure_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
        flags: BuildFlags,
    ) -> Result<AccelerationStructureSizes>;
    fn create_acceleration_structure(
        &self,
        top_level: bool,
        size: u64,
        name: Option<&str>,
    ) -> Result<B::AccelerationStructure>;

    fn create_command_pool(&self, queue: QueueKind, name: Option<&str>) -> Result<B::CommandPool>;
    fn create_fence(&self, signaled: bool, name: Option<&str>) -> Result<B::Fence>;
    fn create_semaphore(&self, name: Option<&str>) -> Result<B::Semaphore>;
    fn create_swapchain(&self, info: &SwapchainInfo<'_>, old: Option<&B::Swapchain>) -> Result<B::Swapchain>;

    /// Submit each entry in order on `queue`, one fence per entry.
    fn submit(&self, queue: QueueKind, submissions: &[SubmitInfo<'_, B>]) -> Result<()>;
    fn wait_idle(&self) -> Result<()>;
}

pub trait BufferApi {
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()>;
    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()>;
    fn device_address(&self) -> Option<u64>;
}

pub trait AccelerationStructureApi {
    fn device_address(&self) -> u64;
}

pub trait CommandPoolApi<B: Backend>: Send + 'static {
    fn allocate(&mut self) -> Result<B::CommandBuffer>;
}

pub trait CommandBufferApi<B: Backend>: Send + 'static {
    /// Reset and begin recording. The buffer is not pending.
    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;
    fn record(&mut self, command: Command<'_, B>) -> Result<()>;
}

pub trait FenceApi: Send + Sync + 'static {
    /// Returns `false` if `timeout` elapsed first. `None` waits forever.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;
    fn reset(&self) -> Result<()>;
}

pub trait SwapchainApi<B: Backend>: Send + Sync + 'static {
    /// Native image objects for the swapchain images, in index order.
    fn images(&self) -> Result<Vec<B::Image>>;
    fn extent(&self) -> (u32, u32);
    fn format(&self) -> Format;
    fn acquire(&self, signal: &B::Semaphore, timeout: Option<Duration>) -> Result<AcquireOutcome>;
    fn present(&self, image_index: u32, wait: &B::Semaphore) -> Result<PresentOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

// ---------------------------------------------------------------------------
// Lowered creation info
// ---------------------------------------------------------------------------

pub struct ShaderStageInfo<'a, B: Backend> {
    pub shader: &'a B::Shader,
    pub entry: &'a str,
    pub stage: ShaderStage,
}

pub struct GraphicsPipelineInfo<'a, B: Backend> {
    pub stages: Vec<ShaderStageInfo<'a, B>>,
    pub layouts: Vec<&'a B::DescriptorTableLayout>,
    pub vertex_buffers: &'a [VertexBufferLayout],
    pub topology: PrimitiveTopology,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    /// One entry per color attachment.
    pub blend: Vec<BlendState>,
    pub color_formats: Vec<Format>,
    pub depth_format: Option<Format>,
    pub name: Option<&'a str>,
}

pub struct ComputePipelineInfo<'a, B: Backend> {
    pub stage: ShaderStageInfo<'a, B>,
    pub layouts: Vec<&'a B::DescriptorTableLayout>,
    pub name: Option<&'a str>,
}

pub struct RayTracingPipelineInfo<'a, B: Backend> {
    pub stages: Vec<ShaderStageInfo<'a, B>>,
    /// Stage indices refer to positions in `stages`.
    pub groups: &'a [ShaderGroup],
    pub max_recursion_depth: u32,
    pub layouts: Vec<&'a B::DescriptorTableLayout>,
    pub name: Option<&'a str>,
}

pub struct AttachmentInfo<'a, B: Backend> {
    pub image: &'a B::Image,
    pub format: Format,
    pub subresource: Subresource,
}

pub struct RenderTargetInfo<'a, B: Backend> {
    pub colors: Vec<AttachmentInfo<'a, B>>,
    pub depth: Option<AttachmentInfo<'a, B>>,
    pub width: u32,
    pub height: u32,
    pub name: Option<&'a str>,
}

/// Where a descriptor write lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    /// Position of the range in its layout.
    pub range_index: usize,
    pub slot: u32,
    pub ty: DescriptorType,
    pub array_index: u32,
}

pub enum DescriptorResource<'a, B: Backend> {
    Buffer { buffer: &'a B::Buffer, offset: u64, size: u64 },
    /// `state` is the state the image is in when shaders access it.
    Image { image: &'a B::Image, state: ResourceState },
    Sampler(&'a B::Sampler),
    AccelerationStructure(&'a B::AccelerationStructure),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryInfo {
    Triangles {
        vertex_address: u64,
        vertex_stride: u64,
        vertex_count: u32,
        vertex_format: Format,
        index: Option<(u64, IndexFormat)>,
        triangle_count: u32,
        opaque: bool,
    },
    Aabbs {
        address: u64,
        stride: u64,
        count: u32,
        opaque: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccelerationStructureGeometry {
    BottomLevel(Vec<GeometryInfo>),
    TopLevel { instance_address: u64, instance_count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelerationStructureSizes {
    pub storage: u64,
    pub build_scratch: u64,
    pub update_scratch: u64,
}

pub struct SwapchainInfo<'a> {
    pub surface: CanvasSurface,
    pub width: u32,
    pub height: u32,
    pub image_count: u32,
    pub format: Option<Format>,
    pub present_mode: PresentMode,
    pub name: Option<&'a str>,
}

pub struct SubmitInfo<'a, B: Backend> {
    pub command_buffer: &'a B::CommandBuffer,
    pub wait_semaphores: Vec<&'a B::Semaphore>,
    pub signal_semaphores: Vec<&'a B::Semaphore>,
    pub fence: &'a B::Fence,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// One validated recording operation. Image states name the tracked state
/// the operand is in while the command executes.
pub enum Command<'a, B: Backend> {
    ImageBarrier {
        image: &'a B::Image,
        transitions: &'a [StateTransition],
    },
    BufferBarrier {
        buffer: &'a B::Buffer,
        from: ResourceState,
        to: ResourceState,
    },
    /// A global barrier, used for acceleration structure storage.
    MemoryBarrier {
        from: ResourceState,
        to: ResourceState,
    },
    BeginRenderPass {
        target: &'a B::RenderTarget,
        pass: &'a RenderPassDesc,
        clear_values: &'a [ClearValue],
        color_states: &'a [ResourceState],
        depth_state: Option<ResourceState>,
    },
    EndRenderPass,
    BindPipeline(&'a B::Pipeline),
    BindDescriptorTable {
        pipeline: &'a B::Pipeline,
        index: u32,
        table: &'a B::DescriptorTable,
    },
    BindVertexBuffer {
        slot: u32,
        buffer: &'a B::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: &'a B::Buffer,
        offset: u64,
        format: IndexFormat,
    },
    SetViewport(Viewport),
    SetScissor(Rect),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    TraceRays {
        regions: &'a SbtRegions,
        width: u32,
        height: u32,
        depth: u32,
    },
    BuildAccelerationStructure {
        dst: &'a B::AccelerationStructure,
        geometry: &'a AccelerationStructureGeometry,
        flags: BuildFlags,
        mode: BuildMode,
        scratch_address: u64,
    },
    CopyBuffer {
        src: &'a B::Buffer,
        src_offset: u64,
        dst: &'a B::Buffer,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: &'a B::Buffer,
        src_offset: u64,
        dst: &'a B::Image,
        dst_state: ResourceState,
        subresource: Subresource,
    },
    CopyImageToBuffer {
        src: &'a B::Image,
        src_state: ResourceState,
        subresource: Subresource,
        dst: &'a B::Buffer,
        dst_offset: u64,
    },
    CopyImage {
        src: &'a B::Image,
        src_state: ResourceState,
        src_subresource: Subresource,
        dst: &'a B::Image,
        dst_state: ResourceState,
        dst_subresource: Subresource,
    },
    ClearColor {
        image: &'a B::Image,
        state: ResourceState,
        range: SubresourceRange,
        color: [f32; 4],
    },
    ClearDepth {
        image: &'a B::Image,
        state: ResourceState,
        range: SubresourceRange,
        depth: f32,
    },
}

/// Extent of mip `mip` of a `width x height x depth` image.
pub fn mip_extent(width: u32, height: u32, depth: u32, mip: u32) -> (u32, u32, u32) {
    let shrink = |size: u32| size.checked_shr(mip).unwrap_or(0).max(1);
    (shrink(width), shrink(height), shrink(depth))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extent_clamps_to_one() {
        assert_eq!(mip_extent(16, 4, 1, 0), (16, 4, 1));
        assert_eq!(mip_extent(16, 4, 1, 3), (2, 1, 1));
        assert_eq!(mip_extent(16, 4, 1, 10), (1, 1, 1));
        assert_eq!(mip_extent(u32::MAX, 4, 1, 40), (1, 1, 1));
    }
}

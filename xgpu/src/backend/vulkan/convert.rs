//! Frontend enums to `ash::vk` values.

use xgpu_vk::ash::vk;
use xgpu_vk::device::{MemoryUsage, QueueKind as VkQueueKind, QueueMode as VkQueueMode};
use xgpu_vk::shader::ShaderStage as VkShaderStage;

use crate::accel::BuildFlags;
use crate::binding::DescriptorType;
use crate::buffer::{BufferUsage, MemoryLocality};
use crate::canvas::PresentMode;
use crate::capability::DeviceKind;
use crate::device::{QueueKind, QueueMode};
use crate::format::{Format, IndexFormat};
use crate::image::{ImageDimension, ImageUsage};
use crate::pass::{LoadOp, StoreOp};
use crate::pipeline::{
    BlendFactor, BlendOp, CompareOp, CullMode, FillMode, FrontFace, PrimitiveTopology, VertexStepMode,
};
use crate::sampler::{AddressMode, Filter};
use crate::shader::{ShaderStage, ShaderStages};
use crate::state::ResourceState;

pub(crate) fn format(format: Format) -> vk::Format {
    match format {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
    }
}

/// Inverse of [`format`] for formats a surface may report.
pub(crate) fn format_from_vk(format: vk::Format) -> Option<Format> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        _ => return None,
    })
}

pub(crate) fn index_type(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

pub(crate) fn device_kind(ty: vk::PhysicalDeviceType) -> DeviceKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => DeviceKind::DiscreteGpu,
        vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceKind::IntegratedGpu,
        vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceKind::VirtualGpu,
        vk::PhysicalDeviceType::CPU => DeviceKind::Cpu,
        _ => DeviceKind::Other,
    }
}

pub(crate) fn queue_kind(kind: QueueKind) -> VkQueueKind {
    match kind {
        QueueKind::Graphics => VkQueueKind::Graphics,
        QueueKind::Compute => VkQueueKind::Compute,
        QueueKind::Transfer => VkQueueKind::Transfer,
    }
}

pub(crate) fn queue_mode(mode: QueueMode) -> VkQueueMode {
    match mode {
        QueueMode::Auto => VkQueueMode::Auto,
        QueueMode::Unified => VkQueueMode::Unified,
        QueueMode::Single => VkQueueMode::Single,
    }
}

pub(crate) fn memory_usage(locality: MemoryLocality) -> MemoryUsage {
    match locality {
        MemoryLocality::Device => MemoryUsage::GpuOnly,
        MemoryLocality::Upload => MemoryUsage::CpuToGpu,
        MemoryLocality::Readback => MemoryUsage::GpuToCpu,
    }
}

pub(crate) fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    use vk::BufferUsageFlags as F;
    let mut flags = F::empty();
    for (ours, theirs) in [
        (BufferUsage::VERTEX, F::VERTEX_BUFFER),
        (BufferUsage::INDEX, F::INDEX_BUFFER),
        (BufferUsage::CONSTANT, F::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, F::STORAGE_BUFFER),
        (BufferUsage::INDIRECT, F::INDIRECT_BUFFER),
        (BufferUsage::TRANSFER_SRC, F::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, F::TRANSFER_DST),
        (
            BufferUsage::ACCELERATION_STRUCTURE_INPUT,
            F::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR | F::STORAGE_BUFFER,
        ),
        (BufferUsage::SHADER_BINDING_TABLE, F::SHADER_BINDING_TABLE_KHR),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    if usage.has_device_address() {
        flags |= F::SHADER_DEVICE_ADDRESS;
    }
    flags
}

pub(crate) fn image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    use vk::ImageUsageFlags as F;
    let mut flags = F::empty();
    for (ours, theirs) in [
        (ImageUsage::SAMPLED, F::SAMPLED),
        (ImageUsage::STORAGE, F::STORAGE),
        (ImageUsage::COLOR_ATTACHMENT, F::COLOR_ATTACHMENT),
        (ImageUsage::DEPTH_ATTACHMENT, F::DEPTH_STENCIL_ATTACHMENT),
        (ImageUsage::TRANSFER_SRC, F::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, F::TRANSFER_DST),
    ] {
        if usage.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

/// Image type and full view type for a dimension and layer count.
pub(crate) fn image_type(dimension: ImageDimension, layers: u32) -> (vk::ImageType, vk::ImageViewType) {
    match (dimension, layers > 1) {
        (ImageDimension::D1, false) => (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D),
        (ImageDimension::D1, true) => (vk::ImageType::TYPE_1D, vk::ImageViewType::TYPE_1D_ARRAY),
        (ImageDimension::D2, false) => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D),
        (ImageDimension::D2, true) => (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY),
        (ImageDimension::D3, _) => (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D),
    }
}

pub(crate) fn descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::ConstantBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::Texture => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::RwTexture => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::Buffer | DescriptorType::RwBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
    }
}

pub(crate) fn shader_stage(stage: ShaderStage) -> VkShaderStage {
    match stage {
        ShaderStage::Vertex => VkShaderStage::Vertex,
        ShaderStage::Fragment => VkShaderStage::Fragment,
        ShaderStage::Compute => VkShaderStage::Compute,
        ShaderStage::RayGeneration => VkShaderStage::RayGeneration,
        ShaderStage::Miss => VkShaderStage::Miss,
        ShaderStage::ClosestHit => VkShaderStage::ClosestHit,
        ShaderStage::AnyHit => VkShaderStage::AnyHit,
        ShaderStage::Intersection => VkShaderStage::Intersection,
        ShaderStage::Callable => VkShaderStage::Callable,
    }
}

pub(crate) fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    use vk::ShaderStageFlags as F;
    let mut flags = F::empty();
    for (ours, theirs) in [
        (ShaderStages::VERTEX, F::VERTEX),
        (ShaderStages::FRAGMENT, F::FRAGMENT),
        (ShaderStages::COMPUTE, F::COMPUTE),
        (ShaderStages::RAY_GENERATION, F::RAYGEN_KHR),
        (ShaderStages::MISS, F::MISS_KHR),
        (ShaderStages::CLOSEST_HIT, F::CLOSEST_HIT_KHR),
        (ShaderStages::ANY_HIT, F::ANY_HIT_KHR),
        (ShaderStages::INTERSECTION, F::INTERSECTION_KHR),
        (ShaderStages::CALLABLE, F::CALLABLE_KHR),
    ] {
        if stages.contains(ours) {
            flags |= theirs;
        }
    }
    flags
}

pub(crate) fn present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
    }
}

pub(crate) fn filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn mipmap_mode(filter: Filter) -> vk::SamplerMipmapMode {
    match filter {
        Filter::Nearest => vk::SamplerMipmapMode::NEAREST,
        Filter::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub(crate) fn topology(topology: PrimitiveTopology) -> vk::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
        PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(crate) fn cull_mode(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(crate) fn front_face(face: FrontFace) -> vk::FrontFace {
    match face {
        FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
    }
}

pub(crate) fn polygon_mode(fill: FillMode) -> vk::PolygonMode {
    match fill {
        FillMode::Solid => vk::PolygonMode::FILL,
        FillMode::Wireframe => vk::PolygonMode::LINE,
    }
}

pub(crate) fn step_mode(step: VertexStepMode) -> vk::VertexInputRate {
    match step {
        VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
        VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
    }
}

pub(crate) fn blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

pub(crate) fn blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}

pub(crate) fn load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(crate) fn store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub(crate) fn build_flags(flags: BuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    use vk::BuildAccelerationStructureFlagsKHR as F;
    let mut out = F::empty();
    if flags.contains(BuildFlags::ALLOW_UPDATE) {
        out |= F::ALLOW_UPDATE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_TRACE) {
        out |= F::PREFER_FAST_TRACE;
    }
    if flags.contains(BuildFlags::PREFER_FAST_BUILD) {
        out |= F::PREFER_FAST_BUILD;
    }
    out
}

/// Synchronization scope and image layout of a resource state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateScope {
    pub(crate) stage: vk::PipelineStageFlags2,
    pub(crate) access: vk::AccessFlags2,
    pub(crate) layout: vk::ImageLayout,
}

/// Map a tracked state onto sync2 scopes. Ray tracing stages are only named
/// when the device has ray tracing enabled.
pub(crate) fn state_scope(state: ResourceState, ray_tracing: bool) -> StateScope {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let mut shaders = S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER;
    let mut structure_readers = S::COMPUTE_SHADER;
    if ray_tracing {
        shaders |= S::RAY_TRACING_SHADER_KHR;
        structure_readers |= S::RAY_TRACING_SHADER_KHR | S::ACCELERATION_STRUCTURE_BUILD_KHR;
    }
    let scope = |stage, access, layout| StateScope { stage, access, layout };

    match state {
        ResourceState::Undefined => scope(S::NONE, A::NONE, L::UNDEFINED),
        ResourceState::Common => scope(S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE, L::GENERAL),
        ResourceState::TransferSrc => scope(S::ALL_TRANSFER, A::TRANSFER_READ, L::TRANSFER_SRC_OPTIMAL),
        ResourceState::TransferDst => scope(S::ALL_TRANSFER, A::TRANSFER_WRITE, L::TRANSFER_DST_OPTIMAL),
        ResourceState::ColorWrite => scope(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            L::COLOR_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthWrite => scope(
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ),
        ResourceState::DepthRead => scope(
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS | S::FRAGMENT_SHADER,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ,
            L::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ),
        ResourceState::ShaderRead => scope(shaders, A::SHADER_READ, L::SHADER_READ_ONLY_OPTIMAL),
        ResourceState::ShaderReadWrite => scope(shaders, A::SHADER_READ | A::SHADER_WRITE, L::GENERAL),
        ResourceState::VertexBuffer => scope(S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ, L::UNDEFINED),
        ResourceState::IndexBuffer => scope(S::INDEX_INPUT, A::INDEX_READ, L::UNDEFINED),
        ResourceState::ConstantBuffer => scope(shaders, A::UNIFORM_READ, L::UNDEFINED),
        ResourceState::IndirectArgument => scope(S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ, L::UNDEFINED),
        ResourceState::AccelerationStructureBuildInput => {
            scope(S::ACCELERATION_STRUCTURE_BUILD_KHR, A::SHADER_READ, L::UNDEFINED)
        }
        ResourceState::AccelerationStructureRead => {
            scope(structure_readers, A::ACCELERATION_STRUCTURE_READ_KHR, L::UNDEFINED)
        }
        ResourceState::AccelerationStructureWrite => scope(
            S::ACCELERATION_STRUCTURE_BUILD_KHR,
            A::ACCELERATION_STRUCTURE_WRITE_KHR | A::ACCELERATION_STRUCTURE_READ_KHR,
            L::UNDEFINED,
        ),
        ResourceState::Present => scope(S::NONE, A::NONE, L::PRESENT_SRC_KHR),
    }
}

/// Layout an image is in while in `state`.
pub(crate) fn image_layout(state: ResourceState) -> vk::ImageLayout {
    state_scope(state, false).layout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_formats_round_trip() {
        for f in [Format::Rgba8Unorm, Format::Rgba8Srgb, Format::Bgra8Unorm, Format::Bgra8Srgb, Format::Rgba16Float] {
            assert_eq!(format_from_vk(format(f)), Some(f));
        }
        assert_eq!(format_from_vk(vk::Format::A2B10G10R10_UNORM_PACK32), None);
    }

    #[test]
    fn device_address_usage_is_implied() {
        let flags = buffer_usage(BufferUsage::SHADER_BINDING_TABLE);
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        assert!(!buffer_usage(BufferUsage::VERTEX).contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }

    #[test]
    fn attachment_states_use_attachment_layouts() {
        assert_eq!(image_layout(ResourceState::ColorWrite), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(image_layout(ResourceState::DepthWrite), vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
        assert_eq!(image_layout(ResourceState::Present), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(image_layout(ResourceState::Common), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn ray_tracing_stages_only_when_enabled() {
        let rt = vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR;
        assert!(!state_scope(ResourceState::ShaderRead, false).stage.contains(rt));
        assert!(state_scope(ResourceState::ShaderRead, true).stage.contains(rt));
        assert!(state_scope(ResourceState::AccelerationStructureRead, true).stage.contains(rt));
    }

    #[test]
    fn array_images_get_array_views() {
        assert_eq!(image_type(ImageDimension::D2, 6).1, vk::ImageViewType::TYPE_2D_ARRAY);
        assert_eq!(image_type(ImageDimension::D3, 1).0, vk::ImageType::TYPE_3D);
    }
}

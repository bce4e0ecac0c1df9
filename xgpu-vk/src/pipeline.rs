//! Pipeline layouts and pipelines (graphics, compute, ray tracing).

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::descriptor::DescriptorSetLayout;
use crate::device::{Device, RayTracingError};
use crate::shader::EntryPoint;

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// An owned `VkPipelineLayout`.
///
/// Pipelines hold their layout behind an `Arc<PipelineLayout>` so several
/// pipelines can share one.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    pub fn new(
        device: &Arc<Device>,
        set_layouts: &[&DescriptorSetLayout],
        name: Option<&str>,
    ) -> Result<Self, vk::Result> {
        let raw_layouts: Vec<vk::DescriptorSetLayout> =
            set_layouts.iter().map(|l| l.raw_descriptor_set_layout()).collect();
        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: every set layout comes from the same device.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }?;

        // SAFETY: handle is a valid layout from this device.
        unsafe { device.name_or_warn(handle, "pipeline layout", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines using this layout
        // hold an Arc to it, so they are already gone.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("No shader stages provided")]
    NoStages,

    #[error("Vulkan error creating pipeline: {0}")]
    PipelineCreation(vk::Result),

    #[error(transparent)]
    RayTracing(#[from] RayTracingError),
}

// ---------------------------------------------------------------------------
// GraphicsPipelineDesc
// ---------------------------------------------------------------------------

/// Description of a graphics pipeline for dynamic rendering.
///
/// Viewport and scissor are always dynamic.
pub struct GraphicsPipelineDesc<'a> {
    pub stages: &'a [EntryPoint<'a>],
    pub layout: Arc<PipelineLayout>,
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub color_attachment_formats: &'a [vk::Format],
    /// One entry per color attachment.
    pub color_blend: &'a [vk::PipelineColorBlendAttachmentState],
    pub depth_attachment_format: Option<vk::Format>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// An owned `VkPipeline` of any kind, with the layout it was created with.
pub struct Pipeline {
    parent: Arc<Device>,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    bind_point: vk::PipelineBindPoint,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("bind_point", &self.bind_point)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn graphics(
        device: &Arc<Device>,
        desc: &GraphicsPipelineDesc<'_>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if desc.stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }

        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> =
            desc.stages.iter().map(|ep| ep.as_pipeline_stage_create_info()).collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(desc.vertex_bindings)
            .vertex_attribute_descriptions(desc.vertex_attributes);

        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);

        // Counts must be declared even though the values are dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare_op);

        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default().attachments(desc.color_blend);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_create_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(desc.color_attachment_formats)
            .depth_attachment_format(desc.depth_attachment_format.unwrap_or(vk::Format::UNDEFINED));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_create_infos)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(desc.layout.raw_handle())
            .push_next(&mut rendering_create_info);

        // SAFETY: create_info references stages, layout and pNext structs that
        // come from device and live for the call.
        let handle = unsafe { device.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::PipelineCreation)?;

        Ok(Self::wrap(device, handle, &desc.layout, vk::PipelineBindPoint::GRAPHICS, name))
    }

    pub fn compute(
        device: &Arc<Device>,
        stage: &EntryPoint<'_>,
        layout: &Arc<PipelineLayout>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage.as_pipeline_stage_create_info())
            .layout(layout.raw_handle());
        // SAFETY: the stage module and layout come from device.
        let handle = unsafe { device.create_raw_compute_pipeline(&create_info) }
            .map_err(CreatePipelineError::PipelineCreation)?;
        Ok(Self::wrap(device, handle, layout, vk::PipelineBindPoint::COMPUTE, name))
    }

    /// Create a ray tracing pipeline. Group shader indices refer to
    /// positions in `stages`.
    pub fn ray_tracing(
        device: &Arc<Device>,
        stages: &[EntryPoint<'_>],
        groups: &[vk::RayTracingShaderGroupCreateInfoKHR<'_>],
        max_recursion_depth: u32,
        layout: &Arc<PipelineLayout>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if stages.is_empty() {
            return Err(CreatePipelineError::NoStages);
        }
        let stage_create_infos: Vec<vk::PipelineShaderStageCreateInfo<'_>> =
            stages.iter().map(|ep| ep.as_pipeline_stage_create_info()).collect();
        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stage_create_infos)
            .groups(groups)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(layout.raw_handle());
        // SAFETY: stages, groups and layout come from device.
        let handle = unsafe { device.create_raw_ray_tracing_pipeline(&create_info) }?;
        Ok(Self::wrap(device, handle, layout, vk::PipelineBindPoint::RAY_TRACING_KHR, name))
    }

    fn wrap(
        device: &Arc<Device>,
        handle: vk::Pipeline,
        layout: &Arc<PipelineLayout>,
        bind_point: vk::PipelineBindPoint,
        name: Option<&str>,
    ) -> Self {
        // SAFETY: handle is a valid pipeline created from device.
        unsafe { device.name_or_warn(handle, "pipeline", name) };
        Self {
            parent: Arc::clone(device),
            handle,
            layout: Arc::clone(layout),
            bind_point,
        }
    }

    /// Opaque shader group handles, `shader_group_handle_size` bytes each.
    pub fn shader_group_handles(&self, group_count: u32) -> Result<Vec<u8>, RayTracingError> {
        // SAFETY: handle is a live pipeline from parent; callers pass the
        // group count the pipeline was created with.
        unsafe { self.parent.get_raw_shader_group_handles(self.handle, group_count) }
    }

    pub fn raw_handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent. Command lists retain their
        // pipelines until execution completes.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

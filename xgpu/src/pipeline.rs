//! Graphics and compute pipelines.

use std::sync::Arc;

use crate::backend::{Backend, ComputePipelineInfo, DeviceApi, GraphicsPipelineInfo};
use crate::descriptor::{DescriptorTableLayout, DescriptorTableLayoutShared};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::pass::RenderPass;
use crate::shader::{ShaderEntry, ShaderStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u32,
    pub step: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RasterizerState {
    pub cull: CullMode,
    pub front_face: FrontFace,
    pub fill: FillMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthStencilState {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstColor,
    OneMinusDstColor,
    DstAlpha,
    OneMinusDstAlpha,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Per-attachment blending. `None` writes the source unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlendState {
    pub blend: Option<BlendComponents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponents {
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl BlendComponents {
    pub const ALPHA: Self = Self {
        src_color: BlendFactor::SrcAlpha,
        dst_color: BlendFactor::OneMinusSrcAlpha,
        color_op: BlendOp::Add,
        src_alpha: BlendFactor::One,
        dst_alpha: BlendFactor::OneMinusSrcAlpha,
        alpha_op: BlendOp::Add,
    };
}

// ---------------------------------------------------------------------------
// Shared pipeline state
// ---------------------------------------------------------------------------

pub(crate) struct PipelineShared<B: Backend> {
    pub(crate) native: B::Pipeline,
    pub(crate) kind: PipelineKind,
    pub(crate) layouts: Vec<Arc<DescriptorTableLayoutShared<B>>>,
    pub(crate) device: Arc<DeviceShared<B>>,
    /// Attachment formats of the pass a graphics pipeline renders into.
    pub(crate) color_formats: Vec<Format>,
    pub(crate) depth_format: Option<Format>,
    pub(crate) group_handles: Vec<u8>,
    pub(crate) group_kinds: Vec<crate::raytracing::ShaderGroupKind>,
}

pub(crate) fn resolve_layouts<B: Backend>(
    device: &Arc<DeviceShared<B>>,
    layouts: &[DescriptorTableLayout<B>],
) -> Result<Vec<Arc<DescriptorTableLayoutShared<B>>>> {
    layouts
        .iter()
        .map(|l| {
            let shared = l.shared()?;
            if !Arc::ptr_eq(&shared.device, device) {
                return Err(Error::invalid("Descriptor table layout belongs to another device"));
            }
            Ok(Arc::clone(shared))
        })
        .collect()
}

macro_rules! pipeline_handle {
    ($name:ident, $label:literal) => {
        pub struct $name<B: $crate::backend::Backend> {
            shared: Option<std::sync::Arc<$crate::pipeline::PipelineShared<B>>>,
        }

        impl<B: $crate::backend::Backend> Default for $name<B> {
            fn default() -> Self {
                Self { shared: None }
            }
        }

        impl<B: $crate::backend::Backend> Clone for $name<B> {
            fn clone(&self) -> Self {
                Self {
                    shared: self.shared.clone(),
                }
            }
        }

        impl<B: $crate::backend::Backend> std::fmt::Debug for $name<B> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct($label)
                    .field("initialized", &self.shared.is_some())
                    .finish_non_exhaustive()
            }
        }

        impl<B: $crate::backend::Backend> $name<B> {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn deinitialize(&mut self) {
                self.shared = None;
            }

            pub fn is_initialized(&self) -> bool {
                self.shared.is_some()
            }

            pub(crate) fn shared(&self) -> $crate::error::Result<&std::sync::Arc<$crate::pipeline::PipelineShared<B>>> {
                self.shared.as_ref().ok_or($crate::error::Error::NotInitialized($label))
            }
        }
    };
}
pub(crate) use pipeline_handle;

// ---------------------------------------------------------------------------
// GraphicsPipeline
// ---------------------------------------------------------------------------

pub struct GraphicsPipelineDesc<B: Backend> {
    pub vertex: ShaderEntry<B>,
    pub fragment: Option<ShaderEntry<B>>,
    pub layouts: Vec<DescriptorTableLayout<B>>,
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub topology: PrimitiveTopology,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    /// One entry per color attachment; empty means no blending anywhere.
    pub blend: Vec<BlendState>,
    pub pass: RenderPass<B>,
    pub name: Option<String>,
}

pipeline_handle!(GraphicsPipeline, "GraphicsPipeline");

impl<B: Backend> GraphicsPipeline<B> {
    pub fn initialize(&mut self, device: &Device<B>, desc: &GraphicsPipelineDesc<B>) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        let pass = desc.pass.shared()?;

        if desc.vertex.stage() != ShaderStage::Vertex {
            return Err(Error::invalid(format!("{:?} entry used as vertex stage", desc.vertex.stage())));
        }
        desc.vertex.check_device(device)?;
        if let Some(fragment) = &desc.fragment {
            if fragment.stage() != ShaderStage::Fragment {
                return Err(Error::invalid(format!("{:?} entry used as fragment stage", fragment.stage())));
            }
            fragment.check_device(device)?;
        }
        let color_count = pass.desc.colors.len();
        if !desc.blend.is_empty() && desc.blend.len() != color_count {
            return Err(Error::invalid(format!(
                "{} blend states for {color_count} color attachments",
                desc.blend.len()
            )));
        }
        if desc.depth_stencil.depth_test && pass.desc.depth.is_none() {
            return Err(Error::invalid("Depth test enabled without a depth attachment"));
        }
        for layout in &desc.vertex_buffers {
            let overruns = |a: &&VertexAttribute| a.offset + a.format.bytes_per_texel() > layout.stride;
            if let Some(attr) = layout.attributes.iter().find(overruns) {
                return Err(Error::invalid(format!(
                    "Vertex attribute at location {} overruns stride {}",
                    attr.location, layout.stride
                )));
            }
        }

        let layouts = resolve_layouts(device, &desc.layouts)?;
        let color_formats: Vec<Format> = pass.desc.colors.iter().map(|c| c.format).collect();
        let depth_format = pass.desc.depth.map(|d| d.format);

        let mut stages = vec![desc.vertex.stage_info()];
        if let Some(fragment) = &desc.fragment {
            stages.push(fragment.stage_info());
        }
        let blend = if desc.blend.is_empty() {
            vec![BlendState::default(); color_count]
        } else {
            desc.blend.clone()
        };
        let info = GraphicsPipelineInfo {
            stages,
            layouts: layouts.iter().map(|l| &l.native).collect(),
            vertex_buffers: &desc.vertex_buffers,
            topology: desc.topology,
            rasterizer: desc.rasterizer,
            depth_stencil: desc.depth_stencil,
            blend,
            color_formats: color_formats.clone(),
            depth_format,
            name: desc.name.as_deref(),
        };
        let native = device.native.create_graphics_pipeline(&info)?;
        drop(info);

        self.shared = Some(Arc::new(PipelineShared {
            native,
            kind: PipelineKind::Graphics,
            layouts,
            device: Arc::clone(device),
            color_formats,
            depth_format,
            group_handles: Vec::new(),
            group_kinds: Vec::new(),
        }));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ComputePipeline
// ---------------------------------------------------------------------------

pub struct ComputePipelineDesc<B: Backend> {
    pub shader: ShaderEntry<B>,
    pub layouts: Vec<DescriptorTableLayout<B>>,
    pub name: Option<String>,
}

pipeline_handle!(ComputePipeline, "ComputePipeline");

impl<B: Backend> ComputePipeline<B> {
    pub fn initialize(&mut self, device: &Device<B>, desc: &ComputePipelineDesc<B>) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        if desc.shader.stage() != ShaderStage::Compute {
            return Err(Error::invalid(format!("{:?} entry used as compute stage", desc.shader.stage())));
        }
        desc.shader.check_device(device)?;
        let layouts = resolve_layouts(device, &desc.layouts)?;
        let info = ComputePipelineInfo {
            stage: desc.shader.stage_info(),
            layouts: layouts.iter().map(|l| &l.native).collect(),
            name: desc.name.as_deref(),
        };
        let native = device.native.create_compute_pipeline(&info)?;
        drop(info);
        self.shared = Some(Arc::new(PipelineShared {
            native,
            kind: PipelineKind::Compute,
            layouts,
            device: Arc::clone(device),
            color_formats: Vec::new(),
            depth_format: None,
            group_handles: Vec::new(),
            group_kinds: Vec::new(),
        }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorRange, DescriptorTableLayoutDesc};
    use crate::binding::DescriptorType;
    use crate::pass::{AttachmentDesc, RenderPassDesc};
    use crate::shader::{ShaderDesc, ShaderStages};
    use crate::test_support::{fake_spirv, soft_device};

    #[test]
    fn compute_pipeline_requires_compute_stage() {
        let (_system, device) = soft_device();
        let code = fake_spirv();
        let vs = device
            .create_shader(&ShaderDesc { code: &code, entry: "main".into(), stage: ShaderStage::Vertex, name: None })
            .unwrap();
        let desc = ComputePipelineDesc { shader: vs.entry().unwrap(), layouts: Vec::new(), name: None };
        assert_eq!(device.create_compute_pipeline(&desc).unwrap_err().code(), crate::ResultCode::InvalidArgs);

        let cs = device
            .create_shader(&ShaderDesc { code: &code, entry: "main".into(), stage: ShaderStage::Compute, name: None })
            .unwrap();
        let layout = device
            .create_descriptor_table_layout(&DescriptorTableLayoutDesc {
                ranges: vec![DescriptorRange::new(DescriptorType::RwBuffer, 0, 1, ShaderStages::COMPUTE)],
                name: None,
            })
            .unwrap();
        let desc = ComputePipelineDesc { shader: cs.entry().unwrap(), layouts: vec![layout], name: None };
        assert!(device.create_compute_pipeline(&desc).unwrap().is_initialized());
    }

    #[test]
    fn graphics_pipeline_checks_blend_count_and_depth() {
        let (_system, device) = soft_device();
        let code = fake_spirv();
        let vs = device
            .create_shader(&ShaderDesc { code: &code, entry: "vs".into(), stage: ShaderStage::Vertex, name: None })
            .unwrap();
        let mut pass = RenderPass::new();
        pass.initialize(&device, &RenderPassDesc {
            colors: vec![AttachmentDesc::new(Format::Rgba8Unorm)],
            ..RenderPassDesc::default()
        })
        .unwrap();
        let mut desc = GraphicsPipelineDesc {
            vertex: vs.entry().unwrap(),
            fragment: None,
            layouts: Vec::new(),
            vertex_buffers: vec![VertexBufferLayout {
                stride: 12,
                step: VertexStepMode::Vertex,
                attributes: vec![VertexAttribute { location: 0, format: Format::Rgb32Float, offset: 0 }],
            }],
            topology: PrimitiveTopology::TriangleList,
            rasterizer: RasterizerState::default(),
            depth_stencil: DepthStencilState::default(),
            blend: vec![BlendState::default(); 2],
            pass: pass.clone(),
            name: None,
        };
        assert!(device.create_graphics_pipeline(&desc).is_err());
        desc.blend.clear();
        desc.depth_stencil.depth_test = true;
        assert!(device.create_graphics_pipeline(&desc).is_err());
        desc.depth_stencil.depth_test = false;
        assert!(device.create_graphics_pipeline(&desc).is_ok());
    }
}

//! Render passes (attachment formats and load/store behavior) and render
//! targets (the images a pass draws into).
//!
//! Rendering is dynamic on every back end, so a [`RenderPass`] has no native
//! object; it is the compatibility contract between pipelines and targets.

use std::sync::Arc;

use crate::backend::{AttachmentInfo, Backend, DeviceApi, RenderTargetInfo};
use crate::backend::mip_extent;
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::image::{Image, ImageShared, ImageUsage};
use crate::state::Subresource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub load: LoadOp,
    pub store: StoreOp,
}

impl AttachmentDesc {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            load: LoadOp::Clear,
            store: StoreOp::Store,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPassDesc {
    pub colors: Vec<AttachmentDesc>,
    pub depth: Option<AttachmentDesc>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

// ---------------------------------------------------------------------------
// RenderPass
// ---------------------------------------------------------------------------

pub(crate) struct RenderPassShared<B: Backend> {
    pub(crate) desc: RenderPassDesc,
    pub(crate) device: Arc<DeviceShared<B>>,
}

pub struct RenderPass<B: Backend> {
    shared: Option<Arc<RenderPassShared<B>>>,
}

impl<B: Backend> Default for RenderPass<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for RenderPass<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for RenderPass<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderPass")
            .field("desc", &self.shared.as_ref().map(|s| &s.desc))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> RenderPass<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &RenderPassDesc) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        if desc.colors.is_empty() && desc.depth.is_none() {
            return Err(Error::invalid("Render pass has no attachments"));
        }
        if let Some(color) = desc.colors.iter().find(|c| c.format.is_depth() || c.format == Format::Undefined) {
            return Err(Error::invalid(format!("{:?} is not a color attachment format", color.format)));
        }
        if let Some(depth) = &desc.depth
            && !depth.format.is_depth()
        {
            return Err(Error::invalid(format!("{:?} is not a depth format", depth.format)));
        }
        self.shared = Some(Arc::new(RenderPassShared {
            desc: desc.clone(),
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

    pub(crate) fn shared(&self) -> Result<&Arc<RenderPassShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("RenderPass"))
    }

    pub fn desc(&self) -> Result<&RenderPassDesc> {
        Ok(&self.shared()?.desc)
    }
}

// ---------------------------------------------------------------------------
// RenderTarget
// ---------------------------------------------------------------------------

pub struct RenderTargetAttachment<B: Backend> {
    pub image: Image<B>,
    pub subresource: Subresource,
}

impl<B: Backend> Clone for RenderTargetAttachment<B> {
    fn clone(&self) -> Self {
        Self {
            image: self.image.clone(),
            subresource: self.subresource,
        }
    }
}

impl<B: Backend> RenderTargetAttachment<B> {
    pub fn new(image: &Image<B>) -> Self {
        Self {
            image: image.clone(),
            subresource: Subresource::default(),
        }
    }
}

pub struct RenderTargetDesc<B: Backend> {
    pub colors: Vec<RenderTargetAttachment<B>>,
    pub depth: Option<RenderTargetAttachment<B>>,
    pub name: Option<String>,
}

impl<B: Backend> Default for RenderTargetDesc<B> {
    fn default() -> Self {
        Self {
            colors: Vec::new(),
            depth: None,
            name: None,
        }
    }
}

pub(crate) struct ResolvedAttachment<B: Backend> {
    pub(crate) image: Arc<ImageShared<B>>,
    pub(crate) subresource: Subresource,
}

pub(crate) struct RenderTargetShared<B: Backend> {
    // Declared first so native views drop before the images they view.
    pub(crate) native: B::RenderTarget,
    pub(crate) colors: Vec<ResolvedAttachment<B>>,
    pub(crate) depth: Option<ResolvedAttachment<B>>,
    pub(crate) width: u32,
    pub(crate) height: u32,
}

pub struct RenderTarget<B: Backend> {
    shared: Option<Arc<RenderTargetShared<B>>>,
}

impl<B: Backend> Default for RenderTarget<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for RenderTarget<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for RenderTarget<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("extent", &self.shared.as_ref().map(|s| (s.width, s.height)))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> RenderTarget<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &RenderTargetDesc<B>) -> Result<()> {
        self.deinitialize();
        let device = device.shared()?;
        if desc.colors.is_empty() && desc.depth.is_none() {
            return Err(Error::invalid("Render target has no attachments"));
        }

        let resolve = |attachment: &RenderTargetAttachment<B>, depth: bool| -> Result<_> {
            let image = attachment.image.shared()?;
            if !Arc::ptr_eq(&image.device, device) {
                return Err(Error::invalid("Attachment image belongs to another device"));
            }
            let sub = attachment.subresource;
            if sub.mip >= image.desc.mip_levels || sub.layer >= image.desc.array_layers {
                return Err(Error::invalid(format!("Attachment subresource {sub:?} out of range")));
            }
            let needed = if depth { ImageUsage::DEPTH_ATTACHMENT } else { ImageUsage::COLOR_ATTACHMENT };
            if !image.desc.usage.contains(needed) {
                return Err(Error::invalid(format!("Attachment image lacks {needed:?} usage")));
            }
            let (w, h, _) = mip_extent(image.desc.width, image.desc.height, image.desc.depth, sub.mip);
            Ok((
                ResolvedAttachment {
                    image: Arc::clone(image),
                    subresource: sub,
                },
                (w, h),
            ))
        };

        let mut extent = None;
        let mut check_extent = |e: (u32, u32)| -> Result<()> {
            match extent {
                None => {
                    extent = Some(e);
                    Ok(())
                }
                Some(first) if first == e => Ok(()),
                Some(first) => Err(Error::invalid(format!(
                    "Attachment extent {e:?} differs from {first:?}"
                ))),
            }
        };

        let mut colors = Vec::with_capacity(desc.colors.len());
        for attachment in &desc.colors {
            let (resolved, e) = resolve(attachment, false)?;
            check_extent(e)?;
            colors.push(resolved);
        }
        let depth = match &desc.depth {
            Some(attachment) => {
                let (resolved, e) = resolve(attachment, true)?;
                check_extent(e)?;
                Some(resolved)
            }
            None => None,
        };
        let (width, height) = extent.unwrap_or((1, 1));

        let info = RenderTargetInfo {
            colors: colors
                .iter()
                .map(|a| AttachmentInfo {
                    image: &a.image.native,
                    format: a.image.desc.format,
                    subresource: a.subresource,
                })
                .collect(),
            depth: depth.as_ref().map(|a| AttachmentInfo {
                image: &a.image.native,
                format: a.image.desc.format,
                subresource: a.subresource,
            }),
            width,
            height,
            name: desc.name.as_deref(),
        };
        let native = device.native.create_render_target(&info)?;
        drop(info);

        self.shared = Some(Arc::new(RenderTargetShared {
            native,
            colors,
            depth,
            width,
            height,
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<RenderTargetShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("RenderTarget"))
    }

    pub fn extent(&self) -> Result<(u32, u32)> {
        let shared = self.shared()?;
        Ok((shared.width, shared.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageDesc;
    use crate::test_support::soft_device;

    #[test]
    fn render_pass_rejects_depth_color_attachment() {
        let (_system, device) = soft_device();
        let mut pass = RenderPass::new();
        let desc = RenderPassDesc {
            colors: vec![AttachmentDesc::new(Format::D32Float)],
            ..RenderPassDesc::default()
        };
        assert!(pass.initialize(&device, &desc).is_err());
        assert!(pass.initialize(&device, &RenderPassDesc::default()).is_err());
        let desc = RenderPassDesc {
            colors: vec![AttachmentDesc::new(Format::Rgba8Unorm)],
            depth: Some(AttachmentDesc::new(Format::D32Float)),
            name: None,
        };
        pass.initialize(&device, &desc).unwrap();
    }

    #[test]
    fn render_target_attachments_must_share_extent() {
        let (_system, device) = soft_device();
        let color = device
            .create_image(&ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::COLOR_ATTACHMENT))
            .unwrap();
        let depth = device
            .create_image(&ImageDesc::texture_2d(4, 4, Format::D32Float, ImageUsage::DEPTH_ATTACHMENT))
            .unwrap();
        let mut target = RenderTarget::new();
        let desc = RenderTargetDesc {
            colors: vec![RenderTargetAttachment::new(&color)],
            depth: Some(RenderTargetAttachment::new(&depth)),
            name: None,
        };
        assert_eq!(target.initialize(&device, &desc).unwrap_err().code(), crate::ResultCode::InvalidArgs);

        let desc = RenderTargetDesc {
            colors: vec![RenderTargetAttachment::new(&color)],
            ..RenderTargetDesc::default()
        };
        target.initialize(&device, &desc).unwrap();
        assert_eq!(target.extent().unwrap(), (8, 8));
    }

    #[test]
    fn render_target_checks_attachment_usage() {
        let (_system, device) = soft_device();
        let sampled = device
            .create_image(&ImageDesc::texture_2d(8, 8, Format::Rgba8Unorm, ImageUsage::SAMPLED))
            .unwrap();
        let desc = RenderTargetDesc {
            colors: vec![RenderTargetAttachment::new(&sampled)],
            ..RenderTargetDesc::default()
        };
        assert!(RenderTarget::new().initialize(&device, &desc).is_err());
    }
}

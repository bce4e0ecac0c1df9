//! Shader modules and libraries of opaque SPIR-V bytecode.

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::{Backend, DeviceApi, ShaderStageInfo};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

impl ShaderStage {
    pub fn is_ray_tracing(self) -> bool {
        matches!(
            self,
            ShaderStage::RayGeneration
                | ShaderStage::Miss
                | ShaderStage::ClosestHit
                | ShaderStage::AnyHit
                | ShaderStage::Intersection
                | ShaderStage::Callable
        )
    }
}

bitflags! {
    /// Stage visibility of a descriptor range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
        const RAY_GENERATION = 1 << 3;
        const MISS = 1 << 4;
        const CLOSEST_HIT = 1 << 5;
        const ANY_HIT = 1 << 6;
        const INTERSECTION = 1 << 7;
        const CALLABLE = 1 << 8;
        const ALL_GRAPHICS = Self::VERTEX.bits() | Self::FRAGMENT.bits();
        const ALL_RAY_TRACING = Self::RAY_GENERATION.bits()
            | Self::MISS.bits()
            | Self::CLOSEST_HIT.bits()
            | Self::ANY_HIT.bits()
            | Self::INTERSECTION.bits()
            | Self::CALLABLE.bits();
        const ALL = Self::ALL_GRAPHICS.bits() | Self::COMPUTE.bits() | Self::ALL_RAY_TRACING.bits();
    }
}

impl From<ShaderStage> for ShaderStages {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
            ShaderStage::RayGeneration => ShaderStages::RAY_GENERATION,
            ShaderStage::Miss => ShaderStages::MISS,
            ShaderStage::ClosestHit => ShaderStages::CLOSEST_HIT,
            ShaderStage::AnyHit => ShaderStages::ANY_HIT,
            ShaderStage::Intersection => ShaderStages::INTERSECTION,
            ShaderStage::Callable => ShaderStages::CALLABLE,
        }
    }
}

/// Check that `code` looks like a SPIR-V module.
pub fn validate_spirv(code: &[u8]) -> Result<()> {
    if code.is_empty() {
        return Err(Error::invalid("Shader bytecode is empty"));
    }
    if !code.len().is_multiple_of(4) {
        return Err(Error::invalid(format!(
            "Shader bytecode length {} is not a multiple of 4",
            code.len()
        )));
    }
    let magic = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
    if magic != SPIRV_MAGIC {
        return Err(Error::invalid(format!("Shader bytecode starts with {magic:#010x}, not SPIR-V magic")));
    }
    Ok(())
}

/// A single-entry shader module.
#[derive(Debug, Clone)]
pub struct ShaderDesc<'a> {
    pub code: &'a [u8],
    pub entry: String,
    pub stage: ShaderStage,
    pub name: Option<String>,
}

/// A module exporting several named entry points.
#[derive(Debug, Clone)]
pub struct ShaderLibraryDesc<'a> {
    pub code: &'a [u8],
    pub entries: Vec<(String, ShaderStage)>,
    pub name: Option<String>,
}

pub(crate) struct ShaderShared<B: Backend> {
    pub(crate) native: B::Shader,
    pub(crate) entries: Vec<(String, ShaderStage)>,
    pub(crate) device: Arc<DeviceShared<B>>,
}

fn create_shared<B: Backend>(
    device: &Device<B>,
    code: &[u8],
    entries: Vec<(String, ShaderStage)>,
    name: Option<&str>,
) -> Result<Arc<ShaderShared<B>>> {
    let device = device.shared()?;
    validate_spirv(code)?;
    if entries.is_empty() {
        return Err(Error::invalid("Shader declares no entry points"));
    }
    if let Some((entry, stage)) = entries.iter().find(|(_, s)| s.is_ray_tracing()) {
        tracing::trace!("Shader entry {} is a {:?} stage", entry, stage);
        device.require_ray_tracing("ray tracing shader stages")?;
    }
    let native = device.native.create_shader(code, name)?;
    Ok(Arc::new(ShaderShared {
        native,
        entries,
        device: Arc::clone(device),
    }))
}

/// One entry point of a shader or library, usable as a pipeline stage.
pub struct ShaderEntry<B: Backend> {
    pub(crate) shader: Arc<ShaderShared<B>>,
    pub(crate) entry: String,
    pub(crate) stage: ShaderStage,
}

impl<B: Backend> Clone for ShaderEntry<B> {
    fn clone(&self) -> Self {
        Self {
            shader: Arc::clone(&self.shader),
            entry: self.entry.clone(),
            stage: self.stage,
        }
    }
}

impl<B: Backend> std::fmt::Debug for ShaderEntry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderEntry")
            .field("entry", &self.entry)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> ShaderEntry<B> {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub(crate) fn stage_info(&self) -> ShaderStageInfo<'_, B> {
        ShaderStageInfo {
            shader: &self.shader.native,
            entry: &self.entry,
            stage: self.stage,
        }
    }

    pub(crate) fn check_device(&self, device: &Arc<DeviceShared<B>>) -> Result<()> {
        if Arc::ptr_eq(&self.shader.device, device) {
            Ok(())
        } else {
            Err(Error::invalid(format!("Shader entry {} belongs to another device", self.entry)))
        }
    }
}

// ---------------------------------------------------------------------------
// Shader
// ---------------------------------------------------------------------------

pub struct Shader<B: Backend> {
    shared: Option<Arc<ShaderShared<B>>>,
}

impl<B: Backend> Default for Shader<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> std::fmt::Debug for Shader<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shader")
            .field("entries", &self.shared.as_ref().map(|s| &s.entries))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Shader<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &ShaderDesc<'_>) -> Result<()> {
        self.deinitialize();
        self.shared = Some(create_shared(
            device,
            desc.code,
            vec![(desc.entry.clone(), desc.stage)],
            desc.name.as_deref(),
        )?);
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    /// The module's single entry point.
    pub fn entry(&self) -> Result<ShaderEntry<B>> {
        let shared = self.shared.as_ref().ok_or(Error::NotInitialized("Shader"))?;
        let (entry, stage) = shared.entries[0].clone();
        Ok(ShaderEntry {
            shader: Arc::clone(shared),
            entry,
            stage,
        })
    }
}

// ---------------------------------------------------------------------------
// ShaderLibrary
// ---------------------------------------------------------------------------

pub struct ShaderLibrary<B: Backend> {
    shared: Option<Arc<ShaderShared<B>>>,
}

impl<B: Backend> Default for ShaderLibrary<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> std::fmt::Debug for ShaderLibrary<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderLibrary")
            .field("entries", &self.shared.as_ref().map(|s| &s.entries))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> ShaderLibrary<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &ShaderLibraryDesc<'_>) -> Result<()> {
        self.deinitialize();
        for (i, (name, _)) in desc.entries.iter().enumerate() {
            if desc.entries[..i].iter().any(|(other, _)| other == name) {
                return Err(Error::invalid(format!("Duplicate library entry {name}")));
            }
        }
        self.shared = Some(create_shared(device, desc.code, desc.entries.clone(), desc.name.as_deref())?);
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    /// Look up a declared entry point by name.
    pub fn entry(&self, name: &str) -> Result<ShaderEntry<B>> {
        let shared = self.shared.as_ref().ok_or(Error::NotInitialized("ShaderLibrary"))?;
        let (entry, stage) = shared
            .entries
            .iter()
            .find(|(n, _)| n == name)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("Library has no entry point {name}")))?;
        Ok(ShaderEntry {
            shader: Arc::clone(shared),
            entry,
            stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_spirv, soft_device};

    #[test]
    fn spirv_validation() {
        assert!(validate_spirv(&[]).is_err());
        assert!(validate_spirv(&[0x03, 0x02, 0x23]).is_err());
        assert!(validate_spirv(&[0, 0, 0, 0]).is_err());
        assert!(validate_spirv(&fake_spirv()).is_ok());
    }

    #[test]
    fn library_entries_are_looked_up_by_name() {
        let (_system, device) = soft_device();
        let code = fake_spirv();
        let mut library = ShaderLibrary::new();
        library
            .initialize(&device, &ShaderLibraryDesc {
                code: &code,
                entries: vec![
                    ("raygen".to_owned(), ShaderStage::RayGeneration),
                    ("miss".to_owned(), ShaderStage::Miss),
                ],
                name: None,
            })
            .unwrap();
        assert_eq!(library.entry("miss").unwrap().stage(), ShaderStage::Miss);
        assert_eq!(library.entry("hit").unwrap_err().code(), crate::ResultCode::InvalidArgs);
    }

    #[test]
    fn shader_rejects_bad_bytecode() {
        let (_system, device) = soft_device();
        let err = device
            .create_shader(&ShaderDesc {
                code: &[1, 2, 3, 4],
                entry: "main".to_owned(),
                stage: ShaderStage::Compute,
                name: None,
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
    }
}

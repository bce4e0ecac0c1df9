//! Bottom- and top-level acceleration structures.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::backend::{
    AccelerationStructureApi, AccelerationStructureGeometry, AccelerationStructureSizes, Backend, DeviceApi,
    GeometryInfo,
};
use crate::buffer::{Buffer, BufferDesc, BufferUsage, MemoryLocality};
use crate::device::{Device, DeviceShared};
use crate::error::{Error, Result};
use crate::format::{Format, IndexFormat};

/// Round `value` up to a multiple of `alignment`. Zero alignment is one.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const PREFER_FAST_TRACE = 1 << 1;
        const PREFER_FAST_BUILD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BuildMode {
    #[default]
    Build,
    /// Refit a structure built with [`BuildFlags::ALLOW_UPDATE`].
    Update,
}

bitflags! {
    /// Per-instance flags, stored in the top 8 bits of the SBT word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FLIP_FACING = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// One top-level instance as the GPU reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AccelerationStructureInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

const _: () = assert!(std::mem::size_of::<AccelerationStructureInstance>() == 64);

const LOW_24: u32 = 0x00ff_ffff;

impl AccelerationStructureInstance {
    pub const IDENTITY: [f32; 12] = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    /// `custom_index` and `sbt_offset` keep their low 24 bits.
    pub fn new(
        transform: [f32; 12],
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: InstanceFlags,
        blas_address: u64,
    ) -> Self {
        Self {
            transform,
            custom_index_and_mask: (custom_index & LOW_24) | (u32::from(mask) << 24),
            sbt_offset_and_flags: (sbt_offset & LOW_24) | (u32::from(flags.bits()) << 24),
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & LOW_24
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & LOW_24
    }

    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.sbt_offset_and_flags >> 24) as u8)
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

pub struct IndexInput<B: Backend> {
    pub buffer: Buffer<B>,
    pub offset: u64,
    pub format: IndexFormat,
}

pub struct TriangleGeometry<B: Backend> {
    pub vertex_buffer: Buffer<B>,
    pub vertex_offset: u64,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    /// `Rgb32Float` or `Rgba32Float`; only xyz is read.
    pub vertex_format: Format,
    pub index: Option<IndexInput<B>>,
    pub triangle_count: u32,
    pub opaque: bool,
}

/// Axis-aligned boxes stored as `[min_x, min_y, min_z, max_x, max_y, max_z]`.
pub struct AabbGeometry<B: Backend> {
    pub buffer: Buffer<B>,
    pub offset: u64,
    pub stride: u64,
    pub count: u32,
    pub opaque: bool,
}

pub enum GeometryDesc<B: Backend> {
    Triangles(TriangleGeometry<B>),
    Aabbs(AabbGeometry<B>),
}

pub enum AccelerationStructureKind<B: Backend> {
    BottomLevel(Vec<GeometryDesc<B>>),
    TopLevel { max_instances: u32 },
}

pub struct AccelerationStructureDesc<B: Backend> {
    pub kind: AccelerationStructureKind<B>,
    pub flags: BuildFlags,
    pub name: Option<String>,
}

const AABB_SIZE: u64 = 24;

fn input_address<B: Backend>(
    device: &Arc<DeviceShared<B>>,
    buffer: &Buffer<B>,
    offset: u64,
    len: u64,
    what: &str,
) -> Result<u64> {
    let shared = buffer.shared()?;
    if !Arc::ptr_eq(&shared.device, device) {
        return Err(Error::invalid(format!("{what} buffer belongs to another device")));
    }
    if !shared.desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
        return Err(Error::invalid(format!("{what} buffer lacks ACCELERATION_STRUCTURE_INPUT usage")));
    }
    if offset.checked_add(len).is_none_or(|end| end > shared.desc.size) {
        return Err(Error::invalid(format!(
            "{what} range {offset}+{len} exceeds buffer size {}",
            shared.desc.size
        )));
    }
    Ok(buffer.device_address()? + offset)
}

fn lower_geometry<B: Backend>(
    device: &Arc<DeviceShared<B>>,
    geometry: &GeometryDesc<B>,
    inputs: &mut Vec<Buffer<B>>,
) -> Result<GeometryInfo> {
    match geometry {
        GeometryDesc::Triangles(t) => {
            if !matches!(t.vertex_format, Format::Rgb32Float | Format::Rgba32Float) {
                return Err(Error::invalid(format!("{:?} is not a vertex position format", t.vertex_format)));
            }
            if t.vertex_count == 0 || t.triangle_count == 0 {
                return Err(Error::invalid("Triangle geometry is empty"));
            }
            let texel = u64::from(t.vertex_format.bytes_per_texel());
            if t.vertex_stride < texel {
                return Err(Error::invalid(format!("Vertex stride {} below {texel}", t.vertex_stride)));
            }
            let vertex_len = t.vertex_stride * u64::from(t.vertex_count - 1) + texel;
            let vertex_address = input_address(device, &t.vertex_buffer, t.vertex_offset, vertex_len, "Vertex")?;
            inputs.push(t.vertex_buffer.clone());
            let index_count = u64::from(t.triangle_count) * 3;
            let index = match &t.index {
                Some(index) => {
                    let len = index_count * index.format.size();
                    let address = input_address(device, &index.buffer, index.offset, len, "Index")?;
                    inputs.push(index.buffer.clone());
                    Some((address, index.format))
                }
                None if index_count > u64::from(t.vertex_count) => {
                    return Err(Error::invalid(format!(
                        "{} triangles need {index_count} vertices, have {}",
                        t.triangle_count, t.vertex_count
                    )));
                }
                None => None,
            };
            Ok(GeometryInfo::Triangles {
                vertex_address,
                vertex_stride: t.vertex_stride,
                vertex_count: t.vertex_count,
                vertex_format: t.vertex_format,
                index,
                triangle_count: t.triangle_count,
                opaque: t.opaque,
            })
        }
        GeometryDesc::Aabbs(a) => {
            if a.count == 0 {
                return Err(Error::invalid("AABB geometry is empty"));
            }
            if a.stride < AABB_SIZE || !a.stride.is_multiple_of(8) {
                return Err(Error::invalid(format!("AABB stride {} must be >= 24 and a multiple of 8", a.stride)));
            }
            let len = a.stride * u64::from(a.count - 1) + AABB_SIZE;
            let address = input_address(device, &a.buffer, a.offset, len, "AABB")?;
            inputs.push(a.buffer.clone());
            Ok(GeometryInfo::Aabbs {
                address,
                stride: a.stride,
                count: a.count,
                opaque: a.opaque,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Rays
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: [f32; 3],
    pub direction: [f32; 3],
    pub t_min: f32,
    pub t_max: f32,
    /// Instances whose mask shares no bit with this are skipped.
    pub mask: u8,
}

impl Ray {
    pub fn new(origin: [f32; 3], direction: [f32; 3]) -> Self {
        Self {
            origin,
            direction,
            t_min: 0.0,
            t_max: f32::INFINITY,
            mask: 0xff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub t: f32,
    /// Index of the top-level instance, if traced through one.
    pub instance_index: Option<u32>,
    pub instance_custom_index: u32,
    pub geometry_index: u32,
    pub primitive_index: u32,
    /// Barycentrics of vertices 1 and 2 for triangle hits.
    pub barycentrics: [f32; 2],
}

// ---------------------------------------------------------------------------
// AccelerationStructure
// ---------------------------------------------------------------------------

pub(crate) enum LevelShared<B: Backend> {
    Bottom {
        geometry: AccelerationStructureGeometry,
        // Keeps the input buffers alive for builds and refits.
        _inputs: Vec<Buffer<B>>,
    },
    Top {
        max_instances: u32,
    },
}

pub(crate) struct AccelerationStructureShared<B: Backend> {
    pub(crate) native: B::AccelerationStructure,
    pub(crate) level: LevelShared<B>,
    pub(crate) flags: BuildFlags,
    pub(crate) sizes: AccelerationStructureSizes,
    pub(crate) scratch: Buffer<B>,
    pub(crate) scratch_address: u64,
    pub(crate) built: AtomicBool,
    pub(crate) device: Arc<DeviceShared<B>>,
}

impl<B: Backend> Drop for AccelerationStructureShared<B> {
    fn drop(&mut self) {
        tracing::debug!("Dropping acceleration structure ({:?})", self.sizes);
    }
}

pub struct AccelerationStructure<B: Backend> {
    shared: Option<Arc<AccelerationStructureShared<B>>>,
}

impl<B: Backend> Default for AccelerationStructure<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for AccelerationStructure<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for AccelerationStructure<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("sizes", &self.shared.as_ref().map(|s| s.sizes))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> AccelerationStructure<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, device: &Device<B>, desc: &AccelerationStructureDesc<B>) -> Result<()> {
        self.deinitialize();
        let device_shared = device.shared()?;
        device_shared.require_ray_tracing("acceleration structures")?;
        if desc.flags.contains(BuildFlags::PREFER_FAST_TRACE | BuildFlags::PREFER_FAST_BUILD) {
            return Err(Error::invalid("PREFER_FAST_TRACE and PREFER_FAST_BUILD are exclusive"));
        }

        let (level, query) = match &desc.kind {
            AccelerationStructureKind::BottomLevel(geometries) => {
                if geometries.is_empty() {
                    return Err(Error::invalid("Bottom-level structure has no geometry"));
                }
                let mut inputs = Vec::new();
                let infos = geometries
                    .iter()
                    .map(|g| lower_geometry(device_shared, g, &mut inputs))
                    .collect::<Result<Vec<_>>>()?;
                let geometry = AccelerationStructureGeometry::BottomLevel(infos);
                (
                    LevelShared::Bottom {
                        geometry: geometry.clone(),
                        _inputs: inputs,
                    },
                    geometry,
                )
            }
            AccelerationStructureKind::TopLevel { max_instances } => {
                if *max_instances == 0 {
                    return Err(Error::invalid("Top-level structure needs at least one instance"));
                }
                (
                    LevelShared::Top {
                        max_instances: *max_instances,
                    },
                    AccelerationStructureGeometry::TopLevel {
                        instance_address: 0,
                        instance_count: *max_instances,
                    },
                )
            }
        };

        let sizes = device_shared.native.acceleration_structure_sizes(&query, desc.flags)?;
        let top_level = matches!(level, LevelShared::Top { .. });
        let native = device_shared
            .native
            .create_acceleration_structure(top_level, sizes.storage, desc.name.as_deref())?;

        let alignment = device_shared.descriptor.min_scratch_offset_alignment.max(1);
        let scratch = device.create_buffer(&BufferDesc {
            size: sizes.build_scratch.max(sizes.update_scratch).max(1) + alignment,
            usage: BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS,
            locality: MemoryLocality::Device,
            name: desc.name.as_ref().map(|n| format!("{n} scratch")),
        })?;
        let scratch_address = align_up(scratch.device_address()?, alignment);

        self.shared = Some(Arc::new(AccelerationStructureShared {
            native,
            level,
            flags: desc.flags,
            sizes,
            scratch,
            scratch_address,
            built: AtomicBool::new(false),
            device: Arc::clone(device_shared),
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<AccelerationStructureShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("AccelerationStructure"))
    }

    pub fn device_address(&self) -> Result<u64> {
        Ok(self.shared()?.native.device_address())
    }

    pub fn sizes(&self) -> Result<AccelerationStructureSizes> {
        Ok(self.shared()?.sizes)
    }

    pub fn flags(&self) -> Result<BuildFlags> {
        Ok(self.shared()?.flags)
    }

    pub fn is_top_level(&self) -> Result<bool> {
        Ok(self.shared()?.is_top_level())
    }

    /// Capacity of a top-level structure; `None` for bottom level.
    pub fn max_instances(&self) -> Result<Option<u32>> {
        Ok(match self.shared()?.level {
            LevelShared::Top { max_instances } => Some(max_instances),
            LevelShared::Bottom { .. } => None,
        })
    }

    /// Whether a build has been recorded.
    pub fn is_built(&self) -> Result<bool> {
        Ok(self.shared()?.built.load(Ordering::Acquire))
    }

    pub fn scratch_buffer(&self) -> Result<&Buffer<B>> {
        Ok(&self.shared()?.scratch)
    }
}

impl<B: Backend> AccelerationStructureShared<B> {
    /// Check that a build in `mode` may be recorded.
    pub(crate) fn check_build(&self, mode: BuildMode) -> Result<()> {
        if mode == BuildMode::Update {
            if !self.flags.contains(BuildFlags::ALLOW_UPDATE) {
                return Err(Error::invalid("Update requires the ALLOW_UPDATE flag"));
            }
            if !self.built.load(Ordering::Acquire) {
                return Err(Error::invalid("Update requires a prior build"));
            }
        }
        Ok(())
    }

    pub(crate) fn is_top_level(&self) -> bool {
        matches!(self.level, LevelShared::Top { .. })
    }

    pub(crate) fn mark_built(&self) {
        self.built.store(true, Ordering::Release);
    }
}

impl AccelerationStructure<crate::Soft> {
    /// Nearest hit along `ray` against the last executed build.
    pub fn intersect(&self, ray: &Ray) -> Result<Option<Hit>> {
        let shared = self.shared()?;
        if !shared.built.load(Ordering::Acquire) {
            return Err(Error::invalid("Acceleration structure has not been built"));
        }
        shared.native.intersect(ray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Soft;
    use crate::device::QueueKind;
    use crate::test_support::{soft_device, soft_device_with};
    use crate::backend::soft::SoftAdapterConfig;

    fn input_buffer(device: &Device<Soft>, bytes: &[u8]) -> Buffer<Soft> {
        let buffer = device
            .create_buffer(&BufferDesc {
                size: bytes.len() as u64,
                usage: BufferUsage::ACCELERATION_STRUCTURE_INPUT,
                locality: MemoryLocality::Upload,
                name: None,
            })
            .unwrap();
        buffer.write(0, bytes).unwrap();
        buffer
    }

    fn triangle_blas(device: &Device<Soft>, flags: BuildFlags) -> AccelerationStructure<Soft> {
        let vertices: [f32; 9] = [-1.0, 0.0, -1.0, 1.0, 0.0, -1.0, 0.0, 0.0, 1.0];
        let vertex_buffer = input_buffer(device, bytemuck::cast_slice(&vertices));
        device
            .create_acceleration_structure(&AccelerationStructureDesc {
                kind: AccelerationStructureKind::BottomLevel(vec![GeometryDesc::Triangles(TriangleGeometry {
                    vertex_buffer,
                    vertex_offset: 0,
                    vertex_stride: 12,
                    vertex_count: 3,
                    vertex_format: Format::Rgb32Float,
                    index: None,
                    triangle_count: 1,
                    opaque: true,
                })]),
                flags,
                name: Some("triangle".to_owned()),
            })
            .unwrap()
    }

    #[test]
    fn instance_packs_index_mask_offset_and_flags() {
        let instance = AccelerationStructureInstance::new(
            AccelerationStructureInstance::IDENTITY,
            0x0123_4567,
            0xab,
            7,
            InstanceFlags::FORCE_OPAQUE,
            0xdead_0000,
        );
        assert_eq!(instance.custom_index(), 0x23_4567);
        assert_eq!(instance.mask(), 0xab);
        assert_eq!(instance.sbt_offset(), 7);
        assert_eq!(instance.flags(), InstanceFlags::FORCE_OPAQUE);
        assert_eq!(bytemuck::bytes_of(&instance).len(), 64);
    }

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 128), 0);
        assert_eq!(align_up(1, 128), 128);
        assert_eq!(align_up(256, 128), 256);
        assert_eq!(align_up(5, 0), 5);
    }

    #[test]
    fn scratch_is_sized_and_aligned() {
        let (_system, device) = soft_device();
        let blas = triangle_blas(&device, BuildFlags::ALLOW_UPDATE);
        let sizes = blas.sizes().unwrap();
        let alignment = device.descriptor().unwrap().min_scratch_offset_alignment;
        let scratch = blas.scratch_buffer().unwrap();
        assert!(scratch.size().unwrap() >= sizes.build_scratch.max(sizes.update_scratch));
        let shared = blas.shared().unwrap();
        assert!(shared.scratch_address.is_multiple_of(alignment));
        assert!(blas.device_address().unwrap() != 0);
        assert!(!blas.is_top_level().unwrap());
    }

    #[test]
    fn update_needs_flag_and_prior_build() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();

        let fixed = triangle_blas(&device, BuildFlags::PREFER_FAST_TRACE);
        assert!(list.build_bottom_level(&fixed, BuildMode::Update).is_err());

        let refit = triangle_blas(&device, BuildFlags::ALLOW_UPDATE);
        assert!(list.build_bottom_level(&refit, BuildMode::Update).is_err());
        list.build_bottom_level(&refit, BuildMode::Build).unwrap();
        list.build_bottom_level(&refit, BuildMode::Update).unwrap();
        list.end().unwrap();
    }

    #[test]
    fn ray_down_the_centroid_hits_the_instanced_triangle() {
        let (_system, device) = soft_device();
        let blas = triangle_blas(&device, BuildFlags::PREFER_FAST_TRACE);
        let tlas = device
            .create_acceleration_structure(&AccelerationStructureDesc {
                kind: AccelerationStructureKind::TopLevel { max_instances: 4 },
                flags: BuildFlags::empty(),
                name: None,
            })
            .unwrap();

        // Lift the triangle to y = 2.
        let mut transform = AccelerationStructureInstance::IDENTITY;
        transform[7] = 2.0;
        let instance = AccelerationStructureInstance::new(
            transform,
            42,
            0x01,
            0,
            InstanceFlags::empty(),
            blas.device_address().unwrap(),
        );
        let instances = input_buffer(&device, bytemuck::bytes_of(&instance));

        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.build_bottom_level(&blas, BuildMode::Build).unwrap();
        list.acceleration_structure_barrier(&blas).unwrap();
        assert!(list.build_top_level(&tlas, &instances, 8, 1, BuildMode::Build).is_err());
        assert!(list.build_top_level(&tlas, &instances, 0, 5, BuildMode::Build).is_err());
        list.build_top_level(&tlas, &instances, 0, 1, BuildMode::Build).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();

        // CPU reference: the centroid of the lifted triangle.
        let centroid = [0.0, 2.0, -1.0 / 3.0];
        let ray = Ray::new([centroid[0], 10.0, centroid[2]], [0.0, -1.0, 0.0]);
        let hit = tlas.intersect(&ray).unwrap().unwrap();
        assert!((hit.t - 8.0).abs() < 1e-4);
        assert_eq!(hit.instance_index, Some(0));
        assert_eq!(hit.instance_custom_index, 42);
        assert_eq!(hit.primitive_index, 0);
        assert!((hit.barycentrics[0] - 1.0 / 3.0).abs() < 1e-4);
        assert!((hit.barycentrics[1] - 1.0 / 3.0).abs() < 1e-4);

        let masked = Ray { mask: 0x02, ..ray };
        assert_eq!(tlas.intersect(&masked).unwrap(), None);
        let miss = Ray::new([5.0, 10.0, 5.0], [0.0, -1.0, 0.0]);
        assert_eq!(tlas.intersect(&miss).unwrap(), None);
    }

    #[test]
    fn instance_ranges_that_overflow_are_rejected() {
        let (_system, device) = soft_device();
        let tlas = device
            .create_acceleration_structure(&AccelerationStructureDesc {
                kind: AccelerationStructureKind::TopLevel { max_instances: 4 },
                flags: BuildFlags::empty(),
                name: None,
            })
            .unwrap();
        let instances = input_buffer(&device, &[0u8; 64]);
        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        for offset in [u64::MAX - 15, u64::MAX - 63, 1 << 63] {
            let err = list.build_top_level(&tlas, &instances, offset, 1, BuildMode::Build).unwrap_err();
            assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        }
        let err = list.build_top_level(&tlas, &instances, 16, 1, BuildMode::Build).unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        list.end().unwrap();
    }

    #[test]
    fn aabb_geometry_hits_the_near_face() {
        let (_system, device) = soft_device();
        let aabb: [f32; 6] = [-1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
        let buffer = input_buffer(&device, bytemuck::cast_slice(&aabb));
        let blas = device
            .create_acceleration_structure(&AccelerationStructureDesc {
                kind: AccelerationStructureKind::BottomLevel(vec![GeometryDesc::Aabbs(AabbGeometry {
                    buffer,
                    offset: 0,
                    stride: 24,
                    count: 1,
                    opaque: true,
                })]),
                flags: BuildFlags::empty(),
                name: None,
            })
            .unwrap();
        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.build_bottom_level(&blas, BuildMode::Build).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();

        let hit = blas.intersect(&Ray::new([0.0, 0.0, -5.0], [0.0, 0.0, 1.0])).unwrap().unwrap();
        assert!((hit.t - 4.0).abs() < 1e-5);
        assert_eq!(hit.instance_index, None);
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let (_system, device) = soft_device();
        let vertex_buffer = input_buffer(&device, &[0u8; 24]);
        let desc = AccelerationStructureDesc {
            kind: AccelerationStructureKind::BottomLevel(vec![GeometryDesc::Triangles(TriangleGeometry {
                vertex_buffer,
                vertex_offset: 0,
                vertex_stride: 12,
                vertex_count: 3,
                vertex_format: Format::Rgb32Float,
                index: None,
                triangle_count: 1,
                opaque: true,
            })]),
            flags: BuildFlags::empty(),
            name: None,
        };
        assert_eq!(
            device.create_acceleration_structure(&desc).unwrap_err().code(),
            crate::ResultCode::InvalidArgs
        );
    }

    #[test]
    fn unsupported_device_returns_not_implemented() {
        let (_system, device) = soft_device_with(SoftAdapterConfig {
            ray_tracing: false,
            ..SoftAdapterConfig::default()
        });
        let desc = AccelerationStructureDesc::<Soft> {
            kind: AccelerationStructureKind::TopLevel { max_instances: 1 },
            flags: BuildFlags::empty(),
            name: None,
        };
        assert_eq!(
            device.create_acceleration_structure(&desc).unwrap_err().code(),
            crate::ResultCode::NotImplemented
        );
    }
}

//! CPU reference back end.
//!
//! Resources live in host memory. Each device runs its submissions in order
//! on one executor thread, which keeps its own copy of every resource state
//! and counts each recorded state that disagrees with what actually ran.
//! The counters are exposed through [`Device::stats`].

mod executor;
mod intersect;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::accel::{BuildFlags, Hit, Ray};
use crate::backend::{
    AccelerationStructureApi, AccelerationStructureGeometry, AccelerationStructureSizes, AcquireOutcome, Backend,
    BufferApi, Command, CommandBufferApi, CommandPoolApi, ComputePipelineInfo, DescriptorBinding, DescriptorResource,
    DeviceApi, DeviceFeatures, FenceApi, GeometryInfo, GraphicsPipelineInfo, InstanceApi, PresentOutcome,
    RayTracingPipelineInfo, RenderTargetInfo, Sealed, SubmitInfo, SwapchainApi, SwapchainInfo, mip_extent,
};
use crate::binding::DescriptorType;
use crate::buffer::{BufferDesc, MemoryLocality};
use crate::canvas::CanvasSurface;
use crate::capability::{DeviceKind, MemorySizes, PhysicalDeviceDescriptor};
use crate::descriptor::DescriptorRange;
use crate::device::{Device, QueueKind};
use crate::error::{Error, Result};
use crate::format::Format;
use crate::image::{ImageDesc, ImageUsage};
use crate::lock;
use crate::pass::{ClearValue, LoadOp};
use crate::pipeline::PipelineKind;
use crate::sampler::SamplerDesc;
use crate::state::{ResourceState, Subresource, SubresourceStates};
use crate::system::WindowHandleSource;

use executor::{Executor, Job, Op, Submission};
use intersect::Scene;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Soft;

impl Sealed for Soft {}

impl Backend for Soft {
    const NAME: &'static str = "soft";

    type Config = SoftConfig;
    type Instance = SoftInstance;
    type Device = SoftDevice;
    type Image = SoftImage;
    type Buffer = SoftBuffer;
    type Sampler = SoftSampler;
    type Shader = SoftShader;
    type DescriptorTableLayout = SoftDescriptorTableLayout;
    type DescriptorTable = SoftDescriptorTable;
    type RenderTarget = SoftRenderTarget;
    type Pipeline = SoftPipeline;
    type AccelerationStructure = SoftAccelerationStructure;
    type CommandPool = SoftCommandPool;
    type CommandBuffer = SoftCommandBuffer;
    type Fence = SoftFence;
    type Semaphore = SoftSemaphore;
    type Swapchain = SoftSwapchain;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SoftConfig {
    /// One entry per enumerated adapter.
    pub adapters: Vec<SoftAdapterConfig>,
}

impl Default for SoftConfig {
    fn default() -> Self {
        Self {
            adapters: vec![SoftAdapterConfig::default()],
        }
    }
}

/// What a simulated adapter reports and how its executor behaves.
#[derive(Debug, Clone)]
pub struct SoftAdapterConfig {
    pub name: String,
    pub kind: DeviceKind,
    pub memory: MemorySizes,
    pub dedicated_queue_count: u32,
    pub ray_tracing: bool,
    pub descriptor_indexing: bool,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_ray_recursion_depth: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_scratch_offset_alignment: u64,
    /// Sleep before executing each submission.
    pub execution_delay: Duration,
}

impl Default for SoftAdapterConfig {
    fn default() -> Self {
        Self {
            name: "Soft Adapter".to_owned(),
            kind: DeviceKind::Cpu,
            memory: MemorySizes {
                device_local: 1 << 30,
                host_visible: 1 << 30,
                shared: 0,
            },
            dedicated_queue_count: 0,
            ray_tracing: true,
            descriptor_indexing: true,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 16,
            min_scratch_offset_alignment: 128,
            execution_delay: Duration::ZERO,
        }
    }
}

/// Executor counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SoftStats {
    pub submissions: u64,
    pub draws: u64,
    pub dispatches: u64,
    pub traces: u64,
    pub builds: u64,
    pub presents: u64,
    /// Recorded states or bindings that disagreed with execution.
    pub validation_errors: u64,
    /// Submissions that signal semaphores and have not finished.
    pub frames_in_flight: u64,
    pub max_frames_in_flight: u64,
}

impl Device<Soft> {
    pub fn stats(&self) -> Result<SoftStats> {
        Ok(*lock(&self.native()?.core.stats))
    }
}

// ---------------------------------------------------------------------------
// Device addresses
// ---------------------------------------------------------------------------

const ADDRESS_BASE: u64 = 0x1_0000;
const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Clone)]
enum Allocation {
    Buffer(Weak<BufferMemory>),
    Accel(Weak<AccelStorage>),
}

#[derive(Default)]
struct RegistryInner {
    next: u64,
    regions: BTreeMap<u64, (u64, Allocation)>,
}

/// Hands out device addresses and maps them back to their allocations.
#[derive(Default)]
pub(crate) struct AddressRegistry {
    inner: Mutex<RegistryInner>,
}

impl AddressRegistry {
    fn register(&self, size: u64, allocation: Allocation) -> u64 {
        let mut inner = lock(&self.inner);
        let base = inner.next.max(ADDRESS_BASE);
        inner.next = crate::accel::align_up(base + size.max(1), ADDRESS_ALIGNMENT);
        inner.regions.insert(base, (size, allocation));
        base
    }

    fn unregister(&self, base: u64) {
        lock(&self.inner).regions.remove(&base);
    }

    /// The region holding `[address, address + len)`, as its base and
    /// allocation.
    fn find(&self, address: u64, len: u64) -> Option<(u64, Allocation)> {
        let inner = lock(&self.inner);
        let (&base, (size, allocation)) = inner.regions.range(..=address).next_back()?;
        let end = address.checked_add(len)?;
        (end <= base + size).then(|| (base, allocation.clone()))
    }

    /// Copy `len` bytes of buffer memory starting at `address`.
    pub(crate) fn read(&self, address: u64, len: u64) -> Option<Vec<u8>> {
        let (base, Allocation::Buffer(weak)) = self.find(address, len)? else {
            return None;
        };
        let buffer = weak.upgrade()?;
        let start = usize::try_from(address - base).ok()?;
        let bytes = lock(&buffer.bytes);
        bytes.get(start..start + usize::try_from(len).ok()?).map(<[u8]>::to_vec)
    }

    pub(crate) fn contains_buffer(&self, address: u64) -> bool {
        self.contains_buffer_range(address, 0)
    }

    /// Whether `[address, address + len)` lies inside one live buffer.
    pub(crate) fn contains_buffer_range(&self, address: u64, len: u64) -> bool {
        matches!(self.find(address, len), Some((_, Allocation::Buffer(weak))) if weak.strong_count() > 0)
    }

    pub(crate) fn resolve_accel(&self, address: u64) -> Option<Arc<AccelStorage>> {
        match self.find(address, 0)? {
            (base, Allocation::Accel(weak)) if base == address => weak.upgrade(),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

pub struct SoftInstance {
    adapters: Vec<SoftAdapterConfig>,
}

impl InstanceApi<Soft> for SoftInstance {
    fn new(app_name: &str, window: Option<&Arc<dyn WindowHandleSource>>, config: &SoftConfig) -> Result<Self> {
        tracing::info!(
            "Creating soft instance for {:?} with {} adapter(s), window: {}",
            app_name,
            config.adapters.len(),
            window.is_some()
        );
        Ok(Self {
            adapters: config.adapters.clone(),
        })
    }

    fn physical_devices(&self) -> Result<Vec<PhysicalDeviceDescriptor>> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(index, a)| PhysicalDeviceDescriptor {
                index,
                name: a.name.clone(),
                kind: a.kind,
                vendor_id: 0,
                device_id: index as u32,
                memory: a.memory,
                dedicated_queue_count: a.dedicated_queue_count,
                ray_tracing_supported: a.ray_tracing,
                descriptor_indexing_supported: a.descriptor_indexing,
                shader_group_handle_size: a.shader_group_handle_size,
                shader_group_handle_alignment: a.shader_group_handle_alignment,
                shader_group_base_alignment: a.shader_group_base_alignment,
                max_ray_recursion_depth: a.max_ray_recursion_depth,
                min_uniform_buffer_offset_alignment: a.min_uniform_buffer_offset_alignment,
                min_storage_buffer_offset_alignment: a.min_storage_buffer_offset_alignment,
                min_scratch_offset_alignment: a.min_scratch_offset_alignment,
            })
            .collect())
    }

    fn create_device(
        &self,
        adapter: &PhysicalDeviceDescriptor,
        features: &DeviceFeatures,
        name: Option<&str>,
    ) -> Result<SoftDevice> {
        let config = self
            .adapters
            .get(adapter.index)
            .ok_or_else(|| Error::invalid(format!("No soft adapter with index {}", adapter.index)))?;
        tracing::debug!("Creating soft device {:?} on {:?}", name, config.name);
        let registry = Arc::new(AddressRegistry::default());
        let stats = Arc::new(Mutex::new(SoftStats::default()));
        let executor = Executor::spawn(config.execution_delay, Arc::clone(&registry), Arc::clone(&stats))?;
        Ok(SoftDevice {
            core: Arc::new(DeviceCore {
                config: config.clone(),
                features: *features,
                registry,
                stats,
                executor,
                next_id: AtomicU32::new(1),
            }),
        })
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

pub(crate) struct BufferMemory {
    pub(crate) bytes: Mutex<Vec<u8>>,
    /// State as seen by executed work.
    pub(crate) state: Mutex<ResourceState>,
    address: Option<u64>,
    registry: Arc<AddressRegistry>,
}

impl Drop for BufferMemory {
    fn drop(&mut self) {
        if let Some(address) = self.address {
            self.registry.unregister(address);
        }
    }
}

#[derive(Clone)]
pub struct SoftBuffer {
    pub(crate) memory: Arc<BufferMemory>,
}

impl SoftBuffer {
    fn new(registry: &Arc<AddressRegistry>, desc: &BufferDesc) -> Result<Self> {
        let len = usize::try_from(desc.size).map_err(|e| Error::failure("Allocating soft buffer", e))?;
        let memory = Arc::new_cyclic(|weak| BufferMemory {
            bytes: Mutex::new(vec![0; len]),
            state: Mutex::new(ResourceState::Common),
            address: desc
                .usage
                .has_device_address()
                .then(|| registry.register(desc.size, Allocation::Buffer(weak.clone()))),
            registry: Arc::clone(registry),
        });
        Ok(Self { memory })
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let size = lock(&self.memory.bytes).len();
        usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|r| r.end <= size)
            .ok_or_else(|| Error::invalid(format!("Range {offset}+{len} exceeds buffer of {size} bytes")))
    }
}

impl BufferApi for SoftBuffer {
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let range = self.range(offset, bytes.len())?;
        lock(&self.memory.bytes)[range].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let range = self.range(offset, out.len())?;
        out.copy_from_slice(&lock(&self.memory.bytes)[range]);
        Ok(())
    }

    fn device_address(&self) -> Option<u64> {
        self.memory.address
    }
}

pub(crate) struct ImageContents {
    /// Texels per subresource, indexed `mip * array_layers + layer`.
    pub(crate) data: Vec<Vec<u8>>,
    /// States as seen by executed work.
    pub(crate) states: SubresourceStates,
}

pub(crate) struct ImageMemory {
    pub(crate) desc: ImageDesc,
    pub(crate) contents: Mutex<ImageContents>,
}

impl ImageMemory {
    fn new(desc: &ImageDesc) -> Self {
        let texel = desc.format.bytes_per_texel() as usize;
        let data = (0..desc.mip_levels)
            .flat_map(|mip| {
                let (w, h, d) = mip_extent(desc.width, desc.height, desc.depth, mip);
                let len = w as usize * h as usize * d as usize * texel;
                (0..desc.array_layers).map(move |_| vec![0; len])
            })
            .collect();
        Self {
            desc: desc.clone(),
            contents: Mutex::new(ImageContents {
                data,
                states: SubresourceStates::new(desc.mip_levels, desc.array_layers, ResourceState::Undefined),
            }),
        }
    }

    pub(crate) fn index(&self, sub: Subresource) -> Option<usize> {
        (sub.mip < self.desc.mip_levels && sub.layer < self.desc.array_layers)
            .then(|| (sub.mip * self.desc.array_layers + sub.layer) as usize)
    }
}

#[derive(Clone)]
pub struct SoftImage {
    pub(crate) memory: Arc<ImageMemory>,
}

pub struct SoftSampler {
    _desc: SamplerDesc,
}

pub struct SoftShader {
    _size: usize,
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

pub struct SoftDescriptorTableLayout {
    ranges: Vec<DescriptorRange>,
}

/// Which descriptors of a table have been written.
pub(crate) struct TableState {
    ranges: Vec<DescriptorRange>,
    counts: Vec<u32>,
    written: Mutex<Vec<Vec<bool>>>,
}

impl TableState {
    fn new(ranges: &[DescriptorRange], variable_count: Option<u32>) -> Self {
        let counts: Vec<u32> = ranges
            .iter()
            .map(|r| match (r.dynamic, variable_count) {
                (true, Some(count)) => count,
                _ => r.count,
            })
            .collect();
        let written = counts.iter().map(|&c| vec![false; c as usize]).collect();
        Self {
            ranges: ranges.to_vec(),
            counts,
            written: Mutex::new(written),
        }
    }

    fn mark(&self, binding: DescriptorBinding) -> Result<()> {
        let mut written = lock(&self.written);
        let slot = written
            .get_mut(binding.range_index)
            .and_then(|range| range.get_mut(binding.array_index as usize))
            .ok_or_else(|| Error::invalid(format!("No descriptor at {binding:?}")))?;
        *slot = true;
        Ok(())
    }

    /// A description of each fixed-size range with unwritten descriptors.
    pub(crate) fn incomplete(&self) -> Vec<String> {
        let written = lock(&self.written);
        self.ranges
            .iter()
            .zip(self.counts.iter())
            .zip(written.iter())
            .filter(|((range, _), _)| !range.dynamic)
            .filter_map(|((range, count), flags)| {
                let done = flags.iter().filter(|&&w| w).count();
                (done < *count as usize).then(|| {
                    format!(
                        "{:?} range at binding {} has {done} of {count} descriptors written",
                        range.ty, range.binding
                    )
                })
            })
            .collect()
    }
}

pub struct SoftDescriptorTable {
    pub(crate) state: Arc<TableState>,
}

// ---------------------------------------------------------------------------
// Render targets and pipelines
// ---------------------------------------------------------------------------

pub struct SoftRenderTarget {
    pub(crate) colors: Vec<(Arc<ImageMemory>, Subresource)>,
    pub(crate) depth: Option<(Arc<ImageMemory>, Subresource)>,
}

pub(crate) struct PipelineState {
    pub(crate) id: u32,
    pub(crate) kind: PipelineKind,
    pub(crate) table_count: usize,
    group_count: u32,
}

pub struct SoftPipeline {
    pub(crate) state: Arc<PipelineState>,
}

// ---------------------------------------------------------------------------
// Acceleration structures
// ---------------------------------------------------------------------------

pub(crate) struct AccelStorage {
    address: u64,
    pub(crate) top_level: bool,
    /// Result of the last executed build.
    pub(crate) scene: Mutex<Option<Scene>>,
    registry: Arc<AddressRegistry>,
}

impl Drop for AccelStorage {
    fn drop(&mut self) {
        self.registry.unregister(self.address);
    }
}

pub struct SoftAccelerationStructure {
    pub(crate) storage: Arc<AccelStorage>,
}

impl SoftAccelerationStructure {
    pub(crate) fn intersect(&self, ray: &Ray) -> Result<Option<Hit>> {
        let scene = lock(&self.storage.scene);
        let scene = scene
            .as_ref()
            .ok_or_else(|| Error::invalid("Acceleration structure build has not executed"))?;
        Ok(scene.intersect(ray))
    }
}

impl AccelerationStructureApi for SoftAccelerationStructure {
    fn device_address(&self) -> u64 {
        self.storage.address
    }
}

fn primitive_count(geometry: &AccelerationStructureGeometry) -> u64 {
    match geometry {
        AccelerationStructureGeometry::BottomLevel(infos) => infos
            .iter()
            .map(|g| match *g {
                GeometryInfo::Triangles { triangle_count, .. } => u64::from(triangle_count),
                GeometryInfo::Aabbs { count, .. } => u64::from(count),
            })
            .sum(),
        AccelerationStructureGeometry::TopLevel { instance_count, .. } => u64::from(*instance_count),
    }
}

// ---------------------------------------------------------------------------
// Command recording
// ---------------------------------------------------------------------------

pub struct SoftCommandPool {
    queue: QueueKind,
}

impl CommandPoolApi<Soft> for SoftCommandPool {
    fn allocate(&mut self) -> Result<SoftCommandBuffer> {
        tracing::trace!("Allocating soft command buffer on {:?}", self.queue);
        Ok(SoftCommandBuffer::default())
    }
}

#[derive(Default)]
pub struct SoftCommandBuffer {
    ops: Vec<Op>,
    recording: bool,
}

fn attachment_clear(format: Format, load: LoadOp, value: Option<&ClearValue>) -> Result<Option<Vec<u8>>> {
    if load != LoadOp::Clear {
        return Ok(None);
    }
    match value {
        Some(ClearValue::Color(color)) => format.encode_color(*color).map(Some),
        Some(ClearValue::DepthStencil { depth, .. }) => format.encode_depth(*depth).map(Some),
        None => Err(Error::invalid("Missing clear value for a cleared attachment")),
    }
}

impl CommandBufferApi<Soft> for SoftCommandBuffer {
    fn begin(&mut self) -> Result<()> {
        self.ops.clear();
        self.recording = true;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.recording = false;
        Ok(())
    }

    fn record(&mut self, command: Command<'_, Soft>) -> Result<()> {
        if !self.recording {
            return Err(Error::failure("Recording soft command", "buffer is not recording"));
        }
        let op = match command {
            Command::ImageBarrier { image, transitions } => Op::ImageBarrier {
                image: Arc::clone(&image.memory),
                transitions: transitions.to_vec(),
            },
            Command::BufferBarrier { buffer, from, to } => Op::BufferBarrier {
                buffer: Arc::clone(&buffer.memory),
                from,
                to,
            },
            Command::MemoryBarrier { .. } => return Ok(()),
            Command::BeginRenderPass {
                target,
                pass,
                clear_values,
                color_states,
                depth_state,
            } => {
                let mut attachments = Vec::with_capacity(target.colors.len() + 1);
                for (i, ((image, sub), desc)) in target.colors.iter().zip(pass.colors.iter()).enumerate() {
                    attachments.push(executor::Attachment {
                        image: Arc::clone(image),
                        subresource: *sub,
                        state: color_states.get(i).copied().unwrap_or(ResourceState::ColorWrite),
                        clear: attachment_clear(desc.format, desc.load, clear_values.get(i))?,
                    });
                }
                if let (Some((image, sub)), Some(desc)) = (&target.depth, &pass.depth) {
                    attachments.push(executor::Attachment {
                        image: Arc::clone(image),
                        subresource: *sub,
                        state: depth_state.unwrap_or(ResourceState::DepthWrite),
                        clear: attachment_clear(desc.format, desc.load, clear_values.get(target.colors.len()))?,
                    });
                }
                Op::BeginRenderPass { attachments }
            }
            Command::EndRenderPass => Op::EndRenderPass,
            Command::BindPipeline(pipeline) => Op::BindPipeline(Arc::clone(&pipeline.state)),
            Command::BindDescriptorTable { index, table, .. } => Op::BindDescriptorTable {
                index: index as usize,
                table: Arc::clone(&table.state),
            },
            Command::BindVertexBuffer { .. }
            | Command::BindIndexBuffer { .. }
            | Command::SetViewport(_)
            | Command::SetScissor(_) => return Ok(()),
            Command::Draw { .. } | Command::DrawIndexed { .. } => Op::Work(PipelineKind::Graphics),
            Command::Dispatch { .. } => Op::Work(PipelineKind::Compute),
            Command::TraceRays { regions, .. } => Op::Trace(*regions),
            Command::BuildAccelerationStructure {
                dst,
                geometry,
                scratch_address,
                ..
            } => Op::Build {
                dst: Arc::clone(&dst.storage),
                geometry: geometry.clone(),
                scratch_address,
            },
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => Op::CopyBuffer {
                src: Arc::clone(&src.memory),
                src_offset,
                dst: Arc::clone(&dst.memory),
                dst_offset,
                size,
            },
            Command::CopyBufferToImage {
                src,
                src_offset,
                dst,
                dst_state,
                subresource,
            } => Op::CopyBufferToImage {
                src: Arc::clone(&src.memory),
                src_offset,
                dst: Arc::clone(&dst.memory),
                dst_state,
                subresource,
            },
            Command::CopyImageToBuffer {
                src,
                src_state,
                subresource,
                dst,
                dst_offset,
            } => Op::CopyImageToBuffer {
                src: Arc::clone(&src.memory),
                src_state,
                subresource,
                dst: Arc::clone(&dst.memory),
                dst_offset,
            },
            Command::CopyImage {
                src,
                src_state,
                src_subresource,
                dst,
                dst_state,
                dst_subresource,
            } => Op::CopyImage {
                src: Arc::clone(&src.memory),
                src_state,
                src_subresource,
                dst: Arc::clone(&dst.memory),
                dst_state,
                dst_subresource,
            },
            Command::ClearColor {
                image,
                state,
                range,
                color,
            } => Op::Clear {
                texel: image.memory.desc.format.encode_color(color)?,
                image: Arc::clone(&image.memory),
                state,
                range,
            },
            Command::ClearDepth {
                image,
                state,
                range,
                depth,
            } => Op::Clear {
                texel: image.memory.desc.format.encode_depth(depth)?,
                image: Arc::clone(&image.memory),
                state,
                range,
            },
        };
        self.ops.push(op);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synchronization
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FenceInner {
    signaled: Mutex<bool>,
    cond: Condvar,
}

#[derive(Clone, Default)]
pub struct SoftFence {
    inner: Arc<FenceInner>,
}

impl SoftFence {
    fn new(signaled: bool) -> Self {
        let fence = Self::default();
        *lock(&fence.inner.signaled) = signaled;
        fence
    }

    pub(crate) fn signal(&self) {
        *lock(&self.inner.signaled) = true;
        self.inner.cond.notify_all();
    }
}

impl FenceApi for SoftFence {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let guard = lock(&self.inner.signaled);
        match timeout {
            None => {
                let guard = self
                    .inner
                    .cond
                    .wait_while(guard, |signaled| !*signaled)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                Ok(*guard)
            }
            Some(timeout) => {
                let (guard, _) = self
                    .inner
                    .cond
                    .wait_timeout_while(guard, timeout, |signaled| !*signaled)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                Ok(*guard)
            }
        }
    }

    fn reset(&self) -> Result<()> {
        *lock(&self.inner.signaled) = false;
        Ok(())
    }
}

/// A binary semaphore. Waiting consumes the signal.
#[derive(Clone, Default)]
pub struct SoftSemaphore {
    signaled: Arc<AtomicBool>,
}

impl SoftSemaphore {
    /// Returns `false` if it was already signaled.
    pub(crate) fn signal(&self) -> bool {
        !self.signaled.swap(true, Ordering::AcqRel)
    }

    /// Returns `false` if there was no signal to consume.
    pub(crate) fn consume(&self) -> bool {
        self.signaled.swap(false, Ordering::AcqRel)
    }
}

// ---------------------------------------------------------------------------
// Swapchain
// ---------------------------------------------------------------------------

/// An offscreen swapchain. Presenting only checks and counts.
pub struct SoftSwapchain {
    images: Vec<SoftImage>,
    extent: (u32, u32),
    format: Format,
    next: AtomicU32,
    core: Arc<DeviceCore>,
}

impl SwapchainApi<Soft> for SoftSwapchain {
    fn images(&self) -> Result<Vec<SoftImage>> {
        Ok(self.images.clone())
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn format(&self) -> Format {
        self.format
    }

    fn acquire(&self, signal: &SoftSemaphore, _timeout: Option<Duration>) -> Result<AcquireOutcome> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.images.len() as u32;
        if !signal.signal() {
            self.core.report("Acquire signals a semaphore that is already signaled");
        }
        Ok(AcquireOutcome::Acquired {
            index,
            suboptimal: false,
        })
    }

    fn present(&self, image_index: u32, wait: &SoftSemaphore) -> Result<PresentOutcome> {
        let image = self
            .images
            .get(image_index as usize)
            .ok_or_else(|| Error::invalid(format!("No swapchain image {image_index}")))?;
        self.core.executor.submit(Job::Present {
            image: Arc::clone(&image.memory),
            wait: wait.clone(),
        })?;
        Ok(PresentOutcome::Presented)
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

pub(crate) struct DeviceCore {
    config: SoftAdapterConfig,
    features: DeviceFeatures,
    registry: Arc<AddressRegistry>,
    stats: Arc<Mutex<SoftStats>>,
    executor: Executor,
    next_id: AtomicU32,
}

impl DeviceCore {
    fn report(&self, message: &str) {
        executor::report(&self.stats, message);
    }
}

pub struct SoftDevice {
    core: Arc<DeviceCore>,
}

impl SoftDevice {
    fn pipeline(&self, kind: PipelineKind, table_count: usize, group_count: u32) -> SoftPipeline {
        SoftPipeline {
            state: Arc::new(PipelineState {
                id: self.core.next_id.fetch_add(1, Ordering::Relaxed),
                kind,
                table_count,
                group_count,
            }),
        }
    }

    fn require_ray_tracing(&self) -> Result<()> {
        if self.core.features.ray_tracing {
            Ok(())
        } else {
            Err(Error::not_implemented("ray tracing on this soft adapter"))
        }
    }
}

impl DeviceApi<Soft> for SoftDevice {
    fn create_image(&self, desc: &ImageDesc) -> Result<SoftImage> {
        Ok(SoftImage {
            memory: Arc::new(ImageMemory::new(desc)),
        })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<SoftBuffer> {
        SoftBuffer::new(&self.core.registry, desc)
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SoftSampler> {
        Ok(SoftSampler { _desc: desc.clone() })
    }

    fn create_shader(&self, code: &[u8], name: Option<&str>) -> Result<SoftShader> {
        tracing::trace!("Creating soft shader {:?} ({} bytes)", name, code.len());
        Ok(SoftShader { _size: code.len() })
    }

    fn create_descriptor_table_layout(
        &self,
        ranges: &[DescriptorRange],
        _name: Option<&str>,
    ) -> Result<SoftDescriptorTableLayout> {
        if ranges.iter().any(|r| r.dynamic) && !self.core.features.descriptor_indexing {
            return Err(Error::not_implemented("descriptor indexing on this soft adapter"));
        }
        Ok(SoftDescriptorTableLayout {
            ranges: ranges.to_vec(),
        })
    }

    fn create_descriptor_table(
        &self,
        layout: &SoftDescriptorTableLayout,
        variable_count: Option<u32>,
        _name: Option<&str>,
    ) -> Result<SoftDescriptorTable> {
        Ok(SoftDescriptorTable {
            state: Arc::new(TableState::new(&layout.ranges, variable_count)),
        })
    }

    fn write_descriptor(
        &self,
        table: &SoftDescriptorTable,
        binding: DescriptorBinding,
        resource: DescriptorResource<'_, Soft>,
    ) -> Result<()> {
        let matches = match resource {
            DescriptorResource::Buffer { .. } => matches!(
                binding.ty,
                DescriptorType::ConstantBuffer | DescriptorType::Buffer | DescriptorType::RwBuffer
            ),
            DescriptorResource::Image { .. } => {
                matches!(binding.ty, DescriptorType::Texture | DescriptorType::RwTexture)
            }
            DescriptorResource::Sampler(_) => binding.ty == DescriptorType::Sampler,
            DescriptorResource::AccelerationStructure(_) => binding.ty == DescriptorType::AccelerationStructure,
        };
        if !matches {
            return Err(Error::invalid(format!("Resource does not fit a {:?} descriptor", binding.ty)));
        }
        table.state.mark(binding)
    }

    fn create_render_target(&self, info: &RenderTargetInfo<'_, Soft>) -> Result<SoftRenderTarget> {
        Ok(SoftRenderTarget {
            colors: info
                .colors
                .iter()
                .map(|a| (Arc::clone(&a.image.memory), a.subresource))
                .collect(),
            depth: info.depth.as_ref().map(|a| (Arc::clone(&a.image.memory), a.subresource)),
        })
    }

    fn create_graphics_pipeline(&self, info: &GraphicsPipelineInfo<'_, Soft>) -> Result<SoftPipeline> {
        Ok(self.pipeline(PipelineKind::Graphics, info.layouts.len(), 0))
    }

    fn create_compute_pipeline(&self, info: &ComputePipelineInfo<'_, Soft>) -> Result<SoftPipeline> {
        Ok(self.pipeline(PipelineKind::Compute, info.layouts.len(), 0))
    }

    fn create_ray_tracing_pipeline(&self, info: &RayTracingPipelineInfo<'_, Soft>) -> Result<SoftPipeline> {
        self.require_ray_tracing()?;
        if info.max_recursion_depth > self.core.config.max_ray_recursion_depth {
            return Err(Error::invalid(format!(
                "Recursion depth {} exceeds {}",
                info.max_recursion_depth, self.core.config.max_ray_recursion_depth
            )));
        }
        Ok(self.pipeline(PipelineKind::RayTracing, info.layouts.len(), info.groups.len() as u32))
    }

    fn shader_group_handles(&self, pipeline: &SoftPipeline, group_count: u32) -> Result<Vec<u8>> {
        let state = &pipeline.state;
        if state.kind != PipelineKind::RayTracing || group_count > state.group_count {
            return Err(Error::invalid(format!(
                "Pipeline has {} shader groups, {group_count} requested",
                state.group_count
            )));
        }
        let size = self.core.config.shader_group_handle_size as usize;
        let mut handles = vec![0; size * group_count as usize];
        for (group, handle) in handles.chunks_exact_mut(size).enumerate() {
            let id = [state.id.to_le_bytes(), (group as u32).to_le_bytes()].concat();
            let len = id.len().min(size);
            handle[..len].copy_from_slice(&id[..len]);
        }
        Ok(handles)
    }

    fn acceleration_structure_sizes(
        &self,
        geometry: &AccelerationStructureGeometry,
        flags: BuildFlags,
    ) -> Result<AccelerationStructureSizes> {
        self.require_ray_tracing()?;
        let count = primitive_count(geometry);
        let build_scratch = 128 + 32 * count;
        Ok(AccelerationStructureSizes {
            storage: 256 + 64 * count,
            build_scratch,
            update_scratch: if flags.contains(BuildFlags::ALLOW_UPDATE) {
                build_scratch / 2
            } else {
                0
            },
        })
    }

    fn create_acceleration_structure(
        &self,
        top_level: bool,
        size: u64,
        name: Option<&str>,
    ) -> Result<SoftAccelerationStructure> {
        self.require_ray_tracing()?;
        tracing::trace!("Creating soft acceleration structure {:?} ({size} bytes)", name);
        let registry = &self.core.registry;
        let storage = Arc::new_cyclic(|weak| AccelStorage {
            address: registry.register(size, Allocation::Accel(weak.clone())),
            top_level,
            scene: Mutex::new(None),
            registry: Arc::clone(registry),
        });
        Ok(SoftAccelerationStructure { storage })
    }

    fn create_command_pool(&self, queue: QueueKind, _name: Option<&str>) -> Result<SoftCommandPool> {
        Ok(SoftCommandPool { queue })
    }

    fn create_fence(&self, signaled: bool, _name: Option<&str>) -> Result<SoftFence> {
        Ok(SoftFence::new(signaled))
    }

    fn create_semaphore(&self, _name: Option<&str>) -> Result<SoftSemaphore> {
        Ok(SoftSemaphore::default())
    }

    fn create_swapchain(&self, info: &SwapchainInfo<'_>, old: Option<&SoftSwapchain>) -> Result<SoftSwapchain> {
        if info.surface == CanvasSurface::Window {
            return Err(Error::not_implemented("window presentation on the soft back end"));
        }
        let format = info.format.unwrap_or(Format::Rgba8Unorm);
        let usage = ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        let desc = ImageDesc {
            locality: MemoryLocality::Device,
            name: info.name.map(str::to_owned),
            ..ImageDesc::texture_2d(info.width, info.height, format, usage)
        };
        let images = (0..info.image_count.max(1))
            .map(|_| SoftImage {
                memory: Arc::new(ImageMemory::new(&desc)),
            })
            .collect();
        tracing::debug!(
            "Soft swapchain {}x{} {:?}, replacing: {}",
            info.width,
            info.height,
            format,
            old.is_some()
        );
        Ok(SoftSwapchain {
            images,
            extent: (info.width, info.height),
            format,
            next: AtomicU32::new(0),
            core: Arc::clone(&self.core),
        })
    }

    fn submit(&self, _queue: QueueKind, submissions: &[SubmitInfo<'_, Soft>]) -> Result<()> {
        for info in submissions {
            let frame = !info.signal_semaphores.is_empty();
            {
                let mut stats = lock(&self.core.stats);
                stats.submissions += 1;
                if frame {
                    stats.frames_in_flight += 1;
                    stats.max_frames_in_flight = stats.max_frames_in_flight.max(stats.frames_in_flight);
                }
            }
            self.core.executor.submit(Job::Submit(Submission {
                ops: info.command_buffer.ops.clone(),
                wait: info.wait_semaphores.iter().map(|&s| s.clone()).collect(),
                signal: info.signal_semaphores.iter().map(|&s| s.clone()).collect(),
                fence: info.fence.clone(),
                frame,
            }))?;
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let start = Instant::now();
        self.core.executor.wait_idle();
        tracing::trace!("Soft device idle after {:?}", start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_desc(size: u64) -> BufferDesc {
        BufferDesc {
            size,
            usage: crate::buffer::BufferUsage::DEVICE_ADDRESS,
            ..BufferDesc::default()
        }
    }

    #[test]
    fn registry_resolves_interior_addresses_until_drop() {
        let registry = Arc::new(AddressRegistry::default());
        let a = SoftBuffer::new(&registry, &buffer_desc(100)).unwrap();
        let b = SoftBuffer::new(&registry, &buffer_desc(8)).unwrap();
        let base = a.device_address().unwrap();
        assert!(base >= ADDRESS_BASE);
        assert!(b.device_address().unwrap().is_multiple_of(ADDRESS_ALIGNMENT));

        a.write(10, &[1, 2, 3]).unwrap();
        assert_eq!(registry.read(base + 10, 3), Some(vec![1, 2, 3]));
        assert_eq!(registry.read(base + 99, 2), None);
        assert!(registry.contains_buffer(base + 50));
        assert!(registry.resolve_accel(base).is_none());

        drop(a);
        assert!(!registry.contains_buffer(base + 50));
    }

    #[test]
    fn table_state_reports_unwritten_fixed_ranges() {
        use crate::shader::ShaderStages;
        let ranges = [
            DescriptorRange::new(DescriptorType::ConstantBuffer, 0, 2, ShaderStages::ALL_GRAPHICS),
            DescriptorRange::dynamic(DescriptorType::Texture, 0, 16, ShaderStages::FRAGMENT),
        ];
        let table = TableState::new(&ranges, Some(4));
        let binding = |range_index, array_index| DescriptorBinding {
            range_index,
            slot: 0,
            ty: ranges[range_index].ty,
            array_index,
        };
        table.mark(binding(0, 0)).unwrap();
        table.mark(binding(1, 3)).unwrap();
        assert!(table.mark(binding(1, 4)).is_err());
        assert_eq!(table.incomplete().len(), 1);
        table.mark(binding(0, 1)).unwrap();
        assert!(table.incomplete().is_empty());
    }

    #[test]
    fn fence_times_out_until_signaled() {
        let fence = SoftFence::new(false);
        assert!(!fence.wait(Some(Duration::from_millis(1))).unwrap());
        fence.signal();
        assert!(fence.wait(None).unwrap());
        fence.reset().unwrap();
        assert!(!fence.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn semaphores_are_binary() {
        let semaphore = SoftSemaphore::default();
        assert!(!semaphore.consume());
        assert!(semaphore.signal());
        assert!(!semaphore.signal());
        assert!(semaphore.consume());
    }
}

//! The soft device's in-order executor thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::intersect::{BottomLevel, Instance, Primitive, Scene};
use super::{
    AccelStorage, AddressRegistry, BufferMemory, ImageMemory, PipelineState, SoftFence, SoftSemaphore, SoftStats,
    TableState,
};
use crate::accel::AccelerationStructureInstance;
use crate::backend::{AccelerationStructureGeometry, GeometryInfo};
use crate::error::{Error, Result};
use crate::format::{Format, IndexFormat};
use crate::lock;
use crate::pipeline::PipelineKind;
use crate::raytracing::SbtRegions;
use crate::state::{ResourceState, StateTransition, Subresource, SubresourceRange};

const INSTANCE_SIZE: usize = std::mem::size_of::<AccelerationStructureInstance>();
const AABB_SIZE: u64 = 24;

/// Count a validation error.
pub(crate) fn report(stats: &Mutex<SoftStats>, message: &str) {
    tracing::warn!(target: "xgpu::soft", "Validation: {}", message);
    lock(stats).validation_errors += 1;
}

#[derive(Clone)]
pub(crate) struct Attachment {
    pub(crate) image: Arc<ImageMemory>,
    pub(crate) subresource: Subresource,
    pub(crate) state: ResourceState,
    /// Encoded texel to fill with when the attachment is cleared on load.
    pub(crate) clear: Option<Vec<u8>>,
}

/// A recorded command holding its own references to the resources it uses.
#[derive(Clone)]
pub(crate) enum Op {
    ImageBarrier {
        image: Arc<ImageMemory>,
        transitions: Vec<StateTransition>,
    },
    BufferBarrier {
        buffer: Arc<BufferMemory>,
        from: ResourceState,
        to: ResourceState,
    },
    BeginRenderPass {
        attachments: Vec<Attachment>,
    },
    EndRenderPass,
    BindPipeline(Arc<PipelineState>),
    BindDescriptorTable {
        index: usize,
        table: Arc<TableState>,
    },
    /// A draw or dispatch against the bound pipeline of this kind.
    Work(PipelineKind),
    /// A trace reading its shader records from these regions.
    Trace(SbtRegions),
    Build {
        dst: Arc<AccelStorage>,
        geometry: AccelerationStructureGeometry,
        scratch_address: u64,
    },
    CopyBuffer {
        src: Arc<BufferMemory>,
        src_offset: u64,
        dst: Arc<BufferMemory>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToImage {
        src: Arc<BufferMemory>,
        src_offset: u64,
        dst: Arc<ImageMemory>,
        dst_state: ResourceState,
        subresource: Subresource,
    },
    CopyImageToBuffer {
        src: Arc<ImageMemory>,
        src_state: ResourceState,
        subresource: Subresource,
        dst: Arc<BufferMemory>,
        dst_offset: u64,
    },
    CopyImage {
        src: Arc<ImageMemory>,
        src_state: ResourceState,
        src_subresource: Subresource,
        dst: Arc<ImageMemory>,
        dst_state: ResourceState,
        dst_subresource: Subresource,
    },
    Clear {
        image: Arc<ImageMemory>,
        state: ResourceState,
        range: SubresourceRange,
        texel: Vec<u8>,
    },
}

pub(crate) struct Submission {
    pub(crate) ops: Vec<Op>,
    pub(crate) wait: Vec<SoftSemaphore>,
    pub(crate) signal: Vec<SoftSemaphore>,
    pub(crate) fence: SoftFence,
    /// Counted towards frames in flight until it completes.
    pub(crate) frame: bool,
}

pub(crate) enum Job {
    Submit(Submission),
    Present { image: Arc<ImageMemory>, wait: SoftSemaphore },
}

#[derive(Default)]
struct Idle {
    pending: Mutex<u64>,
    cond: Condvar,
}

impl Idle {
    fn finish(&self) {
        let mut pending = lock(&self.pending);
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.cond.notify_all();
        }
    }
}

pub(crate) struct Executor {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    idle: Arc<Idle>,
}

impl Executor {
    pub(crate) fn spawn(delay: Duration, registry: Arc<AddressRegistry>, stats: Arc<Mutex<SoftStats>>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let idle = Arc::new(Idle::default());
        let context = Context { delay, registry, stats };
        let thread_idle = Arc::clone(&idle);
        let thread = thread::Builder::new()
            .name("xgpu-soft-executor".to_owned())
            .spawn(move || run(receiver, context, thread_idle))
            .map_err(|e| Error::failure("Spawning soft executor", e))?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
            idle,
        })
    }

    pub(crate) fn submit(&self, job: Job) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::failure("Submitting soft work", "executor has shut down"))?;
        *lock(&self.idle.pending) += 1;
        if let Err(e) = sender.send(job) {
            self.idle.finish();
            return Err(Error::failure("Submitting soft work", e));
        }
        Ok(())
    }

    pub(crate) fn wait_idle(&self) {
        let pending = lock(&self.idle.pending);
        drop(
            self.idle
                .cond
                .wait_while(pending, |p| *p > 0)
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("Soft executor thread panicked");
        }
    }
}

fn run(receiver: Receiver<Job>, context: Context, idle: Arc<Idle>) {
    tracing::debug!("Soft executor started");
    while let Ok(job) = receiver.recv() {
        match job {
            Job::Submit(submission) => context.execute(submission),
            Job::Present { image, wait } => context.present(&image, &wait),
        }
        idle.finish();
    }
    tracing::debug!("Soft executor stopped");
}

#[derive(Default)]
struct Bindings {
    pipeline: Option<Arc<PipelineState>>,
    tables: Vec<Option<Arc<TableState>>>,
    in_pass: bool,
}

struct Context {
    delay: Duration,
    registry: Arc<AddressRegistry>,
    stats: Arc<Mutex<SoftStats>>,
}

impl Context {
    fn report(&self, message: &str) {
        report(&self.stats, message);
    }

    fn execute(&self, submission: Submission) {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        for semaphore in &submission.wait {
            if !semaphore.consume() {
                self.report("Submission waits on a semaphore nothing signaled");
            }
        }

        let mut bindings = Bindings::default();
        for op in &submission.ops {
            self.op(&mut bindings, op);
        }
        if bindings.in_pass {
            self.report("Command buffer ended inside a render pass");
        }

        for semaphore in &submission.signal {
            if !semaphore.signal() {
                self.report("Submission signals a semaphore that is already signaled");
            }
        }
        if submission.frame {
            let mut stats = lock(&self.stats);
            stats.frames_in_flight = stats.frames_in_flight.saturating_sub(1);
        }
        submission.fence.signal();
    }

    fn present(&self, image: &ImageMemory, wait: &SoftSemaphore) {
        if !wait.consume() {
            self.report("Present waits on a semaphore nothing signaled");
        }
        let state = lock(&image.contents).states.get(Subresource::default());
        if !matches!(state, Ok(ResourceState::Present)) {
            self.report(&format!("Presented image is in {state:?}"));
        }
        lock(&self.stats).presents += 1;
    }

    fn op(&self, bindings: &mut Bindings, op: &Op) {
        match op {
            Op::ImageBarrier { image, transitions } => self.image_barrier(image, transitions),
            Op::BufferBarrier { buffer, from, to } => {
                let mut state = lock(&buffer.state);
                if *from != ResourceState::Undefined && *state != *from {
                    self.report(&format!("Buffer barrier from {from:?} but the buffer is {:?}", *state));
                }
                *state = *to;
            }
            Op::BeginRenderPass { attachments } => {
                if bindings.in_pass {
                    self.report("Render pass begun inside another");
                }
                bindings.in_pass = true;
                for attachment in attachments {
                    self.begin_attachment(attachment);
                }
            }
            Op::EndRenderPass => bindings.in_pass = false,
            Op::BindPipeline(pipeline) => bindings.pipeline = Some(Arc::clone(pipeline)),
            Op::BindDescriptorTable { index, table } => {
                if bindings.tables.len() <= *index {
                    bindings.tables.resize(index + 1, None);
                }
                bindings.tables[*index] = Some(Arc::clone(table));
            }
            Op::Work(kind) => self.work(bindings, *kind),
            Op::Trace(regions) => {
                self.check_shader_records(regions);
                self.work(bindings, PipelineKind::RayTracing);
            }
            Op::Build {
                dst,
                geometry,
                scratch_address,
            } => self.build(dst, geometry, *scratch_address),
            Op::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                self.check_buffer(src, true);
                self.check_buffer(dst, false);
                let Some(bytes) = read_buffer(src, *src_offset, *size) else {
                    return self.report("Buffer copy source range out of bounds");
                };
                if !write_buffer(dst, *dst_offset, &bytes) {
                    self.report("Buffer copy destination range out of bounds");
                }
            }
            Op::CopyBufferToImage {
                src,
                src_offset,
                dst,
                dst_state,
                subresource,
            } => {
                self.check_buffer(src, true);
                let Some(len) = subresource_len(dst, *subresource) else {
                    return self.report("Copy to a missing subresource");
                };
                let Some(bytes) = read_buffer(src, *src_offset, len as u64) else {
                    return self.report("Buffer to image copy reads out of bounds");
                };
                self.write_subresource(dst, *subresource, *dst_state, |data| data.copy_from_slice(&bytes));
            }
            Op::CopyImageToBuffer {
                src,
                src_state,
                subresource,
                dst,
                dst_offset,
            } => {
                self.check_buffer(dst, false);
                let Some(bytes) = self.read_subresource(src, *subresource, *src_state) else {
                    return;
                };
                if !write_buffer(dst, *dst_offset, &bytes) {
                    self.report("Image to buffer copy writes out of bounds");
                }
            }
            Op::CopyImage {
                src,
                src_state,
                src_subresource,
                dst,
                dst_state,
                dst_subresource,
            } => {
                let Some(bytes) = self.read_subresource(src, *src_subresource, *src_state) else {
                    return;
                };
                self.write_subresource(dst, *dst_subresource, *dst_state, |data| {
                    let len = data.len().min(bytes.len());
                    data[..len].copy_from_slice(&bytes[..len]);
                });
            }
            Op::Clear {
                image,
                state,
                range,
                texel,
            } => {
                for sub in range.iter() {
                    self.write_subresource(image, sub, *state, |data| fill(data, texel));
                }
            }
        }
    }

    fn image_barrier(&self, image: &ImageMemory, transitions: &[StateTransition]) {
        let mut contents = lock(&image.contents);
        for transition in transitions {
            for sub in transition.range.iter() {
                match contents.states.get(sub) {
                    Ok(actual) if transition.from != ResourceState::Undefined && actual != transition.from => {
                        self.report(&format!(
                            "Barrier from {:?} but {:?} of {:?} is {actual:?}",
                            transition.from, sub, image.desc.name
                        ));
                    }
                    Ok(_) => {}
                    Err(e) => self.report(&e.to_string()),
                }
            }
            if let Err(e) = contents.states.apply(transition.range, transition.to) {
                self.report(&e.to_string());
            }
        }
    }

    fn begin_attachment(&self, attachment: &Attachment) {
        let Attachment {
            image,
            subresource,
            state,
            clear,
        } = attachment;
        match clear {
            Some(texel) => self.write_subresource(image, *subresource, *state, |data| fill(data, texel)),
            None => {
                let actual = lock(&image.contents).states.get(*subresource);
                if !matches!(actual, Ok(s) if s == *state) {
                    self.report(&format!("Attachment expected in {state:?} is {actual:?}"));
                }
            }
        }
    }

    fn work(&self, bindings: &Bindings, kind: PipelineKind) {
        let Some(pipeline) = bindings.pipeline.as_ref().filter(|p| p.kind == kind) else {
            return self.report(&format!("{kind:?} work without a {kind:?} pipeline bound"));
        };
        if kind == PipelineKind::Graphics && !bindings.in_pass {
            self.report("Draw outside a render pass");
        }
        for index in 0..pipeline.table_count {
            match bindings.tables.get(index).and_then(Option::as_ref) {
                Some(table) => {
                    for message in table.incomplete() {
                        self.report(&format!("Table {index}: {message}"));
                    }
                }
                None => self.report(&format!("Pipeline {} uses table {index}, which is not bound", pipeline.id)),
            }
        }
        let mut stats = lock(&self.stats);
        match kind {
            PipelineKind::Graphics => stats.draws += 1,
            PipelineKind::Compute => stats.dispatches += 1,
            PipelineKind::RayTracing => stats.traces += 1,
        }
    }

    fn check_shader_records(&self, regions: &SbtRegions) {
        let named = [
            ("raygen", regions.raygen),
            ("miss", regions.miss),
            ("hit", regions.hit),
            ("callable", regions.callable),
        ];
        if regions.raygen.size == 0 {
            self.report("Trace without a ray generation record");
        }
        for (name, region) in named.into_iter().filter(|(_, r)| r.size > 0) {
            if !self.registry.contains_buffer_range(region.address, region.size) {
                self.report(&format!("The {name} region {region:?} is not inside a live buffer"));
            }
        }
    }

    fn check_buffer(&self, buffer: &BufferMemory, source: bool) {
        let state = *lock(&buffer.state);
        let ok = if source {
            state.is_copy_source()
        } else {
            state.is_copy_destination()
        };
        if !ok {
            self.report(&format!("Buffer copied while in {state:?}"));
        }
    }

    fn read_subresource(&self, image: &ImageMemory, sub: Subresource, expected: ResourceState) -> Option<Vec<u8>> {
        let contents = lock(&image.contents);
        let actual = contents.states.get(sub);
        if !matches!(actual, Ok(s) if s == expected) {
            self.report(&format!("Image read expected in {expected:?} is {actual:?}"));
        }
        let data = image.index(sub).and_then(|i| contents.data.get(i)).cloned();
        if data.is_none() {
            self.report(&format!("Read of missing subresource {sub:?}"));
        }
        data
    }

    fn write_subresource(
        &self,
        image: &ImageMemory,
        sub: Subresource,
        expected: ResourceState,
        write: impl FnOnce(&mut [u8]),
    ) {
        let mut contents = lock(&image.contents);
        let actual = contents.states.get(sub);
        if !matches!(actual, Ok(s) if s == expected) {
            self.report(&format!("Image write expected in {expected:?} is {actual:?}"));
        }
        match image.index(sub).and_then(|i| contents.data.get_mut(i)) {
            Some(data) => write(data),
            None => self.report(&format!("Write to missing subresource {sub:?}")),
        }
    }

    // -----------------------------------------------------------------------
    // Acceleration structure builds
    // -----------------------------------------------------------------------

    fn build(&self, dst: &AccelStorage, geometry: &AccelerationStructureGeometry, scratch_address: u64) {
        if !self.registry.contains_buffer(scratch_address) {
            return self.report(&format!("Scratch address {scratch_address:#x} is not in a live buffer"));
        }
        let scene = match geometry {
            AccelerationStructureGeometry::BottomLevel(infos) if !dst.top_level => {
                self.build_bottom(infos).map(|blas| Scene::Bottom(Arc::new(blas)))
            }
            AccelerationStructureGeometry::TopLevel {
                instance_address,
                instance_count,
            } if dst.top_level => self.build_top(*instance_address, *instance_count).map(Scene::Top),
            _ => Err("Geometry level does not match the acceleration structure".to_owned()),
        };
        match scene {
            Ok(scene) => {
                *lock(&dst.scene) = Some(scene);
                lock(&self.stats).builds += 1;
            }
            Err(message) => self.report(&message),
        }
    }

    fn build_bottom(&self, infos: &[GeometryInfo]) -> std::result::Result<BottomLevel, String> {
        let mut geometries = Vec::with_capacity(infos.len());
        for info in infos {
            let primitives = match *info {
                GeometryInfo::Triangles {
                    vertex_address,
                    vertex_stride,
                    vertex_count,
                    vertex_format,
                    index,
                    triangle_count,
                    ..
                } => {
                    let positions = self.read_positions(vertex_address, vertex_stride, vertex_count, vertex_format)?;
                    let indices = match index {
                        Some((address, format)) => self.read_indices(address, format, triangle_count * 3)?,
                        None => (0..triangle_count * 3).collect(),
                    };
                    indices
                        .chunks_exact(3)
                        .map(|tri| {
                            let vertex = |i: u32| {
                                positions
                                    .get(i as usize)
                                    .copied()
                                    .ok_or_else(|| format!("Index {i} exceeds {vertex_count} vertices"))
                            };
                            Ok(Primitive::Triangle {
                                vertices: [vertex(tri[0])?, vertex(tri[1])?, vertex(tri[2])?],
                            })
                        })
                        .collect::<std::result::Result<Vec<_>, String>>()?
                }
                GeometryInfo::Aabbs {
                    address,
                    stride,
                    count,
                    ..
                } => (0..u64::from(count))
                    .map(|i| {
                        let bytes = self.read(address + i * stride, AABB_SIZE)?;
                        let f = |k: usize| f32_at(&bytes, k * 4);
                        Ok(Primitive::Aabb {
                            min: [f(0), f(1), f(2)],
                            max: [f(3), f(4), f(5)],
                        })
                    })
                    .collect::<std::result::Result<Vec<_>, String>>()?,
            };
            geometries.push(primitives);
        }
        Ok(BottomLevel { geometries })
    }

    fn build_top(&self, address: u64, count: u32) -> std::result::Result<Vec<Instance>, String> {
        let bytes = self.read(address, count as u64 * INSTANCE_SIZE as u64)?;
        bytes
            .chunks_exact(INSTANCE_SIZE)
            .enumerate()
            .map(|(i, chunk)| {
                let record: AccelerationStructureInstance = bytemuck::pod_read_unaligned(chunk);
                let reference = record.acceleration_structure_reference;
                let blas = self
                    .registry
                    .resolve_accel(reference)
                    .ok_or_else(|| format!("Instance {i} references unknown structure {reference:#x}"))?;
                let bottom = match lock(&blas.scene).as_ref() {
                    Some(Scene::Bottom(bottom)) => Arc::clone(bottom),
                    Some(Scene::Top(_)) => return Err(format!("Instance {i} references a top-level structure")),
                    None => return Err(format!("Instance {i} references a structure that was never built")),
                };
                Instance::new(&record, bottom).ok_or_else(|| format!("Instance {i} has a singular transform"))
            })
            .collect()
    }

    fn read(&self, address: u64, len: u64) -> std::result::Result<Vec<u8>, String> {
        self.registry
            .read(address, len)
            .ok_or_else(|| format!("{len} bytes at {address:#x} are not in a live buffer"))
    }

    fn read_positions(
        &self,
        address: u64,
        stride: u64,
        count: u32,
        format: Format,
    ) -> std::result::Result<Vec<[f32; 3]>, String> {
        if !matches!(format, Format::Rgb32Float | Format::Rgba32Float) {
            return Err(format!("Unsupported vertex format {format:?}"));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let len = stride * u64::from(count - 1) + 12;
        let bytes = self.read(address, len)?;
        Ok((0..count as usize)
            .map(|i| {
                let at = i * stride as usize;
                [f32_at(&bytes, at), f32_at(&bytes, at + 4), f32_at(&bytes, at + 8)]
            })
            .collect())
    }

    fn read_indices(&self, address: u64, format: IndexFormat, count: u32) -> std::result::Result<Vec<u32>, String> {
        let bytes = self.read(address, format.size() * u64::from(count))?;
        Ok(match format {
            IndexFormat::U16 => bytes
                .chunks_exact(2)
                .map(|c| u32::from(bytemuck::pod_read_unaligned::<u16>(c)))
                .collect(),
            IndexFormat::U32 => bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned::<u32>).collect(),
        })
    }
}

fn f32_at(bytes: &[u8], at: usize) -> f32 {
    bytemuck::pod_read_unaligned(&bytes[at..at + 4])
}

fn fill(data: &mut [u8], texel: &[u8]) {
    if texel.is_empty() {
        return;
    }
    for chunk in data.chunks_exact_mut(texel.len()) {
        chunk.copy_from_slice(texel);
    }
}

fn subresource_len(image: &ImageMemory, sub: Subresource) -> Option<usize> {
    let contents = lock(&image.contents);
    image.index(sub).and_then(|i| contents.data.get(i)).map(Vec::len)
}

fn read_buffer(buffer: &BufferMemory, offset: u64, len: u64) -> Option<Vec<u8>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    lock(&buffer.bytes).get(start..end).map(<[u8]>::to_vec)
}

fn write_buffer(buffer: &BufferMemory, offset: u64, bytes: &[u8]) -> bool {
    let Ok(start) = usize::try_from(offset) else {
        return false;
    };
    let Some(end) = start.checked_add(bytes.len()) else {
        return false;
    };
    let mut data = lock(&buffer.bytes);
    match data.get_mut(start..end) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mip_extent;

    #[test]
    fn fill_repeats_the_texel() {
        let mut data = vec![0u8; 8];
        fill(&mut data, &[1, 2, 3, 4]);
        assert_eq!(data, [1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn mip_data_matches_extent() {
        let image = ImageMemory::new(&crate::image::ImageDesc {
            mip_levels: 3,
            ..crate::image::ImageDesc::texture_2d(8, 4, Format::Rgba8Unorm, crate::image::ImageUsage::SAMPLED)
        });
        let (w, h, _) = mip_extent(8, 4, 1, 2);
        assert_eq!(subresource_len(&image, Subresource::new(2, 0)), Some((w * h * 4) as usize));
        assert_eq!(subresource_len(&image, Subresource::new(3, 0)), None);
    }

    #[test]
    fn idle_waits_for_every_job() {
        let stats = Arc::new(Mutex::new(SoftStats::default()));
        let executor = Executor::spawn(
            Duration::from_millis(5),
            Arc::new(AddressRegistry::default()),
            Arc::clone(&stats),
        )
        .unwrap();
        let fence = SoftFence::default();
        for _ in 0..3 {
            executor
                .submit(Job::Submit(Submission {
                    ops: Vec::new(),
                    wait: Vec::new(),
                    signal: Vec::new(),
                    fence: fence.clone(),
                    frame: false,
                }))
                .unwrap();
        }
        executor.wait_idle();
        assert_eq!(*lock(&executor.idle.pending), 0);
        assert_eq!(lock(&stats).validation_errors, 0);
    }
}

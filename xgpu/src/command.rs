//! Command lists: recording, state tracking and completion.
//!
//! A list moves Initial → Recording → Closed → Submitted → Complete. Every
//! recording call validates its operands against tracked state, lowers to a
//! backend [`Command`] and, once the native record succeeds, applies its
//! state changes and retains the resources it touched until the list's fence
//! is observed.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::accel::{AccelerationStructure, BuildMode};
use crate::backend::{
    AccelerationStructureGeometry, Backend, BufferApi, Command, CommandBufferApi, CommandPoolApi, DeviceApi, FenceApi,
};
use crate::buffer::{Buffer, BufferShared, BufferUsage};
use crate::descriptor::DescriptorTable;
use crate::device::{WorkerPool, WorkerPoolShared};
use crate::error::{Error, Result};
use crate::format::{Format, IndexFormat};
use crate::image::{Image, ImageShared, ImageUsage};
use crate::lock;
use crate::pass::{ClearValue, LoadOp, Rect, RenderPass, RenderTarget, Viewport};
use crate::pipeline::{ComputePipeline, GraphicsPipeline, PipelineKind, PipelineShared};
use crate::raytracing::{RayTracingPipeline, ShaderBindingTable};
use crate::state::{ResourceState, SourceState, Subresource, SubresourceRange};

/// Size of one top-level instance record.
const INSTANCE_SIZE: u64 = 64;
/// Instance arrays must start on this boundary.
const INSTANCE_ALIGNMENT: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListState {
    Initial,
    Recording,
    Closed,
    Submitted,
    Complete,
}

type Retained = Arc<dyn Any + Send + Sync>;

/// Attachment formats of the render pass being recorded.
struct ActivePass {
    color_formats: Vec<Format>,
    depth_format: Option<Format>,
}

pub(crate) struct ListCore<B: Backend> {
    pub(crate) native: B::CommandBuffer,
    pub(crate) state: ListState,
    /// Waiting in the device's pending queue.
    pub(crate) queued: bool,
    pub(crate) wait_semaphores: Vec<Arc<B::Semaphore>>,
    pub(crate) signal_semaphores: Vec<Arc<B::Semaphore>>,
    retained: Vec<Retained>,
    pass: Option<ActivePass>,
    pipeline: Option<Arc<PipelineShared<B>>>,
    index_bound: bool,
}

impl<B: Backend> ListCore<B> {
    fn release(&mut self) {
        self.retained.clear();
        self.pass = None;
        self.pipeline = None;
        self.index_bound = false;
    }

    fn retain<T: Any + Send + Sync>(&mut self, resource: &Arc<T>) {
        self.retained.push(Arc::clone(resource) as Retained);
    }
}

pub(crate) struct ListShared<B: Backend> {
    pub(crate) core: Mutex<ListCore<B>>,
    pub(crate) fence: B::Fence,
    pub(crate) pool: Arc<WorkerPoolShared<B>>,
}

/// Lock guards held while a command is recorded: the pool first, then the list.
struct Recording<'a, B: Backend> {
    _pool: MutexGuard<'a, B::CommandPool>,
    core: MutexGuard<'a, ListCore<B>>,
}

impl<B: Backend> Recording<'_, B> {
    /// Record `command`; a native failure aborts the list back to Initial.
    fn emit(&mut self, command: Command<'_, B>) -> Result<()> {
        if let Err(e) = self.core.native.record(command) {
            tracing::error!("Aborting command list after failed record: {}", e);
            self.core.state = ListState::Initial;
            self.core.release();
            return Err(e);
        }
        Ok(())
    }

    fn require_outside_pass(&self, what: &str) -> Result<()> {
        if self.core.pass.is_some() {
            return Err(Error::invalid(format!("{what} is not allowed inside a render pass")));
        }
        Ok(())
    }

    fn require_pipeline(&self, kind: PipelineKind) -> Result<Arc<PipelineShared<B>>> {
        match &self.core.pipeline {
            Some(p) if p.kind == kind => Ok(Arc::clone(p)),
            Some(p) => Err(Error::invalid(format!("Bound pipeline is {:?}, need {kind:?}", p.kind))),
            None => Err(Error::invalid(format!("No {kind:?} pipeline bound"))),
        }
    }
}

/// A recording buffer allocated from a [`WorkerPool`].
pub struct CommandList<B: Backend> {
    shared: Option<Arc<ListShared<B>>>,
}

impl<B: Backend> Default for CommandList<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> std::fmt::Debug for CommandList<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("state", &self.shared.as_ref().map(|s| lock(&s.core).state))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Drop for CommandList<B> {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

impl<B: Backend> CommandList<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, pool: &WorkerPool<B>) -> Result<()> {
        self.deinitialize();
        let pool = &pool.shared;
        let native = lock(&pool.native).allocate()?;
        let fence = pool.device.native.create_fence(false, None)?;
        self.shared = Some(Arc::new(ListShared {
            core: Mutex::new(ListCore {
                native,
                state: ListState::Initial,
                queued: false,
                wait_semaphores: Vec::new(),
                signal_semaphores: Vec::new(),
                retained: Vec::new(),
                pass: None,
                pipeline: None,
                index_bound: false,
            }),
            fence,
            pool: Arc::clone(pool),
        }));
        Ok(())
    }

    /// Release the list, waiting for any submission of it to finish.
    pub fn deinitialize(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        shared.pool.device.dequeue(&shared);
        let state = lock(&shared.core).state;
        if state == ListState::Submitted
            && let Err(e) = shared.fence.wait(None)
        {
            tracing::error!("Error waiting for command list on drop: {}", e);
        }
        let pool = Arc::clone(&shared.pool);
        let _pool_guard = lock(&pool.native);
        drop(shared);
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<ListShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("CommandList"))
    }

    pub fn state(&self) -> Result<ListState> {
        Ok(lock(&self.shared()?.core).state)
    }

    /// Semaphores the next submission waits on and signals.
    pub(crate) fn set_semaphores(
        &mut self,
        wait: Vec<Arc<B::Semaphore>>,
        signal: Vec<Arc<B::Semaphore>>,
    ) -> Result<()> {
        let mut core = lock(&self.shared()?.core);
        core.wait_semaphores = wait;
        core.signal_semaphores = signal;
        Ok(())
    }

    /// Open the list for recording. Waits for a previous submission first.
    /// A no-op on a list that is already recording.
    pub fn begin(&mut self) -> Result<()> {
        let shared = self.shared()?;
        let state = {
            let core = lock(&shared.core);
            if core.queued {
                return Err(Error::invalid("Command list is queued for submission"));
            }
            core.state
        };
        match state {
            ListState::Recording => return Ok(()),
            ListState::Submitted | ListState::Complete => {
                shared.fence.wait(None)?;
                shared.fence.reset()?;
            }
            ListState::Initial | ListState::Closed => {}
        }

        let _pool = lock(&shared.pool.native);
        let mut core = lock(&shared.core);
        core.release();
        core.wait_semaphores.clear();
        core.signal_semaphores.clear();
        core.state = ListState::Initial;
        core.native.begin()?;
        core.state = ListState::Recording;
        Ok(())
    }

    /// Close the list. A no-op on a list that is not recording.
    pub fn end(&mut self) -> Result<()> {
        let shared = self.shared()?;
        let _pool = lock(&shared.pool.native);
        let mut core = lock(&shared.core);
        if core.state != ListState::Recording {
            return Ok(());
        }
        if core.pass.is_some() {
            return Err(Error::invalid("Cannot end a command list inside a render pass"));
        }
        if let Err(e) = core.native.end() {
            core.state = ListState::Initial;
            core.release();
            return Err(e);
        }
        core.state = ListState::Closed;
        Ok(())
    }

    /// Block until the last submission completes. Returns immediately when
    /// nothing is pending; `TimeOut` when `timeout` elapses first.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let shared = self.shared()?;
        if lock(&shared.core).state != ListState::Submitted {
            return Ok(());
        }
        if !shared.fence.wait(timeout)? {
            return Err(Error::TimeOut("CommandList::wait"));
        }
        let mut core = lock(&shared.core);
        core.state = ListState::Complete;
        core.release();
        Ok(())
    }

    fn recording(&self) -> Result<Recording<'_, B>> {
        let shared = self.shared()?;
        let pool = lock(&shared.pool.native);
        let core = lock(&shared.core);
        if core.state != ListState::Recording {
            return Err(Error::invalid(format!("Command list is {:?}, not Recording", core.state)));
        }
        Ok(Recording { _pool: pool, core })
    }

    fn check_image<'a>(&self, image: &'a Image<B>) -> Result<&'a Arc<ImageShared<B>>> {
        let image = image.shared()?;
        if !Arc::ptr_eq(&image.device, &self.shared()?.pool.device) {
            return Err(Error::invalid("Image belongs to another device"));
        }
        Ok(image)
    }

    fn check_buffer<'a>(&self, buffer: &'a Buffer<B>) -> Result<&'a Arc<BufferShared<B>>> {
        let buffer = buffer.shared()?;
        if !Arc::ptr_eq(&buffer.device, &self.shared()?.pool.device) {
            return Err(Error::invalid("Buffer belongs to another device"));
        }
        Ok(buffer)
    }

    // -----------------------------------------------------------------------
    // Barriers
    // -----------------------------------------------------------------------

    /// Transition every subresource of `image` to `dst`.
    pub fn image_barrier(&mut self, image: &Image<B>, src: SourceState, dst: ResourceState) -> Result<()> {
        let range = image.desc()?.full_range();
        self.image_range_barrier(image, range, src, dst)
    }

    pub fn image_subresource_barrier(
        &mut self,
        image: &Image<B>,
        sub: Subresource,
        src: SourceState,
        dst: ResourceState,
    ) -> Result<()> {
        self.image_range_barrier(image, SubresourceRange::single(sub), src, dst)
    }

    pub fn image_range_barrier(
        &mut self,
        image: &Image<B>,
        range: SubresourceRange,
        src: SourceState,
        dst: ResourceState,
    ) -> Result<()> {
        let image = self.check_image(image)?;
        if let SourceState::Known(from) = src
            && !from.valid_for_image()
        {
            return Err(Error::invalid(format!("{from:?} is not an image state")));
        }
        if !dst.valid_for_image() || dst == ResourceState::Undefined {
            return Err(Error::invalid(format!("{dst:?} is not a valid barrier target for images")));
        }
        let mut rec = self.recording()?;
        rec.require_outside_pass("Image barrier")?;
        let mut states = lock(&image.states);
        let transitions = states.plan(range, src, dst)?;
        rec.emit(Command::ImageBarrier {
            image: &image.native,
            transitions: &transitions,
        })?;
        states.apply(range, dst)?;
        rec.core.retain(image);
        Ok(())
    }

    pub fn buffer_barrier(&mut self, buffer: &Buffer<B>, src: SourceState, dst: ResourceState) -> Result<()> {
        let buffer = self.check_buffer(buffer)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Buffer barrier")?;
        let mut state = lock(&buffer.state);
        let from = match src {
            SourceState::Current => *state,
            SourceState::Known(s) => s,
        };
        if !from.valid_for_buffer() || !dst.valid_for_buffer() || dst == ResourceState::Undefined {
            return Err(Error::invalid(format!("{from:?} -> {dst:?} is not a buffer transition")));
        }
        rec.emit(Command::BufferBarrier {
            buffer: &buffer.native,
            from,
            to: dst,
        })?;
        *state = dst;
        rec.core.retain(buffer);
        Ok(())
    }

    /// Make completed builds of `accel` visible to later builds and traces.
    pub fn acceleration_structure_barrier(&mut self, accel: &AccelerationStructure<B>) -> Result<()> {
        let accel = accel.shared()?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Acceleration structure barrier")?;
        rec.emit(Command::MemoryBarrier {
            from: ResourceState::AccelerationStructureWrite,
            to: ResourceState::AccelerationStructureRead,
        })?;
        rec.core.retain(accel);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Render passes
    // -----------------------------------------------------------------------

    /// Begin rendering `pass` into `target`. `clear_values` holds one entry
    /// per attachment, colors first, and may be empty when nothing clears.
    pub fn begin_render_pass(
        &mut self,
        pass: &RenderPass<B>,
        target: &RenderTarget<B>,
        clear_values: &[ClearValue],
    ) -> Result<()> {
        let pass = pass.shared()?;
        let target = target.shared()?;
        let device = &self.shared()?.pool.device;
        if !Arc::ptr_eq(&pass.device, device) {
            return Err(Error::invalid("Render pass belongs to another device"));
        }
        let desc = &pass.desc;
        if desc.colors.len() != target.colors.len() || desc.depth.is_some() != target.depth.is_some() {
            return Err(Error::invalid("Render target attachments do not match the render pass"));
        }
        let attachment_formats = desc.colors.iter().zip(&target.colors).map(|(a, t)| (a.format, t.image.desc.format));
        let depth_formats = desc.depth.iter().zip(&target.depth).map(|(a, t)| (a.format, t.image.desc.format));
        if let Some((want, have)) = attachment_formats.chain(depth_formats).find(|(want, have)| want != have) {
            return Err(Error::invalid(format!("Attachment format {have:?} does not match pass format {want:?}")));
        }

        let attachment_count = desc.colors.len() + usize::from(desc.depth.is_some());
        let clears = desc.colors.iter().chain(&desc.depth).any(|a| a.load == LoadOp::Clear);
        if clears && clear_values.len() != attachment_count {
            return Err(Error::invalid(format!(
                "{} clear values for {attachment_count} attachments",
                clear_values.len()
            )));
        }
        if !clear_values.is_empty() {
            let colors_ok = clear_values[..desc.colors.len()]
                .iter()
                .all(|c| matches!(c, ClearValue::Color(_)));
            let depth_ok = clear_values[desc.colors.len()..]
                .iter()
                .all(|c| matches!(c, ClearValue::DepthStencil { .. }));
            if !colors_ok || !depth_ok {
                return Err(Error::invalid("Clear value kinds do not match attachment kinds"));
            }
        }

        let color_states = target
            .colors
            .iter()
            .map(|a| {
                let state = lock(&a.image.states).get(a.subresource)?;
                if state != ResourceState::ColorWrite {
                    return Err(Error::invalid(format!("Color attachment is in {state:?}, not ColorWrite")));
                }
                Ok(state)
            })
            .collect::<Result<Vec<_>>>()?;
        let depth_state = match &target.depth {
            Some(a) => {
                let state = lock(&a.image.states).get(a.subresource)?;
                if !state.is_depth_attachment() {
                    return Err(Error::invalid(format!("Depth attachment is in {state:?}, not DepthWrite/DepthRead")));
                }
                Some(state)
            }
            None => None,
        };

        let mut rec = self.recording()?;
        rec.require_outside_pass("Beginning a render pass")?;
        rec.emit(Command::BeginRenderPass {
            target: &target.native,
            pass: desc,
            clear_values,
            color_states: &color_states,
            depth_state,
        })?;
        rec.core.pass = Some(ActivePass {
            color_formats: desc.colors.iter().map(|a| a.format).collect(),
            depth_format: desc.depth.map(|a| a.format),
        });
        rec.core.retain(target);
        rec.core.retain(pass);
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        let mut rec = self.recording()?;
        if rec.core.pass.is_none() {
            return Err(Error::invalid("No render pass to end"));
        }
        rec.emit(Command::EndRenderPass)?;
        rec.core.pass = None;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Binding
    // -----------------------------------------------------------------------

    fn bind_pipeline(&mut self, pipeline: &Arc<PipelineShared<B>>) -> Result<()> {
        if !Arc::ptr_eq(&pipeline.device, &self.shared()?.pool.device) {
            return Err(Error::invalid("Pipeline belongs to another device"));
        }
        let mut rec = self.recording()?;
        rec.emit(Command::BindPipeline(&pipeline.native))?;
        rec.core.retain(pipeline);
        rec.core.pipeline = Some(Arc::clone(pipeline));
        Ok(())
    }

    pub fn bind_graphics_pipeline(&mut self, pipeline: &GraphicsPipeline<B>) -> Result<()> {
        let pipeline = Arc::clone(pipeline.shared()?);
        self.bind_pipeline(&pipeline)
    }

    pub fn bind_compute_pipeline(&mut self, pipeline: &ComputePipeline<B>) -> Result<()> {
        let pipeline = Arc::clone(pipeline.shared()?);
        self.bind_pipeline(&pipeline)
    }

    pub fn bind_ray_tracing_pipeline(&mut self, pipeline: &RayTracingPipeline<B>) -> Result<()> {
        let pipeline = Arc::clone(pipeline.shared()?);
        self.bind_pipeline(&pipeline)
    }

    /// Bind `table` at set `index` of the bound pipeline, whose layout there
    /// must be the table's layout.
    pub fn bind_descriptor_table(&mut self, index: u32, table: &DescriptorTable<B>) -> Result<()> {
        let table = table.shared()?;
        let mut rec = self.recording()?;
        let pipeline = rec
            .core
            .pipeline
            .clone()
            .ok_or_else(|| Error::invalid("No pipeline bound for descriptor table"))?;
        let layout = pipeline
            .layouts
            .get(index as usize)
            .ok_or_else(|| Error::invalid(format!("Pipeline has no descriptor table {index}")))?;
        if !Arc::ptr_eq(layout, &table.layout) {
            return Err(Error::invalid(format!("Descriptor table does not match pipeline layout {index}")));
        }
        rec.emit(Command::BindDescriptorTable {
            pipeline: &pipeline.native,
            index,
            table: &table.native,
        })?;
        rec.core.retain(table);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, slot: u32, buffer: &Buffer<B>, offset: u64) -> Result<()> {
        let buffer = self.check_buffer(buffer)?;
        if !buffer.desc.usage.contains(BufferUsage::VERTEX) {
            return Err(Error::invalid("Buffer lacks VERTEX usage"));
        }
        if offset >= buffer.desc.size {
            return Err(Error::invalid(format!("Vertex offset {offset} past buffer end")));
        }
        let mut rec = self.recording()?;
        rec.emit(Command::BindVertexBuffer {
            slot,
            buffer: &buffer.native,
            offset,
        })?;
        rec.core.retain(buffer);
        Ok(())
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer<B>, offset: u64, format: IndexFormat) -> Result<()> {
        let buffer = self.check_buffer(buffer)?;
        if !buffer.desc.usage.contains(BufferUsage::INDEX) {
            return Err(Error::invalid("Buffer lacks INDEX usage"));
        }
        if !offset.is_multiple_of(format.size()) || offset >= buffer.desc.size {
            return Err(Error::invalid(format!("Bad index buffer offset {offset}")));
        }
        let mut rec = self.recording()?;
        rec.emit(Command::BindIndexBuffer {
            buffer: &buffer.native,
            offset,
            format,
        })?;
        rec.core.retain(buffer);
        rec.core.index_bound = true;
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        let depths = 0.0f32..=1.0;
        if viewport.width <= 0.0 || !depths.contains(&viewport.min_depth) || !depths.contains(&viewport.max_depth) {
            return Err(Error::invalid(format!("Invalid viewport {viewport:?}")));
        }
        self.recording()?.emit(Command::SetViewport(viewport))
    }

    pub fn set_scissor(&mut self, scissor: Rect) -> Result<()> {
        if scissor.x < 0 || scissor.y < 0 {
            return Err(Error::invalid(format!("Scissor origin {scissor:?} is negative")));
        }
        self.recording()?.emit(Command::SetScissor(scissor))
    }

    // -----------------------------------------------------------------------
    // Work
    // -----------------------------------------------------------------------

    fn check_draw(rec: &Recording<'_, B>) -> Result<()> {
        let Some(pass) = &rec.core.pass else {
            return Err(Error::invalid("Draws must be inside a render pass"));
        };
        let pipeline = rec.require_pipeline(PipelineKind::Graphics)?;
        if pipeline.color_formats != pass.color_formats || pipeline.depth_format != pass.depth_format {
            return Err(Error::invalid("Bound pipeline is incompatible with the current render pass"));
        }
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        let mut rec = self.recording()?;
        Self::check_draw(&rec)?;
        rec.emit(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let mut rec = self.recording()?;
        Self::check_draw(&rec)?;
        if !rec.core.index_bound {
            return Err(Error::invalid("No index buffer bound"));
        }
        rec.emit(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let mut rec = self.recording()?;
        rec.require_outside_pass("Dispatch")?;
        rec.require_pipeline(PipelineKind::Compute)?;
        rec.emit(Command::Dispatch { x, y, z })
    }

    /// Trace `width x height x depth` rays with the bound ray tracing
    /// pipeline, which must be the one `sbt` was built from.
    pub fn trace_rays(&mut self, sbt: &ShaderBindingTable<B>, width: u32, height: u32, depth: u32) -> Result<()> {
        let sbt = sbt.shared()?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Trace rays")?;
        let pipeline = rec.require_pipeline(PipelineKind::RayTracing)?;
        if !Arc::ptr_eq(&pipeline, &sbt.pipeline) {
            return Err(Error::invalid("Shader binding table was built for another pipeline"));
        }
        rec.emit(Command::TraceRays {
            regions: &sbt.regions,
            width,
            height,
            depth,
        })?;
        rec.core.retain(sbt);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Acceleration structures
    // -----------------------------------------------------------------------

    pub fn build_bottom_level(&mut self, blas: &AccelerationStructure<B>, mode: BuildMode) -> Result<()> {
        let accel = blas.shared()?;
        let crate::accel::LevelShared::Bottom { geometry, .. } = &accel.level else {
            return Err(Error::invalid("build_bottom_level needs a bottom-level structure"));
        };
        accel.check_build(mode)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Acceleration structure build")?;
        rec.emit(Command::BuildAccelerationStructure {
            dst: &accel.native,
            geometry,
            flags: accel.flags,
            mode,
            scratch_address: accel.scratch_address,
        })?;
        accel.mark_built();
        rec.core.retain(accel);
        Ok(())
    }

    /// Build `tlas` from `count` instance records starting at `offset` in
    /// `instances`.
    pub fn build_top_level(
        &mut self,
        tlas: &AccelerationStructure<B>,
        instances: &Buffer<B>,
        offset: u64,
        count: u32,
        mode: BuildMode,
    ) -> Result<()> {
        let accel = tlas.shared()?;
        let crate::accel::LevelShared::Top { max_instances } = accel.level else {
            return Err(Error::invalid("build_top_level needs a top-level structure"));
        };
        accel.check_build(mode)?;
        let buffer = self.check_buffer(instances)?;
        if !buffer.desc.usage.contains(BufferUsage::ACCELERATION_STRUCTURE_INPUT) {
            return Err(Error::invalid("Instance buffer lacks ACCELERATION_STRUCTURE_INPUT usage"));
        }
        if !offset.is_multiple_of(INSTANCE_ALIGNMENT) {
            return Err(Error::invalid(format!("Instance offset {offset} is not {INSTANCE_ALIGNMENT}-byte aligned")));
        }
        if count == 0 || count > max_instances {
            return Err(Error::invalid(format!("Instance count {count} outside 1..={max_instances}")));
        }
        u64::from(count)
            .checked_mul(INSTANCE_SIZE)
            .and_then(|len| offset.checked_add(len))
            .filter(|&end| end <= buffer.desc.size)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "{count} instances at offset {offset} overrun buffer size {}",
                    buffer.desc.size
                ))
            })?;
        let instance_address = buffer
            .native
            .device_address()
            .ok_or_else(|| Error::invalid("Instance buffer has no device address"))?
            .checked_add(offset)
            .ok_or_else(|| Error::invalid(format!("Instance offset {offset} overflows the device address")))?;
        let geometry = AccelerationStructureGeometry::TopLevel {
            instance_address,
            instance_count: count,
        };

        let mut rec = self.recording()?;
        rec.require_outside_pass("Acceleration structure build")?;
        rec.emit(Command::BuildAccelerationStructure {
            dst: &accel.native,
            geometry: &geometry,
            flags: accel.flags,
            mode,
            scratch_address: accel.scratch_address,
        })?;
        accel.mark_built();
        rec.core.retain(accel);
        rec.core.retain(buffer);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Copies and clears
    // -----------------------------------------------------------------------

    pub fn copy_buffer(
        &mut self,
        src: &Buffer<B>,
        src_offset: u64,
        dst: &Buffer<B>,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let src = self.check_buffer(src)?;
        let dst = self.check_buffer(dst)?;
        check_buffer_copy(src, src_offset, size, true)?;
        check_buffer_copy(dst, dst_offset, size, false)?;
        if Arc::ptr_eq(src, dst) && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(Error::invalid("Copy source and destination overlap"));
        }
        let mut rec = self.recording()?;
        rec.require_outside_pass("Copy")?;
        rec.emit(Command::CopyBuffer {
            src: &src.native,
            src_offset,
            dst: &dst.native,
            dst_offset,
            size,
        })?;
        rec.core.retain(src);
        rec.core.retain(dst);
        Ok(())
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &Buffer<B>,
        src_offset: u64,
        dst: &Image<B>,
        subresource: Subresource,
    ) -> Result<()> {
        let src = self.check_buffer(src)?;
        let dst = self.check_image(dst)?;
        let dst_state = check_image_copy(dst, subresource, false)?;
        check_buffer_copy(src, src_offset, subresource_bytes(dst, subresource), true)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Copy")?;
        rec.emit(Command::CopyBufferToImage {
            src: &src.native,
            src_offset,
            dst: &dst.native,
            dst_state,
            subresource,
        })?;
        rec.core.retain(src);
        rec.core.retain(dst);
        Ok(())
    }

    pub fn copy_image_to_buffer(
        &mut self,
        src: &Image<B>,
        subresource: Subresource,
        dst: &Buffer<B>,
        dst_offset: u64,
    ) -> Result<()> {
        let src = self.check_image(src)?;
        let dst = self.check_buffer(dst)?;
        let src_state = check_image_copy(src, subresource, true)?;
        check_buffer_copy(dst, dst_offset, subresource_bytes(src, subresource), false)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Copy")?;
        rec.emit(Command::CopyImageToBuffer {
            src: &src.native,
            src_state,
            subresource,
            dst: &dst.native,
            dst_offset,
        })?;
        rec.core.retain(src);
        rec.core.retain(dst);
        Ok(())
    }

    pub fn copy_image(
        &mut self,
        src: &Image<B>,
        src_subresource: Subresource,
        dst: &Image<B>,
        dst_subresource: Subresource,
    ) -> Result<()> {
        let src = self.check_image(src)?;
        let dst = self.check_image(dst)?;
        if Arc::ptr_eq(src, dst) && src_subresource == dst_subresource {
            return Err(Error::invalid("Cannot copy a subresource onto itself"));
        }
        if src.desc.format != dst.desc.format {
            return Err(Error::invalid(format!(
                "Copy between {:?} and {:?} images",
                src.desc.format, dst.desc.format
            )));
        }
        let src_state = check_image_copy(src, src_subresource, true)?;
        let dst_state = check_image_copy(dst, dst_subresource, false)?;
        let src_extent = subresource_extent(src, src_subresource);
        let dst_extent = subresource_extent(dst, dst_subresource);
        if src_extent != dst_extent {
            return Err(Error::invalid(format!("Copy extents {src_extent:?} and {dst_extent:?} differ")));
        }
        let mut rec = self.recording()?;
        rec.require_outside_pass("Copy")?;
        rec.emit(Command::CopyImage {
            src: &src.native,
            src_state,
            src_subresource,
            dst: &dst.native,
            dst_state,
            dst_subresource,
        })?;
        rec.core.retain(src);
        rec.core.retain(dst);
        Ok(())
    }

    /// Clear every subresource of a color image.
    pub fn clear_color(&mut self, image: &Image<B>, color: [f32; 4]) -> Result<()> {
        let range = image.desc()?.full_range();
        self.clear_color_range(image, range, color)
    }

    pub fn clear_color_range(&mut self, image: &Image<B>, range: SubresourceRange, color: [f32; 4]) -> Result<()> {
        let image = self.check_image(image)?;
        if image.desc.format.is_depth() {
            return Err(Error::invalid("clear_color on a depth image"));
        }
        let state = check_clear(image, range)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Clear")?;
        rec.emit(Command::ClearColor {
            image: &image.native,
            state,
            range,
            color,
        })?;
        rec.core.retain(image);
        Ok(())
    }

    pub fn clear_depth(&mut self, image: &Image<B>, depth: f32) -> Result<()> {
        let image = self.check_image(image)?;
        if !image.desc.format.is_depth() {
            return Err(Error::invalid("clear_depth on a color image"));
        }
        if !(0.0..=1.0).contains(&depth) {
            return Err(Error::invalid(format!("Depth clear value {depth} outside 0..=1")));
        }
        let range = image.desc.full_range();
        let state = check_clear(image, range)?;
        let mut rec = self.recording()?;
        rec.require_outside_pass("Clear")?;
        rec.emit(Command::ClearDepth {
            image: &image.native,
            state,
            range,
            depth,
        })?;
        rec.core.retain(image);
        Ok(())
    }
}

fn check_buffer_copy<B: Backend>(buffer: &BufferShared<B>, offset: u64, size: u64, source: bool) -> Result<()> {
    let (usage, state) = (buffer.desc.usage, *lock(&buffer.state));
    let (needed, state_ok) = if source {
        (BufferUsage::TRANSFER_SRC, state.is_copy_source())
    } else {
        (BufferUsage::TRANSFER_DST, state.is_copy_destination())
    };
    if !usage.contains(needed) {
        return Err(Error::invalid(format!("Buffer lacks {needed:?} usage")));
    }
    if !state_ok {
        return Err(Error::invalid(format!("Buffer is in {state:?}, not a copy state")));
    }
    if size == 0 || offset.checked_add(size).is_none_or(|end| end > buffer.desc.size) {
        return Err(Error::invalid(format!(
            "Copy range {offset}+{size} outside buffer of {}",
            buffer.desc.size
        )));
    }
    Ok(())
}

fn check_image_copy<B: Backend>(image: &ImageShared<B>, sub: Subresource, source: bool) -> Result<ResourceState> {
    let (needed, what) = if source {
        (ImageUsage::TRANSFER_SRC, "source")
    } else {
        (ImageUsage::TRANSFER_DST, "destination")
    };
    if !image.desc.usage.contains(needed) {
        return Err(Error::invalid(format!("Copy {what} image lacks {needed:?} usage")));
    }
    if image.desc.format.has_stencil() {
        return Err(Error::invalid("Copies of combined depth/stencil images are not supported"));
    }
    let state = lock(&image.states).get(sub)?;
    let ok = if source { state.is_copy_source() } else { state.is_copy_destination() };
    if !ok {
        return Err(Error::invalid(format!("Copy {what} is in {state:?}")));
    }
    Ok(state)
}

fn check_clear<B: Backend>(image: &ImageShared<B>, range: SubresourceRange) -> Result<ResourceState> {
    if !image.desc.usage.contains(ImageUsage::TRANSFER_DST) {
        return Err(Error::invalid("Cleared image lacks TRANSFER_DST usage"));
    }
    let states = lock(&image.states);
    states.validate_range(range)?;
    match states.uniform_state(range) {
        Some(state) if state.is_copy_destination() => Ok(state),
        Some(state) => Err(Error::invalid(format!("Cleared image is in {state:?}, not TransferDst or Common"))),
        None => Err(Error::invalid("Cleared range is in mixed states")),
    }
}

fn subresource_extent<B: Backend>(image: &ImageShared<B>, sub: Subresource) -> (u32, u32, u32) {
    crate::backend::mip_extent(image.desc.width, image.desc.height, image.desc.depth, sub.mip)
}

/// Tightly packed byte size of one subresource.
fn subresource_bytes<B: Backend>(image: &ImageShared<B>, sub: Subresource) -> u64 {
    let (w, h, d) = subresource_extent(image, sub);
    u64::from(w) * u64::from(h) * u64::from(d) * u64::from(image.desc.format.bytes_per_texel())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Soft;
    use crate::buffer::{BufferDesc, MemoryLocality};
    use crate::device::{Device, QueueKind};
    use crate::image::ImageDesc;
    use crate::test_support::{soft_device, soft_device_with};
    use crate::backend::soft::SoftAdapterConfig;

    fn color_image(device: &Device<Soft>) -> Image<Soft> {
        device
            .create_image(&ImageDesc::texture_2d(
                2,
                2,
                Format::Rgba8Unorm,
                ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST | ImageUsage::COLOR_ATTACHMENT,
            ))
            .unwrap()
    }

    fn readback(device: &Device<Soft>, size: u64) -> Buffer<Soft> {
        device
            .create_buffer(&BufferDesc {
                size,
                usage: BufferUsage::TRANSFER_DST,
                locality: MemoryLocality::Readback,
                name: None,
            })
            .unwrap()
    }

    #[test]
    fn begin_is_idempotent_and_end_wait_begin_reaches_recording() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Initial);
        list.end().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Initial);
        list.wait(None).unwrap();

        list.begin().unwrap();
        list.begin().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Recording);
        list.end().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Closed);
        device.record(&list).unwrap();
        device.submit().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Submitted);
        list.wait(None).unwrap();
        assert_eq!(list.state().unwrap(), ListState::Complete);
        list.begin().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Recording);
    }

    #[test]
    fn begin_after_submit_waits_for_the_fence() {
        let (_system, device) = soft_device_with(SoftAdapterConfig {
            execution_delay: Duration::from_millis(30),
            ..SoftAdapterConfig::default()
        });
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        assert_eq!(list.wait(Some(Duration::ZERO)).unwrap_err().code(), crate::ResultCode::TimeOut);
        list.begin().unwrap();
        assert_eq!(list.state().unwrap(), ListState::Recording);
    }

    #[test]
    fn recording_requires_an_open_list() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);
        let err = list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst).unwrap_err();
        assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
    }

    #[test]
    fn barrier_round_trip_resolves_current_to_last_destination() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);

        list.begin().unwrap();
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst).unwrap();
        list.image_barrier(&image, SourceState::Current, ResourceState::ShaderRead).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
        assert_eq!(image.uniform_state().unwrap(), Some(ResourceState::ShaderRead));

        list.begin().unwrap();
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
        assert_eq!(image.state(Subresource::default()).unwrap(), ResourceState::TransferSrc);
        assert_eq!(device.stats().unwrap().validation_errors, 0);
    }

    #[test]
    fn wrong_known_source_is_a_validation_error() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);
        list.begin().unwrap();
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst).unwrap();
        list.image_barrier(&image, SourceState::Known(ResourceState::ShaderRead), ResourceState::Common)
            .unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
        assert_eq!(device.stats().unwrap().validation_errors, 1);
    }

    #[test]
    fn mixed_subresources_transition_individually() {
        let (_system, device) = soft_device();
        let image = device
            .create_image(&ImageDesc {
                mip_levels: 2,
                ..ImageDesc::texture_2d(4, 4, Format::Rgba8Unorm, ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST)
            })
            .unwrap();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.image_subresource_barrier(&image, Subresource::new(1, 0), SourceState::Current, ResourceState::TransferDst)
            .unwrap();
        assert_eq!(image.state(Subresource::new(0, 0)).unwrap(), ResourceState::Undefined);
        assert_eq!(image.uniform_state().unwrap(), None);
        list.image_barrier(&image, SourceState::Current, ResourceState::ShaderRead).unwrap();
        assert_eq!(image.uniform_state().unwrap(), Some(ResourceState::ShaderRead));
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
        assert_eq!(device.stats().unwrap().validation_errors, 0);
    }

    #[test]
    fn invalid_states_for_resource_kind_are_rejected() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);
        let buffer = readback(&device, 16);
        list.begin().unwrap();
        assert!(list.buffer_barrier(&buffer, SourceState::Current, ResourceState::Present).is_err());
        assert!(list.image_barrier(&image, SourceState::Current, ResourceState::VertexBuffer).is_err());
        list.buffer_barrier(&buffer, SourceState::Current, ResourceState::TransferDst).unwrap();
        assert_eq!(buffer.state().unwrap(), ResourceState::TransferDst);
    }

    #[test]
    fn copies_and_clears_check_tracked_state() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);
        let buffer = readback(&device, 16);
        list.begin().unwrap();
        // Undefined is neither a clear nor a copy state.
        assert!(list.clear_color(&image, [1.0; 4]).is_err());
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferDst).unwrap();
        list.clear_color(&image, [0.0, 0.2, 0.4, 1.0]).unwrap();
        assert!(list.copy_image_to_buffer(&image, Subresource::default(), &buffer, 0).is_err());
        list.image_barrier(&image, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.copy_image_to_buffer(&image, Subresource::default(), &buffer, 0).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
        let mut bytes = [0u8; 16];
        buffer.read(0, &mut bytes).unwrap();
        assert_eq!(bytes[..4], [0, 51, 102, 255]);
        assert_eq!(bytes[12..], [0, 51, 102, 255]);
    }

    #[test]
    fn draws_need_a_render_pass_and_copies_must_be_outside_one() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let image = color_image(&device);
        let mut pass = RenderPass::new();
        pass.initialize(&device, &crate::pass::RenderPassDesc {
            colors: vec![crate::pass::AttachmentDesc::new(Format::Rgba8Unorm)],
            ..Default::default()
        })
        .unwrap();
        let mut target = RenderTarget::new();
        target
            .initialize(&device, &crate::pass::RenderTargetDesc {
                colors: vec![crate::pass::RenderTargetAttachment::new(&image)],
                ..Default::default()
            })
            .unwrap();

        list.begin().unwrap();
        assert!(list.draw(3, 1, 0, 0).is_err());
        let clear = [ClearValue::Color([0.0; 4])];
        // Attachment still Undefined.
        assert!(list.begin_render_pass(&pass, &target, &clear).is_err());
        list.image_barrier(&image, SourceState::Current, ResourceState::ColorWrite).unwrap();
        assert!(list.begin_render_pass(&pass, &target, &[]).is_err());
        list.begin_render_pass(&pass, &target, &clear).unwrap();
        assert!(list.clear_color(&image, [0.0; 4]).is_err());
        assert!(list.image_barrier(&image, SourceState::Current, ResourceState::TransferSrc).is_err());
        // No pipeline bound.
        assert!(list.draw(3, 1, 0, 0).is_err());
        assert!(list.end().is_err());
        list.end_render_pass().unwrap();
        list.end().unwrap();
    }

    fn dispatch_with_table(device: &Device<Soft>, ranges: Vec<crate::descriptor::DescriptorRange>, write: u32) {
        use crate::descriptor::{DescriptorTableDesc, DescriptorTableLayoutDesc};
        use crate::pipeline::ComputePipelineDesc;
        use crate::shader::{ShaderDesc, ShaderStage};

        let code = crate::test_support::fake_spirv();
        let cs = device
            .create_shader(&ShaderDesc { code: &code, entry: "main".into(), stage: ShaderStage::Compute, name: None })
            .unwrap();
        let layout = device
            .create_descriptor_table_layout(&DescriptorTableLayoutDesc { ranges, name: None })
            .unwrap();
        let pipeline = device
            .create_compute_pipeline(&ComputePipelineDesc {
                shader: cs.entry().unwrap(),
                layouts: vec![layout.clone()],
                name: None,
            })
            .unwrap();
        let table = device
            .create_descriptor_table(&DescriptorTableDesc { layout, variable_count: None, name: None })
            .unwrap();
        let texture = device
            .create_image(&ImageDesc::texture_2d(2, 2, Format::Rgba8Unorm, ImageUsage::SAMPLED))
            .unwrap();
        for index in 0..write {
            table.set_image(0, index, &texture).unwrap();
        }

        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.bind_compute_pipeline(&pipeline).unwrap();
        list.bind_descriptor_table(0, &table).unwrap();
        list.dispatch(1, 1, 1).unwrap();
        list.end().unwrap();
        device.record(&list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
    }

    #[test]
    fn partially_written_dynamic_range_dispatches_cleanly() {
        use crate::binding::DescriptorType;
        use crate::descriptor::DescriptorRange;
        use crate::shader::ShaderStages;

        let (_system, device) = soft_device();
        let range = DescriptorRange::dynamic(DescriptorType::Texture, 0, 16, ShaderStages::COMPUTE);
        dispatch_with_table(&device, vec![range], 3);
        let stats = device.stats().unwrap();
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn partially_written_fixed_range_is_reported() {
        use crate::binding::DescriptorType;
        use crate::descriptor::DescriptorRange;
        use crate::shader::ShaderStages;

        let (_system, device) = soft_device();
        let range = DescriptorRange::new(DescriptorType::Texture, 0, 4, ShaderStages::COMPUTE);
        dispatch_with_table(&device, vec![range], 3);
        assert_eq!(device.stats().unwrap().validation_errors, 1);
    }

    fn buffer(device: &Device<Soft>, size: u64, usage: BufferUsage, locality: MemoryLocality) -> Buffer<Soft> {
        device.create_buffer(&BufferDesc { size, usage, locality, name: None }).unwrap()
    }

    fn submit_and_wait(device: &Device<Soft>, list: &CommandList<Soft>) {
        device.record(list).unwrap();
        device.submit().unwrap();
        list.wait(None).unwrap();
    }

    #[test]
    fn lists_execute_in_record_order_across_queue_kinds() {
        let (_system, device) = soft_device();
        let copy = BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST;
        let a = buffer(&device, 4, copy, MemoryLocality::Upload);
        let b = buffer(&device, 4, copy, MemoryLocality::Device);
        let c = buffer(&device, 4, copy, MemoryLocality::Readback);
        a.write(0, &[7; 4]).unwrap();

        let transfer = device.create_worker_pool(QueueKind::Transfer).unwrap();
        let graphics = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut first = transfer.create_command_list().unwrap();
        let mut second = graphics.create_command_list().unwrap();
        first.begin().unwrap();
        first.copy_buffer(&a, 0, &b, 0, 4).unwrap();
        first.end().unwrap();
        second.begin().unwrap();
        second.copy_buffer(&b, 0, &c, 0, 4).unwrap();
        second.end().unwrap();

        device.record(&first).unwrap();
        device.record(&second).unwrap();
        device.submit().unwrap();
        first.wait(None).unwrap();
        second.wait(None).unwrap();

        let mut bytes = [0u8; 4];
        c.read(0, &mut bytes).unwrap();
        assert_eq!(bytes, [7; 4]);
        let stats = device.stats().unwrap();
        assert_eq!(stats.submissions, 2);
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn buffer_and_image_copies_move_bytes() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let texels: Vec<u8> = (0..16).collect();
        let upload = buffer(&device, 16, BufferUsage::TRANSFER_SRC, MemoryLocality::Upload);
        upload.write(0, &texels).unwrap();
        let copy = BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST;
        let staging = buffer(&device, 32, copy, MemoryLocality::Device);
        let first = color_image(&device);
        let second = color_image(&device);
        let out = readback(&device, 16);

        list.begin().unwrap();
        list.copy_buffer(&upload, 0, &staging, 16, 16).unwrap();
        list.buffer_barrier(&staging, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.image_barrier(&first, SourceState::Current, ResourceState::TransferDst).unwrap();
        list.copy_buffer_to_image(&staging, 16, &first, Subresource::default()).unwrap();
        list.image_barrier(&first, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.image_barrier(&second, SourceState::Current, ResourceState::TransferDst).unwrap();
        list.copy_image(&first, Subresource::default(), &second, Subresource::default()).unwrap();
        list.image_barrier(&second, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.copy_image_to_buffer(&second, Subresource::default(), &out, 0).unwrap();
        list.end().unwrap();
        submit_and_wait(&device, &list);

        let mut bytes = [0u8; 16];
        out.read(0, &mut bytes).unwrap();
        assert_eq!(bytes.to_vec(), texels);
        assert_eq!(device.stats().unwrap().validation_errors, 0);
    }

    #[test]
    fn copy_image_rejects_a_missing_mip() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let src = color_image(&device);
        let dst = color_image(&device);
        list.begin().unwrap();
        list.image_barrier(&src, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.image_barrier(&dst, SourceState::Current, ResourceState::TransferDst).unwrap();
        for mip in [1, 40] {
            let err = list.copy_image(&src, Subresource::new(mip, 0), &dst, Subresource::default()).unwrap_err();
            assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
            let err = list.copy_image(&src, Subresource::default(), &dst, Subresource::new(mip, 0)).unwrap_err();
            assert_eq!(err.code(), crate::ResultCode::InvalidArgs);
        }
        assert_eq!(list.state().unwrap(), ListState::Recording);
    }

    #[test]
    fn clear_depth_fills_every_texel() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        let depth = device
            .create_image(&ImageDesc::texture_2d(
                2,
                1,
                Format::D32Float,
                ImageUsage::DEPTH_ATTACHMENT | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST,
            ))
            .unwrap();
        let out = readback(&device, 8);
        list.begin().unwrap();
        list.image_barrier(&depth, SourceState::Current, ResourceState::TransferDst).unwrap();
        assert!(list.clear_depth(&depth, 1.5).is_err());
        assert!(list.clear_color(&depth, [0.0; 4]).is_err());
        list.clear_depth(&depth, 0.25).unwrap();
        list.image_barrier(&depth, SourceState::Current, ResourceState::TransferSrc).unwrap();
        list.copy_image_to_buffer(&depth, Subresource::default(), &out, 0).unwrap();
        list.end().unwrap();
        submit_and_wait(&device, &list);

        let mut bytes = [0u8; 8];
        out.read(0, &mut bytes).unwrap();
        let expected = 0.25f32.to_le_bytes();
        assert_eq!(bytes[..4], expected);
        assert_eq!(bytes[4..], expected);
        assert_eq!(device.stats().unwrap().validation_errors, 0);
    }

    /// A vertex-only pipeline for a single Rgba8Unorm color pass, with one
    /// table holding a dynamic texture range.
    fn draw_setup(
        device: &Device<Soft>,
    ) -> (RenderPass<Soft>, GraphicsPipeline<Soft>, crate::descriptor::DescriptorTable<Soft>) {
        use crate::binding::DescriptorType;
        use crate::descriptor::{DescriptorRange, DescriptorTableDesc, DescriptorTableLayoutDesc};
        use crate::pipeline::{
            DepthStencilState, GraphicsPipelineDesc, PrimitiveTopology, RasterizerState, VertexAttribute,
            VertexBufferLayout, VertexStepMode,
        };
        use crate::shader::{ShaderDesc, ShaderStage, ShaderStages};

        let code = crate::test_support::fake_spirv();
        let vs = device
            .create_shader(&ShaderDesc { code: &code, entry: "vs".into(), stage: ShaderStage::Vertex, name: None })
            .unwrap();
        let mut pass = RenderPass::new();
        pass.initialize(device, &crate::pass::RenderPassDesc {
            colors: vec![crate::pass::AttachmentDesc::new(Format::Rgba8Unorm)],
            ..Default::default()
        })
        .unwrap();
        let layout = device
            .create_descriptor_table_layout(&DescriptorTableLayoutDesc {
                ranges: vec![DescriptorRange::dynamic(DescriptorType::Texture, 0, 8, ShaderStages::VERTEX)],
                name: None,
            })
            .unwrap();
        let pipeline = device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                vertex: vs.entry().unwrap(),
                fragment: None,
                layouts: vec![layout.clone()],
                vertex_buffers: vec![VertexBufferLayout {
                    stride: 12,
                    step: VertexStepMode::Vertex,
                    attributes: vec![VertexAttribute { location: 0, format: Format::Rgb32Float, offset: 0 }],
                }],
                topology: PrimitiveTopology::TriangleList,
                rasterizer: RasterizerState::default(),
                depth_stencil: DepthStencilState::default(),
                blend: Vec::new(),
                pass: pass.clone(),
                name: None,
            })
            .unwrap();
        let table = device
            .create_descriptor_table(&DescriptorTableDesc { layout, variable_count: None, name: None })
            .unwrap();
        (pass, pipeline, table)
    }

    #[test]
    fn indexed_and_plain_draws_with_a_partially_written_dynamic_range() {
        let (_system, device) = soft_device();
        let (pass, pipeline, table) = draw_setup(&device);
        let texture = device
            .create_image(&ImageDesc::texture_2d(2, 2, Format::Rgba8Unorm, ImageUsage::SAMPLED))
            .unwrap();
        for index in 0..2 {
            table.set_image(0, index, &texture).unwrap();
        }
        let image = color_image(&device);
        let mut target = RenderTarget::new();
        target
            .initialize(&device, &crate::pass::RenderTargetDesc {
                colors: vec![crate::pass::RenderTargetAttachment::new(&image)],
                ..Default::default()
            })
            .unwrap();
        let vertices = buffer(&device, 36, BufferUsage::VERTEX, MemoryLocality::Upload);
        let indices = buffer(&device, 6, BufferUsage::INDEX, MemoryLocality::Upload);
        indices.write(0, bytemuck::cast_slice(&[0u16, 1, 2])).unwrap();

        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        list.image_barrier(&image, SourceState::Current, ResourceState::ColorWrite).unwrap();
        list.begin_render_pass(&pass, &target, &[ClearValue::Color([0.0; 4])]).unwrap();
        list.bind_graphics_pipeline(&pipeline).unwrap();
        list.bind_descriptor_table(0, &table).unwrap();
        assert!(list.bind_vertex_buffer(0, &indices, 0).is_err());
        assert!(list.bind_vertex_buffer(0, &vertices, 36).is_err());
        list.bind_vertex_buffer(0, &vertices, 0).unwrap();
        assert!(list.set_viewport(Viewport { max_depth: 2.0, ..Viewport::full(2, 2) }).is_err());
        list.set_viewport(Viewport::full(2, 2)).unwrap();
        list.set_scissor(Rect { x: 0, y: 0, width: 2, height: 2 }).unwrap();
        list.draw(3, 1, 0, 0).unwrap();
        assert!(list.draw_indexed(3, 1, 0, 0, 0).is_err());
        assert!(list.bind_index_buffer(&indices, 1, IndexFormat::U16).is_err());
        list.bind_index_buffer(&indices, 0, IndexFormat::U16).unwrap();
        list.draw_indexed(3, 2, 0, 0, 0).unwrap();
        list.end_render_pass().unwrap();
        list.end().unwrap();
        submit_and_wait(&device, &list);

        let stats = device.stats().unwrap();
        assert_eq!(stats.draws, 2);
        assert_eq!(stats.validation_errors, 0);
    }

    #[test]
    fn trace_rays_uses_the_table_of_the_bound_pipeline() {
        use crate::raytracing::{RayTracingPipelineDesc, ShaderBindingTableDesc, ShaderGroup};
        use crate::shader::{ShaderLibrary, ShaderLibraryDesc, ShaderStage};

        let (_system, device) = soft_device();
        let code = crate::test_support::fake_spirv();
        let mut library = ShaderLibrary::new();
        library
            .initialize(&device, &ShaderLibraryDesc {
                code: &code,
                entries: vec![
                    ("raygen".to_owned(), ShaderStage::RayGeneration),
                    ("miss".to_owned(), ShaderStage::Miss),
                    ("hit".to_owned(), ShaderStage::ClosestHit),
                ],
                name: None,
            })
            .unwrap();
        let desc = RayTracingPipelineDesc {
            stages: vec![
                library.entry("raygen").unwrap(),
                library.entry("miss").unwrap(),
                library.entry("hit").unwrap(),
            ],
            groups: vec![
                ShaderGroup::General(0),
                ShaderGroup::General(1),
                ShaderGroup::TrianglesHit { closest_hit: Some(2), any_hit: None },
            ],
            max_recursion_depth: 1,
            layouts: Vec::new(),
            name: None,
        };
        let pipeline = device.create_ray_tracing_pipeline(&desc).unwrap();
        let other = device.create_ray_tracing_pipeline(&desc).unwrap();
        let sbt_desc = |pipeline: &RayTracingPipeline<Soft>| ShaderBindingTableDesc {
            pipeline: pipeline.clone(),
            raygen: 0,
            miss: vec![1],
            hit: vec![2],
            callable: Vec::new(),
            name: None,
        };
        let mut sbt = ShaderBindingTable::new();
        sbt.initialize(&device, &sbt_desc(&pipeline)).unwrap();
        let mut foreign = ShaderBindingTable::new();
        foreign.initialize(&device, &sbt_desc(&other)).unwrap();

        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        let mut list = pool.create_command_list().unwrap();
        list.begin().unwrap();
        assert!(list.trace_rays(&sbt, 4, 4, 1).is_err());
        list.bind_ray_tracing_pipeline(&pipeline).unwrap();
        assert!(list.trace_rays(&foreign, 4, 4, 1).is_err());
        list.trace_rays(&sbt, 4, 4, 1).unwrap();
        list.end().unwrap();
        submit_and_wait(&device, &list);

        let stats = device.stats().unwrap();
        assert_eq!(stats.traces, 1);
        assert_eq!(stats.validation_errors, 0);
    }
}

//! Logical devices, worker pools and submission.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::accel::{AccelerationStructure, AccelerationStructureDesc};
use crate::backend::{Backend, DeviceApi, DeviceFeatures, InstanceApi, SubmitInfo};
use crate::buffer::{Buffer, BufferDesc};
use crate::canvas::{Canvas, CanvasDesc};
use crate::capability::PhysicalDeviceDescriptor;
use crate::command::{CommandList, ListCore, ListShared, ListState};
use crate::descriptor::{DescriptorTable, DescriptorTableDesc, DescriptorTableLayout, DescriptorTableLayoutDesc};
use crate::error::{Error, Result};
use crate::image::{Image, ImageDesc};
use crate::lock;
use crate::pipeline::{ComputePipeline, ComputePipelineDesc, GraphicsPipeline, GraphicsPipelineDesc};
use crate::raytracing::{RayTracingPipeline, RayTracingPipelineDesc};
use crate::sampler::{Sampler, SamplerDesc};
use crate::shader::{Shader, ShaderDesc};
use crate::system::{System, SystemShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

/// How queue kinds map onto native queue families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Use dedicated compute and transfer families when available.
    #[default]
    Auto,
    /// All kinds on the graphics family, on separate queues where possible.
    Unified,
    /// All kinds share one queue.
    Single,
}

#[derive(Debug, Clone)]
pub struct DeviceDesc {
    /// Registry index of the adapter; `None` picks the best scoring one.
    pub adapter: Option<usize>,
    /// Enable ray tracing when the adapter supports it.
    pub ray_tracing: bool,
    /// Enable descriptor indexing when the adapter supports it.
    pub descriptor_indexing: bool,
    pub name: Option<String>,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            adapter: None,
            ray_tracing: true,
            descriptor_indexing: true,
            name: None,
        }
    }
}

pub(crate) struct DeviceShared<B: Backend> {
    pub(crate) native: B::Device,
    pub(crate) descriptor: PhysicalDeviceDescriptor,
    pub(crate) features: DeviceFeatures,
    pending: Mutex<Vec<Arc<ListShared<B>>>>,
    pools: Mutex<Vec<Weak<WorkerPoolShared<B>>>>,
    // Declared after native so the instance outlives the device.
    pub(crate) system: Arc<SystemShared<B>>,
}

impl<B: Backend> Drop for DeviceShared<B> {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.descriptor.name);
        if let Err(e) = self.native.wait_idle() {
            tracing::error!("Error waiting for device idle on drop: {}", e);
        }
    }
}

impl<B: Backend> DeviceShared<B> {
    pub(crate) fn require_ray_tracing(&self, what: &'static str) -> Result<()> {
        if self.features.ray_tracing {
            Ok(())
        } else {
            Err(Error::not_implemented(what))
        }
    }

    /// Remove `list` from the pending queue if it is there.
    pub(crate) fn dequeue(&self, list: &Arc<ListShared<B>>) {
        lock(&self.pending).retain(|l| !Arc::ptr_eq(l, list));
    }
}

/// A logical device: the root of resource creation and submission.
pub struct Device<B: Backend> {
    shared: Option<Arc<DeviceShared<B>>>,
}

impl<B: Backend> Default for Device<B> {
    fn default() -> Self {
        Self { shared: None }
    }
}

impl<B: Backend> Clone for Device<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Device<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &B::NAME)
            .field("adapter", &self.shared.as_ref().map(|s| &s.descriptor.name))
            .finish_non_exhaustive()
    }
}

impl<B: Backend> Device<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&mut self, system: &System<B>, desc: &DeviceDesc) -> Result<()> {
        self.deinitialize();
        let system = system.shared()?;
        let adapter = match desc.adapter {
            Some(index) => system
                .registry
                .get(index)
                .ok_or_else(|| Error::invalid(format!("No adapter with index {index}")))?,
            None => system
                .registry
                .best()
                .ok_or_else(|| Error::failure("Creating device", "no suitable adapter"))?,
        };
        let features = DeviceFeatures {
            ray_tracing: desc.ray_tracing && adapter.ray_tracing_supported,
            descriptor_indexing: desc.descriptor_indexing && adapter.descriptor_indexing_supported,
        };
        tracing::info!(
            "Selected adapter {} ({:?}, dedicated queues: {}, features: {:?})",
            adapter.name,
            adapter.kind,
            adapter.dedicated_queue_count,
            features
        );
        let native = system
            .instance
            .create_device(adapter, &features, desc.name.as_deref())?;
        self.shared = Some(Arc::new(DeviceShared {
            native,
            descriptor: adapter.clone(),
            features,
            pending: Mutex::new(Vec::new()),
            pools: Mutex::new(Vec::new()),
            system: Arc::clone(system),
        }));
        Ok(())
    }

    pub fn deinitialize(&mut self) {
        self.shared = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    pub(crate) fn shared(&self) -> Result<&Arc<DeviceShared<B>>> {
        self.shared.as_ref().ok_or(Error::NotInitialized("Device"))
    }

    pub(crate) fn from_shared(shared: Arc<DeviceShared<B>>) -> Self {
        Self { shared: Some(shared) }
    }

    pub fn descriptor(&self) -> Result<&PhysicalDeviceDescriptor> {
        Ok(&self.shared()?.descriptor)
    }

    pub fn features(&self) -> Result<DeviceFeatures> {
        Ok(self.shared()?.features)
    }

    /// The native back-end device.
    pub fn native(&self) -> Result<&B::Device> {
        Ok(&self.shared()?.native)
    }

    pub fn create_worker_pool(&self, queue: QueueKind) -> Result<WorkerPool<B>> {
        let shared = self.shared()?;
        let native = shared.native.create_command_pool(queue, None)?;
        let pool = Arc::new(WorkerPoolShared {
            native: Mutex::new(native),
            queue,
            device: Arc::clone(shared),
        });
        let mut pools = lock(&shared.pools);
        pools.retain(|p| p.strong_count() > 0);
        pools.push(Arc::downgrade(&pool));
        Ok(WorkerPool { shared: pool })
    }

    /// Queue a closed list for the next [`submit`](Self::submit).
    pub fn record(&self, list: &CommandList<B>) -> Result<()> {
        let shared = self.shared()?;
        let list = list.shared()?;
        if !Arc::ptr_eq(&list.pool.device, shared) {
            return Err(Error::invalid("Command list belongs to another device"));
        }
        let mut pending = lock(&shared.pending);
        let mut core = lock(&list.core);
        if core.queued {
            return Err(Error::invalid("Command list is already queued"));
        }
        if core.state != ListState::Closed {
            return Err(Error::invalid(format!(
                "Only closed command lists can be recorded, list is {:?}",
                core.state
            )));
        }
        core.queued = true;
        pending.push(Arc::clone(list));
        Ok(())
    }

    /// Submit every queued list in the order it was recorded. Consecutive
    /// lists for the same queue kind share one native batch.
    pub fn submit(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut pending = lock(&shared.pending);
        if pending.is_empty() {
            return Ok(());
        }

        let pools: Vec<Arc<WorkerPoolShared<B>>> = {
            let mut registry = lock(&shared.pools);
            registry.retain(|p| p.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        let _pool_guards: Vec<MutexGuard<'_, B::CommandPool>> =
            pools.iter().map(|p| lock(&p.native)).collect();

        let lists = std::mem::take(&mut *pending);
        let mut cores: Vec<MutexGuard<'_, ListCore<B>>> =
            lists.iter().map(|l| lock(&l.core)).collect();

        let mut submitted = 0;
        let mut result = Ok(());
        for (start, end) in batch_bounds(lists.iter().map(|l| l.pool.queue)) {
            let infos: Vec<SubmitInfo<'_, B>> = lists[start..end]
                .iter()
                .zip(cores[start..end].iter())
                .map(|(list, core)| SubmitInfo {
                    command_buffer: &core.native,
                    wait_semaphores: core.wait_semaphores.iter().map(|s| s.as_ref()).collect(),
                    signal_semaphores: core.signal_semaphores.iter().map(|s| s.as_ref()).collect(),
                    fence: &list.fence,
                })
                .collect();
            if let Err(e) = shared.native.submit(lists[start].pool.queue, &infos) {
                result = Err(e);
                break;
            }
            submitted = end;
        }

        for (index, core) in cores.iter_mut().enumerate() {
            core.queued = false;
            if index < submitted {
                core.state = ListState::Submitted;
            }
        }
        result
    }

    /// Block until all submitted work completes.
    pub fn wait_idle(&self) -> Result<()> {
        self.shared()?.native.wait_idle()
    }

    // -----------------------------------------------------------------------
    // Initialized conveniences
    // -----------------------------------------------------------------------

    pub fn create_image(&self, desc: &ImageDesc) -> Result<Image<B>> {
        let mut image = Image::new();
        image.initialize(self, desc)?;
        Ok(image)
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Buffer<B>> {
        let mut buffer = Buffer::new();
        buffer.initialize(self, desc)?;
        Ok(buffer)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Sampler<B>> {
        let mut sampler = Sampler::new();
        sampler.initialize(self, desc)?;
        Ok(sampler)
    }

    pub fn create_shader(&self, desc: &ShaderDesc<'_>) -> Result<Shader<B>> {
        let mut shader = Shader::new();
        shader.initialize(self, desc)?;
        Ok(shader)
    }

    pub fn create_descriptor_table_layout(&self, desc: &DescriptorTableLayoutDesc) -> Result<DescriptorTableLayout<B>> {
        let mut layout = DescriptorTableLayout::new();
        layout.initialize(self, desc)?;
        Ok(layout)
    }

    pub fn create_descriptor_table(&self, desc: &DescriptorTableDesc<B>) -> Result<DescriptorTable<B>> {
        let mut table = DescriptorTable::new();
        table.initialize(self, desc)?;
        Ok(table)
    }

    pub fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<B>) -> Result<GraphicsPipeline<B>> {
        let mut pipeline = GraphicsPipeline::new();
        pipeline.initialize(self, desc)?;
        Ok(pipeline)
    }

    pub fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<B>) -> Result<ComputePipeline<B>> {
        let mut pipeline = ComputePipeline::new();
        pipeline.initialize(self, desc)?;
        Ok(pipeline)
    }

    pub fn create_ray_tracing_pipeline(&self, desc: &RayTracingPipelineDesc<B>) -> Result<RayTracingPipeline<B>> {
        let mut pipeline = RayTracingPipeline::new();
        pipeline.initialize(self, desc)?;
        Ok(pipeline)
    }

    pub fn create_acceleration_structure(
        &self,
        desc: &AccelerationStructureDesc<B>,
    ) -> Result<AccelerationStructure<B>> {
        let mut accel = AccelerationStructure::new();
        accel.initialize(self, desc)?;
        Ok(accel)
    }

    pub fn create_canvas(&self, desc: &CanvasDesc) -> Result<Canvas<B>> {
        let mut canvas = Canvas::new();
        canvas.initialize(self, desc)?;
        Ok(canvas)
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

pub(crate) struct WorkerPoolShared<B: Backend> {
    pub(crate) native: Mutex<B::CommandPool>,
    pub(crate) queue: QueueKind,
    pub(crate) device: Arc<DeviceShared<B>>,
}

/// A per-worker command pool. Lists allocated from it record under its lock.
pub struct WorkerPool<B: Backend> {
    pub(crate) shared: Arc<WorkerPoolShared<B>>,
}

impl<B: Backend> Clone for WorkerPool<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: Backend> std::fmt::Debug for WorkerPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("queue", &self.shared.queue)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> WorkerPool<B> {
    pub fn queue(&self) -> QueueKind {
        self.shared.queue
    }

    pub fn create_command_list(&self) -> Result<CommandList<B>> {
        let mut list = CommandList::new();
        list.initialize(self)?;
        Ok(list)
    }
}

/// Split a sequence of queue kinds into `[start, end)` runs of equal kind.
fn batch_bounds(kinds: impl Iterator<Item = QueueKind>) -> Vec<(usize, usize)> {
    let mut bounds: Vec<(usize, usize)> = Vec::new();
    let mut last = None;
    for (index, kind) in kinds.enumerate() {
        match bounds.last_mut() {
            Some((_, end)) if last == Some(kind) => *end = index + 1,
            _ => bounds.push((index, index + 1)),
        }
        last = Some(kind);
    }
    bounds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::soft_device;

    #[test]
    fn uninitialized_device_reports_not_initialized() {
        let device = Device::<crate::Soft>::new();
        assert_eq!(device.wait_idle().unwrap_err().code(), crate::ResultCode::NotInitialized);
        assert!(device.create_worker_pool(QueueKind::Graphics).is_err());
    }

    #[test]
    fn submit_with_nothing_queued_is_ok() {
        let (_system, device) = soft_device();
        device.submit().unwrap();
        device.wait_idle().unwrap();
    }

    #[test]
    fn record_rejects_open_and_double_queued_lists() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Graphics).unwrap();
        let mut list = pool.create_command_list().unwrap();
        assert_eq!(device.record(&list).unwrap_err().code(), crate::ResultCode::InvalidArgs);
        list.begin().unwrap();
        assert!(device.record(&list).is_err());
        list.end().unwrap();
        device.record(&list).unwrap();
        assert_eq!(device.record(&list).unwrap_err().code(), crate::ResultCode::InvalidArgs);
        device.submit().unwrap();
        list.wait(None).unwrap();
        assert_eq!(list.state().unwrap(), ListState::Complete);
    }

    #[test]
    fn dropped_pools_leave_the_registry() {
        let (_system, device) = soft_device();
        let pool = device.create_worker_pool(QueueKind::Compute).unwrap();
        assert_eq!(pool.queue(), QueueKind::Compute);
        drop(pool);
        let _other = device.create_worker_pool(QueueKind::Transfer).unwrap();
        let shared = device.shared().unwrap();
        assert_eq!(lock(&shared.pools).len(), 1);
    }

    #[test]
    fn batches_split_only_where_the_queue_kind_changes() {
        use crate::device::QueueKind::{Compute, Graphics, Transfer};
        assert_eq!(batch_bounds(std::iter::empty::<QueueKind>()), Vec::new());
        assert_eq!(batch_bounds([Graphics].into_iter()), vec![(0, 1)]);
        assert_eq!(
            batch_bounds([Graphics, Graphics, Transfer, Graphics, Compute, Compute].into_iter()),
            vec![(0, 2), (2, 3), (3, 4), (4, 6)]
        );
    }
}

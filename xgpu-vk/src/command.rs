//! Command pools and command buffers.

use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// CommandPoolShared
// ---------------------------------------------------------------------------

/// The raw pool handle, co-owned by the pool wrapper and every buffer
/// allocated from it so the pool outlives its buffers.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent and every buffer allocated
        // from it has been dropped. Destroying the pool frees them.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandPool
// ---------------------------------------------------------------------------

/// A command pool whose buffers can be reset individually.
///
/// `!Sync`: pool operations need external synchronization, so sharing across
/// threads goes through a lock at a higher level. Dropped buffers send their
/// handles back over a channel and are recycled by the next allocation.
pub struct ResettableCommandPool {
    shared: Arc<CommandPoolShared>,
    sender: mpsc::Sender<vk::CommandBuffer>,
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for ResettableCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandPool {
    pub fn new(device: &Arc<Device>, queue_family: u32, name: Option<&str>) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: queue_family is one of device's queue families.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: pool is a valid command pool created from device.
        unsafe { device.name_or_warn(pool, "command pool", name) };

        let (sender, receiver) = mpsc::channel();

        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocate a primary command buffer, recycling a returned handle when
    /// one is available and freeing any surplus.
    ///
    /// The result may not be in the initial state and must be reset before
    /// recording.
    pub fn allocate_command_buffer(&self) -> Result<ResettableCommandBuffer, AllocateCommandBufferError> {
        let mut returned: Vec<vk::CommandBuffer> = std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let handle = if let Some(recycled) = returned.pop() {
            // SAFETY: every returned handle came from this pool and was idle
            // when its wrapper dropped. !Sync keeps pool access on this thread.
            unsafe { self.shared.parent.free_raw_command_buffers(self.shared.pool, &returned) };
            recycled
        } else {
            let allocate_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.shared.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            // SAFETY: allocate_info references this pool; !Sync rules out
            // concurrent pool access.
            let mut buffers = unsafe { self.shared.parent.allocate_raw_command_buffers(&allocate_info) }
                .map_err(AllocateCommandBufferError::Vulkan)?;
            buffers
                .pop()
                .ok_or(AllocateCommandBufferError::Vulkan(vk::Result::ERROR_UNKNOWN))?
        };

        Ok(ResettableCommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            return_sender: self.sender.clone(),
        })
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.shared.parent
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandBuffer
// ---------------------------------------------------------------------------

/// A primary command buffer from a [`ResettableCommandPool`].
///
/// Recording goes through the `cmd_*` methods on [`Device`] with
/// [`raw_command_buffer`](Self::raw_command_buffer). Dropping the buffer
/// returns its handle to the pool; it must not be pending at that point.
pub struct ResettableCommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl Drop for ResettableCommandBuffer {
    fn drop(&mut self) {
        // A closed channel means the pool wrapper is gone; destroying the pool
        // frees the handle.
        let _ = self.return_sender.send(self.handle);
    }
}

impl std::fmt::Debug for ResettableCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandBuffer {
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the buffer is not pending.
        unsafe { self.parent.reset_raw_command_buffer(self.handle) }
    }

    /// Begin a one-time-submit recording.
    ///
    /// # Safety
    /// The buffer must be in the initial state.
    pub unsafe fn begin(&mut self) -> Result<(), vk::Result> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: caller guarantees the buffer is in the initial state.
        unsafe { self.parent.begin_raw_command_buffer(self.handle, &begin_info) }
    }

    /// # Safety
    /// The buffer must be recording, outside any render pass.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: caller guarantees the buffer is recording.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

// Both types must be Send so worker pools can move between threads.
#[allow(dead_code)]
trait AssertSend: Send {}
impl AssertSend for ResettableCommandPool {}
impl AssertSend for ResettableCommandBuffer {}

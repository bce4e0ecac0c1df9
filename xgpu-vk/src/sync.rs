//! GPU synchronisation primitives: [`Fence`] and [`Semaphore`].
//!
//! [`Fence`] is a CPU–GPU synchronisation object. It tracks whether it has
//! been handed to a submission so that waiting on a fence nothing will ever
//! signal is reported instead of hanging.
//!
//! [`Semaphore`] is a GPU–GPU synchronisation object used to order
//! swapchain acquisition, rendering and presentation.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("Asked to wait for fence but fence was never marked as submitted")]
    NotSubmitted,
}

#[derive(Debug, Error)]
pub enum MarkSubmittedError {
    #[error("This fence is already marked as submitted but was marked submitted again")]
    AlreadySubmitted,
}

#[derive(Debug, Error)]
pub enum CreateSemaphoreError {
    #[error("Vulkan error creating semaphore: {0}")]
    Vulkan(vk::Result),
}

// ---------------------------------------------------------------------------
// Fence
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum FenceStatus {
    Submitted,
    Ready,
}

/// An owned binary fence.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    status: FenceStatus,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Fence {
    /// Create a fence. A `signaled` fence starts out as if its submission
    /// already completed, so the first wait returns immediately.
    pub fn new(device: &Arc<Device>, signaled: bool, name: Option<&str>) -> Result<Self, CreateFenceError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }.map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle is a valid fence created from device.
        unsafe { device.name_or_warn(handle, "fence", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            status: if signaled {
                FenceStatus::Submitted
            } else {
                FenceStatus::Ready
            },
        })
    }

    /// Block until the fence is signaled or `timeout_ns` nanoseconds elapse.
    ///
    /// Pass `u64::MAX` to wait indefinitely.
    pub fn wait(&self, timeout_ns: u64) -> Result<(), WaitFenceError> {
        if self.status != FenceStatus::Submitted {
            return Err(WaitFenceError::NotSubmitted);
        }
        // SAFETY: handle is a valid fence created from parent.
        unsafe { self.parent.wait_for_raw_fences(&[self.handle], timeout_ns) }.map_err(|e| {
            if e == vk::Result::TIMEOUT {
                WaitFenceError::Timeout
            } else {
                WaitFenceError::Vulkan(e)
            }
        })
    }

    /// Reset the fence to the unsignaled state.
    ///
    /// # Safety
    /// The fence must not be pending on any queue submission.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        debug_assert!(self.status == FenceStatus::Submitted);
        // SAFETY: caller guarantees the fence is not pending.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }?;
        self.status = FenceStatus::Ready;
        Ok(())
    }

    /// Mark the fence as handed to a submission.
    ///
    /// # Safety
    /// The raw fence must actually have been passed to an operation that
    /// will signal it.
    pub unsafe fn mark_submitted(&mut self) -> Result<(), MarkSubmittedError> {
        if self.status == FenceStatus::Ready {
            self.status = FenceStatus::Submitted;
            Ok(())
        } else {
            Err(MarkSubmittedError::AlreadySubmitted)
        }
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }

    /// Handed to a submission; can be waited and reset.
    pub fn is_submitted(&self) -> bool {
        self.status == FenceStatus::Submitted
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent. Owners wait on submitted
        // fences before dropping them.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

/// An owned binary semaphore.
pub struct Semaphore {
    parent: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Semaphore {
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSemaphoreError> {
        let create_info = vk::SemaphoreCreateInfo::default();

        // SAFETY: create_info is fully initialised with no borrowed pointers.
        let handle =
            unsafe { device.create_raw_semaphore(&create_info) }.map_err(CreateSemaphoreError::Vulkan)?;

        // SAFETY: handle is a valid semaphore created from device.
        unsafe { device.name_or_warn(handle, "semaphore", name) };

        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn parent(&self) -> &Arc<Device> {
        &self.parent
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        tracing::debug!("Dropping semaphore {:?}", self.handle);
        // SAFETY: handle was created from parent. No GPU work may be waiting on
        // or about to signal it.
        unsafe { self.parent.destroy_raw_semaphore(self.handle) };
    }
}

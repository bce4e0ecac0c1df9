//! Cross-backend GPU resource and command layer.
//!
//! Object hierarchy:
//! [`System`](system::System) → [`Device`](device::Device) →
//! resources, pipelines, [`WorkerPool`](device::WorkerPool) →
//! [`CommandList`](command::CommandList). A [`Canvas`](canvas::Canvas) owns a
//! swapchain and the per-frame synchronization around it.
//!
//! Every object is generic over a [`Backend`](backend::Backend):
//! [`Soft`](backend::soft::Soft) is a CPU reference executor and
//! `Vulkan` (feature `vulkan`) drives `xgpu-vk`.
//!
//! Objects follow one lifecycle: `new()` yields an uninitialized handle,
//! `initialize(&device, &desc)` builds it (replacing any previous contents),
//! `deinitialize()` releases it. Handles are cheap to clone and share the
//! native object; GPU work in flight keeps its own reference.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod accel;
pub mod backend;
pub mod binding;
pub mod buffer;
pub mod canvas;
pub mod capability;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod image;
pub mod pass;
pub mod pipeline;
pub mod raytracing;
pub mod sampler;
pub mod shader;
pub mod state;
pub mod system;

#[cfg(test)]
mod test_support;

pub use backend::soft::Soft;
#[cfg(feature = "vulkan")]
pub use backend::vulkan::Vulkan;
pub use error::{Error, Result, ResultCode};

/// Lock `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

//! Thin RAII wrappers around Vulkan objects, built on [`ash`].
//!
//! This is the native layer underneath the `xgpu` Vulkan backend. Every
//! wrapper owns exactly one Vulkan handle and holds its parent through an
//! `Arc`, so a parent can never be destroyed while a child still exists.
//!
//! # Object hierarchy
//!
//! ```text
//! Instance
//! ├── Surface<T>
//! │   └── Swapchain<T>
//! └── Device                      (Vulkan 1.3 core, optional ray tracing)
//!     ├── Buffer                  (gpu-allocator backed, optional device address)
//!     ├── Image → ImageView
//!     ├── Sampler
//!     ├── ShaderModule
//!     ├── DescriptorSetLayout / DescriptorPool
//!     ├── PipelineLayout → Pipeline (graphics, compute, ray tracing)
//!     ├── AccelerationStructure
//!     ├── ResettableCommandPool → ResettableCommandBuffer
//!     └── Fence / Semaphore
//! ```
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |
//! | `cmd_*` | records into a command buffer             |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod accel;
pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod instance;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use ash;
pub use raw_window_handle::HandleError as RwhHandleError;

//! Frame resource lifecycle.
//!
//! This crate recycles the per-frame GPU resources of a render loop:
//! - [`CommandBufferAllocator`] reuses command buffers once their frame completed
//! - [`DescriptorSetAllocator`] hands out descriptor sets from pool blocks that
//!   retire together with their frame
//! - [`FrameController`] sequences acquire, record, submit, wait and present
//! - [`CommandRecorder`] records into one of the frame's command buffers
//!
//! Everything is generic over [`GpuDevice`](framecycle_rhi::backend::GpuDevice),
//! so the same code runs on the Vulkan device and on the headless device.

mod error;

pub mod command_allocator;
pub mod descriptor_allocator;
pub mod frame_controller;
pub mod recorder;
pub mod settings;

pub use command_allocator::CommandBufferAllocator;
pub use descriptor_allocator::DescriptorSetAllocator;
pub use error::{FrameError, FrameResult};
pub use frame_controller::{FrameController, FrameState};
pub use recorder::CommandRecorder;
pub use settings::FrameSettings;

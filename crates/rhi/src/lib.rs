//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance and device creation
//! - Swapchain management and presentation
//! - The [`GpuDevice`](backend::GpuDevice) seam the frame layer records and submits through
//! - A software device for running the frame layer without a GPU
//! - Validation message routing

mod error;

pub mod backend;
pub mod descriptor;
pub mod device;
pub mod diagnostics;
pub mod headless;
pub mod instance;
pub mod physical_device;
pub mod render_target;
pub mod swapchain;

pub use error::{RhiError, RhiResult};

// Re-export ash types that users might need
pub use ash::vk;

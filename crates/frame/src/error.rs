//! Frame-layer error types.

use framecycle_rhi::RhiError;
use framecycle_rhi::descriptor::DescriptorPoolLimits;
use thiserror::Error;

use crate::frame_controller::FrameState;

/// Errors reported by the allocators and the frame controller.
#[derive(Error, Debug)]
pub enum FrameError {
    /// A recording operation was called before `start_frame`.
    #[error("No frame has been started")]
    NotStarted,

    /// An operation was called in a state that does not allow it.
    #[error("`{operation}` is not allowed while the frame is {state}")]
    InvalidState {
        operation: &'static str,
        state: FrameState,
    },

    /// `end_frame` was called while command recorders of the frame were open.
    #[error("Cannot submit the frame: {open} command recorder(s) not ended")]
    RecordersOpen { open: usize },

    /// The queue rejected the frame's command buffers.
    #[error("Frame submission failed: {0}")]
    Submission(#[source] RhiError),

    /// A single descriptor set does not fit into an empty descriptor pool.
    #[error(
        "Descriptor set does not fit an empty pool (max_sets={}, max_uniform_buffers={}, max_textures={})",
        limits.max_sets,
        limits.max_uniform_buffers,
        limits.max_textures
    )]
    DescriptorCapacity { limits: DescriptorPoolLimits },

    /// A command buffer was released that the allocator did not hand out.
    #[error("Command buffer is not in use")]
    UnknownCommandBuffer,

    /// Device error
    #[error(transparent)]
    Rhi(#[from] RhiError),
}

/// Result type alias using [`FrameError`].
pub type FrameResult<T> = std::result::Result<T, FrameError>;

//! Device abstraction consumed by the frame resource managers.
//!
//! [`GpuDevice`] is the narrow set of device calls the command buffer
//! allocator, the descriptor set allocator and the frame controller need.
//! It is implemented by the Vulkan [`Device`](crate::device::Device) and by
//! the software [`HeadlessDevice`](crate::headless::HeadlessDevice), which lets
//! the frame layer run without a GPU.
//!
//! Handles are plain `Copy` values. Ownership and lifetime of the underlying
//! objects stay with the caller: a handle must not be destroyed or reset while
//! work referencing it is still executing on the GPU.
//!
//! # Example
//!
//! ```no_run
//! use framecycle_rhi::backend::GpuDevice;
//! use framecycle_rhi::RhiResult;
//!
//! fn record_empty<D: GpuDevice>(device: &D) -> RhiResult<()> {
//!     let pool = device.create_command_pool()?;
//!     let cmd = device.allocate_command_buffer(pool)?;
//!     device.begin_command_buffer(cmd)?;
//!     device.end_command_buffer(cmd)?;
//!     device.destroy_command_pool(pool);
//!     Ok(())
//! }
//! ```

use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use ash::vk;

use crate::descriptor::DescriptorPoolLimits;
use crate::error::RhiResult;
use crate::render_target::FrameImage;

/// Device operations used by the frame layer.
pub trait GpuDevice: Send + Sync + Sized + 'static {
    type CommandPool: Copy + Debug;
    type CommandBuffer: Copy + Eq + Hash + Debug;
    type DescriptorPool: Copy + Eq + Hash + Debug;
    type DescriptorSet: Copy + Debug;
    type DescriptorSetLayout: Copy + Debug;
    type PipelineLayout: Copy + Debug;
    type Pipeline: Copy + Debug;
    type Buffer: Copy + Debug;
    type Fence: Copy + Debug;
    type Framebuffer: Copy + Eq + Hash + Debug;
    type RenderPass: Copy + Eq + Debug;

    // =========================================================================
    // Command Pools and Buffers
    // =========================================================================

    /// Creates a command pool on the graphics queue family whose buffers can
    /// be reset individually.
    fn create_command_pool(&self) -> RhiResult<Self::CommandPool>;

    /// Destroys a command pool and every buffer allocated from it.
    fn destroy_command_pool(&self, pool: Self::CommandPool);

    /// Allocates one primary command buffer.
    fn allocate_command_buffer(&self, pool: Self::CommandPool) -> RhiResult<Self::CommandBuffer>;

    /// Begins one-time-submit recording, discarding any previous content.
    fn begin_command_buffer(&self, cmd: Self::CommandBuffer) -> RhiResult<()>;

    /// Ends recording.
    fn end_command_buffer(&self, cmd: Self::CommandBuffer) -> RhiResult<()>;

    // =========================================================================
    // Recording
    // =========================================================================

    /// Begins the image's render pass, clearing the color attachment.
    fn cmd_begin_render_pass(
        &self,
        cmd: Self::CommandBuffer,
        image: &FrameImage<Self>,
        clear_color: [f32; 4],
    );

    fn cmd_end_render_pass(&self, cmd: Self::CommandBuffer);

    /// Sets a viewport and scissor covering `extent`.
    fn cmd_set_viewport_scissor(&self, cmd: Self::CommandBuffer, extent: vk::Extent2D);

    fn cmd_bind_pipeline(&self, cmd: Self::CommandBuffer, pipeline: Self::Pipeline);

    fn cmd_bind_descriptor_set(
        &self,
        cmd: Self::CommandBuffer,
        layout: Self::PipelineLayout,
        set_index: u32,
        set: Self::DescriptorSet,
    );

    fn cmd_bind_vertex_buffer(
        &self,
        cmd: Self::CommandBuffer,
        buffer: Self::Buffer,
        offset: vk::DeviceSize,
    );

    fn cmd_bind_index_buffer(
        &self,
        cmd: Self::CommandBuffer,
        buffer: Self::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );

    fn cmd_draw(
        &self,
        cmd: Self::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );

    fn cmd_draw_indexed(
        &self,
        cmd: Self::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    // =========================================================================
    // Descriptor Pools
    // =========================================================================

    /// Creates a descriptor pool sized by `limits`.
    fn create_descriptor_pool(
        &self,
        limits: &DescriptorPoolLimits,
    ) -> RhiResult<Self::DescriptorPool>;

    /// Allocates one set from `pool`.
    ///
    /// # Errors
    ///
    /// A full pool reports an error for which
    /// [`RhiError::is_pool_exhausted`](crate::RhiError::is_pool_exhausted) is true.
    fn allocate_descriptor_set(
        &self,
        pool: Self::DescriptorPool,
        layout: Self::DescriptorSetLayout,
    ) -> RhiResult<Self::DescriptorSet>;

    /// Returns every set allocated from `pool` to the pool.
    fn reset_descriptor_pool(&self, pool: Self::DescriptorPool) -> RhiResult<()>;

    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);

    // =========================================================================
    // Synchronization and Submission
    // =========================================================================

    fn create_fence(&self, signaled: bool) -> RhiResult<Self::Fence>;

    fn destroy_fence(&self, fence: Self::Fence);

    fn reset_fence(&self, fence: Self::Fence) -> RhiResult<()>;

    /// Blocks until `fence` is signaled.
    ///
    /// `None` waits without bound.
    ///
    /// # Errors
    ///
    /// Returns [`RhiError::Timeout`](crate::RhiError::Timeout) if the bound expires first.
    fn wait_for_fence(&self, fence: Self::Fence, timeout: Option<Duration>) -> RhiResult<()>;

    /// Submits `command_buffers` to the graphics queue as one batch that signals `fence`.
    fn submit(&self, command_buffers: &[Self::CommandBuffer], fence: Self::Fence) -> RhiResult<()>;

    /// Blocks until all queues are idle.
    fn wait_idle(&self) -> RhiResult<()>;
}

/// Converts an optional timeout into the nanosecond value Vulkan waits take.
#[inline]
pub(crate) fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(u64::MAX)
}

//! Recording into a frame's command buffer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use framecycle_rhi::backend::GpuDevice;
use framecycle_rhi::render_target::FrameImage;
use framecycle_rhi::{RhiResult, vk};

/// A command buffer in the recording state, bound to the frame's image.
///
/// Returned by [`FrameController::start_command_buffer`](crate::FrameController::start_command_buffer).
/// The buffer is already begun; call [`end`](Self::end) when done. A recorder
/// dropped without `end` ends the buffer itself so the frame can still be
/// submitted.
///
/// The recorder only records. The handle stays owned by the frame controller,
/// which submits and recycles it, and refuses to submit while any recorder
/// of the frame is still open.
pub struct CommandRecorder<D: GpuDevice> {
    device: Arc<D>,
    cmd: D::CommandBuffer,
    image: FrameImage<D>,
    /// Recorders of the frame not yet ended, shared with the controller.
    open: Arc<AtomicUsize>,
    in_render_pass: bool,
    ended: bool,
}

impl<D: GpuDevice> CommandRecorder<D> {
    pub(crate) fn new(
        device: Arc<D>,
        cmd: D::CommandBuffer,
        image: FrameImage<D>,
        open: Arc<AtomicUsize>,
    ) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self {
            device,
            cmd,
            image,
            open,
            in_render_pass: false,
            ended: false,
        }
    }

    /// Returns the command buffer handle.
    #[inline]
    pub fn handle(&self) -> D::CommandBuffer {
        self.cmd
    }

    /// Returns the image this frame renders into.
    #[inline]
    pub fn image(&self) -> &FrameImage<D> {
        &self.image
    }

    #[inline]
    pub fn is_in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    // =========================================================================
    // Render Pass
    // =========================================================================

    /// Begins the frame image's render pass, clearing it to `clear_color`.
    ///
    /// Viewport and scissor are set to cover the whole image.
    pub fn begin_render_pass(&mut self, clear_color: [f32; 4]) {
        if self.in_render_pass {
            warn!("Render pass already begun on {:?}; ignoring", self.cmd);
            return;
        }
        self.device
            .cmd_begin_render_pass(self.cmd, &self.image, clear_color);
        self.device
            .cmd_set_viewport_scissor(self.cmd, self.image.extent);
        self.in_render_pass = true;
    }

    pub fn end_render_pass(&mut self) {
        if !self.in_render_pass {
            warn!("No render pass open on {:?}; ignoring", self.cmd);
            return;
        }
        self.device.cmd_end_render_pass(self.cmd);
        self.in_render_pass = false;
    }

    // =========================================================================
    // State Binding
    // =========================================================================

    pub fn bind_pipeline(&mut self, pipeline: D::Pipeline) {
        self.device.cmd_bind_pipeline(self.cmd, pipeline);
    }

    /// Binds `set` at index `set_index` of `layout`.
    pub fn bind_descriptor_set(
        &mut self,
        layout: D::PipelineLayout,
        set_index: u32,
        set: D::DescriptorSet,
    ) {
        self.device
            .cmd_bind_descriptor_set(self.cmd, layout, set_index, set);
    }

    pub fn bind_vertex_buffer(&mut self, buffer: D::Buffer, offset: vk::DeviceSize) {
        self.device.cmd_bind_vertex_buffer(self.cmd, buffer, offset);
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: D::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.device
            .cmd_bind_index_buffer(self.cmd, buffer, offset, index_type);
    }

    // =========================================================================
    // Drawing
    // =========================================================================

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.device.cmd_draw(
            self.cmd,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.device.cmd_draw_indexed(
            self.cmd,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
    }

    /// Ends recording, closing an open render pass first.
    ///
    /// # Errors
    ///
    /// Returns the device error if ending the buffer fails.
    pub fn end(mut self) -> RhiResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> RhiResult<()> {
        if self.in_render_pass {
            self.end_render_pass();
        }
        self.ended = true;
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.device.end_command_buffer(self.cmd)
    }
}

impl<D: GpuDevice> Drop for CommandRecorder<D> {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        warn!("Command recorder for {:?} dropped without end()", self.cmd);
        if let Err(e) = self.finish() {
            warn!("Failed to end command buffer {:?}: {}", self.cmd, e);
        }
    }
}

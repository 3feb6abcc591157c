//! Frame control and resource recycling.
//!
//! This module provides the [`FrameController`], which drives one frame at a
//! time through the render target and recycles the frame's command buffers and
//! descriptor sets once the GPU is done with them.
//!
//! # Overview
//!
//! ```text
//!            start_frame              end_frame              wait_end_of_render
//!   Idle ─────────────────▶ Recording ─────────▶ Submitted ──────────────────────▶ Idle
//!    │  ▲                    │                                (buffers released,
//!    │  └── present          └─ start_command_buffer          descriptor blocks freed)
//!    └── acquire_image          descriptor_set
//! ```
//!
//! At most one frame is in flight. Nothing used by frame N is handed to frame
//! N+1 before `wait_end_of_render` for frame N returned.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use framecycle_frame::{FrameController, FrameSettings};
//! use framecycle_rhi::headless::{HeadlessDevice, HeadlessTarget};
//! use framecycle_rhi::vk;
//!
//! # fn main() -> Result<(), framecycle_frame::FrameError> {
//! let device = Arc::new(HeadlessDevice::new());
//! let target = HeadlessTarget::new(&device, 2, vk::Extent2D { width: 640, height: 480 });
//! let mut controller = FrameController::new(device, target, FrameSettings::default())?;
//!
//! for _ in 0..3 {
//!     let image = controller.acquire_image()?;
//!     controller.start_frame(image)?;
//!
//!     let mut recorder = controller.start_command_buffer()?;
//!     recorder.begin_render_pass([0.1, 0.1, 0.1, 1.0]);
//!     recorder.draw(3, 1, 0, 0);
//!     recorder.end()?;
//!
//!     controller.end_frame()?;
//!     controller.wait_end_of_render()?;
//!     controller.present(&image)?;
//! }
//! assert_eq!(controller.frames_completed(), 3);
//! assert_eq!(controller.command_buffers().total(), 1);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use framecycle_rhi::RhiResult;
use framecycle_rhi::backend::GpuDevice;
use framecycle_rhi::render_target::{FrameImage, RenderTarget};

use crate::command_allocator::CommandBufferAllocator;
use crate::descriptor_allocator::DescriptorSetAllocator;
use crate::error::{FrameError, FrameResult};
use crate::recorder::CommandRecorder;
use crate::settings::FrameSettings;

/// Where the controller is in the frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// No frame in progress.
    Idle,
    /// A frame was started and command buffers may be recorded.
    Recording,
    /// The frame was submitted and is executing on the GPU.
    Submitted,
}

impl fmt::Display for FrameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameState::Idle => "idle",
            FrameState::Recording => "recording",
            FrameState::Submitted => "submitted",
        };
        f.write_str(name)
    }
}

/// Drives frames through a render target and recycles their resources.
///
/// # Thread Safety
///
/// Not synchronized. The controller should only be used from the render
/// thread, like the allocators it owns.
pub struct FrameController<D: GpuDevice, T: RenderTarget<D>> {
    device: Arc<D>,
    target: T,
    command_buffers: CommandBufferAllocator<D>,
    descriptor_sets: DescriptorSetAllocator<D>,
    /// Signaled when the GPU finished the submitted frame.
    fence: D::Fence,
    settings: FrameSettings,
    state: FrameState,
    /// Image of the frame in progress.
    image: Option<FrameImage<D>>,
    /// Command buffers started for the frame in progress, in submission order.
    frame_buffers: Vec<D::CommandBuffer>,
    /// Recorders handed out and not yet ended.
    open_recorders: Arc<AtomicUsize>,
    frames_completed: u64,
}

impl<D: GpuDevice, T: RenderTarget<D>> FrameController<D, T> {
    /// Creates a controller that owns `target`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command pool or the fence cannot be created.
    pub fn new(device: Arc<D>, target: T, settings: FrameSettings) -> RhiResult<Self> {
        let command_buffers = CommandBufferAllocator::new(device.clone())?;
        let descriptor_sets =
            DescriptorSetAllocator::new(device.clone(), settings.descriptor_limits);
        let fence = device.create_fence(false)?;

        info!(
            "Frame controller created ({} images, {}x{})",
            target.image_count(),
            target.extent().width,
            target.extent().height
        );

        Ok(Self {
            device,
            target,
            command_buffers,
            descriptor_sets,
            fence,
            settings,
            state: FrameState::Idle,
            image: None,
            frame_buffers: Vec::new(),
            open_recorders: Arc::new(AtomicUsize::new(0)),
            frames_completed: 0,
        })
    }

    // =========================================================================
    // Frame Cycle
    // =========================================================================

    /// Acquires the next image of the render target.
    ///
    /// Blocks up to the configured acquire timeout.
    ///
    /// # Errors
    ///
    /// - [`FrameError::InvalidState`] unless idle.
    /// - [`FrameError::Rhi`] with `SurfaceOutOfDate` when the target must be
    ///   rebuilt, or `Timeout` when the wait expired.
    pub fn acquire_image(&mut self) -> FrameResult<FrameImage<D>> {
        self.expect_idle("acquire_image")?;
        let image = self.target.acquire(self.settings.acquire_timeout)?;
        trace!("Acquired image {}", image.index);
        Ok(image)
    }

    /// Starts a frame rendering into `image`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless idle.
    pub fn start_frame(&mut self, image: FrameImage<D>) -> FrameResult<()> {
        self.expect_idle("start_frame")?;

        self.image = Some(image);
        self.frame_buffers.clear();
        self.state = FrameState::Recording;
        trace!("Frame {} started on image {}", self.frames_completed, image.index);
        Ok(())
    }

    /// Begins a command buffer for the current frame.
    ///
    /// The buffer is submitted by [`end_frame`](Self::end_frame) in the order
    /// the buffers were started.
    ///
    /// # Errors
    ///
    /// - [`FrameError::NotStarted`] if no frame was started.
    /// - [`FrameError::InvalidState`] if the frame was already submitted.
    /// - [`FrameError::Rhi`] if the device fails to allocate or begin the buffer.
    pub fn start_command_buffer(&mut self) -> FrameResult<CommandRecorder<D>> {
        let image = self.expect_recording("start_command_buffer")?;

        let cmd = self.command_buffers.acquire()?;
        if let Err(e) = self.device.begin_command_buffer(cmd) {
            self.command_buffers.release(cmd)?;
            return Err(e.into());
        }
        self.frame_buffers.push(cmd);

        Ok(CommandRecorder::new(
            self.device.clone(),
            cmd,
            image,
            self.open_recorders.clone(),
        ))
    }

    /// Allocates a descriptor set that lives until the current frame completes.
    ///
    /// # Errors
    ///
    /// - [`FrameError::NotStarted`] / [`FrameError::InvalidState`] outside recording.
    /// - [`FrameError::DescriptorCapacity`] if `layout` does not fit a pool block.
    pub fn descriptor_set(
        &mut self,
        layout: D::DescriptorSetLayout,
    ) -> FrameResult<D::DescriptorSet> {
        let image = self.expect_recording("descriptor_set")?;
        self.descriptor_sets
            .get_descriptor_set(image.framebuffer, layout)
    }

    /// Submits every command buffer of the frame in one batch.
    ///
    /// Recorders must have been ended (or dropped) before this call.
    ///
    /// # Errors
    ///
    /// - [`FrameError::NotStarted`] / [`FrameError::InvalidState`] outside recording.
    /// - [`FrameError::RecordersOpen`] while a recorder of the frame is open.
    ///   Nothing is submitted and the frame keeps recording.
    /// - [`FrameError::Submission`] if the queue rejected the batch. Nothing
    ///   reached the GPU, so the frame's resources are reclaimed and the
    ///   controller is idle again.
    pub fn end_frame(&mut self) -> FrameResult<()> {
        self.expect_recording("end_frame")?;

        let open = self.open_recorders.load(Ordering::Acquire);
        if open > 0 {
            warn!("end_frame called with {} open command recorder(s)", open);
            return Err(FrameError::RecordersOpen { open });
        }

        let submitted = self
            .device
            .reset_fence(self.fence)
            .and_then(|()| self.device.submit(&self.frame_buffers, self.fence));

        if let Err(e) = submitted {
            error!("Frame submission failed: {}", e);
            self.reclaim()?;
            return Err(FrameError::Submission(e));
        }

        trace!("Submitted {} command buffer(s)", self.frame_buffers.len());
        self.state = FrameState::Submitted;
        Ok(())
    }

    /// Waits for the submitted frame to finish on the GPU, then recycles its
    /// command buffers and descriptor blocks.
    ///
    /// Waits up to the configured fence timeout.
    ///
    /// # Errors
    ///
    /// - [`FrameError::NotStarted`] if idle, [`FrameError::InvalidState`] while recording.
    /// - [`FrameError::Rhi`] with `Timeout` if the wait expired. The frame
    ///   stays submitted and the wait can be retried.
    pub fn wait_end_of_render(&mut self) -> FrameResult<()> {
        self.wait_for_frame(self.settings.fence_timeout)
    }

    /// Like [`wait_end_of_render`](Self::wait_end_of_render) with an explicit bound.
    pub fn wait_end_of_render_timeout(&mut self, timeout: Duration) -> FrameResult<()> {
        self.wait_for_frame(Some(timeout))
    }

    /// Presents `image`. The frame that rendered it must have completed.
    ///
    /// # Errors
    ///
    /// - [`FrameError::InvalidState`] unless idle.
    /// - [`FrameError::Rhi`] with `ForeignImage`, `PresentFailed` or
    ///   `SurfaceOutOfDate` from the render target.
    pub fn present(&mut self, image: &FrameImage<D>) -> FrameResult<()> {
        self.expect_idle("present")?;
        self.target.present(image)?;
        Ok(())
    }

    /// Swaps in a rebuilt render target and returns the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidState`] unless idle.
    pub fn replace_render_target(&mut self, target: T) -> FrameResult<T> {
        self.expect_idle("replace_render_target")?;
        debug!(
            "Render target replaced ({}x{}, {} images)",
            target.extent().width,
            target.extent().height,
            target.image_count()
        );
        Ok(std::mem::replace(&mut self.target, target))
    }

    /// Completes a submitted frame, then waits for the device to go idle.
    pub fn wait_idle(&mut self) -> FrameResult<()> {
        if self.state == FrameState::Submitted {
            self.wait_for_frame(None)?;
        }
        self.device.wait_idle()?;
        Ok(())
    }

    fn wait_for_frame(&mut self, timeout: Option<Duration>) -> FrameResult<()> {
        match self.state {
            FrameState::Submitted => {}
            FrameState::Idle => return Err(FrameError::NotStarted),
            FrameState::Recording => {
                return Err(FrameError::InvalidState {
                    operation: "wait_end_of_render",
                    state: self.state,
                });
            }
        }

        self.device.wait_for_fence(self.fence, timeout)?;
        self.reclaim()?;
        self.frames_completed += 1;
        Ok(())
    }

    /// Returns the frame's buffers and descriptor blocks to their allocators.
    fn reclaim(&mut self) -> FrameResult<()> {
        let buffers = std::mem::take(&mut self.frame_buffers);
        let image = self.image.take();
        self.state = FrameState::Idle;

        for cmd in buffers {
            self.command_buffers.release(cmd)?;
        }
        if let Some(image) = image
            && let Err(e) = self.descriptor_sets.free_descriptor_pools(image.framebuffer)
        {
            // Freed again when a later frame renders into the same framebuffer.
            error!(
                "Descriptor blocks of framebuffer {:?} stay locked: {}",
                image.framebuffer, e
            );
            return Err(e);
        }
        Ok(())
    }

    fn expect_idle(&self, operation: &'static str) -> FrameResult<()> {
        match self.state {
            FrameState::Idle => Ok(()),
            state => Err(FrameError::InvalidState { operation, state }),
        }
    }

    fn expect_recording(&self, operation: &'static str) -> FrameResult<FrameImage<D>> {
        match (self.state, self.image) {
            (FrameState::Recording, Some(image)) => Ok(image),
            (FrameState::Idle, _) => Err(FrameError::NotStarted),
            (state, _) => Err(FrameError::InvalidState { operation, state }),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Image of the frame in progress, if any.
    #[inline]
    pub fn current_image(&self) -> Option<FrameImage<D>> {
        self.image
    }

    /// Number of frames whose GPU work has completed.
    #[inline]
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    #[inline]
    pub fn settings(&self) -> &FrameSettings {
        &self.settings
    }

    #[inline]
    pub fn render_target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the render target, e.g. to recreate it in place.
    #[inline]
    pub fn render_target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    #[inline]
    pub fn command_buffers(&self) -> &CommandBufferAllocator<D> {
        &self.command_buffers
    }

    #[inline]
    pub fn descriptor_sets(&self) -> &DescriptorSetAllocator<D> {
        &self.descriptor_sets
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice, T: RenderTarget<D>> Drop for FrameController<D, T> {
    fn drop(&mut self) {
        let result = match self.state {
            FrameState::Idle => Ok(()),
            FrameState::Recording => self.reclaim(),
            FrameState::Submitted => self.wait_for_frame(None),
        };
        if let Err(e) = result {
            error!("Failed to retire the frame in progress: {}", e);
        }

        self.device.destroy_fence(self.fence);
        info!(
            "Frame controller destroyed after {} frames",
            self.frames_completed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecycle_rhi::RhiError;
    use framecycle_rhi::headless::{HeadlessDevice, HeadlessLayout, HeadlessTarget};
    use framecycle_rhi::vk;

    type Controller = FrameController<HeadlessDevice, HeadlessTarget>;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 320,
        height: 240,
    };

    fn controller() -> (Arc<HeadlessDevice>, Controller) {
        let device = Arc::new(HeadlessDevice::new());
        let target = HeadlessTarget::new(&device, 2, EXTENT);
        let controller = FrameController::new(device.clone(), target, FrameSettings::default()).unwrap();
        (device, controller)
    }

    #[test]
    fn test_frame_state_display() {
        assert_eq!(FrameState::Idle.to_string(), "idle");
        assert_eq!(FrameState::Recording.to_string(), "recording");
        assert_eq!(FrameState::Submitted.to_string(), "submitted");
    }

    #[test]
    fn test_state_transitions() {
        let (_device, mut controller) = controller();
        assert_eq!(controller.state(), FrameState::Idle);

        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        assert_eq!(controller.state(), FrameState::Recording);
        assert_eq!(controller.current_image(), Some(image));

        controller.end_frame().unwrap();
        assert_eq!(controller.state(), FrameState::Submitted);

        controller.wait_end_of_render().unwrap();
        assert_eq!(controller.state(), FrameState::Idle);
        assert_eq!(controller.current_image(), None);
        assert_eq!(controller.frames_completed(), 1);
    }

    #[test]
    fn test_start_command_buffer_before_start_frame() {
        let (_device, mut controller) = controller();
        assert!(matches!(
            controller.start_command_buffer(),
            Err(FrameError::NotStarted)
        ));
        assert_eq!(controller.command_buffers().total(), 0);
    }

    #[test]
    fn test_end_frame_twice_is_rejected() {
        let (_device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.start_command_buffer().unwrap().end().unwrap();
        controller
            .descriptor_set(HeadlessLayout::new(1, 0))
            .unwrap();
        controller.end_frame().unwrap();
        let buffers = controller.command_buffers().total();
        let blocks = controller.descriptor_sets().total();

        assert!(matches!(
            controller.end_frame(),
            Err(FrameError::InvalidState {
                operation: "end_frame",
                state: FrameState::Submitted
            })
        ));
        assert_eq!(controller.command_buffers().total(), buffers);
        assert_eq!(controller.descriptor_sets().total(), blocks);
        assert_eq!(controller.state(), FrameState::Submitted);
    }

    #[test]
    fn test_end_frame_with_open_recorder_is_rejected() {
        let (device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        let finished = controller.start_command_buffer().unwrap();
        finished.end().unwrap();
        let mut open = controller.start_command_buffer().unwrap();
        open.begin_render_pass([0.0; 4]);

        assert!(matches!(
            controller.end_frame(),
            Err(FrameError::RecordersOpen { open: 1 })
        ));
        assert_eq!(controller.state(), FrameState::Recording);
        assert!(device.submissions().is_empty());

        open.end().unwrap();
        controller.end_frame().unwrap();
        controller.wait_end_of_render().unwrap();
        controller.present(&image).unwrap();

        // Both buffers come back usable for the next frame.
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.start_command_buffer().unwrap().end().unwrap();
        controller.start_command_buffer().unwrap().end().unwrap();
        controller.end_frame().unwrap();
        controller.wait_end_of_render().unwrap();
        assert_eq!(controller.command_buffers().total(), 2);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_failed_descriptor_reset_is_retried_by_next_frame_on_image() {
        let (device, mut controller) = controller();
        let layout = HeadlessLayout::new(1, 0);

        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.descriptor_set(layout).unwrap();
        controller.end_frame().unwrap();

        device.fail_next_descriptor_reset();
        assert!(matches!(
            controller.wait_end_of_render(),
            Err(FrameError::Rhi(RhiError::VulkanError(
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
            )))
        ));
        assert_eq!(controller.state(), FrameState::Idle);
        assert_eq!(controller.descriptor_sets().locked_frames(), vec![image.framebuffer]);
        controller.present(&image).unwrap();

        // Rotate back to the same image; its frame frees the stale block too.
        loop {
            let next = controller.acquire_image().unwrap();
            controller.start_frame(next).unwrap();
            controller.end_frame().unwrap();
            controller.wait_end_of_render().unwrap();
            controller.present(&next).unwrap();
            if next.framebuffer == image.framebuffer {
                break;
            }
        }
        assert!(controller.descriptor_sets().locked_frames().is_empty());
        assert_eq!(controller.descriptor_sets().available_count(), 1);
    }

    #[test]
    fn test_start_frame_while_recording_is_rejected() {
        let (_device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        assert!(matches!(
            controller.start_frame(image),
            Err(FrameError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_wait_while_idle_is_not_started() {
        let (_device, mut controller) = controller();
        assert!(matches!(
            controller.wait_end_of_render(),
            Err(FrameError::NotStarted)
        ));
    }

    #[test]
    fn test_present_requires_completed_frame() {
        let (_device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.end_frame().unwrap();

        assert!(matches!(
            controller.present(&image),
            Err(FrameError::InvalidState { .. })
        ));
        controller.wait_end_of_render().unwrap();
        controller.present(&image).unwrap();
        assert_eq!(controller.render_target().presented(), &[image.index]);
    }

    #[test]
    fn test_timeout_keeps_frame_submitted() {
        let (device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        let recorder = controller.start_command_buffer().unwrap();
        let cmd = recorder.handle();
        recorder.end().unwrap();
        controller.end_frame().unwrap();

        device.set_stalled(true);
        assert!(matches!(
            controller.wait_end_of_render_timeout(Duration::from_millis(5)),
            Err(FrameError::Rhi(RhiError::Timeout))
        ));
        assert_eq!(controller.state(), FrameState::Submitted);
        assert!(controller.command_buffers().is_in_use(cmd));

        device.set_stalled(false);
        controller.wait_end_of_render().unwrap();
        assert!(!controller.command_buffers().is_in_use(cmd));
    }

    #[test]
    fn test_rejected_submission_reclaims_frame() {
        let (device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.start_command_buffer().unwrap().end().unwrap();
        controller
            .descriptor_set(HeadlessLayout::new(1, 0))
            .unwrap();

        device.fail_next_submit();
        assert!(matches!(
            controller.end_frame(),
            Err(FrameError::Submission(RhiError::VulkanError(
                vk::Result::ERROR_DEVICE_LOST
            )))
        ));
        assert_eq!(controller.state(), FrameState::Idle);
        assert_eq!(controller.command_buffers().in_use_count(), 0);
        assert_eq!(controller.descriptor_sets().locked_count(image.framebuffer), 0);
        assert_eq!(controller.descriptor_sets().available_count(), 1);
    }

    #[test]
    fn test_descriptor_set_outside_frame() {
        let (_device, mut controller) = controller();
        assert!(matches!(
            controller.descriptor_set(HeadlessLayout::new(1, 0)),
            Err(FrameError::NotStarted)
        ));
    }

    #[test]
    fn test_replace_render_target_only_when_idle() {
        let (device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        let replacement = HeadlessTarget::new(&device, 3, EXTENT);
        assert!(controller.replace_render_target(replacement).is_err());

        controller.end_frame().unwrap();
        controller.wait_end_of_render().unwrap();

        let replacement = HeadlessTarget::new(&device, 3, EXTENT);
        let old = controller.replace_render_target(replacement).unwrap();
        assert_eq!(old.image_count(), 2);
        assert_eq!(controller.render_target().image_count(), 3);
    }

    #[test]
    fn test_drop_retires_submitted_frame() {
        let (device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.start_command_buffer().unwrap().end().unwrap();
        controller
            .descriptor_set(HeadlessLayout::new(1, 0))
            .unwrap();
        controller.end_frame().unwrap();

        drop(controller);
        assert!(device.violations().is_empty());
        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(device.live_descriptor_pools(), 0);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn test_wait_idle_completes_frame() {
        let (_device, mut controller) = controller();
        let image = controller.acquire_image().unwrap();
        controller.start_frame(image).unwrap();
        controller.end_frame().unwrap();

        controller.wait_idle().unwrap();
        assert_eq!(controller.state(), FrameState::Idle);
        assert_eq!(controller.frames_completed(), 1);
    }
}

//! GPU objects of the demo and its per-frame work.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use framecycle_core::{EngineConfig, FrameClock};
use framecycle_frame::{FrameController, FrameError, FrameSettings};
use framecycle_platform::{Surface, Window};
use framecycle_rhi::descriptor::{DescriptorBindingBuilder, DescriptorSetLayout};
use framecycle_rhi::device::Device;
use framecycle_rhi::diagnostics::TracingSink;
use framecycle_rhi::instance::Instance;
use framecycle_rhi::physical_device::select_physical_device;
use framecycle_rhi::swapchain::{PresentPolicy, Swapchain};
use framecycle_rhi::{RhiError, vk};

/// Owns the Vulkan objects and drives one frame per redraw.
///
/// Field order is drop order: the controller (and the swapchain it owns) goes
/// before the surface, and the instance goes last. The device lives until the
/// controller and the layout release it.
pub struct Demo {
    controller: FrameController<Device, Swapchain>,
    layout: DescriptorSetLayout,
    _surface: Surface,
    _instance: Instance,
    clock: FrameClock,
    width: u32,
    height: u32,
    needs_rebuild: bool,
}

impl Demo {
    pub fn new(window: &Window, config: &EngineConfig) -> Result<Self> {
        let (width, height) = (window.width(), window.height());
        info!("Initializing frame loop ({}x{})", width, height);

        let instance = Instance::new(config.validation, Arc::new(TracingSink))
            .context("Failed to create Vulkan instance")?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let physical_device =
            select_physical_device(instance.handle(), surface.handle(), surface.loader())?;
        let device = Device::new(&instance, &physical_device)?;

        let swapchain = Swapchain::new(
            &instance,
            device.clone(),
            surface.handle(),
            width,
            height,
            PresentPolicy::from_wait_idle(config.frame.present_wait_idle),
        )?;

        // One uniform buffer per frame, as a per-frame constants block would use.
        let layout = DescriptorSetLayout::new(
            device.clone(),
            &[DescriptorBindingBuilder::uniform_buffer(
                0,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            )],
        )?;

        let settings = FrameSettings::from(&config.frame);
        let controller = FrameController::new(device.clone(), swapchain, settings)?;

        Ok(Self {
            controller,
            layout,
            _surface: surface,
            _instance: instance,
            clock: FrameClock::new(),
            width,
            height,
            needs_rebuild: false,
        })
    }

    /// Records a new surface size; the render target is rebuilt before the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring resize to zero dimensions");
            return;
        }
        if (width, height) != (self.width, self.height) {
            self.width = width;
            self.height = height;
            self.needs_rebuild = true;
        }
    }

    /// Runs one full frame: acquire, record, submit, wait, present.
    ///
    /// Returns the measured frame rate once per second.
    pub fn render_frame(&mut self) -> Result<Option<f32>> {
        if self.needs_rebuild {
            self.rebuild_target()?;
        }

        let image = match self.controller.acquire_image() {
            Ok(image) => image,
            Err(FrameError::Rhi(RhiError::SurfaceOutOfDate)) => {
                debug!("Render target out of date at acquire");
                self.needs_rebuild = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let time = self.clock.tick();
        self.controller.start_frame(image)?;

        // Allocated every frame to keep the descriptor blocks cycling.
        let _frame_constants = self.controller.descriptor_set(self.layout.handle())?;

        let mut recorder = self.controller.start_command_buffer()?;
        recorder.begin_render_pass(clear_color(time.frame_index));
        recorder.end_render_pass();
        recorder.end()?;

        self.controller.end_frame()?;
        self.controller.wait_end_of_render()?;

        match self.controller.present(&image) {
            Ok(()) => {}
            Err(FrameError::Rhi(RhiError::SurfaceOutOfDate)) => {
                debug!("Render target out of date at present");
                self.needs_rebuild = true;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(time.fps)
    }

    fn rebuild_target(&mut self) -> Result<()> {
        self.controller.wait_idle()?;

        let rebuilt = self
            .controller
            .render_target()
            .rebuild(self.width, self.height)?;
        let old = self.controller.replace_render_target(rebuilt)?;
        drop(old);

        info!(
            "Render target rebuilt for {}x{} ({} command buffers, {} descriptor blocks)",
            self.width,
            self.height,
            self.controller.command_buffers().total(),
            self.controller.descriptor_sets().total()
        );
        self.needs_rebuild = false;
        Ok(())
    }

    /// Waits for outstanding GPU work before teardown.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.controller.wait_idle() {
            error!("Failed to wait for the GPU during shutdown: {}", e);
        }
        info!(
            "Shutting down after {} frames",
            self.controller.frames_completed()
        );
    }
}

/// Slowly cycling background color.
fn clear_color(frame_index: u64) -> [f32; 4] {
    let t = (frame_index % 360) as f32 * std::f32::consts::TAU / 360.0;
    [
        0.5 + 0.5 * t.sin(),
        0.5 + 0.5 * (t + 2.1).sin(),
        0.5 + 0.5 * (t + 4.2).sin(),
        1.0,
    ]
}

//! framecycle demo - Main Entry Point
//!
//! Opens a window and runs the frame loop against it: every redraw acquires a
//! swapchain image, records a clear, submits, waits for the GPU and presents.
//!
//! Usage: `framecycle [config.json]`. Without an argument `framecycle.json` in
//! the working directory is used if present, otherwise the defaults.

mod demo;

use std::path::Path;

use anyhow::Result;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use framecycle_core::EngineConfig;
use framecycle_platform::Window;

use crate::demo::Demo;

const DEFAULT_CONFIG_PATH: &str = "framecycle.json";

struct App {
    config: EngineConfig,
    window: Option<Window>,
    demo: Option<Demo>,
}

impl App {
    fn new(config: EngineConfig) -> Self {
        Self {
            config,
            window: None,
            demo: None,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window = match Window::new(event_loop, &self.config.window) {
            Ok(window) => window,
            Err(e) => {
                error!("Failed to create window: {}", e);
                event_loop.exit();
                return;
            }
        };

        match Demo::new(&window, &self.config) {
            Ok(demo) => {
                info!("Initialization complete, entering main loop");
                self.demo = Some(demo);
                self.window = Some(window);
            }
            Err(e) => {
                error!("Failed to initialize: {:?}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                if let Some(ref mut demo) = self.demo {
                    demo.shutdown();
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut window) = self.window {
                    window.resize(size.width, size.height);
                }
                if let Some(ref mut demo) = self.demo {
                    demo.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                let (Some(window), Some(demo)) = (&self.window, &mut self.demo) else {
                    return;
                };
                if window.is_minimized() {
                    return;
                }

                match demo.render_frame() {
                    Ok(Some(fps)) => {
                        info!("{:.1} fps", fps);
                        window.set_title(&format!("{} - {:.0} fps", self.config.window.title, fps));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("Frame failed: {:?}", e);
                        event_loop.exit();
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // The demo must go before the window its surface was created from.
        self.demo = None;
        self.window = None;
    }
}

fn load_config() -> Result<EngineConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(EngineConfig::load(path)?),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            Ok(EngineConfig::load(DEFAULT_CONFIG_PATH)?)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn main() -> Result<()> {
    let config = load_config()?;

    match config.log_filter.as_deref() {
        Some(filter) => framecycle_core::init_logging_with(filter),
        None => framecycle_core::init_logging(),
    }
    info!("Starting framecycle demo");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}

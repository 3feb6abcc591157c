//! Core utilities for the framecycle engine.
//!
//! This crate provides foundational types and utilities used across the engine:
//! - Error types and result aliases
//! - Logging initialization
//! - Engine configuration loaded from JSON
//! - Frame timing

mod config;
mod error;
mod frame_clock;
mod logging;

pub use config::{EngineConfig, FrameConfig, WindowConfig};
pub use error::{Error, Result};
pub use frame_clock::{FrameClock, FrameTime};
pub use logging::{init_logging, init_logging_with};

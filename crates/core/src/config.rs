//! Engine configuration.
//!
//! Configuration is plain data deserialized from JSON. Every field has a
//! default, so a partial file (or no file at all) yields a usable setup.
//!
//! # Example
//!
//! ```
//! use framecycle_core::EngineConfig;
//!
//! let config = EngineConfig::from_json_str(r#"{ "frame": { "max_descriptor_sets": 16 } }"#)?;
//! assert_eq!(config.frame.max_descriptor_sets, 16);
//! assert_eq!(config.window.width, 1280);
//! # Ok::<(), framecycle_core::Error>(())
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window creation parameters.
    pub window: WindowConfig,
    /// Frame loop and resource pool parameters.
    pub frame: FrameConfig,
    /// Enable the Khronos validation layer when it is installed.
    pub validation: bool,
    /// Fallback `tracing` filter directive, used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            frame: FrameConfig::default(),
            validation: cfg!(debug_assertions),
            log_filter: None,
        }
    }
}

impl EngineConfig {
    /// Parses a configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or the limits are invalid.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read and [`Error::Config`]
    /// if its content is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Checks the values that would otherwise fail later inside the device layer.
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero (got {}x{})",
                self.window.width, self.window.height
            )));
        }
        self.frame.validate()
    }
}

/// Window creation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: "framecycle".to_string(),
        }
    }
}

/// Frame loop configuration.
///
/// The descriptor limits size every descriptor block the engine creates; they
/// must be large enough for the biggest descriptor set layout in use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Maximum descriptor sets per descriptor block.
    pub max_descriptor_sets: u32,
    /// Maximum uniform-buffer descriptors per descriptor block.
    pub max_uniform_buffers: u32,
    /// Maximum combined image/sampler descriptors per descriptor block.
    pub max_textures: u32,
    /// Bound on the end-of-render fence wait. `None` waits forever.
    pub fence_timeout_ms: Option<u64>,
    /// Bound on surface image acquisition. `None` waits forever.
    pub acquire_timeout_ms: Option<u64>,
    /// Wait for the present queue to drain after every present.
    pub present_wait_idle: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_descriptor_sets: 32,
            max_uniform_buffers: 32,
            max_textures: 32,
            fence_timeout_ms: None,
            acquire_timeout_ms: None,
            present_wait_idle: true,
        }
    }
}

impl FrameConfig {
    /// Fence timeout as a [`Duration`].
    #[inline]
    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }

    /// Acquire timeout as a [`Duration`].
    #[inline]
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.max_descriptor_sets == 0 {
            return Err(Error::Config(
                "frame.max_descriptor_sets must be at least 1".to_string(),
            ));
        }
        if self.max_uniform_buffers == 0 && self.max_textures == 0 {
            return Err(Error::Config(
                "a descriptor block needs room for at least one buffer or texture".to_string(),
            ));
        }
        Ok(())
    }
}

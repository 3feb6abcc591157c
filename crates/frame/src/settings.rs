//! Runtime settings of the frame controller.

use std::time::Duration;

use framecycle_core::FrameConfig;
use framecycle_rhi::descriptor::DescriptorPoolLimits;

/// Settings the [`FrameController`](crate::FrameController) is created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameSettings {
    /// Size of every descriptor pool block.
    pub descriptor_limits: DescriptorPoolLimits,
    /// Bound on `wait_end_of_render`. `None` waits forever.
    pub fence_timeout: Option<Duration>,
    /// Bound on image acquisition. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
}

impl From<&FrameConfig> for FrameSettings {
    fn from(config: &FrameConfig) -> Self {
        Self {
            descriptor_limits: DescriptorPoolLimits::new(
                config.max_descriptor_sets,
                config.max_uniform_buffers,
                config.max_textures,
            ),
            fence_timeout: config.fence_timeout(),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = FrameConfig {
            max_descriptor_sets: 4,
            max_uniform_buffers: 8,
            max_textures: 0,
            fence_timeout_ms: Some(250),
            ..Default::default()
        };
        let settings = FrameSettings::from(&config);
        assert_eq!(settings.descriptor_limits, DescriptorPoolLimits::new(4, 8, 0));
        assert_eq!(settings.fence_timeout, Some(Duration::from_millis(250)));
        assert_eq!(settings.acquire_timeout, None);
    }

    #[test]
    fn test_default_waits_forever() {
        let settings = FrameSettings::default();
        assert_eq!(settings.fence_timeout, None);
        assert_eq!(settings.descriptor_limits, DescriptorPoolLimits::default());
    }
}

//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// No suitable GPU found
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// Surface creation error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// The presentation surface changed and the render target must be rebuilt.
    #[error("Render target is out of date")]
    SurfaceOutOfDate,

    /// The image handed to `present` was not acquired from this render target.
    #[error("Image does not belong to this render target")]
    ForeignImage,

    /// The presentation engine rejected the image.
    #[error("Present failed: {0}")]
    PresentFailed(vk::Result),

    /// A bounded wait expired.
    #[error("Wait timed out")]
    Timeout,
}

impl RhiError {
    /// Returns true if a descriptor allocation failed because the pool ran out of space.
    ///
    /// This is the only descriptor failure the allocators recover from; every
    /// other error is fatal.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(
            self,
            RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                | RhiError::VulkanError(vk::Result::ERROR_FRAGMENTED_POOL)
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhaustion_detection() {
        assert!(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY).is_pool_exhausted());
        assert!(RhiError::VulkanError(vk::Result::ERROR_FRAGMENTED_POOL).is_pool_exhausted());
        assert!(!RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST).is_pool_exhausted());
        assert!(!RhiError::Timeout.is_pool_exhausted());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RhiError>();
    }
}

//! Presentable render targets.
//!
//! A [`RenderTarget`] is an ordered set of displayable images that share one
//! render pass and one extent. The presentation engine hands images out through
//! [`RenderTarget::acquire`] and takes them back through [`RenderTarget::present`].
//!
//! The acquired image is described by a [`FrameImage`]. Its framebuffer handle
//! identifies the frame for as long as the target lives, which is what the
//! descriptor set allocator keys its pools on.

use std::fmt;
use std::time::Duration;

use ash::vk;

use crate::backend::GpuDevice;
use crate::error::RhiResult;

/// One image of a render target.
pub struct FrameImage<D: GpuDevice> {
    /// Position of the image in the target's image list.
    pub index: u32,
    /// Framebuffer wrapping the image.
    pub framebuffer: D::Framebuffer,
    /// Render pass shared by every image of the target.
    pub render_pass: D::RenderPass,
    /// Size of the image.
    pub extent: vk::Extent2D,
}

// Manual impls: derives would put the bounds on `D` instead of its handles.
impl<D: GpuDevice> Clone for FrameImage<D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: GpuDevice> Copy for FrameImage<D> {}

impl<D: GpuDevice> PartialEq for FrameImage<D> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.framebuffer == other.framebuffer
            && self.render_pass == other.render_pass
            && self.extent == other.extent
    }
}

impl<D: GpuDevice> Eq for FrameImage<D> {}

impl<D: GpuDevice> fmt::Debug for FrameImage<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameImage")
            .field("index", &self.index)
            .field("framebuffer", &self.framebuffer)
            .field("render_pass", &self.render_pass)
            .field("extent", &(self.extent.width, self.extent.height))
            .finish()
    }
}

/// A set of images the frame controller renders into and presents.
pub trait RenderTarget<D: GpuDevice> {
    /// Size shared by every image.
    fn extent(&self) -> vk::Extent2D;

    /// Render pass shared by every image.
    fn render_pass(&self) -> D::RenderPass;

    /// Number of images.
    fn image_count(&self) -> u32;

    /// Returns the image at `index`, or `None` if out of range.
    fn image(&self, index: u32) -> Option<FrameImage<D>>;

    /// Blocks until the presentation engine hands back an image.
    ///
    /// `None` waits without bound.
    ///
    /// # Errors
    ///
    /// - [`RhiError::SurfaceOutOfDate`](crate::RhiError::SurfaceOutOfDate) if the
    ///   target must be rebuilt before it can be used again.
    /// - [`RhiError::Timeout`](crate::RhiError::Timeout) if the bound expired.
    fn acquire(&mut self, timeout: Option<Duration>) -> RhiResult<FrameImage<D>>;

    /// Queues `image` for display.
    ///
    /// # Errors
    ///
    /// - [`RhiError::ForeignImage`](crate::RhiError::ForeignImage) if `image`
    ///   was not produced by this target.
    /// - [`RhiError::PresentFailed`](crate::RhiError::PresentFailed) or
    ///   [`RhiError::SurfaceOutOfDate`](crate::RhiError::SurfaceOutOfDate) if the
    ///   presentation engine rejected it.
    fn present(&mut self, image: &FrameImage<D>) -> RhiResult<()>;

    /// Returns true if `image` is one of this target's images.
    fn owns(&self, image: &FrameImage<D>) -> bool {
        self.image(image.index)
            .is_some_and(|own| own.framebuffer == image.framebuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{HeadlessDevice, HeadlessTarget};

    #[test]
    fn test_owns_checks_framebuffer_identity() {
        let device = HeadlessDevice::new();
        let target = HeadlessTarget::new(&device, 2, vk::Extent2D { width: 4, height: 4 });
        let other = HeadlessTarget::new(&device, 2, vk::Extent2D { width: 4, height: 4 });

        let own = target.image(1).unwrap();
        let foreign = other.image(1).unwrap();
        assert!(target.owns(&own));
        assert!(!target.owns(&foreign));
        assert_ne!(own, foreign);
    }

    #[test]
    fn test_frame_image_is_copy() {
        fn assert_copy<T: Copy>() {}
        assert_copy::<FrameImage<HeadlessDevice>>();
    }
}

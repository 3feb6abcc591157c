//! Swapchain render target.
//!
//! [`Swapchain`] wraps a VkSwapchainKHR together with everything needed to draw
//! into its images: one image view and one framebuffer per image, and a single
//! clear/store render pass that leaves images ready for presentation.
//!
//! Image acquisition blocks on an internal fence, so the image is ready for
//! rendering when [`RenderTarget::acquire`] returns and no semaphore is needed
//! between acquire and submit.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use framecycle_rhi::device::Device;
//! use framecycle_rhi::instance::Instance;
//! use framecycle_rhi::render_target::RenderTarget;
//! use framecycle_rhi::swapchain::{PresentPolicy, Swapchain};
//! use ash::vk;
//!
//! # fn example(instance: &Instance, device: Arc<Device>, surface: vk::SurfaceKHR) -> Result<(), framecycle_rhi::RhiError> {
//! let mut swapchain = Swapchain::new(instance, device, surface, 800, 600, PresentPolicy::WaitIdle)?;
//!
//! let image = swapchain.acquire(None)?;
//! // ... record and submit work rendering into image.framebuffer, wait for it ...
//! swapchain.present(&image)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use tracing::{debug, info, trace, warn};

use crate::backend::{GpuDevice, timeout_nanos};
use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;
use crate::render_target::{FrameImage, RenderTarget};

/// What [`Swapchain::present`] does after queueing an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentPolicy {
    /// Block until the present queue is idle.
    #[default]
    WaitIdle,
    /// Return as soon as the image is queued.
    NoWait,
}

impl PresentPolicy {
    pub fn from_wait_idle(wait_idle: bool) -> Self {
        if wait_idle {
            PresentPolicy::WaitIdle
        } else {
            PresentPolicy::NoWait
        }
    }
}

/// Swapchain surface support details.
#[derive(Debug, Clone)]
pub struct SwapchainSupportDetails {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SwapchainSupportDetails {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &ash::khr::surface::Instance,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Swapchain support: {} formats, {} present modes, min image count {}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Swapchain-backed [`RenderTarget`].
pub struct Swapchain {
    device: Arc<Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    /// Signaled when the acquired image is ready for rendering.
    acquire_fence: vk::Fence,
    present_policy: PresentPolicy,
}

impl Swapchain {
    /// Creates a new swapchain render target.
    ///
    /// Prefers B8G8R8A8_SRGB and MAILBOX, falling back to the first available
    /// format and FIFO.
    ///
    /// # Arguments
    ///
    /// * `instance` - The Vulkan instance
    /// * `device` - The logical device
    /// * `surface` - The window surface; it must outlive the swapchain
    /// * `width` - Desired width, used when the surface leaves it to the application
    /// * `height` - Desired height
    /// * `present_policy` - Whether presenting waits for the present queue
    ///
    /// # Errors
    ///
    /// Returns an error if surface queries or any object creation fails.
    pub fn new(
        instance: &Instance,
        device: Arc<Device>,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        present_policy: PresentPolicy,
    ) -> RhiResult<Self> {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance.handle(), device.handle());
        let surface_loader = ash::khr::surface::Instance::new(instance.entry(), instance.handle());
        Self::create(
            device,
            swapchain_loader,
            surface_loader,
            surface,
            width,
            height,
            present_policy,
            vk::SwapchainKHR::null(),
        )
    }

    /// Builds a replacement swapchain for a new surface size.
    ///
    /// The old swapchain is handed to the driver for resource reuse and stays
    /// valid until dropped. No image of `self` may be in use by the GPU when
    /// the replacement is installed.
    ///
    /// # Errors
    ///
    /// Returns an error if creation fails.
    pub fn rebuild(&self, width: u32, height: u32) -> RhiResult<Self> {
        info!("Rebuilding swapchain for new size: {}x{}", width, height);
        Self::create(
            self.device.clone(),
            self.swapchain_loader.clone(),
            self.surface_loader.clone(),
            self.surface,
            width,
            height,
            self.present_policy,
            self.swapchain,
        )
    }

    /// Recreates the swapchain in place after waiting for the device to go idle.
    ///
    /// # Errors
    ///
    /// Returns an error if the wait or the creation fails.
    pub fn recreate(&mut self, width: u32, height: u32) -> RhiResult<()> {
        self.device.wait_idle()?;
        let rebuilt = self.rebuild(width, height)?;
        drop(std::mem::replace(self, rebuilt));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn create(
        device: Arc<Device>,
        swapchain_loader: ash::khr::swapchain::Device,
        surface_loader: ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        width: u32,
        height: u32,
        present_policy: PresentPolicy,
        old_swapchain: vk::SwapchainKHR,
    ) -> RhiResult<Self> {
        let support =
            SwapchainSupportDetails::query(device.physical_device(), surface, &surface_loader)?;

        let (Some(surface_format), true) = (
            choose_surface_format(&support.formats),
            support.is_adequate(),
        ) else {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        };
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(RhiError::SwapchainError(
                "Surface has a zero-sized extent".to_string(),
            ));
        }
        let image_count = determine_image_count(&support.capabilities);

        info!(
            "Creating swapchain: {}x{}, format {:?}, present mode {:?}, {} images",
            extent.width, extent.height, surface_format.format, present_mode, image_count
        );

        let families = device.queue_families();
        let family_indices: Vec<u32> = families.unique_families();
        let (sharing_mode, shared_families) = if families.is_split() {
            (vk::SharingMode::CONCURRENT, family_indices.as_slice())
        } else {
            (vk::SharingMode::EXCLUSIVE, &[][..])
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(shared_families)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        // From here on, partially built state is released by Drop on error.
        let mut target = Self {
            device,
            swapchain_loader,
            surface_loader,
            surface,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            acquire_fence: vk::Fence::null(),
            present_policy,
        };

        target.images = unsafe { target.swapchain_loader.get_swapchain_images(swapchain)? };
        target.create_image_views()?;
        target.create_render_pass()?;
        target.create_framebuffers()?;
        target.acquire_fence = target.device.create_fence(false)?;

        info!("Swapchain created with {} images", target.images.len());
        Ok(target)
    }

    fn create_image_views(&mut self) -> RhiResult<()> {
        for (i, &image) in self.images.iter().enumerate() {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );

            let view = unsafe {
                self.device
                    .handle()
                    .create_image_view(&create_info, None)
                    .map_err(|e| {
                        RhiError::SwapchainError(format!(
                            "Failed to create image view {}: {:?}",
                            i, e
                        ))
                    })?
            };
            self.image_views.push(view);
        }

        trace!("Created {} image views", self.image_views.len());
        Ok(())
    }

    fn create_render_pass(&mut self) -> RhiResult<()> {
        let attachments = [vk::AttachmentDescription::default()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        let dependencies = [vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        self.render_pass = unsafe { self.device.handle().create_render_pass(&create_info, None)? };
        trace!("Render pass created");
        Ok(())
    }

    fn create_framebuffers(&mut self) -> RhiResult<()> {
        for &view in &self.image_views {
            let attachments = [view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer =
                unsafe { self.device.handle().create_framebuffer(&create_info, None)? };
            self.framebuffers.push(framebuffer);
        }

        trace!("Created {} framebuffers", self.framebuffers.len());
        Ok(())
    }

    /// Returns the swapchain handle.
    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    /// Returns the present mode.
    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn present_policy(&self) -> PresentPolicy {
        self.present_policy
    }
}

impl RenderTarget<Device> for Swapchain {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    fn image_count(&self) -> u32 {
        self.framebuffers.len() as u32
    }

    fn image(&self, index: u32) -> Option<FrameImage<Device>> {
        self.framebuffers
            .get(index as usize)
            .map(|&framebuffer| FrameImage {
                index,
                framebuffer,
                render_pass: self.render_pass,
                extent: self.extent,
            })
    }

    fn acquire(&mut self, timeout: Option<Duration>) -> RhiResult<FrameImage<Device>> {
        self.device.reset_fence(self.acquire_fence)?;

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout_nanos(timeout),
                vk::Semaphore::null(),
                self.acquire_fence,
            )
        };

        let index = match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("Swapchain is suboptimal for the surface");
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(RhiError::SurfaceOutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => return Err(RhiError::Timeout),
            Err(e) => return Err(e.into()),
        };

        // The image is ours now; only the presentation engine's read remains.
        self.device.wait_for_fence(self.acquire_fence, None)?;
        trace!("Acquired swapchain image {}", index);

        self.image(index).ok_or_else(|| {
            RhiError::SwapchainError(format!("Driver returned out-of-range image {}", index))
        })
    }

    fn present(&mut self, image: &FrameImage<Device>) -> RhiResult<()> {
        if !self.owns(image) {
            return Err(RhiError::ForeignImage);
        }

        let swapchains = [self.swapchain];
        let image_indices = [image.index];
        let present_info = vk::PresentInfoKHR::default()
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue(), &present_info)
        };
        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    debug!("Presented to a suboptimal swapchain");
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(RhiError::SurfaceOutOfDate),
            Err(e) => return Err(RhiError::PresentFailed(e)),
        }

        if self.present_policy == PresentPolicy::WaitIdle {
            self.device.wait_present_queue_idle()?;
        }
        trace!("Presented swapchain image {}", image.index);
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = self.device.handle();
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            if self.acquire_fence != vk::Fence::null() {
                device.destroy_fence(self.acquire_fence, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }

        info!(
            "Swapchain destroyed (was {}x{}, {} images)",
            self.extent.width,
            self.extent.height,
            self.images.len()
        );
    }
}

/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR, else the first format.
fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    match preferred {
        Some(&format) => Some(format),
        None => {
            let first = formats.first().copied();
            if let Some(format) = first {
                warn!("Using first available surface format: {:?}", format.format);
            }
            first
        }
    }
}

/// Prefers MAILBOX, falls back to FIFO which is always available.
fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Uses the surface's current extent when defined, otherwise clamps the
/// requested size to the surface limits.
fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    width: u32,
    height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum when there is one.
fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

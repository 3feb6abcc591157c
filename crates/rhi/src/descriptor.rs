//! Descriptor pool sizing and descriptor set layouts.
//!
//! This module provides:
//! - [`DescriptorPoolLimits`] - capacity of one descriptor pool
//! - [`DescriptorSetLayout`] - owned VkDescriptorSetLayout
//! - [`DescriptorBindingBuilder`] - helpers for layout bindings
//!
//! Descriptor pools themselves are created through
//! [`GpuDevice::create_descriptor_pool`](crate::backend::GpuDevice::create_descriptor_pool)
//! and recycled by the frame layer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ash::vk;
//! use framecycle_rhi::device::Device;
//! use framecycle_rhi::descriptor::{DescriptorBindingBuilder, DescriptorSetLayout};
//!
//! # fn example(device: Arc<Device>) -> Result<(), framecycle_rhi::RhiError> {
//! let bindings = [
//!     DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX),
//!     DescriptorBindingBuilder::combined_image_sampler(1, vk::ShaderStageFlags::FRAGMENT),
//! ];
//! let layout = DescriptorSetLayout::new(device, &bindings)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::Device;
use crate::error::RhiResult;

/// Capacity of a single descriptor pool.
///
/// Every pool created by the frame layer uses the same limits. A descriptor set
/// layout that needs more than one pool can hold cannot be allocated at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorPoolLimits {
    /// Maximum number of sets allocated from one pool.
    pub max_sets: u32,
    /// Uniform-buffer descriptors available in one pool.
    pub max_uniform_buffers: u32,
    /// Combined image/sampler descriptors available in one pool.
    pub max_textures: u32,
}

impl DescriptorPoolLimits {
    pub const fn new(max_sets: u32, max_uniform_buffers: u32, max_textures: u32) -> Self {
        Self {
            max_sets,
            max_uniform_buffers,
            max_textures,
        }
    }

    /// Pool sizes for `VkDescriptorPoolCreateInfo`. Descriptor types with a
    /// zero count are omitted since Vulkan rejects them.
    pub fn pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        [
            (vk::DescriptorType::UNIFORM_BUFFER, self.max_uniform_buffers),
            (
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                self.max_textures,
            ),
        ]
        .into_iter()
        .filter(|&(_, count)| count > 0)
        .map(|(ty, count)| vk::DescriptorPoolSize::default().ty(ty).descriptor_count(count))
        .collect()
    }
}

impl Default for DescriptorPoolLimits {
    fn default() -> Self {
        Self::new(32, 32, 32)
    }
}

/// Descriptor set layout wrapper.
///
/// The layout is immutable after creation and is destroyed on drop.
pub struct DescriptorSetLayout {
    /// Reference to the logical device.
    device: Arc<Device>,
    /// Vulkan descriptor set layout handle.
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a new descriptor set layout.
    ///
    /// # Arguments
    ///
    /// * `device` - The logical device
    /// * `bindings` - Array of binding descriptions
    ///
    /// # Errors
    ///
    /// Returns an error if layout creation fails.
    pub fn new(
        device: Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> RhiResult<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        let layout = unsafe {
            device
                .handle()
                .create_descriptor_set_layout(&create_info, None)?
        };

        debug!(
            "Created descriptor set layout with {} binding(s)",
            bindings.len()
        );

        Ok(Self { device, layout })
    }

    /// Returns the Vulkan descriptor set layout handle.
    #[inline]
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .handle()
                .destroy_descriptor_set_layout(self.layout, None);
        }
        debug!("Destroyed descriptor set layout");
    }
}

/// Builder for descriptor set layout bindings of the types a
/// [`DescriptorPoolLimits`] pool provides.
pub struct DescriptorBindingBuilder;

impl DescriptorBindingBuilder {
    /// Creates a uniform buffer binding.
    #[inline]
    pub fn uniform_buffer(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }

    /// Creates a combined image sampler binding.
    #[inline]
    pub fn combined_image_sampler(
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(binding)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(stage_flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_cover_both_types() {
        let sizes = DescriptorPoolLimits::new(8, 16, 4).pool_sizes();
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 16);
        assert_eq!(sizes[1].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[1].descriptor_count, 4);
    }

    #[test]
    fn test_pool_sizes_skip_zero_counts() {
        let sizes = DescriptorPoolLimits::new(8, 16, 0).pool_sizes();
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn test_descriptor_binding_builder_uniform_buffer() {
        let binding = DescriptorBindingBuilder::uniform_buffer(0, vk::ShaderStageFlags::VERTEX);
        assert_eq!(binding.binding, 0);
        assert_eq!(binding.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(binding.descriptor_count, 1);
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_descriptor_binding_builder_combined_image_sampler() {
        let binding =
            DescriptorBindingBuilder::combined_image_sampler(2, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(binding.binding, 2);
        assert_eq!(
            binding.descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }
}

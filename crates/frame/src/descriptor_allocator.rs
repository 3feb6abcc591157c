//! Per-frame descriptor set allocation.
//!
//! Descriptor sets are carved out of fixed-size descriptor pools ("blocks").
//! A block that served a frame is locked to that frame, keyed by the frame's
//! framebuffer, until the frame controller has seen the frame's fence signal.
//! Freeing resets every block of the frame at once and returns them to the
//! available list, so individual sets are never freed.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use framecycle_rhi::backend::GpuDevice;
use framecycle_rhi::descriptor::DescriptorPoolLimits;

use crate::error::{FrameError, FrameResult};

/// Allocator of descriptor sets that retire together with their frame.
pub struct DescriptorSetAllocator<D: GpuDevice> {
    device: Arc<D>,
    limits: DescriptorPoolLimits,
    /// Reset blocks, most recently freed last.
    available: Vec<D::DescriptorPool>,
    /// Blocks serving a frame, in the order they were locked.
    locked: HashMap<D::Framebuffer, Vec<D::DescriptorPool>>,
}

impl<D: GpuDevice> DescriptorSetAllocator<D> {
    /// Creates an allocator. Blocks are created lazily with `limits`.
    pub fn new(device: Arc<D>, limits: DescriptorPoolLimits) -> Self {
        Self {
            device,
            limits,
            available: Vec::new(),
            locked: HashMap::new(),
        }
    }

    /// Allocates one set with `layout` for the frame rendering into `frame`.
    ///
    /// The set comes from the frame's most recently locked block. When that
    /// block is full, another block is locked to the frame and the allocation
    /// is retried once.
    ///
    /// # Errors
    ///
    /// - [`FrameError::DescriptorCapacity`] if the set does not fit into an
    ///   empty block. This is a configuration error.
    /// - [`FrameError::Rhi`] for any other device failure.
    pub fn get_descriptor_set(
        &mut self,
        frame: D::Framebuffer,
        layout: D::DescriptorSetLayout,
    ) -> FrameResult<D::DescriptorSet> {
        let block = match self.locked.get(&frame).and_then(|blocks| blocks.last()) {
            Some(&block) => block,
            None => self.lock_block(frame)?,
        };

        match self.device.allocate_descriptor_set(block, layout) {
            Ok(set) => return Ok(set),
            Err(e) if e.is_pool_exhausted() => {
                trace!("Descriptor block {:?} full for frame {:?}", block, frame);
            }
            Err(e) => return Err(e.into()),
        }

        let block = self.lock_block(frame)?;
        match self.device.allocate_descriptor_set(block, layout) {
            Ok(set) => Ok(set),
            Err(e) if e.is_pool_exhausted() => {
                warn!(
                    "Descriptor set with layout {:?} does not fit an empty block {:?}",
                    layout, self.limits
                );
                Err(FrameError::DescriptorCapacity {
                    limits: self.limits,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resets every block locked to `frame` and makes them available again.
    ///
    /// Must only be called once the GPU has finished the frame. Freeing a
    /// frame with no blocks is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the device error if a reset fails. The blocks not yet reset
    /// stay locked to `frame`.
    pub(crate) fn free_descriptor_pools(&mut self, frame: D::Framebuffer) -> FrameResult<()> {
        let Some(mut blocks) = self.locked.remove(&frame) else {
            return Ok(());
        };

        while let Some(block) = blocks.pop() {
            if let Err(e) = self.device.reset_descriptor_pool(block) {
                blocks.push(block);
                self.locked.insert(frame, blocks);
                return Err(e.into());
            }
            self.available.push(block);
        }

        trace!("Freed descriptor blocks of frame {:?}", frame);
        Ok(())
    }

    /// Pops an available block, or creates one, and locks it to `frame`.
    fn lock_block(&mut self, frame: D::Framebuffer) -> FrameResult<D::DescriptorPool> {
        let block = match self.available.pop() {
            Some(block) => block,
            None => {
                let block = self.device.create_descriptor_pool(&self.limits)?;
                debug!(
                    "Created descriptor block {:?} ({} total)",
                    block,
                    self.total() + 1
                );
                block
            }
        };

        self.locked.entry(frame).or_default().push(block);
        Ok(block)
    }

    #[inline]
    pub fn limits(&self) -> DescriptorPoolLimits {
        self.limits
    }

    #[inline]
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Number of blocks locked to `frame`.
    pub fn locked_count(&self, frame: D::Framebuffer) -> usize {
        self.locked.get(&frame).map_or(0, Vec::len)
    }

    /// Number of blocks created so far.
    pub fn total(&self) -> usize {
        self.available.len() + self.locked.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_available(&self, block: D::DescriptorPool) -> bool {
        self.available.contains(&block)
    }

    /// Frames that currently hold blocks.
    pub fn locked_frames(&self) -> Vec<D::Framebuffer> {
        self.locked.keys().copied().collect()
    }
}

impl<D: GpuDevice> Drop for DescriptorSetAllocator<D> {
    fn drop(&mut self) {
        for (frame, blocks) in &self.locked {
            error!(
                "Descriptor set allocator dropped while frame {:?} still holds {} block(s); leaking them",
                frame,
                blocks.len()
            );
        }
        for block in self.available.drain(..) {
            self.device.destroy_descriptor_pool(block);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framecycle_rhi::headless::{FramebufferId, HeadlessDevice, HeadlessLayout};

    const FRAME_A: FramebufferId = FramebufferId(1001);
    const FRAME_B: FramebufferId = FramebufferId(1002);

    fn allocator(limits: DescriptorPoolLimits) -> (Arc<HeadlessDevice>, DescriptorSetAllocator<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new());
        let allocator = DescriptorSetAllocator::new(device.clone(), limits);
        (device, allocator)
    }

    #[test]
    fn test_first_set_locks_a_block() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        let set = allocator
            .get_descriptor_set(FRAME_A, HeadlessLayout::new(1, 0))
            .unwrap();

        assert_eq!(allocator.locked_count(FRAME_A), 1);
        assert_eq!(allocator.available_count(), 0);
        assert!(device.pool_of(set).is_some());
    }

    #[test]
    fn test_sets_of_one_frame_share_a_block() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        let layout = HeadlessLayout::new(1, 1);
        let a = allocator.get_descriptor_set(FRAME_A, layout).unwrap();
        let b = allocator.get_descriptor_set(FRAME_A, layout).unwrap();

        assert_eq!(device.pool_of(a), device.pool_of(b));
        assert_eq!(allocator.total(), 1);
    }

    #[test]
    fn test_frames_use_distinct_blocks() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        let layout = HeadlessLayout::new(1, 0);
        let a = allocator.get_descriptor_set(FRAME_A, layout).unwrap();
        let b = allocator.get_descriptor_set(FRAME_B, layout).unwrap();

        assert_ne!(device.pool_of(a), device.pool_of(b));
        let mut frames = allocator.locked_frames();
        frames.sort();
        assert_eq!(frames, vec![FRAME_A, FRAME_B]);
    }

    #[test]
    fn test_overflow_locks_second_block_and_both_free_together() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::new(2, 2, 2));
        let layout = HeadlessLayout::new(1, 1);

        let sets: Vec<_> = (0..3)
            .map(|_| allocator.get_descriptor_set(FRAME_A, layout).unwrap())
            .collect();

        assert_eq!(allocator.locked_count(FRAME_A), 2);
        assert_eq!(device.pool_of(sets[0]), device.pool_of(sets[1]));
        assert_ne!(device.pool_of(sets[1]), device.pool_of(sets[2]));

        allocator.free_descriptor_pools(FRAME_A).unwrap();
        assert_eq!(allocator.locked_count(FRAME_A), 0);
        assert_eq!(allocator.available_count(), 2);
        assert!(sets.iter().all(|&set| device.pool_of(set).is_none()));
    }

    #[test]
    fn test_locked_block_not_available_until_freed() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        let set = allocator
            .get_descriptor_set(FRAME_A, HeadlessLayout::new(1, 0))
            .unwrap();
        let block = device.pool_of(set).unwrap();

        allocator
            .get_descriptor_set(FRAME_B, HeadlessLayout::new(1, 0))
            .unwrap();
        assert!(!allocator.is_available(block));

        allocator.free_descriptor_pools(FRAME_A).unwrap();
        assert!(allocator.is_available(block));
    }

    #[test]
    fn test_freed_block_is_reused_without_creating() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        let layout = HeadlessLayout::new(1, 0);
        allocator.get_descriptor_set(FRAME_A, layout).unwrap();
        allocator.free_descriptor_pools(FRAME_A).unwrap();

        allocator.get_descriptor_set(FRAME_B, layout).unwrap();
        assert_eq!(device.counters().descriptor_pools_created, 1);
        assert_eq!(allocator.total(), 1);
    }

    #[test]
    fn test_oversized_layout_is_capacity_error() {
        let (_device, mut allocator) = allocator(DescriptorPoolLimits::new(4, 2, 0));
        let err = allocator
            .get_descriptor_set(FRAME_A, HeadlessLayout::new(3, 0))
            .unwrap_err();

        assert!(matches!(err, FrameError::DescriptorCapacity { .. }));
        allocator.free_descriptor_pools(FRAME_A).unwrap();
        assert_eq!(allocator.locked_count(FRAME_A), 0);
    }

    #[test]
    fn test_free_unknown_frame_is_noop() {
        let (_device, mut allocator) = allocator(DescriptorPoolLimits::default());
        allocator.free_descriptor_pools(FRAME_B).unwrap();
        assert_eq!(allocator.total(), 0);
    }

    #[test]
    fn test_drop_destroys_available_blocks() {
        let (device, mut allocator) = allocator(DescriptorPoolLimits::default());
        allocator
            .get_descriptor_set(FRAME_A, HeadlessLayout::new(1, 0))
            .unwrap();
        allocator.free_descriptor_pools(FRAME_A).unwrap();
        assert_eq!(device.live_descriptor_pools(), 1);

        drop(allocator);
        assert_eq!(device.live_descriptor_pools(), 0);
    }
}

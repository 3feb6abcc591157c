//! Command buffer recycling.
//!
//! [`CommandBufferAllocator`] owns one command pool and hands out primary
//! command buffers. Buffers come back through `release` once the frame
//! controller has seen the GPU finish with them, and are reused in LIFO order
//! so a steady frame loop settles on a fixed set of handles.
//!
//! ```text
//!              acquire                      release (after fence)
//!   free ───────────────────▶ in_use ──────────────────────────▶ free
//!     ▲                                                             │
//!     └───── allocate_command_buffer when free is empty ────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, error, trace};

use framecycle_rhi::RhiResult;
use framecycle_rhi::backend::GpuDevice;

use crate::error::{FrameError, FrameResult};

/// Pool-backed allocator of reusable command buffers.
///
/// # Thread Safety
///
/// Not synchronized. The allocator is owned by one frame controller and used
/// from the render thread only.
pub struct CommandBufferAllocator<D: GpuDevice> {
    device: Arc<D>,
    pool: D::CommandPool,
    /// Buffers ready for reuse. The most recently released is handed out first.
    free: Vec<D::CommandBuffer>,
    in_use: HashSet<D::CommandBuffer>,
}

impl<D: GpuDevice> CommandBufferAllocator<D> {
    /// Creates an allocator with an empty pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the command pool cannot be created.
    pub fn new(device: Arc<D>) -> RhiResult<Self> {
        let pool = device.create_command_pool()?;
        debug!("Command buffer allocator created ({:?})", pool);

        Ok(Self {
            device,
            pool,
            free: Vec::new(),
            in_use: HashSet::new(),
        })
    }

    /// Hands out a command buffer that no pending GPU work references.
    ///
    /// A recycled buffer is preferred; the pool grows only when none is free.
    ///
    /// # Errors
    ///
    /// Returns the device error if a new buffer cannot be allocated.
    pub fn acquire(&mut self) -> RhiResult<D::CommandBuffer> {
        let cmd = match self.free.pop() {
            Some(cmd) => {
                trace!("Reusing command buffer {:?}", cmd);
                cmd
            }
            None => {
                let cmd = self.device.allocate_command_buffer(self.pool)?;
                debug!(
                    "Allocated command buffer {:?} ({} total)",
                    cmd,
                    self.total() + 1
                );
                cmd
            }
        };

        self.in_use.insert(cmd);
        Ok(cmd)
    }

    /// Returns `cmd` to the free list.
    ///
    /// Only valid once the GPU work that used `cmd` has completed.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::UnknownCommandBuffer`] if `cmd` is not in use.
    pub(crate) fn release(&mut self, cmd: D::CommandBuffer) -> FrameResult<()> {
        if !self.in_use.remove(&cmd) {
            return Err(FrameError::UnknownCommandBuffer);
        }
        self.free.push(cmd);
        Ok(())
    }

    /// Number of buffers allocated from the pool.
    #[inline]
    pub fn total(&self) -> usize {
        self.free.len() + self.in_use.len()
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    #[inline]
    pub fn is_in_use(&self, cmd: D::CommandBuffer) -> bool {
        self.in_use.contains(&cmd)
    }
}

impl<D: GpuDevice> Drop for CommandBufferAllocator<D> {
    fn drop(&mut self) {
        if !self.in_use.is_empty() {
            error!(
                "Command buffer allocator dropped with {} buffer(s) still in use",
                self.in_use.len()
            );
        }
        self.device.destroy_command_pool(self.pool);
        debug!("Command buffer allocator destroyed ({} buffers)", self.total());
    }
}

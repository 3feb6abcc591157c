//! In-process software device.
//!
//! [`HeadlessDevice`] implements [`GpuDevice`] without a GPU. It keeps the
//! bookkeeping a driver would keep (command buffer states, descriptor pool
//! capacity, fences and pending submissions) and rejects the misuse a real
//! driver would turn into undefined behavior, such as re-recording a command
//! buffer that is still pending or resetting a descriptor pool whose sets are
//! bound in pending work.
//!
//! Submitted work completes when its fence is waited on, unless the device has
//! been [stalled](HeadlessDevice::set_stalled).
//!
//! [`HeadlessTarget`] is the matching [`RenderTarget`]: a fixed ring of images
//! with the acquire/present rules of a presentation engine.
//!
//! # Example
//!
//! ```
//! use framecycle_rhi::backend::GpuDevice;
//! use framecycle_rhi::headless::{CommandBufferState, HeadlessDevice};
//!
//! let device = HeadlessDevice::new();
//! let pool = device.create_command_pool()?;
//! let cmd = device.allocate_command_buffer(pool)?;
//! let fence = device.create_fence(false)?;
//!
//! device.begin_command_buffer(cmd)?;
//! device.cmd_draw(cmd, 3, 1, 0, 0);
//! device.end_command_buffer(cmd)?;
//! device.submit(&[cmd], fence)?;
//! assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Pending));
//!
//! device.wait_for_fence(fence, None)?;
//! assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Executable));
//! # Ok::<(), framecycle_rhi::RhiError>(())
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use tracing::{debug, error, trace, warn};

use crate::backend::GpuDevice;
use crate::descriptor::DescriptorPoolLimits;
use crate::error::{RhiError, RhiResult};
use crate::render_target::{FrameImage, RenderTarget};

macro_rules! handle_type {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

handle_type! {
    CommandPoolId;
    CommandBufferId;
    DescriptorPoolId;
    DescriptorSetId;
    FenceId;
    FramebufferId;
    RenderPassId;
    PipelineId;
    PipelineLayoutId;
    BufferId;
}

/// Descriptor set layout of the headless device: how many descriptors of each
/// pool type one set consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeadlessLayout {
    pub buffers: u32,
    pub textures: u32,
}

impl HeadlessLayout {
    pub const fn new(buffers: u32, textures: u32) -> Self {
        Self { buffers, textures }
    }
}

/// Lifecycle state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

/// A command recorded into a headless command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        framebuffer: FramebufferId,
        render_pass: RenderPassId,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    },
    EndRenderPass,
    SetViewportScissor(vk::Extent2D),
    BindPipeline(PipelineId),
    BindDescriptorSet {
        layout: PipelineLayoutId,
        set_index: u32,
        set: DescriptorSetId,
    },
    BindVertexBuffer {
        buffer: BufferId,
        offset: vk::DeviceSize,
    },
    BindIndexBuffer {
        buffer: BufferId,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
}

/// Running totals of device activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeadlessCounters {
    pub command_buffers_allocated: u64,
    pub descriptor_pools_created: u64,
    pub descriptor_sets_allocated: u64,
    pub descriptor_pool_resets: u64,
    pub submissions: u64,
    pub fence_waits: u64,
}

struct CommandBufferRecord {
    pool: CommandPoolId,
    state: CommandBufferState,
    commands: Vec<RecordedCommand>,
}

struct DescriptorPoolRecord {
    limits: DescriptorPoolLimits,
    sets: u32,
    buffers: u32,
    textures: u32,
}

struct FenceRecord {
    signaled: bool,
    pending: Vec<CommandBufferId>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    command_pools: HashSet<CommandPoolId>,
    command_buffers: HashMap<CommandBufferId, CommandBufferRecord>,
    descriptor_pools: HashMap<DescriptorPoolId, DescriptorPoolRecord>,
    descriptor_sets: HashMap<DescriptorSetId, DescriptorPoolId>,
    fences: HashMap<FenceId, FenceRecord>,
    submissions: Vec<Vec<CommandBufferId>>,
    counters: HeadlessCounters,
    violations: Vec<String>,
    stalled: bool,
    fail_next_submit: bool,
    fail_next_descriptor_reset: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn violation(&mut self, message: String) {
        error!("Headless device misuse: {}", message);
        self.violations.push(message);
    }

    fn record(&mut self, cmd: CommandBufferId, command: RecordedCommand) {
        match self.command_buffers.get_mut(&cmd) {
            Some(record) if record.state == CommandBufferState::Recording => {
                record.commands.push(command);
            }
            Some(record) => {
                let state = record.state;
                self.violation(format!("{:?} recorded into {:?} in state {:?}", command, cmd, state));
            }
            None => self.violation(format!("{:?} recorded into unknown {:?}", command, cmd)),
        }
    }

    /// Pools with at least one set bound by a pending command buffer.
    fn pools_in_flight(&self) -> HashSet<DescriptorPoolId> {
        self.command_buffers
            .values()
            .filter(|record| record.state == CommandBufferState::Pending)
            .flat_map(|record| record.commands.iter())
            .filter_map(|command| match command {
                RecordedCommand::BindDescriptorSet { set, .. } => {
                    self.descriptor_sets.get(set).copied()
                }
                _ => None,
            })
            .collect()
    }

    fn complete_fence(&mut self, fence: FenceId) {
        let Some(record) = self.fences.get_mut(&fence) else {
            return;
        };
        record.signaled = true;
        for cmd in std::mem::take(&mut record.pending) {
            if let Some(buffer) = self.command_buffers.get_mut(&cmd) {
                buffer.state = CommandBufferState::Executable;
            }
        }
    }
}

/// Software implementation of [`GpuDevice`].
#[derive(Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // =========================================================================
    // Test Controls
    // =========================================================================

    /// While stalled, submitted work never completes and fence waits time out.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
    }

    /// Makes the next [`submit`](GpuDevice::submit) fail with `ERROR_DEVICE_LOST`.
    pub fn fail_next_submit(&self) {
        self.state().fail_next_submit = true;
    }

    /// Makes the next [`reset_descriptor_pool`](GpuDevice::reset_descriptor_pool)
    /// fail with `ERROR_OUT_OF_HOST_MEMORY`.
    pub fn fail_next_descriptor_reset(&self) {
        self.state().fail_next_descriptor_reset = true;
    }

    /// Completes every pending submission, as if the GPU caught up.
    pub fn complete_pending(&self) {
        let mut state = self.state();
        let fences: Vec<FenceId> = state
            .fences
            .iter()
            .filter(|(_, record)| !record.pending.is_empty())
            .map(|(&fence, _)| fence)
            .collect();
        for fence in fences {
            state.complete_fence(fence);
        }
    }

    // =========================================================================
    // Handles Outside the Frame Layer
    // =========================================================================

    pub fn create_render_pass(&self) -> RenderPassId {
        RenderPassId(self.state().next_id())
    }

    pub fn create_framebuffer(&self) -> FramebufferId {
        FramebufferId(self.state().next_id())
    }

    pub fn create_pipeline(&self) -> PipelineId {
        PipelineId(self.state().next_id())
    }

    pub fn create_pipeline_layout(&self) -> PipelineLayoutId {
        PipelineLayoutId(self.state().next_id())
    }

    pub fn create_buffer(&self) -> BufferId {
        BufferId(self.state().next_id())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn counters(&self) -> HeadlessCounters {
        self.state().counters
    }

    pub fn command_buffer_state(&self, cmd: CommandBufferId) -> Option<CommandBufferState> {
        self.state().command_buffers.get(&cmd).map(|record| record.state)
    }

    /// Commands recorded into `cmd` since its last begin.
    pub fn commands(&self, cmd: CommandBufferId) -> Vec<RecordedCommand> {
        self.state()
            .command_buffers
            .get(&cmd)
            .map(|record| record.commands.clone())
            .unwrap_or_default()
    }

    /// Every submitted batch, oldest first.
    pub fn submissions(&self) -> Vec<Vec<CommandBufferId>> {
        self.state().submissions.clone()
    }

    /// Number of sets currently allocated from `pool`.
    pub fn descriptor_sets_in(&self, pool: DescriptorPoolId) -> Option<u32> {
        self.state().descriptor_pools.get(&pool).map(|record| record.sets)
    }

    /// Returns the pool `set` was allocated from, if the set is still valid.
    pub fn pool_of(&self, set: DescriptorSetId) -> Option<DescriptorPoolId> {
        self.state().descriptor_sets.get(&set).copied()
    }

    pub fn is_descriptor_pool_in_flight(&self, pool: DescriptorPoolId) -> bool {
        self.state().pools_in_flight().contains(&pool)
    }

    pub fn live_command_pools(&self) -> usize {
        self.state().command_pools.len()
    }

    pub fn live_descriptor_pools(&self) -> usize {
        self.state().descriptor_pools.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state().fences.len()
    }

    /// Misuse that did not surface as an error, e.g. recording outside begin/end.
    pub fn violations(&self) -> Vec<String> {
        self.state().violations.clone()
    }
}

impl GpuDevice for HeadlessDevice {
    type CommandPool = CommandPoolId;
    type CommandBuffer = CommandBufferId;
    type DescriptorPool = DescriptorPoolId;
    type DescriptorSet = DescriptorSetId;
    type DescriptorSetLayout = HeadlessLayout;
    type PipelineLayout = PipelineLayoutId;
    type Pipeline = PipelineId;
    type Buffer = BufferId;
    type Fence = FenceId;
    type Framebuffer = FramebufferId;
    type RenderPass = RenderPassId;

    fn create_command_pool(&self) -> RhiResult<CommandPoolId> {
        let mut state = self.state();
        let pool = CommandPoolId(state.next_id());
        state.command_pools.insert(pool);
        debug!("Headless command pool {:?} created", pool);
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: CommandPoolId) {
        let mut state = self.state();
        if !state.command_pools.remove(&pool) {
            state.violation(format!("destroying unknown {:?}", pool));
            return;
        }
        let pending = state
            .command_buffers
            .values()
            .any(|r| r.pool == pool && r.state == CommandBufferState::Pending);
        if pending {
            state.violation(format!("{:?} destroyed with pending command buffers", pool));
        }
        state.command_buffers.retain(|_, record| record.pool != pool);
        debug!("Headless command pool {:?} destroyed", pool);
    }

    fn allocate_command_buffer(&self, pool: CommandPoolId) -> RhiResult<CommandBufferId> {
        let mut state = self.state();
        if !state.command_pools.contains(&pool) {
            return Err(RhiError::InvalidHandle(format!("{:?}", pool)));
        }
        let cmd = CommandBufferId(state.next_id());
        state.command_buffers.insert(
            cmd,
            CommandBufferRecord {
                pool,
                state: CommandBufferState::Initial,
                commands: Vec::new(),
            },
        );
        state.counters.command_buffers_allocated += 1;
        trace!("Headless command buffer {:?} allocated", cmd);
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: CommandBufferId) -> RhiResult<()> {
        let mut state = self.state();
        let record = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", cmd)))?;
        match record.state {
            CommandBufferState::Pending => Err(RhiError::InvalidHandle(format!(
                "{:?} is still pending on the GPU",
                cmd
            ))),
            CommandBufferState::Recording => Err(RhiError::InvalidHandle(format!(
                "{:?} is already recording",
                cmd
            ))),
            CommandBufferState::Initial | CommandBufferState::Executable => {
                record.state = CommandBufferState::Recording;
                record.commands.clear();
                Ok(())
            }
        }
    }

    fn end_command_buffer(&self, cmd: CommandBufferId) -> RhiResult<()> {
        let mut state = self.state();
        let record = state
            .command_buffers
            .get_mut(&cmd)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", cmd)))?;
        if record.state != CommandBufferState::Recording {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} is not recording ({:?})",
                cmd, record.state
            )));
        }
        record.state = CommandBufferState::Executable;
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: CommandBufferId,
        image: &FrameImage<Self>,
        clear_color: [f32; 4],
    ) {
        self.state().record(
            cmd,
            RecordedCommand::BeginRenderPass {
                framebuffer: image.framebuffer,
                render_pass: image.render_pass,
                extent: image.extent,
                clear_color,
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: CommandBufferId) {
        self.state().record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_set_viewport_scissor(&self, cmd: CommandBufferId, extent: vk::Extent2D) {
        self.state()
            .record(cmd, RecordedCommand::SetViewportScissor(extent));
    }

    fn cmd_bind_pipeline(&self, cmd: CommandBufferId, pipeline: PipelineId) {
        self.state().record(cmd, RecordedCommand::BindPipeline(pipeline));
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: CommandBufferId,
        layout: PipelineLayoutId,
        set_index: u32,
        set: DescriptorSetId,
    ) {
        let mut state = self.state();
        if !state.descriptor_sets.contains_key(&set) {
            state.violation(format!("binding invalid {:?}", set));
        }
        state.record(
            cmd,
            RecordedCommand::BindDescriptorSet {
                layout,
                set_index,
                set,
            },
        );
    }

    fn cmd_bind_vertex_buffer(&self, cmd: CommandBufferId, buffer: BufferId, offset: vk::DeviceSize) {
        self.state()
            .record(cmd, RecordedCommand::BindVertexBuffer { buffer, offset });
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: CommandBufferId,
        buffer: BufferId,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            },
        );
    }

    fn cmd_draw(
        &self,
        cmd: CommandBufferId,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        cmd: CommandBufferId,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.state().record(
            cmd,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            },
        );
    }

    fn create_descriptor_pool(&self, limits: &DescriptorPoolLimits) -> RhiResult<DescriptorPoolId> {
        let mut state = self.state();
        let pool = DescriptorPoolId(state.next_id());
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolRecord {
                limits: *limits,
                sets: 0,
                buffers: 0,
                textures: 0,
            },
        );
        state.counters.descriptor_pools_created += 1;
        debug!("Headless descriptor pool {:?} created", pool);
        Ok(pool)
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolId,
        layout: HeadlessLayout,
    ) -> RhiResult<DescriptorSetId> {
        let mut state = self.state();
        let record = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", pool)))?;

        let fits = record.sets < record.limits.max_sets
            && record.buffers + layout.buffers <= record.limits.max_uniform_buffers
            && record.textures + layout.textures <= record.limits.max_textures;
        if !fits {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }

        record.sets += 1;
        record.buffers += layout.buffers;
        record.textures += layout.textures;

        let set = DescriptorSetId(state.next_id());
        state.descriptor_sets.insert(set, pool);
        state.counters.descriptor_sets_allocated += 1;
        Ok(set)
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolId) -> RhiResult<()> {
        let mut state = self.state();
        if !state.descriptor_pools.contains_key(&pool) {
            return Err(RhiError::InvalidHandle(format!("{:?}", pool)));
        }
        if std::mem::take(&mut state.fail_next_descriptor_reset) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        if state.pools_in_flight().contains(&pool) {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} has sets bound by pending work",
                pool
            )));
        }

        state.descriptor_sets.retain(|_, owner| *owner != pool);
        if let Some(record) = state.descriptor_pools.get_mut(&pool) {
            record.sets = 0;
            record.buffers = 0;
            record.textures = 0;
        }
        state.counters.descriptor_pool_resets += 1;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolId) {
        let mut state = self.state();
        if state.pools_in_flight().contains(&pool) {
            state.violation(format!("{:?} destroyed while in flight", pool));
        }
        if state.descriptor_pools.remove(&pool).is_none() {
            state.violation(format!("destroying unknown {:?}", pool));
        }
        state.descriptor_sets.retain(|_, owner| *owner != pool);
        debug!("Headless descriptor pool {:?} destroyed", pool);
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<FenceId> {
        let mut state = self.state();
        let fence = FenceId(state.next_id());
        state.fences.insert(
            fence,
            FenceRecord {
                signaled,
                pending: Vec::new(),
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) {
        let mut state = self.state();
        match state.fences.remove(&fence) {
            Some(record) if !record.pending.is_empty() => {
                state.violation(format!("{:?} destroyed with pending work", fence));
            }
            Some(_) => {}
            None => state.violation(format!("destroying unknown {:?}", fence)),
        }
    }

    fn reset_fence(&self, fence: FenceId) -> RhiResult<()> {
        let mut state = self.state();
        let record = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;
        if !record.pending.is_empty() {
            return Err(RhiError::InvalidHandle(format!(
                "{:?} reset while work is pending",
                fence
            )));
        }
        record.signaled = false;
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceId, timeout: Option<Duration>) -> RhiResult<()> {
        let mut state = self.state();
        state.counters.fence_waits += 1;
        let record = state
            .fences
            .get(&fence)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))?;

        if record.signaled {
            return Ok(());
        }
        if record.pending.is_empty() {
            // Nothing will ever signal it.
            warn!("Waiting on {:?} with no work submitted", fence);
            return Err(RhiError::Timeout);
        }
        if state.stalled {
            trace!("Headless device stalled, wait on {:?} ({:?}) times out", fence, timeout);
            return Err(RhiError::Timeout);
        }

        state.complete_fence(fence);
        Ok(())
    }

    fn submit(&self, command_buffers: &[CommandBufferId], fence: FenceId) -> RhiResult<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_submit) {
            return Err(RhiError::VulkanError(vk::Result::ERROR_DEVICE_LOST));
        }

        match state.fences.get(&fence) {
            None => return Err(RhiError::InvalidHandle(format!("{:?}", fence))),
            Some(record) if record.signaled || !record.pending.is_empty() => {
                return Err(RhiError::InvalidHandle(format!(
                    "{:?} must be unsignaled and idle at submit",
                    fence
                )));
            }
            Some(_) => {}
        }

        for cmd in command_buffers {
            match state.command_buffers.get(cmd) {
                Some(record) if record.state == CommandBufferState::Executable => {}
                Some(record) => {
                    return Err(RhiError::InvalidHandle(format!(
                        "{:?} submitted in state {:?}",
                        cmd, record.state
                    )));
                }
                None => return Err(RhiError::InvalidHandle(format!("{:?}", cmd))),
            }
        }

        for cmd in command_buffers {
            if let Some(record) = state.command_buffers.get_mut(cmd) {
                record.state = CommandBufferState::Pending;
            }
        }
        if let Some(record) = state.fences.get_mut(&fence) {
            record.pending.extend_from_slice(command_buffers);
        }
        // An empty batch still signals its fence.
        let stalled = state.stalled;
        if command_buffers.is_empty()
            && let Some(record) = state.fences.get_mut(&fence)
        {
            record.signaled = !stalled;
        }

        state.submissions.push(command_buffers.to_vec());
        state.counters.submissions += 1;
        trace!("Headless submit of {} command buffer(s)", command_buffers.len());
        Ok(())
    }

    fn wait_idle(&self) -> RhiResult<()> {
        if self.state().stalled {
            return Err(RhiError::Timeout);
        }
        self.complete_pending();
        Ok(())
    }
}

/// Software [`RenderTarget`] over a fixed ring of images.
///
/// Images are handed out in order. An image stays outstanding from acquire
/// until it is presented; when every image is outstanding, acquire times out.
pub struct HeadlessTarget {
    render_pass: RenderPassId,
    framebuffers: Vec<FramebufferId>,
    extent: vk::Extent2D,
    next: u32,
    outstanding: HashSet<u32>,
    presented: Vec<u32>,
    out_of_date: bool,
    fail_next_present: Option<vk::Result>,
}

impl HeadlessTarget {
    /// Creates a target with `image_count` images whose handles come from `device`.
    pub fn new(device: &HeadlessDevice, image_count: u32, extent: vk::Extent2D) -> Self {
        let render_pass = device.create_render_pass();
        let framebuffers = (0..image_count).map(|_| device.create_framebuffer()).collect();
        Self {
            render_pass,
            framebuffers,
            extent,
            next: 0,
            outstanding: HashSet::new(),
            presented: Vec::new(),
            out_of_date: false,
            fail_next_present: None,
        }
    }

    /// Simulates a surface change; acquire and present fail until cleared.
    pub fn set_out_of_date(&mut self, out_of_date: bool) {
        self.out_of_date = out_of_date;
    }

    /// Makes the next present fail with `result`.
    pub fn fail_next_present(&mut self, result: vk::Result) {
        self.fail_next_present = Some(result);
    }

    /// Indices of presented images, oldest first.
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    /// Number of acquired images not yet presented.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}

impl RenderTarget<HeadlessDevice> for HeadlessTarget {
    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn render_pass(&self) -> RenderPassId {
        self.render_pass
    }

    fn image_count(&self) -> u32 {
        self.framebuffers.len() as u32
    }

    fn image(&self, index: u32) -> Option<FrameImage<HeadlessDevice>> {
        self.framebuffers
            .get(index as usize)
            .map(|&framebuffer| FrameImage {
                index,
                framebuffer,
                render_pass: self.render_pass,
                extent: self.extent,
            })
    }

    fn acquire(&mut self, _timeout: Option<Duration>) -> RhiResult<FrameImage<HeadlessDevice>> {
        if self.out_of_date {
            return Err(RhiError::SurfaceOutOfDate);
        }
        let count = self.image_count();
        if count == 0 || self.outstanding.len() as u32 == count {
            return Err(RhiError::Timeout);
        }

        let index = (0..count)
            .map(|offset| (self.next + offset) % count)
            .find(|index| !self.outstanding.contains(index))
            .ok_or(RhiError::Timeout)?;
        self.next = (index + 1) % count;
        self.outstanding.insert(index);

        self.image(index).ok_or(RhiError::Timeout)
    }

    fn present(&mut self, image: &FrameImage<HeadlessDevice>) -> RhiResult<()> {
        if !self.owns(image) {
            return Err(RhiError::ForeignImage);
        }
        if self.out_of_date {
            return Err(RhiError::SurfaceOutOfDate);
        }
        if let Some(result) = self.fail_next_present.take() {
            return Err(RhiError::PresentFailed(result));
        }

        self.outstanding.remove(&image.index);
        self.presented.push(image.index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent() -> vk::Extent2D {
        vk::Extent2D {
            width: 64,
            height: 32,
        }
    }

    #[test]
    fn test_pending_buffer_cannot_be_rerecorded() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(false).unwrap();

        device.begin_command_buffer(cmd).unwrap();
        device.end_command_buffer(cmd).unwrap();
        device.submit(&[cmd], fence).unwrap();

        assert!(device.begin_command_buffer(cmd).is_err());
        device.wait_for_fence(fence, None).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        assert!(device.violations().is_empty());
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = HeadlessDevice::new();
        let pool = device
            .create_descriptor_pool(&DescriptorPoolLimits::new(8, 3, 0))
            .unwrap();
        let layout = HeadlessLayout::new(2, 0);

        device.allocate_descriptor_set(pool, layout).unwrap();
        let err = device.allocate_descriptor_set(pool, layout).unwrap_err();
        assert!(err.is_pool_exhausted());

        device.reset_descriptor_pool(pool).unwrap();
        assert_eq!(device.descriptor_sets_in(pool), Some(0));
        device.allocate_descriptor_set(pool, layout).unwrap();
    }

    #[test]
    fn test_reset_rejected_while_bound_in_pending_work() {
        let device = HeadlessDevice::new();
        let cmd_pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(cmd_pool).unwrap();
        let fence = device.create_fence(false).unwrap();
        let pool = device
            .create_descriptor_pool(&DescriptorPoolLimits::default())
            .unwrap();
        let set = device
            .allocate_descriptor_set(pool, HeadlessLayout::new(1, 0))
            .unwrap();

        device.begin_command_buffer(cmd).unwrap();
        device.cmd_bind_descriptor_set(cmd, device.create_pipeline_layout(), 0, set);
        device.end_command_buffer(cmd).unwrap();
        device.submit(&[cmd], fence).unwrap();

        assert!(device.is_descriptor_pool_in_flight(pool));
        assert!(device.reset_descriptor_pool(pool).is_err());

        device.wait_for_fence(fence, None).unwrap();
        assert!(!device.is_descriptor_pool_in_flight(pool));
        device.reset_descriptor_pool(pool).unwrap();
        assert_eq!(device.pool_of(set), None);
    }

    #[test]
    fn test_stalled_device_times_out() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device.end_command_buffer(cmd).unwrap();
        device.submit(&[cmd], fence).unwrap();

        device.set_stalled(true);
        assert!(matches!(
            device.wait_for_fence(fence, Some(Duration::from_millis(1))),
            Err(RhiError::Timeout)
        ));
        assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Pending));

        device.set_stalled(false);
        device.wait_for_fence(fence, None).unwrap();
    }

    #[test]
    fn test_failed_submit_changes_nothing() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.begin_command_buffer(cmd).unwrap();
        device.end_command_buffer(cmd).unwrap();

        device.fail_next_submit();
        assert!(device.submit(&[cmd], fence).is_err());
        assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Executable));
        assert!(device.submissions().is_empty());

        device.submit(&[cmd], fence).unwrap();
        assert_eq!(device.submissions(), vec![vec![cmd]]);
    }

    #[test]
    fn test_recording_outside_begin_is_a_violation() {
        let device = HeadlessDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.cmd_draw(cmd, 3, 1, 0, 0);
        assert_eq!(device.violations().len(), 1);
    }

    #[test]
    fn test_target_rotates_and_blocks_when_exhausted() {
        let device = HeadlessDevice::new();
        let mut target = HeadlessTarget::new(&device, 2, extent());

        let first = target.acquire(None).unwrap();
        let second = target.acquire(None).unwrap();
        assert_eq!((first.index, second.index), (0, 1));
        assert!(matches!(target.acquire(None), Err(RhiError::Timeout)));

        target.present(&first).unwrap();
        assert_eq!(target.acquire(None).unwrap().index, 0);
        assert_eq!(target.presented(), &[0]);
    }

    #[test]
    fn test_target_rejects_foreign_image() {
        let device = HeadlessDevice::new();
        let mut target = HeadlessTarget::new(&device, 2, extent());
        let mut other = HeadlessTarget::new(&device, 2, extent());

        let foreign = other.acquire(None).unwrap();
        assert!(matches!(target.present(&foreign), Err(RhiError::ForeignImage)));
        assert!(target.presented().is_empty());
    }

    #[test]
    fn test_target_out_of_date() {
        let device = HeadlessDevice::new();
        let mut target = HeadlessTarget::new(&device, 3, extent());
        target.set_out_of_date(true);
        assert!(matches!(target.acquire(None), Err(RhiError::SurfaceOutOfDate)));
    }

    #[test]
    fn test_headless_device_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HeadlessDevice>();
    }
}

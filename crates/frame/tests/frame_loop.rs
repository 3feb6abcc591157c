//! End-to-end frame loops on the headless device.

use std::collections::HashSet;
use std::sync::Arc;

use framecycle_frame::{FrameController, FrameError, FrameSettings, FrameState};
use framecycle_rhi::RhiError;
use framecycle_rhi::descriptor::DescriptorPoolLimits;
use framecycle_rhi::headless::{
    CommandBufferState, HeadlessDevice, HeadlessLayout, HeadlessTarget, RecordedCommand,
};
use framecycle_rhi::render_target::RenderTarget;
use framecycle_rhi::vk;

type Controller = FrameController<HeadlessDevice, HeadlessTarget>;

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 800,
    height: 600,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn setup(images: u32, settings: FrameSettings) -> (Arc<HeadlessDevice>, Controller) {
    init_tracing();
    let device = Arc::new(HeadlessDevice::new());
    let target = HeadlessTarget::new(&device, images, EXTENT);
    let controller = FrameController::new(device.clone(), target, settings).unwrap();
    (device, controller)
}

/// Runs one frame that records `buffers` command buffers and allocates `sets`
/// descriptor sets, returning the buffer handles.
fn run_frame(
    controller: &mut Controller,
    buffers: usize,
    sets: usize,
    layout: HeadlessLayout,
) -> Vec<framecycle_rhi::headless::CommandBufferId> {
    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();

    let mut handles = Vec::new();
    for _ in 0..buffers {
        let mut recorder = controller.start_command_buffer().unwrap();
        recorder.begin_render_pass([0.0, 0.0, 0.0, 1.0]);
        recorder.draw(3, 1, 0, 0);
        handles.push(recorder.handle());
        recorder.end().unwrap();
    }
    for _ in 0..sets {
        controller.descriptor_set(layout).unwrap();
    }

    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    controller.present(&image).unwrap();
    handles
}

#[test]
fn steady_state_converges_to_high_water_mark() {
    let (device, mut controller) = setup(3, FrameSettings::default());

    for _ in 0..20 {
        run_frame(&mut controller, 4, 0, HeadlessLayout::default());
    }

    assert_eq!(controller.command_buffers().total(), 4);
    assert_eq!(device.counters().command_buffers_allocated, 4);
    assert_eq!(controller.frames_completed(), 20);
    assert!(device.violations().is_empty());
}

#[test]
fn buffers_of_a_frame_are_distinct() {
    let (_device, mut controller) = setup(2, FrameSettings::default());
    let handles = run_frame(&mut controller, 5, 0, HeadlessLayout::default());
    let unique: HashSet<_> = handles.iter().collect();
    assert_eq!(unique.len(), 5);
}

#[test]
fn empty_frame_buffer_is_reused_by_next_frame() {
    let (device, mut controller) = setup(2, FrameSettings::default());

    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let first = controller.start_command_buffer().unwrap();
    let first_handle = first.handle();
    first.end().unwrap();
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    controller.present(&image).unwrap();

    let second = run_frame(&mut controller, 1, 0, HeadlessLayout::default());
    assert_eq!(second, vec![first_handle]);
    assert_eq!(device.counters().command_buffers_allocated, 1);
}

#[test]
fn submitted_buffers_stay_in_use_until_wait() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let recorder = controller.start_command_buffer().unwrap();
    let cmd = recorder.handle();
    recorder.end().unwrap();
    controller.end_frame().unwrap();

    assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Pending));
    assert!(controller.command_buffers().is_in_use(cmd));
    assert_eq!(controller.command_buffers().free_count(), 0);

    controller.wait_end_of_render().unwrap();
    assert_eq!(device.command_buffer_state(cmd), Some(CommandBufferState::Executable));
    assert_eq!(controller.command_buffers().free_count(), 1);
}

#[test]
fn frame_buffers_are_submitted_in_start_order() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    let handles = run_frame(&mut controller, 3, 0, HeadlessLayout::default());
    assert_eq!(device.submissions(), vec![handles]);
}

#[test]
fn descriptor_blocks_locked_until_frame_completes() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    let layout = HeadlessLayout::new(1, 1);

    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let set = controller.descriptor_set(layout).unwrap();
    let block = device.pool_of(set).unwrap();

    let mut recorder = controller.start_command_buffer().unwrap();
    recorder.begin_render_pass([0.0; 4]);
    recorder.bind_descriptor_set(device.create_pipeline_layout(), 0, set);
    recorder.draw(3, 1, 0, 0);
    recorder.end().unwrap();
    controller.end_frame().unwrap();

    assert!(device.is_descriptor_pool_in_flight(block));
    assert!(!controller.descriptor_sets().is_available(block));
    assert_eq!(controller.descriptor_sets().locked_frames(), vec![image.framebuffer]);

    controller.wait_end_of_render().unwrap();
    assert!(controller.descriptor_sets().is_available(block));
    assert!(controller.descriptor_sets().locked_frames().is_empty());
    assert!(device.violations().is_empty());
}

#[test]
fn overflowing_layout_spills_into_second_block() {
    let settings = FrameSettings {
        descriptor_limits: DescriptorPoolLimits::new(4, 4, 4),
        ..Default::default()
    };
    let (device, mut controller) = setup(2, settings);
    let layout = HeadlessLayout::new(1, 1);

    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let sets: Vec<_> = (0..6)
        .map(|_| controller.descriptor_set(layout).unwrap())
        .collect();

    assert_eq!(controller.descriptor_sets().locked_count(image.framebuffer), 2);
    let blocks: HashSet<_> = sets.iter().filter_map(|&set| device.pool_of(set)).collect();
    assert_eq!(blocks.len(), 2);

    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    assert_eq!(controller.descriptor_sets().available_count(), 2);
    assert!(sets.iter().all(|&set| device.pool_of(set).is_none()));
}

#[test]
fn descriptor_blocks_are_recycled_across_frames() {
    let (device, mut controller) = setup(3, FrameSettings::default());
    let layout = HeadlessLayout::new(1, 0);

    for _ in 0..10 {
        run_frame(&mut controller, 1, 5, layout);
    }

    assert_eq!(device.counters().descriptor_pools_created, 1);
    assert_eq!(controller.descriptor_sets().total(), 1);
    assert_eq!(device.counters().descriptor_pool_resets, 10);
}

#[test]
fn oversized_layout_is_a_capacity_error() {
    let settings = FrameSettings {
        descriptor_limits: DescriptorPoolLimits::new(8, 1, 1),
        ..Default::default()
    };
    let (_device, mut controller) = setup(2, settings);

    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let err = controller
        .descriptor_set(HeadlessLayout::new(2, 0))
        .unwrap_err();
    assert!(matches!(err, FrameError::DescriptorCapacity { .. }));

    // The frame is still usable.
    assert_eq!(controller.state(), FrameState::Recording);
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    assert_eq!(controller.descriptor_sets().locked_count(image.framebuffer), 0);
}

#[test]
fn out_of_sequence_calls_do_not_leak() {
    let (device, mut controller) = setup(2, FrameSettings::default());

    assert!(controller.start_command_buffer().is_err());
    assert!(controller.end_frame().is_err());
    assert!(controller.wait_end_of_render().is_err());
    assert!(controller.descriptor_set(HeadlessLayout::new(1, 0)).is_err());

    assert_eq!(controller.command_buffers().total(), 0);
    assert_eq!(controller.descriptor_sets().total(), 0);
    assert!(device.submissions().is_empty());
    assert_eq!(controller.state(), FrameState::Idle);
}

#[test]
fn presenting_a_foreign_image_fails() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    let mut other = HeadlessTarget::new(&device, 2, EXTENT);
    let foreign = other.acquire(None).unwrap();

    assert!(matches!(
        controller.present(&foreign),
        Err(FrameError::Rhi(RhiError::ForeignImage))
    ));
    assert!(controller.render_target().presented().is_empty());
}

#[test]
fn out_of_date_target_is_replaced() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    run_frame(&mut controller, 1, 1, HeadlessLayout::new(1, 0));

    controller.render_target_mut().set_out_of_date(true);
    assert!(matches!(
        controller.acquire_image(),
        Err(FrameError::Rhi(RhiError::SurfaceOutOfDate))
    ));

    let resized = vk::Extent2D {
        width: 1024,
        height: 768,
    };
    let old = controller
        .replace_render_target(HeadlessTarget::new(&device, 3, resized))
        .unwrap();
    drop(old);

    let image = controller.acquire_image().unwrap();
    assert_eq!(image.extent, resized);
    controller.start_frame(image).unwrap();
    let mut recorder = controller.start_command_buffer().unwrap();
    recorder.begin_render_pass([0.0; 4]);
    let cmd = recorder.handle();
    recorder.end().unwrap();
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    controller.present(&image).unwrap();

    let viewport = device
        .commands(cmd)
        .into_iter()
        .find(|c| matches!(c, RecordedCommand::SetViewportScissor(_)));
    assert_eq!(viewport, Some(RecordedCommand::SetViewportScissor(resized)));
    assert_eq!(controller.command_buffers().total(), 1);
}

#[test]
fn acquire_timeout_when_all_images_outstanding() {
    let (_device, mut controller) = setup(1, FrameSettings::default());
    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();

    assert!(matches!(
        controller.acquire_image(),
        Err(FrameError::Rhi(RhiError::Timeout))
    ));
    controller.present(&image).unwrap();
    assert_eq!(controller.acquire_image().unwrap().index, 0);
}

#[test]
fn failed_present_keeps_image_outstanding() {
    let (_device, mut controller) = setup(2, FrameSettings::default());
    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    controller.start_command_buffer().unwrap().end().unwrap();
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();

    controller
        .render_target_mut()
        .fail_next_present(vk::Result::ERROR_SURFACE_LOST_KHR);
    assert!(matches!(
        controller.present(&image),
        Err(FrameError::Rhi(RhiError::PresentFailed(
            vk::Result::ERROR_SURFACE_LOST_KHR
        )))
    ));
    assert_eq!(controller.render_target().outstanding(), 1);
    assert!(controller.render_target().presented().is_empty());
    assert_eq!(controller.state(), FrameState::Idle);

    controller.present(&image).unwrap();
    assert_eq!(controller.render_target().outstanding(), 0);
    assert_eq!(controller.render_target().presented(), &[image.index]);
}

#[test]
fn unended_recorder_blocks_submission_until_ended() {
    let (device, mut controller) = setup(2, FrameSettings::default());
    let image = controller.acquire_image().unwrap();
    controller.start_frame(image).unwrap();
    let recorder = controller.start_command_buffer().unwrap();

    assert!(matches!(
        controller.end_frame(),
        Err(FrameError::RecordersOpen { open: 1 })
    ));
    drop(recorder);
    controller.end_frame().unwrap();
    controller.wait_end_of_render().unwrap();
    controller.present(&image).unwrap();

    for _ in 0..3 {
        run_frame(&mut controller, 2, 0, HeadlessLayout::default());
    }
    assert_eq!(controller.command_buffers().total(), 2);
    assert!(device.violations().is_empty());
}

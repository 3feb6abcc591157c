//! Frame timing for the render loop.

use std::time::{Duration, Instant};

/// Timing snapshot produced by [`FrameClock::tick`].
#[derive(Debug, Clone, Copy)]
pub struct FrameTime {
    /// Clamped time since the previous tick.
    pub delta: Duration,
    /// Monotonic frame counter, starting at 0.
    pub frame_index: u64,
    /// Frames per second over the last sampling window, reported once per window.
    pub fps: Option<f32>,
}

/// Delta-time clock with a periodic frame-rate sample.
///
/// Delta time is clamped so that a debugger pause or a long blocking wait does
/// not produce a pathological step.
#[derive(Debug, Clone)]
pub struct FrameClock {
    last_tick: Instant,
    window_start: Instant,
    frames_in_window: u32,
    frame_index: u64,
    max_delta: Duration,
    sample_window: Duration,
}

impl FrameClock {
    /// Creates a clock with a 250ms delta clamp and a one second FPS window.
    pub fn new() -> Self {
        Self::with_limits(Duration::from_millis(250), Duration::from_secs(1))
    }

    /// Creates a clock with a custom delta clamp and FPS sampling window.
    pub fn with_limits(max_delta: Duration, sample_window: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_tick: now,
            window_start: now,
            frames_in_window: 0,
            frame_index: 0,
            max_delta,
            sample_window,
        }
    }

    /// Advances the clock by one frame.
    pub fn tick(&mut self) -> FrameTime {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> FrameTime {
        let delta = now
            .saturating_duration_since(self.last_tick)
            .min(self.max_delta);
        self.last_tick = now;
        self.frames_in_window += 1;

        let window = now.saturating_duration_since(self.window_start);
        let fps = if window >= self.sample_window {
            let fps = self.frames_in_window as f32 / window.as_secs_f32();
            self.frames_in_window = 0;
            self.window_start = now;
            Some(fps)
        } else {
            None
        };

        let frame_index = self.frame_index;
        self.frame_index = self.frame_index.wrapping_add(1);

        FrameTime {
            delta,
            frame_index,
            fps,
        }
    }

    /// Number of ticks so far.
    #[inline]
    pub fn frame_count(&self) -> u64 {
        self.frame_index
    }

    /// Restarts timing, e.g. after the window was minimized.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.last_tick = now;
        self.window_start = now;
        self.frames_in_window = 0;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_is_clamped() {
        let mut clock = FrameClock::with_limits(Duration::from_millis(50), Duration::from_secs(10));
        let start = clock.last_tick;
        let time = clock.tick_at(start + Duration::from_secs(3));
        assert_eq!(time.delta, Duration::from_millis(50));
        assert_eq!(time.frame_index, 0);
    }

    #[test]
    fn test_fps_reported_once_per_window() {
        let mut clock = FrameClock::with_limits(Duration::from_millis(250), Duration::from_secs(1));
        let start = clock.window_start;

        for i in 1..10 {
            let time = clock.tick_at(start + Duration::from_millis(100 * i));
            assert!(time.fps.is_none());
        }

        let time = clock.tick_at(start + Duration::from_secs(1));
        let fps = time.fps.expect("window elapsed");
        assert!((fps - 10.0).abs() < 0.01);
        assert_eq!(clock.frame_count(), 10);

        let time = clock.tick_at(start + Duration::from_millis(1100));
        assert!(time.fps.is_none());
    }
}

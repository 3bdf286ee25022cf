//! Adaptive compression level control
//!
//! The writer task feeds this controller one sample per frame: how many
//! bytes went into the compressor, how long compression took, and how
//! long the transport write blocked. Once per window the controller moves
//! the zstd level toward whichever resource has headroom: a blocked
//! writer means the network is the bottleneck and harder compression is
//! free; a saturated compressor with an idle writer means the CPU is the
//! bottleneck and the level backs off. At most one change per window.

use std::time::{Duration, Instant};

use tracing::debug;

/// Inclusive level bounds.
pub const MIN_LEVEL: i32 = 1;
pub const MAX_LEVEL: i32 = 19;
/// Starting level.
pub const INITIAL_LEVEL: i32 = 3;

/// Window closes after this many frames...
const WINDOW_FRAMES: u64 = 64;
/// ...or this many pre-compression bytes, whichever comes first.
const WINDOW_BYTES: u64 = 64 * 1024 * 1024;

/// Writer-blocked fraction above which the level rises.
const BLOCKED_RAISE: f64 = 0.20;
/// Blocked fraction above which it rises by two.
const BLOCKED_RAISE_FAST: f64 = 0.50;
/// Compressor time fraction that counts as CPU saturation.
const CPU_SATURATED: f64 = 0.50;
/// Writer-blocked fraction below which the writer counts as never blocked.
const BLOCKED_NEGLIGIBLE: f64 = 0.01;

pub struct CompressionController {
    level: i32,
    window_start: Instant,
    frames: u64,
    bytes_in: u64,
    bytes_out: u64,
    compress_time: Duration,
    write_wait: Duration,
}

impl CompressionController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: INITIAL_LEVEL,
            window_start: Instant::now(),
            frames: 0,
            bytes_in: 0,
            bytes_out: 0,
            compress_time: Duration::ZERO,
            write_wait: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn level(&self) -> i32 {
        self.level
    }

    /// Record one frame's worth of measurements. Returns the new level
    /// when the window closed with a change; the caller announces it on
    /// the wire before the next frame.
    pub fn record_frame(
        &mut self,
        bytes_in: u64,
        bytes_out: u64,
        compress_time: Duration,
        write_wait: Duration,
    ) -> Option<i32> {
        self.frames += 1;
        self.bytes_in += bytes_in;
        self.bytes_out += bytes_out;
        self.compress_time += compress_time;
        self.write_wait += write_wait;

        if self.frames < WINDOW_FRAMES && self.bytes_in < WINDOW_BYTES {
            return None;
        }
        self.close_window(self.window_start.elapsed())
    }

    /// Evaluate the window that just closed and reset for the next one.
    fn close_window(&mut self, wall: Duration) -> Option<i32> {
        let wall_s = wall.as_secs_f64().max(f64::EPSILON);
        let blocked = self.write_wait.as_secs_f64() / wall_s;
        let cpu = self.compress_time.as_secs_f64() / wall_s;
        let ratio = if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        };

        let old = self.level;
        if blocked > BLOCKED_RAISE && self.level < MAX_LEVEL {
            let step = if blocked > BLOCKED_RAISE_FAST { 2 } else { 1 };
            self.level = (self.level + step).min(MAX_LEVEL);
        } else if cpu > CPU_SATURATED && blocked < BLOCKED_NEGLIGIBLE && self.level > MIN_LEVEL {
            self.level -= 1;
        }

        debug!(
            "compression window: blocked {:.0}%, cpu {:.0}%, ratio {:.2}, level {} -> {}",
            blocked * 100.0,
            cpu * 100.0,
            ratio,
            old,
            self.level
        );

        self.window_start = Instant::now();
        self.frames = 0;
        self.bytes_in = 0;
        self.bytes_out = 0;
        self.compress_time = Duration::ZERO;
        self.write_wait = Duration::ZERO;

        (self.level != old).then_some(self.level)
    }
}

impl Default for CompressionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_window(
        controller: &mut CompressionController,
        compress_time: Duration,
        write_wait: Duration,
    ) -> Option<i32> {
        // Spread the window's totals over its frames; only the last call
        // can close the window and return a change.
        let per_frame_cpu = compress_time / WINDOW_FRAMES as u32;
        let per_frame_wait = write_wait / WINDOW_FRAMES as u32;
        let mut change = None;
        for _ in 0..WINDOW_FRAMES {
            change = controller.record_frame(1024, 512, per_frame_cpu, per_frame_wait);
        }
        change
    }

    #[test]
    fn starts_at_initial_level() {
        assert_eq!(CompressionController::new().level(), INITIAL_LEVEL);
    }

    #[test]
    fn blocked_writer_raises_level() {
        let mut c = CompressionController::new();
        // Window wall time is near zero in tests, so any nonzero wait
        // dominates: blocked fraction > 50% raises by two.
        let change = run_window(&mut c, Duration::ZERO, Duration::from_millis(400));
        assert_eq!(change, Some(INITIAL_LEVEL + 2));
        assert_eq!(c.level(), INITIAL_LEVEL + 2);
    }

    #[test]
    fn saturated_cpu_with_idle_writer_lowers_level() {
        let mut c = CompressionController::new();
        let change = run_window(&mut c, Duration::from_millis(400), Duration::ZERO);
        assert_eq!(change, Some(INITIAL_LEVEL - 1));
    }

    #[test]
    fn balanced_window_holds() {
        let mut c = CompressionController::new();
        let change = run_window(&mut c, Duration::ZERO, Duration::ZERO);
        assert_eq!(change, None);
        assert_eq!(c.level(), INITIAL_LEVEL);
    }

    #[test]
    fn level_clamped_to_bounds() {
        let mut c = CompressionController::new();
        for _ in 0..40 {
            run_window(&mut c, Duration::ZERO, Duration::from_millis(400));
        }
        assert_eq!(c.level(), MAX_LEVEL);

        let mut c = CompressionController::new();
        for _ in 0..40 {
            run_window(&mut c, Duration::from_millis(400), Duration::ZERO);
        }
        assert_eq!(c.level(), MIN_LEVEL);
    }

    #[test]
    fn at_most_one_change_per_window() {
        let mut c = CompressionController::new();
        // Heavy blocking mid-window must not change the level before the
        // window closes.
        for _ in 0..(WINDOW_FRAMES - 1) {
            let change = c.record_frame(1024, 512, Duration::ZERO, Duration::from_millis(50));
            assert_eq!(change, None);
        }
        let change = c.record_frame(1024, 512, Duration::ZERO, Duration::from_millis(50));
        assert!(change.is_some());
    }
}

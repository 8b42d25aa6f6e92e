//! Frame-rate diagnostics.

use std::time::{Duration, Instant};

/// Averages frame throughput over a window and logs it.
///
/// A window opens at the first [`begin`](Self::begin) after a reset and
/// closes once more than `report_every` frames have completed.
#[derive(Debug, Clone)]
pub struct FrameRateCounter {
    report_every: usize,
    frames: usize,
    window_start: Option<Instant>,
    last_fps: Option<f64>,
}

impl FrameRateCounter {
    pub fn new(report_every: usize) -> Self {
        Self {
            report_every,
            frames: 0,
            window_start: None,
            last_fps: None,
        }
    }

    /// Mark the start of a frame.
    pub fn begin(&mut self) {
        if self.window_start.is_none() {
            self.frames = 0;
            self.window_start = Some(Instant::now());
        }
    }

    /// Mark a completed frame. Returns the frame rate when a window closes.
    pub fn end(&mut self) -> Option<f64> {
        let start = self.window_start?;
        self.frames += 1;
        if self.frames <= self.report_every {
            return None;
        }
        let fps = rate(self.frames, start.elapsed());
        log::info!("fps = {:.2} over {} frames", fps, self.frames);
        self.last_fps = Some(fps);
        self.reset();
        Some(fps)
    }

    /// Discard the current window.
    pub fn reset(&mut self) {
        self.frames = 0;
        self.window_start = None;
    }

    /// Frames counted in the open window.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Rate reported by the most recently closed window.
    pub fn last_fps(&self) -> Option<f64> {
        self.last_fps
    }
}

fn rate(frames: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        frames as f64 / secs
    } else {
        f64::INFINITY
    }
}

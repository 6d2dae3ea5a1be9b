// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Frame-rate estimation and shaping.
//!
//! A weighted accumulator estimates instantaneous FPS with exponentially
//! weighted recency; with a desired rate configured it doubles as a limiter,
//! telling the caller which frames to let through. Shared by the threaded
//! queue connector (write-side shaping, read-side measurement) and the
//! standalone FPS filter node.

use base::clock::Clocks;
use std::sync::Arc;

/// Default accumulator window.
pub const DEFAULT_WINDOW: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    Accept,
    Reject,
}

impl Verdict {
    pub fn is_accept(self) -> bool {
        self == Verdict::Accept
    }
}

pub struct FpsLimiter {
    clocks: Arc<dyn Clocks>,
    window: usize,
    desired_fps: f64,
    current_fps: f64,
    frames_accepted: u64,
    frames_rejected: u64,
    /// Weighted ms-per-frame accumulator; zero until the second accepted
    /// frame seeds it.
    acc: f64,
    prev_frame_time: i64,
    first_frame_time: i64,
    use_timestamp_as_diff: bool,
    use_wall_clock: bool,
    use_second_intervals: bool,
}

impl FpsLimiter {
    /// `desired_fps == 0` configures pure measurement: every frame is
    /// accepted and only the estimate is maintained.
    pub fn new(clocks: Arc<dyn Clocks>, window: usize, desired_fps: f64) -> Self {
        FpsLimiter {
            clocks,
            window,
            desired_fps,
            current_fps: desired_fps,
            frames_accepted: 0,
            frames_rejected: 0,
            acc: 0.0,
            prev_frame_time: 0,
            first_frame_time: 0,
            use_timestamp_as_diff: false,
            use_wall_clock: true,
            use_second_intervals: false,
        }
    }

    /// Wall clock (default) vs. PTS-derived elapsed time.
    pub fn set_use_wall_clock(&mut self, v: bool) {
        self.use_wall_clock = v;
    }

    /// Treats the reported timestamp directly as the elapsed interval.
    pub fn set_use_timestamp_as_diff(&mut self, v: bool) {
        self.use_timestamp_as_diff = v;
    }

    /// Accept the first frame of every second regardless of spacing.
    /// Multiple limiters configured this way accept the same set of frames,
    /// which keeps parallel HLS renditions aligned.
    pub fn set_use_second_intervals(&mut self, v: bool) {
        self.use_second_intervals = v;
    }

    /// Reports a frame; the caller must discard it on [`Verdict::Reject`].
    pub fn report(&mut self, pts: i64) -> Verdict {
        let reject;
        let fps;
        if self.frames_accepted > 0 {
            let elapsed = if self.use_timestamp_as_diff {
                pts
            } else if self.use_wall_clock {
                self.clocks.wall_ms() - self.prev_frame_time
            } else {
                pts - self.prev_frame_time
            };

            if self.use_second_intervals {
                reject = self.prev_frame_time / 1000 == pts / 1000
                    && self.desired_fps != 0.0
                    && (elapsed as f64) < 1000.0 / self.desired_fps;
                fps = self.desired_fps;
            } else {
                let acc = if self.acc == 0.0 {
                    elapsed as f64 * self.window as f64
                } else {
                    elapsed as f64 + self.acc * (self.window as f64 - 1.0) / self.window as f64
                };
                fps = self.window as f64 * 1000.0 / acc;
                if self.desired_fps != 0.0 && fps > self.desired_fps {
                    // Rejected frames leave the accumulator and the last
                    // accepted time untouched.
                    reject = true;
                } else {
                    reject = false;
                    self.acc = acc;
                }
            }
        } else {
            reject = false;
            fps = self.desired_fps;
            self.first_frame_time = if self.use_wall_clock {
                self.clocks.wall_ms()
            } else {
                pts
            };
        }

        if reject {
            self.frames_rejected += 1;
        } else {
            self.frames_accepted += 1;
            self.prev_frame_time = if self.use_wall_clock {
                self.clocks.wall_ms()
            } else {
                pts
            };
        }
        self.current_fps = fps;
        if reject {
            Verdict::Reject
        } else {
            Verdict::Accept
        }
    }

    pub fn fps(&self) -> f64 {
        self.current_fps
    }

    /// Wall time (or PTS) of the first accepted frame; for lifetime-rate
    /// reporting.
    pub fn first_frame_time(&self) -> i64 {
        self.first_frame_time
    }

    pub fn frames_accepted(&self) -> u64 {
        self.frames_accepted
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;

    fn limiter(desired: f64) -> FpsLimiter {
        let mut l = FpsLimiter::new(Arc::new(SimulatedClocks::new(0)), DEFAULT_WINDOW, desired);
        l.set_use_wall_clock(false);
        l
    }

    #[test]
    fn first_frame_always_accepted() {
        let mut l = limiter(10.0);
        assert_eq!(l.report(12345), Verdict::Accept);
        assert_eq!(l.frames_accepted(), 1);
    }

    #[test]
    fn measure_only_accepts_everything() {
        let mut l = limiter(0.0);
        for i in 0..100 {
            assert_eq!(l.report(i * 33), Verdict::Accept);
        }
        // 30 fps input measures near 30.
        assert!((l.fps() - 30.3).abs() < 1.0, "fps = {}", l.fps());
    }

    #[test]
    fn limits_to_desired_rate() {
        let desired = 10.0;
        let mut l = limiter(desired);
        let mut accepted = 0u32;
        let n_frames = 900; // 30 s of 30 fps input
        for i in 0..n_frames {
            if l.report(i * 33).is_accept() {
                accepted += 1;
            }
        }
        let span_sec = (n_frames as f64 * 33.0) / 1000.0;
        let rate = accepted as f64 / span_sec;
        let bound = desired * (1.0 + 1.0 / DEFAULT_WINDOW as f64);
        assert!(rate <= bound + 0.1, "rate {rate} exceeds bound {bound}");
        assert!(rate > desired * 0.7, "rate {rate} far below desired");
        assert_eq!(accepted as u64, l.frames_accepted());
        assert_eq!((n_frames - accepted as i64) as u64, l.frames_rejected());
    }

    #[test]
    fn second_intervals_accept_first_of_each_second() {
        let mut l = limiter(1.0);
        l.set_use_second_intervals(true);
        assert_eq!(l.report(900), Verdict::Accept);
        // Same second, spacing under 1000 ms: rejected.
        assert_eq!(l.report(950), Verdict::Reject);
        // New second: accepted despite only 150 ms elapsed.
        assert_eq!(l.report(1050), Verdict::Accept);
        assert_eq!(l.fps(), 1.0);
    }
}

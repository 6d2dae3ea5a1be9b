// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Node limiting the flow of frames to a specified FPS.
//!
//! Used where the threaded queue connector's shaping isn't in play: a
//! rejected video frame is dropped and the read retried internally, so the
//! consumer only ever sees accepted frames. Non-video frames pass through
//! untouched.
//!
//! Parameters: `fps`, `useWallClock`, `useSecondIntervals`, `variable`;
//! gettable `desiredFps`, `fps`, `requestFps`, `captureFps`.

use crate::fps::FpsLimiter;
use crate::frame::SharedFrame;
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue};
use crate::Context;
use base::clock::Clocks;
use base::Error;
use std::sync::Arc;
use tracing::trace;

const DEFAULT_FPS: f64 = 10.0;
const ACCUMULATOR_SIZE: usize = 64;
const REPORT_INTERVAL_MS: i64 = 10_000;

pub struct FpsFilter {
    base: NodeBase,
    clocks: Arc<dyn Clocks>,
    desired_fps: f64,
    current_fps: f64,
    frames_accepted: u64,
    frames_ignored: u64,
    use_wall_clock: bool,
    use_second_intervals: bool,
    limit: Option<FpsLimiter>,
    /// Measures the wall-clock rate of frame arrival regardless of the
    /// limiting mode.
    measure: Option<FpsLimiter>,
    last_log_time: i64,
    last_frames_accepted: u64,
    last_frames_ignored: u64,
}

impl FpsFilter {
    pub fn new(name: &str, ctx: &Context) -> Self {
        FpsFilter {
            base: NodeBase::named(name),
            clocks: ctx.clocks.clone(),
            desired_fps: DEFAULT_FPS,
            current_fps: DEFAULT_FPS,
            frames_accepted: 0,
            frames_ignored: 0,
            use_wall_clock: true,
            use_second_intervals: false,
            limit: None,
            measure: None,
            last_log_time: 0,
            last_frames_accepted: 0,
            last_frames_ignored: 0,
        }
    }

    pub fn boxed(name: &str, ctx: &Context) -> BoxedNode {
        Box::new(Self::new(name, ctx))
    }

    fn create_limiters(&mut self) {
        let mut limit = FpsLimiter::new(self.clocks.clone(), ACCUMULATOR_SIZE, self.desired_fps);
        limit.set_use_wall_clock(self.use_wall_clock);
        limit.set_use_second_intervals(self.use_second_intervals);
        self.limit = Some(limit);
        self.measure = Some(FpsLimiter::new(self.clocks.clone(), ACCUMULATOR_SIZE, 0.0));
    }
}

impl Node for FpsFilter {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        match name {
            "fps" => {
                self.desired_fps = value.as_f64()?;
                if self.limit.is_some() {
                    self.create_limiters();
                }
                Ok(())
            }
            // Rate changes were once gated behind this flag; exclusive
            // access makes them always safe now.
            "variable" => Ok(()),
            "useWallClock" => {
                self.use_wall_clock = value.as_bool()?;
                Ok(())
            }
            "useSecondIntervals" => {
                self.use_second_intervals = value.as_bool()?;
                Ok(())
            }
            _ => self.forward_set_param(name, value),
        }
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        match name {
            "desiredFps" => Ok(ParamValue::Float(self.desired_fps)),
            "fps" => Ok(ParamValue::Float(self.current_fps)),
            // Someone upstream may have a more precise metric; fall back
            // to our own measurements.
            "requestFps" => self
                .forward_get_param(name)
                .or(Ok(ParamValue::Float(self.current_fps))),
            "captureFps" => self.forward_get_param(name).or_else(|_| {
                Ok(ParamValue::Float(
                    self.measure.as_ref().map(|m| m.fps()).unwrap_or(0.0),
                ))
            }),
            _ => self.forward_get_param(name),
        }
    }

    fn open_in(&mut self) -> Result<(), Error> {
        self.open_source()?;
        self.create_limiters();
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        if self.limit.is_none() {
            self.create_limiters();
        }
        loop {
            let frame = match self.read_from_source()? {
                Some(f) => f,
                None => return Ok(None),
            };
            if !frame.media().is_video() {
                // We're only dealing with video frames.
                return Ok(Some(frame));
            }

            let verdict = self
                .limit
                .as_mut()
                .expect("created above")
                .report(frame.pts());
            self.measure.as_mut().expect("created above").report(0);
            self.current_fps = self.limit.as_ref().expect("created above").fps();

            if !verdict.is_accept() {
                self.frames_ignored += 1;
                trace!(
                    "ignoring a frame: fpsCurrent={:.1} fpsDesired={:.1} ignored={} accepted={}",
                    self.current_fps,
                    self.desired_fps,
                    self.frames_ignored,
                    self.frames_accepted,
                );
                continue;
            }

            self.frames_accepted += 1;
            let now = self.clocks.wall_ms();
            if now - self.last_log_time > REPORT_INTERVAL_MS {
                trace!(
                    "accepted={} ignored={} reportedFps={:.1} desiredFps={:.1}",
                    self.frames_accepted - self.last_frames_accepted,
                    self.frames_ignored - self.last_frames_ignored,
                    self.current_fps,
                    self.desired_fps,
                );
                self.last_frames_accepted = self.frames_accepted;
                self.last_frames_ignored = self.frames_ignored;
                self.last_log_time = now;
            }
            return Ok(Some(frame));
        }
    }

    fn close(&mut self) {
        self.limit = None;
        self.measure = None;
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MediaKind;
    use crate::node::{InsertFlags, Pipeline};
    use crate::testutil::{self, audio_frame, video_frame};

    fn filter_over(frames: Vec<SharedFrame>, params: &[(&str, ParamValue)]) -> Pipeline {
        testutil::init();
        let ctx = Context::new();
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            testutil::ScriptedSource::boxed("demux", frames),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, FpsFilter::boxed("fpslimit", &ctx), InsertFlags::default())
            .unwrap();
        p.configure(Some("fpslimit"), params).unwrap();
        p.open().unwrap();
        p
    }

    #[test]
    fn drops_video_above_target_rate() {
        let frames: Vec<_> = (0..300).map(|i| video_frame(i * 33, 8)).collect();
        let mut p = filter_over(
            frames,
            &[("useWallClock", 0.into()), ("fps", 10.into())],
        );
        let pts = testutil::drain_pts(&mut p);
        // 10 s of 30 fps input shaped to roughly 10 fps.
        assert!(pts.len() < 150, "too many frames passed: {}", pts.len());
        assert!(pts.len() > 50, "too few frames passed: {}", pts.len());
        let mut sorted = pts.clone();
        sorted.sort_unstable();
        assert_eq!(pts, sorted);
    }

    #[test]
    fn audio_passes_untouched() {
        let frames = vec![
            video_frame(0, 8),
            audio_frame(5),
            video_frame(10, 8),
            audio_frame(15),
            video_frame(20, 8),
        ];
        let mut p = filter_over(
            frames,
            &[("useWallClock", 0.into()), ("fps", 1.into())],
        );
        let mut audio = 0;
        let mut video = 0;
        loop {
            match p.read_frame() {
                Ok(Some(f)) => match f.media() {
                    MediaKind::Audio => audio += 1,
                    MediaKind::Video => video += 1,
                    other => panic!("unexpected {other:?}"),
                },
                Ok(None) => continue,
                Err(e) if e.kind() == base::ErrorKind::EndOfStream => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(audio, 2);
        // Only the first of the tightly-spaced video frames survives.
        assert_eq!(video, 1);
    }

    #[test]
    fn second_intervals_pass_first_of_second() {
        let frames: Vec<_> = (0..30).map(|i| video_frame(i * 100, 8)).collect();
        let mut p = filter_over(
            frames,
            &[
                ("useWallClock", 0.into()),
                ("useSecondIntervals", 1.into()),
                ("fps", 1.into()),
            ],
        );
        let pts = testutil::drain_pts(&mut p);
        assert_eq!(pts, vec![0, 1000, 2000]);
    }

    #[test]
    fn reports_rates() {
        let frames: Vec<_> = (0..10).map(|i| video_frame(i * 100, 8)).collect();
        let mut p = filter_over(
            frames,
            &[("useWallClock", 0.into()), ("fps", 100.into())],
        );
        let _ = testutil::drain_pts(&mut p);
        assert!(p.get_param("fpslimit.desiredFps").unwrap().as_f64().unwrap() > 99.0);
        // The source doesn't measure, so the filter's own numbers answer.
        let fps = p.get_param("fpslimit.requestFps").unwrap().as_f64().unwrap();
        assert!(fps > 0.0);
    }
}

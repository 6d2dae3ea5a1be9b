// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Node synchronizing audio and video frames.
//!
//! Reorders frames arriving out of timestamp order, paces video to a target
//! FPS while a stream starts up after a pause, and smooths encoder-introduced
//! delays. Used mostly when generating HLS output: players get finicky when
//! A/V timestamps drift too far apart.
//!
//! Parameters: `bufferDuration`, `bufferDurationWhenPaused`,
//! `jumpstartWithPastFrames`, `jumpstartFps`, `targetFps`, `paused`,
//! `reset`.

use crate::frame::{Frame, SharedFrame};
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue};
use base::Error;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

const DEFAULT_BUFFER_DURATION: i64 = 300;

pub struct JitterBuffer {
    base: NodeBase,
    /// Nominal window between head and tail PTS before the head is emitted.
    buffer_time: i64,
    /// Retention window for history and future frames while paused.
    buffer_time_paused: i64,
    /// Incoming frames awaiting playout, ascending PTS.
    future: VecDeque<SharedFrame>,
    /// Recently served frames kept to jumpstart the stream after un-pause.
    past: VecDeque<SharedFrame>,
    jumpstart_enabled: bool,
    jumpstart_fps: i64,
    /// Expected video rate when not paused; 0 disables clone pacing.
    target_fps: i64,
    last_past_video_pts: i64,
    last_served_video_pts: i64,
    prebuffer_end_pts: i64,
    determined_encoder_delay: bool,
    paused: bool,
    frames_read: u64,
}

impl JitterBuffer {
    pub fn new(name: &str) -> Self {
        JitterBuffer {
            base: NodeBase::named(name),
            buffer_time: DEFAULT_BUFFER_DURATION,
            buffer_time_paused: DEFAULT_BUFFER_DURATION,
            future: VecDeque::new(),
            past: VecDeque::new(),
            jumpstart_enabled: false,
            jumpstart_fps: 2,
            target_fps: 0,
            last_past_video_pts: 0,
            last_served_video_pts: 0,
            prebuffer_end_pts: 0,
            determined_encoder_delay: false,
            paused: false,
            frames_read: 0,
        }
    }

    pub fn boxed(name: &str) -> BoxedNode {
        Box::new(Self::new(name))
    }

    /// Inserts preserving ascending PTS. Frames usually arrive nearly in
    /// order, so scan from the tail; an equal PTS appends after it.
    fn insert_sorted(&mut self, frame: SharedFrame) {
        let pts = frame.pts();
        for i in (0..self.future.len()).rev() {
            if self.future[i].pts() <= pts {
                self.future.insert(i + 1, frame);
                return;
            }
        }
        trace!("inserting {pts} at the beginning of the queue");
        self.future.push_front(frame);
    }

    fn reduce(queue: &mut VecDeque<SharedFrame>, tail_pts: i64, window: i64) {
        while let Some(head) = queue.front() {
            if tail_pts - head.pts() <= window {
                break;
            }
            queue.pop_front();
        }
    }

    /// Saves a served frame into the history buffer when it qualifies:
    /// always for non-video, for video the first of a new second or one per
    /// jumpstart interval.
    fn save_for_jumpstart(&mut self, frame: &SharedFrame) -> bool {
        let pts = frame.pts();
        let is_video = frame.media().is_video();
        let should_save = self.past.is_empty()
            || !is_video
            || self.last_past_video_pts == 0
            || pts / 1000 != self.last_past_video_pts / 1000
            || (self.jumpstart_fps > 0 && pts - self.last_past_video_pts > 1000 / self.jumpstart_fps);
        if should_save {
            // Served frames get re-injected after an un-pause, so the
            // history holds its own reference.
            self.past.push_back(frame.clone());
            if is_video {
                self.last_past_video_pts = pts;
            }
            return true;
        }
        false
    }

    /// Returns the head, or a paced clone of it when the head is video and
    /// the gap to the last served video frame exceeds the target interval
    /// within the prebuffered region.
    fn generate(&mut self) -> SharedFrame {
        let head = self.future.front().expect("generate on empty queue").clone();
        let pts = head.pts();
        if head.media().is_video() {
            let diff = pts - self.last_served_video_pts;
            if self.last_served_video_pts != 0
                && pts < self.prebuffer_end_pts
                && self.target_fps != 0
                && diff > 1000 / self.target_fps
            {
                let fake_pts = self.last_served_video_pts + 1000 / self.target_fps;
                self.last_served_video_pts = fake_pts;
                return Frame::clone_of(&head, fake_pts).into_shared();
            }
            self.last_served_video_pts = pts;
        }
        head
    }

    fn try_emit(&mut self) -> Option<SharedFrame> {
        if self.future.is_empty() {
            return None;
        }

        if self.paused && !self.past.is_empty() {
            // History jumpstart: splice the past onto the front of the
            // future so the stream has frames to serve the moment it
            // un-pauses.
            while let Some(f) = self.past.pop_back() {
                self.future.push_front(f);
            }
            self.last_past_video_pts = 0;
            self.last_served_video_pts = 0;
        }

        let head_pts = self.future.front().expect("non-empty").pts();
        let tail_pts = self.future.back().expect("non-empty").pts();
        let starting_up = self.last_served_video_pts == 0 && !self.paused;

        if self.frames_read % 100 == 0 || starting_up {
            trace!(
                "queue: head={head_pts} tail={tail_pts} diff={} len={} lenPast={} startingUp={starting_up}",
                tail_pts - head_pts,
                self.future.len(),
                self.past.len(),
            );
        }
        if starting_up {
            self.prebuffer_end_pts = tail_pts;
        }

        if self.paused {
            // Trim to the paused retention window; never return anything.
            Self::reduce(&mut self.future, tail_pts, self.buffer_time_paused);
            return None;
        }

        if tail_pts - head_pts > self.buffer_time {
            let out = self.generate();
            let is_head = Arc::ptr_eq(&out, self.future.front().expect("non-empty"));
            if is_head {
                // Only remove and archive the head when it's not a frame
                // synthesized to compensate for low startup fps.
                self.future.pop_front();
                if self.jumpstart_enabled && self.save_for_jumpstart(&out) {
                    Self::reduce(&mut self.past, tail_pts, self.buffer_time_paused);
                }
            }
            return Some(out);
        }

        None
    }
}

impl Node for JitterBuffer {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        match name {
            "bufferDuration" => self.buffer_time = value.as_i64()?,
            "bufferDurationWhenPaused" => self.buffer_time_paused = value.as_i64()?,
            "jumpstartWithPastFrames" => self.jumpstart_enabled = value.as_bool()?,
            "jumpstartFps" => self.jumpstart_fps = value.as_i64()?,
            "targetFps" => self.target_fps = value.as_i64()?,
            "paused" => self.paused = value.as_bool()?,
            "reset" => self.determined_encoder_delay = false,
            _ => return self.forward_set_param(name, value),
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        loop {
            if self.determined_encoder_delay {
                if let Some(f) = self.try_emit() {
                    return Ok(Some(f));
                }
            }

            let incoming = match self.read_from_source()? {
                Some(f) => f,
                None => return Ok(None),
            };
            self.frames_read += 1;

            if !self.determined_encoder_delay {
                match self.forward_get_param("encoderDelay") {
                    Err(_) => {
                        // Upstream filters do not know of any encoder
                        // delay; keep the configured buffer.
                        self.determined_encoder_delay = true;
                    }
                    Ok(v) => {
                        let delay = v.as_i64()?;
                        if delay >= 0 {
                            self.buffer_time = self.buffer_time.max(delay);
                            self.determined_encoder_delay = true;
                            debug!("buffer time set at {}", self.buffer_time);
                        }
                        // Negative: the delay isn't known yet, keep probing.
                    }
                }
            }

            self.insert_sorted(incoming);
        }
    }

    fn close(&mut self) {
        self.future.clear();
        self.past.clear();
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

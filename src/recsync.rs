// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Graph element synchronizing an output frame with the filename it was
//! recorded to.
//!
//! The recorder announces segment boundaries through `recorder.newFile` /
//! `recorder.closeFile` events; this node keeps the resulting
//! `(start, end, filename)` ranges and classifies each outgoing frame into
//! one, holding frames back until the recorder's encoder delay is known so
//! nothing is classified prematurely.
//!
//! Parameters: `recorderName`; gettable `filename`.

use crate::event::Event;
use crate::frame::{MediaKind, SharedFrame, INVALID_PTS};
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue};
use base::{err, Error};
use std::collections::VecDeque;
use tracing::{debug, error, trace, warn};

/// `end` of a range whose close event hasn't arrived yet.
const OPEN_END: i64 = i64::MAX;

struct FileRange {
    start: i64,
    end: i64,
    name: String,
}

pub struct RecorderSync {
    base: NodeBase,
    rec_filter_name: Option<String>,
    /// Negative until probed from the recorder.
    encoder_delay: i64,
    last_pts_in_queue: i64,
    ranges: VecDeque<FileRange>,
    frames: VecDeque<SharedFrame>,
}

impl RecorderSync {
    pub fn new(name: &str) -> Self {
        RecorderSync {
            base: NodeBase::named(name),
            rec_filter_name: None,
            encoder_delay: -1,
            last_pts_in_queue: INVALID_PTS,
            ranges: VecDeque::new(),
            frames: VecDeque::new(),
        }
    }

    pub fn boxed(name: &str) -> BoxedNode {
        Box::new(Self::new(name))
    }

    fn on_new_file(&mut self, ev: &Event) {
        let Some(filename) = ev.property_str("filename") else {
            error!("failed to retrieve the filename from new file event");
            return;
        };
        if self.ranges.back().map(|r| r.name.as_str()) == Some(filename) {
            warn!("multiple new file notifications for {filename}");
            return;
        }
        trace!("set next file to {filename} starting from {}", ev.ts());
        self.ranges.push_back(FileRange {
            start: ev.ts(),
            end: OPEN_END,
            name: filename.to_owned(),
        });
    }

    fn on_close_file(&mut self, ev: &Event) {
        for range in self.ranges.iter_mut() {
            if range.end == OPEN_END {
                range.end = ev.ts();
                trace!("closed current file range: [{},{}]", range.start, range.end);
                return;
            }
        }
        error!("mismatched file end event");
    }

    /// Serves the oldest queued frame once its range and the encoder delay
    /// allow classification.
    fn take_from_queue(&mut self) -> Option<SharedFrame> {
        if self.encoder_delay < 0 {
            let key = match &self.rec_filter_name {
                Some(n) => format!("{n}.encoderDelay"),
                None => "encoderDelay".to_owned(),
            };
            match self.forward_get_param(&key).and_then(|v| v.as_i64()) {
                Ok(delay) if delay >= 0 => self.encoder_delay = delay,
                // Do not grab frames until the delay is established.
                _ => return None,
            }
        }

        while !self.frames.is_empty() && !self.ranges.is_empty() {
            let pts = self.frames.front().expect("non-empty").pts();
            let range = self.ranges.front().expect("non-empty");

            if pts < range.start {
                // Somehow this frame precedes the current range; protect
                // against it anyway.
                debug!("dropping a frame: pts={pts} currentFilePts={}", range.start);
                self.frames.pop_front();
            } else if range.end != OPEN_END && pts > range.end {
                // Past the current range; move to the next and retry.
                trace!(
                    "frame pts={pts} is outside of [{},{}]",
                    range.start,
                    range.end
                );
                self.ranges.pop_front();
            } else if pts + self.encoder_delay < self.last_pts_in_queue {
                return self.frames.pop_front();
            } else {
                trace!(
                    "retaining frame due to encoder delay: pts={pts} \
                     lastPtsInQueue={} delay={}",
                    self.last_pts_in_queue,
                    self.encoder_delay
                );
                return None;
            }
        }
        None
    }
}

impl Node for RecorderSync {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        if name == "recorderName" {
            self.rec_filter_name = Some(value.as_str()?.to_owned());
            return Ok(());
        }
        self.forward_set_param(name, value)
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        if name == "filename" {
            return match self.ranges.front() {
                Some(r) => Ok(ParamValue::Str(r.name.clone())),
                None => Err(err!(InvalidState, "no active recording file")),
            };
        }
        self.forward_get_param(name)
    }

    fn handle_event(&mut self, ev: &Event) {
        if ev.name().eq_ignore_ascii_case("recorder.newFile") {
            self.on_new_file(ev);
        } else if ev.name().eq_ignore_ascii_case("recorder.closeFile") {
            self.on_close_file(ev);
        }
        if let Some(s) = self.base_mut().source_mut() {
            s.handle_event(ev);
        }
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        loop {
            if let Some(f) = self.take_from_queue() {
                return Ok(Some(f));
            }
            let frame = match self.read_from_source()? {
                Some(f) => f,
                None => return Ok(None),
            };
            match frame.media() {
                MediaKind::Video | MediaKind::VideoTime => {
                    self.last_pts_in_queue = frame.pts();
                    self.frames.push_back(frame);
                }
                // Non-video frames can be safely disregarded for now; a
                // separate queue would be needed to route them.
                _ => {}
            }
        }
    }

    fn close(&mut self) {
        self.frames.clear();
        self.ranges.clear();
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

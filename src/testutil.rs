// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Utilities for automated testing of pipeline graphs.

use crate::frame::{Frame, MediaKind, PixelFormat, SharedFrame};
use crate::node::{Node, NodeBase, ParamValue, SeekDirection};
use crate::pool::PoolBuffer;
use base::{err, Error};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

static INIT: std::sync::Once = std::sync::Once::new();

/// Performs global initialization for tests: logging through the libtest
/// capture mechanism, filtered by `NIGHTJAR_LOG`.
pub fn init() {
    INIT.call_once(base::tracing_setup::install_for_tests);
}

/// A 640x480 YUV420P video frame with a dummy payload.
pub fn video_frame(pts: i64, size: usize) -> SharedFrame {
    Frame::buffer(
        MediaKind::Video,
        pts,
        PoolBuffer::from_vec(vec![0u8; size]),
    )
    .with_dims(640, 480, PixelFormat::Yuv420p)
    .with_key(true)
    .into_shared()
}

pub fn audio_frame(pts: i64) -> SharedFrame {
    Frame::buffer(MediaKind::Audio, pts, PoolBuffer::from_vec(vec![0u8; 64])).into_shared()
}

/// Keys a scripted source accepts as writes, mirroring what a demuxer
/// would: transport and timing knobs.
const SETTABLE: &[&str] = &["url", "forceTCP", "liveStream", "fps", "timebase", "rotation"];

/// A frame source yielding a fixed sequence, with a parameter store the
/// test can preload. Seek repositions to the first frame at or past the
/// target timestamp.
pub struct ScriptedSource {
    base: NodeBase,
    frames: Vec<SharedFrame>,
    pos: usize,
    params: HashMap<String, ParamValue>,
    width: u32,
    height: u32,
    pixfmt: PixelFormat,
}

impl ScriptedSource {
    pub fn new(name: &str, frames: Vec<SharedFrame>) -> Self {
        ScriptedSource {
            base: NodeBase::named(name),
            frames,
            pos: 0,
            params: HashMap::new(),
            width: 640,
            height: 480,
            pixfmt: PixelFormat::Yuv420p,
        }
    }

    pub fn boxed(name: &str, frames: Vec<SharedFrame>) -> Box<dyn Node> {
        Box::new(Self::new(name, frames))
    }

    /// Preloads a parameter the source will report via `get_param`,
    /// e.g. `encoderDelay` or `videoCodecId`.
    pub fn report(mut self, key: &str, value: ParamValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn with_dims(mut self, width: u32, height: u32, pixfmt: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.pixfmt = pixfmt;
        self
    }

    pub fn into_boxed(self) -> Box<dyn Node> {
        Box::new(self)
    }
}

impl Node for ScriptedSource {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn open_in(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        match self.frames.get(self.pos) {
            Some(f) => {
                self.pos += 1;
                Ok(Some(f.clone()))
            }
            None => Err(err!(EndOfStream, "scripted source exhausted")),
        }
    }

    fn seek(&mut self, offset_ms: i64, _dir: SeekDirection) -> Result<(), Error> {
        self.pos = self
            .frames
            .iter()
            .position(|f| f.pts() >= offset_ms)
            .unwrap_or(self.frames.len());
        Ok(())
    }

    fn width(&mut self) -> Result<u32, Error> {
        Ok(self.width)
    }

    fn height(&mut self) -> Result<u32, Error> {
        Ok(self.height)
    }

    fn pixel_format(&mut self) -> Result<PixelFormat, Error> {
        Ok(self.pixfmt)
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = crate::node::apply_scope(self.base.name(), name);
        if SETTABLE.iter().any(|k| k.eq_ignore_ascii_case(name)) {
            self.params.insert(name.to_owned(), value.clone());
            return Ok(());
        }
        self.forward_set_param(name, value)
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = crate::node::apply_scope(self.base.name(), name);
        if name == "eof" {
            return Ok(ParamValue::Bool(self.pos >= self.frames.len()));
        }
        match self.params.get(name) {
            Some(v) => Ok(v.clone()),
            None => self.forward_get_param(name),
        }
    }

    fn close(&mut self) {}
}

/// Records every frame that passes through it; the terminal stage of test
/// subgraphs.
pub struct CollectSink {
    base: NodeBase,
    seen: Arc<Mutex<Vec<SharedFrame>>>,
}

impl CollectSink {
    pub fn new(name: &str) -> (Box<dyn Node>, Arc<Mutex<Vec<SharedFrame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(CollectSink {
                base: NodeBase::named(name),
                seen: seen.clone(),
            }),
            seen,
        )
    }
}

impl Node for CollectSink {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        match self.read_from_source() {
            Ok(Some(f)) => {
                self.seen.lock().push(f.clone());
                Ok(Some(f))
            }
            other => other,
        }
    }
}

/// Collects the PTS values of every frame a chain yields until end of
/// stream, asserting no other error occurs.
pub fn drain_pts(pipeline: &mut crate::node::Pipeline) -> Vec<i64> {
    let mut out = Vec::new();
    loop {
        match pipeline.read_frame() {
            Ok(Some(f)) => out.push(f.pts()),
            Ok(None) => continue,
            Err(e) if e.kind() == base::ErrorKind::EndOfStream => break,
            Err(e) => panic!("unexpected error while draining: {e}"),
        }
    }
    out
}

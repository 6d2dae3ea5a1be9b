// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The frame model: typed carriers for one media unit each.
//!
//! A frame is mutable only while held exclusively; publishing it into a
//! queue or returning it from `read_frame` converts it to a [`SharedFrame`],
//! after which its observable state never changes.

use crate::pool::PoolBuffer;
use base::{bail, Error};
use std::sync::Arc;

/// Denotes an absent timestamp. Never appears on a frame delivered
/// downstream from a video source after the first decoded frame.
pub const INVALID_PTS: i64 = i64::MIN;

/// What one frame carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MediaKind {
    Video,
    Audio,
    Metadata,
    /// A zero-payload video-typed marker carrying only a timestamp; emitted
    /// when a frame is FPS-limited out but time still needs to be observed
    /// downstream.
    VideoTime,
    Unknown,
}

impl MediaKind {
    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgb8,
    Rgba,
    Argb,
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Yuyv422,
    Nv12,
    Nv16,
    Nv20,
    Nv21,
    Yuvj420p,
    Yuvj422p,
    Yuvj444p,
    Undefined,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats; `None` for planar ones, whose
    /// size depends on chroma subsampling.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        use PixelFormat::*;
        match self {
            Rgb8 => Some(1),
            Yuyv422 => Some(2),
            Rgb24 | Bgr24 => Some(3),
            Rgba | Argb => Some(4),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SampleFormat {
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub interleaved: bool,
}

/// A frame published downstream. Immutable; cheap to share between the main
/// chain, a splitter subgraph, and history buffers.
pub type SharedFrame = Arc<Frame>;

/// The payload of a [`Frame`].
#[derive(Debug)]
pub enum FrameBody {
    /// Owns its bytes, possibly recycled through a
    /// [`crate::pool::FramePool`]. Compressed packets, decoded pictures and
    /// samples, and metadata blobs all live here; [`MediaKind`]
    /// distinguishes them.
    Buffer(PoolBuffer),
    /// References another frame and overrides only PTS/DTS. All other
    /// accessors forward to the parent.
    Clone(SharedFrame),
    /// No payload; timing markers.
    Empty,
}

#[derive(Debug)]
pub struct Frame {
    pts: i64,
    dts: i64,
    media: MediaKind,
    key: bool,
    width: u32,
    height: u32,
    pixfmt: PixelFormat,
    audio: Option<AudioSpec>,
    body: FrameBody,
}

impl Frame {
    pub fn new(media: MediaKind, pts: i64, body: FrameBody) -> Self {
        Frame {
            pts,
            dts: pts,
            media,
            key: false,
            width: 0,
            height: 0,
            pixfmt: PixelFormat::Undefined,
            audio: None,
            body,
        }
    }

    /// A basic byte-buffer frame.
    pub fn buffer(media: MediaKind, pts: i64, payload: PoolBuffer) -> Self {
        Frame::new(media, pts, FrameBody::Buffer(payload))
    }

    /// A metadata frame: a byte buffer tagged [`MediaKind::Metadata`].
    pub fn metadata(pts: i64, payload: &[u8]) -> Self {
        Frame::new(
            MediaKind::Metadata,
            pts,
            FrameBody::Buffer(PoolBuffer::copied_from(payload)),
        )
    }

    /// A clone frame: holds a reference to `parent` and overrides only
    /// PTS and DTS.
    pub fn clone_of(parent: &SharedFrame, pts: i64) -> Self {
        Frame {
            pts,
            dts: pts,
            media: MediaKind::Unknown, // accessor forwards to the parent
            key: false,
            width: 0,
            height: 0,
            pixfmt: PixelFormat::Undefined,
            audio: None,
            body: FrameBody::Clone(parent.clone()),
        }
    }

    /// A video-time marker standing in for a dropped frame: same PTS/DTS
    /// and geometry, empty payload.
    pub fn video_time_marker(original: &Frame) -> Self {
        Frame {
            pts: original.pts(),
            dts: original.dts(),
            media: MediaKind::VideoTime,
            key: false,
            width: original.width(),
            height: original.height(),
            pixfmt: original.pixel_format(),
            audio: None,
            body: FrameBody::Empty,
        }
    }

    pub fn with_dts(mut self, dts: i64) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_dims(mut self, width: u32, height: u32, pixfmt: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.pixfmt = pixfmt;
        self
    }

    pub fn with_audio(mut self, spec: AudioSpec) -> Self {
        self.audio = Some(spec);
        self
    }

    pub fn with_key(mut self, key: bool) -> Self {
        self.key = key;
        self
    }

    pub fn into_shared(self) -> SharedFrame {
        Arc::new(self)
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    pub fn dts(&self) -> i64 {
        self.dts
    }

    pub fn media(&self) -> MediaKind {
        match &self.body {
            FrameBody::Clone(parent) => parent.media(),
            _ => self.media,
        }
    }

    pub fn is_key(&self) -> bool {
        match &self.body {
            FrameBody::Clone(parent) => parent.is_key(),
            _ => self.key,
        }
    }

    pub fn width(&self) -> u32 {
        match &self.body {
            FrameBody::Clone(parent) => parent.width(),
            _ => self.width,
        }
    }

    pub fn height(&self) -> u32 {
        match &self.body {
            FrameBody::Clone(parent) => parent.height(),
            _ => self.height,
        }
    }

    pub fn pixel_format(&self) -> PixelFormat {
        match &self.body {
            FrameBody::Clone(parent) => parent.pixel_format(),
            _ => self.pixfmt,
        }
    }

    pub fn audio(&self) -> Option<AudioSpec> {
        match &self.body {
            FrameBody::Clone(parent) => parent.audio(),
            _ => self.audio,
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.body {
            FrameBody::Buffer(b) => b,
            FrameBody::Clone(parent) => parent.data(),
            FrameBody::Empty => &[],
        }
    }

    pub fn size(&self) -> usize {
        self.data().len()
    }

    /// The referenced frame, for clone frames.
    pub fn parent(&self) -> Option<&SharedFrame> {
        match &self.body {
            FrameBody::Clone(parent) => Some(parent),
            _ => None,
        }
    }

    pub fn set_pts(&mut self, pts: i64) {
        self.pts = pts;
    }

    pub fn set_dts(&mut self, dts: i64) {
        self.dts = dts;
    }

    pub fn set_key(&mut self, key: bool) -> Result<(), Error> {
        self.ensure_not_clone("keyframe flag")?;
        self.key = key;
        Ok(())
    }

    pub fn set_dims(&mut self, width: u32, height: u32, pixfmt: PixelFormat) -> Result<(), Error> {
        self.ensure_not_clone("dimensions")?;
        self.width = width;
        self.height = height;
        self.pixfmt = pixfmt;
        Ok(())
    }

    /// Writable payload access; only valid while the frame is held
    /// exclusively.
    pub fn buffer_mut(&mut self) -> Result<&mut PoolBuffer, Error> {
        match &mut self.body {
            FrameBody::Buffer(b) => Ok(b),
            FrameBody::Clone(_) => bail!(Unsupported, "clone frames have no writable buffer"),
            FrameBody::Empty => bail!(Unsupported, "marker frames have no writable buffer"),
        }
    }

    fn ensure_not_clone(&self, what: &str) -> Result<(), Error> {
        if matches!(self.body, FrameBody::Clone(_)) {
            bail!(Unsupported, "cannot set {what} on a clone frame");
        }
        Ok(())
    }
}

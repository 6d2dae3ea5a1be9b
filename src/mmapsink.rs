// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Node mirroring video frames into a shared-memory file.
//!
//! The live viewer runs in another process and renders whatever the most
//! recent frame is; this node writes each passing video frame (packed pixel
//! formats only) into a memory-mapped file with a small header carrying the
//! geometry and a frame counter, and forwards the frame unchanged.
//!
//! Parameters: `filename`.

use crate::frame::{PixelFormat, SharedFrame};
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue};
use base::{bail, err, Error};
use memmap2::MmapMut;
use std::fs::OpenOptions;
use tracing::{debug, warn};

/// The header size of memory mapped files.
pub const MMAP_HEADER_SIZE: usize = 32;

fn pixfmt_code(p: PixelFormat) -> u32 {
    use PixelFormat::*;
    match p {
        Rgb24 => 1,
        Bgr24 => 2,
        Rgb8 => 3,
        Rgba => 4,
        Argb => 5,
        Yuyv422 => 6,
        _ => 0,
    }
}

pub struct MmapSink {
    base: NodeBase,
    filename: Option<String>,
    map: Option<MmapMut>,
    frame_counter: u64,
    width: u32,
    height: u32,
    pixfmt: PixelFormat,
    size_error_logged: bool,
}

impl MmapSink {
    pub fn new(name: &str) -> Self {
        MmapSink {
            base: NodeBase::named(name),
            filename: None,
            map: None,
            frame_counter: 0,
            width: 0,
            height: 0,
            pixfmt: PixelFormat::Undefined,
            size_error_logged: false,
        }
    }

    pub fn boxed(name: &str) -> BoxedNode {
        Box::new(Self::new(name))
    }

    /// (Re)creates the mapping from the current upstream geometry.
    fn open_map(&mut self) -> Result<(), Error> {
        self.map = None;
        let filename = self
            .filename
            .clone()
            .ok_or_else(|| err!(InvalidState, "mmap sink has no filename"))?;
        let width = self.width()?;
        let height = self.height()?;
        let pixfmt = self.pixel_format()?;
        let Some(bpp) = pixfmt.bytes_per_pixel() else {
            bail!(
                Unsupported,
                "pixel format {pixfmt:?} is planar; the live view needs a packed format"
            );
        };
        let len = MMAP_HEADER_SIZE + width as usize * height as usize * bpp;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&filename)?;
        file.set_len(len as u64)?;
        // Safety: the mapping stays private to this node; the viewer opens
        // its own read-only mapping of the same file.
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map[0..4].copy_from_slice(&width.to_le_bytes());
        map[4..8].copy_from_slice(&height.to_le_bytes());
        map[8..12].copy_from_slice(&pixfmt_code(pixfmt).to_le_bytes());
        self.map = Some(map);
        self.width = width;
        self.height = height;
        self.pixfmt = pixfmt;
        self.frame_counter = 0;
        debug!("mapped {filename} for {width}x{height} {pixfmt:?} live view");
        Ok(())
    }

    fn publish(&mut self, frame: &SharedFrame) -> Result<(), Error> {
        if frame.width() != self.width
            || frame.height() != self.height
            || frame.pixel_format() != self.pixfmt
        {
            // Source geometry changed mid-stream; remap.
            self.open_map()?;
        }
        let map = self.map.as_mut().expect("open_map populated it");
        let data = frame.data();
        let capacity = map.len() - MMAP_HEADER_SIZE;
        if data.len() > capacity {
            if !self.size_error_logged {
                warn!(
                    "frame payload {} exceeds mapped capacity {}; truncating",
                    data.len(),
                    capacity
                );
                self.size_error_logged = true;
            }
        }
        let n = data.len().min(capacity);
        map[MMAP_HEADER_SIZE..MMAP_HEADER_SIZE + n].copy_from_slice(&data[..n]);
        map[12..16].copy_from_slice(&(n as u32).to_le_bytes());
        self.frame_counter += 1;
        map[16..24].copy_from_slice(&self.frame_counter.to_le_bytes());
        Ok(())
    }
}

impl Node for MmapSink {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        if name == "filename" {
            self.filename = Some(value.as_str()?.to_owned());
            return Ok(());
        }
        self.forward_set_param(name, value)
    }

    fn open_in(&mut self) -> Result<(), Error> {
        self.open_source()?;
        self.open_map()
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        let frame = self.read_from_source()?;
        if let Some(f) = &frame {
            if f.media().is_video() && f.size() > 0 {
                self.publish(f)?;
            }
        }
        Ok(frame)
    }

    fn close(&mut self) {
        self.map = None;
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

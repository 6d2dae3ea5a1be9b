// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Node injecting metadata (such as bounding boxes) before video frames.
//!
//! Used in clip playback and generation, not in a real-time context: the
//! enclosing process preloads timestamped metadata blobs, and the injector
//! interleaves them with the data stream so each video frame is preceded by
//! the metadata most applicable to its timestamp.
//!
//! Parameters: `metadata.<pts_ms>` enqueues a blob, `preloaded` selects
//! preload-then-play (default) vs. live injection; gettable `nextMetadata`.

use crate::frame::{Frame, MediaKind, SharedFrame};
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue, SeekDirection};
use crate::pool::FramePool;
use crate::Context;
use base::{bail, err, Error, ErrorKind};
use std::collections::VecDeque;
use tracing::{error, trace, warn};

/// How far back a metadata frame may reach and still apply to the first
/// data frame returned after a seek. Matters mostly for reverse
/// frame-by-frame playback.
const MAX_APPLICABLE_METADATA_DISTANCE: i64 = 50;

pub struct MetadataInjector {
    base: NodeBase,
    /// Metadata arrives up front (clip playback) vs. while streaming.
    preloaded_mode: bool,
    preloaded: Vec<SharedFrame>,
    available: VecDeque<SharedFrame>,
    data: VecDeque<SharedFrame>,
    pool: FramePool,
    last_meta_pts: i64,
    last_video_pts: i64,
    meta_ignored: u64,
    video_frames_count: usize,
    eof: bool,
    is_initialized: bool,
}

impl MetadataInjector {
    pub fn new(name: &str, ctx: &Context) -> Self {
        MetadataInjector {
            base: NodeBase::named(name),
            preloaded_mode: true,
            preloaded: Vec::new(),
            available: VecDeque::new(),
            data: VecDeque::new(),
            pool: FramePool::new(&format!("metainj_{name}"), ctx.clocks.clone()),
            last_meta_pts: 0,
            last_video_pts: 0,
            meta_ignored: 0,
            video_frames_count: 0,
            eof: false,
            is_initialized: false,
        }
    }

    pub fn boxed(name: &str, ctx: &Context) -> BoxedNode {
        Box::new(Self::new(name, ctx))
    }

    /// Enqueues one metadata blob for the given timestamp.
    pub fn add_metadata(&mut self, pts: i64, payload: &[u8]) -> Result<(), Error> {
        if self.preloaded_mode && self.is_initialized {
            bail!(
                InvalidState,
                "preloaded metadata cannot be added after open"
            );
        }
        if pts < self.last_video_pts {
            self.meta_ignored += 1;
            warn!(
                "ignoring metadata for {pts}: last video frame served {} ignored={}",
                self.last_video_pts, self.meta_ignored
            );
            return Ok(());
        }
        let mut buffer = self.pool.acquire(payload.len());
        buffer.vec_mut().extend_from_slice(payload);
        let frame = Frame::buffer(MediaKind::Metadata, pts, buffer).into_shared();
        if self.preloaded_mode {
            self.preloaded.push(frame);
        } else {
            self.available.push_back(frame);
        }
        Ok(())
    }

    /// Rebuilds the live metadata queue from the preloaded set, keeping a
    /// small window preceding `first_ts` so an early data frame still finds
    /// its annotation.
    fn copy_preloaded(&mut self, first_ts: i64) {
        self.available.clear();
        for f in &self.preloaded {
            if f.pts() + MAX_APPLICABLE_METADATA_DISTANCE >= first_ts {
                self.available.push_back(f.clone());
            }
        }
    }

    fn pop_data(&mut self) -> Option<SharedFrame> {
        let f = self.data.pop_front()?;
        self.last_video_pts = f.pts();
        Some(f)
    }

    fn pop_video(&mut self) -> Option<SharedFrame> {
        self.video_frames_count = self.video_frames_count.saturating_sub(1);
        self.pop_data()
    }

    fn pop_meta(&mut self) -> Option<SharedFrame> {
        let f = self.available.pop_front()?;
        self.last_meta_pts = f.pts();
        Some(f)
    }

    /// Picks the next frame to emit, or `None` when more input is needed.
    fn next_aligned(&mut self) -> Option<SharedFrame> {
        let f_data = self.data.front()?.clone();
        let data_pts = f_data.pts();

        if !f_data.media().is_video() {
            // No need to align non-video frames with metadata.
            return self.pop_data();
        }

        if self.available.is_empty() {
            if self.preloaded_mode {
                // No metadata left, and no more expected.
                return self.pop_video();
            }
            if data_pts <= self.last_meta_pts {
                // This data frame corresponds to previously served metadata.
                return self.pop_video();
            }
            trace!("waiting for more metadata, dataPts={data_pts}");
            return None;
        }

        let f_meta = self.available.front()?.clone();
        let meta_pts = f_meta.pts();
        if meta_pts <= data_pts {
            return self.pop_meta();
        }

        // The metadata is later than the first data frame; decide whether
        // it belongs with the first or the second video frame.
        if self.video_frames_count < 2 {
            if self.eof {
                return self.pop_video();
            }
            trace!("waiting for more data, dataPts={data_pts} metaPts={meta_pts}");
            return None;
        }
        let mut counter = 0;
        let mut second_pts = None;
        for f in &self.data {
            if f.media().is_video() {
                counter += 1;
                if counter > 1 {
                    second_pts = Some(f.pts());
                    break;
                }
            }
        }
        let Some(second_pts) = second_pts else {
            error!("inconsistent state: expected at least 2 queued video frames, got {counter}");
            return None;
        };

        if meta_pts >= second_pts {
            return self.pop_video();
        }
        if meta_pts - data_pts > second_pts - meta_pts {
            return self.pop_video();
        }

        // Closest to the first video: serve the metadata now, adjusted to
        // that frame's timestamp.
        self.available.pop_front();
        self.last_meta_pts = meta_pts;
        Some(Frame::clone_of(&f_meta, data_pts).into_shared())
    }
}

impl Node for MetadataInjector {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        if let Some(ts) = name.strip_prefix("metadata.") {
            let pts: i64 = ts
                .parse()
                .map_err(|_| err!(InvalidArgument, "bad metadata timestamp {ts:?}"))?;
            let payload = value.as_str()?.as_bytes().to_vec();
            return self.add_metadata(pts, &payload);
        }
        if name == "preloaded" {
            self.preloaded_mode = value.as_bool()?;
            return Ok(());
        }
        self.forward_set_param(name, value)
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        if name == "nextMetadata" {
            return match self.available.front() {
                Some(f) if self.preloaded_mode => Ok(ParamValue::Frame(f.clone())),
                _ => Err(err!(InvalidState, "no metadata queued")),
            };
        }
        self.forward_get_param(name)
    }

    fn open_in(&mut self) -> Result<(), Error> {
        self.open_source()?;
        self.is_initialized = true;
        self.copy_preloaded(0);
        Ok(())
    }

    fn seek(&mut self, offset_ms: i64, dir: SeekDirection) -> Result<(), Error> {
        trace!("seeking to {offset_ms}");
        match self.base_mut().source_mut() {
            Some(s) => s.seek(offset_ms, dir)?,
            None => bail!(Unattached, "no source to seek"),
        }
        self.data.clear();
        self.copy_preloaded(offset_ms);
        self.last_video_pts = 0;
        self.last_meta_pts = 0;
        self.eof = false;
        self.video_frames_count = 0;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        loop {
            if let Some(f) = self.next_aligned() {
                return Ok(Some(f));
            }
            if self.eof {
                return Err(err!(EndOfStream, "metadata injector drained"));
            }
            match self.read_from_source() {
                Ok(Some(f)) => {
                    trace!("adding data frame: {} count={}", f.pts(), self.data.len());
                    if f.media().is_video() {
                        self.video_frames_count += 1;
                    }
                    self.data.push_back(f);
                }
                Ok(None) => {
                    let at_eof = self
                        .forward_get_param("eof")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if at_eof {
                        self.eof = true;
                        continue;
                    }
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::EndOfStream => {
                    trace!("end of file detected, draining queues");
                    self.eof = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InsertFlags, Pipeline};
    use crate::testutil::{self, video_frame, ScriptedSource};

    fn injector_over(
        frames: Vec<SharedFrame>,
        metadata: &[(i64, &str)],
    ) -> Pipeline {
        testutil::init();
        let ctx = Context::new();
        let mut inj = MetadataInjector::new("metainject", &ctx);
        for (pts, text) in metadata {
            inj.add_metadata(*pts, text.as_bytes()).unwrap();
        }
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            ScriptedSource::boxed("demux", frames),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, Box::new(inj), InsertFlags::default())
            .unwrap();
        p.open().unwrap();
        p
    }

    fn drain_tagged(p: &mut Pipeline) -> Vec<(MediaKind, i64)> {
        let mut out = Vec::new();
        loop {
            match p.read_frame() {
                Ok(Some(f)) => out.push((f.media(), f.pts())),
                Ok(None) => continue,
                Err(e) if e.kind() == base::ErrorKind::EndOfStream => break,
                Err(e) => panic!("{e}"),
            }
        }
        out
    }

    #[test]
    fn metadata_precedes_closest_video() {
        let frames = vec![
            video_frame(0, 8),
            video_frame(33, 8),
            video_frame(66, 8),
            video_frame(120, 8),
        ];
        let mut p = injector_over(frames, &[(30, "a"), (100, "b")]);
        let out = drain_tagged(&mut p);
        use MediaKind::*;
        assert_eq!(
            out,
            vec![
                (Video, 0),
                (Metadata, 30),
                (Video, 33),
                (Video, 66),
                (Metadata, 100),
                (Video, 120),
            ]
        );
    }

    #[test]
    fn metadata_adjusts_to_nearest_video_timestamp() {
        let frames = vec![video_frame(0, 8), video_frame(100, 8), video_frame(200, 8)];
        let mut p = injector_over(frames, &[(40, "near-first")]);
        let out = drain_tagged(&mut p);
        use MediaKind::*;
        // 40 is closer to the first video frame than to the second, so it
        // is served first with its timestamp pulled back to 0.
        assert_eq!(
            out,
            vec![(Metadata, 0), (Video, 0), (Video, 100), (Video, 200)]
        );
    }

    #[test]
    fn metadata_payload_survives_adjustment() {
        let frames = vec![video_frame(0, 8), video_frame(100, 8), video_frame(200, 8)];
        let mut p = injector_over(frames, &[(40, "boxes")]);
        let first = p.read_frame().unwrap().unwrap();
        assert_eq!(first.media(), MediaKind::Metadata);
        assert_eq!(first.data(), b"boxes");
    }

    #[test]
    fn preloaded_injection_after_open_is_rejected() {
        let frames = vec![video_frame(0, 8)];
        let mut p = injector_over(frames, &[]);
        let e = p
            .set_param("metainject.metadata.100", &"late".into())
            .unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidState);
    }

    #[test]
    fn seek_recopies_applicable_metadata() {
        let frames = vec![
            video_frame(0, 8),
            video_frame(1000, 8),
            video_frame(2000, 8),
            video_frame(3000, 8),
        ];
        let mut p = injector_over(frames, &[(10, "early"), (1990, "late")]);
        p.seek(2000, SeekDirection::Forward).unwrap();
        let out = drain_tagged(&mut p);
        use MediaKind::*;
        // Only the metadata within the applicability window of the seek
        // target survives; it lands before the first served frame.
        assert_eq!(out, vec![(Metadata, 1990), (Video, 2000), (Video, 3000)]);
    }
}

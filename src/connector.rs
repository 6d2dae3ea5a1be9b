// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A node acting as a threaded frame queue.
//!
//! Decouples a blocking or non-thread-safe source (a live RTSP demuxer,
//! typically) from the downstream consumer: a dedicated producer thread
//! pulls frames upstream and deposits them into a bounded queue that the
//! consumer drains on its own schedule. The write side can shape video to a
//! target FPS; the read side measures. Both sides feed interval and
//! lifetime statistics.
//!
//! Parameters: `lossy`, `timeout` (ms, 0 = indefinite), `maxQueueSize`,
//! `fpsLimit`, `silentFpsLimiter`, `statsIntervalSec`, `flushStats`;
//! gettable `requestFps`, `captureFps`, `eof`, `framesDropped`.

use crate::fps::FpsLimiter;
use crate::frame::{Frame, MediaKind, SharedFrame, INVALID_PTS};
use crate::node::{
    apply_scope, BoxedNode, InsertFlags, Node, NodeBase, ParamValue, SeekDirection, SourceFlags,
};
use crate::Context;
use base::clock::Clocks;
use base::{bail, err, Error, ErrorKind};
use parking_lot::{Condvar, Mutex};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace};

const LIMITER_WINDOW: usize = 75;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Idle,
    Running,
    Eof,
    Closing,
    Error,
}

impl State {
    /// EOF still counts as running: a seek can resume the stream.
    fn is_running(self) -> bool {
        matches!(self, State::Running | State::Eof)
    }
}

#[derive(Default, Clone, Copy)]
struct StatsItem {
    min: i64,
    max: i64,
    cumulative: i64,
    samples: i64,
}

impl StatsItem {
    fn update(&mut self, value: i64) {
        if value < self.min || self.samples == 0 {
            self.min = value;
        }
        if value > self.max || self.samples == 0 {
            self.max = value;
        }
        self.cumulative += value;
        self.samples += 1;
    }

    fn average(&self) -> i64 {
        if self.samples == 0 {
            0
        } else {
            self.cumulative / self.samples
        }
    }

    fn combine(&mut self, other: &StatsItem) {
        if other.samples != 0 {
            if other.min < self.min || self.samples == 0 {
                self.min = other.min;
            }
            if other.max > self.max || self.samples == 0 {
                self.max = other.max;
            }
        }
        self.samples += other.samples;
        self.cumulative += other.cumulative;
    }
}

#[derive(Default, Clone, Copy)]
struct Snapshot {
    queue_depth: StatsItem,
    read_interval: StatsItem,
    write_interval: StatsItem,
    pts_spread: StatsItem,
}

impl Snapshot {
    fn combine(&mut self, other: &Snapshot) {
        self.queue_depth.combine(&other.queue_depth);
        self.read_interval.combine(&other.read_interval);
        self.write_interval.combine(&other.write_interval);
        self.pts_spread.combine(&other.pts_spread);
    }
}

/// Per-channel (video) queue accounting.
struct ChannelState {
    interval: Snapshot,
    lifetime: Snapshot,
    last_frame_write_time: i64,
    last_frame_read_time: i64,
    last_pts_in_queue: i64,
    last_pts_read: i64,
    frames_dropped: u64,
    frames_in_queue: usize,
    read_limiter: FpsLimiter,
    write_limiter: FpsLimiter,
}

impl ChannelState {
    fn new(clocks: &Arc<dyn Clocks>, fps_limit: f64) -> Self {
        let mut read_limiter = FpsLimiter::new(clocks.clone(), LIMITER_WINDOW, 0.0);
        read_limiter.set_use_timestamp_as_diff(true);
        let mut write_limiter = FpsLimiter::new(clocks.clone(), LIMITER_WINDOW, fps_limit);
        write_limiter.set_use_wall_clock(false);
        let now = clocks.wall_ms();
        ChannelState {
            interval: Snapshot::default(),
            lifetime: Snapshot::default(),
            last_frame_write_time: now,
            last_frame_read_time: now,
            last_pts_in_queue: INVALID_PTS,
            last_pts_read: INVALID_PTS,
            frames_dropped: 0,
            frames_in_queue: 0,
            read_limiter,
            write_limiter,
        }
    }
}

/// Everything the producer and consumer share, under the data mutex.
struct Shared {
    state: State,
    queue: std::collections::VecDeque<SharedFrame>,
    video: ChannelState,
    max_queue_size: usize,
    lossy: bool,
    silent_fps_limiter: bool,
    fps_limit: f64,
    timeout_ms: i64,
    stats_interval_ms: i64,
    last_stats_time: i64,
    last_queue_depth_warning: usize,
    /// Wall time the consumer last left `read_frame`.
    last_frame_read_time: i64,
    /// Read intervals accumulated while returning non-video frames.
    elapsed_accumulator: i64,
}

/// Guards the upstream chain. The producer holds this while pulling; every
/// structural change (set_source, insert, remove, seek, parameter
/// forwarding) waits its turn. Lock order: chain before data.
struct Chain {
    source: Option<BoxedNode>,
    source_initialized: bool,
}

struct Inner {
    name: String,
    clocks: Arc<dyn Clocks>,
    chain: Mutex<Chain>,
    data: Mutex<Shared>,
    /// Signaled when the producer deposits into an empty queue or reaches
    /// EOF; the consumer waits on it when the queue is empty.
    frame_available: Condvar,
    /// Signaled when the queue recedes below the cap, on seek, and on
    /// close; the producer waits on it when the queue is full or at EOF.
    queue_ready: Condvar,
}

pub struct QueueConnector {
    base: NodeBase,
    inner: Arc<Inner>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl QueueConnector {
    pub fn new(name: &str, ctx: &Context) -> Self {
        let clocks = ctx.clocks.clone();
        let video = ChannelState::new(&clocks, 0.0);
        let now = clocks.wall_ms();
        QueueConnector {
            base: NodeBase::named(name),
            inner: Arc::new(Inner {
                name: name.to_owned(),
                clocks,
                chain: Mutex::new(Chain {
                    source: None,
                    source_initialized: false,
                }),
                data: Mutex::new(Shared {
                    state: State::Idle,
                    queue: std::collections::VecDeque::new(),
                    video,
                    max_queue_size: 0,
                    lossy: false,
                    silent_fps_limiter: false,
                    fps_limit: 0.0,
                    timeout_ms: 0,
                    stats_interval_ms: 0,
                    last_stats_time: now,
                    last_queue_depth_warning: 0,
                    last_frame_read_time: INVALID_PTS,
                    elapsed_accumulator: 0,
                }),
                frame_available: Condvar::new(),
                queue_ready: Condvar::new(),
            }),
            worker: None,
        }
    }

    pub fn boxed(name: &str, ctx: &Context) -> BoxedNode {
        Box::new(Self::new(name, ctx))
    }
}

fn format_stats(name: &str, cs: &mut ChannelState) -> String {
    cs.lifetime.combine(&cs.interval);
    let mut s = String::new();
    let _ = write!(
        s,
        "{}: FPSRead={:.1} FPSWrite={:.1} FPSAccepted={} FPSRejected={} inQueue={}",
        name,
        cs.read_limiter.fps(),
        cs.write_limiter.fps(),
        cs.write_limiter.frames_accepted(),
        cs.write_limiter.frames_rejected(),
        cs.frames_in_queue,
    );
    for (label, snap) in [("Period", &cs.interval), ("Lifetime", &cs.lifetime)] {
        let _ = write!(
            s,
            "; {} stats: maxQueue={} avgQueue={} maxReadInterval={} avgReadInterval={} \
             maxWriteInterval={} avgWriteInterval={} maxPtsSpread={} avgPtsSpread={} \
             framesDropped={}",
            label,
            snap.queue_depth.max,
            snap.queue_depth.average(),
            snap.read_interval.max,
            snap.read_interval.average(),
            snap.write_interval.max,
            snap.write_interval.average(),
            snap.pts_spread.max,
            snap.pts_spread.average(),
            cs.frames_dropped,
        );
    }
    cs.interval = Snapshot::default();
    s
}

/// Drops queued frames. With a target PTS, stops at the first frame of
/// known media type at or past it (the seek shortcut).
fn flush_queue(d: &mut Shared, target_pts: Option<i64>) {
    while let Some(front) = d.queue.front() {
        if let Some(t) = target_pts {
            if front.media() != MediaKind::Unknown && front.pts() >= t {
                break;
            }
        }
        let was_video = front.media().is_video();
        d.queue.pop_front();
        if was_video {
            d.video.frames_in_queue = d.video.frames_in_queue.saturating_sub(1);
        }
    }
}

/// True when the queue can take another frame, possibly after a lossy drop.
/// False means the (non-lossy) producer must block.
fn check_queue_size(d: &mut Shared) -> bool {
    if d.max_queue_size == 0 || d.video.frames_in_queue <= d.max_queue_size {
        return true;
    }
    if !d.lossy {
        return false;
    }

    // Erase the video frame whose PTS is closest to its predecessor.
    let mut prev_pts = d.video.last_pts_read;
    let mut best: Option<(usize, i64)> = None;
    let mut best_distance = i64::MAX;
    for (i, f) in d.queue.iter().enumerate() {
        if f.media().is_video() {
            let pts = f.pts();
            let distance = if prev_pts == INVALID_PTS {
                i64::MAX / 2
            } else {
                pts.saturating_sub(prev_pts)
            };
            if distance < best_distance {
                best = Some((i, pts));
                best_distance = distance;
            }
            prev_pts = pts;
        }
    }
    if let Some((i, pts)) = best {
        d.queue.remove(i);
        d.video.frames_dropped += 1;
        d.video.frames_in_queue -= 1;
        trace!(
            "dropping frame with pts={} totalDropped={}",
            pts,
            d.video.frames_dropped
        );
    }
    true
}

/// Deposits a frame into the queue and recalculates statistics.
fn deposit_frame(inner: &Inner, frame: SharedFrame) {
    let mut d = inner.data.lock();
    let size_before = d.queue.len();
    let mut frame = frame;
    let mut queue_depth = 0usize;

    if frame.media().is_video() {
        let pts = frame.pts();
        if !d.video.write_limiter.report(pts).is_accept() {
            // The limiter instructs us to discard this frame.
            if d.silent_fps_limiter {
                return;
            }
            frame = Frame::video_time_marker(&frame).into_shared();
        } else {
            let now = inner.clocks.wall_ms();
            let dur = now - d.video.last_frame_write_time;
            d.video.frames_in_queue += 1;
            d.video.last_frame_write_time = now;
            if pts > d.video.last_pts_in_queue || d.video.last_pts_in_queue == INVALID_PTS {
                d.video.last_pts_in_queue = pts;
            }
            queue_depth = size_before + 1;
            d.video.interval.queue_depth.update(queue_depth as i64);
            d.video.interval.write_interval.update(dur);
            if d.video.last_pts_read != INVALID_PTS {
                let diff = d.video.last_pts_in_queue - d.video.last_pts_read;
                d.video.interval.pts_spread.update(diff);
            }
            if d.stats_interval_ms > 0 && now - d.last_stats_time > d.stats_interval_ms {
                d.last_stats_time = now;
                let line = format_stats(&inner.name, &mut d.video);
                info!("{line}");
            }
        }
    }

    if queue_depth > 5 && queue_depth % 5 == 0 && d.last_queue_depth_warning != queue_depth {
        trace!(
            "queue depth is currently at {} with {} video frames",
            queue_depth,
            d.video.frames_in_queue
        );
        d.last_queue_depth_warning = queue_depth;
    }

    d.queue.push_back(frame);
    if size_before == 0 {
        inner.frame_available.notify_all();
    }
}

/// Blocks for as long as the queue is over its cap (non-lossy case).
fn wait_for_space(inner: &Inner) {
    let mut d = inner.data.lock();
    loop {
        if !d.state.is_running() {
            return;
        }
        if check_queue_size(&mut d) {
            return;
        }
        trace!(
            "waiting for queue to recede: {} video frames",
            d.video.frames_in_queue
        );
        inner.queue_ready.wait(&mut d);
    }
}

fn upstream_eof(chain: &mut Chain) -> bool {
    match chain.source.as_deref_mut() {
        Some(s) => s
            .get_param("eof")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        None => false,
    }
}

fn producer_loop(inner: Arc<Inner>) {
    trace!("starting producer thread for {}", inner.name);
    let mut was_eof = false;
    loop {
        let state = inner.data.lock().state;
        match state {
            State::Running => {}
            State::Eof => {
                // EOF doesn't mean we're done: a seek may restart the
                // stream. Hibernate until a seek or close wakes us.
                if !was_eof {
                    debug!("{}: reached EOF, waiting for seek or close", inner.name);
                    was_eof = true;
                }
                let mut d = inner.data.lock();
                inner.frame_available.notify_all();
                if d.state == State::Eof {
                    inner.queue_ready.wait(&mut d);
                }
                continue;
            }
            _ => break,
        }
        was_eof = false;

        let pulled = {
            let mut chain = inner.chain.lock();
            let res = match chain.source.as_deref_mut() {
                Some(s) => s.read_frame(),
                None => Err(err!(Unattached, "source isn't set")),
            };
            match res {
                Ok(Some(frame)) => Some(frame),
                other => {
                    let eof = matches!(&other, Err(e) if e.kind() == ErrorKind::EndOfStream)
                        || upstream_eof(&mut chain);
                    drop(chain);
                    let mut d = inner.data.lock();
                    if d.state == State::Running {
                        if eof {
                            d.state = State::Eof;
                        } else {
                            error!(
                                "{}: error while reading frame from the source: {:?}",
                                inner.name,
                                other.err()
                            );
                            d.state = State::Error;
                        }
                    }
                    inner.frame_available.notify_all();
                    None
                }
            }
        };

        if let Some(frame) = pulled {
            deposit_frame(&inner, frame);
            wait_for_space(&inner);
        }
    }

    // Someone may still be waiting on the consumer side.
    inner.frame_available.notify_all();
    trace!("exiting producer thread for {}", inner.name);
}

impl Node for QueueConnector {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn reaches(&self, id: crate::node::NodeId) -> bool {
        if self.id() == id {
            return true;
        }
        let chain = self.inner.chain.lock();
        chain
            .source
            .as_deref()
            .map(|s| s.reaches(id))
            .unwrap_or(false)
    }

    fn set_source(&mut self, source: BoxedNode, flags: SourceFlags) -> Result<(), Error> {
        if source.reaches(self.id()) {
            bail!(CyclicGraph, "source chain already reaches {}", self.inner.name);
        }
        let mut chain = self.inner.chain.lock();
        chain.source = Some(source);
        chain.source_initialized = flags.initialized;
        Ok(())
    }

    fn take_source(&mut self) -> Option<BoxedNode> {
        let mut chain = self.inner.chain.lock();
        chain.source_initialized = false;
        chain.source.take()
    }

    /// The upstream chain lives behind the producer's lock; it cannot be
    /// borrowed out.
    fn source_node(&self) -> Option<&dyn Node> {
        None
    }

    fn find_in_source(&self, _name: &str) -> Option<&dyn Node> {
        None
    }

    fn insert_element(
        &mut self,
        before: Option<&str>,
        node: BoxedNode,
        flags: InsertFlags,
    ) -> Result<(), Error> {
        let here = match before {
            None => true,
            Some(b) => self.name() == Some(b),
        };
        if node.reaches(self.id()) {
            bail!(CyclicGraph, "inserting would create a cycle");
        }
        let mut chain = self.inner.chain.lock();
        if here {
            let mut node = node;
            let old_initialized = chain.source_initialized;
            if let Some(old) = chain.source.take() {
                node.set_source(
                    old,
                    SourceFlags {
                        initialized: old_initialized,
                    },
                )?;
            }
            if flags.open {
                node.open_in()?;
            }
            chain.source = Some(node);
            chain.source_initialized = flags.open;
            Ok(())
        } else {
            match chain.source.as_deref_mut() {
                Some(s) => s.insert_element(before, node, flags),
                None => Err(err!(
                    InvalidArgument,
                    "no element named {:?} in the chain",
                    before.unwrap_or_default()
                )),
            }
        }
    }

    fn remove_element(&mut self, name: &str, keep: bool) -> Result<Option<BoxedNode>, Error> {
        let mut chain = self.inner.chain.lock();
        let source_matches = match chain.source.as_deref() {
            Some(s) => s.name() == Some(name),
            None => bail!(InvalidArgument, "no element named {name:?} in the chain"),
        };
        if !source_matches {
            return chain
                .source
                .as_deref_mut()
                .expect("checked above")
                .remove_element(name, keep);
        }
        let mut removed = chain.source.take().expect("checked above");
        let upstream_initialized = removed.base().source_initialized();
        chain.source = removed.take_source();
        chain.source_initialized = upstream_initialized;
        if keep {
            Ok(Some(removed))
        } else {
            removed.close();
            Ok(None)
        }
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        match name {
            "lossy" => {
                self.inner.data.lock().lossy = value.as_bool()?;
                return Ok(());
            }
            "timeout" => {
                self.inner.data.lock().timeout_ms = value.as_i64()?;
                return Ok(());
            }
            "maxQueueSize" => {
                self.inner.data.lock().max_queue_size = value.as_i64()?.max(0) as usize;
                return Ok(());
            }
            "fpsLimit" => {
                self.inner.data.lock().fps_limit = value.as_f64()?;
                return Ok(());
            }
            "silentFpsLimiter" => {
                self.inner.data.lock().silent_fps_limiter = value.as_bool()?;
                return Ok(());
            }
            "statsIntervalSec" => {
                let msec = value.as_i64()? * 1000;
                {
                    let mut d = self.inner.data.lock();
                    // Only override the default if it results in more
                    // frequent stats.
                    if msec < d.stats_interval_ms || d.stats_interval_ms == 0 {
                        d.stats_interval_ms = msec;
                    }
                }
                // Connectors further upstream want this one too.
                let mut chain = self.inner.chain.lock();
                if let Some(s) = chain.source.as_deref_mut() {
                    let _ = s.set_param(name, value);
                }
                return Ok(());
            }
            "flushStats" => {
                let mut d = self.inner.data.lock();
                let line = format_stats(&self.inner.name, &mut d.video);
                debug!("{line}");
                return Ok(());
            }
            _ => {}
        }
        let mut chain = self.inner.chain.lock();
        match chain.source.as_deref_mut() {
            Some(s) => s.set_param(name, value),
            None => Err(err!(UnknownParameter, "{name}")),
        }
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        match name {
            "requestFps" => {
                let d = self.inner.data.lock();
                return Ok(ParamValue::Float(d.video.read_limiter.fps()));
            }
            "captureFps" => {
                let d = self.inner.data.lock();
                return Ok(ParamValue::Float(d.video.write_limiter.fps()));
            }
            "eof" => {
                let d = self.inner.data.lock();
                return Ok(ParamValue::Bool(d.queue.is_empty() && d.state == State::Eof));
            }
            "framesDropped" => {
                let d = self.inner.data.lock();
                return Ok(ParamValue::Int(d.video.frames_dropped as i64));
            }
            _ => {}
        }
        let mut chain = self.inner.chain.lock();
        match chain.source.as_deref_mut() {
            Some(s) => s.get_param(name),
            None => Err(err!(UnknownParameter, "{name}")),
        }
    }

    fn open_in(&mut self) -> Result<(), Error> {
        {
            let mut guard = self.inner.chain.lock();
            let chain = &mut *guard;
            match chain.source.as_deref_mut() {
                None => bail!(Unattached, "failed to open {}: source isn't set", self.inner.name),
                Some(s) => {
                    if !chain.source_initialized {
                        s.open_in()?;
                    }
                }
            }
            chain.source_initialized = true;
        }
        {
            let mut d = self.inner.data.lock();
            let fps_limit = d.fps_limit;
            d.video = ChannelState::new(&self.inner.clocks, fps_limit);
            d.state = State::Running;
        }
        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("tc-{}", self.inner.name))
            .spawn(move || producer_loop(inner));
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                error!("{}: failed to start producer thread", self.inner.name);
                self.inner.data.lock().state = State::Error;
                Err(err!(Io, "failed to start producer thread: {e}"))
            }
        }
    }

    fn seek(&mut self, offset_ms: i64, dir: SeekDirection) -> Result<(), Error> {
        let mut chain = self.inner.chain.lock();
        let mut d = self.inner.data.lock();
        let mut res = Err(err!(InvalidState, "seek on a connector that isn't running"));
        if d.state.is_running() {
            trace!("seek to pts={offset_ms}; flushing the queue");
            let in_queue = (offset_ms > d.video.last_pts_read
                || d.video.last_pts_read == INVALID_PTS)
                && d.video.last_pts_in_queue != INVALID_PTS
                && offset_ms <= d.video.last_pts_in_queue;
            if in_queue {
                // The frame we're seeking to is buffered; skip the
                // upstream seek and drop only what precedes it.
                flush_queue(&mut d, Some(offset_ms));
                res = Ok(());
            } else {
                res = match chain.source.as_deref_mut() {
                    Some(s) => s.seek(offset_ms, dir),
                    None => Err(err!(Unattached, "no source to seek")),
                };
                flush_queue(&mut d, None);
                let fps_limit = d.fps_limit;
                d.video = ChannelState::new(&self.inner.clocks, fps_limit);
                d.state = State::Running;
            }
        }
        self.inner.queue_ready.notify_all();
        res
    }

    fn width(&mut self) -> Result<u32, Error> {
        let mut chain = self.inner.chain.lock();
        match chain.source.as_deref_mut() {
            Some(s) => s.width(),
            None => Err(err!(Unattached, "no source to query width")),
        }
    }

    fn height(&mut self) -> Result<u32, Error> {
        let mut chain = self.inner.chain.lock();
        match chain.source.as_deref_mut() {
            Some(s) => s.height(),
            None => Err(err!(Unattached, "no source to query height")),
        }
    }

    fn pixel_format(&mut self) -> Result<crate::frame::PixelFormat, Error> {
        let mut chain = self.inner.chain.lock();
        match chain.source.as_deref_mut() {
            Some(s) => s.pixel_format(),
            None => Err(err!(Unattached, "no source to query pixel format")),
        }
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        let inner = self.inner.clone();
        let now = inner.clocks.wall_ms();
        let deadline;
        let mut d = inner.data.lock();

        // Interval since the previous read, primed with the expected frame
        // spacing on the first call. Feeds the read-side limiter so
        // `requestFps` reflects the consumer's actual pace.
        let elapsed_since_last_read = if d.last_frame_read_time != INVALID_PTS {
            now - d.last_frame_read_time + d.elapsed_accumulator
        } else if d.fps_limit > 0.0 {
            (1000.0 / d.fps_limit) as i64
        } else {
            33
        };
        deadline = if d.timeout_ms > 0 {
            Some(std::time::Instant::now() + Duration::from_millis(d.timeout_ms as u64))
        } else {
            None
        };

        let result = loop {
            if let Some(frame) = d.queue.pop_front() {
                inner.queue_ready.notify_all();
                if frame.media().is_video() {
                    let now = inner.clocks.wall_ms();
                    let dur = now - d.video.last_frame_read_time;
                    let pts = frame.pts();
                    d.video.last_frame_read_time = now;
                    if pts > d.video.last_pts_read || d.video.last_pts_read == INVALID_PTS {
                        d.video.last_pts_read = pts;
                    }
                    let depth = d.queue.len() as i64;
                    d.video.interval.queue_depth.update(depth);
                    d.video.interval.read_interval.update(dur);
                    if d.video.last_pts_in_queue != INVALID_PTS {
                        let spread = d.video.last_pts_in_queue - d.video.last_pts_read;
                        d.video.interval.pts_spread.update(spread);
                    }
                    d.video.frames_in_queue = d.video.frames_in_queue.saturating_sub(1);
                    d.video.read_limiter.report(elapsed_since_last_read);
                    d.elapsed_accumulator = 0;
                } else {
                    d.elapsed_accumulator = elapsed_since_last_read;
                }
                break Ok(Some(frame));
            }

            match d.state {
                State::Eof => {
                    debug!("{}: failed to read a frame: end of stream", inner.name);
                    break Err(err!(EndOfStream, "{}", inner.name));
                }
                State::Running => match deadline {
                    Some(deadline) => {
                        let timed_out = inner
                            .frame_available
                            .wait_until(&mut d, deadline)
                            .timed_out();
                        if timed_out && d.queue.is_empty() {
                            error!("{}: failed to read a frame: timeout", inner.name);
                            break Err(err!(Timeout, "{}", inner.name));
                        }
                    }
                    None => {
                        inner.frame_available.wait(&mut d);
                    }
                },
                _ => {
                    error!("{}: failed to read a frame: thread isn't running", inner.name);
                    break Err(err!(Io, "{}: thread isn't running", inner.name));
                }
            }
        };

        d.last_frame_read_time = inner.clocks.wall_ms();
        result
    }

    fn handle_event(&mut self, ev: &crate::event::Event) {
        let mut chain = self.inner.chain.lock();
        if let Some(s) = chain.source.as_deref_mut() {
            s.handle_event(ev);
        }
    }

    fn print_pipeline(&self, out: &mut String) {
        out.push_str(self.name().unwrap_or("?"));
        let chain = self.inner.chain.lock();
        if let Some(s) = chain.source.as_deref() {
            out.push_str("->");
            s.print_pipeline(out);
        }
    }

    fn close(&mut self) {
        {
            let mut d = self.inner.data.lock();
            if d.state == State::Closing {
                // A close already in progress from another path.
                return;
            }
            trace!("closing connector {}", self.inner.name);
            d.state = State::Closing;
            self.inner.queue_ready.notify_all();
            self.inner.frame_available.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("{}: producer thread panicked", self.inner.name);
            }
        }
        {
            let mut d = self.inner.data.lock();
            let line = format_stats(&self.inner.name, &mut d.video);
            debug!("{line}");
            flush_queue(&mut d, None);
        }
        let mut chain = self.inner.chain.lock();
        chain.source_initialized = false;
        if let Some(mut s) = chain.source.take() {
            s.close();
        }
    }
}

impl Drop for QueueConnector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Pipeline;
    use crate::testutil::{self, video_frame};
    use std::time::Duration;

    fn connector_over(
        frames: Vec<SharedFrame>,
        params: &[(&str, ParamValue)],
    ) -> Pipeline {
        testutil::init();
        let ctx = Context::new();
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            testutil::ScriptedSource::boxed("demux", frames),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, QueueConnector::boxed("tc", &ctx), InsertFlags::default())
            .unwrap();
        p.configure(Some("tc"), params).unwrap();
        p
    }

    fn settle() {
        // Give the producer thread time to pull everything available.
        std::thread::sleep(Duration::from_millis(200));
    }

    #[test]
    fn lossless_bounded_queue_preserves_order() {
        let frames = vec![
            video_frame(100, 8),
            video_frame(133, 8),
            video_frame(167, 8),
            video_frame(200, 8),
            video_frame(233, 8),
        ];
        let mut p = connector_over(
            frames,
            &[
                ("maxQueueSize", 3.into()),
                ("lossy", false.into()),
                ("timeout", 2000.into()),
            ],
        );
        p.open().unwrap();
        settle();
        // The producer blocks after its queue fills; reads release it.
        assert_eq!(testutil::drain_pts(&mut p), vec![100, 133, 167, 200, 233]);
        assert_eq!(p.get_param("tc.framesDropped").unwrap().as_i64().unwrap(), 0);
        p.close();
    }

    #[test]
    fn lossy_queue_drops_least_distinct_frame() {
        let frames = vec![
            video_frame(100, 8),
            video_frame(133, 8),
            video_frame(167, 8),
            video_frame(200, 8),
        ];
        let mut p = connector_over(
            frames,
            &[
                ("maxQueueSize", 3.into()),
                ("lossy", true.into()),
                ("timeout", 2000.into()),
            ],
        );
        p.open().unwrap();
        settle();
        // 133 has the smallest distance to its predecessor among the
        // queued video frames once the queue overflows.
        assert_eq!(testutil::drain_pts(&mut p), vec![100, 167, 200]);
        assert_eq!(p.get_param("tc.framesDropped").unwrap().as_i64().unwrap(), 1);
        p.close();
    }

    #[test]
    fn empty_queue_at_eof_reports_end_of_stream() {
        let mut p = connector_over(vec![video_frame(0, 8)], &[("timeout", 2000.into())]);
        p.open().unwrap();
        settle();
        assert_eq!(p.read_frame().unwrap().unwrap().pts(), 0);
        let e = p.read_frame().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::EndOfStream);
        assert!(p.get_param("tc.eof").unwrap().as_bool().unwrap());
        p.close();
    }

    #[test]
    fn read_before_open_fails() {
        testutil::init();
        let ctx = Context::new();
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            testutil::ScriptedSource::boxed("demux", vec![]),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, QueueConnector::boxed("tc", &ctx), InsertFlags::default())
            .unwrap();
        let e = p.read_frame().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Io);
    }

    /// A source whose first read stalls long enough for the consumer's
    /// timeout to expire.
    struct StallSource {
        base: NodeBase,
        served: bool,
    }

    impl Node for StallSource {
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
            if self.served {
                return Err(err!(EndOfStream, "stall source exhausted"));
            }
            std::thread::sleep(Duration::from_millis(400));
            self.served = true;
            Ok(Some(video_frame(0, 8)))
        }

        fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
            if name == "eof" {
                return Ok(ParamValue::Bool(self.served));
            }
            self.forward_get_param(name)
        }

        fn close(&mut self) {}
    }

    #[test]
    fn consumer_times_out_when_no_frames_arrive() {
        testutil::init();
        let ctx = Context::new();
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            Box::new(StallSource {
                base: NodeBase::named("slow"),
                served: false,
            }),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, QueueConnector::boxed("tc", &ctx), InsertFlags::default())
            .unwrap();
        p.configure(Some("tc"), &[("timeout", 100.into())]).unwrap();
        p.open().unwrap();
        let e = p.read_frame().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Timeout);
        p.close();
    }

    #[test]
    fn seek_within_queue_skips_upstream() {
        let frames = vec![
            video_frame(0, 8),
            video_frame(100, 8),
            video_frame(200, 8),
            video_frame(300, 8),
        ];
        let mut p = connector_over(frames, &[("timeout", 2000.into())]);
        p.open().unwrap();
        settle();
        p.seek(200, SeekDirection::Forward).unwrap();
        assert_eq!(testutil::drain_pts(&mut p), vec![200, 300]);
        p.close();
    }

    #[test]
    fn fps_limited_video_becomes_time_marker() {
        // 30 fps input, 5 fps cap: rejected frames surface as markers.
        let frames: Vec<_> = (0..30).map(|i| video_frame(i * 33, 8)).collect();
        let mut p = connector_over(
            frames,
            &[("fpsLimit", 5.into()), ("timeout", 2000.into())],
        );
        p.open().unwrap();
        settle();
        let mut video = 0;
        let mut markers = 0;
        loop {
            match p.read_frame() {
                Ok(Some(f)) => match f.media() {
                    MediaKind::Video => video += 1,
                    MediaKind::VideoTime => {
                        assert_eq!(f.size(), 0);
                        markers += 1;
                    }
                    other => panic!("unexpected media kind {other:?}"),
                },
                Ok(None) => continue,
                Err(e) if e.kind() == ErrorKind::EndOfStream => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(video + markers, 30);
        assert!(markers > 0, "expected some frames to be limited out");
        assert!(video < 30);
        p.close();
    }

    #[test]
    fn silent_limiter_drops_without_markers() {
        let frames: Vec<_> = (0..30).map(|i| video_frame(i * 33, 8)).collect();
        let mut p = connector_over(
            frames,
            &[
                ("fpsLimit", 5.into()),
                ("silentFpsLimiter", true.into()),
                ("timeout", 2000.into()),
            ],
        );
        p.open().unwrap();
        settle();
        let pts = testutil::drain_pts(&mut p);
        assert!(pts.len() < 30, "expected drops, got {}", pts.len());
        let mut sorted = pts.clone();
        sorted.sort_unstable();
        assert_eq!(pts, sorted, "order must be preserved");
        p.close();
    }

    #[test]
    fn close_is_idempotent() {
        let mut p = connector_over(vec![video_frame(0, 8)], &[]);
        p.open().unwrap();
        p.close();
        p.close();
    }
}

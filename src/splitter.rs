// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A node acting as a fan-out point.
//!
//! Every frame passing through is also pushed into a *subgraph* that the
//! splitter drives independently; the subgraph's output is not something
//! the rest of the graph is interested in. Used for recording, serving
//! HLS, and generating the memory-mapped live view.
//!
//! The subgraph's deepest source is wired to a [`SubgraphFeed`] that
//! serves the splitter's FIFO of forwarded frames, so the subgraph never
//! owns a reference back into the main chain. When the main consumer reads
//! a frame, the splitter forwards it downstream, enqueues a reference for
//! the subgraph, and then drives the subgraph until it stops producing.
//!
//! Parameters: `subgraph.<key>` routes into the subgraph; `subgraph` reads
//! back whether one is attached.

use crate::frame::{PixelFormat, SharedFrame};
use crate::node::{apply_scope, BoxedNode, Node, NodeBase, ParamValue, SourceFlags};
use base::{bail, err, Error, ErrorKind};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{trace, warn};

struct FeedState {
    source_frames: VecDeque<SharedFrame>,
    /// Set while the splitter drains the subgraph one last time before
    /// teardown; the feed reports end of stream so segment writers
    /// finalize.
    flushing: bool,
    /// Geometry of the main chain, captured when the splitter opens.
    dims: Option<(u32, u32, PixelFormat)>,
}

struct FeedShared {
    state: Mutex<FeedState>,
}

/// The subgraph's deepest source: hands out the frames the splitter saved
/// while reading for the main chain.
pub struct SubgraphFeed {
    base: NodeBase,
    shared: Arc<FeedShared>,
}

impl Node for SubgraphFeed {
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
        let mut state = self.shared.state.lock();
        match state.source_frames.pop_front() {
            Some(f) => Ok(Some(f)),
            None if state.flushing => Err(err!(EndOfStream, "splitter flushing")),
            None => Ok(None),
        }
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        if name == "eof" {
            let state = self.shared.state.lock();
            return Ok(ParamValue::Bool(
                state.flushing && state.source_frames.is_empty(),
            ));
        }
        self.forward_get_param(name)
    }

    fn width(&mut self) -> Result<u32, Error> {
        match self.shared.state.lock().dims {
            Some((w, _, _)) => Ok(w),
            None => Err(err!(Unattached, "main chain geometry not known yet")),
        }
    }

    fn height(&mut self) -> Result<u32, Error> {
        match self.shared.state.lock().dims {
            Some((_, h, _)) => Ok(h),
            None => Err(err!(Unattached, "main chain geometry not known yet")),
        }
    }

    fn pixel_format(&mut self) -> Result<PixelFormat, Error> {
        match self.shared.state.lock().dims {
            Some((_, _, p)) => Ok(p),
            None => Err(err!(Unattached, "main chain geometry not known yet")),
        }
    }

    fn close(&mut self) {}
}

pub struct Splitter {
    base: NodeBase,
    feed: Arc<FeedShared>,
    subgraph: Option<BoxedNode>,
    successfully_opened: bool,
}

impl Splitter {
    pub fn new(name: &str) -> Self {
        Splitter {
            base: NodeBase::named(name),
            feed: Arc::new(FeedShared {
                state: Mutex::new(FeedState {
                    source_frames: VecDeque::new(),
                    flushing: false,
                    dims: None,
                }),
            }),
            subgraph: None,
            successfully_opened: false,
        }
    }

    pub fn boxed(name: &str) -> BoxedNode {
        Box::new(Self::new(name))
    }

    /// Attaches a subgraph, replacing (and closing) any existing one. The
    /// subgraph's deepest source is wired to this splitter's feed; with
    /// the splitter already open, the subgraph is opened immediately.
    pub fn set_subgraph(&mut self, subgraph: Option<BoxedNode>) -> Result<(), Error> {
        if let Some(mut old) = self.subgraph.take() {
            old.close();
            self.feed.state.lock().source_frames.clear();
        }
        let Some(mut sub) = subgraph else {
            return Ok(());
        };
        let feed_name = format!(
            "{}.feed",
            self.base.name().unwrap_or("splitter")
        );
        let feed: BoxedNode = Box::new(SubgraphFeed {
            base: NodeBase::named(&feed_name),
            shared: self.feed.clone(),
        });
        attach_to_deepest(sub.as_mut(), feed)?;
        if self.successfully_opened {
            // No open call will come to init the subgraph.
            if let Err(e) = sub.open_in() {
                sub.close();
                return Err(e);
            }
        }
        self.subgraph = Some(sub);
        Ok(())
    }

    pub fn subgraph(&self) -> Option<&dyn Node> {
        self.subgraph.as_deref()
    }

    /// Drives the subgraph until it stops producing frames.
    fn run_subgraph(&mut self) {
        let Some(sub) = self.subgraph.as_deref_mut() else {
            return;
        };
        loop {
            match sub.read_frame() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) if e.kind() == ErrorKind::EndOfStream => break,
                Err(e) => {
                    // Subgraph faults don't take down the main chain.
                    warn!("subgraph read failed: {e}");
                    break;
                }
            }
        }
    }
}

/// Walks to the chain's deepest node and assigns `source` there.
fn attach_to_deepest(node: &mut dyn Node, source: BoxedNode) -> Result<(), Error> {
    if node.base().source().is_some() {
        return attach_to_deepest(
            node.base_mut().source_mut().expect("checked above"),
            source,
        );
    }
    node.set_source(source, SourceFlags::INITIALIZED)
}

impl Node for Splitter {
    fn base(&self) -> &NodeBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut NodeBase {
        &mut self.base
    }

    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base.name(), name);
        if let Some(rest) = name.strip_prefix("subgraph.") {
            return match self.subgraph.as_deref_mut() {
                Some(sub) => sub.set_param(rest, value),
                None => Err(err!(InvalidState, "no subgraph attached")),
            };
        }
        self.forward_set_param(name, value)
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base.name(), name);
        if let Some(rest) = name.strip_prefix("subgraph.") {
            return match self.subgraph.as_deref_mut() {
                Some(sub) => sub.get_param(rest),
                None => Err(err!(InvalidState, "no subgraph attached")),
            };
        }
        if name == "subgraph" {
            return Ok(ParamValue::Bool(self.subgraph.is_some()));
        }
        self.forward_get_param(name)
    }

    fn open_in(&mut self) -> Result<(), Error> {
        self.open_source()?;
        self.successfully_opened = true;

        // Capture the main chain's geometry for the subgraph's benefit.
        let dims = match (self.width(), self.height(), self.pixel_format()) {
            (Ok(w), Ok(h), Ok(p)) => Some((w, h, p)),
            _ => None,
        };
        self.feed.state.lock().dims = dims;

        if let Some(sub) = self.subgraph.as_deref_mut() {
            sub.open_in()?;
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        let frame = self.read_from_source()?;
        if let Some(f) = &frame {
            if self.subgraph.is_some() {
                self.feed.state.lock().source_frames.push_back(f.clone());
            }
        }
        self.run_subgraph();
        Ok(frame)
    }

    fn close(&mut self) {
        if self.subgraph.is_some() {
            trace!("flushing splitter {:?}", self.name());
            self.feed.state.lock().flushing = true;
            self.run_subgraph();
            self.feed.state.lock().flushing = false;
        }
        let _ = self.set_subgraph(None);
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{InsertFlags, Pipeline};
    use crate::testutil::{self, video_frame, CollectSink, ScriptedSource};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn main_chain(frames: Vec<SharedFrame>, splitter: Splitter) -> Pipeline {
        testutil::init();
        let mut p = Pipeline::new();
        p.insert_element(
            None,
            ScriptedSource::boxed("demux", frames),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, Box::new(splitter), InsertFlags::default())
            .unwrap();
        p
    }

    #[test]
    fn subgraph_observes_main_chain_order() {
        let frames: Vec<_> = (0..5).map(|i| video_frame(i * 33, 8)).collect();
        let (sink, seen) = CollectSink::new("rec");
        let mut splitter = Splitter::new("split");
        splitter.set_subgraph(Some(sink)).unwrap();
        let mut p = main_chain(frames, splitter);
        p.open().unwrap();

        let main_pts = testutil::drain_pts(&mut p);
        assert_eq!(main_pts, vec![0, 33, 66, 99, 132]);
        let sub_pts: Vec<i64> = seen.lock().iter().map(|f| f.pts()).collect();
        assert_eq!(sub_pts, main_pts);
    }

    /// Propagates frames and records whether a flush-time end-of-stream
    /// arrived from upstream.
    struct EofProbe {
        base: NodeBase,
        saw_eof: Arc<AtomicBool>,
    }

    impl Node for EofProbe {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }

        fn open_in(&mut self) -> Result<(), Error> {
            if self.base.source().is_none() {
                bail!(Unattached, "no source");
            }
            Ok(())
        }

        fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
            match self.read_from_source() {
                Err(e) if e.kind() == ErrorKind::EndOfStream => {
                    self.saw_eof.store(true, Ordering::SeqCst);
                    Err(e)
                }
                other => other,
            }
        }
    }

    #[test]
    fn close_flushes_subgraph_with_eof() {
        let frames: Vec<_> = (0..3).map(|i| video_frame(i * 33, 8)).collect();
        let saw_eof = Arc::new(AtomicBool::new(false));
        let (sink, seen) = CollectSink::new("rec");
        let mut sub = sink;
        sub.set_source(
            Box::new(EofProbe {
                base: NodeBase::named("probe"),
                saw_eof: saw_eof.clone(),
            }),
            SourceFlags::NONE,
        )
        .unwrap();
        let mut splitter = Splitter::new("split");
        splitter.set_subgraph(Some(sub)).unwrap();
        let mut p = main_chain(frames, splitter);
        p.open().unwrap();
        let _ = testutil::drain_pts(&mut p);
        assert!(!saw_eof.load(Ordering::SeqCst));
        p.close();
        // The flush pass delivered an EOF so segment writers finalize.
        assert!(saw_eof.load(Ordering::SeqCst));
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn subgraph_swap_closes_old_and_feeds_new() {
        let frames: Vec<_> = (0..4).map(|i| video_frame(i * 100, 8)).collect();
        let (first, first_seen) = CollectSink::new("rec1");
        let mut splitter = Splitter::new("split");
        splitter.set_subgraph(Some(first)).unwrap();
        let mut p = main_chain(frames, splitter);
        p.open().unwrap();

        assert_eq!(p.read_frame().unwrap().unwrap().pts(), 0);
        assert_eq!(p.read_frame().unwrap().unwrap().pts(), 100);
        assert_eq!(first_seen.lock().len(), 2);
        p.close();

        // Swap scenario on a standalone splitter: clearing the subgraph
        // stops the fan-out while the main chain keeps flowing.
        let (second, second_seen) = CollectSink::new("rec2");
        let mut splitter = Splitter::new("split2");
        splitter
            .set_source(
                ScriptedSource::boxed("demux2", (0..4).map(|i| video_frame(i * 10, 8)).collect()),
                SourceFlags::NONE,
            )
            .unwrap();
        splitter.set_subgraph(Some(second)).unwrap();
        splitter.open_in().unwrap();
        assert_eq!(splitter.read_frame().unwrap().unwrap().pts(), 0);
        splitter.set_subgraph(None).unwrap();
        assert_eq!(splitter.read_frame().unwrap().unwrap().pts(), 10);
        assert_eq!(second_seen.lock().len(), 1);
        splitter.close();
    }

    #[test]
    fn subgraph_params_route_through_scope() {
        let frames: Vec<_> = (0..2).map(|i| video_frame(i * 33, 8)).collect();
        let sub = crate::jitter::JitterBuffer::boxed("jb");
        let (sink, _seen) = CollectSink::new("rec");
        // Chain: sink -> jitter -> (feed); head is the sink.
        let mut head = sink;
        head.set_source(sub, SourceFlags::NONE).unwrap();
        let mut splitter = Splitter::new("split");
        splitter.set_subgraph(Some(head)).unwrap();
        let mut p = main_chain(frames, splitter);
        p.set_param("split.subgraph.jb.bufferDuration", &0.into())
            .unwrap();
        p.open().unwrap();
        let _ = testutil::drain_pts(&mut p);
    }
}

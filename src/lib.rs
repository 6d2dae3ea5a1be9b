// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Streaming media pipeline for the Nightjar surveillance product.
//!
//! A pipeline is a singly-linked chain of [`node::Node`]s from sink
//! (downstream) to source (upstream). Frames are pulled: the terminal
//! consumer calls [`node::Node::read_frame`], and each node either
//! synthesizes a frame, transforms an upstream frame, or forwards the call.
//! Parameter and configuration calls walk the chain upstream by name.
//!
//! Sources (RTSP clients, local grabbers, file demuxers) and codec stages
//! (decoders, encoders, scalers, resamplers) are external collaborators
//! implementing [`node::Node`]; this crate supplies the runtime they plug
//! into: the frame model and pooled allocator, graph composition, the
//! threaded queue connector, the jitter buffer, the splitter, rate
//! limiting, the in-memory recording buffer, and HLS ladder derivation.

use base::clock::{Clocks, RealClocks};
use std::sync::Arc;

pub mod buffile;
pub mod connector;
pub mod event;
pub mod fps;
pub mod frame;
pub mod hls;
pub mod inject;
pub mod jitter;
pub mod limiter;
pub mod mmapsink;
pub mod node;
pub mod pool;
pub mod recsync;
pub mod splitter;
pub mod testutil;

pub use base::{Error, ErrorKind};

/// Shared services injected at graph creation.
///
/// Everything time-sensitive (the pooled allocator, FPS limiters, the
/// threaded connector's statistics) reads the clock through here, so tests
/// substitute [`base::clock::SimulatedClocks`].
#[derive(Clone)]
pub struct Context {
    pub clocks: Arc<dyn Clocks>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            clocks: Arc::new(RealClocks),
        }
    }

    pub fn with_clocks(clocks: Arc<dyn Clocks>) -> Self {
        Context { clocks }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::connector::QueueConnector;
    use crate::jitter::JitterBuffer;
    use crate::node::{InsertFlags, Pipeline};
    use crate::splitter::Splitter;
    use crate::testutil::{self, video_frame, CollectSink};
    use crate::Context;

    /// A realistic chain: demuxer behind a threaded connector, fanned out
    /// to a recording subgraph, jitter-buffered for the live consumer.
    #[test]
    fn end_to_end_graph_preserves_order() {
        testutil::init();
        let ctx = Context::new();
        let frames: Vec<_> = (0..30).map(|i| video_frame(i * 33, 16)).collect();

        let (rec_sink, recorded) = CollectSink::new("rec");
        let mut splitter = Splitter::new("split");
        splitter.set_subgraph(Some(rec_sink)).unwrap();

        let mut p = Pipeline::new();
        p.insert_element(
            None,
            testutil::ScriptedSource::boxed("demux", frames),
            InsertFlags::default(),
        )
        .unwrap();
        p.insert_element(None, QueueConnector::boxed("tc", &ctx), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Box::new(splitter), InsertFlags::default())
            .unwrap();
        p.insert_element(None, JitterBuffer::boxed("jitbuf"), InsertFlags::default())
            .unwrap();
        p.configure(Some("tc"), &[("timeout", 2000.into())]).unwrap();
        p.configure(Some("jitbuf"), &[("bufferDuration", 100.into())])
            .unwrap();
        p.open().unwrap();

        let served = testutil::drain_pts(&mut p);
        assert!(!served.is_empty());
        let mut sorted = served.clone();
        sorted.sort_unstable();
        assert_eq!(served, sorted, "PTS must be non-decreasing end to end");

        // The recording subgraph observed everything the main chain read,
        // in the same order.
        let recorded: Vec<i64> = recorded.lock().iter().map(|f| f.pts()).collect();
        assert_eq!(recorded.len(), 30);
        let expected: Vec<i64> = (0..30).map(|i| i * 33).collect();
        assert_eq!(recorded, expected);
        p.close();
    }
}

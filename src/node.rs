// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The node abstraction and chain plumbing.
//!
//! Every processing stage implements [`Node`] and holds at most one
//! upstream source. The default method bodies supply every operation that
//! consists of "forward to the source, report an error if there is none";
//! concrete nodes override only the behavior they change.
//!
//! Parameters are addressed as `[<node_name>.]<key>`: a node strips the
//! prefix when it matches its own name, handles keys it recognizes, and
//! forwards the rest upstream. Representative well-known keys: `url`,
//! `timebase`, `fps`, `width`, `height`, `pixfmt`, `videoCodecId`,
//! `audioSampleRate`, `sps`/`pps`, `h264profile`, `h264level`, `bitrate`,
//! `encoderDelay`, `requestFps`, `captureFps`, `eof`, `duration`.

use crate::event::Event;
use crate::frame::SharedFrame;
use base::{bail, err, Error};
use num_rational::Rational32;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub type BoxedNode = Box<dyn Node>;

/// A typed parameter value.
#[derive(Clone, Debug)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Rational(Rational32),
    Frame(SharedFrame),
}

impl ParamValue {
    pub fn as_i64(&self) -> Result<i64, Error> {
        match self {
            ParamValue::Int(v) => Ok(*v),
            ParamValue::Bool(v) => Ok(*v as i64),
            _ => Err(err!(InvalidArgument, "expected an integer, got {:?}", self)),
        }
    }

    pub fn as_f64(&self) -> Result<f64, Error> {
        match self {
            ParamValue::Int(v) => Ok(*v as f64),
            ParamValue::Float(v) => Ok(*v),
            _ => Err(err!(InvalidArgument, "expected a number, got {:?}", self)),
        }
    }

    pub fn as_bool(&self) -> Result<bool, Error> {
        match self {
            ParamValue::Bool(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v != 0),
            _ => Err(err!(InvalidArgument, "expected a flag, got {:?}", self)),
        }
    }

    pub fn as_str(&self) -> Result<&str, Error> {
        match self {
            ParamValue::Str(v) => Ok(v),
            _ => Err(err!(InvalidArgument, "expected a string, got {:?}", self)),
        }
    }

    pub fn as_rational(&self) -> Result<Rational32, Error> {
        match self {
            ParamValue::Rational(v) => Ok(*v),
            _ => Err(err!(InvalidArgument, "expected a rational, got {:?}", self)),
        }
    }

    pub fn as_frame(&self) -> Result<&SharedFrame, Error> {
        match self {
            ParamValue::Frame(v) => Ok(v),
            _ => Err(err!(InvalidArgument, "expected a frame, got {:?}", self)),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<Rational32> for ParamValue {
    fn from(v: Rational32) -> Self {
        ParamValue::Rational(v)
    }
}

impl From<SharedFrame> for ParamValue {
    fn from(v: SharedFrame) -> Self {
        ParamValue::Frame(v)
    }
}

/// Strips a `<node>.` scope prefix from `key` when it matches `scope`.
pub fn apply_scope<'a>(scope: Option<&str>, key: &'a str) -> &'a str {
    if let Some(name) = scope {
        if key.len() > name.len()
            && key.as_bytes()[name.len()] == b'.'
            && key[..name.len()].eq_ignore_ascii_case(name)
        {
            return &key[name.len() + 1..];
        }
    }
    key
}

/// Identity of one node, for cycle detection at wiring time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct SourceFlags {
    /// The source is already initialized; `open_in` must not reopen it.
    pub initialized: bool,
}

impl SourceFlags {
    pub const NONE: SourceFlags = SourceFlags { initialized: false };
    pub const INITIALIZED: SourceFlags = SourceFlags { initialized: true };
}

#[derive(Copy, Clone, Debug, Default)]
pub struct InsertFlags {
    /// Open the new element immediately after splicing it in.
    pub open: bool,
    /// The existing chain is already initialized; opening the new element
    /// must not reopen it.
    pub initialized: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SeekDirection {
    Backward,
    Forward,
}

/// State common to all nodes.
pub struct NodeBase {
    name: Option<String>,
    id: NodeId,
    source: Option<BoxedNode>,
    source_initialized: bool,
    passthrough: bool,
}

impl NodeBase {
    pub fn named(name: &str) -> Self {
        NodeBase {
            name: Some(name.to_owned()),
            id: NodeId::next(),
            source: None,
            source_initialized: false,
            passthrough: false,
        }
    }

    pub fn unnamed() -> Self {
        NodeBase {
            name: None,
            id: NodeId::next(),
            source: None,
            source_initialized: false,
            passthrough: false,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn source(&self) -> Option<&dyn Node> {
        self.source.as_deref()
    }

    pub fn source_mut(&mut self) -> Option<&mut (dyn Node + '_)> {
        match self.source {
            Some(ref mut b) => Some(b.as_mut()),
            None => None,
        }
    }

    pub fn source_initialized(&self) -> bool {
        self.source_initialized
    }

    /// Marks this node as not transforming data, letting readers skip it.
    pub fn set_passthrough(&mut self, passthrough: bool) {
        self.passthrough = passthrough;
    }
}

/// One processing stage in a pipeline.
///
/// Object-safe; chains are built from `Box<dyn Node>`. All operations run
/// on the consumer's thread unless a node (like the threaded queue
/// connector) documents otherwise.
pub trait Node: Send {
    fn base(&self) -> &NodeBase;
    fn base_mut(&mut self) -> &mut NodeBase;

    fn name(&self) -> Option<&str> {
        self.base().name()
    }

    fn id(&self) -> NodeId {
        self.base().id
    }

    fn is_passthrough(&self) -> bool {
        self.base().passthrough
    }

    /// True if `id` names this node or any node upstream of it.
    fn reaches(&self, id: NodeId) -> bool {
        if self.id() == id {
            return true;
        }
        match self.base().source() {
            Some(s) => s.reaches(id),
            None => false,
        }
    }

    /// Assigns the upstream source. Fails with `CyclicGraph` when the new
    /// source's chain already reaches this node, leaving the wiring
    /// unchanged.
    fn set_source(&mut self, source: BoxedNode, flags: SourceFlags) -> Result<(), Error> {
        if source.reaches(self.id()) {
            bail!(
                CyclicGraph,
                "source chain already reaches {:?}",
                self.name().unwrap_or("<anonymous>")
            );
        }
        let base = self.base_mut();
        base.source = Some(source);
        base.source_initialized = flags.initialized;
        Ok(())
    }

    /// Detaches and returns the upstream chain without closing it.
    fn take_source(&mut self) -> Option<BoxedNode> {
        let base = self.base_mut();
        base.source_initialized = false;
        base.source.take()
    }

    /// The immediate upstream node.
    fn source_node(&self) -> Option<&dyn Node> {
        self.base().source()
    }

    /// Finds the named node in the source chain (this node excluded).
    fn find_in_source(&self, name: &str) -> Option<&dyn Node> {
        let src = self.base().source()?;
        if src.name() == Some(name) {
            return Some(src);
        }
        src.find_in_source(name)
    }

    /// Splices `node` between the element named `before` and that
    /// element's source. `before == None` addresses this node itself.
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
        if !here {
            return match self.base_mut().source_mut() {
                Some(s) => s.insert_element(before, node, flags),
                None => Err(err!(
                    InvalidArgument,
                    "no element named {:?} in the chain",
                    before.unwrap_or_default()
                )),
            };
        }
        if node.reaches(self.id()) {
            bail!(
                CyclicGraph,
                "inserting {:?} before {:?} would create a cycle",
                node.name().unwrap_or("<anonymous>"),
                self.name().unwrap_or("<anonymous>")
            );
        }
        let mut node = node;
        let old_initialized = self.base().source_initialized;
        if let Some(old) = self.take_source() {
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
        self.set_source(node, SourceFlags { initialized: flags.open })
    }

    /// Unlinks the named node from the source chain. With `keep` the node
    /// is returned (detached from its source); otherwise it is closed.
    fn remove_element(&mut self, name: &str, keep: bool) -> Result<Option<BoxedNode>, Error> {
        let source_matches = match self.base().source() {
            Some(s) => s.name() == Some(name),
            None => bail!(InvalidArgument, "no element named {name:?} in the chain"),
        };
        if !source_matches {
            return self
                .base_mut()
                .source_mut()
                .expect("checked above")
                .remove_element(name, keep);
        }
        let mut removed = self.take_source().expect("checked above");
        let upstream_initialized = removed.base().source_initialized;
        if let Some(upstream) = removed.take_source() {
            self.set_source(
                upstream,
                SourceFlags {
                    initialized: upstream_initialized,
                },
            )?;
        }
        if keep {
            Ok(Some(removed))
        } else {
            removed.close();
            Ok(None)
        }
    }

    /// Typed configuration. Strips this node's scope prefix, then forwards
    /// upstream; fails with `UnknownParameter` when no node in the chain
    /// recognizes the key.
    fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        let name = apply_scope(self.base().name(), name);
        self.forward_set_param(name, value)
    }

    fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        let name = apply_scope(self.base().name(), name);
        self.forward_get_param(name)
    }

    /// Forwards a (scope-stripped) parameter write upstream.
    fn forward_set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.set_param(name, value),
            None => {
                debug!("unknown parameter: {name}");
                Err(err!(UnknownParameter, "{name}"))
            }
        }
    }

    /// Forwards a (scope-stripped) parameter read upstream.
    fn forward_get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.get_param(name),
            None => {
                debug!("unknown parameter: {name}");
                Err(err!(UnknownParameter, "{name}"))
            }
        }
    }

    /// Initializes the chain: opens the source first unless it was marked
    /// already initialized.
    fn open_in(&mut self) -> Result<(), Error> {
        self.open_source()
    }

    /// The default `open_in` body, callable from overriding nodes that add
    /// initialization of their own.
    fn open_source(&mut self) -> Result<(), Error> {
        if self.base().source.is_none() {
            bail!(
                Unattached,
                "failed to open {:?}: source isn't set",
                self.name().unwrap_or("<anonymous>")
            );
        }
        if !self.base().source_initialized {
            self.base_mut()
                .source_mut()
                .expect("checked above")
                .open_in()?;
        }
        self.base_mut().source_initialized = true;
        Ok(())
    }

    fn seek(&mut self, offset_ms: i64, dir: SeekDirection) -> Result<(), Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.seek(offset_ms, dir),
            None => Err(err!(Unattached, "no source to seek")),
        }
    }

    fn width(&mut self) -> Result<u32, Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.width(),
            None => Err(err!(Unattached, "no source to query width")),
        }
    }

    fn height(&mut self) -> Result<u32, Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.height(),
            None => Err(err!(Unattached, "no source to query height")),
        }
    }

    fn pixel_format(&mut self) -> Result<crate::frame::PixelFormat, Error> {
        match self.base_mut().source_mut() {
            Some(s) => s.pixel_format(),
            None => Err(err!(Unattached, "no source to query pixel format")),
        }
    }

    /// Pulls one frame. `Ok(None)` means "no frame right now"; end of
    /// stream and transport faults are errors (`EndOfStream`, `Io`).
    fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        self.read_from_source()
    }

    /// Reads from the first non-passthrough upstream node, skipping
    /// passthrough links in between.
    fn read_from_source(&mut self) -> Result<Option<SharedFrame>, Error> {
        let src = self
            .base_mut()
            .source
            .as_deref_mut()
            .ok_or_else(|| err!(Unattached, "source isn't set"))?;
        if src.is_passthrough() && src.base().source.is_some() {
            src.read_from_source()
        } else {
            src.read_frame()
        }
    }

    /// Delivers an out-of-band event; the default forwards it upstream.
    fn handle_event(&mut self, ev: &Event) {
        if let Some(s) = self.base_mut().source_mut() {
            s.handle_event(ev);
        }
    }

    /// Renders the chain for diagnostics, e.g. `sink->limiter->demux`.
    fn print_pipeline(&self, out: &mut String) {
        out.push_str(self.name().unwrap_or("?"));
        if let Some(s) = self.base().source() {
            out.push_str("->");
            s.print_pipeline(out);
        }
    }

    /// Closes the upstream chain and releases it.
    fn close(&mut self) {
        if let Some(mut s) = self.take_source() {
            s.close();
        }
    }
}

/// Owning handle on a chain's downstream end.
///
/// The enclosing process builds a graph by appending nodes here, then pulls
/// frames from the terminal node.
#[derive(Default)]
pub struct Pipeline {
    head: Option<BoxedNode>,
}

impl Pipeline {
    pub fn new() -> Self {
        Pipeline { head: None }
    }

    pub fn from_node(node: BoxedNode) -> Self {
        Pipeline { head: Some(node) }
    }

    pub fn head(&self) -> Option<&dyn Node> {
        self.head.as_deref()
    }

    pub fn head_mut(&mut self) -> Option<&mut (dyn Node + '_)> {
        match self.head {
            Some(ref mut b) => Some(b.as_mut()),
            None => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Adds a node. With `before == None` the node becomes the new head,
    /// its source set to the prior head (or none for an empty pipeline);
    /// with a name, the node is spliced between the named element and that
    /// element's source.
    pub fn insert_element(
        &mut self,
        before: Option<&str>,
        node: BoxedNode,
        flags: InsertFlags,
    ) -> Result<(), Error> {
        if let Some(before_name) = before {
            return match self.head.as_deref_mut() {
                Some(head) => head.insert_element(Some(before_name), node, flags),
                None => Err(err!(
                    InvalidArgument,
                    "no element named {before_name:?} in an empty pipeline"
                )),
            };
        }
        let mut node = node;
        if let Some(old_head) = self.head.take() {
            node.set_source(
                old_head,
                SourceFlags {
                    initialized: flags.initialized,
                },
            )?;
        }
        if flags.open {
            node.open_in()?;
        }
        self.head = Some(node);
        Ok(())
    }

    /// Unlinks the named node. With `keep` it is returned for reuse;
    /// otherwise it is closed.
    pub fn remove_element(&mut self, name: &str, keep: bool) -> Result<Option<BoxedNode>, Error> {
        let head = self
            .head
            .as_deref_mut()
            .ok_or_else(|| err!(InvalidArgument, "empty pipeline"))?;
        if head.name() != Some(name) {
            return head.remove_element(name, keep);
        }
        let mut removed = self.head.take().expect("checked above");
        self.head = removed.take_source();
        if keep {
            Ok(Some(removed))
        } else {
            removed.close();
            Ok(None)
        }
    }

    /// Finds the named node; `None` returns the head's immediate source.
    pub fn find_element(&self, name: Option<&str>) -> Option<&dyn Node> {
        let head = self.head.as_deref()?;
        match name {
            None => head.source_node(),
            Some(n) => {
                if head.name() == Some(n) {
                    Some(head)
                } else {
                    head.find_in_source(n)
                }
            }
        }
    }

    pub fn open(&mut self) -> Result<(), Error> {
        match self.head.as_deref_mut() {
            Some(h) => h.open_in(),
            None => Err(err!(Unattached, "empty pipeline")),
        }
    }

    pub fn read_frame(&mut self) -> Result<Option<SharedFrame>, Error> {
        match self.head.as_deref_mut() {
            Some(h) => h.read_frame(),
            None => Err(err!(Unattached, "empty pipeline")),
        }
    }

    pub fn seek(&mut self, offset_ms: i64, dir: SeekDirection) -> Result<(), Error> {
        match self.head.as_deref_mut() {
            Some(h) => h.seek(offset_ms, dir),
            None => Err(err!(Unattached, "empty pipeline")),
        }
    }

    pub fn set_param(&mut self, name: &str, value: &ParamValue) -> Result<(), Error> {
        match self.head.as_deref_mut() {
            Some(h) => h.set_param(name, value),
            None => Err(err!(Unattached, "empty pipeline")),
        }
    }

    pub fn get_param(&mut self, name: &str) -> Result<ParamValue, Error> {
        match self.head.as_deref_mut() {
            Some(h) => h.get_param(name),
            None => Err(err!(Unattached, "empty pipeline")),
        }
    }

    /// Applies a batch of `(key, value)` settings, optionally under a
    /// `<prefix>.` scope, stopping at the first failure.
    pub fn configure(
        &mut self,
        prefix: Option<&str>,
        params: &[(&str, ParamValue)],
    ) -> Result<(), Error> {
        for (key, value) in params {
            let scoped;
            let name = match prefix {
                Some(p) => {
                    scoped = format!("{p}.{key}");
                    scoped.as_str()
                }
                None => key,
            };
            if let Err(e) = self.set_param(name, value) {
                tracing::error!("failed to set parameter {name}: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn handle_event(&mut self, ev: &Event) {
        if let Some(h) = self.head.as_deref_mut() {
            h.handle_event(ev);
        }
    }

    pub fn print(&self) -> String {
        let mut out = String::new();
        if let Some(h) = self.head.as_deref() {
            h.print_pipeline(&mut out);
        }
        out
    }

    pub fn close(&mut self) {
        if let Some(mut h) = self.head.take() {
            h.close();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ScriptedSource};

    /// A no-op filter for graph-shape tests.
    struct Passthrough {
        base: NodeBase,
    }

    impl Passthrough {
        fn boxed(name: &str) -> BoxedNode {
            Box::new(Passthrough {
                base: NodeBase::named(name),
            })
        }

        fn boxed_passthrough(name: &str) -> BoxedNode {
            let mut n = Passthrough {
                base: NodeBase::named(name),
            };
            n.base.set_passthrough(true);
            Box::new(n)
        }
    }

    impl Node for Passthrough {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }
    }

    /// Simulates a node whose internal state references other nodes, the
    /// way a fan-out stage shares queues with its subgraph.
    struct SharesState {
        base: NodeBase,
        also_reaches: NodeId,
    }

    impl Node for SharesState {
        fn base(&self) -> &NodeBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut NodeBase {
            &mut self.base
        }

        fn reaches(&self, id: NodeId) -> bool {
            id == self.also_reaches || self.base.id == id || self.base.source().map(|s| s.reaches(id)).unwrap_or(false)
        }
    }

    fn chain() -> Pipeline {
        testutil::init();
        let mut p = Pipeline::new();
        p.insert_element(None, ScriptedSource::boxed("demux", vec![]), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Passthrough::boxed("mid"), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Passthrough::boxed("sink"), InsertFlags::default())
            .unwrap();
        p
    }

    #[test]
    fn insert_builds_sink_to_source() {
        let p = chain();
        assert_eq!(p.print(), "sink->mid->demux");
    }

    #[test]
    fn find_element_walks_chain() {
        let p = chain();
        assert_eq!(p.find_element(Some("mid")).unwrap().name(), Some("mid"));
        assert_eq!(p.find_element(Some("demux")).unwrap().name(), Some("demux"));
        // `None` names the head's immediate source.
        assert_eq!(p.find_element(None).unwrap().name(), Some("mid"));
        assert!(p.find_element(Some("nope")).is_none());
    }

    #[test]
    fn insert_before_named_element_splices_upstream() {
        let mut p = chain();
        p.insert_element(Some("mid"), Passthrough::boxed("new"), InsertFlags::default())
            .unwrap();
        // `new` sits between `mid` and `mid`'s prior source.
        assert_eq!(p.print(), "sink->mid->new->demux");
        let found = p.find_element(Some("new")).unwrap();
        assert_eq!(found.source_node().unwrap().name(), Some("demux"));
    }

    #[test]
    fn insert_then_remove_restores_chain() {
        let mut p = chain();
        let before = p.print();
        p.insert_element(Some("mid"), Passthrough::boxed("tmp"), InsertFlags::default())
            .unwrap();
        let removed = p.remove_element("tmp", true).unwrap().unwrap();
        assert_eq!(removed.name(), Some("tmp"));
        assert!(removed.base().source().is_none());
        assert_eq!(p.print(), before);
    }

    #[test]
    fn remove_head_promotes_source() {
        let mut p = chain();
        p.remove_element("sink", false).unwrap();
        assert_eq!(p.print(), "mid->demux");
    }

    #[test]
    fn cyclic_set_source_rejected_and_unchanged() {
        testutil::init();
        let shared_id;
        let mut sink = Passthrough::boxed("sink");
        let feeder = {
            let inner = ScriptedSource::boxed("src", vec![]);
            shared_id = sink.id();
            let mut n = SharesState {
                base: NodeBase::named("fan"),
                also_reaches: shared_id,
            };
            n.base.set_passthrough(false);
            let mut b: BoxedNode = Box::new(n);
            b.set_source(inner, SourceFlags::NONE).unwrap();
            b
        };
        let e = sink.set_source(feeder, SourceFlags::NONE).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::CyclicGraph);
        assert!(sink.base().source().is_none());
    }

    #[test]
    fn scoped_params_strip_and_forward() {
        let mut p = chain();
        // `demux.fps` reaches the source with the prefix stripped.
        p.set_param("demux.fps", &ParamValue::Float(12.5)).unwrap();
        assert_eq!(
            p.get_param("demux.fps").unwrap().as_f64().unwrap(),
            12.5
        );
        // Unknown keys surface `UnknownParameter` from the end of the chain.
        let e = p.set_param("bogus", &ParamValue::Int(1)).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::UnknownParameter);
    }

    #[test]
    fn read_skips_passthrough_links() {
        testutil::init();
        let frames = vec![testutil::video_frame(0, 100), testutil::video_frame(33, 100)];
        let mut p = Pipeline::new();
        p.insert_element(None, ScriptedSource::boxed("demux", frames), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Passthrough::boxed_passthrough("skip1"), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Passthrough::boxed_passthrough("skip2"), InsertFlags::default())
            .unwrap();
        p.insert_element(None, Passthrough::boxed("sink"), InsertFlags::default())
            .unwrap();
        p.open().unwrap();
        assert_eq!(p.read_frame().unwrap().unwrap().pts(), 0);
        assert_eq!(p.read_frame().unwrap().unwrap().pts(), 33);
    }

    #[test]
    fn open_requires_source() {
        testutil::init();
        let mut orphan = Passthrough::boxed("sink");
        let e = orphan.open_in().unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unattached);
    }
}

// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Pool of preallocated frame payload buffers.
//!
//! Producers that churn through heavyweight allocations (one per frame, tens
//! per second, per camera) acquire payloads here instead of the global
//! allocator. A recycled buffer keeps its capacity, so a steady-state
//! pipeline stops allocating entirely; an idle pool shrinks back down.

use base::clock::Clocks;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Extra capacity reserved past the payload, so codec parsers that read a
/// few bytes beyond the end stay within the allocation.
pub const PAYLOAD_PADDING: usize = 64;

const DEFAULT_DESIRED_COUNT: usize = 5;
const DEFAULT_REDUCTION_THRESHOLD_MS: i64 = 2000;

type ResetFn = Box<dyn Fn(&mut Vec<u8>) + Send + Sync>;

/// A per-producer pool of recyclable payload buffers.
///
/// Dropping the pool handle while buffers are still in flight defers
/// teardown: the buffers keep the internals alive, stop being cached on
/// return, and the last one back frees everything.
pub struct FramePool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    name: String,
    clocks: Arc<dyn Clocks>,
    reset: ResetFn,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<Vec<u8>>,
    in_flight: usize,
    desired_count: usize,
    reduction_threshold_ms: i64,
    last_alloc_ms: i64,
    dying: bool,
}

impl PoolState {
    /// Destroys one cached buffer if the pool has been over its desired
    /// count for longer than the reduction threshold.
    fn reduce(&mut self, now_ms: i64) -> bool {
        if self.free.len() > self.desired_count
            && now_ms - self.last_alloc_ms > self.reduction_threshold_ms
        {
            self.free.pop();
            return true;
        }
        false
    }
}

impl FramePool {
    pub fn new(name: &str, clocks: Arc<dyn Clocks>) -> Self {
        Self::with_limits(
            name,
            clocks,
            DEFAULT_DESIRED_COUNT,
            DEFAULT_REDUCTION_THRESHOLD_MS,
        )
    }

    /// `desired_count` is the steady-state number of cached free buffers;
    /// `reduction_threshold_ms` the minimum idle time before shrinking.
    pub fn with_limits(
        name: &str,
        clocks: Arc<dyn Clocks>,
        desired_count: usize,
        reduction_threshold_ms: i64,
    ) -> Self {
        let now = clocks.wall_ms();
        FramePool {
            shared: Arc::new(PoolShared {
                name: name.to_owned(),
                clocks,
                reset: Box::new(|v| v.clear()),
                state: Mutex::new(PoolState {
                    free: Vec::new(),
                    in_flight: 0,
                    desired_count,
                    reduction_threshold_ms,
                    last_alloc_ms: now,
                    dying: false,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a blank buffer with at least `min_size` + padding of
    /// capacity, recycled when the free list has one, freshly allocated
    /// otherwise.
    pub fn acquire(&self, min_size: usize) -> PoolBuffer {
        let now = self.shared.clocks.wall_ms();
        let mut data = {
            let mut state = self.shared.state.lock();
            match state.free.pop() {
                Some(mut v) => {
                    (self.shared.reset)(&mut v);
                    state.reduce(now);
                    state.in_flight += 1;
                    v
                }
                None => {
                    state.last_alloc_ms = now;
                    state.in_flight += 1;
                    Vec::new()
                }
            }
        };
        data.reserve(min_size + PAYLOAD_PADDING);
        PoolBuffer {
            data,
            owner: Some(self.shared.clone()),
        }
    }

    /// (cached free buffers, buffers in flight)
    pub fn stats(&self) -> (usize, usize) {
        let state = self.shared.state.lock();
        (state.free.len(), state.in_flight)
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.dying = true;
        state.free.clear();
    }
}

impl PoolShared {
    fn release(&self, data: Vec<u8>) {
        let now = self.clocks.wall_ms();
        let mut state = self.state.lock();
        state.in_flight -= 1;
        let destroy = state.reduce(now) || state.dying;
        if !destroy {
            state.free.push(data);
        }
    }
}

/// One payload allocation, routed back to its owning pool on drop.
/// Unpooled buffers (test fixtures, one-off metadata blobs) free normally.
pub struct PoolBuffer {
    data: Vec<u8>,
    owner: Option<Arc<PoolShared>>,
}

impl PoolBuffer {
    pub fn empty() -> Self {
        PoolBuffer {
            data: Vec::new(),
            owner: None,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        PoolBuffer { data, owner: None }
    }

    pub fn copied_from(bytes: &[u8]) -> Self {
        let mut data = Vec::with_capacity(bytes.len() + PAYLOAD_PADDING);
        data.extend_from_slice(bytes);
        PoolBuffer { data, owner: None }
    }

    pub fn is_pooled(&self) -> bool {
        self.owner.is_some()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Writable access for filling the payload; only valid while the frame
    /// holding this buffer is exclusively owned.
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.release(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.data.len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

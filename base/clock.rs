// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Frame timestamps are milliseconds since the stream epoch, so everything
//! time-related in the pipeline works in milliseconds too.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall clock time in milliseconds since the Unix epoch.
    fn wall_ms(&self) -> i64;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn wall_ms(&self) -> i64 {
        jiff::Timestamp::now().as_millisecond()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot_ms: i64,
    uptime_ms: Mutex<i64>,
}

impl SimulatedClocks {
    pub fn new(boot_ms: i64) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot_ms,
            uptime_ms: Mutex::new(0),
        }))
    }

    /// Advances the clock by the specified amount without actually sleeping.
    pub fn advance(&self, ms: i64) {
        *self.0.uptime_ms.lock() += ms;
    }
}

impl Clocks for SimulatedClocks {
    fn wall_ms(&self) -> i64 {
        self.0.boot_ms + *self.0.uptime_ms.lock()
    }

    fn sleep(&self, how_long: Duration) {
        self.advance(how_long.as_millis() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_advances_on_sleep() {
        let c = SimulatedClocks::new(1_000);
        assert_eq!(c.wall_ms(), 1_000);
        c.sleep(Duration::from_millis(250));
        assert_eq!(c.wall_ms(), 1_250);
        c.advance(50);
        assert_eq!(c.wall_ms(), 1_300);
    }
}

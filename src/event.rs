// This file is part of Nightjar, a security camera media pipeline.
// Copyright (C) 2022 The Nightjar Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Named, timestamped notifications with a property bag.
//!
//! Nodes emit events for out-of-band facts that do not travel as frames:
//! a recorder starting a new segment file, for example. Well-known events:
//!
//! * `recorder.newFile { filename: string }`
//! * `recorder.closeFile { filename: string }`

use std::collections::HashMap;

#[derive(Clone, Debug)]
pub struct Event {
    name: String,
    ts: i64,
    properties: HashMap<String, Vec<u8>>,
}

impl Event {
    pub fn new(name: &str, ts: i64) -> Self {
        Event {
            name: name.to_owned(),
            ts,
            properties: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn set_ts(&mut self, ts: i64) {
        self.ts = ts;
    }

    /// Sets a property, replacing any existing value under the same name.
    pub fn set_property<V: Into<Vec<u8>>>(&mut self, name: &str, value: V) {
        self.properties.insert(name.to_owned(), value.into());
    }

    pub fn with_property<V: Into<Vec<u8>>>(mut self, name: &str, value: V) -> Self {
        self.set_property(name, value);
        self
    }

    pub fn property(&self, name: &str) -> Option<&[u8]> {
        self.properties.get(name).map(|v| v.as_slice())
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.property(name).and_then(|v| std::str::from_utf8(v).ok())
    }
}

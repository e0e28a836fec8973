// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Metrics capability trait.
//!
//! Concrete exporters are external collaborators; core code emits through
//! this handler shape only. The in-memory handler backs test assertions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A metric tag.
pub type Tag = (&'static str, String);

/// Sink for counters, gauges and timers with tag sets.
pub trait MetricsHandler: Send + Sync {
    /// Add `value` to a counter.
    fn counter(&self, name: &'static str, value: u64, tags: &[Tag]);
    /// Record a gauge reading.
    fn gauge(&self, name: &'static str, value: f64, tags: &[Tag]);
    /// Record an elapsed duration.
    fn timer(&self, name: &'static str, elapsed: Duration, tags: &[Tag]);
}

/// Handler that drops everything.
#[derive(Debug, Clone, Default)]
pub struct NoopMetricsHandler;

impl MetricsHandler for NoopMetricsHandler {
    fn counter(&self, _name: &'static str, _value: u64, _tags: &[Tag]) {}
    fn gauge(&self, _name: &'static str, _value: f64, _tags: &[Tag]) {}
    fn timer(&self, _name: &'static str, _elapsed: Duration, _tags: &[Tag]) {}
}

/// Handler that accumulates counters in memory for assertions.
#[derive(Debug, Clone, Default)]
pub struct CapturingMetricsHandler {
    counters: Arc<Mutex<HashMap<String, u64>>>,
}

impl CapturingMetricsHandler {
    /// Empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 if never written.
    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .expect("metrics lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsHandler for CapturingMetricsHandler {
    fn counter(&self, name: &'static str, value: u64, _tags: &[Tag]) {
        *self
            .counters
            .lock()
            .expect("metrics lock poisoned")
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    fn gauge(&self, _name: &'static str, _value: f64, _tags: &[Tag]) {}

    fn timer(&self, _name: &'static str, _elapsed: Duration, _tags: &[Tag]) {}
}

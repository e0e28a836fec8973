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

//! Recent-poller history per task queue.
//!
//! Rule commits and deployment version deletion consult these records: a
//! build id with no poller inside the TTL is considered unserved.

use chrono::{DateTime, Duration, Utc};
use kairos_core::BuildId;
use std::collections::HashMap;
use std::sync::Mutex;

/// One recent poller sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerInfo {
    /// Worker-supplied identity.
    pub identity: String,
    /// Build id the worker declared.
    pub build_id: BuildId,
    /// Last poll time.
    pub last_access_time: DateTime<Utc>,
}

/// TTL-bounded history of pollers for one task queue.
pub struct PollerHistory {
    ttl: Duration,
    entries: Mutex<HashMap<(String, BuildId), DateTime<Utc>>>,
}

impl PollerHistory {
    /// History with the given TTL.
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(300)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a poll at the current time.
    pub fn record(&self, identity: &str, build_id: &str) {
        self.record_at(identity, build_id, Utc::now());
    }

    /// Record a poll at an explicit time.
    pub fn record_at(&self, identity: &str, build_id: &str, at: DateTime<Utc>) {
        self.entries
            .lock()
            .expect("poller history lock poisoned")
            .insert((identity.to_string(), build_id.to_string()), at);
    }

    /// Whether any poller for `build_id` was seen inside the TTL.
    pub fn has_recent_poller(&self, build_id: &str) -> bool {
        let cutoff = Utc::now() - self.ttl;
        self.entries
            .lock()
            .expect("poller history lock poisoned")
            .iter()
            .any(|((_, build), at)| build == build_id && *at >= cutoff)
    }

    /// All pollers inside the TTL; aged-out entries are pruned.
    pub fn recent_pollers(&self) -> Vec<PollerInfo> {
        let cutoff = Utc::now() - self.ttl;
        let mut entries = self.entries.lock().expect("poller history lock poisoned");
        entries.retain(|_, at| *at >= cutoff);
        entries
            .iter()
            .map(|((identity, build_id), at)| PollerInfo {
                identity: identity.clone(),
                build_id: build_id.clone(),
                last_access_time: *at,
            })
            .collect()
    }
}

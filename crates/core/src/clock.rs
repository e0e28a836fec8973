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

//! Hybrid logical clock.
//!
//! ## Purpose
//! Versioning-rule timestamps and shard versionstamps need a total order that
//! survives wall-clock skew between hosts. The hybrid clock pairs a millisecond
//! wall reading with a logical counter that breaks ties within a millisecond,
//! and a cluster id that breaks ties between clusters.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A hybrid logical clock reading.
///
/// Ordering is lexicographic over `(wall_clock_ms, logical, cluster_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridClock {
    /// Milliseconds since the Unix epoch at the time of the tick.
    pub wall_clock_ms: i64,
    /// Tie-breaker within a single millisecond.
    pub logical: i32,
    /// Identifier of the cluster that produced the tick.
    pub cluster_id: i64,
}

impl HybridClock {
    /// The zero clock for a cluster. Used as the origin timestamp in tests
    /// and for freshly initialized versioning documents.
    pub fn zero(cluster_id: i64) -> Self {
        Self {
            wall_clock_ms: 0,
            logical: 0,
            cluster_id,
        }
    }

    /// Produce the next tick after `self` given the current wall time.
    ///
    /// If the wall clock has advanced, the logical counter resets; otherwise
    /// it increments so consecutive ticks never compare equal.
    pub fn next(&self, now: DateTime<Utc>) -> Self {
        let wall = now.timestamp_millis();
        if wall > self.wall_clock_ms {
            Self {
                wall_clock_ms: wall,
                logical: 0,
                cluster_id: self.cluster_id,
            }
        } else {
            Self {
                wall_clock_ms: self.wall_clock_ms,
                logical: self.logical + 1,
                cluster_id: self.cluster_id,
            }
        }
    }

    /// The later of two clocks.
    pub fn max(a: Self, b: Self) -> Self {
        if a >= b {
            a
        } else {
            b
        }
    }

    /// Wall-clock component as a UTC timestamp (millisecond precision).
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.wall_clock_ms)
            .single()
            .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch is valid"))
    }
}

impl Ord for HybridClock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.wall_clock_ms
            .cmp(&other.wall_clock_ms)
            .then(self.logical.cmp(&other.logical))
            .then(self.cluster_id.cmp(&other.cluster_id))
    }
}

impl PartialOrd for HybridClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_advances_on_wall_progress() {
        let c0 = HybridClock::zero(1);
        let c1 = c0.next(Utc.timestamp_millis_opt(10).single().unwrap());
        assert_eq!(c1.wall_clock_ms, 10);
        assert_eq!(c1.logical, 0);
        assert!(c1 > c0);
    }

    #[test]
    fn test_next_increments_logical_on_stalled_wall() {
        let c0 = HybridClock {
            wall_clock_ms: 50,
            logical: 0,
            cluster_id: 1,
        };
        // Wall clock went backwards; logical must break the tie.
        let c1 = c0.next(Utc.timestamp_millis_opt(40).single().unwrap());
        assert_eq!(c1.wall_clock_ms, 50);
        assert_eq!(c1.logical, 1);
        assert!(c1 > c0);
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = HybridClock {
            wall_clock_ms: 1,
            logical: 9,
            cluster_id: 9,
        };
        let b = HybridClock {
            wall_clock_ms: 2,
            logical: 0,
            cluster_id: 0,
        };
        assert!(b > a);
        assert_eq!(HybridClock::max(a, b), b);
    }
}

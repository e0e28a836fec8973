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

//! Namespace model and cached registry for Kairos
//!
//! A namespace is the global unit of tenancy: it carries cluster replication
//! config, retention, the bad-binary list, and a notification version that is
//! monotonic across all namespace mutations. Deleted and deprecated
//! namespaces remain observable.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod registry;

pub use registry::NamespaceRegistry;

use kairos_persistence::{NamespaceRecord, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Lifecycle state of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamespaceState {
    /// Active and serving traffic.
    Registered,
    /// No new workflows; existing ones may finish.
    Deprecated,
    /// Deleted; retained for observability until scavenged.
    Deleted,
}

/// Cross-cluster replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// Normal operation.
    Normal,
    /// Mid-handover to another cluster; side-effect tasks are deferred.
    Handover,
}

/// Replication configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Cluster currently active for this namespace.
    pub active_cluster: String,
    /// All clusters the namespace is replicated to.
    pub clusters: Vec<String>,
    /// Current replication state.
    pub state: ReplicationState,
}

/// A namespace entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    /// Immutable id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Lifecycle state.
    pub state: NamespaceState,
    /// Free-form description; changes are immaterial to consumers.
    pub description: String,
    /// Owning team or contact; changes are immaterial to consumers.
    pub owner: String,
    /// Closed-workflow retention.
    pub retention: Duration,
    /// Replication configuration.
    pub replication: ReplicationConfig,
    /// Worker binary checksums banned from progressing workflows, with the
    /// operator-supplied reason.
    pub bad_binaries: BTreeMap<String, String>,
    /// Monotonic version across all namespace mutations.
    pub notification_version: i64,
}

impl Namespace {
    /// Minimal registered namespace on a single cluster.
    pub fn new(id: impl Into<String>, name: impl Into<String>, cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            id: id.into(),
            name: name.into(),
            state: NamespaceState::Registered,
            description: String::new(),
            owner: String::new(),
            retention: Duration::from_secs(3 * 24 * 3600),
            replication: ReplicationConfig {
                active_cluster: cluster.clone(),
                clusters: vec![cluster],
                state: ReplicationState::Normal,
            },
            bad_binaries: BTreeMap::new(),
            notification_version: 0,
        }
    }

    /// Whether the namespace is replicated to `cluster`.
    pub fn is_on_cluster(&self, cluster: &str) -> bool {
        self.replication.clusters.iter().any(|c| c == cluster)
    }

    /// Whether `cluster` is the active cluster.
    pub fn is_active_on(&self, cluster: &str) -> bool {
        self.replication.active_cluster == cluster
    }

    /// Whether a cluster handover is in progress. Outbound task execution
    /// checks this once on entry and defers rather than risking duplicate
    /// side-effects that may be replicated.
    pub fn is_handover_in_progress(&self) -> bool {
        self.replication.state == ReplicationState::Handover
    }

    /// Whether the change from `old` to `self` is material to consumers.
    /// Description- and owner-only mutations are not.
    pub fn is_material_change_from(&self, old: &Namespace) -> bool {
        let mut a = self.clone();
        let mut b = old.clone();
        for ns in [&mut a, &mut b] {
            ns.description = String::new();
            ns.owner = String::new();
            ns.notification_version = 0;
        }
        a != b
    }

    /// Decode from a persisted record.
    pub fn from_record(record: &NamespaceRecord) -> StoreResult<Self> {
        let mut namespace: Namespace = serde_json::from_value(record.data.clone())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        namespace.notification_version = record.notification_version;
        Ok(namespace)
    }

    /// Encode into a persisted record.
    pub fn to_record(&self) -> StoreResult<NamespaceRecord> {
        Ok(NamespaceRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            data: serde_json::to_value(self).map_err(|e| StoreError::Serialization(e.to_string()))?,
            data_encoding: "json".to_string(),
            notification_version: self.notification_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_membership() {
        let mut ns = Namespace::new("id-1", "orders", "cluster-a");
        ns.replication.clusters.push("cluster-b".into());
        assert!(ns.is_on_cluster("cluster-a"));
        assert!(ns.is_on_cluster("cluster-b"));
        assert!(!ns.is_on_cluster("cluster-c"));
        assert!(ns.is_active_on("cluster-a"));
        assert!(!ns.is_active_on("cluster-b"));
    }

    #[test]
    fn test_description_only_change_is_immaterial() {
        let ns = Namespace::new("id-1", "orders", "cluster-a");
        let mut changed = ns.clone();
        changed.description = "the orders namespace".into();
        changed.owner = "team-fulfillment".into();
        changed.notification_version = 7;
        assert!(!changed.is_material_change_from(&ns));

        changed.state = NamespaceState::Deprecated;
        assert!(changed.is_material_change_from(&ns));
    }

    #[test]
    fn test_record_round_trip() {
        let mut ns = Namespace::new("id-1", "orders", "cluster-a");
        ns.bad_binaries
            .insert("abc123".into(), "crashes on start".into());
        let mut record = ns.to_record().unwrap();
        record.notification_version = 42;

        let decoded = Namespace::from_record(&record).unwrap();
        assert_eq!(decoded.notification_version, 42);
        assert_eq!(decoded.bad_binaries, ns.bad_binaries);
    }
}

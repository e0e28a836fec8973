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

//! Core types and traits for Kairos
//!
//! This crate contains the fundamental types shared between the history,
//! matching, deployment and client crates to break circular dependencies:
//! the service error taxonomy, the durable task model, version histories,
//! clocks, dynamic configuration, and the capability traits core code
//! depends on (membership, metrics).

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod backoff;
pub mod clock;
pub mod dynamic_config;
pub mod error;
pub mod membership;
pub mod metrics;
pub mod take_list;
pub mod task;
pub mod version_history;
pub mod worker_versioning;

pub use clock::HybridClock;
pub use dynamic_config::{ConfigKey, ConfigValue, DynamicConfig};
pub use error::{ServiceError, ServiceResult};
pub use membership::{HostInfo, MembershipChangedEvent, ServiceResolver, SimulatedResolver};
pub use metrics::{MetricsHandler, NoopMetricsHandler};
pub use take_list::IndexedTakeList;
pub use task::{CategoryKind, FakeTask, Task, TaskCategory, TaskCategoryRegistry, TaskKey};
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
pub use worker_versioning::{
    DeploymentVersion, VersioningMode, VersioningOverride, WorkerDeploymentOptions,
};

/// Namespace id (ULID rendered as a string).
pub type NamespaceId = String;
/// Namespace name.
pub type NamespaceName = String;
/// User-chosen workflow id, unique per namespace among open workflows.
pub type WorkflowId = String;
/// Run id; uniquely identifies one execution forever.
pub type RunId = String;
/// Identifier of a specific worker binary version within a deployment.
pub type BuildId = String;

/// Sentinel build id for workers that opted out of versioning.
pub const UNVERSIONED_BUILD_ID: &str = "__unversioned__";

/// Fully-qualified key of one workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowKey {
    /// Owning namespace id.
    pub namespace_id: NamespaceId,
    /// Workflow id within the namespace.
    pub workflow_id: WorkflowId,
    /// Run id of this execution.
    pub run_id: RunId,
}

impl WorkflowKey {
    /// Convenience constructor.
    pub fn new(
        namespace_id: impl Into<NamespaceId>,
        workflow_id: impl Into<WorkflowId>,
        run_id: impl Into<RunId>,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
        }
    }
}

impl fmt::Display for WorkflowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.namespace_id, self.workflow_id, self.run_id
        )
    }
}

/// Hash a workflow id onto a shard in `[0, shard_count)`.
///
/// FNV-1a over the workflow id; every router and shard owner must agree on
/// this function, so it is defined once here.
pub fn shard_for_workflow(workflow_id: &str, shard_count: i32) -> i32 {
    debug_assert!(shard_count > 0);
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in workflow_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    (hash % shard_count as u64) as i32
}

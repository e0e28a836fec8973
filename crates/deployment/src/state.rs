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

//! Worker-deployment state types.
//!
//! The deployment controller exclusively owns these summaries; version
//! sub-workflows own their pollability/drainage tracking and signal summary
//! updates back, with the controller as the authoritative store.

use chrono::{DateTime, TimeZone, Utc};
use kairos_core::{ServiceError, ServiceResult};
use kairos_matching::TaskQueueType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Drainage state of a deployment version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DrainageStatus {
    /// Never drained, or reactivated.
    #[default]
    Unspecified,
    /// Pinned workflows are still open; new work routes elsewhere.
    Draining,
    /// No open pinned workflows remain.
    Drained,
}

/// Drainage status with bookkeeping times.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionDrainageInfo {
    /// Current status.
    pub status: DrainageStatus,
    /// When the status last changed.
    pub last_changed_time: Option<DateTime<Utc>>,
    /// When drainage was last re-checked against visibility.
    pub last_checked_time: Option<DateTime<Utc>>,
}

/// A task queue registered by a version's workers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegisteredTaskQueue {
    /// Queue name.
    pub name: String,
    /// Queue flavor.
    pub queue_type: SerializableQueueType,
}

/// Serializable mirror of [`TaskQueueType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SerializableQueueType {
    /// Workflow tasks.
    Workflow,
    /// Activity tasks.
    Activity,
}

impl From<TaskQueueType> for SerializableQueueType {
    fn from(value: TaskQueueType) -> Self {
        match value {
            TaskQueueType::Workflow => SerializableQueueType::Workflow,
            TaskQueueType::Activity => SerializableQueueType::Activity,
        }
    }
}

impl From<SerializableQueueType> for TaskQueueType {
    fn from(value: SerializableQueueType) -> Self {
        match value {
            SerializableQueueType::Workflow => TaskQueueType::Workflow,
            SerializableQueueType::Activity => TaskQueueType::Activity,
        }
    }
}

/// Summary of one version within a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSummary {
    /// Version identifier (build id within the deployment).
    pub version: String,
    /// First registration time; the scavenger deletes oldest-first.
    pub create_time: DateTime<Utc>,
    /// First time the version became current or ramping.
    pub first_activation_time: Option<DateTime<Utc>>,
    /// Last time the version stopped being current or ramping.
    pub last_deactivation_time: Option<DateTime<Utc>>,
    /// Drainage tracking.
    pub drainage: VersionDrainageInfo,
    /// Task queues the version's workers registered.
    pub registered_task_queues: BTreeSet<RegisteredTaskQueue>,
    /// Operator-attached metadata entries.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl VersionSummary {
    /// Fresh summary at registration time.
    pub fn new(version: impl Into<String>, create_time: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            create_time,
            first_activation_time: None,
            last_deactivation_time: None,
            drainage: VersionDrainageInfo::default(),
            registered_task_queues: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Routing intent of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Version receiving unrouted new work; `None` means unversioned.
    pub current_version: Option<String>,
    /// When the current version last changed.
    pub current_version_changed_time: Option<DateTime<Utc>>,
    /// Version receiving the ramp, if any.
    pub ramping_version: Option<String>,
    /// Percentage of new work routed to the ramping version.
    pub ramping_percentage: f32,
    /// When the ramping version or percentage last changed.
    pub ramping_version_changed_time: Option<DateTime<Utc>>,
}

/// Authoritative local state of one worker deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLocalState {
    /// Deployment name.
    pub deployment_name: String,
    /// Creation time.
    pub create_time: DateTime<Utc>,
    /// Routing intent.
    pub routing: RoutingConfig,
    /// Version summaries keyed by version id.
    pub versions: BTreeMap<String, VersionSummary>,
    /// Binary-encoded wall time of the last routing mutation.
    pub conflict_token: Vec<u8>,
    /// Identity that performed the last mutation.
    pub last_modifier_identity: String,
}

impl DeploymentLocalState {
    /// Fresh deployment state; routing starts unversioned.
    pub fn new(deployment_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            create_time: now,
            routing: RoutingConfig::default(),
            versions: BTreeMap::new(),
            conflict_token: encode_conflict_token(now),
            last_modifier_identity: String::new(),
        }
    }
}

/// Encode a routing-mutation wall time as a conflict token.
pub fn encode_conflict_token(time: DateTime<Utc>) -> Vec<u8> {
    time.timestamp_millis().to_be_bytes().to_vec()
}

/// Decode a conflict token back to its wall time.
pub fn decode_conflict_token(token: &[u8]) -> ServiceResult<DateTime<Utc>> {
    let bytes: [u8; 8] = token
        .try_into()
        .map_err(|_| ServiceError::InvalidArgument("malformed conflict token".to_string()))?;
    Utc.timestamp_millis_opt(i64::from_be_bytes(bytes))
        .single()
        .ok_or_else(|| ServiceError::InvalidArgument("conflict token out of range".to_string()))
}

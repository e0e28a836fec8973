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

//! Front-door request/response types.
//!
//! Plain structs; protobuf wire bindings are an external concern. Shapes
//! follow the RPC surface: workflow start/options/describe, matching
//! add/poll, and the worker-deployment mutations.

use kairos_core::{VersioningOverride, WorkerDeploymentOptions};
use kairos_deployment::DeploymentLocalState;
use kairos_history::WorkflowStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Start a new workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowExecutionRequest {
    /// Namespace name.
    pub namespace: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Workflow type name.
    pub workflow_type: String,
    /// Task queue to dispatch the first workflow task on.
    pub task_queue: String,
    /// Optional per-workflow routing directive.
    pub versioning_override: Option<VersioningOverride>,
    /// Idempotency key.
    pub request_id: String,
}

/// Response of a workflow start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowExecutionResponse {
    /// Run id of the started execution.
    pub run_id: String,
}

/// Update mutable per-workflow options behind a field mask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWorkflowExecutionOptionsRequest {
    /// Namespace name.
    pub namespace: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// New versioning override; `None` clears it. Only applied when the
    /// field mask names `versioning_override`.
    pub versioning_override: Option<VersioningOverride>,
    /// Paths of fields to apply; unknown paths are rejected.
    pub update_mask: Vec<String>,
}

/// Describe one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescribeWorkflowExecutionResponse {
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Effective versioning override, if any.
    pub versioning_override: Option<VersioningOverride>,
}

/// Add a workflow task to matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddWorkflowTaskRequest {
    /// Namespace name.
    pub namespace: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Task queue name.
    pub task_queue: String,
    /// Opaque task payload.
    pub payload: Value,
}

/// Long-poll for a workflow or activity task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollTaskQueueRequest {
    /// Namespace name.
    pub namespace: String,
    /// Task queue name.
    pub task_queue: String,
    /// Worker versioning identity.
    pub worker_deployment_options: WorkerDeploymentOptions,
}

/// A matched task returned to a poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolledTask {
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Opaque task payload.
    pub payload: Value,
}

/// Make a version current for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetWorkerDeploymentCurrentVersionRequest {
    /// Namespace name.
    pub namespace: String,
    /// Deployment name.
    pub deployment_name: String,
    /// Target version.
    pub target_version: String,
    /// Skip the missing-task-queue safety check.
    pub ignore_missing_task_queues: bool,
    /// Caller identity.
    pub identity: String,
    /// Conflict token from a previous response.
    pub conflict_token: Option<Vec<u8>>,
}

/// Set or clear the ramping version for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetWorkerDeploymentRampingVersionRequest {
    /// Namespace name.
    pub namespace: String,
    /// Deployment name.
    pub deployment_name: String,
    /// Target version; `None` clears the ramp.
    pub target_version: Option<String>,
    /// Ramp percentage in `[0, 100]`.
    pub percentage: f32,
    /// Skip the missing-task-queue safety check.
    pub ignore_missing_task_queues: bool,
    /// Caller identity.
    pub identity: String,
    /// Conflict token from a previous response.
    pub conflict_token: Option<Vec<u8>>,
}

/// Response of a deployment routing mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMutationReply {
    /// Version previously holding the role.
    pub previous_version: Option<String>,
    /// New conflict token to echo on the next mutation.
    pub conflict_token: Vec<u8>,
}

/// Delete one deployment version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteWorkerDeploymentVersionRequest {
    /// Namespace name.
    pub namespace: String,
    /// Deployment name.
    pub deployment_name: String,
    /// Version to delete.
    pub version: String,
    /// Delete even while the version is draining.
    pub skip_drainage: bool,
    /// Caller identity.
    pub identity: String,
}

/// Describe one deployment.
#[derive(Debug, Clone)]
pub struct DescribeWorkerDeploymentResponse {
    /// Authoritative controller state.
    pub state: DeploymentLocalState,
}

/// Upsert/remove metadata entries on a deployment version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateWorkerDeploymentVersionMetadataRequest {
    /// Namespace name.
    pub namespace: String,
    /// Deployment name.
    pub deployment_name: String,
    /// Version to update.
    pub version: String,
    /// Entries to insert or replace.
    pub upsert_entries: std::collections::BTreeMap<String, String>,
    /// Entry keys to remove.
    pub remove_entries: Vec<String>,
}

/// Query a workflow's observable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryWorkflowRequest {
    /// Namespace name.
    pub namespace: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Query type name.
    pub query_type: String,
}

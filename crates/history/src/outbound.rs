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

//! Outbound-queue task executors.
//!
//! Outbound tasks fire side-effects against external destinations on behalf
//! of a hosted sub-state machine. The task payload carries the machine
//! reference (`ref`) and the task creation time (`created_at`).
//!
//! ## Active vs standby
//! The active cluster executes the side-effect and records completion on the
//! machine. Standby clusters only re-check the world: a still-valid
//! reference means the active side has not executed yet (replication delay
//! or destination down), so the task retries until the discard delay
//! elapses. A stale reference on standby is swallowed; the active side
//! already executed.
//!
//! Namespace handover is checked once on task entry; executing during
//! handover risks duplicate side-effects that may be replicated.

use crate::chasm::{AccessMode, NodeRef};
use crate::engine::{HistoryEngine, MutationResult};
use crate::queues::TaskExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_core::{
    ConfigKey, DynamicConfig, ServiceError, ServiceResult, WorkflowKey,
};
use kairos_namespace::NamespaceRegistry;
use kairos_persistence::TaskRow;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Destination invocation capability; concrete transports are external.
#[async_trait]
pub trait OutboundDestination: Send + Sync {
    /// Fire the side-effect described by the machine's state.
    async fn invoke(&self, task: &TaskRow, machine_state: &Value) -> ServiceResult<()>;
}

/// Fields the engine's mutators embed in outbound task payloads.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutboundTaskInfo {
    /// Reference to the emitting machine.
    pub node_ref: NodeRef,
    /// Task creation time, used for the standby discard delay.
    pub created_at: DateTime<Utc>,
}

impl OutboundTaskInfo {
    /// Decode from a task payload.
    pub fn from_payload(payload: &Value) -> ServiceResult<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|e| ServiceError::internal(format!("malformed outbound task payload: {}", e)))
    }
}

fn workflow_key(task: &TaskRow) -> WorkflowKey {
    task.workflow_key.clone()
}

/// Executor for the active cluster.
pub struct OutboundActiveTaskExecutor {
    engine: Arc<HistoryEngine>,
    registry: Arc<NamespaceRegistry>,
    destination: Arc<dyn OutboundDestination>,
    config: DynamicConfig,
}

impl OutboundActiveTaskExecutor {
    /// Active executor over a shard engine.
    pub fn new(
        engine: Arc<HistoryEngine>,
        registry: Arc<NamespaceRegistry>,
        destination: Arc<dyn OutboundDestination>,
        config: DynamicConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            destination,
            config,
        }
    }

    async fn process(&self, task: &TaskRow) -> ServiceResult<()> {
        let namespace = self
            .registry
            .get_by_id(&task.workflow_key.namespace_id)
            .await?;
        if namespace.is_handover_in_progress() {
            return Err(ServiceError::NamespaceHandover(namespace.name.clone()));
        }

        let info = OutboundTaskInfo::from_payload(&task.payload)?;
        let key = workflow_key(task);

        // Validate the reference against current state before firing.
        let mut state = self.engine.read(&key).await?;
        let machine_state =
            match state
                .chasm
                .access(&info.node_ref, AccessMode::Read, |node| Ok(node.data.clone()))
            {
                Ok(data) => data,
                Err(ServiceError::StaleReference { .. }) => {
                    // The machine moved on; this task's side-effect was
                    // superseded.
                    debug!(workflow_key = %key, "outbound task superseded, dropping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

        self.destination.invoke(task, &machine_state).await?;

        // Record completion on the machine so standby replicas observe it.
        let node_ref = info.node_ref.clone();
        self.engine
            .execute(&key.clone(), move |state| {
                let mut state = state
                    .ok_or_else(|| ServiceError::NotFound(format!("workflow {}", key)))?
                    .clone();
                state
                    .chasm
                    .access(&node_ref, AccessMode::Write, |node| {
                        node.data["executed"] = Value::Bool(true);
                        Ok(())
                    })?;
                Ok(MutationResult {
                    state,
                    tasks: vec![],
                })
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for OutboundActiveTaskExecutor {
    async fn execute(&self, task: &TaskRow) -> ServiceResult<()> {
        // Category-level timeout, checked once on entry so long-running work
        // cannot commit results during a namespace handover.
        let timeout = self.config.duration(ConfigKey::OutboundTaskTimeout);
        match tokio::time::timeout(timeout, self.process(task)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::DeadlineExceeded),
        }
    }
}

/// Executor for standby clusters.
pub struct OutboundStandbyTaskExecutor {
    engine: Arc<HistoryEngine>,
    registry: Arc<NamespaceRegistry>,
    config: DynamicConfig,
    cluster_name: String,
}

impl OutboundStandbyTaskExecutor {
    /// Standby executor for the named local cluster.
    pub fn new(
        engine: Arc<HistoryEngine>,
        registry: Arc<NamespaceRegistry>,
        config: DynamicConfig,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            registry,
            config,
            cluster_name: cluster_name.into(),
        }
    }

    async fn process(&self, task: &TaskRow) -> ServiceResult<()> {
        let namespace = self
            .registry
            .get_by_id(&task.workflow_key.namespace_id)
            .await?;
        if !namespace.is_on_cluster(&self.cluster_name) {
            // Namespace is not replicated to this cluster; ignore.
            return Ok(());
        }

        let info = OutboundTaskInfo::from_payload(&task.payload)?;
        let key = workflow_key(task);

        let mut state = self.engine.read(&key).await?;
        match state
            .chasm
            .access(&info.node_ref, AccessMode::Read, |_| Ok(()))
        {
            Err(ServiceError::StaleReference { .. }) => {
                // The active side already executed; nothing to do here.
                return Ok(());
            }
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        // The reference is still valid: likely replication delay or the
        // destination is down on the active side. Retry until the discard
        // delay elapses.
        let discard_delay = self
            .config
            .duration(ConfigKey::OutboundStandbyTaskMissingEventsDiscardDelay);
        let discard_at = info.created_at
            + chrono::Duration::from_std(discard_delay)
                .map_err(|e| ServiceError::internal(e.to_string()))?;
        if Utc::now() > discard_at {
            warn!(
                workflow_key = %key,
                task_id = task.key.task_id,
                "discarding standby outbound task pending past the discard delay"
            );
            return Ok(());
        }
        Err(ServiceError::Unavailable(
            "standby outbound task pending active execution".to_string(),
        ))
    }
}

#[async_trait]
impl TaskExecutor for OutboundStandbyTaskExecutor {
    async fn execute(&self, task: &TaskRow) -> ServiceResult<()> {
        let timeout = self.config.duration(ConfigKey::OutboundTaskTimeout);
        match tokio::time::timeout(timeout, self.process(task)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::DeadlineExceeded),
        }
    }
}

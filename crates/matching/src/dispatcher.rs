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

//! Matching engine: task queues and versioned dispatch.
//!
//! ## Routing
//! An added task resolves to a build id in this order: a pinned per-workflow
//! override wins outright; otherwise the queue's deployment routing config
//! (current/ramping with a deterministic per-workflow ramp draw) decides;
//! otherwise the queue's assignment rules run in order, first match wins.
//! The resolved build id is then redirected along the active redirect chain
//! to its terminal compatible build. Sticky queues fall back to their normal
//! queue when the sticky poller has aged out.
//!
//! ## Poll protocol
//! Polls are long-polls: a poller with no task parks until an add hands a
//! task directly to it or the poll deadline elapses. Every poll records the
//! worker in the queue's poller history.

use crate::poller_history::PollerHistory;
use crate::version_rules::{evaluate_assignment_rules, find_terminal_build_id, VersioningData};
use kairos_core::{
    BuildId, ConfigKey, DynamicConfig, ServiceError, ServiceResult, VersioningMode,
    VersioningOverride, WorkerDeploymentOptions, WorkflowKey, UNVERSIONED_BUILD_ID,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// Task queue flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskQueueType {
    /// Workflow tasks.
    Workflow,
    /// Activity tasks.
    Activity,
}

/// Identity of one task queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskQueueKey {
    /// Owning namespace.
    pub namespace_id: String,
    /// Queue name.
    pub name: String,
    /// Queue flavor.
    pub queue_type: TaskQueueType,
}

impl TaskQueueKey {
    /// Convenience constructor.
    pub fn new(
        namespace_id: impl Into<String>,
        name: impl Into<String>,
        queue_type: TaskQueueType,
    ) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
            queue_type,
        }
    }
}

/// Routing intent pushed down from the worker-deployment controller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentRoutingSnapshot {
    /// Deployment the queue serves.
    pub deployment_name: String,
    /// Version receiving unrouted new work; `None` means unversioned.
    pub current_version: Option<BuildId>,
    /// Version receiving the ramp percentage, if any.
    pub ramping_version: Option<BuildId>,
    /// Percentage of new work routed to the ramping version.
    pub ramping_percentage: f32,
}

/// A task offered to the matching plane.
#[derive(Debug, Clone)]
pub struct MatchingTask {
    /// Workflow the task belongs to.
    pub workflow_key: WorkflowKey,
    /// Per-workflow routing directive, if any.
    pub versioning_override: Option<VersioningOverride>,
    /// Build the workflow last ran on, for redirect-rule routing.
    pub source_build_id: Option<BuildId>,
    /// Opaque task payload.
    pub payload: Value,
}

#[derive(Default)]
struct BuildQueue {
    tasks: VecDeque<MatchingTask>,
    waiters: VecDeque<oneshot::Sender<MatchingTask>>,
    last_add: Option<chrono::DateTime<chrono::Utc>>,
}

struct QueueState {
    by_build: HashMap<BuildId, BuildQueue>,
    pollers: Arc<PollerHistory>,
    versioning: VersioningData,
    routing: Option<DeploymentRoutingSnapshot>,
}

impl QueueState {
    fn new(poller_ttl: Duration) -> Self {
        Self {
            by_build: HashMap::new(),
            pollers: Arc::new(PollerHistory::new(poller_ttl)),
            versioning: VersioningData::default(),
            routing: None,
        }
    }
}

/// Backlog facts for one `(queue, build)` stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogInfo {
    /// Tasks currently queued.
    pub backlog_count: usize,
    /// Whether any add landed inside the poller TTL window.
    pub recently_added: bool,
}

/// The matching engine for one host.
pub struct MatchingEngine {
    config: DynamicConfig,
    queues: Mutex<HashMap<TaskQueueKey, QueueState>>,
}

impl MatchingEngine {
    /// Engine with the given dynamic config.
    pub fn new(config: DynamicConfig) -> Self {
        Self {
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn poller_ttl(&self) -> Duration {
        self.config.duration(ConfigKey::PollerHistoryTtl)
    }

    /// Replace a queue's versioning-data document.
    pub async fn update_versioning_data(&self, queue: TaskQueueKey, data: VersioningData) {
        let ttl = self.poller_ttl();
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue)
            .or_insert_with(|| QueueState::new(ttl))
            .versioning = data;
    }

    /// Current versioning-data document for a queue.
    pub async fn versioning_data(&self, queue: &TaskQueueKey) -> VersioningData {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.versioning.clone())
            .unwrap_or_default()
    }

    /// Replace a queue's deployment routing snapshot.
    pub async fn update_deployment_routing(
        &self,
        queue: TaskQueueKey,
        routing: DeploymentRoutingSnapshot,
    ) {
        let ttl = self.poller_ttl();
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue)
            .or_insert_with(|| QueueState::new(ttl))
            .routing = Some(routing);
    }

    /// Deterministic ramp draw in `[0, 100)` for a workflow id, so a given
    /// workflow always lands on the same side of a ramp.
    fn ramp_draw(workflow_id: &str) -> f32 {
        (kairos_core::shard_for_workflow(workflow_id, 10_000) as f32) / 100.0
    }

    fn resolve_build(state: &QueueState, task: &MatchingTask) -> BuildId {
        let assigned = match &task.versioning_override {
            Some(VersioningOverride::Pinned(version)) => {
                return version.build_id.clone();
            }
            Some(VersioningOverride::AutoUpgrade) | None => {
                if let Some(routing) = &state.routing {
                    let draw = Self::ramp_draw(&task.workflow_key.workflow_id);
                    let ramped = routing
                        .ramping_version
                        .as_ref()
                        .filter(|_| draw < routing.ramping_percentage);
                    match ramped.or(routing.current_version.as_ref()) {
                        Some(build) => Some(build.clone()),
                        None => None,
                    }
                } else {
                    None
                }
            }
        };

        let assigned = assigned.or_else(|| {
            // Existing workflows keep their source build through redirects;
            // fresh work consults the assignment rules.
            match &task.source_build_id {
                Some(source) => Some(source.clone()),
                None => evaluate_assignment_rules(
                    &state.versioning,
                    Self::ramp_draw(&task.workflow_key.workflow_id),
                ),
            }
        });

        match assigned {
            Some(build) => {
                let active: Vec<_> = state.versioning.active_redirect_rules().cloned().collect();
                let terminal = find_terminal_build_id(&build, &active);
                if terminal.is_empty() {
                    build
                } else {
                    terminal
                }
            }
            None => UNVERSIONED_BUILD_ID.to_string(),
        }
    }

    /// Add a task to a queue, routing it to a build stream. Returns the
    /// build id the task was routed to.
    pub async fn add_task(
        &self,
        queue: TaskQueueKey,
        mut task: MatchingTask,
    ) -> ServiceResult<BuildId> {
        let ttl = self.poller_ttl();
        let mut queues = self.queues.lock().await;
        let state = queues
            .entry(queue.clone())
            .or_insert_with(|| QueueState::new(ttl));
        let build = Self::resolve_build(state, &task);

        let build_queue = state.by_build.entry(build.clone()).or_default();
        build_queue.last_add = Some(chrono::Utc::now());

        // Hand off directly to a parked poller when one is waiting.
        while let Some(waiter) = build_queue.waiters.pop_front() {
            match waiter.send(task) {
                Ok(()) => {
                    debug!(queue = %queue.name, build = %build, "task matched to parked poller");
                    return Ok(build);
                }
                Err(returned) => task = returned,
            }
        }
        build_queue.tasks.push_back(task);
        Ok(build)
    }

    /// Long-poll for a task as the given worker. Records the poller, then
    /// returns an immediately available task or parks until `timeout`.
    pub async fn poll(
        &self,
        queue: TaskQueueKey,
        worker: &WorkerDeploymentOptions,
        timeout: Duration,
    ) -> ServiceResult<Option<MatchingTask>> {
        let build = match worker.versioning_mode {
            VersioningMode::Unversioned => UNVERSIONED_BUILD_ID.to_string(),
            VersioningMode::Versioned => worker.build_id.clone(),
        };

        let receiver = {
            let ttl = self.poller_ttl();
            let mut queues = self.queues.lock().await;
            let state = queues
                .entry(queue.clone())
                .or_insert_with(|| QueueState::new(ttl));
            state
                .pollers
                .record(&format!("{}@{}", worker.deployment_name, build), &build);

            let build_queue = state.by_build.entry(build.clone()).or_default();
            if let Some(task) = build_queue.tasks.pop_front() {
                return Ok(Some(task));
            }
            let (tx, rx) = oneshot::channel();
            build_queue.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(task)) => Ok(Some(task)),
            Ok(Err(_)) => Err(ServiceError::Unavailable(
                "matching queue shut down".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }

    /// Whether any poller for `build_id` polled the queue inside the TTL.
    pub async fn has_recent_poller(&self, queue: &TaskQueueKey, build_id: &str) -> bool {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.pollers.has_recent_poller(build_id))
            .unwrap_or(false)
    }

    /// Backlog facts for a `(queue, build)` stream.
    pub async fn backlog_info(&self, queue: &TaskQueueKey, build_id: &str) -> BacklogInfo {
        let ttl = chrono::Duration::from_std(self.poller_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let queues = self.queues.lock().await;
        let Some(build_queue) = queues.get(queue).and_then(|s| s.by_build.get(build_id)) else {
            return BacklogInfo {
                backlog_count: 0,
                recently_added: false,
            };
        };
        BacklogInfo {
            backlog_count: build_queue.tasks.len(),
            recently_added: build_queue
                .last_add
                .map(|at| at >= chrono::Utc::now() - ttl)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_core::DeploymentVersion;
    use serde_json::json;

    fn engine() -> MatchingEngine {
        MatchingEngine::new(DynamicConfig::new())
    }

    fn queue() -> TaskQueueKey {
        TaskQueueKey::new("ns", "orders", TaskQueueType::Workflow)
    }

    fn task(workflow_id: &str) -> MatchingTask {
        MatchingTask {
            workflow_key: WorkflowKey::new("ns", workflow_id, "run-1"),
            versioning_override: None,
            source_build_id: None,
            payload: json!({}),
        }
    }

    fn worker(build: &str) -> WorkerDeploymentOptions {
        WorkerDeploymentOptions {
            deployment_name: "checkout".into(),
            build_id: build.into(),
            versioning_mode: VersioningMode::Versioned,
        }
    }

    #[tokio::test]
    async fn test_unrouted_task_is_unversioned() {
        let engine = engine();
        let build = engine.add_task(queue(), task("wf-1")).await.unwrap();
        assert_eq!(build, UNVERSIONED_BUILD_ID);
    }

    #[tokio::test]
    async fn test_pinned_override_wins_over_routing() {
        let engine = engine();
        engine
            .update_deployment_routing(
                queue(),
                DeploymentRoutingSnapshot {
                    deployment_name: "checkout".into(),
                    current_version: Some("v2".into()),
                    ramping_version: None,
                    ramping_percentage: 0.0,
                },
            )
            .await;

        let mut pinned = task("wf-1");
        pinned.versioning_override = Some(VersioningOverride::Pinned(DeploymentVersion::new(
            "checkout", "v1",
        )));
        let build = engine.add_task(queue(), pinned).await.unwrap();
        assert_eq!(build, "v1");
    }

    #[tokio::test]
    async fn test_routing_current_and_ramping_split() {
        let engine = engine();
        engine
            .update_deployment_routing(
                queue(),
                DeploymentRoutingSnapshot {
                    deployment_name: "checkout".into(),
                    current_version: Some("v1".into()),
                    ramping_version: Some("v2".into()),
                    ramping_percentage: 100.0,
                },
            )
            .await;
        // Full ramp: everything lands on the ramping version.
        let build = engine.add_task(queue(), task("wf-1")).await.unwrap();
        assert_eq!(build, "v2");

        engine
            .update_deployment_routing(
                queue(),
                DeploymentRoutingSnapshot {
                    deployment_name: "checkout".into(),
                    current_version: Some("v1".into()),
                    ramping_version: Some("v2".into()),
                    ramping_percentage: 0.0,
                },
            )
            .await;
        let build = engine.add_task(queue(), task("wf-1")).await.unwrap();
        assert_eq!(build, "v1");
    }

    #[tokio::test]
    async fn test_assignment_rules_route_fresh_work() {
        let engine = engine();
        let data = crate::version_rules::insert_assignment_rule(
            kairos_core::HybridClock::zero(1),
            &VersioningData::default(),
            "v3".to_string(),
            None,
            0,
            10,
        )
        .unwrap();
        engine.update_versioning_data(queue(), data).await;

        let build = engine.add_task(queue(), task("wf-1")).await.unwrap();
        assert_eq!(build, "v3");
    }

    #[tokio::test]
    async fn test_redirect_rules_apply_to_source_build() {
        let engine = engine();
        let data = crate::version_rules::add_redirect_rule(
            kairos_core::HybridClock::zero(1),
            &VersioningData::default(),
            "v1".to_string(),
            "v2".to_string(),
            10,
            10,
        )
        .unwrap();
        let data = crate::version_rules::add_redirect_rule(
            kairos_core::HybridClock::zero(1),
            &data,
            "v2".to_string(),
            "v3".to_string(),
            10,
            10,
        )
        .unwrap();
        engine.update_versioning_data(queue(), data).await;

        let mut existing = task("wf-1");
        existing.source_build_id = Some("v1".into());
        let build = engine.add_task(queue(), existing).await.unwrap();
        assert_eq!(build, "v3");
    }

    #[tokio::test]
    async fn test_poll_dequeues_in_order() {
        let engine = engine();
        engine
            .update_deployment_routing(
                queue(),
                DeploymentRoutingSnapshot {
                    deployment_name: "checkout".into(),
                    current_version: Some("v1".into()),
                    ramping_version: None,
                    ramping_percentage: 0.0,
                },
            )
            .await;
        engine.add_task(queue(), task("wf-1")).await.unwrap();
        engine.add_task(queue(), task("wf-2")).await.unwrap();

        let first = engine
            .poll(queue(), &worker("v1"), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.workflow_key.workflow_id, "wf-1");
        let second = engine
            .poll(queue(), &worker("v1"), Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.workflow_key.workflow_id, "wf-2");
    }

    #[tokio::test]
    async fn test_parked_poller_receives_added_task() {
        let engine = Arc::new(engine());
        engine
            .update_deployment_routing(
                queue(),
                DeploymentRoutingSnapshot {
                    deployment_name: "checkout".into(),
                    current_version: Some("v1".into()),
                    ramping_version: None,
                    ramping_percentage: 0.0,
                },
            )
            .await;

        let poller = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .poll(queue(), &worker("v1"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.add_task(queue(), task("wf-1")).await.unwrap();

        let polled = poller.await.unwrap().unwrap().unwrap();
        assert_eq!(polled.workflow_key.workflow_id, "wf-1");
    }

    #[tokio::test]
    async fn test_poll_timeout_returns_none() {
        let engine = engine();
        let polled = engine
            .poll(queue(), &worker("v1"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(polled.is_none());
    }

    #[tokio::test]
    async fn test_poller_history_and_backlog_facts() {
        let engine = engine();
        assert!(!engine.has_recent_poller(&queue(), "v1").await);

        engine
            .poll(queue(), &worker("v1"), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(engine.has_recent_poller(&queue(), "v1").await);

        let info = engine.backlog_info(&queue(), UNVERSIONED_BUILD_ID).await;
        assert_eq!(info.backlog_count, 0);
        assert!(!info.recently_added);

        engine.add_task(queue(), task("wf-1")).await.unwrap();
        let info = engine.backlog_info(&queue(), UNVERSIONED_BUILD_ID).await;
        assert_eq!(info.backlog_count, 1);
        assert!(info.recently_added);
    }
}

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

//! Front-door service facade.
//!
//! Performs admission validation and error mapping, then delegates to the
//! history, matching, deployment and namespace components. Workflow writes
//! land on the shard owning the workflow id; deployment mutations are pushed
//! to the per-deployment controller and their routing snapshots propagated
//! to the matching queues the deployment serves.

use crate::types::*;
use kairos_core::{
    shard_for_workflow, ConfigKey, DynamicConfig, ServiceError, ServiceResult, TaskCategory,
    TaskCategoryRegistry, VersioningMode, WorkflowKey,
};
use kairos_deployment::{
    DeploymentController, RegisteredTaskQueue, SetCurrentArgs, SetRampingArgs, TaskQueueFacts,
    VisibilityCounter,
};
use kairos_history::{GeneratedTask, HistoryEngine, MutationResult, ShardContext,
    WorkflowMutableState};
use kairos_matching::{
    DeploymentRoutingSnapshot, MatchingEngine, MatchingTask, TaskQueueKey, TaskQueueType,
};
use kairos_namespace::NamespaceRegistry;
use kairos_persistence::ExecutionStore;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Adapts the matching engine to the deployment controller's fact queries.
struct MatchingFacts {
    matching: Arc<MatchingEngine>,
    namespace_id: String,
}

#[async_trait::async_trait]
impl TaskQueueFacts for MatchingFacts {
    async fn has_backlog_or_adds(&self, queue: &RegisteredTaskQueue, build: &str) -> bool {
        let key = TaskQueueKey::new(
            self.namespace_id.clone(),
            queue.name.clone(),
            queue.queue_type.into(),
        );
        let info = self.matching.backlog_info(&key, build).await;
        info.backlog_count > 0 || info.recently_added
    }

    async fn has_recent_poller(&self, queue: &RegisteredTaskQueue, build: &str) -> bool {
        let key = TaskQueueKey::new(
            self.namespace_id.clone(),
            queue.name.clone(),
            queue.queue_type.into(),
        );
        self.matching.has_recent_poller(&key, build).await
    }
}

/// Front-door service for one host.
pub struct FrontendService {
    config: DynamicConfig,
    shard_count: i32,
    host_identity: String,
    store: Arc<dyn ExecutionStore>,
    engines: Mutex<HashMap<i32, Arc<HistoryEngine>>>,
    matching: Arc<MatchingEngine>,
    deployments: Mutex<HashMap<String, Arc<DeploymentController>>>,
    registry: Arc<NamespaceRegistry>,
    visibility: Arc<dyn VisibilityCounter>,
}

impl FrontendService {
    /// Facade over the given components.
    pub fn new(
        config: DynamicConfig,
        shard_count: i32,
        host_identity: impl Into<String>,
        store: Arc<dyn ExecutionStore>,
        matching: Arc<MatchingEngine>,
        registry: Arc<NamespaceRegistry>,
        visibility: Arc<dyn VisibilityCounter>,
    ) -> Self {
        Self {
            config,
            shard_count,
            host_identity: host_identity.into(),
            store,
            engines: Mutex::new(HashMap::new()),
            matching,
            deployments: Mutex::new(HashMap::new()),
            registry,
            visibility,
        }
    }

    /// Map an outgoing error to its wire status, masking internal details
    /// when configured.
    pub fn into_status(&self, err: ServiceError) -> tonic::Status {
        let masked = match err {
            ServiceError::Internal(_)
                if self.config.bool(ConfigKey::FrontendMaskInternalErrorDetails) =>
            {
                ServiceError::Internal("internal error".to_string())
            }
            other => other,
        };
        masked.into()
    }

    async fn engine_for_shard(&self, shard_id: i32) -> ServiceResult<Arc<HistoryEngine>> {
        let mut engines = self.engines.lock().await;
        if let Some(engine) = engines.get(&shard_id) {
            return Ok(engine.clone());
        }
        let shard = ShardContext::acquire(
            self.store.clone(),
            shard_id,
            self.host_identity.clone(),
            TaskCategoryRegistry::new_default(),
        )
        .await?;
        let engine = Arc::new(HistoryEngine::new(shard));
        engines.insert(shard_id, engine.clone());
        Ok(engine)
    }

    async fn controller(
        &self,
        namespace_id: &str,
        deployment_name: &str,
    ) -> Arc<DeploymentController> {
        let mut deployments = self.deployments.lock().await;
        deployments
            .entry(format!("{}/{}", namespace_id, deployment_name))
            .or_insert_with(|| {
                Arc::new(DeploymentController::new(
                    deployment_name,
                    self.config.clone(),
                    Arc::new(MatchingFacts {
                        matching: self.matching.clone(),
                        namespace_id: namespace_id.to_string(),
                    }),
                    self.visibility.clone(),
                ))
            })
            .clone()
    }

    /// Push a deployment's routing snapshot to every queue it serves.
    async fn propagate_routing(&self, namespace_id: &str, controller: &DeploymentController) {
        let state = controller.describe().await;
        let snapshot = DeploymentRoutingSnapshot {
            deployment_name: state.deployment_name.clone(),
            current_version: state.routing.current_version.clone(),
            ramping_version: state.routing.ramping_version.clone(),
            ramping_percentage: state.routing.ramping_percentage,
        };
        let mut queues: Vec<TaskQueueKey> = Vec::new();
        for summary in state.versions.values() {
            for queue in &summary.registered_task_queues {
                let key = TaskQueueKey::new(
                    namespace_id.to_string(),
                    queue.name.clone(),
                    queue.queue_type.into(),
                );
                if !queues.contains(&key) {
                    queues.push(key);
                }
            }
        }
        for queue in queues {
            self.matching
                .update_deployment_routing(queue, snapshot.clone())
                .await;
        }
    }

    // ----- workflow surface ----------------------------------------------

    /// Start a new workflow execution and offer its first workflow task to
    /// matching.
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowExecutionRequest,
    ) -> ServiceResult<StartWorkflowExecutionResponse> {
        if request.workflow_id.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "workflow id must not be empty".to_string(),
            ));
        }
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let run_id = ulid::Ulid::new().to_string();
        let workflow_key = WorkflowKey::new(namespace.id.clone(), request.workflow_id.clone(), run_id.clone());

        let shard_id = shard_for_workflow(&request.workflow_id, self.shard_count);
        let engine = self.engine_for_shard(shard_id).await?;

        let override_for_state = request.versioning_override.clone();
        let key_for_mutator = workflow_key.clone();
        let workflow_type = request.workflow_type.clone();
        engine
            .execute(&workflow_key, move |existing| {
                if existing.is_some() {
                    return Err(ServiceError::WorkflowConflict(format!(
                        "run {} already exists",
                        key_for_mutator
                    )));
                }
                let mut state = WorkflowMutableState::new(
                    key_for_mutator.clone(),
                    key_for_mutator.run_id.as_bytes().to_vec(),
                );
                state.versioning_override = override_for_state;
                Ok(MutationResult {
                    state,
                    tasks: vec![GeneratedTask {
                        category: TaskCategory::Transfer,
                        fire_time: None,
                        payload: json!({
                            "kind": "workflow_task",
                            "workflow_type": workflow_type,
                        }),
                    }],
                })
            })
            .await?;

        self.matching
            .add_task(
                TaskQueueKey::new(
                    namespace.id.clone(),
                    request.task_queue.clone(),
                    TaskQueueType::Workflow,
                ),
                MatchingTask {
                    workflow_key,
                    versioning_override: request.versioning_override,
                    source_build_id: None,
                    payload: json!({"workflow_type": request.workflow_type}),
                },
            )
            .await?;

        info!(workflow_id = %request.workflow_id, run_id = %run_id, "started workflow execution");
        Ok(StartWorkflowExecutionResponse { run_id })
    }

    /// Apply a field-masked options update to a workflow.
    pub async fn update_workflow_execution_options(
        &self,
        request: UpdateWorkflowExecutionOptionsRequest,
    ) -> ServiceResult<DescribeWorkflowExecutionResponse> {
        if request.update_mask.is_empty() {
            return Err(ServiceError::InvalidArgument(
                "update mask must not be empty".to_string(),
            ));
        }
        for path in &request.update_mask {
            if path != "versioning_override" {
                return Err(ServiceError::InvalidArgument(format!(
                    "unknown update mask path {}",
                    path
                )));
            }
        }

        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let workflow_key = WorkflowKey::new(
            namespace.id.clone(),
            request.workflow_id.clone(),
            request.run_id.clone(),
        );
        let shard_id = shard_for_workflow(&request.workflow_id, self.shard_count);
        let engine = self.engine_for_shard(shard_id).await?;

        let override_to_apply = request.versioning_override.clone();
        let key_for_error = workflow_key.clone();
        engine
            .execute(&workflow_key, move |existing| {
                let mut state = existing
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("workflow {}", key_for_error))
                    })?
                    .clone();
                state.versioning_override = override_to_apply;
                Ok(MutationResult {
                    state,
                    tasks: vec![],
                })
            })
            .await?;

        self.describe_workflow_execution(
            &request.namespace,
            &request.workflow_id,
            &request.run_id,
        )
        .await
    }

    /// Describe one workflow execution.
    pub async fn describe_workflow_execution(
        &self,
        namespace: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> ServiceResult<DescribeWorkflowExecutionResponse> {
        let namespace = self.registry.get_by_name(namespace, false).await?;
        let workflow_key = WorkflowKey::new(namespace.id.clone(), workflow_id, run_id);
        let shard_id = shard_for_workflow(workflow_id, self.shard_count);
        let engine = self.engine_for_shard(shard_id).await?;
        let state = engine.read(&workflow_key).await?;
        Ok(DescribeWorkflowExecutionResponse {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            status: state.status,
            versioning_override: state.versioning_override,
        })
    }

    // ----- matching surface ----------------------------------------------

    /// Add a workflow task to matching.
    pub async fn add_workflow_task(&self, request: AddWorkflowTaskRequest) -> ServiceResult<()> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        self.matching
            .add_task(
                TaskQueueKey::new(
                    namespace.id.clone(),
                    request.task_queue,
                    TaskQueueType::Workflow,
                ),
                MatchingTask {
                    workflow_key: WorkflowKey::new(
                        namespace.id.clone(),
                        request.workflow_id,
                        request.run_id,
                    ),
                    versioning_override: None,
                    source_build_id: None,
                    payload: request.payload,
                },
            )
            .await?;
        Ok(())
    }

    /// Long-poll for a workflow task. A versioned poller also registers its
    /// `(version, task queue)` pair with the deployment controller.
    pub async fn poll_workflow_task_queue(
        &self,
        request: PollTaskQueueRequest,
        timeout: Duration,
    ) -> ServiceResult<Option<PolledTask>> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let worker = &request.worker_deployment_options;

        if worker.versioning_mode == VersioningMode::Versioned {
            let controller = self
                .controller(&namespace.id, &worker.deployment_name)
                .await;
            controller
                .register_worker(
                    &worker.build_id,
                    RegisteredTaskQueue {
                        name: request.task_queue.clone(),
                        queue_type: kairos_deployment::SerializableQueueType::Workflow,
                    },
                    &worker.build_id,
                )
                .await?;
        }

        let task = self
            .matching
            .poll(
                TaskQueueKey::new(
                    namespace.id.clone(),
                    request.task_queue,
                    TaskQueueType::Workflow,
                ),
                worker,
                timeout,
            )
            .await?;
        Ok(task.map(|task| PolledTask {
            workflow_id: task.workflow_key.workflow_id,
            run_id: task.workflow_key.run_id,
            payload: task.payload,
        }))
    }

    /// Add an activity task to matching.
    pub async fn add_activity_task(&self, request: AddWorkflowTaskRequest) -> ServiceResult<()> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        self.matching
            .add_task(
                TaskQueueKey::new(
                    namespace.id.clone(),
                    request.task_queue,
                    TaskQueueType::Activity,
                ),
                MatchingTask {
                    workflow_key: WorkflowKey::new(
                        namespace.id.clone(),
                        request.workflow_id,
                        request.run_id,
                    ),
                    versioning_override: None,
                    source_build_id: None,
                    payload: request.payload,
                },
            )
            .await?;
        Ok(())
    }

    /// Long-poll for an activity task.
    pub async fn poll_activity_task_queue(
        &self,
        request: PollTaskQueueRequest,
        timeout: Duration,
    ) -> ServiceResult<Option<PolledTask>> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let worker = &request.worker_deployment_options;
        if worker.versioning_mode == VersioningMode::Versioned {
            let controller = self
                .controller(&namespace.id, &worker.deployment_name)
                .await;
            controller
                .register_worker(
                    &worker.build_id,
                    RegisteredTaskQueue {
                        name: request.task_queue.clone(),
                        queue_type: kairos_deployment::SerializableQueueType::Activity,
                    },
                    &worker.build_id,
                )
                .await?;
        }
        let task = self
            .matching
            .poll(
                TaskQueueKey::new(
                    namespace.id.clone(),
                    request.task_queue,
                    TaskQueueType::Activity,
                ),
                worker,
                timeout,
            )
            .await?;
        Ok(task.map(|task| PolledTask {
            workflow_id: task.workflow_key.workflow_id,
            run_id: task.workflow_key.run_id,
            payload: task.payload,
        }))
    }

    /// Answer a read-only query against a workflow's observable state.
    pub async fn query_workflow(
        &self,
        request: QueryWorkflowRequest,
    ) -> ServiceResult<serde_json::Value> {
        let described = self
            .describe_workflow_execution(&request.namespace, &request.workflow_id, &request.run_id)
            .await?;
        match request.query_type.as_str() {
            "__status" => Ok(json!({"status": format!("{:?}", described.status)})),
            "__versioning_info" => Ok(serde_json::to_value(&described.versioning_override)
                .map_err(|e| ServiceError::internal(e.to_string()))?),
            other => Err(ServiceError::InvalidArgument(format!(
                "unknown query type {}",
                other
            ))),
        }
    }

    // ----- deployment surface --------------------------------------------

    /// Describe one worker deployment.
    pub async fn describe_worker_deployment(
        &self,
        namespace: &str,
        deployment_name: &str,
    ) -> ServiceResult<DescribeWorkerDeploymentResponse> {
        let namespace = self.registry.get_by_name(namespace, false).await?;
        let controller = self.controller(&namespace.id, deployment_name).await;
        Ok(DescribeWorkerDeploymentResponse {
            state: controller.describe().await,
        })
    }

    /// List deployments known to this host for a namespace.
    pub async fn list_worker_deployments(&self, namespace: &str) -> ServiceResult<Vec<String>> {
        let namespace = self.registry.get_by_name(namespace, false).await?;
        let prefix = format!("{}/", namespace.id);
        let deployments = self.deployments.lock().await;
        Ok(deployments
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Make a version current and propagate routing to matching.
    pub async fn set_worker_deployment_current_version(
        &self,
        request: SetWorkerDeploymentCurrentVersionRequest,
    ) -> ServiceResult<RoutingMutationReply> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let controller = self
            .controller(&namespace.id, &request.deployment_name)
            .await;
        let response = controller
            .set_current(SetCurrentArgs {
                version: request.target_version,
                ignore_missing_task_queues: request.ignore_missing_task_queues,
                identity: request.identity,
                conflict_token: request.conflict_token,
            })
            .await?;
        self.propagate_routing(&namespace.id, &controller).await;
        Ok(RoutingMutationReply {
            previous_version: response.previous_version,
            conflict_token: response.conflict_token,
        })
    }

    /// Set or clear the ramping version and propagate routing to matching.
    pub async fn set_worker_deployment_ramping_version(
        &self,
        request: SetWorkerDeploymentRampingVersionRequest,
    ) -> ServiceResult<RoutingMutationReply> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let controller = self
            .controller(&namespace.id, &request.deployment_name)
            .await;
        let response = controller
            .set_ramping(SetRampingArgs {
                version: request.target_version,
                percentage: request.percentage,
                ignore_missing_task_queues: request.ignore_missing_task_queues,
                identity: request.identity,
                conflict_token: request.conflict_token,
            })
            .await?;
        self.propagate_routing(&namespace.id, &controller).await;
        Ok(RoutingMutationReply {
            previous_version: response.previous_version,
            conflict_token: response.conflict_token,
        })
    }

    /// Describe one deployment version's summary.
    pub async fn describe_worker_deployment_version(
        &self,
        namespace: &str,
        deployment_name: &str,
        version: &str,
    ) -> ServiceResult<kairos_deployment::VersionSummary> {
        let namespace = self.registry.get_by_name(namespace, false).await?;
        let controller = self.controller(&namespace.id, deployment_name).await;
        controller.describe_version(version).await
    }

    /// Upsert/remove metadata entries on a deployment version.
    pub async fn update_worker_deployment_version_metadata(
        &self,
        request: UpdateWorkerDeploymentVersionMetadataRequest,
    ) -> ServiceResult<std::collections::BTreeMap<String, String>> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let controller = self
            .controller(&namespace.id, &request.deployment_name)
            .await;
        controller
            .update_version_metadata(
                &request.version,
                request.upsert_entries,
                &request.remove_entries,
            )
            .await
    }

    /// Delete one deployment version.
    pub async fn delete_worker_deployment_version(
        &self,
        request: DeleteWorkerDeploymentVersionRequest,
    ) -> ServiceResult<()> {
        let namespace = self.registry.get_by_name(&request.namespace, false).await?;
        let controller = self
            .controller(&namespace.id, &request.deployment_name)
            .await;
        controller
            .delete_version(&request.version, request.skip_drainage, &request.identity)
            .await
    }
}

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

//! Worker-deployment controller.
//!
//! ## Model
//! One long-running state machine per deployment name, driven as an
//! event-sourced reducer: inputs are mutations, drainage signals and timer
//! passes; outputs are the next state plus sync effects pushed to version
//! sub-workflows. Each mutation is serialized by a controller-wide lock, and
//! validators run twice, once to accept the request and once after
//! acquiring the lock, because accepted requests can race.
//!
//! ## Continue-as-new
//! The controller continues-as-new whenever no handler is running and either
//! the state changed since the last continuation or a force signal arrived,
//! so every visible mutation is durably the first event of a fresh history.

use crate::state::{
    encode_conflict_token, DeploymentLocalState, DrainageStatus, RegisteredTaskQueue,
    VersionDrainageInfo, VersionSummary,
};
use crate::version_workflow::{
    DrainageSignal, SyncVersionStateArgs, VersionWorkflows, VisibilityCounter,
};
use chrono::{DateTime, Utc};
use kairos_core::{
    ConfigKey, DynamicConfig, ServiceError, ServiceResult, UNVERSIONED_BUILD_ID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Task-queue facts the controller needs from the matching plane.
#[async_trait::async_trait]
pub trait TaskQueueFacts: Send + Sync {
    /// Whether the `(queue, build)` stream has a backlog or a positive
    /// add rate.
    async fn has_backlog_or_adds(&self, queue: &RegisteredTaskQueue, build: &str) -> bool;

    /// Whether the `(queue, build)` stream saw a poller inside the TTL.
    async fn has_recent_poller(&self, queue: &RegisteredTaskQueue, build: &str) -> bool;
}

/// Arguments for [`DeploymentController::set_current`].
#[derive(Debug, Clone)]
pub struct SetCurrentArgs {
    /// Target version; the unversioned sentinel routes work off versioning.
    pub version: String,
    /// Skip the missing-task-queue safety check.
    pub ignore_missing_task_queues: bool,
    /// Caller identity.
    pub identity: String,
    /// Conflict token echoed from a previous response; `None` skips the check.
    pub conflict_token: Option<Vec<u8>>,
}

/// Arguments for [`DeploymentController::set_ramping`].
#[derive(Debug, Clone)]
pub struct SetRampingArgs {
    /// Target version; `None` clears the ramp. The unversioned sentinel is
    /// allowed only while current is versioned.
    pub version: Option<String>,
    /// Ramp percentage in `[0, 100]`.
    pub percentage: f32,
    /// Skip the missing-task-queue safety check.
    pub ignore_missing_task_queues: bool,
    /// Caller identity.
    pub identity: String,
    /// Conflict token echoed from a previous response; `None` skips the check.
    pub conflict_token: Option<Vec<u8>>,
}

/// Response of a routing mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingMutationResponse {
    /// Version previously holding the mutated role.
    pub previous_version: Option<String>,
    /// Previous ramp percentage (ramping mutations only).
    pub previous_percentage: f32,
    /// New conflict token.
    pub conflict_token: Vec<u8>,
}

struct ControllerInner {
    state: DeploymentLocalState,
    state_changed: bool,
    force_can: bool,
    deleted: bool,
}

/// Long-running controller for one worker deployment.
pub struct DeploymentController {
    config: DynamicConfig,
    facts: Arc<dyn TaskQueueFacts>,
    version_workflows: Arc<VersionWorkflows>,
    inner: Mutex<ControllerInner>,
    running_handlers: AtomicUsize,
}

struct HandlerGuard<'a>(&'a AtomicUsize);

impl<'a> HandlerGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for HandlerGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn is_unversioned(version: &str) -> bool {
    version == UNVERSIONED_BUILD_ID
}

impl DeploymentController {
    /// Controller for a deployment, starting from fresh state.
    pub fn new(
        deployment_name: impl Into<String>,
        config: DynamicConfig,
        facts: Arc<dyn TaskQueueFacts>,
        visibility: Arc<dyn VisibilityCounter>,
    ) -> Self {
        let deployment_name = deployment_name.into();
        Self {
            config,
            facts,
            version_workflows: Arc::new(VersionWorkflows::new(
                deployment_name.clone(),
                visibility,
            )),
            inner: Mutex::new(ControllerInner {
                state: DeploymentLocalState::new(deployment_name, Utc::now()),
                state_changed: false,
                force_can: false,
                deleted: false,
            }),
            running_handlers: AtomicUsize::new(0),
        }
    }

    /// Controller resumed from a continued-as-new snapshot.
    pub fn from_snapshot(
        state: DeploymentLocalState,
        config: DynamicConfig,
        facts: Arc<dyn TaskQueueFacts>,
        visibility: Arc<dyn VisibilityCounter>,
    ) -> Self {
        let version_workflows = Arc::new(VersionWorkflows::new(
            state.deployment_name.clone(),
            visibility,
        ));
        Self {
            config,
            facts,
            version_workflows,
            inner: Mutex::new(ControllerInner {
                state,
                state_changed: false,
                force_can: false,
                deleted: false,
            }),
            running_handlers: AtomicUsize::new(0),
        }
    }

    /// The version sub-workflow set, exposed for drainage loops and tests.
    pub fn version_workflows(&self) -> &Arc<VersionWorkflows> {
        &self.version_workflows
    }

    /// Snapshot of the authoritative state.
    pub async fn describe(&self) -> DeploymentLocalState {
        self.inner.lock().await.state.clone()
    }

    fn max_versions(&self) -> usize {
        self.config.int(ConfigKey::MatchingMaxVersionsInDeployment) as usize
    }

    // ----- validators -----------------------------------------------------

    fn validate_set_current(
        state: &DeploymentLocalState,
        args: &SetCurrentArgs,
    ) -> ServiceResult<()> {
        let current_raw = state
            .routing
            .current_version
            .clone()
            .unwrap_or_else(|| UNVERSIONED_BUILD_ID.to_string());
        if current_raw == args.version && state.last_modifier_identity == args.identity {
            return Err(ServiceError::FailedPrecondition("NoChange".to_string()));
        }
        if let Some(token) = &args.conflict_token {
            if *token != state.conflict_token {
                return Err(ServiceError::FailedPrecondition(
                    "ConflictTokenMismatch".to_string(),
                ));
            }
        }
        if !is_unversioned(&args.version) && !state.versions.contains_key(&args.version) {
            return Err(ServiceError::NotFound(format!(
                "version {} not found in deployment {}",
                args.version, state.deployment_name
            )));
        }
        Ok(())
    }

    fn validate_set_ramping(
        state: &DeploymentLocalState,
        args: &SetRampingArgs,
    ) -> ServiceResult<()> {
        if !(0.0..=100.0).contains(&args.percentage) {
            return Err(ServiceError::InvalidArgument(
                "ramp percentage must be within [0, 100]".to_string(),
            ));
        }
        if state.routing.ramping_version == args.version
            && state.routing.ramping_percentage == args.percentage
            && state.last_modifier_identity == args.identity
        {
            return Err(ServiceError::FailedPrecondition("NoChange".to_string()));
        }
        if let Some(token) = &args.conflict_token {
            if *token != state.conflict_token {
                return Err(ServiceError::FailedPrecondition(
                    "ConflictTokenMismatch".to_string(),
                ));
            }
        }
        if let Some(version) = &args.version {
            let current_raw = state
                .routing
                .current_version
                .clone()
                .unwrap_or_else(|| UNVERSIONED_BUILD_ID.to_string());
            if *version == current_raw {
                return Err(ServiceError::FailedPrecondition(
                    "VersionIsCurrentOrRamping".to_string(),
                ));
            }
            if !is_unversioned(version) && !state.versions.contains_key(version) {
                return Err(ServiceError::NotFound(format!(
                    "version {} not found in deployment {}",
                    version, state.deployment_name
                )));
            }
        }
        Ok(())
    }

    fn validate_delete_version(
        state: &DeploymentLocalState,
        version: &str,
        skip_drainage: bool,
    ) -> ServiceResult<()> {
        let Some(summary) = state.versions.get(version) else {
            return Err(ServiceError::NotFound(format!(
                "version {} not found in deployment {}",
                version, state.deployment_name
            )));
        };
        let is_current = state.routing.current_version.as_deref() == Some(version);
        let is_ramping = state.routing.ramping_version.as_deref() == Some(version);
        if is_current || is_ramping {
            return Err(ServiceError::FailedPrecondition(
                "VersionIsCurrentOrRamping".to_string(),
            ));
        }
        if summary.drainage.status == DrainageStatus::Draining && !skip_drainage {
            return Err(ServiceError::FailedPrecondition(
                "VersionIsDraining".to_string(),
            ));
        }
        Ok(())
    }

    // ----- helpers --------------------------------------------------------

    /// Whether `candidate` is missing any task queue of `reference` that has
    /// a backlog or positive add rate on the reference version.
    async fn is_version_missing_task_queues(
        &self,
        state: &DeploymentLocalState,
        reference_version: &str,
        candidate_version: &str,
    ) -> bool {
        let Some(reference) = state.versions.get(reference_version) else {
            return false;
        };
        let Some(candidate) = state.versions.get(candidate_version) else {
            return !reference.registered_task_queues.is_empty();
        };
        for queue in &reference.registered_task_queues {
            if candidate.registered_task_queues.contains(queue) {
                continue;
            }
            if self.facts.has_backlog_or_adds(queue, reference_version).await {
                return true;
            }
        }
        false
    }

    async fn version_has_pollers(&self, summary: &VersionSummary) -> bool {
        for queue in &summary.registered_task_queues {
            if self.facts.has_recent_poller(queue, &summary.version).await {
                return true;
            }
        }
        false
    }

    fn set_summary_drainage(
        state: &mut DeploymentLocalState,
        version: &str,
        status: DrainageStatus,
        at: DateTime<Utc>,
    ) {
        if let Some(summary) = state.versions.get_mut(version) {
            summary.drainage = VersionDrainageInfo {
                status,
                last_changed_time: Some(at),
                last_checked_time: Some(at),
            };
        }
    }

    // ----- mutations ------------------------------------------------------

    /// Register a worker's `(version, task queue)` pair, creating the
    /// version on first sighting. Re-registration is idempotent.
    pub async fn register_worker(
        &self,
        version: &str,
        task_queue: RegisteredTaskQueue,
        identity: &str,
    ) -> ServiceResult<()> {
        let _guard = HandlerGuard::enter(&self.running_handlers);
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if !inner.state.versions.contains_key(version) {
            let max_versions = self.max_versions();
            if inner.state.versions.len() >= max_versions {
                self.try_scavenge_one(&mut inner.state, identity).await.map_err(
                    |_| {
                        ServiceError::FailedPrecondition(format!(
                            "cannot add version, already at max versions {}",
                            max_versions
                        ))
                    },
                )?;
            }
            inner
                .state
                .versions
                .insert(version.to_string(), VersionSummary::new(version, now));
            self.version_workflows.ensure(version, now).await;
            info!(
                deployment = %inner.state.deployment_name,
                version,
                "registered new deployment version"
            );
        }

        let summary = inner
            .state
            .versions
            .get_mut(version)
            .expect("version inserted above");
        summary.registered_task_queues.insert(task_queue.clone());
        self.version_workflows
            .register_task_queue(version, &task_queue.name)
            .await;
        inner.state.last_modifier_identity = identity.to_string();
        inner.state_changed = true;
        Ok(())
    }

    /// Scavenge the oldest deletable version to make room for a new one.
    async fn try_scavenge_one(
        &self,
        state: &mut DeploymentLocalState,
        identity: &str,
    ) -> ServiceResult<()> {
        let mut summaries: Vec<VersionSummary> = state.versions.values().cloned().collect();
        summaries.sort_by_key(|s| s.create_time);
        for summary in summaries {
            if Self::validate_delete_version(state, &summary.version, false).is_err() {
                continue;
            }
            if self.version_has_pollers(&summary).await {
                continue;
            }
            self.version_workflows.delete(&summary.version).await;
            state.versions.remove(&summary.version);
            state.last_modifier_identity = identity.to_string();
            debug!(version = %summary.version, "scavenged deployment version");
            return Ok(());
        }
        Err(ServiceError::FailedPrecondition(
            "could not add version: too many versions in deployment and none are eligible for deletion"
                .to_string(),
        ))
    }

    /// Make `args.version` the current version.
    pub async fn set_current(
        &self,
        args: SetCurrentArgs,
    ) -> ServiceResult<RoutingMutationResponse> {
        let _guard = HandlerGuard::enter(&self.running_handlers);

        // First validation accepts the request.
        Self::validate_set_current(&self.describe().await, &args)?;

        let mut inner = self.inner.lock().await;
        // Accepted requests can race; re-validate against the locked state.
        Self::validate_set_current(&inner.state, &args)?;

        let now = Utc::now();
        let prev_current = inner.state.routing.current_version.clone();
        let prev_current_raw = prev_current
            .clone()
            .unwrap_or_else(|| UNVERSIONED_BUILD_ID.to_string());
        let new_is_versioned = !is_unversioned(&args.version);

        if !args.ignore_missing_task_queues
            && prev_current.is_some()
            && new_is_versioned
            && self
                .is_version_missing_task_queues(&inner.state, &prev_current_raw, &args.version)
                .await
        {
            return Err(ServiceError::FailedPrecondition(
                "CurrentVersionDoesNotHaveAllTaskQueues".to_string(),
            ));
        }

        if new_is_versioned {
            self.version_workflows
                .sync_state(
                    &args.version,
                    SyncVersionStateArgs {
                        routing_update_time: now,
                        current_since: Some(now),
                        ramping_since: None,
                        ramp_percentage: 0.0,
                    },
                )
                .await;
            // Erase any previous drainage; the version is active again.
            Self::set_summary_drainage(
                &mut inner.state,
                &args.version,
                DrainageStatus::Unspecified,
                now,
            );
            if let Some(summary) = inner.state.versions.get_mut(&args.version) {
                summary.first_activation_time.get_or_insert(now);
            }
        }

        if let Some(prev) = &prev_current {
            self.version_workflows
                .sync_state(
                    prev,
                    SyncVersionStateArgs {
                        routing_update_time: now,
                        current_since: None,
                        ramping_since: None,
                        ramp_percentage: 0.0,
                    },
                )
                .await;
            // The previous current cannot have been ramping, so it drains.
            Self::set_summary_drainage(&mut inner.state, prev, DrainageStatus::Draining, now);
            if let Some(summary) = inner.state.versions.get_mut(prev) {
                summary.last_deactivation_time = Some(now);
            }
        }

        inner.state.routing.current_version = if new_is_versioned {
            Some(args.version.clone())
        } else {
            None
        };
        inner.state.routing.current_version_changed_time = Some(now);
        inner.state.conflict_token = encode_conflict_token(now);
        inner.state.last_modifier_identity = args.identity.clone();

        // The new current may have been the ramping version; clear the ramp.
        if inner.state.routing.ramping_version.as_deref() == Some(args.version.as_str()) {
            inner.state.routing.ramping_version = None;
            inner.state.routing.ramping_percentage = 0.0;
            inner.state.routing.ramping_version_changed_time = Some(now);
        }

        inner.state_changed = true;
        Ok(RoutingMutationResponse {
            previous_version: prev_current,
            previous_percentage: 0.0,
            conflict_token: inner.state.conflict_token.clone(),
        })
    }

    /// Set, change or clear the ramping version.
    pub async fn set_ramping(
        &self,
        args: SetRampingArgs,
    ) -> ServiceResult<RoutingMutationResponse> {
        let _guard = HandlerGuard::enter(&self.running_handlers);
        Self::validate_set_ramping(&self.describe().await, &args)?;

        let mut inner = self.inner.lock().await;
        Self::validate_set_ramping(&inner.state, &args)?;

        let now = Utc::now();
        let prev_ramping = inner.state.routing.ramping_version.clone();
        let prev_percentage = inner.state.routing.ramping_percentage;
        let mut ramping_changed_time = Some(now);

        match &args.version {
            None => {
                // Clearing the ramp; the previous ramping version drains.
                if let Some(prev) = &prev_ramping {
                    if !is_unversioned(prev) {
                        self.version_workflows
                            .sync_state(
                                prev,
                                SyncVersionStateArgs {
                                    routing_update_time: now,
                                    current_since: None,
                                    ramping_since: None,
                                    ramp_percentage: 0.0,
                                },
                            )
                            .await;
                    }
                    Self::set_summary_drainage(
                        &mut inner.state,
                        prev,
                        DrainageStatus::Draining,
                        now,
                    );
                    if let Some(summary) = inner.state.versions.get_mut(prev) {
                        summary.last_deactivation_time = Some(now);
                    }
                }
            }
            Some(new_ramping) => {
                let ramping_since = if prev_ramping.as_deref() == Some(new_ramping.as_str()) {
                    // Percentage change only; the ramp start is unchanged.
                    ramping_changed_time = inner.state.routing.ramping_version_changed_time;
                    inner.state.routing.ramping_version_changed_time
                } else {
                    let current_raw = inner
                        .state
                        .routing
                        .current_version
                        .clone()
                        .unwrap_or_else(|| UNVERSIONED_BUILD_ID.to_string());
                    if !args.ignore_missing_task_queues
                        && inner.state.routing.current_version.is_some()
                        && !is_unversioned(new_ramping)
                        && self
                            .is_version_missing_task_queues(&inner.state, &current_raw, new_ramping)
                            .await
                    {
                        return Err(ServiceError::FailedPrecondition(
                            "RampingVersionDoesNotHaveAllTaskQueues".to_string(),
                        ));
                    }
                    Self::set_summary_drainage(
                        &mut inner.state,
                        new_ramping,
                        DrainageStatus::Unspecified,
                        now,
                    );
                    if let Some(summary) = inner.state.versions.get_mut(new_ramping) {
                        summary.first_activation_time.get_or_insert(now);
                    }
                    Some(now)
                };

                if !is_unversioned(new_ramping) {
                    self.version_workflows
                        .sync_state(
                            new_ramping,
                            SyncVersionStateArgs {
                                routing_update_time: now,
                                current_since: None,
                                ramping_since,
                                ramp_percentage: args.percentage,
                            },
                        )
                        .await;
                }

                // The previous ramping version, if different, drains.
                if let Some(prev) = &prev_ramping {
                    if prev != new_ramping {
                        if !is_unversioned(prev) {
                            self.version_workflows
                                .sync_state(
                                    prev,
                                    SyncVersionStateArgs {
                                        routing_update_time: now,
                                        current_since: None,
                                        ramping_since: None,
                                        ramp_percentage: 0.0,
                                    },
                                )
                                .await;
                        }
                        Self::set_summary_drainage(
                            &mut inner.state,
                            prev,
                            DrainageStatus::Draining,
                            now,
                        );
                        if let Some(summary) = inner.state.versions.get_mut(prev) {
                            summary.last_deactivation_time = Some(now);
                        }
                    }
                }
            }
        }

        inner.state.routing.ramping_version = args.version.clone();
        inner.state.routing.ramping_percentage = if args.version.is_some() {
            args.percentage
        } else {
            0.0
        };
        inner.state.routing.ramping_version_changed_time = ramping_changed_time;
        inner.state.conflict_token = encode_conflict_token(now);
        inner.state.last_modifier_identity = args.identity.clone();
        inner.state_changed = true;

        Ok(RoutingMutationResponse {
            previous_version: prev_ramping,
            previous_percentage: prev_percentage,
            conflict_token: inner.state.conflict_token.clone(),
        })
    }

    /// Delete a version that is neither routed to nor serving pollers.
    pub async fn delete_version(
        &self,
        version: &str,
        skip_drainage: bool,
        identity: &str,
    ) -> ServiceResult<()> {
        let _guard = HandlerGuard::enter(&self.running_handlers);
        Self::validate_delete_version(&self.describe().await, version, skip_drainage)?;

        let mut inner = self.inner.lock().await;
        Self::validate_delete_version(&inner.state, version, skip_drainage)?;

        // The poller check applies even on the skip-drainage path; skipping
        // drainage means "don't wait for open workflows", not "ignore live
        // workers".
        let summary = inner
            .state
            .versions
            .get(version)
            .expect("validated above")
            .clone();
        if self.version_has_pollers(&summary).await {
            return Err(ServiceError::FailedPrecondition(
                "VersionHasPollers".to_string(),
            ));
        }

        self.version_workflows.delete(version).await;
        inner.state.versions.remove(version);
        inner.state.last_modifier_identity = identity.to_string();
        inner.state_changed = true;
        info!(deployment = %inner.state.deployment_name, version, "deleted deployment version");
        Ok(())
    }

    /// Delete the deployment itself; rejected while any version remains.
    pub async fn delete_deployment(&self, identity: &str) -> ServiceResult<()> {
        let _guard = HandlerGuard::enter(&self.running_handlers);
        let mut inner = self.inner.lock().await;
        if !inner.state.versions.is_empty() {
            return Err(ServiceError::FailedPrecondition(
                "deployment has versions, can't be deleted".to_string(),
            ));
        }
        inner.deleted = true;
        inner.state.last_modifier_identity = identity.to_string();
        inner.state_changed = true;
        Ok(())
    }

    /// Whether the deployment has been deleted.
    pub async fn is_deleted(&self) -> bool {
        self.inner.lock().await.deleted
    }

    /// Summary of one version.
    pub async fn describe_version(&self, version: &str) -> ServiceResult<VersionSummary> {
        let inner = self.inner.lock().await;
        inner
            .state
            .versions
            .get(version)
            .cloned()
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "version {} not found in deployment {}",
                    version, inner.state.deployment_name
                ))
            })
    }

    /// Upsert and remove metadata entries on a version. Returns the
    /// resulting entry set.
    pub async fn update_version_metadata(
        &self,
        version: &str,
        upsert_entries: std::collections::BTreeMap<String, String>,
        remove_entries: &[String],
    ) -> ServiceResult<std::collections::BTreeMap<String, String>> {
        let _guard = HandlerGuard::enter(&self.running_handlers);
        let mut inner = self.inner.lock().await;
        let deployment_name = inner.state.deployment_name.clone();
        let summary = inner.state.versions.get_mut(version).ok_or_else(|| {
            ServiceError::NotFound(format!(
                "version {} not found in deployment {}",
                version, deployment_name
            ))
        })?;
        for (key, value) in upsert_entries {
            summary.metadata.insert(key, value);
        }
        for key in remove_entries {
            summary.metadata.remove(key);
        }
        let metadata = summary.metadata.clone();
        inner.state_changed = true;
        Ok(metadata)
    }

    // ----- drainage -------------------------------------------------------

    /// Apply a drainage signal from a version sub-workflow. Summaries of
    /// current or ramping versions ignore drainage signals.
    pub async fn apply_drainage_signal(&self, signal: DrainageSignal) {
        let mut inner = self.inner.lock().await;
        let is_current =
            inner.state.routing.current_version.as_deref() == Some(signal.version.as_str());
        let is_ramping =
            inner.state.routing.ramping_version.as_deref() == Some(signal.version.as_str());
        if is_current || is_ramping {
            return;
        }
        if let Some(summary) = inner.state.versions.get_mut(&signal.version) {
            summary.drainage = signal.drainage;
            inner.state_changed = true;
        }
    }

    /// Run one drainage pass over every version sub-workflow, applying any
    /// transition signals to the authoritative summaries.
    pub async fn run_drainage_pass(&self) -> ServiceResult<()> {
        for version in self.version_workflows.versions().await {
            if let Some(signal) = self.version_workflows.refresh_drainage(&version).await? {
                self.apply_drainage_signal(signal).await;
            }
        }
        Ok(())
    }

    // ----- continue-as-new ------------------------------------------------

    /// Request a continue-as-new even without state changes.
    pub async fn signal_force_continue_as_new(&self) {
        self.inner.lock().await.force_can = true;
    }

    /// Whether the controller should continue-as-new now: no handler is
    /// running and state changed (or a force signal arrived).
    pub async fn should_continue_as_new(&self) -> bool {
        if self.running_handlers.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let inner = self.inner.lock().await;
        !inner.deleted && (inner.state_changed || inner.force_can)
    }

    /// Take the continuation snapshot, resetting the dirty flags. The
    /// snapshot becomes the input of the next history.
    pub async fn take_continuation(&self) -> Option<DeploymentLocalState> {
        if !self.should_continue_as_new().await {
            return None;
        }
        let mut inner = self.inner.lock().await;
        inner.state_changed = false;
        inner.force_can = false;
        Some(inner.state.clone())
    }
}

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

//! Version sub-workflows.
//!
//! One sub-workflow exists per `(deployment, version)`. It accepts sync-state
//! updates from the controller, tracks drainage by counting open workflows
//! pinned to the version, and reports drainage transitions back through a
//! signal the controller applies to the authoritative summary.

use crate::state::{DrainageStatus, VersionDrainageInfo};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kairos_core::ServiceResult;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use tracing::debug;

/// Visibility capability: counts open workflows pinned to a version.
/// The concrete index is an external collaborator.
#[async_trait]
pub trait VisibilityCounter: Send + Sync {
    /// Open workflows pinned to `deployment_name:version`.
    async fn count_open_pinned(&self, deployment_name: &str, version: &str)
        -> ServiceResult<usize>;
}

/// Sync-state update pushed down by the deployment controller.
#[derive(Debug, Clone)]
pub struct SyncVersionStateArgs {
    /// Time of the routing mutation driving this sync.
    pub routing_update_time: DateTime<Utc>,
    /// Set when the version is (still) current; `None` clears current.
    pub current_since: Option<DateTime<Utc>>,
    /// Set when the version is (still) ramping; `None` clears the ramp.
    pub ramping_since: Option<DateTime<Utc>>,
    /// Ramp percentage; zero when not ramping.
    pub ramp_percentage: f32,
}

impl Default for SyncVersionStateArgs {
    fn default() -> Self {
        Self {
            routing_update_time: Utc::now(),
            current_since: None,
            ramping_since: None,
            ramp_percentage: 0.0,
        }
    }
}

/// Local state of one version sub-workflow.
#[derive(Debug, Clone)]
pub struct VersionLocalState {
    /// Version id.
    pub version: String,
    /// Registration time.
    pub create_time: DateTime<Utc>,
    /// Set while the version is current.
    pub current_since: Option<DateTime<Utc>>,
    /// Set while the version is ramping.
    pub ramping_since: Option<DateTime<Utc>>,
    /// Ramp percentage while ramping.
    pub ramp_percentage: f32,
    /// Drainage tracking local to the sub-workflow.
    pub drainage: VersionDrainageInfo,
    /// Task queues registered by this version's workers.
    pub task_queues: BTreeSet<String>,
}

impl VersionLocalState {
    fn new(version: &str, create_time: DateTime<Utc>) -> Self {
        Self {
            version: version.to_string(),
            create_time,
            current_since: None,
            ramping_since: None,
            ramp_percentage: 0.0,
            drainage: VersionDrainageInfo::default(),
            task_queues: BTreeSet::new(),
        }
    }

    /// Whether the version is currently routed to (current or ramping).
    pub fn is_active(&self) -> bool {
        self.current_since.is_some() || self.ramping_since.is_some()
    }
}

/// A drainage transition reported back to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainageSignal {
    /// Version the signal concerns.
    pub version: String,
    /// New drainage info.
    pub drainage: VersionDrainageInfo,
}

/// The set of version sub-workflows for one deployment.
pub struct VersionWorkflows {
    deployment_name: String,
    visibility: std::sync::Arc<dyn VisibilityCounter>,
    states: Mutex<HashMap<String, VersionLocalState>>,
}

impl VersionWorkflows {
    /// Sub-workflow set for one deployment.
    pub fn new(
        deployment_name: impl Into<String>,
        visibility: std::sync::Arc<dyn VisibilityCounter>,
    ) -> Self {
        Self {
            deployment_name: deployment_name.into(),
            visibility,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure the sub-workflow exists; idempotent.
    pub async fn ensure(&self, version: &str, create_time: DateTime<Utc>) {
        self.states
            .lock()
            .await
            .entry(version.to_string())
            .or_insert_with(|| VersionLocalState::new(version, create_time));
    }

    /// Register a task queue for a version; idempotent.
    pub async fn register_task_queue(&self, version: &str, queue: &str) {
        if let Some(state) = self.states.lock().await.get_mut(version) {
            state.task_queues.insert(queue.to_string());
        }
    }

    /// Apply a sync-state update from the controller.
    pub async fn sync_state(
        &self,
        version: &str,
        args: SyncVersionStateArgs,
    ) -> Option<VersionLocalState> {
        let mut states = self.states.lock().await;
        let state = states.get_mut(version)?;
        state.current_since = args.current_since;
        state.ramping_since = args.ramping_since;
        state.ramp_percentage = args.ramp_percentage;
        debug!(
            deployment = %self.deployment_name,
            version,
            current = state.current_since.is_some(),
            ramping = state.ramping_since.is_some(),
            "synced version state"
        );
        Some(state.clone())
    }

    /// Snapshot of one sub-workflow's state.
    pub async fn state(&self, version: &str) -> Option<VersionLocalState> {
        self.states.lock().await.get(version).cloned()
    }

    /// Remove the sub-workflow on version deletion.
    pub async fn delete(&self, version: &str) -> bool {
        self.states.lock().await.remove(version).is_some()
    }

    /// Re-check drainage for one version against visibility.
    ///
    /// Returns a signal for the controller when the status transitions.
    /// Active (current/ramping) versions are skipped entirely.
    pub async fn refresh_drainage(&self, version: &str) -> ServiceResult<Option<DrainageSignal>> {
        let snapshot = {
            let states = self.states.lock().await;
            match states.get(version) {
                Some(state) => state.clone(),
                None => return Ok(None),
            }
        };
        if snapshot.is_active() {
            return Ok(None);
        }

        let open = self
            .visibility
            .count_open_pinned(&self.deployment_name, version)
            .await?;
        let now = Utc::now();
        let next_status = if open == 0 {
            DrainageStatus::Drained
        } else {
            DrainageStatus::Draining
        };

        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(version) else {
            return Ok(None);
        };
        let transitioned = state.drainage.status != next_status;
        state.drainage.last_checked_time = Some(now);
        if transitioned {
            state.drainage.status = next_status;
            state.drainage.last_changed_time = Some(now);
        }
        if transitioned {
            Ok(Some(DrainageSignal {
                version: version.to_string(),
                drainage: state.drainage.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// All version ids with a live sub-workflow.
    pub async fn versions(&self) -> Vec<String> {
        self.states.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeVisibility {
        open: AtomicUsize,
    }

    #[async_trait]
    impl VisibilityCounter for FakeVisibility {
        async fn count_open_pinned(
            &self,
            _deployment_name: &str,
            _version: &str,
        ) -> ServiceResult<usize> {
            Ok(self.open.load(Ordering::SeqCst))
        }
    }

    async fn workflows(open: usize) -> (VersionWorkflows, Arc<FakeVisibility>) {
        let visibility = Arc::new(FakeVisibility {
            open: AtomicUsize::new(open),
        });
        let workflows = VersionWorkflows::new("checkout", visibility.clone());
        workflows.ensure("v1", Utc::now()).await;
        (workflows, visibility)
    }

    #[tokio::test]
    async fn test_active_version_skips_drainage() {
        let (workflows, _) = workflows(0).await;
        workflows
            .sync_state(
                "v1",
                SyncVersionStateArgs {
                    current_since: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(workflows.refresh_drainage("v1").await.unwrap().is_none());
        let state = workflows.state("v1").await.unwrap();
        assert_eq!(state.drainage.status, DrainageStatus::Unspecified);
    }

    #[tokio::test]
    async fn test_drainage_transitions_draining_then_drained() {
        let (workflows, visibility) = workflows(2).await;

        let signal = workflows.refresh_drainage("v1").await.unwrap().unwrap();
        assert_eq!(signal.drainage.status, DrainageStatus::Draining);

        // No transition on a steady re-check, but the checked time moves.
        let first_checked = workflows.state("v1").await.unwrap().drainage.last_checked_time;
        assert!(workflows.refresh_drainage("v1").await.unwrap().is_none());
        let second_checked = workflows.state("v1").await.unwrap().drainage.last_checked_time;
        assert!(second_checked >= first_checked);

        // Last pinned workflow closes.
        visibility.open.store(0, Ordering::SeqCst);
        let signal = workflows.refresh_drainage("v1").await.unwrap().unwrap();
        assert_eq!(signal.drainage.status, DrainageStatus::Drained);
    }

    #[tokio::test]
    async fn test_sync_and_delete() {
        let (workflows, _) = workflows(0).await;
        workflows.register_task_queue("v1", "orders").await;
        let state = workflows.state("v1").await.unwrap();
        assert!(state.task_queues.contains("orders"));

        assert!(workflows.delete("v1").await);
        assert!(!workflows.delete("v1").await);
        assert!(workflows.state("v1").await.is_none());
    }
}

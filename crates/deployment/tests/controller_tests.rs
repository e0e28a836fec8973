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

//! Deployment controller lifecycle tests.

use async_trait::async_trait;
use kairos_core::{ConfigKey, ConfigValue, DynamicConfig, ServiceError, ServiceResult};
use kairos_deployment::{
    DeploymentController, DrainageStatus, RegisteredTaskQueue, SerializableQueueType,
    SetCurrentArgs, SetRampingArgs, TaskQueueFacts, VisibilityCounter,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scriptable matching facts.
#[derive(Default)]
struct FakeFacts {
    backlogged: Mutex<HashSet<(String, String)>>,
    polling: Mutex<HashSet<(String, String)>>,
}

impl FakeFacts {
    fn set_backlog(&self, queue: &str, build: &str) {
        self.backlogged
            .lock()
            .unwrap()
            .insert((queue.to_string(), build.to_string()));
    }

    fn set_poller(&self, queue: &str, build: &str) {
        self.polling
            .lock()
            .unwrap()
            .insert((queue.to_string(), build.to_string()));
    }

    fn clear_poller(&self, queue: &str, build: &str) {
        self.polling
            .lock()
            .unwrap()
            .remove(&(queue.to_string(), build.to_string()));
    }
}

#[async_trait]
impl TaskQueueFacts for FakeFacts {
    async fn has_backlog_or_adds(&self, queue: &RegisteredTaskQueue, build: &str) -> bool {
        self.backlogged
            .lock()
            .unwrap()
            .contains(&(queue.name.clone(), build.to_string()))
    }

    async fn has_recent_poller(&self, queue: &RegisteredTaskQueue, build: &str) -> bool {
        self.polling
            .lock()
            .unwrap()
            .contains(&(queue.name.clone(), build.to_string()))
    }
}

/// Visibility with an adjustable open-pinned count.
struct FakeVisibility {
    open: AtomicUsize,
}

#[async_trait]
impl VisibilityCounter for FakeVisibility {
    async fn count_open_pinned(&self, _deployment: &str, _version: &str) -> ServiceResult<usize> {
        Ok(self.open.load(Ordering::SeqCst))
    }
}

struct Fixture {
    controller: DeploymentController,
    facts: Arc<FakeFacts>,
    visibility: Arc<FakeVisibility>,
}

fn fixture_with_max_versions(max: i64) -> Fixture {
    let config = DynamicConfig::new();
    config.set(
        ConfigKey::MatchingMaxVersionsInDeployment,
        ConfigValue::Int(max),
    );
    let facts = Arc::new(FakeFacts::default());
    let visibility = Arc::new(FakeVisibility {
        open: AtomicUsize::new(0),
    });
    Fixture {
        controller: DeploymentController::new(
            "checkout",
            config,
            facts.clone(),
            visibility.clone(),
        ),
        facts,
        visibility,
    }
}

fn fixture() -> Fixture {
    fixture_with_max_versions(100)
}

fn queue(name: &str) -> RegisteredTaskQueue {
    RegisteredTaskQueue {
        name: name.to_string(),
        queue_type: SerializableQueueType::Workflow,
    }
}

fn set_current(version: &str) -> SetCurrentArgs {
    SetCurrentArgs {
        version: version.to_string(),
        ignore_missing_task_queues: false,
        identity: "test-operator".to_string(),
        conflict_token: None,
    }
}

fn set_ramping(version: Option<&str>, percentage: f32) -> SetRampingArgs {
    SetRampingArgs {
        version: version.map(|v| v.to_string()),
        percentage,
        ignore_missing_task_queues: false,
        identity: "test-operator".to_string(),
        conflict_token: None,
    }
}

#[tokio::test]
async fn test_register_worker_creates_version_and_queue() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "worker-1")
        .await
        .unwrap();
    // Idempotent re-registration.
    f.controller
        .register_worker("v1", queue("t1"), "worker-1")
        .await
        .unwrap();

    let state = f.controller.describe().await;
    assert_eq!(state.versions.len(), 1);
    let summary = &state.versions["v1"];
    assert_eq!(summary.registered_task_queues.len(), 1);
    assert_eq!(summary.drainage.status, DrainageStatus::Unspecified);
}

#[tokio::test]
async fn test_set_current_activates_and_drains_previous() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t1"), "w")
        .await
        .unwrap();

    let response = f.controller.set_current(set_current("v1")).await.unwrap();
    assert_eq!(response.previous_version, None);

    let response = f.controller.set_current(set_current("v2")).await.unwrap();
    assert_eq!(response.previous_version, Some("v1".to_string()));

    let state = f.controller.describe().await;
    assert_eq!(state.routing.current_version, Some("v2".to_string()));
    assert_eq!(state.versions["v1"].drainage.status, DrainageStatus::Draining);
    assert_eq!(
        state.versions["v2"].drainage.status,
        DrainageStatus::Unspecified
    );
    assert!(state.versions["v2"].first_activation_time.is_some());
    assert!(state.versions["v1"].last_deactivation_time.is_some());
}

#[tokio::test]
async fn test_set_current_missing_task_queue_with_backlog() {
    let f = fixture();
    // v1 serves t1; v2 registers only t2.
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();
    f.controller
        .register_worker("v2", queue("t2"), "w")
        .await
        .unwrap();

    // t1 has a backlog on v1, so v2 is rejected as current.
    f.facts.set_backlog("t1", "v1");
    let err = f.controller.set_current(set_current("v2")).await.unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "CurrentVersionDoesNotHaveAllTaskQueues"
    ));

    // Routing config is unchanged by the rejection.
    let state = f.controller.describe().await;
    assert_eq!(state.routing.current_version, Some("v1".to_string()));

    // The operator can override.
    let mut args = set_current("v2");
    args.ignore_missing_task_queues = true;
    f.controller.set_current(args).await.unwrap();
}

#[tokio::test]
async fn test_conflict_token_rejects_stale_writers() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t1"), "w")
        .await
        .unwrap();

    let response = f.controller.set_current(set_current("v1")).await.unwrap();
    let stale_token = response.conflict_token.clone();

    // A second writer moves routing; the token rotates.
    f.controller.set_current(set_current("v2")).await.unwrap();

    let mut args = set_current("v1");
    args.identity = "other-operator".to_string();
    args.conflict_token = Some(stale_token);
    let err = f.controller.set_current(args).await.unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "ConflictTokenMismatch"
    ));

    // Rejection happened before any state mutation.
    let state = f.controller.describe().await;
    assert_eq!(state.routing.current_version, Some("v2".to_string()));
}

#[tokio::test]
async fn test_no_change_is_rejected() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    let err = f.controller.set_current(set_current("v1")).await.unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "NoChange"
    ));
}

#[tokio::test]
async fn test_set_ramping_and_promotion_clears_ramp() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    let response = f
        .controller
        .set_ramping(set_ramping(Some("v2"), 25.0))
        .await
        .unwrap();
    assert_eq!(response.previous_version, None);

    let state = f.controller.describe().await;
    assert_eq!(state.routing.ramping_version, Some("v2".to_string()));
    assert_eq!(state.routing.ramping_percentage, 25.0);

    // Percentage-only change keeps the ramp start time.
    let started = state.routing.ramping_version_changed_time;
    f.controller
        .set_ramping(set_ramping(Some("v2"), 50.0))
        .await
        .unwrap();
    let state = f.controller.describe().await;
    assert_eq!(state.routing.ramping_percentage, 50.0);
    assert_eq!(state.routing.ramping_version_changed_time, started);

    // Promoting the ramping version to current clears the ramp.
    f.controller.set_current(set_current("v2")).await.unwrap();
    let state = f.controller.describe().await;
    assert_eq!(state.routing.current_version, Some("v2".to_string()));
    assert_eq!(state.routing.ramping_version, None);
    assert_eq!(state.routing.ramping_percentage, 0.0);
}

#[tokio::test]
async fn test_ramping_current_version_is_rejected() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    let err = f
        .controller
        .set_ramping(set_ramping(Some("v1"), 10.0))
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "VersionIsCurrentOrRamping"
    ));
}

#[tokio::test]
async fn test_unversioned_ramp_requires_versioned_current() {
    let f = fixture();
    // Current is unversioned; an unversioned ramp is rejected.
    let err = f
        .controller
        .set_ramping(set_ramping(Some(kairos_core::UNVERSIONED_BUILD_ID), 10.0))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::FailedPrecondition(_)));

    // With a versioned current it is allowed.
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();
    f.controller
        .set_ramping(set_ramping(Some(kairos_core::UNVERSIONED_BUILD_ID), 10.0))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_drainage_transition_draining_to_drained() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    // A pinned workflow is open on v1 while v2 takes over.
    f.visibility.open.store(1, Ordering::SeqCst);
    f.controller.set_current(set_current("v2")).await.unwrap();
    assert_eq!(
        f.controller.describe().await.versions["v1"].drainage.status,
        DrainageStatus::Draining
    );

    // The pinned workflow terminates; the next pass reports drained.
    f.visibility.open.store(0, Ordering::SeqCst);
    f.controller.run_drainage_pass().await.unwrap();
    assert_eq!(
        f.controller.describe().await.versions["v1"].drainage.status,
        DrainageStatus::Drained
    );
}

#[tokio::test]
async fn test_current_version_ignores_drainage_signals() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    f.controller.run_drainage_pass().await.unwrap();
    assert_eq!(
        f.controller.describe().await.versions["v1"].drainage.status,
        DrainageStatus::Unspecified
    );
}

#[tokio::test]
async fn test_delete_version_guards() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t1"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();

    // Current version cannot be deleted.
    let err = f
        .controller
        .delete_version("v1", false, "op")
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "VersionIsCurrentOrRamping"
    ));

    // A draining version is rejected without skip_drainage.
    f.controller.set_current(set_current("v2")).await.unwrap();
    let err = f
        .controller
        .delete_version("v1", false, "op")
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "VersionIsDraining"
    ));

    // Even with skip_drainage, live pollers block deletion.
    f.facts.set_poller("t1", "v1");
    let err = f
        .controller
        .delete_version("v1", true, "op")
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg == "VersionHasPollers"
    ));

    f.facts.clear_poller("t1", "v1");
    f.controller.delete_version("v1", true, "op").await.unwrap();
    assert!(!f.controller.describe().await.versions.contains_key("v1"));
}

#[tokio::test]
async fn test_delete_deployment_requires_no_versions() {
    let f = fixture();
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();

    let err = f.controller.delete_deployment("op").await.unwrap_err();
    assert!(matches!(err, ServiceError::FailedPrecondition(_)));

    f.controller.delete_version("v1", true, "op").await.unwrap();
    f.controller.delete_deployment("op").await.unwrap();
    assert!(f.controller.is_deleted().await);
}

#[tokio::test]
async fn test_scavenger_on_register_at_max_versions() {
    let f = fixture_with_max_versions(3);
    for (i, version) in ["v1", "v2", "v3"].iter().enumerate() {
        f.controller
            .register_worker(version, queue(&format!("t{}", i)), "w")
            .await
            .unwrap();
        // Every version currently has a live poller.
        f.facts.set_poller(&format!("t{}", i), version);
    }

    // All versions have pollers: registration of a fourth fails.
    let err = f
        .controller
        .register_worker("v4", queue("t4"), "w")
        .await
        .unwrap_err();
    assert!(matches!(
        &err,
        ServiceError::FailedPrecondition(msg) if msg.contains("already at max versions 3")
    ));

    // Pollers age out on v2 and v3; the oldest eligible (v2) is scavenged.
    f.facts.clear_poller("t1", "v2");
    f.facts.clear_poller("t2", "v3");
    f.controller
        .register_worker("v4", queue("t4"), "w")
        .await
        .unwrap();

    let state = f.controller.describe().await;
    assert!(!state.versions.contains_key("v2"));
    assert!(state.versions.contains_key("v3"));
    assert!(state.versions.contains_key("v4"));
}

#[tokio::test]
async fn test_continue_as_new_discipline() {
    let f = fixture();
    // Nothing changed yet.
    assert!(!f.controller.should_continue_as_new().await);

    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    assert!(f.controller.should_continue_as_new().await);

    // Taking the continuation resets the dirty flag.
    let snapshot = f.controller.take_continuation().await.unwrap();
    assert_eq!(snapshot.versions.len(), 1);
    assert!(!f.controller.should_continue_as_new().await);
    assert!(f.controller.take_continuation().await.is_none());

    // A force signal continues even without changes.
    f.controller.signal_force_continue_as_new().await;
    assert!(f.controller.should_continue_as_new().await);
    f.controller.take_continuation().await.unwrap();
    assert!(!f.controller.should_continue_as_new().await);
}

#[tokio::test]
async fn test_scavenger_never_deletes_versions_in_use() {
    let f = fixture_with_max_versions(2);
    f.controller
        .register_worker("v1", queue("t1"), "w")
        .await
        .unwrap();
    f.controller
        .register_worker("v2", queue("t2"), "w")
        .await
        .unwrap();
    f.controller.set_current(set_current("v1")).await.unwrap();
    f.controller
        .set_ramping(set_ramping(Some("v2"), 10.0))
        .await
        .unwrap();

    // Both versions are routed to; nothing is eligible for scavenging.
    let err = f
        .controller
        .register_worker("v3", queue("t3"), "w")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::FailedPrecondition(_)));
    let state = f.controller.describe().await;
    assert!(state.versions.contains_key("v1"));
    assert!(state.versions.contains_key("v2"));
}

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

//! History engine commit path.
//!
//! ## Protocol
//! 1. Acquire the per-workflow serialized section.
//! 2. Load mutable state from cache, or from persistence fenced by the
//!    shard's range id.
//! 3. Run the caller's mutator over the state.
//! 4. Assign and validate task keys; register them with the task-request
//!    tracker and obtain the completion handle.
//! 5. Issue one persistence transaction: state row (db-record-version CAS),
//!    task rows, bumped last-assigned keys.
//! 6. Report the outcome to the tracker. Conditional failures are reported
//!    as definitely-not-inserted and surface as `WorkflowConflict`; unknown
//!    failures leave the keys tracked so ack cursors treat them as
//!    possibly-live.

use crate::cache::{CachedState, WorkflowCache};
use crate::mutable_state::WorkflowMutableState;
use crate::shard::ShardContext;
use crate::task_tracker::TaskOutcome;
use chrono::{DateTime, Utc};
use kairos_core::backoff::{self, RetryPolicy};
use kairos_core::{ServiceError, ServiceResult, TaskCategory, TaskKey, WorkflowKey};
use kairos_persistence::{CommitRequest, TaskRow, WorkflowStateRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A task produced by a mutator, before key assignment.
#[derive(Debug, Clone)]
pub struct GeneratedTask {
    /// Category to append under.
    pub category: TaskCategory,
    /// Fire time for scheduled categories; `None` for immediate ones.
    pub fire_time: Option<DateTime<Utc>>,
    /// Serialized task payload.
    pub payload: Value,
}

/// Commit intent returned by a mutator.
#[derive(Debug, Clone)]
pub struct MutationResult {
    /// New mutable state to persist.
    pub state: WorkflowMutableState,
    /// Tasks to append atomically with the state.
    pub tasks: Vec<GeneratedTask>,
}

/// Outcome of a successful [`HistoryEngine::execute`] call.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    /// Keys assigned to the generated tasks, in input order.
    pub task_keys: Vec<TaskKey>,
    /// Db-record version of the committed state row.
    pub db_record_version: i64,
}

/// Engine serving read/write operations for all workflows of one shard.
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    cache: WorkflowCache,
    load_retry: RetryPolicy,
}

impl HistoryEngine {
    /// Engine over an acquired shard.
    pub fn new(shard: Arc<ShardContext>) -> Self {
        Self {
            shard,
            cache: WorkflowCache::new(),
            load_retry: RetryPolicy::default(),
        }
    }

    /// The shard this engine serves.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Workflow cache, exposed for task executors.
    pub fn cache(&self) -> &WorkflowCache {
        &self.cache
    }

    /// Read a workflow's mutable state without mutating it.
    pub async fn read(&self, workflow_key: &WorkflowKey) -> ServiceResult<WorkflowMutableState> {
        let slot = self.cache.slot(workflow_key);
        let _guard = slot.lock_writer().await;
        let cached = self.load(workflow_key, &slot).await?;
        cached
            .map(|c| c.state)
            .ok_or_else(|| ServiceError::NotFound(format!("workflow {}", workflow_key)))
    }

    /// Execute a mutator against a workflow and commit its intent.
    ///
    /// The mutator receives the current state (`None` for a first write) and
    /// returns the new state plus generated tasks.
    pub async fn execute<F>(
        &self,
        workflow_key: &WorkflowKey,
        mutator: F,
    ) -> ServiceResult<CommitOutcome>
    where
        F: FnOnce(Option<&WorkflowMutableState>) -> ServiceResult<MutationResult>,
    {
        let slot = self.cache.slot(workflow_key);
        let _guard = slot.lock_writer().await;

        let cached = self.load(workflow_key, &slot).await?;
        let expected_version = cached.as_ref().map(|c| c.db_record_version).unwrap_or(0);

        let result = mutator(cached.as_ref().map(|c| &c.state))?;
        result.state.validate()?;

        // Assign keys and validate them against the shard's high-water marks.
        let mut task_keys = Vec::with_capacity(result.tasks.len());
        let mut keys_by_category: HashMap<TaskCategory, Vec<TaskKey>> = HashMap::new();
        let mut task_rows = Vec::with_capacity(result.tasks.len());
        for task in &result.tasks {
            let key = self
                .shard
                .allocate_task_key(task.category, task.fire_time)?;
            self.shard.validate_and_record_key(task.category, key)?;
            keys_by_category.entry(task.category).or_default().push(key);
            task_keys.push(key);
            task_rows.push(TaskRow {
                shard_id: self.shard.shard_id(),
                category_id: task.category.id(),
                key,
                workflow_key: workflow_key.clone(),
                version_stamp: self.shard.version_stamp(),
                payload: task.payload.clone(),
            });
        }

        let tracked = self.shard.tracker().track(keys_by_category);

        let db_record_version = expected_version + 1;
        let request = CommitRequest {
            shard_id: self.shard.shard_id(),
            range_id: self.shard.range_id(),
            workflow_state: WorkflowStateRecord {
                workflow_key: workflow_key.clone(),
                state: serde_json::to_value(&result.state)
                    .map_err(|e| ServiceError::internal(e.to_string()))?,
                db_record_version,
            },
            expected_db_record_version: expected_version,
            tasks: task_rows,
            last_assigned_keys: self.shard.last_assigned_keys(),
        };

        match self.shard.store().commit(request).await {
            Ok(()) => {
                tracked.complete(TaskOutcome::Success);
                slot.put(CachedState {
                    state: result.state,
                    db_record_version,
                });
                debug!(
                    workflow_key = %workflow_key,
                    tasks = task_keys.len(),
                    db_record_version,
                    "committed workflow mutation"
                );
                Ok(CommitOutcome {
                    task_keys,
                    db_record_version,
                })
            }
            Err(err) if err.definitely_not_inserted() => {
                tracked.complete(TaskOutcome::DefinitelyNotInserted);
                self.cache.evict(workflow_key);
                Err(err.into())
            }
            Err(err) => {
                // Unknown outcome: the task keys may be live in storage, so
                // they stay tracked and pin the ack cursor.
                tracked.complete(TaskOutcome::Unknown);
                self.cache.evict(workflow_key);
                warn!(workflow_key = %workflow_key, error = %err, "commit outcome unknown");
                Err(err.into())
            }
        }
    }

    async fn load(
        &self,
        workflow_key: &WorkflowKey,
        slot: &Arc<crate::cache::CacheSlot>,
    ) -> ServiceResult<Option<CachedState>> {
        if let Some(cached) = slot.cached() {
            return Ok(Some(cached));
        }
        let record = backoff::retry(&self.load_retry, || async {
            self.shard
                .store()
                .get_workflow_state(
                    self.shard.shard_id(),
                    self.shard.range_id(),
                    workflow_key,
                )
                .await
                .map_err(ServiceError::from)
        })
        .await?;
        let Some(record) = record else {
            return Ok(None);
        };
        let state: WorkflowMutableState = serde_json::from_value(record.state)
            .map_err(|e| ServiceError::internal(e.to_string()))?;
        let cached = CachedState {
            state,
            db_record_version: record.db_record_version,
        };
        slot.put(cached.clone());
        Ok(Some(cached))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_core::TaskCategoryRegistry;
    use kairos_persistence::{MemoryStore, StoreError};
    use serde_json::json;

    async fn engine_with_store() -> (HistoryEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let shard = ShardContext::acquire(
            store.clone(),
            1,
            "host-a",
            TaskCategoryRegistry::new_default(),
        )
        .await
        .unwrap();
        (HistoryEngine::new(shard), store)
    }

    fn key() -> WorkflowKey {
        WorkflowKey::new("ns", "wf", "run-1")
    }

    fn start_mutation(workflow_key: &WorkflowKey) -> MutationResult {
        MutationResult {
            state: WorkflowMutableState::new(workflow_key.clone(), vec![1]),
            tasks: vec![GeneratedTask {
                category: TaskCategory::Transfer,
                fire_time: None,
                payload: json!({"kind": "workflow_task"}),
            }],
        }
    }

    #[tokio::test]
    async fn test_first_commit_persists_state_and_tasks() {
        let (engine, store) = engine_with_store().await;
        let outcome = engine
            .execute(&key(), |state| {
                assert!(state.is_none());
                Ok(start_mutation(&key()))
            })
            .await
            .unwrap();
        assert_eq!(outcome.db_record_version, 1);
        assert_eq!(outcome.task_keys.len(), 1);
        assert_eq!(store.tasks_for(1, TaskCategory::Transfer.id()).len(), 1);

        // Tracker settled; ack cursor may advance past the committed key.
        engine.shard().tracker().drain().await;
    }

    #[tokio::test]
    async fn test_second_mutation_sees_committed_state() {
        let (engine, _) = engine_with_store().await;
        engine
            .execute(&key(), |_| Ok(start_mutation(&key())))
            .await
            .unwrap();

        let outcome = engine
            .execute(&key(), |state| {
                let mut state = state.expect("state must be cached").clone();
                let event_id = state.next_event_id();
                assert_eq!(event_id, 1);
                Ok(MutationResult {
                    state,
                    tasks: vec![],
                })
            })
            .await
            .unwrap();
        assert_eq!(outcome.db_record_version, 2);
    }

    #[tokio::test]
    async fn test_conditional_failure_maps_to_workflow_conflict() {
        let (engine, store) = engine_with_store().await;
        engine
            .execute(&key(), |_| Ok(start_mutation(&key())))
            .await
            .unwrap();

        store.fail_next_commit(StoreError::ConditionFailed("lost the race".into()));
        let err = engine
            .execute(&key(), |state| {
                Ok(MutationResult {
                    state: state.unwrap().clone(),
                    tasks: vec![GeneratedTask {
                        category: TaskCategory::Transfer,
                        fire_time: None,
                        payload: json!({}),
                    }],
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::WorkflowConflict(_)));

        // Definitely-not-inserted keys are released immediately.
        assert_eq!(
            engine.shard().tracker().min_task_key(TaskCategory::Transfer),
            None
        );
    }

    #[tokio::test]
    async fn test_unknown_failure_keeps_keys_tracked() {
        let (engine, store) = engine_with_store().await;
        engine
            .execute(&key(), |_| Ok(start_mutation(&key())))
            .await
            .unwrap();

        store.fail_next_commit(StoreError::Backend("connection reset".into()));
        let err = engine
            .execute(&key(), |state| {
                Ok(MutationResult {
                    state: state.unwrap().clone(),
                    tasks: vec![GeneratedTask {
                        category: TaskCategory::Transfer,
                        fire_time: None,
                        payload: json!({}),
                    }],
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));

        // The possibly-live key pins the category minimum.
        assert!(engine
            .shard()
            .tracker()
            .min_task_key(TaskCategory::Transfer)
            .is_some());
    }

    #[tokio::test]
    async fn test_mutation_error_commits_nothing() {
        let (engine, store) = engine_with_store().await;
        let err = engine
            .execute(&key(), |_| {
                Err::<MutationResult, _>(ServiceError::InvalidArgument("bad input".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidArgument(_)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_read_after_write() {
        let (engine, _) = engine_with_store().await;
        assert!(matches!(
            engine.read(&key()).await.unwrap_err(),
            ServiceError::NotFound(_)
        ));

        engine
            .execute(&key(), |_| Ok(start_mutation(&key())))
            .await
            .unwrap();
        let state = engine.read(&key()).await.unwrap();
        assert_eq!(state.workflow_key, key());
    }
}

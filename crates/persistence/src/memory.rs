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

//! In-memory store for tests.
//!
//! Honors the same fence and CAS semantics as the SQL backends, plus a
//! fault-injection hook so engine tests can exercise the unknown-outcome
//! path of the commit protocol.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    CommitRequest, ExecutionStore, NamespacePage, NamespaceRecord, NamespaceStore, ShardRecord,
    TaskRow, TaskStore, WorkflowStateRecord,
};
use async_trait::async_trait;
use kairos_core::{TaskKey, WorkflowKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    shards: HashMap<i32, ShardRecord>,
    workflows: HashMap<(i32, WorkflowKey), WorkflowStateRecord>,
    // (shard, category) -> key-ordered task rows
    tasks: HashMap<(i32, i32), BTreeMap<(i64, i64), TaskRow>>,
    namespaces: BTreeMap<String, NamespaceRecord>,
    notification_version: i64,
    fail_next_commit: Option<StoreError>,
    commits: u64,
}

fn task_sort_key(key: TaskKey) -> (i64, i64) {
    (key.fire_time.timestamp_millis(), key.task_id)
}

/// In-memory implementation of the store traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail with `err` without applying anything.
    pub fn fail_next_commit(&self, err: StoreError) {
        self.inner.lock().expect("store lock poisoned").fail_next_commit = Some(err);
    }

    /// Number of commits applied, for call-count assertions.
    pub fn commit_count(&self) -> u64 {
        self.inner.lock().expect("store lock poisoned").commits
    }

    /// Task rows currently live for a category, key order.
    pub fn tasks_for(&self, shard_id: i32, category_id: i32) -> Vec<TaskRow> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .tasks
            .get(&(shard_id, category_id))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn acquire_shard(&self, shard_id: i32, owner: &str) -> StoreResult<ShardRecord> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let record = inner.shards.entry(shard_id).or_insert_with(|| ShardRecord {
            shard_id,
            range_id: 0,
            owner: String::new(),
            ack_levels: BTreeMap::new(),
            last_assigned_keys: BTreeMap::new(),
        });
        record.range_id += 1;
        record.owner = owner.to_string();
        Ok(record.clone())
    }

    async fn get_shard(&self, shard_id: i32) -> StoreResult<ShardRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .shards
            .get(&shard_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", shard_id)))
    }

    async fn update_ack_level(
        &self,
        shard_id: i32,
        range_id: i64,
        category_id: i32,
        ack_level: TaskKey,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let record = inner
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", shard_id)))?;
        if record.range_id != range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id,
                request_range_id: range_id,
                current_range_id: record.range_id,
            });
        }
        record.ack_levels.insert(category_id, ack_level);
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        shard_id: i32,
        range_id: i64,
        workflow_key: &WorkflowKey,
    ) -> StoreResult<Option<WorkflowStateRecord>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        if let Some(shard) = inner.shards.get(&shard_id) {
            if shard.range_id != range_id {
                return Err(StoreError::ShardOwnershipLost {
                    shard_id,
                    request_range_id: range_id,
                    current_range_id: shard.range_id,
                });
            }
        }
        Ok(inner
            .workflows
            .get(&(shard_id, workflow_key.clone()))
            .cloned())
    }

    async fn commit(&self, request: CommitRequest) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(err) = inner.fail_next_commit.take() {
            return Err(err);
        }

        let shard = inner
            .shards
            .get(&request.shard_id)
            .ok_or_else(|| StoreError::NotFound(format!("shard {}", request.shard_id)))?;
        if shard.range_id != request.range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id: request.shard_id,
                request_range_id: request.range_id,
                current_range_id: shard.range_id,
            });
        }

        let wf_key = (
            request.shard_id,
            request.workflow_state.workflow_key.clone(),
        );
        let current_version = inner
            .workflows
            .get(&wf_key)
            .map(|r| r.db_record_version)
            .unwrap_or(0);
        if current_version != request.expected_db_record_version {
            return Err(StoreError::ConditionFailed(format!(
                "db record version mismatch: have {}, expected {}",
                current_version, request.expected_db_record_version
            )));
        }

        inner.workflows.insert(wf_key, request.workflow_state);
        for task in request.tasks {
            inner
                .tasks
                .entry((task.shard_id, task.category_id))
                .or_default()
                .insert(task_sort_key(task.key), task);
        }
        let shard = inner
            .shards
            .get_mut(&request.shard_id)
            .expect("shard checked above");
        for (category_id, key) in request.last_assigned_keys {
            shard.last_assigned_keys.insert(category_id, key);
        }
        inner.commits += 1;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn get_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        inclusive_min: TaskKey,
        exclusive_max: TaskKey,
        limit: usize,
    ) -> StoreResult<Vec<TaskRow>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let Some(rows) = inner.tasks.get(&(shard_id, category_id)) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range(task_sort_key(inclusive_min)..task_sort_key(exclusive_max))
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn range_delete_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        exclusive_max: TaskKey,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let Some(rows) = inner.tasks.get_mut(&(shard_id, category_id)) else {
            return Ok(0);
        };
        let keys: Vec<(i64, i64)> = rows
            .range(..task_sort_key(exclusive_max))
            .map(|(k, _)| *k)
            .collect();
        for k in &keys {
            rows.remove(k);
        }
        Ok(keys.len() as u64)
    }
}

#[async_trait]
impl NamespaceStore for MemoryStore {
    async fn create_namespace(&self, mut record: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.namespaces.contains_key(&record.name) {
            return Err(StoreError::ConditionFailed(format!(
                "namespace {} already exists",
                record.name
            )));
        }
        inner.notification_version += 1;
        record.notification_version = inner.notification_version;
        inner.namespaces.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn update_namespace(&self, mut record: NamespaceRecord) -> StoreResult<NamespaceRecord> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if !inner.namespaces.contains_key(&record.name) {
            return Err(StoreError::NotFound(format!("namespace {}", record.name)));
        }
        inner.notification_version += 1;
        record.notification_version = inner.notification_version;
        inner.namespaces.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn get_namespace_by_name(&self, name: &str) -> StoreResult<NamespaceRecord> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))
    }

    async fn delete_namespace(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .namespaces
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("namespace {}", name)))
    }

    async fn list_namespaces(
        &self,
        page_size: usize,
        page_token: Option<String>,
    ) -> StoreResult<NamespacePage> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let names: Vec<&NamespaceRecord> = match &page_token {
            Some(token) => inner
                .namespaces
                .range(token.clone()..)
                .skip(1)
                .map(|(_, v)| v)
                .collect(),
            None => inner.namespaces.values().collect(),
        };
        let page: Vec<NamespaceRecord> = names.into_iter().take(page_size).cloned().collect();
        let next_page_token = if page.len() == page_size {
            page.last().map(|r| r.name.clone())
        } else {
            None
        };
        Ok(NamespacePage {
            namespaces: page,
            next_page_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commit_request(shard_id: i32, range_id: i64, version: i64) -> CommitRequest {
        let workflow_key = WorkflowKey::new("ns", "wf", "run");
        CommitRequest {
            shard_id,
            range_id,
            workflow_state: WorkflowStateRecord {
                workflow_key: workflow_key.clone(),
                state: json!({"status": "running"}),
                db_record_version: version + 1,
            },
            expected_db_record_version: version,
            tasks: vec![TaskRow {
                shard_id,
                category_id: 1,
                key: TaskKey::new_immediate(100 + version),
                workflow_key,
                version_stamp: range_id,
                payload: json!({}),
            }],
            last_assigned_keys: BTreeMap::from([(1, TaskKey::new_immediate(100 + version))]),
        }
    }

    #[tokio::test]
    async fn test_acquire_bumps_range_id() {
        let store = MemoryStore::new();
        let first = store.acquire_shard(3, "host-a").await.unwrap();
        let second = store.acquire_shard(3, "host-b").await.unwrap();
        assert_eq!(first.range_id + 1, second.range_id);
        assert_eq!(second.owner, "host-b");
    }

    #[tokio::test]
    async fn test_stale_range_id_is_fenced() {
        let store = MemoryStore::new();
        let owned = store.acquire_shard(1, "host-a").await.unwrap();
        // Second owner takes over.
        store.acquire_shard(1, "host-b").await.unwrap();

        let err = store
            .commit(commit_request(1, owned.range_id, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ShardOwnershipLost { .. }));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_cas_rejects_concurrent_writer() {
        let store = MemoryStore::new();
        let shard = store.acquire_shard(1, "host-a").await.unwrap();
        store
            .commit(commit_request(1, shard.range_id, 0))
            .await
            .unwrap();

        // A second commit with the same expected version loses the race.
        let err = store
            .commit(commit_request(1, shard.range_id, 0))
            .await
            .unwrap_err();
        assert!(err.definitely_not_inserted());
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_task_range_delete_below_cursor() {
        let store = MemoryStore::new();
        let shard = store.acquire_shard(1, "host-a").await.unwrap();
        for version in 0..3 {
            store
                .commit(commit_request(1, shard.range_id, version))
                .await
                .unwrap();
        }

        let all = store
            .get_tasks(
                1,
                1,
                TaskKey::minimum(),
                TaskKey::maximum(),
                usize::MAX,
            )
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let deleted = store
            .range_delete_tasks(1, 1, TaskKey::new_immediate(102))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        let remaining = store.tasks_for(1, 1);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key.task_id, 102);
    }

    #[tokio::test]
    async fn test_namespace_pages_and_notification_versions() {
        let store = MemoryStore::new();
        for name in ["alpha", "beta", "gamma"] {
            store
                .create_namespace(NamespaceRecord {
                    id: format!("id-{}", name),
                    name: name.to_string(),
                    data: json!({}),
                    data_encoding: "json".into(),
                    notification_version: 0,
                })
                .await
                .unwrap();
        }

        let page1 = store.list_namespaces(2, None).await.unwrap();
        assert_eq!(page1.namespaces.len(), 2);
        let page2 = store
            .list_namespaces(2, page1.next_page_token.clone())
            .await
            .unwrap();
        assert_eq!(page2.namespaces.len(), 1);
        assert!(page2.next_page_token.is_none());

        // Updates keep bumping the global notification version.
        let updated = store
            .update_namespace(page2.namespaces[0].clone())
            .await
            .unwrap();
        assert_eq!(updated.notification_version, 4);
    }
}

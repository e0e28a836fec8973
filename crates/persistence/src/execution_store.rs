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

//! Sqlite execution and task stores.
//!
//! ## Commit protocol
//! One transaction writes the mutable-state row (conditional on the current
//! `db_record_version`), appends the generated task rows, and stores the
//! bumped per-category last-assigned keys, all after re-reading the shard
//! row and checking the caller's `range_id` against it. Any fence or CAS
//! failure rolls the transaction back, so a conditional failure guarantees
//! nothing landed.

use crate::error::{StoreError, StoreResult};
use crate::store::{
    CommitRequest, ExecutionStore, ShardRecord, TaskRow, TaskStore, WorkflowStateRecord,
};
use async_trait::async_trait;
use kairos_core::{TaskKey, WorkflowKey};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::BTreeMap;

/// Serialized portion of the shard row.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ShardData {
    ack_levels: BTreeMap<i32, TaskKey>,
    last_assigned_keys: BTreeMap<i32, TaskKey>,
}

/// Sqlite-backed execution/task store.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Wrap an existing pool. Call [`bootstrap`](Self::bootstrap) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create shard, execution and task tables.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS shards (\
             shard_id INTEGER NOT NULL PRIMARY KEY, \
             range_id INTEGER NOT NULL, \
             owner TEXT NOT NULL, \
             data BLOB NOT NULL)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS executions (\
             shard_id INTEGER NOT NULL, \
             namespace_id TEXT NOT NULL, \
             workflow_id TEXT NOT NULL, \
             run_id TEXT NOT NULL, \
             data BLOB NOT NULL, \
             data_encoding TEXT NOT NULL, \
             db_record_version INTEGER NOT NULL, \
             PRIMARY KEY (shard_id, namespace_id, workflow_id, run_id))",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (\
             shard_id INTEGER NOT NULL, \
             category_id INTEGER NOT NULL, \
             fire_time_ms INTEGER NOT NULL, \
             task_id INTEGER NOT NULL, \
             namespace_id TEXT NOT NULL, \
             workflow_id TEXT NOT NULL, \
             run_id TEXT NOT NULL, \
             version_stamp INTEGER NOT NULL, \
             data BLOB NOT NULL, \
             PRIMARY KEY (shard_id, category_id, fire_time_ms, task_id))",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn shard_row(
        executor: impl sqlx::SqliteExecutor<'_>,
        shard_id: i32,
    ) -> StoreResult<Option<(i64, String, ShardData)>> {
        let row = sqlx::query("SELECT range_id, owner, data FROM shards WHERE shard_id = ?")
            .bind(shard_id)
            .fetch_optional(executor)
            .await?;
        match row {
            Some(row) => {
                let data: Vec<u8> = row.get(2);
                Ok(Some((
                    row.get::<i64, _>(0),
                    row.get::<String, _>(1),
                    serde_json::from_slice(&data)?,
                )))
            }
            None => Ok(None),
        }
    }

    fn to_record(shard_id: i32, range_id: i64, owner: String, data: ShardData) -> ShardRecord {
        ShardRecord {
            shard_id,
            range_id,
            owner,
            ack_levels: data.ack_levels,
            last_assigned_keys: data.last_assigned_keys,
        }
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn acquire_shard(&self, shard_id: i32, owner: &str) -> StoreResult<ShardRecord> {
        let mut tx = self.pool.begin().await?;
        let record = match Self::shard_row(&mut *tx, shard_id).await? {
            Some((range_id, _, data)) => {
                let new_range = range_id + 1;
                sqlx::query("UPDATE shards SET range_id = ?, owner = ? WHERE shard_id = ?")
                    .bind(new_range)
                    .bind(owner)
                    .bind(shard_id)
                    .execute(&mut *tx)
                    .await?;
                Self::to_record(shard_id, new_range, owner.to_string(), data)
            }
            None => {
                let data = ShardData::default();
                sqlx::query(
                    "INSERT INTO shards (shard_id, range_id, owner, data) VALUES (?, 1, ?, ?)",
                )
                .bind(shard_id)
                .bind(owner)
                .bind(serde_json::to_vec(&data)?)
                .execute(&mut *tx)
                .await?;
                Self::to_record(shard_id, 1, owner.to_string(), data)
            }
        };
        tx.commit().await?;
        Ok(record)
    }

    async fn get_shard(&self, shard_id: i32) -> StoreResult<ShardRecord> {
        match Self::shard_row(&self.pool, shard_id).await? {
            Some((range_id, owner, data)) => Ok(Self::to_record(shard_id, range_id, owner, data)),
            None => Err(StoreError::NotFound(format!("shard {}", shard_id))),
        }
    }

    async fn update_ack_level(
        &self,
        shard_id: i32,
        range_id: i64,
        category_id: i32,
        ack_level: TaskKey,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let Some((current_range, _, mut data)) = Self::shard_row(&mut *tx, shard_id).await? else {
            return Err(StoreError::NotFound(format!("shard {}", shard_id)));
        };
        if current_range != range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id,
                request_range_id: range_id,
                current_range_id: current_range,
            });
        }
        data.ack_levels.insert(category_id, ack_level);
        sqlx::query("UPDATE shards SET data = ? WHERE shard_id = ?")
            .bind(serde_json::to_vec(&data)?)
            .bind(shard_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        shard_id: i32,
        range_id: i64,
        workflow_key: &WorkflowKey,
    ) -> StoreResult<Option<WorkflowStateRecord>> {
        if let Some((current_range, _, _)) = Self::shard_row(&self.pool, shard_id).await? {
            if current_range != range_id {
                return Err(StoreError::ShardOwnershipLost {
                    shard_id,
                    request_range_id: range_id,
                    current_range_id: current_range,
                });
            }
        }
        let row = sqlx::query(
            "SELECT data, db_record_version FROM executions \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ?",
        )
        .bind(shard_id)
        .bind(&workflow_key.namespace_id)
        .bind(&workflow_key.workflow_id)
        .bind(&workflow_key.run_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let data: Vec<u8> = row.get(0);
                Ok(Some(WorkflowStateRecord {
                    workflow_key: workflow_key.clone(),
                    state: serde_json::from_slice(&data)?,
                    db_record_version: row.get(1),
                }))
            }
            None => Ok(None),
        }
    }

    async fn commit(&self, request: CommitRequest) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let Some((current_range, _, mut data)) =
            Self::shard_row(&mut *tx, request.shard_id).await?
        else {
            return Err(StoreError::NotFound(format!("shard {}", request.shard_id)));
        };
        if current_range != request.range_id {
            return Err(StoreError::ShardOwnershipLost {
                shard_id: request.shard_id,
                request_range_id: request.range_id,
                current_range_id: current_range,
            });
        }

        let workflow_key = &request.workflow_state.workflow_key;
        let state_blob = serde_json::to_vec(&request.workflow_state.state)?;
        let applied = if request.expected_db_record_version == 0 {
            sqlx::query(
                "INSERT OR IGNORE INTO executions \
                 (shard_id, namespace_id, workflow_id, run_id, data, data_encoding, db_record_version) \
                 VALUES (?, ?, ?, ?, ?, 'json', ?)",
            )
            .bind(request.shard_id)
            .bind(&workflow_key.namespace_id)
            .bind(&workflow_key.workflow_id)
            .bind(&workflow_key.run_id)
            .bind(&state_blob)
            .bind(request.workflow_state.db_record_version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE executions SET data = ?, db_record_version = ? \
                 WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ? \
                 AND db_record_version = ?",
            )
            .bind(&state_blob)
            .bind(request.workflow_state.db_record_version)
            .bind(request.shard_id)
            .bind(&workflow_key.namespace_id)
            .bind(&workflow_key.workflow_id)
            .bind(&workflow_key.run_id)
            .bind(request.expected_db_record_version)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };
        if applied == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "db record version mismatch for {}, expected {}",
                workflow_key, request.expected_db_record_version
            )));
        }

        for task in &request.tasks {
            sqlx::query(
                "INSERT INTO tasks \
                 (shard_id, category_id, fire_time_ms, task_id, namespace_id, workflow_id, run_id, \
                  version_stamp, data) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(task.shard_id)
            .bind(task.category_id)
            .bind(task.key.fire_time.timestamp_millis())
            .bind(task.key.task_id)
            .bind(&task.workflow_key.namespace_id)
            .bind(&task.workflow_key.workflow_id)
            .bind(&task.workflow_key.run_id)
            .bind(task.version_stamp)
            .bind(serde_json::to_vec(&task.payload)?)
            .execute(&mut *tx)
            .await?;
        }

        for (category_id, key) in &request.last_assigned_keys {
            data.last_assigned_keys.insert(*category_id, *key);
        }
        sqlx::query("UPDATE shards SET data = ? WHERE shard_id = ?")
            .bind(serde_json::to_vec(&data)?)
            .bind(request.shard_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteExecutionStore {
    async fn get_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        inclusive_min: TaskKey,
        exclusive_max: TaskKey,
        limit: usize,
    ) -> StoreResult<Vec<TaskRow>> {
        let rows = sqlx::query(
            "SELECT fire_time_ms, task_id, namespace_id, workflow_id, run_id, version_stamp, data \
             FROM tasks \
             WHERE shard_id = ? AND category_id = ? \
             AND (fire_time_ms > ? OR (fire_time_ms = ? AND task_id >= ?)) \
             AND (fire_time_ms < ? OR (fire_time_ms = ? AND task_id < ?)) \
             ORDER BY fire_time_ms, task_id LIMIT ?",
        )
        .bind(shard_id)
        .bind(category_id)
        .bind(inclusive_min.fire_time.timestamp_millis())
        .bind(inclusive_min.fire_time.timestamp_millis())
        .bind(inclusive_min.task_id)
        .bind(exclusive_max.fire_time.timestamp_millis())
        .bind(exclusive_max.fire_time.timestamp_millis())
        .bind(exclusive_max.task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let fire_time_ms: i64 = row.get(0);
                let data: Vec<u8> = row.get(6);
                Ok(TaskRow {
                    shard_id,
                    category_id,
                    key: TaskKey {
                        fire_time: chrono::TimeZone::timestamp_millis_opt(
                            &chrono::Utc,
                            fire_time_ms,
                        )
                        .single()
                        .ok_or_else(|| {
                            StoreError::Serialization(format!(
                                "invalid fire time {}",
                                fire_time_ms
                            ))
                        })?,
                        task_id: row.get(1),
                    },
                    workflow_key: WorkflowKey::new(
                        row.get::<String, _>(2),
                        row.get::<String, _>(3),
                        row.get::<String, _>(4),
                    ),
                    version_stamp: row.get(5),
                    payload: serde_json::from_slice(&data)?,
                })
            })
            .collect()
    }

    async fn range_delete_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        exclusive_max: TaskKey,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM tasks WHERE shard_id = ? AND category_id = ? \
             AND (fire_time_ms < ? OR (fire_time_ms = ? AND task_id < ?))",
        )
        .bind(shard_id)
        .bind(category_id)
        .bind(exclusive_max.fire_time.timestamp_millis())
        .bind(exclusive_max.fire_time.timestamp_millis())
        .bind(exclusive_max.task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

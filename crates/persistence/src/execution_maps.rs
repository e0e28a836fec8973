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

//! Workflow sub-map row operations.
//!
//! ## Purpose
//! The five pending-entry maps of a workflow (activity, timer, child
//! execution, request-cancel, signal) share an identical key/value shape, so
//! query generation is templated over `(table, map-key column)`. The
//! signals-requested set shares the primary key with no payload.
//!
//! Composite primary key on every row:
//! `(shard_id, namespace_id, workflow_id, run_id, map_key)`.

use crate::dialect::Dialect;
use crate::error::StoreResult;
use kairos_core::WorkflowKey;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// The five templated sub-maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Pending activities, keyed by scheduled event id.
    ActivityInfo,
    /// Pending timers, keyed by timer id.
    TimerInfo,
    /// Pending child executions, keyed by initiated event id.
    ChildExecutionInfo,
    /// Pending external-cancel requests, keyed by initiated event id.
    RequestCancelInfo,
    /// Pending external signals, keyed by initiated event id.
    SignalInfo,
}

impl MapKind {
    /// Backing table name.
    pub fn table(&self) -> &'static str {
        match self {
            MapKind::ActivityInfo => "activity_info_maps",
            MapKind::TimerInfo => "timer_info_maps",
            MapKind::ChildExecutionInfo => "child_execution_info_maps",
            MapKind::RequestCancelInfo => "request_cancel_info_maps",
            MapKind::SignalInfo => "signal_info_maps",
        }
    }

    /// Name of the map-key column.
    pub fn map_key_column(&self) -> &'static str {
        match self {
            MapKind::ActivityInfo => "schedule_id",
            MapKind::TimerInfo => "timer_id",
            MapKind::ChildExecutionInfo => "initiated_id",
            MapKind::RequestCancelInfo => "initiated_id",
            MapKind::SignalInfo => "initiated_id",
        }
    }

    /// All kinds, for schema bootstrap.
    pub fn all() -> [MapKind; 5] {
        [
            MapKind::ActivityInfo,
            MapKind::TimerInfo,
            MapKind::ChildExecutionInfo,
            MapKind::RequestCancelInfo,
            MapKind::SignalInfo,
        ]
    }
}

/// One sub-map row. Timer ids are strings; the numeric map keys are rendered
/// in decimal so all five maps share this shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionMapRow {
    /// Owning shard.
    pub shard_id: i32,
    /// Owning workflow.
    pub workflow_key: WorkflowKey,
    /// Map key within the workflow.
    pub map_key: String,
    /// Serialized entry.
    pub data: String,
    /// Encoding tag of `data`.
    pub data_encoding: String,
}

/// Row filter addressing one workflow's entries.
#[derive(Debug, Clone)]
pub struct ExecutionMapFilter {
    /// Owning shard.
    pub shard_id: i32,
    /// Owning workflow.
    pub workflow_key: WorkflowKey,
}

const SIGNALS_REQUESTED_TABLE: &str = "signals_requested_sets";

/// Sqlite-backed sub-map store.
///
/// Server dialects reuse the same query templates through [`Dialect`]; only
/// the pool type and upsert clause differ.
#[derive(Clone)]
pub struct SqliteExecutionMaps {
    pool: SqlitePool,
}

impl SqliteExecutionMaps {
    /// Wrap an existing pool. Call [`bootstrap`](Self::bootstrap) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the five map tables and the signals-requested set.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        for kind in MapKind::all() {
            let ddl = format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 shard_id INTEGER NOT NULL, \
                 namespace_id TEXT NOT NULL, \
                 workflow_id TEXT NOT NULL, \
                 run_id TEXT NOT NULL, \
                 {map_key} TEXT NOT NULL, \
                 data BLOB NOT NULL, \
                 data_encoding TEXT NOT NULL, \
                 PRIMARY KEY (shard_id, namespace_id, workflow_id, run_id, {map_key}))",
                table = kind.table(),
                map_key = kind.map_key_column(),
            );
            sqlx::query(&ddl).execute(&self.pool).await?;
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             shard_id INTEGER NOT NULL, \
             namespace_id TEXT NOT NULL, \
             workflow_id TEXT NOT NULL, \
             run_id TEXT NOT NULL, \
             signal_id TEXT NOT NULL, \
             PRIMARY KEY (shard_id, namespace_id, workflow_id, run_id, signal_id))",
            table = SIGNALS_REQUESTED_TABLE,
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert a batch of rows into one map.
    pub async fn replace_into(&self, kind: MapKind, rows: &[ExecutionMapRow]) -> StoreResult<()> {
        let query_text = Dialect::Sqlite.upsert_query(
            kind.table(),
            &[
                "shard_id",
                "namespace_id",
                "workflow_id",
                "run_id",
                kind.map_key_column(),
            ],
            &["data", "data_encoding"],
        );
        for row in rows {
            sqlx::query(&query_text)
                .bind(row.shard_id)
                .bind(&row.workflow_key.namespace_id)
                .bind(&row.workflow_key.workflow_id)
                .bind(&row.workflow_key.run_id)
                .bind(&row.map_key)
                .bind(row.data.as_bytes())
                .bind(&row.data_encoding)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// All of a workflow's entries in one map, key order.
    pub async fn select_all(
        &self,
        kind: MapKind,
        filter: &ExecutionMapFilter,
    ) -> StoreResult<Vec<ExecutionMapRow>> {
        let query_text = format!(
            "SELECT {map_key}, data, data_encoding FROM {table} \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ? \
             ORDER BY {map_key}",
            table = kind.table(),
            map_key = kind.map_key_column(),
        );
        let rows = sqlx::query(&query_text)
            .bind(filter.shard_id)
            .bind(&filter.workflow_key.namespace_id)
            .bind(&filter.workflow_key.workflow_id)
            .bind(&filter.workflow_key.run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| ExecutionMapRow {
                shard_id: filter.shard_id,
                workflow_key: filter.workflow_key.clone(),
                map_key: row.get::<String, _>(0),
                data: String::from_utf8_lossy(row.get::<Vec<u8>, _>(1).as_slice()).into_owned(),
                data_encoding: row.get::<String, _>(2),
            })
            .collect())
    }

    /// Delete specific entries by map key.
    pub async fn delete(
        &self,
        kind: MapKind,
        filter: &ExecutionMapFilter,
        map_keys: &[String],
    ) -> StoreResult<u64> {
        if map_keys.is_empty() {
            return Ok(0);
        }
        let query_text = format!(
            "DELETE FROM {table} \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ? \
             AND {map_key} IN ({placeholders})",
            table = kind.table(),
            map_key = kind.map_key_column(),
            placeholders = Dialect::Sqlite.placeholders(5, map_keys.len()),
        );
        let mut query = sqlx::query(&query_text)
            .bind(filter.shard_id)
            .bind(&filter.workflow_key.namespace_id)
            .bind(&filter.workflow_key.workflow_id)
            .bind(&filter.workflow_key.run_id);
        for key in map_keys {
            query = query.bind(key);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Delete every entry a workflow holds in one map.
    pub async fn delete_all(
        &self,
        kind: MapKind,
        filter: &ExecutionMapFilter,
    ) -> StoreResult<u64> {
        let query_text = format!(
            "DELETE FROM {table} \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ?",
            table = kind.table(),
        );
        let result = sqlx::query(&query_text)
            .bind(filter.shard_id)
            .bind(&filter.workflow_key.namespace_id)
            .bind(&filter.workflow_key.workflow_id)
            .bind(&filter.workflow_key.run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Record requested signal ids. Same key shape, no payload.
    pub async fn insert_signals_requested(
        &self,
        filter: &ExecutionMapFilter,
        signal_ids: &[String],
    ) -> StoreResult<()> {
        let query_text = format!(
            "REPLACE INTO {table} (shard_id, namespace_id, workflow_id, run_id, signal_id) \
             VALUES (?, ?, ?, ?, ?)",
            table = SIGNALS_REQUESTED_TABLE,
        );
        for signal_id in signal_ids {
            sqlx::query(&query_text)
                .bind(filter.shard_id)
                .bind(&filter.workflow_key.namespace_id)
                .bind(&filter.workflow_key.workflow_id)
                .bind(&filter.workflow_key.run_id)
                .bind(signal_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Requested signal ids for a workflow, sorted.
    pub async fn select_signals_requested(
        &self,
        filter: &ExecutionMapFilter,
    ) -> StoreResult<Vec<String>> {
        let query_text = format!(
            "SELECT signal_id FROM {table} \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ? \
             ORDER BY signal_id",
            table = SIGNALS_REQUESTED_TABLE,
        );
        let rows = sqlx::query(&query_text)
            .bind(filter.shard_id)
            .bind(&filter.workflow_key.namespace_id)
            .bind(&filter.workflow_key.workflow_id)
            .bind(&filter.workflow_key.run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }

    /// Remove specific requested signal ids.
    pub async fn delete_signals_requested(
        &self,
        filter: &ExecutionMapFilter,
        signal_ids: &[String],
    ) -> StoreResult<u64> {
        if signal_ids.is_empty() {
            return Ok(0);
        }
        let query_text = format!(
            "DELETE FROM {table} \
             WHERE shard_id = ? AND namespace_id = ? AND workflow_id = ? AND run_id = ? \
             AND signal_id IN ({placeholders})",
            table = SIGNALS_REQUESTED_TABLE,
            placeholders = Dialect::Sqlite.placeholders(5, signal_ids.len()),
        );
        let mut query = sqlx::query(&query_text)
            .bind(filter.shard_id)
            .bind(&filter.workflow_key.namespace_id)
            .bind(&filter.workflow_key.workflow_id)
            .bind(&filter.workflow_key.run_id);
        for signal_id in signal_ids {
            query = query.bind(signal_id);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

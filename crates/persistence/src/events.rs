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

//! History node and tree tables.
//!
//! ## Layout
//! Node rows are keyed by `(shard_id, tree_id, branch_id, node_id, txn_id)`.
//! `txn_id` is stored with a negated sign so the primary-key index, sorted
//! ascending, returns the newest transaction of a node first on forward
//! scans; no separate descending index is needed. Range reads span
//! `[min_node_id, max_node_id)` and use `txn_id` only to tiebreak within a
//! node.

use crate::error::StoreResult;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// One history-node row. `txn_id` is in caller sign; negation happens at the
/// storage boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryNodeRow {
    /// Owning shard.
    pub shard_id: i32,
    /// Event tree (usually the workflow id hash).
    pub tree_id: String,
    /// Branch within the tree.
    pub branch_id: String,
    /// First event id in the node's batch.
    pub node_id: i64,
    /// Transaction that wrote the previous node version.
    pub prev_txn_id: i64,
    /// Transaction that wrote this row.
    pub txn_id: i64,
    /// Serialized event batch.
    pub data: Vec<u8>,
    /// Encoding tag of `data`.
    pub data_encoding: String,
}

/// Range-read filter over one branch.
#[derive(Debug, Clone)]
pub struct HistoryNodeSelectFilter {
    /// Owning shard.
    pub shard_id: i32,
    /// Event tree.
    pub tree_id: String,
    /// Branch within the tree.
    pub branch_id: String,
    /// Inclusive lower node bound.
    pub min_node_id: i64,
    /// Transaction floor within `min_node_id`.
    pub min_txn_id: i64,
    /// Exclusive upper node bound.
    pub max_node_id: i64,
    /// Newest-first instead of oldest-first.
    pub reverse_order: bool,
    /// Page size.
    pub page_size: i64,
}

/// One history-tree row describing a branch.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryTreeRow {
    /// Owning shard.
    pub shard_id: i32,
    /// Event tree.
    pub tree_id: String,
    /// Branch within the tree.
    pub branch_id: String,
    /// Serialized branch metadata.
    pub data: Vec<u8>,
    /// Encoding tag of `data`.
    pub data_encoding: String,
}

/// Sqlite-backed history event store.
#[derive(Clone)]
pub struct SqliteHistoryEventStore {
    pool: SqlitePool,
}

impl SqliteHistoryEventStore {
    /// Wrap an existing pool. Call [`bootstrap`](Self::bootstrap) once before use.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create node and tree tables.
    pub async fn bootstrap(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS history_node (\
             shard_id INTEGER NOT NULL, \
             tree_id TEXT NOT NULL, \
             branch_id TEXT NOT NULL, \
             node_id INTEGER NOT NULL, \
             prev_txn_id INTEGER NOT NULL, \
             txn_id INTEGER NOT NULL, \
             data BLOB NOT NULL, \
             data_encoding TEXT NOT NULL, \
             PRIMARY KEY (shard_id, tree_id, branch_id, node_id, txn_id))",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS history_tree (\
             shard_id INTEGER NOT NULL, \
             tree_id TEXT NOT NULL, \
             branch_id TEXT NOT NULL, \
             data BLOB NOT NULL, \
             data_encoding TEXT NOT NULL, \
             PRIMARY KEY (shard_id, tree_id, branch_id))",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Insert a node row. `txn_id` is negated within the database.
    pub async fn insert_node(&self, row: &HistoryNodeRow) -> StoreResult<()> {
        sqlx::query(
            "REPLACE INTO history_node \
             (shard_id, tree_id, branch_id, node_id, prev_txn_id, txn_id, data, data_encoding) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(row.shard_id)
        .bind(&row.tree_id)
        .bind(&row.branch_id)
        .bind(row.node_id)
        .bind(row.prev_txn_id)
        .bind(-row.txn_id)
        .bind(&row.data)
        .bind(&row.data_encoding)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Range-read node rows for a branch.
    pub async fn range_select_nodes(
        &self,
        filter: &HistoryNodeSelectFilter,
    ) -> StoreResult<Vec<HistoryNodeRow>> {
        let (query_text, negated_txn) = if filter.reverse_order {
            (
                "SELECT node_id, prev_txn_id, txn_id, data, data_encoding FROM history_node \
                 WHERE shard_id = ? AND tree_id = ? AND branch_id = ? \
                 AND node_id >= ? AND node_id < ? \
                 ORDER BY node_id DESC, txn_id DESC LIMIT ?",
                0i64,
            )
        } else {
            // The floor is negated to match storage sign: a caller txn
            // strictly above min_txn_id is a stored txn strictly below
            // -min_txn_id.
            (
                "SELECT node_id, prev_txn_id, txn_id, data, data_encoding FROM history_node \
                 WHERE shard_id = ? AND tree_id = ? AND branch_id = ? \
                 AND ((node_id = ? AND txn_id < ?) OR node_id > ?) AND node_id < ? \
                 ORDER BY node_id, txn_id LIMIT ?",
                -filter.min_txn_id,
            )
        };

        let rows = if filter.reverse_order {
            sqlx::query(query_text)
                .bind(filter.shard_id)
                .bind(&filter.tree_id)
                .bind(&filter.branch_id)
                .bind(filter.min_node_id)
                .bind(filter.max_node_id)
                .bind(filter.page_size)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query(query_text)
                .bind(filter.shard_id)
                .bind(&filter.tree_id)
                .bind(&filter.branch_id)
                .bind(filter.min_node_id)
                .bind(negated_txn)
                .bind(filter.min_node_id)
                .bind(filter.max_node_id)
                .bind(filter.page_size)
                .fetch_all(&self.pool)
                .await?
        };

        Ok(rows
            .into_iter()
            .map(|row| HistoryNodeRow {
                shard_id: filter.shard_id,
                tree_id: filter.tree_id.clone(),
                branch_id: filter.branch_id.clone(),
                node_id: row.get::<i64, _>(0),
                prev_txn_id: row.get::<i64, _>(1),
                // Undo the storage-side negation.
                txn_id: -row.get::<i64, _>(2),
                data: row.get::<Vec<u8>, _>(3),
                data_encoding: row.get::<String, _>(4),
            })
            .collect())
    }

    /// Delete every node with `node_id >= min_node_id` on a branch.
    pub async fn range_delete_nodes(
        &self,
        shard_id: i32,
        tree_id: &str,
        branch_id: &str,
        min_node_id: i64,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM history_node \
             WHERE shard_id = ? AND tree_id = ? AND branch_id = ? AND node_id >= ?",
        )
        .bind(shard_id)
        .bind(tree_id)
        .bind(branch_id)
        .bind(min_node_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Upsert a branch row.
    pub async fn insert_tree(&self, row: &HistoryTreeRow) -> StoreResult<()> {
        sqlx::query(
            "REPLACE INTO history_tree (shard_id, tree_id, branch_id, data, data_encoding) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(row.shard_id)
        .bind(&row.tree_id)
        .bind(&row.branch_id)
        .bind(&row.data)
        .bind(&row.data_encoding)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All branches of a tree.
    pub async fn select_tree(
        &self,
        shard_id: i32,
        tree_id: &str,
    ) -> StoreResult<Vec<HistoryTreeRow>> {
        let rows = sqlx::query(
            "SELECT branch_id, data, data_encoding FROM history_tree \
             WHERE shard_id = ? AND tree_id = ? ORDER BY branch_id",
        )
        .bind(shard_id)
        .bind(tree_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| HistoryTreeRow {
                shard_id,
                tree_id: tree_id.to_string(),
                branch_id: row.get::<String, _>(0),
                data: row.get::<Vec<u8>, _>(1),
                data_encoding: row.get::<String, _>(2),
            })
            .collect())
    }

    /// Delete a branch row.
    pub async fn delete_tree(
        &self,
        shard_id: i32,
        tree_id: &str,
        branch_id: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM history_tree WHERE shard_id = ? AND tree_id = ? AND branch_id = ?",
        )
        .bind(shard_id)
        .bind(tree_id)
        .bind(branch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

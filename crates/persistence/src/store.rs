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

//! Typed store traits the history engine and registry depend on.
//!
//! ## Purpose
//! Core components never see SQL; they program against these capability
//! traits. The sqlite-backed implementations live in this crate, the
//! in-memory one backs unit tests, and server dialects plug in behind the
//! same shapes.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use kairos_core::{TaskKey, WorkflowKey};
use serde_json::Value;
use std::collections::BTreeMap;

/// Persisted shard row.
///
/// `range_id` is the ownership fence: it is bumped on every acquisition, and
/// any write carrying a stale value is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRecord {
    /// Dense shard id in `[0, shard_count)`.
    pub shard_id: i32,
    /// Monotonic fence, bumped per acquisition.
    pub range_id: i64,
    /// Identity of the current owner, informational.
    pub owner: String,
    /// Committed ack cursor per task-category id.
    pub ack_levels: BTreeMap<i32, TaskKey>,
    /// Highest task key handed out per task-category id.
    pub last_assigned_keys: BTreeMap<i32, TaskKey>,
}

/// Persisted workflow mutable-state row.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowStateRecord {
    /// Key of the execution.
    pub workflow_key: WorkflowKey,
    /// Opaque serialized mutable state.
    pub state: Value,
    /// Optimistic-concurrency version; incremented on every committed write.
    pub db_record_version: i64,
}

/// Persisted task row, append-only within its category.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRow {
    /// Owning shard.
    pub shard_id: i32,
    /// Stable category id.
    pub category_id: i32,
    /// Total-order key within the category.
    pub key: TaskKey,
    /// Workflow the task belongs to.
    pub workflow_key: WorkflowKey,
    /// Version stamp from the emitting shard's clock.
    pub version_stamp: i64,
    /// Opaque serialized task payload.
    pub payload: Value,
}

/// One atomic persistence transaction from the history engine commit path:
/// the new mutable-state row (CAS on `expected_db_record_version`), the
/// generated task rows, and the bumped last-assigned keys, all fenced by the
/// shard's `range_id`.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// Shard issuing the commit.
    pub shard_id: i32,
    /// Fence; must match the persisted shard row.
    pub range_id: i64,
    /// New mutable state (with the incremented `db_record_version`).
    pub workflow_state: WorkflowStateRecord,
    /// Version the persisted row must still have for the CAS to succeed.
    /// Zero means the row must not exist yet.
    pub expected_db_record_version: i64,
    /// Generated tasks to append.
    pub tasks: Vec<TaskRow>,
    /// Per-category last-assigned keys after this commit.
    pub last_assigned_keys: BTreeMap<i32, TaskKey>,
}

/// Shard and workflow mutable-state operations.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load the shard row, creating it on first acquisition, and bump its
    /// range id to fence out any previous owner.
    async fn acquire_shard(&self, shard_id: i32, owner: &str) -> StoreResult<ShardRecord>;

    /// Read the shard row without acquiring.
    async fn get_shard(&self, shard_id: i32) -> StoreResult<ShardRecord>;

    /// Persist a new ack cursor for a category, fenced by `range_id`.
    async fn update_ack_level(
        &self,
        shard_id: i32,
        range_id: i64,
        category_id: i32,
        ack_level: TaskKey,
    ) -> StoreResult<()>;

    /// Fetch a workflow's mutable state, fenced by `range_id`.
    async fn get_workflow_state(
        &self,
        shard_id: i32,
        range_id: i64,
        workflow_key: &WorkflowKey,
    ) -> StoreResult<Option<WorkflowStateRecord>>;

    /// Apply one commit transaction atomically.
    ///
    /// Fails with [`StoreError::ShardOwnershipLost`] on a stale range id and
    /// [`StoreError::ConditionFailed`] on a db-record-version mismatch; both
    /// guarantee nothing was written.
    async fn commit(&self, request: CommitRequest) -> StoreResult<()>;
}

/// Task-row reads and cursor-driven deletion.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks in `[inclusive_min, exclusive_max)` for a category, key order,
    /// up to `limit` rows.
    async fn get_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        inclusive_min: TaskKey,
        exclusive_max: TaskKey,
        limit: usize,
    ) -> StoreResult<Vec<TaskRow>>;

    /// Delete every task with key strictly below `exclusive_max`. Returns
    /// the number of rows removed.
    async fn range_delete_tasks(
        &self,
        shard_id: i32,
        category_id: i32,
        exclusive_max: TaskKey,
    ) -> StoreResult<u64>;
}

/// Persisted namespace row; the blob is opaque to this layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceRecord {
    /// Namespace id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Serialized namespace detail.
    pub data: Value,
    /// Encoding tag of `data`.
    pub data_encoding: String,
    /// Monotonic version across all namespace mutations.
    pub notification_version: i64,
}

/// A page of namespace rows.
#[derive(Debug, Clone, Default)]
pub struct NamespacePage {
    /// Rows in name order.
    pub namespaces: Vec<NamespaceRecord>,
    /// Token for the next page; `None` when exhausted.
    pub next_page_token: Option<String>,
}

/// Namespace table operations.
#[async_trait]
pub trait NamespaceStore: Send + Sync {
    /// Insert a new namespace, stamping it with the next notification
    /// version. Fails with `ConditionFailed` if the name exists.
    async fn create_namespace(&self, record: NamespaceRecord) -> StoreResult<NamespaceRecord>;

    /// Replace an existing namespace's blob, bumping the global notification
    /// version under the metadata row lock.
    async fn update_namespace(&self, record: NamespaceRecord) -> StoreResult<NamespaceRecord>;

    /// Fetch a namespace by name.
    async fn get_namespace_by_name(&self, name: &str) -> StoreResult<NamespaceRecord>;

    /// Hard-delete a namespace row (used after retention of deleted state).
    async fn delete_namespace(&self, name: &str) -> StoreResult<()>;

    /// List namespaces in name order, including deleted/deprecated ones.
    async fn list_namespaces(
        &self,
        page_size: usize,
        page_token: Option<String>,
    ) -> StoreResult<NamespacePage>;
}

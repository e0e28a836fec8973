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

//! Store error types.
//!
//! The distinction that matters to callers is between a *conditional* failure
//! (the write definitely did not land; safe to treat its task keys as free)
//! and everything else (the write may or may not be live in storage; ack
//! cursors must stay conservative).

use kairos_core::ServiceError;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Conditional update failed; the write was definitely not applied.
    #[error("Condition failed: {0}")]
    ConditionFailed(String),

    /// The caller's shard range id is stale; ownership has moved.
    #[error("Shard {shard_id} ownership lost: request range {request_range_id}, current range {current_range_id}")]
    ShardOwnershipLost {
        /// Shard whose fence rejected the write.
        shard_id: i32,
        /// Range id the request carried.
        request_range_id: i64,
        /// Range id currently persisted.
        current_range_id: i64,
    },

    /// Row not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization of a persisted blob failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend failure with unknown write outcome.
    #[error("Storage error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failed write is guaranteed absent from storage.
    ///
    /// Only conditional failures qualify; backend errors leave the outcome
    /// unknown and must be treated as possibly-live.
    pub fn definitely_not_inserted(&self) -> bool {
        matches!(
            self,
            StoreError::ConditionFailed(_) | StoreError::ShardOwnershipLost { .. }
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed(msg) => ServiceError::WorkflowConflict(msg),
            StoreError::ShardOwnershipLost { shard_id, .. } => ServiceError::ShardOwnershipLost {
                shard_id,
                owner_hint: String::new(),
            },
            StoreError::NotFound(msg) => ServiceError::NotFound(msg),
            StoreError::Serialization(msg) => ServiceError::Internal(msg),
            StoreError::Backend(msg) => ServiceError::Unavailable(msg),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

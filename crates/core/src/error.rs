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

//! Service error taxonomy shared across all Kairos components.
//!
//! ## Purpose
//! Errors that cross component boundaries are drawn from a single closed set
//! so that retry policy, redirection and wire mapping can be decided from the
//! error alone, without knowing which subsystem produced it.
//!
//! ## Propagation rules
//! - Transient errors (`Unavailable`, `ResourceExhausted`, `DeadlineExceeded`,
//!   `Canceled`) are retried locally with bounded exponential backoff until
//!   the caller's deadline.
//! - Precondition and not-found errors are returned verbatim.
//! - Ownership errors trigger one transparent redirect at the caching
//!   redirector, after which they surface to the caller.
//! - `Internal` indicates an invariant violation and is never a retry signal.

use serde::{Deserialize, Serialize};

/// Errors that cross Kairos component boundaries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ServiceError {
    /// The request is malformed independent of system state.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well-formed but the current state forbids it.
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// The named entity (namespace, workflow, version, rule source) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The addressed shard is no longer owned by the host that served the request.
    ///
    /// `owner_hint` carries the new owner's address when the old owner knows
    /// it, and is empty otherwise. The caching redirector uses the hint to
    /// repoint its cache before retrying once.
    #[error("Shard {shard_id} ownership lost (new owner: {owner_hint:?})")]
    ShardOwnershipLost {
        /// Shard whose ownership moved.
        shard_id: i32,
        /// Address of the new owner; empty when unknown.
        owner_hint: String,
    },

    /// The namespace is mid-handover between clusters; do not retry locally.
    #[error("Namespace handover in progress: {0}")]
    NamespaceHandover(String),

    /// The caller's view of a sub-state machine is older than persisted state.
    #[error("Stale reference: persisted transition count {persisted} exceeds ref {referenced}")]
    StaleReference {
        /// Transition count recorded in the caller's reference.
        referenced: u64,
        /// Transition count currently persisted.
        persisted: u64,
    },

    /// Optimistic-concurrency failure on a workflow mutable-state write.
    #[error("Workflow update conflict: {0}")]
    WorkflowConflict(String),

    /// Transport or backend unavailability.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Admission control or quota rejection.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The caller's deadline elapsed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The caller's context was cancelled.
    #[error("Canceled")]
    Canceled,

    /// Invariant violation. Logged with the workflow key and returned.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Whether a local bounded-backoff retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Unavailable(_) | ServiceError::ResourceExhausted(_)
        )
    }

    /// Whether this error terminates the current operation but should make
    /// the caller re-resolve shard ownership.
    pub fn is_ownership_lost(&self) -> bool {
        matches!(self, ServiceError::ShardOwnershipLost { .. })
    }

    /// Shorthand constructor for internal invariant violations.
    pub fn internal(msg: impl Into<String>) -> Self {
        ServiceError::Internal(msg.into())
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        let msg = err.to_string();
        match err {
            ServiceError::InvalidArgument(_) => tonic::Status::invalid_argument(msg),
            ServiceError::FailedPrecondition(_) => tonic::Status::failed_precondition(msg),
            ServiceError::NotFound(_) => tonic::Status::not_found(msg),
            // Ownership and staleness surface as Aborted so generic gRPC
            // clients treat them as safe to retry after re-resolution.
            ServiceError::ShardOwnershipLost { .. }
            | ServiceError::StaleReference { .. }
            | ServiceError::WorkflowConflict(_) => tonic::Status::aborted(msg),
            ServiceError::NamespaceHandover(_) => tonic::Status::unavailable(msg),
            ServiceError::Unavailable(_) => tonic::Status::unavailable(msg),
            ServiceError::ResourceExhausted(_) => tonic::Status::resource_exhausted(msg),
            ServiceError::DeadlineExceeded => tonic::Status::deadline_exceeded(msg),
            ServiceError::Canceled => tonic::Status::cancelled(msg),
            ServiceError::Internal(_) => tonic::Status::internal(msg),
        }
    }
}

impl From<tonic::Status> for ServiceError {
    fn from(status: tonic::Status) -> Self {
        use tonic::Code;
        let msg = status.message().to_string();
        match status.code() {
            Code::InvalidArgument => ServiceError::InvalidArgument(msg),
            Code::FailedPrecondition => ServiceError::FailedPrecondition(msg),
            Code::NotFound => ServiceError::NotFound(msg),
            Code::ResourceExhausted => ServiceError::ResourceExhausted(msg),
            Code::DeadlineExceeded => ServiceError::DeadlineExceeded,
            Code::Cancelled => ServiceError::Canceled,
            Code::Unavailable => ServiceError::Unavailable(msg),
            Code::Internal => ServiceError::Internal(msg),
            _ => ServiceError::Unavailable(msg),
        }
    }
}

/// Result alias used across Kairos crates.
pub type ServiceResult<T> = Result<T, ServiceError>;

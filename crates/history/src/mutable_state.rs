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

//! Workflow mutable state.
//!
//! ## Invariants
//! - A run id identifies one execution forever; a workflow has at most one
//!   current run at a time.
//! - The current run's branch token is never empty.
//! - Pending-entry maps are ordered by their monotonic scheduled/timer ids.

use crate::chasm::NodeTree;
use chrono::{DateTime, Utc};
use kairos_core::version_history::FIRST_EVENT_ID;
use kairos_core::{
    ServiceError, ServiceResult, VersionHistories, VersionHistory, VersioningOverride, WorkflowKey,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    /// Open and processing tasks.
    Running,
    /// Closed successfully.
    Completed,
    /// Closed with failure.
    Failed,
    /// Closed by cancellation.
    Canceled,
    /// Closed by operator termination.
    Terminated,
    /// Closed by timeout.
    TimedOut,
    /// Closed by continue-as-new; a successor run carries on.
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// Whether the execution is still open.
    pub fn is_open(&self) -> bool {
        matches!(self, WorkflowStatus::Running)
    }
}

/// Pending activity entry, keyed by its scheduled event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Scheduled event id (map key).
    pub scheduled_event_id: i64,
    /// User-visible activity id.
    pub activity_id: String,
    /// Current attempt, starting at 1.
    pub attempt: u32,
    /// Last recorded heartbeat.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Pending timer entry, keyed by its timer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerInfo {
    /// User-visible timer id (map key).
    pub timer_id: String,
    /// Event that started the timer.
    pub started_event_id: i64,
    /// Absolute expiry.
    pub expiry: DateTime<Utc>,
}

/// Pending child-workflow entry, keyed by its initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Initiated event id (map key).
    pub initiated_event_id: i64,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child run id once started.
    pub run_id: Option<String>,
}

/// Pending external-cancel request, keyed by its initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCancelInfo {
    /// Initiated event id (map key).
    pub initiated_event_id: i64,
    /// Target workflow id.
    pub target_workflow_id: String,
}

/// Pending external-signal entry, keyed by its initiated event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Initiated event id (map key).
    pub initiated_event_id: i64,
    /// Signal name.
    pub name: String,
}

/// Mutable state of one workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMutableState {
    /// Key of this execution.
    pub workflow_key: WorkflowKey,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Branch collection; the current branch's token names this run's
    /// linear sub-history.
    pub version_histories: VersionHistories,
    /// Next event id to assign.
    pub next_event_id: i64,
    /// Pending activities by scheduled event id.
    pub pending_activities: BTreeMap<i64, ActivityInfo>,
    /// Pending timers by timer id.
    pub pending_timers: BTreeMap<String, TimerInfo>,
    /// Pending children by initiated event id.
    pub pending_children: BTreeMap<i64, ChildExecutionInfo>,
    /// Pending cancel requests by initiated event id.
    pub pending_cancels: BTreeMap<i64, RequestCancelInfo>,
    /// Pending signals by initiated event id.
    pub pending_signals: BTreeMap<i64, SignalInfo>,
    /// Deduplication ids of signals already requested.
    pub signals_requested: BTreeSet<String>,
    /// Hosted sub-state machines.
    pub chasm: NodeTree,
    /// Per-workflow versioning directive, if any.
    pub versioning_override: Option<VersioningOverride>,
}

impl WorkflowMutableState {
    /// Fresh state for a new run on the given branch.
    pub fn new(workflow_key: WorkflowKey, branch_token: Vec<u8>) -> Self {
        Self {
            workflow_key,
            status: WorkflowStatus::Running,
            version_histories: VersionHistories::new(VersionHistory::new(branch_token, Vec::new())),
            next_event_id: FIRST_EVENT_ID,
            pending_activities: BTreeMap::new(),
            pending_timers: BTreeMap::new(),
            pending_children: BTreeMap::new(),
            pending_cancels: BTreeMap::new(),
            pending_signals: BTreeMap::new(),
            signals_requested: BTreeSet::new(),
            chasm: NodeTree::new(),
            versioning_override: None,
        }
    }

    /// Branch token of the current branch.
    pub fn branch_token(&self) -> ServiceResult<&[u8]> {
        Ok(&self.version_histories.current()?.branch_token)
    }

    /// Enforce structural invariants before commit.
    pub fn validate(&self) -> ServiceResult<()> {
        let current = self.version_histories.current()?;
        if self.status.is_open() && current.branch_token.is_empty() {
            return Err(ServiceError::internal(format!(
                "open workflow {} has an empty branch token",
                self.workflow_key
            )));
        }
        if self.next_event_id < FIRST_EVENT_ID {
            return Err(ServiceError::internal(format!(
                "workflow {} next event id {} below minimum",
                self.workflow_key, self.next_event_id
            )));
        }
        Ok(())
    }

    /// Allocate the next event id.
    pub fn next_event_id(&mut self) -> i64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }
}

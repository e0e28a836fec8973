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

//! Matching plane for Kairos
//!
//! Task queues with long-poll dispatch, per-queue poller history, and the
//! pure version-rules engine that governs build-id routing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatcher;
pub mod poller_history;
pub mod version_rules;

pub use dispatcher::{
    BacklogInfo, DeploymentRoutingSnapshot, MatchingEngine, MatchingTask, TaskQueueKey,
    TaskQueueType,
};
pub use poller_history::{PollerHistory, PollerInfo};
pub use version_rules::{
    add_redirect_rule, cleanup_tombstones, commit_build_id, contains_fully_ramped,
    delete_assignment_rule, delete_redirect_rule, evaluate_assignment_rules,
    find_terminal_build_id, get_upstream_build_ids, insert_assignment_rule, is_cyclic,
    replace_assignment_rule, replace_redirect_rule, AssignmentRule, RedirectRule, RuleError,
    RuleResult, VersioningData,
};

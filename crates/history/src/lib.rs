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

//! Shard controller and history engine for Kairos
//!
//! Owns workflow mutable state per shard, persists state and generated tasks
//! atomically, tracks in-flight writes so ack cursors stay safe, hosts
//! sub-state machines, and runs the per-category queue readers including the
//! outbound side-effect executors.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod chasm;
pub mod engine;
pub mod mutable_state;
pub mod outbound;
pub mod queues;
pub mod shard;
pub mod task_tracker;

pub use cache::{CachedState, WorkflowCache};
pub use chasm::{AccessMode, ChasmNode, NodeCapabilities, NodeRef, NodeTree};
pub use engine::{CommitOutcome, GeneratedTask, HistoryEngine, MutationResult};
pub use mutable_state::{WorkflowMutableState, WorkflowStatus};
pub use outbound::{
    OutboundActiveTaskExecutor, OutboundDestination, OutboundStandbyTaskExecutor, OutboundTaskInfo,
};
pub use queues::{QueueReader, TaskExecutor};
pub use shard::ShardContext;
pub use task_tracker::{TaskOutcome, TaskRequestTracker, TrackedRequest};

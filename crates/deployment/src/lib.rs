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

//! Worker-deployment versioning controller for Kairos
//!
//! One long-running state machine per deployment: authoritative version
//! summaries, current/ramping routing with gradual rollout, drainage
//! tracking through per-version sub-workflows, and a scavenger that makes
//! room when registration hits the version cap.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod state;
pub mod version_workflow;

pub use controller::{
    DeploymentController, RoutingMutationResponse, SetCurrentArgs, SetRampingArgs, TaskQueueFacts,
};
pub use state::{
    decode_conflict_token, encode_conflict_token, DeploymentLocalState, DrainageStatus,
    RegisteredTaskQueue, RoutingConfig, SerializableQueueType, VersionDrainageInfo, VersionSummary,
};
pub use version_workflow::{
    DrainageSignal, SyncVersionStateArgs, VersionLocalState, VersionWorkflows, VisibilityCounter,
};

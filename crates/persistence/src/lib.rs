// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Kairos.
//
// Kairos is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Kairos. If not, see <https://www.gnu.org/licenses/>.

//! Persistence query layer for Kairos
//!
//! Row-level operations for shards, workflow mutable state, durable tasks,
//! history nodes/trees, namespaces, and the templated workflow sub-maps.
//! Core components depend on the typed store traits; the sqlite backends in
//! this crate serve the embedded path and tests, with server dialects
//! differing only in the upsert clause rendered by [`dialect::Dialect`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dialect;
pub mod error;
pub mod events;
pub mod execution_maps;
pub mod execution_store;
pub mod memory;
pub mod namespace_store;
pub mod store;

pub use dialect::Dialect;
pub use error::{StoreError, StoreResult};
pub use events::{HistoryNodeRow, HistoryNodeSelectFilter, HistoryTreeRow, SqliteHistoryEventStore};
pub use execution_maps::{ExecutionMapFilter, ExecutionMapRow, MapKind, SqliteExecutionMaps};
pub use execution_store::SqliteExecutionStore;
pub use memory::MemoryStore;
pub use namespace_store::SqliteNamespaceStore;
pub use store::{
    CommitRequest, ExecutionStore, NamespacePage, NamespaceRecord, NamespaceStore, ShardRecord,
    TaskRow, TaskStore, WorkflowStateRecord,
};

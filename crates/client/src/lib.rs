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

//! Client-side shard routing for Kairos
//!
//! Maps shard ids to the owning host via membership, keeps warm pooled
//! connections, and transparently redirects once when ownership moves.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection_pool;
pub mod redirector;

pub use connection_pool::{ClientConnection, ClientDialer, ConnectionPool, TonicDialer};
pub use redirector::CachingRedirector;

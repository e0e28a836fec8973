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

//! Caching redirector from shard id to the owning host's client.
//!
//! ## Cache discipline
//! Entries map shard id to `(address, connection, stale_at)`. A membership
//! change stamps every entry with `now + TTL`; lookups past the stamp
//! re-resolve and only then update the entry; entries are never evicted
//! during refresh, so concurrent readers see either the pre-refresh or the
//! refreshed value and never stampede the resolver.
//!
//! ## Ownership-lost handling
//! A `ShardOwnershipLost` with a usable new-owner hint repoints the cache and
//! retries once without a resolver round trip. An empty hint evicts the entry
//! and retries once via a fresh lookup. After one redirect the error
//! surfaces.

use crate::connection_pool::{ClientConnection, ClientDialer, ConnectionPool};
use kairos_core::{
    ConfigKey, DynamicConfig, ServiceError, ServiceResolver, ServiceResult,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock};
use tracing::debug;

struct CacheEntry<C> {
    connection: ClientConnection<C>,
    stale_at: Option<Instant>,
}

impl<C: Clone> CacheEntry<C> {
    fn is_fresh(&self) -> bool {
        match self.stale_at {
            None => true,
            Some(at) => Instant::now() < at,
        }
    }
}

/// Redirector producing warm clients for shard owners.
pub struct CachingRedirector<D: ClientDialer> {
    pool: Arc<ConnectionPool<D>>,
    resolver: Arc<dyn ServiceResolver>,
    stale_ttl: Duration,
    cache: RwLock<HashMap<i32, CacheEntry<D::Client>>>,
    shutdown: Notify,
}

impl<D: ClientDialer> CachingRedirector<D> {
    /// Redirector over a pool and membership resolver. Spawns the
    /// membership listener; call [`stop`](Self::stop) on shutdown.
    pub fn new(
        pool: Arc<ConnectionPool<D>>,
        resolver: Arc<dyn ServiceResolver>,
        config: &DynamicConfig,
    ) -> Arc<Self> {
        let redirector = Arc::new(Self {
            pool,
            resolver,
            stale_ttl: config.duration(ConfigKey::HistoryClientStaleTtl),
            cache: RwLock::new(HashMap::new()),
            shutdown: Notify::new(),
        });
        Self::spawn_membership_listener(&redirector);
        redirector
    }

    fn spawn_membership_listener(redirector: &Arc<Self>) {
        let weak = Arc::downgrade(redirector);
        let mut events = redirector.resolver.subscribe();
        tokio::spawn(async move {
            loop {
                let Some(redirector) = weak.upgrade() else {
                    return;
                };
                tokio::select! {
                    event = events.recv() => {
                        if event.is_err() {
                            return;
                        }
                        redirector.mark_all_stale().await;
                    }
                    _ = redirector.shutdown.notified() => return,
                }
            }
        });
    }

    /// Stop the membership listener.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Stamp every cache entry stale as of `now + TTL`.
    pub async fn mark_all_stale(&self) {
        let stale_at = Instant::now() + self.stale_ttl;
        let mut cache = self.cache.write().await;
        for entry in cache.values_mut() {
            entry.stale_at = Some(stale_at);
        }
        debug!(entries = cache.len(), "stamped redirector cache entries stale");
    }

    async fn evict(&self, shard_id: i32) {
        self.cache.write().await.remove(&shard_id);
    }

    /// Point the cache entry for `shard_id` at `address`, connecting through
    /// the pool and resetting the connection's backoff.
    async fn install_entry(
        &self,
        shard_id: i32,
        address: &str,
    ) -> ServiceResult<ClientConnection<D::Client>> {
        let connection = self.pool.get_or_create(address).await?;
        self.pool.reset_connect_backoff(&connection);
        self.cache.write().await.insert(
            shard_id,
            CacheEntry {
                connection: connection.clone(),
                stale_at: None,
            },
        );
        Ok(connection)
    }

    /// Cached, resolved connection for a shard. Used directly by streaming
    /// paths; `execute` wraps it with redirect handling.
    pub async fn client_for_shard_id(
        &self,
        shard_id: i32,
    ) -> ServiceResult<ClientConnection<D::Client>> {
        if shard_id < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "invalid shard id {}",
                shard_id
            )));
        }

        if let Some(entry) = self.cache.read().await.get(&shard_id) {
            if entry.is_fresh() {
                return Ok(entry.connection.clone());
            }
        }

        let host = self.resolver.lookup(&shard_id.to_string()).await?;
        {
            // Same owner after a stale re-resolve: refresh the stamp and
            // reset backoff for the stale -> fresh transition.
            let mut cache = self.cache.write().await;
            if let Some(entry) = cache.get_mut(&shard_id) {
                if entry.connection.address == host.address() {
                    entry.stale_at = None;
                    let connection = entry.connection.clone();
                    drop(cache);
                    self.pool.reset_connect_backoff(&connection);
                    return Ok(connection);
                }
            }
        }
        self.install_entry(shard_id, host.address()).await
    }

    /// Resolve, connect and invoke `op` against the shard owner, redirecting
    /// once on `ShardOwnershipLost`.
    pub async fn execute<F, Fut>(&self, shard_id: i32, op: F) -> ServiceResult<()>
    where
        F: Fn(D::Client) -> Fut,
        Fut: Future<Output = ServiceResult<()>>,
    {
        if shard_id < 0 {
            return Err(ServiceError::InvalidArgument(format!(
                "invalid shard id {}",
                shard_id
            )));
        }

        let mut connection = self.client_for_shard_id(shard_id).await?;
        let mut redirected = false;
        loop {
            match op(connection.client.clone()).await {
                Ok(()) => return Ok(()),
                Err(err @ ServiceError::ShardOwnershipLost { .. }) if !redirected => {
                    let ServiceError::ShardOwnershipLost { owner_hint, .. } = &err else {
                        unreachable!("matched above");
                    };
                    redirected = true;
                    if owner_hint.is_empty() {
                        // No hint: drop the entry and try one fresh lookup.
                        self.evict(shard_id).await;
                        connection = self.client_for_shard_id(shard_id).await?;
                    } else if *owner_hint != connection.address {
                        debug!(shard_id, owner = %owner_hint, "redirecting to hinted shard owner");
                        connection = self.install_entry(shard_id, owner_hint).await?;
                    } else {
                        // The hint names the owner we already used; another
                        // attempt would hit the same host.
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

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

//! In-memory namespace cache with refresh loop and change fanout.
//!
//! ## Refresh
//! Every `NamespaceCacheRefreshInterval`, list all namespaces (including
//! deleted ones) in pages of `NamespaceCacheRefreshPageSize` and diff against
//! the cache by notification version. Material changes fan out to registered
//! callbacks with `deleted_from_db = false`; entries that vanished from the
//! listing fan out with `deleted_from_db = true` and are removed.
//!
//! ## Read path
//! `get_by_name` serves from cache; on miss (readthrough enabled) a single
//! fetch populates the cache, with concurrent readers sharing the in-flight
//! result. `NotFound` is never cached.

use crate::Namespace;
use kairos_core::{ConfigKey, DynamicConfig, ServiceError, ServiceResult};
use kairos_persistence::{NamespaceStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

/// Callback invoked on material namespace changes.
/// The second argument is `deleted_from_db`.
pub type StateChangeCallback = Arc<dyn Fn(&Namespace, bool) + Send + Sync>;

#[derive(Default)]
struct CacheInner {
    by_name: HashMap<String, Arc<Namespace>>,
    by_id: HashMap<String, Arc<Namespace>>,
}

/// Cached registry of all namespaces.
pub struct NamespaceRegistry {
    store: Arc<dyn NamespaceStore>,
    config: DynamicConfig,
    cache: RwLock<CacheInner>,
    callbacks: Mutex<HashMap<u64, StateChangeCallback>>,
    next_callback_id: Mutex<u64>,
    // Per-name fetch locks; concurrent readers of the same miss share one
    // fetch instead of stampeding the store.
    readthrough_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: Notify,
}

impl NamespaceRegistry {
    /// Registry over a namespace store.
    pub fn new(store: Arc<dyn NamespaceStore>, config: DynamicConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            cache: RwLock::new(CacheInner::default()),
            callbacks: Mutex::new(HashMap::new()),
            next_callback_id: Mutex::new(0),
            readthrough_locks: Mutex::new(HashMap::new()),
            shutdown: Notify::new(),
        })
    }

    /// Register a state-change callback. Returns an id for unregistering.
    pub fn register_state_change_callback(&self, callback: StateChangeCallback) -> u64 {
        let mut next = self.next_callback_id.lock().expect("registry lock poisoned");
        *next += 1;
        let id = *next;
        self.callbacks
            .lock()
            .expect("registry lock poisoned")
            .insert(id, callback);
        id
    }

    /// Remove a previously registered callback.
    pub fn unregister_state_change_callback(&self, id: u64) {
        self.callbacks
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
    }

    /// Number of cached namespaces.
    pub async fn approximate_size(&self) -> usize {
        self.cache.read().await.by_name.len()
    }

    /// Cached namespace by name, with optional read-through on miss.
    pub async fn get_by_name(
        &self,
        name: &str,
        disable_readthrough: bool,
    ) -> ServiceResult<Arc<Namespace>> {
        if let Some(ns) = self.cache.read().await.by_name.get(name) {
            return Ok(ns.clone());
        }
        if disable_readthrough {
            return Err(ServiceError::NotFound(format!("namespace {}", name)));
        }

        let fetch_lock = {
            let mut locks = self
                .readthrough_locks
                .lock()
                .expect("registry lock poisoned");
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = fetch_lock.lock().await;

        // Another reader may have completed the fetch while we waited.
        if let Some(ns) = self.cache.read().await.by_name.get(name) {
            return Ok(ns.clone());
        }

        match self.store.get_namespace_by_name(name).await {
            Ok(record) => {
                let namespace = Arc::new(Namespace::from_record(&record)?);
                let mut cache = self.cache.write().await;
                cache.by_name.insert(namespace.name.clone(), namespace.clone());
                cache.by_id.insert(namespace.id.clone(), namespace.clone());
                Ok(namespace)
            }
            // Negative results are not cached.
            Err(StoreError::NotFound(msg)) => Err(ServiceError::NotFound(msg)),
            Err(err) => Err(err.into()),
        }
    }

    /// Cached namespace by id. No read-through: id lookups only see entries
    /// the refresh loop or a name read-through has populated.
    pub async fn get_by_id(&self, id: &str) -> ServiceResult<Arc<Namespace>> {
        self.cache
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("namespace id {}", id)))
    }

    /// Run one full refresh: page through the store, diff, fan out.
    pub async fn refresh(&self) -> ServiceResult<()> {
        let page_size = self.config.int(ConfigKey::NamespaceCacheRefreshPageSize) as usize;
        let mut fetched: Vec<Namespace> = Vec::new();
        let mut page_token = None;
        loop {
            let page = self.store.list_namespaces(page_size, page_token).await?;
            for record in &page.namespaces {
                fetched.push(Namespace::from_record(record)?);
            }
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let mut changed: Vec<Arc<Namespace>> = Vec::new();
        let mut deleted: Vec<Arc<Namespace>> = Vec::new();
        {
            let mut cache = self.cache.write().await;
            let mut new_by_name: HashMap<String, Arc<Namespace>> = HashMap::new();
            let mut new_by_id: HashMap<String, Arc<Namespace>> = HashMap::new();

            for namespace in fetched {
                let namespace = Arc::new(namespace);
                match cache.by_name.get(&namespace.name) {
                    None => changed.push(namespace.clone()),
                    Some(old) => {
                        if namespace.notification_version != old.notification_version
                            && namespace.is_material_change_from(old)
                        {
                            changed.push(namespace.clone());
                        }
                    }
                }
                new_by_name.insert(namespace.name.clone(), namespace.clone());
                new_by_id.insert(namespace.id.clone(), namespace);
            }

            for (name, old) in &cache.by_name {
                if !new_by_name.contains_key(name) {
                    deleted.push(old.clone());
                }
            }

            cache.by_name = new_by_name;
            cache.by_id = new_by_id;
        }

        let callbacks: Vec<StateChangeCallback> = self
            .callbacks
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        for namespace in &changed {
            debug!(namespace = %namespace.name, "namespace changed");
            for callback in &callbacks {
                callback(namespace, false);
            }
        }
        for namespace in &deleted {
            debug!(namespace = %namespace.name, "namespace deleted from db");
            for callback in &callbacks {
                callback(namespace, true);
            }
        }
        Ok(())
    }

    /// Run the periodic refresh loop until [`stop`](Self::stop) is called.
    pub async fn run_refresh_loop(self: Arc<Self>) {
        let interval = self.config.duration(ConfigKey::NamespaceCacheRefreshInterval);
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh().await {
                        warn!(error = %err, "namespace cache refresh failed");
                    }
                }
                _ = self.shutdown.notified() => return,
            }
        }
    }

    /// Stop the refresh loop.
    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }
}

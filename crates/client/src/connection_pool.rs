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

//! Address-keyed client connection pool.
//!
//! Entries are shared across callers; a per-address dial lock ensures at most
//! one dial is in flight for an unknown address. `reset_connect_backoff`
//! un-penalizes a host that membership just restored, so a previously
//! unreachable address is retried eagerly instead of waiting out its backoff.

use async_trait::async_trait;
use kairos_core::{ServiceError, ServiceResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Dials typed clients for host addresses. The tonic-backed implementation
/// serves production; tests plug in recording fakes.
#[async_trait]
pub trait ClientDialer: Send + Sync + 'static {
    /// Client type produced by a dial.
    type Client: Clone + Send + Sync + 'static;

    /// Dial `address` and return a connected (possibly lazy) client.
    async fn dial(&self, address: &str) -> ServiceResult<Self::Client>;

    /// Reset any connect backoff associated with the client. Default no-op
    /// for transports without an explicit backoff handle.
    fn reset_backoff(&self, _client: &Self::Client) {}
}

/// One pooled connection.
#[derive(Debug, Clone)]
pub struct ClientConnection<C> {
    /// Address the connection was dialed for.
    pub address: String,
    /// The shared client.
    pub client: C,
}

struct PoolEntry<C> {
    dial_lock: Arc<Mutex<()>>,
    connection: Option<ClientConnection<C>>,
}

impl<C> Default for PoolEntry<C> {
    fn default() -> Self {
        Self {
            dial_lock: Arc::new(Mutex::new(())),
            connection: None,
        }
    }
}

/// Pool of client connections keyed by address.
pub struct ConnectionPool<D: ClientDialer> {
    dialer: D,
    entries: Mutex<HashMap<String, PoolEntry<D::Client>>>,
}

impl<D: ClientDialer> ConnectionPool<D> {
    /// Pool over the given dialer.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the pooled connection for `address`, dialing once on first use.
    pub async fn get_or_create(&self, address: &str) -> ServiceResult<ClientConnection<D::Client>> {
        let dial_lock = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(address.to_string()).or_default();
            if let Some(connection) = &entry.connection {
                return Ok(connection.clone());
            }
            entry.dial_lock.clone()
        };

        // One dial at a time per address; the loser of the race reuses the
        // winner's connection.
        let _dialing = dial_lock.lock().await;
        {
            let entries = self.entries.lock().await;
            if let Some(connection) = entries
                .get(address)
                .and_then(|entry| entry.connection.clone())
            {
                return Ok(connection);
            }
        }

        let client = self.dialer.dial(address).await?;
        let connection = ClientConnection {
            address: address.to_string(),
            client,
        };
        self.entries
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .connection = Some(connection.clone());
        Ok(connection)
    }

    /// Reset the connect backoff of a pooled connection.
    pub fn reset_connect_backoff(&self, connection: &ClientConnection<D::Client>) {
        self.dialer.reset_backoff(&connection.client);
    }

    /// Drop the pooled connection for `address`.
    pub async fn remove(&self, address: &str) {
        self.entries.lock().await.remove(address);
    }
}

/// Dialer producing lazy tonic channels.
///
/// `connect_lazy` defers the TCP/TLS handshake to first use, so pool entries
/// are cheap and reconnects are owned by the channel itself.
#[derive(Debug, Default, Clone)]
pub struct TonicDialer;

#[async_trait]
impl ClientDialer for TonicDialer {
    type Client = tonic::transport::Channel;

    async fn dial(&self, address: &str) -> ServiceResult<Self::Client> {
        let endpoint = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let endpoint = tonic::transport::Endpoint::from_shared(endpoint)
            .map_err(|e| ServiceError::InvalidArgument(format!("invalid endpoint: {}", e)))?;
        Ok(endpoint.connect_lazy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicUsize,
        resets: AtomicUsize,
    }

    #[async_trait]
    impl ClientDialer for Arc<CountingDialer> {
        type Client = String;

        async fn dial(&self, address: &str) -> ServiceResult<String> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Ok(format!("client-{}", address))
        }

        fn reset_backoff(&self, _client: &String) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_dial_per_address() {
        let dialer = Arc::new(CountingDialer::default());
        let pool = Arc::new(ConnectionPool::new(dialer.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(
                async move { pool.get_or_create("host-a").await },
            ));
        }
        for handle in handles {
            let connection = handle.await.unwrap().unwrap();
            assert_eq!(connection.client, "client-host-a");
        }
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_addresses_dial_separately() {
        let dialer = Arc::new(CountingDialer::default());
        let pool = ConnectionPool::new(dialer.clone());
        pool.get_or_create("host-a").await.unwrap();
        pool.get_or_create("host-b").await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_forces_redial() {
        let dialer = Arc::new(CountingDialer::default());
        let pool = ConnectionPool::new(dialer.clone());
        let connection = pool.get_or_create("host-a").await.unwrap();
        pool.reset_connect_backoff(&connection);
        assert_eq!(dialer.resets.load(Ordering::SeqCst), 1);

        pool.remove("host-a").await;
        pool.get_or_create("host-a").await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tonic_dialer_normalizes_scheme() {
        let dialer = TonicDialer;
        // Lazy channels do not reach the network on dial.
        dialer.dial("localhost:7233").await.unwrap();
        dialer.dial("http://localhost:7233").await.unwrap();
        assert!(dialer.dial("http://\u{0}bad").await.is_err());
    }
}

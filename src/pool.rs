//! Multi-bus connection pool: lazy authenticated connections to non-default
//! buses, credential refresh, LRU + idle eviction.

// Copyright 2015-2020 Capital One Services, LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::bus::{Bus, BusAuth, Connector};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// `{token | user+pass | jwt+nkeySeed}` plus optional expiry.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token { token: String, expires_at: Option<Instant> },
    UserPass { user: String, pass: String, expires_at: Option<Instant> },
    JwtNkey { jwt: String, nkey_seed: String, expires_at: Option<Instant> },
}

const EXPIRY_SKEW: Duration = Duration::from_secs(30);

impl Credentials {
    fn expires_at(&self) -> Option<Instant> {
        match self {
            Credentials::Token { expires_at, .. } => *expires_at,
            Credentials::UserPass { expires_at, .. } => *expires_at,
            Credentials::JwtNkey { expires_at, .. } => *expires_at,
        }
    }

    /// Considered expired `EXPIRY_SKEW` before the stated `expiresAt`.
    fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at() {
            Some(at) => now + EXPIRY_SKEW >= at,
            None => false,
        }
    }

    fn to_bus_auth(&self) -> BusAuth {
        match self {
            Credentials::Token { token, .. } => BusAuth::Token(token.clone()),
            Credentials::UserPass { user, pass, .. } => BusAuth::UserPass {
                user: user.clone(),
                pass: pass.clone(),
            },
            Credentials::JwtNkey { .. } => BusAuth::None,
        }
    }
}

/// Resolves an access token for a given bus URL ahead of the auth handshake.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Exchanges an access token (and target URL) for bus credentials.
#[async_trait::async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, nats_url: &str, access_token: Option<&str>) -> Result<Credentials>;
}

struct PoolEntry {
    connection: Arc<dyn Bus>,
    credentials: Credentials,
    nats_url: String,
    connected_at: Instant,
    last_used_at: Instant,
}

/// Tunables for a [`ConnectionPool`].
#[derive(Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub static_access_token: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 8,
            idle_timeout: Duration::from_secs(300),
            static_access_token: None,
        }
    }
}

/// Lazily-connected pool of non-default bus connections. The default
/// connection is borrowed from the facade and never touched by the pool.
pub struct ConnectionPool {
    config: PoolConfig,
    default_url: String,
    default_connection: Arc<dyn Bus>,
    connector: Connector,
    auth_provider: Option<Arc<dyn AuthProvider>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    entries: Mutex<HashMap<String, PoolEntry>>,
    reaper_stopped: Arc<AtomicBool>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        default_url: impl Into<String>,
        default_connection: Arc<dyn Bus>,
        connector: Connector,
        auth_provider: Option<Arc<dyn AuthProvider>>,
        token_provider: Option<Arc<dyn TokenProvider>>,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool {
            config,
            default_url: normalize_url(&default_url.into()),
            default_connection,
            connector,
            auth_provider,
            token_provider,
            entries: Mutex::new(HashMap::new()),
            reaper_stopped: Arc::new(AtomicBool::new(false)),
        });
        pool.clone().spawn_reaper();
        pool
    }

    fn spawn_reaper(self: Arc<Self>) {
        let stopped = self.reaper_stopped.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                self.reap_idle().await;
            }
        });
    }

    async fn reap_idle(&self) {
        let now = Instant::now();
        let stale: Vec<String> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_used_at) >= self.config.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect()
        };
        for url in stale {
            if let Some(entry) = self.entries.lock().unwrap().remove(&url) {
                if let Err(e) = entry.connection.drain().await {
                    warn!(url = %url, error = %e, "idle reap: drain failed");
                }
            }
        }
    }

    /// Returns the connection for `nats_url`, establishing it if needed.
    #[instrument(level = "debug", skip(self))]
    pub async fn get_or_connect(&self, nats_url: &str) -> Result<Arc<dyn Bus>> {
        let normalized = normalize_url(nats_url);

        if normalized == self.default_url {
            return Ok(self.default_connection.clone());
        }

        let now = Instant::now();
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get_mut(&normalized) {
                if !entry.credentials.is_expired(now) {
                    entry.last_used_at = now;
                    return Ok(entry.connection.clone());
                }
            }
        }

        // Entry either absent or expired; drop an expired one before reconnecting.
        let stale = { self.entries.lock().unwrap().remove(&normalized) };
        if let Some(entry) = stale {
            let _ = entry.connection.drain().await;
        }

        let auth_provider = self
            .auth_provider
            .as_ref()
            .ok_or_else(|| Error::auth_failed("no auth provider configured for non-default bus"))?;

        self.evict_if_at_capacity().await;

        let access_token = self
            .token_provider
            .as_ref()
            .and_then(|p| p.token())
            .or_else(|| self.config.static_access_token.clone());

        let credentials = auth_provider
            .authenticate(&normalized, access_token.as_deref())
            .await?;

        debug!(url = %normalized, "connecting to non-default bus");
        let connection = (self.connector)(normalized.clone(), credentials.to_bus_auth())
            .await
            .map_err(|e| Error::internal(format!("connect to {normalized}: {e}")))?;

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            normalized.clone(),
            PoolEntry {
                connection: connection.clone(),
                credentials,
                nats_url: normalized,
                connected_at: now,
                last_used_at: now,
            },
        );
        Ok(connection)
    }

    async fn evict_if_at_capacity(&self) {
        let non_default_capacity = self.config.max_connections.saturating_sub(1);
        let victim = {
            let entries = self.entries.lock().unwrap();
            if entries.len() < non_default_capacity {
                None
            } else {
                entries
                    .values()
                    .min_by_key(|e| e.last_used_at)
                    .map(|e| e.nats_url.clone())
            }
        };
        if let Some(url) = victim {
            if let Some(entry) = self.entries.lock().unwrap().remove(&url) {
                if let Err(e) = entry.connection.drain().await {
                    warn!(url = %url, error = %e, "LRU eviction: drain failed");
                }
            }
        }
    }

    /// Stops the idle reaper and drains every non-default entry. The default
    /// connection is left open — the facade owns its lifecycle.
    pub async fn close_all(&self) {
        self.reaper_stopped.store(true, Ordering::SeqCst);
        let entries: Vec<PoolEntry> = {
            let mut map = self.entries.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for entry in entries {
            if let Err(e) = entry.connection.drain().await {
                warn!(url = %entry.nats_url, error = %e, "close_all: drain failed");
            }
        }
    }

    pub fn connected_at(&self, nats_url: &str) -> Option<Instant> {
        self.entries
            .lock()
            .unwrap()
            .get(&normalize_url(nats_url))
            .map(|e| e.connected_at)
    }

    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn default_url(&self) -> &str {
        &self.default_url
    }
}

fn normalize_url(url: &str) -> String {
    url.to_lowercase().trim_end_matches('/').to_string()
}

//! Client Facade: owns every component, orchestrates bootstrap and pipeline
//! construction, and exposes `invoke`/`invokeSubject`/`describe`/`discover`.

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

use crate::bus::nats::NatsBus;
use crate::bus::{Bus, BusAuth};
use crate::cache::{TtlCache, TtlCacheConfig};
use crate::config::ClientConfig;
use crate::envelope::{InvocationContext, InvocationEnvelope, InvocationResult, ResolvedCapability};
use crate::error::{Code, Error, Result};
use crate::pipeline::middleware::{Deadline, EnrichContext, Resolve};
use crate::pipeline::{build_pipeline, CancelSignal, Handler, Middleware};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::resolution::invalidation::InvalidationSubscriber;
use crate::resolution::{build_key, KeyOptions, RegistryCaller, ResolutionClient, ResolutionClientConfig, ResolveOutput};
use crate::transport::{TransportConfig, TransportCore};
pub use crate::wire::{BootstrapEntry, BootstrapReply};
use crate::wire::{RegistryRequest, RegistryResponse};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub const BOOTSTRAP_SUBJECT: &str = "system.registry.bootstrap";

/// Issues `remoteCall`s against the registry on behalf of the resolution and
/// discovery clients, per spec §4.9 step 5. Holds only a [`Weak`] back-pointer
/// to the resolution client it resolves the registry's own subject through,
/// since that client's own `registry` field is this type.
struct RemoteRegistry {
    pool: Arc<ConnectionPool>,
    resolution: Weak<ResolutionClient>,
    registry_cap: String,
    default_timeout: Duration,
}

impl RemoteRegistry {
    async fn call(&self, method: &'static str, params: Value, ctx: &InvocationContext) -> Result<Value> {
        let resolution = self
            .resolution
            .upgrade()
            .ok_or_else(|| Error::internal("resolution client dropped"))?;
        let output = resolution.resolve(&self.registry_cap, None, ctx).await?;
        let connection = self.pool.get_or_connect(&output.nats_url).await?;

        let request = RegistryRequest {
            id: Uuid::new_v4().to_string(),
            kind: "invoke",
            cap: &self.registry_cap,
            method,
            params,
            ctx,
        };
        let body = serde_json::to_vec(&request).map_err(Error::from)?;

        let message = connection.request(&output.subject, body, self.default_timeout).await?;

        let response: RegistryResponse = serde_json::from_slice(&message.payload).map_err(Error::from)?;
        if !response.ok {
            let (code, message) = response
                .error
                .map(|e| (e.code.unwrap_or(Code::InternalError), e.message.unwrap_or_default()))
                .unwrap_or((Code::InternalError, "registry call failed".to_string()));
            return Err(crate::error::CapabilityError::new(code, message).into());
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl RegistryCaller for RemoteRegistry {
    async fn resolve(&self, cap: &str, version: Option<&str>, ctx: &InvocationContext) -> Result<ResolveOutput> {
        let params = serde_json::json!({"cap": cap, "version": version});
        let value = self.call("resolve", params, ctx).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    async fn discover(&self, query: &str, ctx: &InvocationContext) -> Result<Vec<ResolveOutput>> {
        let params = serde_json::json!({"query": query});
        let value = self.call("discover", params, ctx).await?;
        serde_json::from_value(value).map_err(Error::from)
    }

    async fn describe(&self, cap_ref: &str, ctx: &InvocationContext) -> Result<ResolveOutput> {
        let params = serde_json::json!({"capRef": cap_ref});
        let value = self.call("describe", params, ctx).await?;
        serde_json::from_value(value).map_err(Error::from)
    }
}

/// Caches `discover` results keyed by the raw query string, independent of
/// the resolution cache's canonical-identity keying.
struct DiscoveryClient {
    registry: Arc<RemoteRegistry>,
    cache: TtlCache<Vec<ResolveOutput>>,
}

impl DiscoveryClient {
    async fn discover(&self, query: &str, ctx: &InvocationContext) -> Result<Vec<ResolveOutput>> {
        let cached = self.cache.get(query);
        if cached.found {
            if let Some(value) = cached.value {
                return Ok(value);
            }
        }
        let results = self.registry.discover(query, ctx).await?;
        self.cache.set(query, results.clone(), None, None);
        Ok(results)
    }

    async fn describe(&self, cap_ref: &str, ctx: &InvocationContext) -> Result<ResolveOutput> {
        self.registry.describe(cap_ref, ctx).await
    }

    fn invalidate_all(&self) {
        self.cache.clear();
    }
}

/// Owns the default bus connection, connection pool, resolution/discovery
/// clients, invalidation subscriber, and the built invocation pipeline.
pub struct Client {
    default_bus: Arc<dyn Bus>,
    owns_default: bool,
    pool: Arc<ConnectionPool>,
    resolution: Arc<ResolutionClient>,
    discovery: Arc<DiscoveryClient>,
    invalidation: InvalidationSubscriber,
    pipeline: Handler,
    tenant_id: String,
}

impl Client {
    /// Connects to the default bus (unless `default_bus` is supplied),
    /// fetches the bootstrap, builds the pool, and constructs the standard
    /// pipeline `[enrich-context, resolve, ...extra]`.
    pub async fn connect(
        config: ClientConfig,
        default_bus: Option<Arc<dyn Bus>>,
        extra_middleware: Vec<Arc<dyn Middleware>>,
    ) -> Result<Self> {
        let (default_bus, owns_default) = match default_bus {
            Some(bus) => (bus, false),
            None => {
                let bus = NatsBus::connect(&config.default_nats_url, BusAuth::None).await?;
                (Arc::new(bus) as Arc<dyn Bus>, true)
            }
        };

        let key_options = KeyOptions {
            include_tenant_in_key: config.include_tenant_in_cache_key,
            include_env_in_key: config.include_env_in_cache_key,
            env: config.env.clone(),
        };

        let bootstrap_ctx = InvocationContext::new(config.tenant_id.clone(), Uuid::new_v4().to_string());
        let bootstrap_msg = default_bus
            .request(BOOTSTRAP_SUBJECT, b"{}".to_vec(), config.default_timeout)
            .await?;
        let reply: BootstrapReply = serde_json::from_slice(&bootstrap_msg.payload)
            .map_err(|e| Error::internal(format!("malformed bootstrap reply: {e}")))?;
        if reply.capabilities.is_empty() {
            return Err(Error::internal("bootstrap reply contained zero valid entries"));
        }

        let pool = ConnectionPool::new(
            PoolConfig {
                max_connections: config.max_pool_connections,
                idle_timeout: config.pool_idle_timeout,
                static_access_token: config.static_access_token.clone(),
            },
            config.default_nats_url.clone(),
            default_bus.clone(),
            crate::bus::nats::connector(),
            config.auth_provider.clone(),
            config.token_provider.clone(),
        );

        let resolution = Arc::new_cyclic(|weak: &Weak<ResolutionClient>| {
            let remote = Arc::new(RemoteRegistry {
                pool: pool.clone(),
                resolution: weak.clone(),
                registry_cap: config.registry_cap.clone(),
                default_timeout: config.default_timeout,
            });
            ResolutionClient::new(
                ResolutionClientConfig {
                    key_options: key_options.clone(),
                    fallback_mappings: config.fallback_mappings.clone(),
                    default_nats_url: config.default_nats_url.clone(),
                    cache: TtlCacheConfig::default(),
                },
                remote,
            )
        });

        let default_bus_url = config.default_nats_url.clone();
        for (cap_ref, entry) in reply.capabilities {
            let (app, name) = match cap_ref.split_once('/') {
                Some((a, b)) => (a.to_string(), b.to_string()),
                None => (String::new(), cap_ref.clone()),
            };
            let output = ResolveOutput {
                canonical_identity: entry.canonical_identity,
                nats_url: entry.nats_url.unwrap_or_else(|| default_bus_url.clone()),
                subject: entry.subject,
                major: entry.major,
                resolved_version: entry.resolved_version.unwrap_or_default(),
                status: entry.status,
                ttl_seconds: entry.ttl_seconds,
                etag: entry.etag,
                methods: entry.methods,
            };
            let key = build_key(None, &cap_ref, None, &bootstrap_ctx, &key_options);
            resolution.seed(key, output, app, name);
        }

        if let Some(subjects) = reply.change_event_subjects {
            if !subjects.is_empty() {
                info!(count = subjects.len(), "registry announced additional change-event subjects");
            }
        }

        let discovery_registry = Arc::new(RemoteRegistry {
            pool: pool.clone(),
            resolution: Arc::downgrade(&resolution),
            registry_cap: config.registry_cap.clone(),
            default_timeout: config.default_timeout,
        });
        let discovery = Arc::new(DiscoveryClient {
            registry: discovery_registry,
            cache: TtlCache::new(TtlCacheConfig::default()),
        });

        let invalidation = InvalidationSubscriber::new(default_bus.clone(), config.invalidation_subject_prefix.clone());
        {
            let resolution = resolution.clone();
            let discovery = discovery.clone();
            invalidation.on_change(Arc::new(move |event| {
                resolution.invalidate_capability(&event.app, &event.capability);
                discovery.invalidate_all();
            }));
        }
        invalidation.start().await?;

        let transport = Arc::new(TransportCore::new(
            pool.clone(),
            TransportConfig {
                default_timeout: config.default_timeout,
                include_timing: config.include_timing,
            },
        ));

        let mut middleware: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(EnrichContext {
                default_tenant_id: config.tenant_id.clone(),
                static_access_token: config.static_access_token.clone(),
                token_provider: config.token_provider.clone(),
            }),
            Arc::new(Resolve {
                resolution: resolution.clone(),
            }),
            Arc::new(Deadline {
                default_timeout: config.default_timeout,
            }),
        ];
        middleware.extend(extra_middleware);

        let core: Handler = Arc::new(move |envelope, cancel| {
            let transport = transport.clone();
            async move { transport.invoke(envelope, cancel).await }.boxed()
        });
        let pipeline = build_pipeline(&middleware, core);

        Ok(Client {
            default_bus,
            owns_default,
            pool,
            resolution,
            discovery,
            invalidation,
            pipeline,
            tenant_id: config.tenant_id,
        })
    }

    /// Resolves `cap_ref` and runs the standard pipeline.
    pub async fn invoke(
        &self,
        cap_ref: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        ctx: Option<InvocationContext>,
    ) -> InvocationResult {
        let ctx = ctx.unwrap_or_else(|| InvocationContext::new(self.tenant_id.clone(), Uuid::new_v4().to_string()));
        let envelope = InvocationEnvelope::new(cap_ref, method, params, ctx);
        (self.pipeline)(envelope, CancelSignal::new()).await
    }

    /// Same as [`Client::invoke`] but bypasses resolution with a
    /// pre-populated [`ResolvedCapability`].
    pub async fn invoke_subject(
        &self,
        cap_ref: impl Into<String>,
        method: impl Into<String>,
        params: Value,
        resolved: ResolvedCapability,
        ctx: Option<InvocationContext>,
    ) -> InvocationResult {
        let ctx = ctx.unwrap_or_else(|| InvocationContext::new(self.tenant_id.clone(), Uuid::new_v4().to_string()));
        let mut envelope = InvocationEnvelope::new(cap_ref, method, params, ctx);
        envelope.resolved = Some(resolved);
        (self.pipeline)(envelope, CancelSignal::new()).await
    }

    /// Resolves a capability reference without invoking it.
    pub async fn resolve(&self, cap_ref: &str, version: Option<&str>, ctx: &InvocationContext) -> Result<ResolveOutput> {
        self.resolution.resolve(cap_ref, version, ctx).await
    }

    /// Thin wrapper over the registry's `describe` remote call.
    pub async fn describe(&self, cap_ref: &str, ctx: &InvocationContext) -> Result<ResolveOutput> {
        self.discovery.describe(cap_ref, ctx).await
    }

    /// Capability discovery against the registry, cached independently of
    /// resolution and keyed by the raw query string.
    pub async fn discover(&self, query: &str, ctx: &InvocationContext) -> Result<Vec<ResolveOutput>> {
        self.discovery.discover(query, ctx).await
    }

    /// Stops invalidation, drains the connection pool, and closes the
    /// default bus connection iff this client owns it.
    pub async fn close(&self) -> Result<()> {
        self.invalidation.stop();
        self.pool.close_all().await;
        if self.owns_default {
            self.default_bus.close().await?;
        }
        Ok(())
    }
}

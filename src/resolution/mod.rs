//! Resolution Cache (context-aware key builder) and Resolution Client
//! (registry `resolve`/`discover`/`describe` with caching, dedup, fallback,
//! revalidation).

pub mod invalidation;

use crate::cache::{Dedup, TtlCache, TtlCacheConfig};
use crate::envelope::InvocationContext;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The result of resolving a capability reference, as returned by the
/// registry (or synthesized from a fallback mapping).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveOutput {
    pub canonical_identity: String,
    pub nats_url: String,
    pub subject: String,
    #[serde(default)]
    pub major: Option<u64>,
    pub resolved_version: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

/// Abstraction over "ask the registry something", implemented by the client
/// facade's `remoteCall`. Kept separate from the pipeline/transport so the
/// resolution client never has to resolve itself to make a registry call.
#[async_trait]
pub trait RegistryCaller: Send + Sync {
    async fn resolve(&self, cap: &str, version: Option<&str>, ctx: &InvocationContext) -> Result<ResolveOutput>;
    async fn discover(&self, query: &str, ctx: &InvocationContext) -> Result<Vec<ResolveOutput>>;
    async fn describe(&self, cap_ref: &str, ctx: &InvocationContext) -> Result<ResolveOutput>;
}

/// Key-building flags for the resolution cache.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub include_tenant_in_key: bool,
    pub include_env_in_key: bool,
    pub env: Option<String>,
}

/// Builds the resolution cache key per spec §3: canonical identity when
/// known, else a `<cap>[|v][|t][|e]` fallback, with tenant/env scoping gated
/// by the cache's configuration flags.
pub fn build_key(
    canonical_identity: Option<&str>,
    cap: &str,
    version: Option<&str>,
    ctx: &InvocationContext,
    opts: &KeyOptions,
) -> String {
    let mut key = match canonical_identity {
        Some(id) => id.to_string(),
        None => {
            let mut k = cap.to_string();
            if let Some(v) = version {
                k.push_str("|v:");
                k.push_str(v);
            }
            k
        }
    };
    if opts.include_tenant_in_key {
        key.push_str("|t:");
        key.push_str(&ctx.tenant_id);
    }
    if opts.include_env_in_key {
        if let Some(env) = &opts.env {
            key.push_str("|e:");
            key.push_str(env);
        }
    }
    key
}

/// A resolution cache entry also remembers the `(app, capability)` pair it
/// was resolved for, so `invalidate_capability` can match precisely instead
/// of guessing at the cache-key format (see the Open Questions decision in
/// the design notes).
#[derive(Debug, Clone)]
struct CachedResolution {
    output: ResolveOutput,
    app: String,
    capability: String,
}

/// Maps `cap` (the bare capability name used in `fallbackMappings`) to a
/// subject used to synthesize a `ResolveOutput` when the registry call fails.
pub type FallbackMappings = std::collections::HashMap<String, String>;

pub struct ResolutionClientConfig {
    pub key_options: KeyOptions,
    pub fallback_mappings: FallbackMappings,
    pub default_nats_url: String,
    pub cache: TtlCacheConfig,
}

/// Registry `resolve`/`discover`/`describe` client: cache → dedup → registry
/// call → fallback chain, with stale-while-revalidate and negative caching.
pub struct ResolutionClient {
    cache: Arc<TtlCache<CachedResolution>>,
    dedup: Dedup<ResolveOutput, String>,
    registry: Arc<dyn RegistryCaller>,
    key_options: KeyOptions,
    fallback_mappings: FallbackMappings,
    default_nats_url: String,
}

impl ResolutionClient {
    pub fn new(config: ResolutionClientConfig, registry: Arc<dyn RegistryCaller>) -> Self {
        ResolutionClient {
            cache: Arc::new(TtlCache::new(config.cache)),
            dedup: Dedup::new(),
            registry,
            key_options: config.key_options,
            fallback_mappings: config.fallback_mappings,
            default_nats_url: config.default_nats_url,
        }
    }

    /// Shares the underlying cache with a caller that needs to seed entries
    /// directly (the client facade does this from the bootstrap reply).
    pub fn cache(&self) -> Arc<TtlCache<CachedResolution>> {
        self.cache.clone()
    }

    /// Seeds a resolved entry with infinite TTL, as done for bootstrap
    /// entries. `app`/`capability` are recorded for later invalidation.
    pub fn seed(&self, key: String, output: ResolveOutput, app: impl Into<String>, capability: impl Into<String>) {
        self.cache.set(
            key,
            CachedResolution {
                output,
                app: app.into(),
                capability: capability.into(),
            },
            Some(Duration::MAX),
            None,
        );
    }

    fn cache_key(&self, cap: &str, version: Option<&str>, ctx: &InvocationContext) -> String {
        build_key(None, cap, version, ctx, &self.key_options)
    }

    /// Resolves a single capability: `(app, cap)` split on the first `/`, with
    /// `cap` used as the fallback-mapping key and cache scoping key (resolving
    /// by full canonical identity is the cache-hit path; resolving a fresh
    /// reference always goes through this bare-cap keyed path first).
    pub async fn resolve(&self, cap: &str, version: Option<&str>, ctx: &InvocationContext) -> Result<ResolveOutput> {
        let key = self.cache_key(cap, version, ctx);

        let cached = self.cache.get(&key);
        if cached.found && !cached.is_stale {
            return match cached.value {
                Some(entry) if !cached.is_negative => Ok(entry.output),
                _ => Err(Error::not_found(format!("capability {cap} not found (negative cache)"))),
            };
        }

        if cached.found && cached.is_stale && !cached.is_negative {
            if let Some(entry) = cached.value {
                self.spawn_background_revalidate(cap.to_string(), version.map(str::to_string), ctx.clone(), key.clone());
                return Ok(entry.output);
            }
        }

        let (app, bare_cap) = split_app_cap(cap);
        let registry = self.registry.clone();
        let cap_owned = cap.to_string();
        let version_owned = version.map(str::to_string);
        let ctx_owned = ctx.clone();

        let result = self
            .dedup
            .get_or_create(&key, move || async move {
                registry
                    .resolve(&cap_owned, version_owned.as_deref(), &ctx_owned)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;

        match result {
            Ok(output) => {
                let ttl = output.ttl_seconds.map(|s| Duration::from_secs(s.max(1)));
                self.cache.set(
                    key,
                    CachedResolution {
                        output: output.clone(),
                        app: app.clone(),
                        capability: bare_cap.clone(),
                    },
                    ttl,
                    output.etag.clone(),
                );
                Ok(output)
            }
            Err(_) => {
                if let Some(subject) = self.fallback_mappings.get(&bare_cap) {
                    let output = synthesize_fallback(subject, &bare_cap, &self.default_nats_url)?;
                    self.cache.set(
                        key,
                        CachedResolution {
                            output: output.clone(),
                            app,
                            capability: bare_cap,
                        },
                        Some(Duration::from_secs(60)),
                        Some("fallback".to_string()),
                    );
                    Ok(output)
                } else {
                    self.cache.set_negative(key);
                    Err(Error::not_found(format!("capability {cap} could not be resolved")))
                }
            }
        }
    }

    fn spawn_background_revalidate(&self, cap: String, version: Option<String>, ctx: InvocationContext, key: String) {
        let registry = self.registry.clone();
        let cache = self.cache.clone();
        let (app, bare_cap) = split_app_cap(&cap);
        tokio::spawn(async move {
            match registry.resolve(&cap, version.as_deref(), &ctx).await {
                Ok(output) => {
                    let ttl = output.ttl_seconds.map(|s| Duration::from_secs(s.max(1)));
                    cache.set(
                        key,
                        CachedResolution {
                            output,
                            app,
                            capability: bare_cap,
                        },
                        ttl,
                        None,
                    );
                }
                Err(e) => {
                    warn!(capability = %cap, error = %e, "background revalidation failed");
                }
            }
        });
    }

    /// Resolves every input in parallel; failures are collected per-capability
    /// rather than failing the whole batch.
    pub async fn resolve_multiple(
        &self,
        inputs: &[(String, Option<String>)],
        ctx: &InvocationContext,
    ) -> Vec<(String, std::result::Result<ResolveOutput, Error>)> {
        let futures = inputs.iter().map(|(cap, version)| {
            let cap = cap.clone();
            let version = version.clone();
            async move {
                let result = self.resolve(&cap, version.as_deref(), ctx).await;
                (cap, result)
            }
        });
        futures::future::join_all(futures).await
    }

    /// Removes every cache entry whose stored `(app, capability)` pair
    /// matches, closing the substring-vs-canonical-identity gap the design
    /// notes flag by matching on the stored pair rather than parsing keys.
    pub fn invalidate_capability(&self, app: &str, name: &str) {
        debug!(app, name, "invalidating resolution cache entries");
        self.cache
            .retain_values(|entry| !(entry.app == app && entry.capability == name));
    }
}

fn split_app_cap(cap: &str) -> (String, String) {
    match cap.split_once('/') {
        Some((app, name)) => (app.to_string(), name.to_string()),
        None => (String::new(), cap.to_string()),
    }
}

/// Builds a synthesized [`ResolveOutput`] for a fallback mapping: parse the
/// major version from the last subject segment (stripping a leading `v`),
/// `cap:@main/<cap>@<major>.0.0`, default bus URL, 60s TTL, `etag: "fallback"`.
fn synthesize_fallback(subject: &str, cap: &str, default_nats_url: &str) -> Result<ResolveOutput> {
    let major_segment = subject
        .rsplit('.')
        .next()
        .ok_or_else(|| Error::internal(format!("fallback subject {subject:?} has no segments")))?;
    let major_str = major_segment.strip_prefix('v').unwrap_or(major_segment);
    let major: u64 = major_str
        .parse()
        .map_err(|_| Error::internal(format!("fallback subject {subject:?} has non-numeric major")))?;

    Ok(ResolveOutput {
        canonical_identity: format!("cap:@main/{cap}@{major}.0.0"),
        nats_url: default_nats_url.to_string(),
        subject: subject.to_string(),
        major: Some(major),
        resolved_version: format!("{major}.0.0"),
        status: Some("active".to_string()),
        ttl_seconds: Some(60),
        etag: Some("fallback".to_string()),
        methods: None,
    })
}

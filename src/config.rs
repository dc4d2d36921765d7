//! Client/worker configuration: fluent builders plus, behind the `manifest`
//! feature, file-based loading of a worker pool manifest.

use crate::pool::{AuthProvider, TokenProvider};
use crate::resolution::FallbackMappings;
use std::sync::Arc;
use std::time::Duration;

/// Construction parameters for [`crate::client::Client`].
pub struct ClientConfig {
    pub default_nats_url: String,
    pub tenant_id: String,
    pub registry_cap: String,
    pub default_timeout: Duration,
    pub include_timing: bool,
    pub max_pool_connections: usize,
    pub pool_idle_timeout: Duration,
    pub static_access_token: Option<String>,
    pub auth_provider: Option<Arc<dyn AuthProvider>>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
    pub fallback_mappings: FallbackMappings,
    pub include_tenant_in_cache_key: bool,
    pub include_env_in_cache_key: bool,
    pub env: Option<String>,
    pub invalidation_subject_prefix: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            default_nats_url: "nats://127.0.0.1:4222".to_string(),
            tenant_id: "default".to_string(),
            registry_cap: "system.registry".to_string(),
            default_timeout: Duration::from_secs(30),
            include_timing: true,
            max_pool_connections: 8,
            pool_idle_timeout: Duration::from_secs(300),
            static_access_token: None,
            auth_provider: None,
            token_provider: None,
            fallback_mappings: FallbackMappings::new(),
            include_tenant_in_cache_key: false,
            include_env_in_cache_key: false,
            env: None,
            invalidation_subject_prefix: "registry.changed".to_string(),
        }
    }
}

/// Fluent builder for [`ClientConfig`], matching the pack's `with_foo(self, ..)
/// -> Self` idiom rather than a struct literal with many optional fields.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    pub fn with_nats_url(mut self, url: impl Into<String>) -> Self {
        self.config.default_nats_url = url.into();
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.config.tenant_id = tenant_id.into();
        self
    }

    pub fn with_registry_cap(mut self, cap: impl Into<String>) -> Self {
        self.config.registry_cap = cap.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn with_include_timing(mut self, include: bool) -> Self {
        self.config.include_timing = include;
        self
    }

    pub fn with_max_pool_connections(mut self, max: usize) -> Self {
        self.config.max_pool_connections = max;
        self
    }

    pub fn with_pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    pub fn with_static_access_token(mut self, token: impl Into<String>) -> Self {
        self.config.static_access_token = Some(token.into());
        self
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.config.auth_provider = Some(provider);
        self
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.config.token_provider = Some(provider);
        self
    }

    pub fn with_fallback_mapping(mut self, cap: impl Into<String>, subject: impl Into<String>) -> Self {
        self.config.fallback_mappings.insert(cap.into(), subject.into());
        self
    }

    pub fn with_tenant_scoped_cache_key(mut self, scoped: bool) -> Self {
        self.config.include_tenant_in_cache_key = scoped;
        self
    }

    pub fn with_env_scoped_cache_key(mut self, env: impl Into<String>) -> Self {
        self.config.include_env_in_cache_key = true;
        self.config.env = Some(env.into());
        self
    }

    pub fn with_invalidation_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.invalidation_subject_prefix = prefix.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// One worker pool's configuration: a subject/handler-naming unit, not a
/// single connection. Mirrors the spec's `{id, sandboxId, capabilities[],
/// concurrentWorkers, consumerGroup}` worker pool shape.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "manifest", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerPoolConfig {
    pub id: String,
    pub sandbox_id: String,
    pub capabilities: Vec<String>,
    pub concurrent_workers: usize,
    pub consumer_group: String,
}

/// Construction parameters for [`crate::worker::WorkerHost`].
pub struct WorkerConfig {
    pub default_nats_url: String,
    pub registry_cap: String,
    pub pools: Vec<WorkerPoolConfig>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            default_nats_url: "nats://127.0.0.1:4222".to_string(),
            registry_cap: "system.registry".to_string(),
            pools: Vec::new(),
        }
    }
}

/// Fluent builder for [`WorkerConfig`].
#[derive(Default)]
pub struct WorkerHostBuilder {
    config: WorkerConfig,
}

impl WorkerHostBuilder {
    pub fn new() -> Self {
        WorkerHostBuilder::default()
    }

    pub fn with_nats_url(mut self, url: impl Into<String>) -> Self {
        self.config.default_nats_url = url.into();
        self
    }

    pub fn with_registry_cap(mut self, cap: impl Into<String>) -> Self {
        self.config.registry_cap = cap.into();
        self
    }

    pub fn with_pool(mut self, pool: WorkerPoolConfig) -> Self {
        self.config.pools.push(pool);
        self
    }

    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

#[cfg(feature = "manifest")]
mod manifest {
    use super::WorkerPoolConfig;
    use std::fs::File;
    use std::io::Read;
    use std::path::Path;

    /// A file holding a list of worker pool configurations, YAML by
    /// extension (`.yaml`/`.yml`) and JSON otherwise, with optional
    /// `${VAR:DEFAULT}`-style environment expansion.
    pub fn load_pools(
        path: impl AsRef<Path>,
        expand_env: bool,
    ) -> std::result::Result<Vec<WorkerPoolConfig>, Box<dyn std::error::Error + Send + Sync>> {
        let mut contents = String::new();
        File::open(path.as_ref())?.read_to_string(&mut contents)?;
        if expand_env {
            contents = expand(&contents);
        }
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Ok(serde_yaml::from_str(&contents)?)
            }
            _ => Ok(serde_json::from_str(&contents)?),
        }
    }

    fn expand(contents: &str) -> String {
        let mut options = envmnt::ExpandOptions::new();
        options.default_to_empty = false;
        options.expansion_type = Some(envmnt::ExpansionType::UnixBracketsWithDefaults);
        envmnt::expand(contents, Some(options))
    }
}

#[cfg(feature = "manifest")]
pub use manifest::load_pools;


#[cfg(all(test, feature = "manifest"))]
mod manifest_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_pools_reads_yaml_with_env_expansion() {
        std::env::set_var("CAP_INVOKE_TEST_GROUP", "workers-from-env");
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "- id: pool-a\n  sandbox_id: sandbox-a\n  capabilities: [\"my.app/my.cap\"]\n  concurrent_workers: 3\n  consumer_group: \"${{CAP_INVOKE_TEST_GROUP}}\""
        )
        .unwrap();

        let pools = load_pools(file.path(), true).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].consumer_group, "workers-from-env");
        std::env::remove_var("CAP_INVOKE_TEST_GROUP");
    }
}

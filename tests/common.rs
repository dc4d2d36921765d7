//! Shared fixtures for the end-to-end scenario tests: an in-process fake
//! registry that answers the same `remoteCall` wire protocol the client
//! facade speaks, wired onto a [`MockBus`].

use cap_invoke::bus::mock::MockBus;
use cap_invoke::bus::{Bus, BusAuth};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const REGISTRY_SUBJECT: &str = "cap.system.registry.v1";

/// One capability's registry record: what `resolve`/`discover`/`describe`
/// hand back, keyed by `<app>/<name>` capability reference.
#[derive(Clone)]
pub struct Entry {
    pub canonical_identity: String,
    pub nats_url: String,
    pub subject: String,
    pub major: u64,
    pub resolved_version: String,
    pub ttl_seconds: Option<u64>,
}

impl Entry {
    pub fn new(cap_ref: &str, subject: &str, nats_url: &str) -> Self {
        Entry {
            canonical_identity: format!("cap:@main/{cap_ref}@1.0.0"),
            nats_url: nats_url.to_string(),
            subject: subject.to_string(),
            major: 1,
            resolved_version: "1.0.0".to_string(),
            ttl_seconds: None,
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl_seconds = Some(seconds);
        self
    }

    fn to_json(&self) -> Value {
        json!({
            "canonicalIdentity": self.canonical_identity,
            "natsUrl": self.nats_url,
            "subject": self.subject,
            "major": self.major,
            "resolvedVersion": self.resolved_version,
            "status": "active",
            "ttlSeconds": self.ttl_seconds,
            "etag": "e1",
        })
    }
}

/// A fake registry capability provider: answers `resolve`/`discover`/`describe`
/// requests against an in-memory map, and can produce the matching bootstrap
/// reply. `resolve_calls` lets tests assert on cache-hit behavior.
pub struct TestRegistry {
    pub bus: MockBus,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    pub resolve_calls: Arc<Mutex<HashMap<String, u32>>>,
}

impl TestRegistry {
    pub fn new() -> Self {
        let bus = MockBus::new();
        let entries: Arc<Mutex<HashMap<String, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let resolve_calls = Arc::new(Mutex::new(HashMap::new()));

        let entries_for_handler = entries.clone();
        let calls_for_handler = resolve_calls.clone();
        bus.handle(REGISTRY_SUBJECT, move |payload| {
            let request: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
            let id = request["id"].as_str().unwrap_or_default().to_string();
            let method = request["method"].as_str().unwrap_or_default();

            let result = match method {
                "resolve" => {
                    let cap = request["params"]["cap"].as_str().unwrap_or_default();
                    *calls_for_handler.lock().unwrap().entry(cap.to_string()).or_insert(0) += 1;
                    entries_for_handler.lock().unwrap().get(cap).map(Entry::to_json)
                }
                "describe" => {
                    let cap_ref = request["params"]["capRef"].as_str().unwrap_or_default();
                    entries_for_handler.lock().unwrap().get(cap_ref).map(Entry::to_json)
                }
                "discover" => {
                    let query = request["params"]["query"].as_str().unwrap_or_default();
                    let matches: Vec<Value> = entries_for_handler
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|(k, _)| k.contains(query))
                        .map(|(_, v)| v.to_json())
                        .collect();
                    return serde_json::to_vec(&json!({"id": id, "ok": true, "result": matches})).unwrap();
                }
                _ => None,
            };

            match result {
                Some(value) => serde_json::to_vec(&json!({"id": id, "ok": true, "result": value})).unwrap(),
                None => serde_json::to_vec(&json!({
                    "id": id,
                    "ok": false,
                    "error": {"code": "NOT_FOUND", "message": "no such capability"}
                }))
                .unwrap(),
            }
        });

        TestRegistry { bus, entries, resolve_calls }
    }

    pub fn add(&self, cap_ref: &str, entry: Entry) {
        self.entries.lock().unwrap().insert(cap_ref.to_string(), entry);
    }

    pub fn resolve_count(&self, cap_ref: &str) -> u32 {
        *self.resolve_calls.lock().unwrap().get(cap_ref).unwrap_or(&0)
    }

    /// Installs a `system.registry.bootstrap` handler on this bus that seeds
    /// the registry's own subject plus every `(cap_ref, subject)` pair given.
    pub fn install_bootstrap(&self, default_nats_url: &str, extra: &[(&str, &str)]) {
        let mut capabilities = serde_json::Map::new();
        capabilities.insert(
            "system.registry".to_string(),
            json!({
                "canonicalIdentity": "cap:@main/system/registry@1.0.0",
                "subject": REGISTRY_SUBJECT,
                "natsUrl": default_nats_url,
            }),
        );
        for (cap_ref, subject) in extra {
            capabilities.insert(cap_ref.to_string(), json!({
                "canonicalIdentity": format!("cap:@main/{cap_ref}@1.0.0"),
                "subject": subject,
            }));
        }
        let reply = serde_json::to_vec(&json!({"capabilities": Value::Object(capabilities)})).unwrap();
        self.bus.handle("system.registry.bootstrap", move |_msg| reply.clone());
    }
}

/// A [`cap_invoke::pool::AuthProvider`] that always succeeds, for pool tests
/// that need a non-default bus connection.
pub struct AllowAllAuth;

#[async_trait::async_trait]
impl cap_invoke::pool::AuthProvider for AllowAllAuth {
    async fn authenticate(&self, _nats_url: &str, _access_token: Option<&str>) -> cap_invoke::Result<cap_invoke::pool::Credentials> {
        Ok(cap_invoke::pool::Credentials::Token {
            token: "tok".to_string(),
            expires_at: None,
        })
    }
}

/// A [`cap_invoke::resolution::RegistryCaller`] that speaks the same request
/// shape [`TestRegistry`] answers, for tests exercising [`ResolutionClient`]
/// directly without going through the full client facade.
pub struct BusRegistryCaller {
    pub bus: MockBus,
}

#[async_trait::async_trait]
impl cap_invoke::resolution::RegistryCaller for BusRegistryCaller {
    async fn resolve(
        &self,
        cap: &str,
        version: Option<&str>,
        ctx: &cap_invoke::InvocationContext,
    ) -> cap_invoke::Result<cap_invoke::resolution::ResolveOutput> {
        let value = self.call("resolve", json!({"cap": cap, "version": version}), ctx).await?;
        serde_json::from_value(value).map_err(cap_invoke::Error::from)
    }

    async fn discover(
        &self,
        query: &str,
        ctx: &cap_invoke::InvocationContext,
    ) -> cap_invoke::Result<Vec<cap_invoke::resolution::ResolveOutput>> {
        let value = self.call("discover", json!({"query": query}), ctx).await?;
        serde_json::from_value(value).map_err(cap_invoke::Error::from)
    }

    async fn describe(
        &self,
        cap_ref: &str,
        ctx: &cap_invoke::InvocationContext,
    ) -> cap_invoke::Result<cap_invoke::resolution::ResolveOutput> {
        let value = self.call("describe", json!({"capRef": cap_ref}), ctx).await?;
        serde_json::from_value(value).map_err(cap_invoke::Error::from)
    }
}

impl BusRegistryCaller {
    async fn call(&self, method: &str, params: Value, ctx: &cap_invoke::InvocationContext) -> cap_invoke::Result<Value> {
        let request = json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "type": "invoke",
            "cap": "system.registry",
            "method": method,
            "params": params,
            "ctx": ctx,
        });
        let body = serde_json::to_vec(&request).map_err(cap_invoke::Error::from)?;
        let message = self
            .bus
            .request(REGISTRY_SUBJECT, body, std::time::Duration::from_secs(1))
            .await?;
        let response: Value = serde_json::from_slice(&message.payload).map_err(cap_invoke::Error::from)?;
        if response["ok"].as_bool().unwrap_or(false) {
            Ok(response["result"].clone())
        } else {
            Err(cap_invoke::Error::not_found(
                response["error"]["message"].as_str().unwrap_or("not found").to_string(),
            ))
        }
    }
}

/// A [`cap_invoke::bus::Connector`] backing a test [`ConnectionPool`] with a
/// registry of named [`MockBus`]es, keyed by URL, so a pool can dial more
/// than one distinct bus in a single test.
pub fn multi_bus_connector(buses: HashMap<String, MockBus>) -> cap_invoke::bus::Connector {
    let buses = Arc::new(buses);
    Arc::new(move |url: String, _auth: BusAuth| {
        let buses = buses.clone();
        async move {
            let normalized = url.to_lowercase();
            match buses.get(&normalized) {
                Some(bus) => Ok(Arc::new(bus.clone()) as Arc<dyn Bus>),
                None => Err(cap_invoke::Error::internal(format!("no mock bus registered for {normalized}"))),
            }
        }
        .boxed()
    })
}

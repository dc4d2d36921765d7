//! Worker Consumer: resolves each configured worker pool's capability
//! subjects via bootstrap, opens concurrent queue-group subscriptions, and
//! dispatches incoming envelopes to registered handlers.

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
use crate::bus::{Bus, BusAuth, BusMessage};
use crate::config::{WorkerConfig, WorkerPoolConfig};
use crate::envelope::InvocationEnvelope;
use crate::error::{CapabilityError, Code, Error, Result};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::wire::BootstrapReply;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, instrument, warn};

use crate::client::BOOTSTRAP_SUBJECT;

/// A capability handler: given the decoded envelope and the pool's sandbox
/// id, produces the `data` payload of a successful reply, or a structured
/// error. A handler that panics is converted to `INTERNAL_ERROR
/// retryable=true` by the dispatch loop, per spec §4.10's "uncaught handler
/// exceptions".
pub type CapabilityHandler =
    Arc<dyn Fn(InvocationEnvelope, String) -> BoxFuture<'static, std::result::Result<Value, CapabilityError>> + Send + Sync>;

/// Returns the request's own `params` unchanged; the default handler for any
/// capability without one registered.
fn echo_handler() -> CapabilityHandler {
    Arc::new(|envelope, _sandbox_id| Box::pin(async move { Ok(envelope.params) }))
}

struct RunningSubscription {
    stop: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl RunningSubscription {
    /// Signals the loop to stop accepting further messages, then waits for
    /// the in-flight one (if any) to finish before returning.
    async fn drain(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.task.await;
    }
}

/// Hosts one or more worker pools, each a named set of capability
/// subscriptions sharing a consumer group. Construction fetches the
/// bootstrap mapping once; [`WorkerHost::reconfigure`] re-fetches it and
/// hot-swaps subscriptions without dropping in-flight work.
pub struct WorkerHost {
    default_bus: Arc<dyn Bus>,
    owns_default: bool,
    pool: Arc<ConnectionPool>,
    default_timeout: std::time::Duration,
    handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>>,
    subscriptions: tokio::sync::Mutex<Vec<RunningSubscription>>,
}

impl WorkerHost {
    /// Connects to the default bus (unless supplied) and opens subscriptions
    /// for every pool in `config.pools`.
    pub async fn connect(config: WorkerConfig, default_bus: Option<Arc<dyn Bus>>) -> Result<Self> {
        let (default_bus, owns_default) = match default_bus {
            Some(bus) => (bus, false),
            None => {
                let bus = NatsBus::connect(&config.default_nats_url, BusAuth::None).await?;
                (Arc::new(bus) as Arc<dyn Bus>, true)
            }
        };

        let pool = ConnectionPool::new(
            PoolConfig::default(),
            config.default_nats_url.clone(),
            default_bus.clone(),
            crate::bus::nats::connector(),
            None,
            None,
        );

        let host = WorkerHost {
            default_bus,
            owns_default,
            pool,
            default_timeout: std::time::Duration::from_secs(30),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
        };

        host.reconfigure(config.pools).await?;
        Ok(host)
    }

    /// Registers (or replaces) the handler for `capability`.
    pub fn register_handler(&self, capability: impl Into<String>, handler: CapabilityHandler) {
        self.handlers.write().unwrap().insert(capability.into(), handler);
    }

    /// Re-fetches the bootstrap mapping and replaces every subscription.
    /// Current subscriptions are drained (letting in-flight messages finish)
    /// before the new ones are opened, per spec §4.10's hot-reload rule.
    #[instrument(level = "info", skip(self, pools))]
    pub async fn reconfigure(&self, pools: Vec<WorkerPoolConfig>) -> Result<()> {
        let bootstrap_msg = self
            .default_bus
            .request(BOOTSTRAP_SUBJECT, b"{}".to_vec(), self.default_timeout)
            .await?;
        let reply: BootstrapReply = serde_json::from_slice(&bootstrap_msg.payload)
            .map_err(|e| Error::internal(format!("malformed bootstrap reply: {e}")))?;

        let mut new_subscriptions = Vec::new();
        for pool in &pools {
            for capability in &pool.capabilities {
                let entry = reply
                    .capabilities
                    .get(capability)
                    .ok_or_else(|| Error::unknown_subject(format!("no bootstrap entry for capability {capability}")))?;
                let nats_url = entry
                    .nats_url
                    .clone()
                    .unwrap_or_else(|| self.pool.default_url().to_string());
                let bus = self.pool.get_or_connect(&nats_url).await?;
                let subject = entry.subject.clone();
                for _ in 0..pool.concurrent_workers.max(1) {
                    new_subscriptions.push(
                        self.spawn_worker(bus.clone(), subject.clone(), pool.consumer_group.clone(), pool.sandbox_id.clone())
                            .await?,
                    );
                }
            }
        }

        let old = {
            let mut guard = self.subscriptions.lock().await;
            std::mem::replace(&mut *guard, new_subscriptions)
        };
        for sub in old {
            sub.drain().await;
        }

        info!(pool_count = pools.len(), "worker host reconfigured");
        Ok(())
    }

    async fn spawn_worker(
        &self,
        bus: Arc<dyn Bus>,
        subject: String,
        consumer_group: String,
        sandbox_id: String,
    ) -> Result<RunningSubscription> {
        let mut subscription = bus.subscribe(&subject, Some(&consumer_group)).await?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handlers = self.handlers.clone();

        let task = tokio::spawn(async move {
            loop {
                if stop_clone.load(Ordering::SeqCst) {
                    break;
                }
                let msg = match subscription.next().await {
                    Some(msg) => msg,
                    None => break,
                };
                handle_message(&handlers, &bus, &sandbox_id, msg).await;
                if stop_clone.load(Ordering::SeqCst) {
                    break;
                }
            }
            let _ = subscription.unsubscribe().await;
        });

        Ok(RunningSubscription { stop, task })
    }

    /// Stops every subscription and closes the default bus connection iff
    /// this host owns it.
    pub async fn close(&self) -> Result<()> {
        let subs = {
            let mut guard = self.subscriptions.lock().await;
            std::mem::take(&mut *guard)
        };
        for sub in subs {
            sub.drain().await;
        }
        self.pool.close_all().await;
        if self.owns_default {
            self.default_bus.close().await?;
        }
        Ok(())
    }
}

async fn handle_message(
    handlers: &Arc<RwLock<HashMap<String, CapabilityHandler>>>,
    bus: &Arc<dyn Bus>,
    sandbox_id: &str,
    msg: BusMessage,
) {
    let reply_to = match msg.reply_to {
        Some(r) => r,
        None => {
            warn!("worker received a message with no reply-to subject; dropping");
            return;
        }
    };

    let reply = dispatch(handlers, sandbox_id, &msg.payload).await;
    let body = match serde_json::to_vec(&reply) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "failed to serialize worker reply");
            return;
        }
    };
    if let Err(e) = bus.publish(&reply_to, body).await {
        error!(error = %e, reply_to = %reply_to, "failed to publish worker reply");
    }
}

async fn dispatch(handlers: &Arc<RwLock<HashMap<String, CapabilityHandler>>>, sandbox_id: &str, payload: &[u8]) -> Value {
    let envelope: InvocationEnvelope = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            return error_reply(CapabilityError::new(Code::InvalidRequest, format!("malformed envelope: {e}")));
        }
    };
    if envelope.capability.is_empty() || envelope.method.is_empty() {
        return error_reply(CapabilityError::new(Code::InvalidArgument, "envelope missing capability or method"));
    }

    let handler = {
        let guard = handlers.read().unwrap();
        guard.get(&envelope.capability).cloned()
    }
    .unwrap_or_else(echo_handler);

    let outcome = std::panic::AssertUnwindSafe(handler(envelope, sandbox_id.to_string()))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(data)) => serde_json::json!({"ok": true, "data": data}),
        Ok(Err(capability_error)) => error_reply(capability_error),
        Err(_) => error_reply(CapabilityError::new(Code::InternalError, "handler panicked").retryable(true)),
    }
}

fn error_reply(error: CapabilityError) -> Value {
    serde_json::json!({"ok": false, "error": error})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::config::WorkerPoolConfig;
    use crate::envelope::InvocationContext;

    fn bootstrap_reply() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "capabilities": {
                "my.app/my.cap": {
                    "canonicalIdentity": "cap:@main/my.app/my.cap@1.0.0",
                    "subject": "cap.my.app.my_cap.v1"
                }
            }
        }))
        .unwrap()
    }

    fn test_pool() -> WorkerPoolConfig {
        WorkerPoolConfig {
            id: "pool-a".into(),
            sandbox_id: "sandbox-a".into(),
            capabilities: vec!["my.app/my.cap".into()],
            concurrent_workers: 2,
            consumer_group: "workers".into(),
        }
    }

    #[tokio::test]
    async fn dispatch_falls_back_to_echo_handler() {
        let handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let ctx = InvocationContext::new("tenant-a", "req-1");
        let envelope = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({"x": 1}), ctx);
        let payload = serde_json::to_vec(&envelope).unwrap();

        let reply = dispatch(&handlers, "sandbox-a", &payload).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["data"], serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn dispatch_rejects_malformed_payload() {
        let handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let reply = dispatch(&handlers, "sandbox-a", b"not json").await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn dispatch_rejects_envelope_missing_method() {
        let handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        let ctx = InvocationContext::new("tenant-a", "req-1");
        let envelope = InvocationEnvelope::new("my.app/my.cap", "", serde_json::json!({}), ctx);
        let payload = serde_json::to_vec(&envelope).unwrap();

        let reply = dispatch(&handlers, "sandbox-a", &payload).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn dispatch_invokes_registered_handler() {
        let handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        handlers.write().unwrap().insert(
            "my.app/my.cap".to_string(),
            Arc::new(|_envelope, _sandbox_id| Box::pin(async move { Ok(serde_json::json!("handled")) })),
        );
        let ctx = InvocationContext::new("tenant-a", "req-1");
        let envelope = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({}), ctx);
        let payload = serde_json::to_vec(&envelope).unwrap();

        let reply = dispatch(&handlers, "sandbox-a", &payload).await;
        assert_eq!(reply["data"], serde_json::json!("handled"));
    }

    #[tokio::test]
    async fn dispatch_converts_handler_panic_to_internal_error() {
        let handlers: Arc<RwLock<HashMap<String, CapabilityHandler>>> = Arc::new(RwLock::new(HashMap::new()));
        handlers.write().unwrap().insert(
            "my.app/my.cap".to_string(),
            Arc::new(|_envelope, _sandbox_id| Box::pin(async move { panic!("boom") })),
        );
        let ctx = InvocationContext::new("tenant-a", "req-1");
        let envelope = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({}), ctx);
        let payload = serde_json::to_vec(&envelope).unwrap();

        let reply = dispatch(&handlers, "sandbox-a", &payload).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(reply["error"]["retryable"], true);
    }

    #[tokio::test]
    async fn connect_opens_concurrent_worker_subscriptions() {
        let bus = MockBus::new();
        bus.handle("system.registry.bootstrap", |_msg| bootstrap_reply());
        let bus_arc: Arc<dyn Bus> = Arc::new(bus);

        let config = WorkerConfig {
            default_nats_url: "nats://default:4222".to_string(),
            registry_cap: "system.registry".to_string(),
            pools: vec![test_pool()],
        };
        let host = WorkerHost::connect(config, Some(bus_arc)).await.unwrap();
        assert_eq!(host.subscriptions.lock().await.len(), 2);
        host.close().await.unwrap();
    }

    #[tokio::test]
    async fn end_to_end_message_is_echoed_and_replied() {
        let bus = MockBus::new();
        bus.handle("system.registry.bootstrap", |_msg| bootstrap_reply());
        let bus_arc: Arc<dyn Bus> = Arc::new(bus.clone());

        let config = WorkerConfig {
            default_nats_url: "nats://default:4222".to_string(),
            registry_cap: "system.registry".to_string(),
            pools: vec![test_pool()],
        };
        let host = WorkerHost::connect(config, Some(bus_arc)).await.unwrap();

        let ctx = InvocationContext::new("tenant-a", "req-1");
        let envelope = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({"x": 1}), ctx);
        let body = serde_json::to_vec(&envelope).unwrap();
        let reply = bus.request("cap.my.app.my_cap.v1", body, std::time::Duration::from_secs(1)).await.unwrap();
        let decoded: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(decoded["ok"], true);
        assert_eq!(decoded["data"], serde_json::json!({"x": 1}));

        host.close().await.unwrap();
    }
}

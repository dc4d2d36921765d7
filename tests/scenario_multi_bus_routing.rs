//! Multi-bus routing: a capability resolved to a non-default bus URL is
//! dialed through the connection pool and invoked there, never touching the
//! default bus's subjects.

use cap_invoke::bus::mock::MockBus;
use cap_invoke::bus::Bus;
use cap_invoke::envelope::{InvocationContext, InvocationEnvelope, InvocationResult, ResolvedCapability};
use cap_invoke::pipeline::CancelSignal;
use cap_invoke::pool::{ConnectionPool, PoolConfig};
use cap_invoke::transport::{TransportConfig, TransportCore};
use crate::common::{multi_bus_connector, AllowAllAuth};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn invocation_against_non_default_bus_reaches_that_bus_only() {
    let default_bus = MockBus::new();
    default_bus.handle("cap.default-only", |_msg| {
        serde_json::to_vec(&serde_json::json!({"ok": true, "data": "should-not-be-called"})).unwrap()
    });

    let sandbox_bus = MockBus::new();
    sandbox_bus.handle("cap.sandboxed", |_msg| {
        serde_json::to_vec(&serde_json::json!({"ok": true, "data": "sandbox-pong"})).unwrap()
    });

    let mut buses = HashMap::new();
    buses.insert("nats://sandbox:4222".to_string(), sandbox_bus);

    let default_arc: Arc<dyn Bus> = Arc::new(default_bus);
    let pool = ConnectionPool::new(
        PoolConfig::default(),
        "nats://default:4222",
        default_arc,
        multi_bus_connector(buses),
        Some(Arc::new(AllowAllAuth)),
        None,
    );

    let transport = TransportCore::new(pool.clone(), TransportConfig::default());

    let ctx = InvocationContext::new("tenant-a", "req-1");
    let mut envelope = InvocationEnvelope::new("my.app/sandboxed", "ping", serde_json::json!({}), ctx);
    envelope.resolved = Some(ResolvedCapability {
        nats_url: "nats://sandbox:4222".to_string(),
        subject: "cap.sandboxed".to_string(),
        version: "1.0.0".to_string(),
        ..Default::default()
    });

    let result = transport.invoke(envelope, CancelSignal::new()).await;
    match result {
        InvocationResult::Ok { data, .. } => assert_eq!(data, serde_json::json!("sandbox-pong")),
        InvocationResult::Err { error, .. } => panic!("unexpected error: {error:?}"),
    }

    // The pool dialed exactly the sandbox bus, leaving the default connection
    // untouched as a distinct, still-open connection.
    assert_eq!(pool.size(), 1);
    assert!(pool.connected_at("nats://sandbox:4222").is_some());
}

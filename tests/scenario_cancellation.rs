//! Cancellation: a worker that receives a request but never replies is raced
//! against a deadline computed from the invocation context's timeout, and
//! the client sees a structured timeout rather than hanging forever.

use cap_invoke::bus::Bus;
use cap_invoke::{ClientConfig, Code, InvocationContext, InvocationResult};
use crate::common::TestRegistry;
use std::sync::Arc;

#[tokio::test]
async fn unanswered_worker_yields_timeout_not_a_hang() {
    let registry = TestRegistry::new();
    registry.install_bootstrap("nats://default:4222", &[("my.app/my.cap", "cap.my.app.my_cap.v1")]);

    // A subscriber exists on the resolved subject but never replies.
    let mut sub = registry.bus.subscribe("cap.my.app.my_cap.v1", None).await.unwrap();
    tokio::spawn(async move {
        let _ = sub.next().await;
    });

    let bus_arc: Arc<dyn Bus> = Arc::new(registry.bus.clone());
    let config = ClientConfig {
        default_nats_url: "nats://default:4222".to_string(),
        ..Default::default()
    };
    let client = cap_invoke::Client::connect(config, Some(bus_arc), vec![]).await.unwrap();

    let mut ctx = InvocationContext::new("tenant-a", "req-1");
    ctx.timeout_ms = Some(50);

    let result = client
        .invoke("my.app/my.cap", "ping", serde_json::json!({}), Some(ctx))
        .await;
    match result {
        InvocationResult::Err { error, .. } => {
            assert_eq!(error.code, Code::Timeout);
        }
        InvocationResult::Ok { .. } => panic!("expected a timeout, got a reply"),
    }

    client.close().await.unwrap();
}

//! Negative caching and fallback synthesis: an unresolvable capability with
//! no fallback mapping is cached negative so repeat lookups don't hammer the
//! registry, while one with a fallback mapping is synthesized from the
//! configured subject instead of failing.

use cap_invoke::envelope::InvocationContext;
use cap_invoke::resolution::{KeyOptions, ResolutionClient, ResolutionClientConfig};
use cap_invoke::cache::TtlCacheConfig;
use crate::common::{BusRegistryCaller, TestRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn client_with_fallback(registry: &TestRegistry, fallback: HashMap<String, String>) -> ResolutionClient {
    let caller = Arc::new(BusRegistryCaller { bus: registry.bus.clone() });
    ResolutionClient::new(
        ResolutionClientConfig {
            key_options: KeyOptions::default(),
            fallback_mappings: fallback,
            default_nats_url: "nats://default:4222".to_string(),
            cache: TtlCacheConfig::default(),
        },
        caller,
    )
}

#[tokio::test]
async fn unresolvable_capability_without_fallback_is_cached_negative() {
    let registry = TestRegistry::new();
    let client = client_with_fallback(&registry, HashMap::new());
    let ctx = InvocationContext::new("tenant-a", "req-1");

    let err = client.resolve("unknown/cap", None, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("could not be resolved"));
    assert_eq!(registry.resolve_count("unknown/cap"), 1);

    // Second lookup hits the negative cache entry; no further registry call.
    let err = client.resolve("unknown/cap", None, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("negative cache"));
    assert_eq!(registry.resolve_count("unknown/cap"), 1);
}

#[tokio::test]
async fn unresolvable_capability_with_fallback_synthesizes_a_result() {
    let registry = TestRegistry::new();
    let mut fallback = HashMap::new();
    fallback.insert("legacy.cap".to_string(), "legacy.subject.v2".to_string());
    let client = client_with_fallback(&registry, fallback);
    let ctx = InvocationContext::new("tenant-a", "req-1");

    let output = client.resolve("legacy.cap", None, &ctx).await.unwrap();
    assert_eq!(output.subject, "legacy.subject.v2");
    assert_eq!(output.major, Some(2));
    assert_eq!(output.etag.as_deref(), Some("fallback"));
    assert_eq!(output.nats_url, "nats://default:4222");
}

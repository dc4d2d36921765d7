//! Stale-while-revalidate: once the TTL has passed but the entry is still
//! within the stale window, a resolve call returns the last-known value
//! immediately and kicks off a background refresh rather than blocking on
//! the registry.

use cap_invoke::envelope::InvocationContext;
use cap_invoke::resolution::{KeyOptions, ResolutionClient, ResolutionClientConfig};
use cap_invoke::cache::TtlCacheConfig;
use crate::common::{BusRegistryCaller, Entry, TestRegistry};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn stale_entry_is_served_immediately_and_refreshed_in_background() {
    let registry = TestRegistry::new();
    registry.add("my.app/my.cap", Entry::new("my.app/my.cap", "cap.my.app.my_cap.v1", "nats://default:4222").with_ttl(1));

    let caller = Arc::new(BusRegistryCaller { bus: registry.bus.clone() });
    let client = ResolutionClient::new(
        ResolutionClientConfig {
            key_options: KeyOptions::default(),
            fallback_mappings: Default::default(),
            default_nats_url: "nats://default:4222".to_string(),
            cache: TtlCacheConfig {
                default_ttl: Duration::from_millis(50),
                negative_ttl: Duration::from_secs(10),
                stale_window: Some(Duration::from_secs(5)),
                max_entries: None,
            },
        },
        caller,
    );

    let ctx = InvocationContext::new("tenant-a", "req-1");

    let first = client.resolve("my.app/my.cap", None, &ctx).await.unwrap();
    assert_eq!(first.subject, "cap.my.app.my_cap.v1");
    assert_eq!(registry.resolve_count("my.app/my.cap"), 1);

    // Let the TTL (but not the stale window) elapse.
    tokio::time::sleep(Duration::from_millis(80)).await;

    let second = client.resolve("my.app/my.cap", None, &ctx).await.unwrap();
    assert_eq!(second.subject, "cap.my.app.my_cap.v1");

    // The stale read returned the cached value without waiting on the
    // background refresh; give the spawned revalidation a moment to land.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.resolve_count("my.app/my.cap"), 2);
}

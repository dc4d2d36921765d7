//! Invalidation Subscriber: listens for registry change events on the
//! default bus and dispatches them to registered handlers.

use crate::bus::Bus;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Payload published on `registry.changed` / `registry.changed.<scope>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryChangedEvent {
    pub app: String,
    pub capability: String,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub new_default_major: Option<u64>,
    #[serde(default)]
    pub affected_majors: Vec<u64>,
    pub revision: u64,
    pub etag: String,
    pub timestamp: i64,
    #[serde(default)]
    pub env: Option<String>,
}

/// A registered callback invoked for every decoded change event. Handler
/// failures are logged, never allowed to interrupt the message stream.
pub type ChangeHandler = Arc<dyn Fn(&RegistryChangedEvent) + Send + Sync>;

/// Subscribes to the global (`subjectPrefix`) and granular
/// (`subjectPrefix.*`) change-event subjects on the default bus.
pub struct InvalidationSubscriber {
    bus: Arc<dyn Bus>,
    subject_prefix: String,
    handlers: Arc<std::sync::Mutex<Vec<ChangeHandler>>>,
    stopped: Arc<AtomicBool>,
}

impl InvalidationSubscriber {
    pub fn new(bus: Arc<dyn Bus>, subject_prefix: impl Into<String>) -> Self {
        InvalidationSubscriber {
            bus,
            subject_prefix: subject_prefix.into(),
            handlers: Arc::new(std::sync::Mutex::new(Vec::new())),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn on_change(&self, handler: ChangeHandler) {
        self.handlers.lock().unwrap().push(handler);
    }

    /// Starts the dispatch loops for both subjects. Each runs until `stop` is
    /// called or the subscription's bus connection closes.
    pub async fn start(&self) -> Result<()> {
        self.spawn_loop(self.subject_prefix.clone()).await?;
        self.spawn_loop(format!("{}.*", self.subject_prefix)).await?;
        Ok(())
    }

    async fn spawn_loop(&self, subject: String) -> Result<()> {
        let mut subscription = self.bus.subscribe(&subject, None).await?;
        let handlers = self.handlers.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            while !stopped.load(Ordering::SeqCst) {
                match subscription.next().await {
                    Some(msg) => dispatch(&handlers, &msg.payload),
                    None => break,
                }
            }
            let _ = subscription.unsubscribe().await;
        });
        Ok(())
    }

    /// Idempotent: calling `stop` more than once is a no-op.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

fn dispatch(handlers: &Arc<std::sync::Mutex<Vec<ChangeHandler>>>, payload: &[u8]) {
    let event: RegistryChangedEvent = match serde_json::from_slice(payload) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "failed to decode RegistryChangedEvent; dropping message");
            return;
        }
    };
    let handlers = handlers.lock().unwrap();
    for handler in handlers.iter() {
        // A panicking handler would otherwise kill this dispatch task and
        // silently stop the message stream; catch and log instead.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
        if let Err(_) = result {
            error!(app = %event.app, capability = %event.capability, "invalidation handler panicked");
        }
    }
}

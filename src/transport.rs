//! Transport Core: acquires a pooled connection, serializes the wire
//! payload, issues a request-reply, decodes the structured result.

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

use crate::bus::Bus;
use crate::envelope::{InvocationEnvelope, InvocationMeta, InvocationResult, RawReply};
use crate::error::Code;
use crate::pipeline::CancelSignal;
use crate::pool::ConnectionPool;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::instrument;

fn unix_ms(instant_offset: Instant, started_wall: i64, started_mono: Instant) -> i64 {
    started_wall + instant_offset.duration_since(started_mono).as_millis() as i64
}

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn err_result(code: Code, message: impl Into<String>, meta: InvocationMeta) -> InvocationResult {
    InvocationResult::err_code(code, message, meta)
}

/// The transport core's tunables: the default per-call timeout and whether
/// `meta.durationMs` is actually computed or left at zero.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub default_timeout: Duration,
    pub include_timing: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            default_timeout: Duration::from_secs(30),
            include_timing: true,
        }
    }
}

/// Sends the resolved envelope over the bus and decodes the reply into an
/// [`InvocationResult`]. This is the innermost handler every pipeline wraps.
pub struct TransportCore {
    pool: Arc<ConnectionPool>,
    config: TransportConfig,
}

impl TransportCore {
    pub fn new(pool: Arc<ConnectionPool>, config: TransportConfig) -> Self {
        TransportCore { pool, config }
    }

    #[instrument(level = "debug", skip(self, envelope, cancel), fields(capability = %envelope.capability, method = %envelope.method))]
    pub async fn invoke(&self, envelope: InvocationEnvelope, cancel: CancelSignal) -> InvocationResult {
        let started_mono = Instant::now();
        let started_wall = now_unix_ms();

        let resolved = match &envelope.resolved {
            Some(r) if !r.subject.is_empty() => r,
            _ => {
                return err_result(
                    Code::UnknownSubject,
                    "envelope has no resolved subject",
                    self.meta(started_wall, started_mono, started_mono),
                );
            }
        };
        if resolved.nats_url.is_empty() {
            return err_result(
                Code::InternalError,
                "envelope has no resolved nats url",
                self.meta(started_wall, started_mono, started_mono),
            );
        }

        let connection = match self.pool.get_or_connect(&resolved.nats_url).await {
            Ok(c) => c,
            Err(e) => {
                return err_result(
                    e.into_capability_error().code,
                    "failed to acquire bus connection",
                    self.meta(started_wall, started_mono, started_mono),
                );
            }
        };

        let payload = json!({
            "capability": envelope.capability,
            "version": envelope.version,
            "method": envelope.method,
            "params": envelope.params,
            "ctx": envelope.ctx,
        });
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                return err_result(
                    Code::InternalError,
                    format!("failed to serialize request: {e}"),
                    self.meta(started_wall, started_mono, started_mono),
                );
            }
        };

        let timeout = envelope
            .ctx
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_timeout);

        let request = connection.request(&resolved.subject, body, timeout);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let ended_mono = Instant::now();
                let reason = cancel.reason().unwrap_or(Code::Cancelled);
                return err_result(
                    reason,
                    "invocation cancelled",
                    self.meta(started_wall, started_mono, ended_mono),
                );
            }
            result = request => result,
        };

        let ended_mono = Instant::now();
        let meta = self.meta(started_wall, started_mono, ended_mono);

        let message = match outcome {
            Ok(message) => message,
            Err(e) => return err_result(e.into_capability_error().code, e.to_string(), meta),
        };

        let reply: RawReply = match serde_json::from_slice(&message.payload) {
            Ok(r) => r,
            Err(e) => {
                return err_result(
                    Code::InternalError,
                    format!("failed to decode reply: {e}"),
                    meta,
                );
            }
        };

        if !reply.ok {
            let error = reply.error.unwrap_or_default_error();
            return InvocationResult::err(error, meta);
        }

        let data = reply
            .data
            .or(reply.result)
            .unwrap_or(serde_json::Value::Null);
        InvocationResult::ok(data, meta)
    }

    fn meta(&self, started_wall: i64, started_mono: Instant, ended_mono: Instant) -> InvocationMeta {
        let ended_wall = unix_ms(ended_mono, started_wall, started_mono);
        InvocationMeta {
            started_at_unix_ms: started_wall,
            ended_at_unix_ms: ended_wall,
            duration_ms: if self.config.include_timing {
                ended_wall - started_wall
            } else {
                0
            },
            ..Default::default()
        }
    }
}

trait RawReplyErrorExt {
    fn unwrap_or_default_error(self) -> crate::error::CapabilityError;
}

impl RawReplyErrorExt for Option<crate::envelope::RawReplyError> {
    fn unwrap_or_default_error(self) -> crate::error::CapabilityError {
        match self {
            Some(e) => crate::error::CapabilityError {
                code: e.code.unwrap_or(Code::InternalError),
                message: e.message.unwrap_or_else(|| "Unknown server error".to_string()),
                retryable: e.retryable.unwrap_or(false),
                details: e.details,
            },
            None => crate::error::CapabilityError::new(Code::InternalError, "Unknown server error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::MockBus;
    use crate::bus::BusAuth;
    use crate::envelope::{InvocationContext, ResolvedCapability};
    use crate::pool::PoolConfig;
    use futures::FutureExt;

    fn mock_connector() -> crate::bus::Connector {
        Arc::new(|_url: String, _auth: BusAuth| {
            async move {
                let bus: Arc<dyn Bus> = Arc::new(MockBus::new());
                Ok(bus)
            }
            .boxed()
        })
    }

    fn test_pool(default_bus: MockBus) -> Arc<ConnectionPool> {
        let default: Arc<dyn Bus> = Arc::new(default_bus);
        ConnectionPool::new(
            PoolConfig::default(),
            "nats://default:4222",
            default,
            mock_connector(),
            None,
            None,
        )
    }

    fn resolved_envelope(subject: &str) -> InvocationEnvelope {
        let ctx = InvocationContext::new("tenant-a", "req-1");
        let mut env = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({"x": 1}), ctx);
        env.resolved = Some(ResolvedCapability {
            nats_url: "nats://default:4222".into(),
            subject: subject.into(),
            version: "1.0.0".into(),
            ..Default::default()
        });
        env
    }

    #[tokio::test]
    async fn successful_reply_yields_ok_result_with_data() {
        let bus = MockBus::new();
        bus.handle("cap.ping", |_msg| {
            serde_json::to_vec(&serde_json::json!({"ok": true, "data": "pong"})).unwrap()
        });
        let pool = test_pool(bus);
        let core = TransportCore::new(pool, TransportConfig::default());

        let result = core.invoke(resolved_envelope("cap.ping"), CancelSignal::new()).await;
        match result {
            InvocationResult::Ok { data, .. } => assert_eq!(data, serde_json::json!("pong")),
            InvocationResult::Err { error, .. } => panic!("unexpected error: {error:?}"),
        }
    }

    #[tokio::test]
    async fn error_reply_surfaces_structured_error() {
        let bus = MockBus::new();
        bus.handle("cap.fail", |_msg| {
            serde_json::to_vec(&serde_json::json!({
                "ok": false,
                "error": {"code": "NOT_FOUND", "message": "nope", "retryable": false}
            }))
            .unwrap()
        });
        let pool = test_pool(bus);
        let core = TransportCore::new(pool, TransportConfig::default());

        let result = core.invoke(resolved_envelope("cap.fail"), CancelSignal::new()).await;
        match result {
            InvocationResult::Err { error, .. } => {
                assert_eq!(error.code, Code::NotFound);
                assert_eq!(error.message, "nope");
            }
            InvocationResult::Ok { .. } => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn missing_subject_fails_unknown_subject_without_bus_call() {
        let bus = MockBus::new();
        let pool = test_pool(bus);
        let core = TransportCore::new(pool, TransportConfig::default());

        let ctx = InvocationContext::new("tenant-a", "req-1");
        let env = InvocationEnvelope::new("my.app/my.cap", "ping", serde_json::json!({}), ctx);
        let result = core.invoke(env, CancelSignal::new()).await;
        match result {
            InvocationResult::Err { error, .. } => assert_eq!(error.code, Code::UnknownSubject),
            InvocationResult::Ok { .. } => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_reply_yields_cancelled_result() {
        let bus = MockBus::new();
        // A subscriber exists but never replies, so the request stays pending
        // until either the timeout or the cancellation fires.
        let mut sub = bus.subscribe("cap.never-answered", None).await.unwrap();
        tokio::spawn(async move {
            let _ = sub.next().await;
        });
        let pool = test_pool(bus);
        let core = TransportCore::new(pool, TransportConfig::default());

        let cancel = CancelSignal::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel(Code::Cancelled);
        });

        let mut env = resolved_envelope("cap.never-answered");
        env.ctx.timeout_ms = Some(5_000);
        let result = core.invoke(env, cancel).await;
        match result {
            InvocationResult::Err { error, .. } => assert_eq!(error.code, Code::Cancelled),
            InvocationResult::Ok { .. } => panic!("expected cancellation"),
        }
    }
}

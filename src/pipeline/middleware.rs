//! The standard middleware set: enrich-context, resolve, deadline, policy,
//! validate, telemetry.

use super::{CancelSignal, Handler, Middleware};
use crate::envelope::{InvocationEnvelope, InvocationMeta, InvocationResult, ResolvedCapability};
use crate::error::Code;
use crate::pool::TokenProvider;
use crate::policy::{compose_decisions, PolicyDecision, PolicyEnforcementPoint};
use crate::resolution::ResolutionClient;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info_span, Instrument};
use uuid::Uuid;

fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn err_result(code: Code, message: impl Into<String>) -> InvocationResult {
    let started = now_unix_ms();
    InvocationResult::err_code(
        code,
        message,
        InvocationMeta {
            started_at_unix_ms: started,
            ended_at_unix_ms: started,
            duration_ms: 0,
            ..Default::default()
        },
    )
}

/// Fills `requestId` if absent, `tenantId` from a default, and an access
/// token from a static value or provider.
pub struct EnrichContext {
    pub default_tenant_id: String,
    pub static_access_token: Option<String>,
    pub token_provider: Option<Arc<dyn TokenProvider>>,
}

impl Middleware for EnrichContext {
    fn wrap(&self, next: Handler) -> Handler {
        let default_tenant_id = self.default_tenant_id.clone();
        let static_access_token = self.static_access_token.clone();
        let token_provider = self.token_provider.clone();

        Arc::new(move |mut envelope: InvocationEnvelope, cancel: CancelSignal| {
            if envelope.ctx.request_id.is_empty() {
                envelope.ctx.request_id = Uuid::new_v4().to_string();
            }
            if envelope.ctx.tenant_id.is_empty() {
                envelope.ctx.tenant_id = default_tenant_id.clone();
            }
            if envelope.ctx.access_token.is_none() {
                envelope.ctx.access_token = token_provider
                    .as_ref()
                    .and_then(|p| p.token())
                    .or_else(|| static_access_token.clone());
            }
            next(envelope, cancel)
        })
    }
}

/// If `resolved.subject`/`resolved.natsUrl` are both set, passes through.
/// Otherwise resolves the capability via the resolution client.
pub struct Resolve {
    pub resolution: Arc<ResolutionClient>,
}

impl Middleware for Resolve {
    fn wrap(&self, next: Handler) -> Handler {
        let resolution = self.resolution.clone();
        Arc::new(move |mut envelope: InvocationEnvelope, cancel: CancelSignal| {
            let resolution = resolution.clone();
            async move {
                if envelope
                    .resolved
                    .as_ref()
                    .map(ResolvedCapability::is_complete)
                    .unwrap_or(false)
                {
                    return next(envelope, cancel).await;
                }

                match resolution
                    .resolve(&envelope.capability, envelope.version.as_deref(), &envelope.ctx)
                    .await
                {
                    Ok(output) => {
                        envelope.resolved = Some(ResolvedCapability {
                            nats_url: output.nats_url,
                            subject: output.subject,
                            version: output.resolved_version,
                            schema_hash: None,
                            policy_hash: None,
                            artifact_hash: None,
                        });
                        next(envelope, cancel).await
                    }
                    Err(e) => {
                        let message = e.to_string();
                        err_result(e.into_capability_error().code, message)
                    }
                }
            }
            .boxed()
        })
    }
}

/// Derives an effective cancel signal from `ctx.timeoutMs`, or fails
/// `TIMEOUT` immediately when `ctx.deadlineUnixMs` has already passed.
pub struct Deadline {
    pub default_timeout: Duration,
}

impl Middleware for Deadline {
    fn wrap(&self, next: Handler) -> Handler {
        let default_timeout = self.default_timeout;
        Arc::new(move |envelope: InvocationEnvelope, cancel: CancelSignal| {
            if let Some(deadline) = envelope.ctx.deadline_unix_ms {
                if deadline <= now_unix_ms() {
                    return async move { err_result(Code::Timeout, "deadline already passed") }.boxed();
                }
            }

            let timeout = envelope
                .ctx
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout);
            let effective = cancel.with_deadline(timeout);
            next(envelope, effective)
        })
    }
}

/// Evaluates pre-PEPs before `next`, post-PEPs after. Denied pre-PEPs
/// short-circuit with `POLICY_DENIED`; approved obligations/decision metadata
/// merge into `ctx.obligations`/`ctx.meta`.
pub struct Policy {
    pub pre_peps: Vec<Arc<dyn PolicyEnforcementPoint>>,
    pub post_peps: Vec<Arc<dyn PolicyEnforcementPoint>>,
}

impl Middleware for Policy {
    fn wrap(&self, next: Handler) -> Handler {
        let pre_peps = self.pre_peps.clone();
        let post_peps = self.post_peps.clone();

        Arc::new(move |mut envelope: InvocationEnvelope, cancel: CancelSignal| {
            let pre_peps = pre_peps.clone();
            let post_peps = post_peps.clone();
            async move {
                if !pre_peps.is_empty() {
                    let mut decisions = Vec::with_capacity(pre_peps.len());
                    for pep in &pre_peps {
                        match pep.evaluate(&envelope.params).await {
                            Ok(d) => decisions.push(d),
                            Err(e) => return err_result(Code::PolicyEngineUnavailable, e.to_string()),
                        }
                    }
                    let decision = compose_decisions(&decisions);
                    if !decision.allow {
                        return err_result(Code::PolicyDenied, decision.reasons.join("; "));
                    }
                    merge_decision_into_ctx(&mut envelope, &decision);
                }

                let result = next(envelope.clone(), cancel).await;

                if post_peps.is_empty() {
                    return result;
                }
                let mut decisions = Vec::with_capacity(post_peps.len());
                for pep in &post_peps {
                    match pep.evaluate(&envelope.params).await {
                        Ok(d) => decisions.push(d),
                        Err(e) => return err_result(Code::PolicyEngineUnavailable, e.to_string()),
                    }
                }
                let decision = compose_decisions(&decisions);
                if !decision.allow {
                    return err_result(Code::PolicyDenied, decision.reasons.join("; "));
                }
                result
            }
            .boxed()
        })
    }
}

fn merge_decision_into_ctx(envelope: &mut InvocationEnvelope, decision: &PolicyDecision) {
    for obligation in &decision.obligations {
        envelope
            .ctx
            .obligations
            .insert(obligation.clone(), Value::Bool(true));
    }
    envelope
        .ctx
        .meta
        .insert("policyReasons".to_string(), serde_json::json!(decision.reasons));
}

/// Validates method payloads against a pluggable schema validator: inbound
/// `params` before `next`, outbound `data` after.
#[async_trait]
pub trait SchemaValidator: Send + Sync {
    async fn validate_params(&self, capability: &str, method: &str, params: &Value) -> crate::error::Result<()>;
    async fn validate_result(&self, capability: &str, method: &str, data: &Value) -> crate::error::Result<()>;
}

pub struct Validate {
    pub validator: Arc<dyn SchemaValidator>,
}

impl Middleware for Validate {
    fn wrap(&self, next: Handler) -> Handler {
        let validator = self.validator.clone();
        Arc::new(move |envelope: InvocationEnvelope, cancel: CancelSignal| {
            let validator = validator.clone();
            async move {
                if let Err(e) = validator
                    .validate_params(&envelope.capability, &envelope.method, &envelope.params)
                    .await
                {
                    return err_result(Code::ValidationError, e.to_string());
                }

                let result = next(envelope.clone(), cancel).await;

                if let InvocationResult::Ok { data, meta } = &result {
                    if let Err(e) = validator
                        .validate_result(&envelope.capability, &envelope.method, data)
                        .await
                    {
                        return err_result(Code::InternalError, e.to_string());
                    }
                    return InvocationResult::Ok {
                        data: data.clone(),
                        meta: meta.clone(),
                    };
                }
                result
            }
            .boxed()
        })
    }
}

/// An injectable invocation-counter sink, rather than a concrete metrics
/// backend dependency — a caller wires in whatever collector it runs.
pub trait InvocationMetrics: Send + Sync {
    fn increment_invocation(&self, capability: &str, method: &str, ok: bool);
}

/// Wraps the call in a named tracing span with `{capability, version,
/// method, tenant_id, request_id}` fields and increments the invocation
/// counter, if configured.
pub struct Telemetry {
    pub metrics: Option<Arc<dyn InvocationMetrics>>,
}

impl Middleware for Telemetry {
    fn wrap(&self, next: Handler) -> Handler {
        let metrics = self.metrics.clone();
        Arc::new(move |envelope: InvocationEnvelope, cancel: CancelSignal| {
            let metrics = metrics.clone();
            let span = info_span!(
                "capability_invocation",
                capability = %envelope.capability,
                version = envelope.version.as_deref().unwrap_or(""),
                method = %envelope.method,
                tenant_id = %envelope.ctx.tenant_id,
                request_id = %envelope.ctx.request_id,
            );
            let capability = envelope.capability.clone();
            let method = envelope.method.clone();
            async move {
                let result = next(envelope, cancel).await;
                if let Some(metrics) = &metrics {
                    metrics.increment_invocation(&capability, &method, result.is_ok());
                }
                result
            }
            .instrument(span)
            .boxed()
        })
    }
}

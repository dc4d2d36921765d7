//! Wire data model: Invocation Envelope, Invocation Context, Resolved Capability,
//! and Invocation Result.

use crate::error::{CapabilityError, Code};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Routing/authorization/deadline metadata carried alongside every invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationContext {
    pub tenant_id: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_unix_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub obligations: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, Value>,
}

impl InvocationContext {
    pub fn new(tenant_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        InvocationContext {
            tenant_id: tenant_id.into(),
            request_id: request_id.into(),
            ..Default::default()
        }
    }
}

/// The outcome of capability resolution: where to send the request and what
/// version actually served it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedCapability {
    pub nats_url: String,
    pub subject: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
}

impl ResolvedCapability {
    pub fn is_complete(&self) -> bool {
        !self.subject.is_empty() && !self.nats_url.is_empty()
    }
}

/// The unit of request passed through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationEnvelope {
    pub capability: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved: Option<ResolvedCapability>,
    pub method: String,
    pub params: Value,
    pub ctx: InvocationContext,
}

impl InvocationEnvelope {
    pub fn new(capability: impl Into<String>, method: impl Into<String>, params: Value, ctx: InvocationContext) -> Self {
        InvocationEnvelope {
            capability: capability.into(),
            version: None,
            resolved: None,
            method: method.into(),
            params,
            ctx,
        }
    }
}

/// `meta` attached to every [`InvocationResult`] variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMeta {
    pub started_at_unix_ms: i64,
    pub ended_at_unix_ms: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_decision_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub usage: HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

/// Tagged-sum invocation outcome: `Ok` carries typed data, `Err` a structured
/// [`CapabilityError`]. Both variants carry `meta`. Serializes to the wire shape
/// `{ok: bool, data?, error?, meta}` rather than serde's internally-tagged form,
/// since `ok` is a real JSON boolean, not a string discriminant.
#[derive(Debug, Clone)]
pub enum InvocationResult {
    Ok { data: Value, meta: InvocationMeta },
    Err {
        error: CapabilityError,
        meta: InvocationMeta,
    },
}

impl Serialize for InvocationResult {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(None)?;
        match self {
            InvocationResult::Ok { data, meta } => {
                map.serialize_entry("ok", &true)?;
                map.serialize_entry("data", data)?;
                map.serialize_entry("meta", meta)?;
            }
            InvocationResult::Err { error, meta } => {
                map.serialize_entry("ok", &false)?;
                map.serialize_entry("error", error)?;
                map.serialize_entry("meta", meta)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for InvocationResult {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Shape {
            ok: bool,
            #[serde(default)]
            data: Option<Value>,
            #[serde(default)]
            error: Option<CapabilityError>,
            #[serde(default)]
            meta: InvocationMeta,
        }
        let shape = Shape::deserialize(deserializer)?;
        if shape.ok {
            Ok(InvocationResult::Ok {
                data: shape.data.unwrap_or(Value::Null),
                meta: shape.meta,
            })
        } else {
            Ok(InvocationResult::Err {
                error: shape
                    .error
                    .unwrap_or_else(|| CapabilityError::new(Code::InternalError, "unknown server error")),
                meta: shape.meta,
            })
        }
    }
}

impl InvocationResult {
    pub fn ok(data: Value, meta: InvocationMeta) -> Self {
        InvocationResult::Ok { data, meta }
    }

    pub fn err(error: CapabilityError, meta: InvocationMeta) -> Self {
        InvocationResult::Err { error, meta }
    }

    pub fn err_code(code: Code, message: impl Into<String>, meta: InvocationMeta) -> Self {
        InvocationResult::Err {
            error: CapabilityError::new(code, message),
            meta,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, InvocationResult::Ok { .. })
    }

    pub fn meta(&self) -> &InvocationMeta {
        match self {
            InvocationResult::Ok { meta, .. } => meta,
            InvocationResult::Err { meta, .. } => meta,
        }
    }
}

/// The wire shape of a worker's raw JSON reply, before being lifted into an
/// [`InvocationResult`] by the transport core.
#[derive(Debug, Clone, Deserialize)]
pub struct RawReply {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RawReplyError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawReplyError {
    #[serde(default)]
    pub code: Option<Code>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retryable: Option<bool>,
    #[serde(default)]
    pub details: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_capability_completeness() {
        let mut r = ResolvedCapability::default();
        assert!(!r.is_complete());
        r.subject = "cap.foo.bar.v1".into();
        r.nats_url = "nats://sys:4222".into();
        assert!(r.is_complete());
    }

    #[test]
    fn invocation_result_ok_serializes_with_ok_true() {
        let meta = InvocationMeta::default();
        let result = InvocationResult::ok(serde_json::json!("pong"), meta);
        let v = serde_json::to_value(&result).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["data"], "pong");
    }
}

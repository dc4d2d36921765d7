//! Wire shapes shared between the client and worker bootstrap handshake.
//! Both sides fetch `system.registry.bootstrap` and decode the same reply
//! shape: the client seeds its resolution cache from it, the worker uses it
//! to learn which subject to subscribe to for each configured capability.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapEntry {
    pub canonical_identity: String,
    pub subject: String,
    #[serde(default)]
    pub nats_url: Option<String>,
    #[serde(default)]
    pub major: Option<u64>,
    #[serde(default)]
    pub resolved_version: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapReply {
    #[serde(default)]
    pub capabilities: HashMap<String, BootstrapEntry>,
    #[serde(default)]
    pub change_event_subjects: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryRequest<'a> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub cap: &'a str,
    pub method: &'static str,
    pub params: serde_json::Value,
    pub ctx: &'a crate::envelope::InvocationContext,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryResponse {
    #[allow(dead_code)]
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RegistryResponseError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryResponseError {
    #[serde(default)]
    pub code: Option<crate::error::Code>,
    #[serde(default)]
    pub message: Option<String>,
}

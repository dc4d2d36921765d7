//! Policy binding & decision types (external collaborator summary) and
//! decision composition.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// How a [`PolicyBinding`] selects which PEP it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchType {
    CapabilityType,
    Tags,
    Instance,
}

/// Binds a policy enforcement point to the policies that govern it.
#[derive(Debug, Clone)]
pub struct PolicyBinding {
    pub pep: String,
    pub match_type: MatchType,
    pub priority: i32,
    pub policy_id: String,
}

/// The outcome of evaluating one or more policies at a PEP.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    pub allow: bool,
    pub deny: Vec<String>,
    pub reasons: Vec<String>,
    pub patches: Vec<Value>,
    pub limits: HashMap<String, f64>,
    pub obligations: Vec<String>,
    pub labels: HashMap<String, String>,
    pub routing: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        PolicyDecision {
            allow: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        PolicyDecision {
            allow: false,
            deny: vec![reason.into()],
            ..Default::default()
        }
    }
}

/// Evaluates policy at a named hook, pre- or post-invocation.
#[async_trait]
pub trait PolicyEnforcementPoint: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, input: &Value) -> crate::error::Result<PolicyDecision>;
}

/// Composes decisions from multiple PEPs: deny if any denies; limits
/// collapse by coordinate-wise minimum; patches/obligations concatenate in
/// selection order (so composition is commutative for `allow`/`deny` but
/// order-preserving for `patches`/`obligations`).
pub fn compose_decisions(decisions: &[PolicyDecision]) -> PolicyDecision {
    let mut composed = PolicyDecision {
        allow: decisions.iter().all(|d| d.allow),
        ..Default::default()
    };

    for d in decisions {
        composed.deny.extend(d.deny.iter().cloned());
        composed.reasons.extend(d.reasons.iter().cloned());
        composed.patches.extend(d.patches.iter().cloned());
        composed.obligations.extend(d.obligations.iter().cloned());
        composed.labels.extend(d.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if composed.routing.is_none() {
            composed.routing = d.routing.clone();
        }
        for (k, v) in &d.limits {
            composed
                .limits
                .entry(k.clone())
                .and_modify(|existing| *existing = existing.min(*v))
                .or_insert(*v);
        }
    }

    composed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_if_any_decision_denies() {
        let composed = compose_decisions(&[PolicyDecision::allow(), PolicyDecision::deny("nope")]);
        assert!(!composed.allow);
        assert_eq!(composed.deny, vec!["nope".to_string()]);
    }

    #[test]
    fn allow_and_deny_composition_is_order_independent() {
        let forward = compose_decisions(&[PolicyDecision::deny("a"), PolicyDecision::allow()]);
        let backward = compose_decisions(&[PolicyDecision::allow(), PolicyDecision::deny("a")]);
        assert_eq!(forward.allow, backward.allow);
    }

    #[test]
    fn limits_collapse_by_coordinate_wise_minimum() {
        let mut d1 = PolicyDecision::allow();
        d1.limits.insert("rps".to_string(), 100.0);
        let mut d2 = PolicyDecision::allow();
        d2.limits.insert("rps".to_string(), 50.0);

        let composed = compose_decisions(&[d1, d2]);
        assert_eq!(composed.limits["rps"], 50.0);
    }

    #[test]
    fn patches_and_obligations_preserve_selection_order() {
        let mut d1 = PolicyDecision::allow();
        d1.patches.push(serde_json::json!({"op": "first"}));
        d1.obligations.push("audit".to_string());
        let mut d2 = PolicyDecision::allow();
        d2.patches.push(serde_json::json!({"op": "second"}));
        d2.obligations.push("notify".to_string());

        let composed = compose_decisions(&[d1, d2]);
        assert_eq!(composed.patches, vec![serde_json::json!({"op": "first"}), serde_json::json!({"op": "second"})]);
        assert_eq!(composed.obligations, vec!["audit".to_string(), "notify".to_string()]);
    }
}

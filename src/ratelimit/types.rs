//! Limit configs, requests and results.

use serde::{Deserialize, Serialize};

/// Who a limit config is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Key,
    Identity,
}

/// A named rate limit attached to a key or an identity.
///
/// Configs are never edited in place: a change produces a new `id`, and the
/// buckets of the old one simply expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub id: String,
    pub workspace_id: String,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub name: String,
    /// Requests allowed per window
    pub limit: u32,
    /// Window length
    pub duration_ms: u64,
    /// Applied on every verification without being named
    #[serde(default)]
    pub auto_apply: bool,
}

/// A limit named by the caller of a verification.
///
/// Values are signed on the wire so that negative input can be rejected
/// instead of silently wrapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRequest {
    pub name: String,
    /// Defaults to 1
    #[serde(default)]
    pub cost: Option<i64>,
    /// Ad hoc or override limit
    #[serde(default)]
    pub limit: Option<i64>,
    /// Ad hoc or override duration in ms
    #[serde(default)]
    pub duration: Option<i64>,
}

impl LimitRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost: i64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_limit(mut self, limit: i64, duration_ms: i64) -> Self {
        self.limit = Some(limit);
        self.duration = Some(duration_ms);
        self
    }
}

/// Everything the verification service knows about the key being verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyContext {
    pub workspace_id: String,
    pub key_id: String,
    /// Configs attached directly to the key
    pub key_limits: Vec<RateLimitConfig>,
    /// Configs of the key's identity, empty if it has none
    pub identity_limits: Vec<RateLimitConfig>,
}

impl KeyContext {
    pub fn new(workspace_id: impl Into<String>, key_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            key_id: key_id.into(),
            ..Self::default()
        }
    }
}

/// Per-limit outcome, as handed to the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitStatus {
    pub name: String,
    pub limit: u32,
    pub remaining: u64,
    /// Unix ms at which the current window ends
    pub reset: u64,
    pub exceeded: bool,
    pub auto_apply: bool,
}

/// Outcome of one coordinated evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// True only if every limit admitted the request
    pub success: bool,
    /// In resolution order
    pub limits: Vec<LimitStatus>,
}

impl EvaluationResult {
    /// Result for a call with no applicable limits.
    pub fn unlimited() -> Self {
        Self {
            success: true,
            limits: Vec::new(),
        }
    }

    /// Look up a limit's status by name.
    pub fn limit(&self, name: &str) -> Option<&LimitStatus> {
        self.limits.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_request_deserialize_defaults() {
        let req: LimitRequest = serde_json::from_str(r#"{"name":"tokens"}"#).unwrap();
        assert_eq!(req, LimitRequest::named("tokens"));

        let req: LimitRequest =
            serde_json::from_str(r#"{"name":"tokens","cost":-2,"limit":10,"duration":1000}"#).unwrap();
        assert_eq!(req.cost, Some(-2));
        assert_eq!(req.duration, Some(1000));
    }

    #[test]
    fn test_limit_status_serializes_camel_case() {
        let status = LimitStatus {
            name: "requests".to_string(),
            limit: 10,
            remaining: 9,
            reset: 60_000,
            exceeded: false,
            auto_apply: true,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["autoApply"], true);
        assert_eq!(json["reset"], 60_000);
    }

    #[test]
    fn test_unlimited_result() {
        let result = EvaluationResult::unlimited();
        assert!(result.success);
        assert!(result.limits.is_empty());
        assert!(result.limit("anything").is_none());
    }
}

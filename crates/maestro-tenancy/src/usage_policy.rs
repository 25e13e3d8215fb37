//! Plan-backed usage guardrails, distinct from content guardrails.
//!
//! Evaluated against the authoritative per-period counters before
//! execution. Soft limits log and mark the response; hard limits deny.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use maestro_core::config::{UsageGuardrailConfig, UsageLimit, UsageLimitType};
use maestro_core::types::{TenantId, UserId};
use maestro_store::types::UsageTotals;
use maestro_store::Store;

use crate::error::{AuthError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum UsageDecision {
    Allow,
    SoftLimit {
        feature_key: String,
        limit_value: u64,
        current_usage: u64,
    },
}

pub struct UsagePolicy {
    enabled: bool,
    limits: Vec<UsageLimit>,
    store: Arc<Store>,
}

impl UsagePolicy {
    pub fn new(config: &UsageGuardrailConfig, store: Arc<Store>) -> Self {
        Self {
            enabled: config.enabled,
            limits: config.limits.clone(),
            store,
        }
    }

    /// Evaluate every configured limit against current-period usage.
    /// The first hard violation denies; soft violations are reported for
    /// the caller to mark the response.
    pub fn evaluate(&self, tenant_id: TenantId, user_id: Option<UserId>) -> Result<UsageDecision> {
        if !self.enabled {
            return Ok(UsageDecision::Allow);
        }
        let mut soft: Option<UsageDecision> = None;
        for limit in &self.limits {
            if limit.limit_value == 0 {
                return Err(AuthError::PolicyMisconfigured(format!(
                    "usage limit '{}' has a zero limit value",
                    limit.feature_key
                )));
            }
            let totals = self
                .store
                .current_period_usage(tenant_id, user_id, limit.granularity)?;
            let current = metric(&totals, limit.limit_type);
            if current < limit.limit_value {
                continue;
            }
            if limit.hard {
                return Err(AuthError::UsageLimit {
                    feature_key: limit.feature_key.clone(),
                    limit_type: limit_type_name(limit.limit_type).to_string(),
                    limit_value: limit.limit_value,
                    current_usage: current,
                    window: limit.granularity.as_str().to_string(),
                });
            }
            warn!(
                feature_key = %limit.feature_key,
                limit_value = limit.limit_value,
                current_usage = current,
                "soft usage limit reached"
            );
            soft.get_or_insert(UsageDecision::SoftLimit {
                feature_key: limit.feature_key.clone(),
                limit_value: limit.limit_value,
                current_usage: current,
            });
        }
        Ok(soft.unwrap_or(UsageDecision::Allow))
    }
}

fn metric(totals: &UsageTotals, limit_type: UsageLimitType) -> u64 {
    match limit_type {
        UsageLimitType::Requests => totals.requests,
        UsageLimitType::InputTokens => totals.input_tokens,
        UsageLimitType::OutputTokens => totals.output_tokens,
    }
}

fn limit_type_name(limit_type: UsageLimitType) -> &'static str {
    match limit_type {
        UsageLimitType::Requests => "requests",
        UsageLimitType::InputTokens => "input_tokens",
        UsageLimitType::OutputTokens => "output_tokens",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::config::UsageGranularity;
    use maestro_core::types::ConversationId;
    use maestro_store::types::RunUsage;

    fn store_with_usage(requests: u64) -> (Arc<Store>, TenantId, UserId) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();
        for i in 0..requests {
            store
                .record_run_usage(
                    tenant.id,
                    Some(user.id),
                    &RunUsage {
                        conversation_id: Some(ConversationId::from_key("t")),
                        response_id: format!("resp_{i}"),
                        requests: 1,
                        input_tokens: 10,
                        output_tokens: 10,
                        ..Default::default()
                    },
                    &format!("resp_{i}"),
                )
                .unwrap();
        }
        (store, tenant.id, user.id)
    }

    fn policy(store: Arc<Store>, limit_value: u64, hard: bool) -> UsagePolicy {
        UsagePolicy::new(
            &UsageGuardrailConfig {
                enabled: true,
                limits: vec![UsageLimit {
                    feature_key: "chat".to_string(),
                    limit_type: UsageLimitType::Requests,
                    limit_value,
                    granularity: UsageGranularity::Day,
                    hard,
                }],
            },
            store,
        )
    }

    #[test]
    fn under_limit_allows() {
        let (store, tenant, user) = store_with_usage(2);
        let decision = policy(store, 10, true).evaluate(tenant, Some(user)).unwrap();
        assert_eq!(decision, UsageDecision::Allow);
    }

    #[test]
    fn hard_limit_denies_with_details() {
        let (store, tenant, user) = store_with_usage(3);
        match policy(store, 3, true).evaluate(tenant, Some(user)).unwrap_err() {
            AuthError::UsageLimit {
                feature_key,
                limit_value,
                current_usage,
                window,
                ..
            } => {
                assert_eq!(feature_key, "chat");
                assert_eq!(limit_value, 3);
                assert_eq!(current_usage, 3);
                assert_eq!(window, "day");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn soft_limit_marks_but_allows() {
        let (store, tenant, user) = store_with_usage(3);
        let decision = policy(store, 3, false).evaluate(tenant, Some(user)).unwrap();
        assert!(matches!(decision, UsageDecision::SoftLimit { .. }));
    }

    #[test]
    fn zero_limit_is_a_misconfiguration() {
        let (store, tenant, user) = store_with_usage(0);
        assert!(matches!(
            policy(store, 0, true).evaluate(tenant, Some(user)).unwrap_err(),
            AuthError::PolicyMisconfigured(_)
        ));
    }

    #[test]
    fn disabled_policy_always_allows() {
        let (store, tenant, user) = store_with_usage(100);
        let policy = UsagePolicy::new(&UsageGuardrailConfig::default(), store);
        assert_eq!(policy.evaluate(tenant, Some(user)).unwrap(), UsageDecision::Allow);
    }
}

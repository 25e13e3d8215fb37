//! The front-door gate: every boundary entry passes through here so
//! downstream components may assume an authenticated caller, a resolved
//! tenant context, and passing quota checks.

use std::sync::Arc;

use tracing::debug;

use maestro_core::config::MaestroConfig;
use maestro_core::types::{ActorContext, TenantId, TenantRole, UserId};
use maestro_store::Store;

use crate::error::{AuthError, Result};
use crate::ratelimit::{RateIdentity, RateLimiter};
use crate::scopes::{ScopeMatch, ScopeSet};
use crate::tokens::{Claims, TokenVerifier};
use crate::usage_policy::{UsageDecision, UsagePolicy};

/// Everything the gate needs from one request.
#[derive(Debug, Clone, Default)]
pub struct GateRequest<'a> {
    pub bearer_token: Option<&'a str>,
    pub tenant_id_header: Option<&'a str>,
    pub tenant_role_header: Option<&'a str>,
    pub client_ip: Option<&'a str>,
    /// Minimum membership role the endpoint demands.
    pub min_role: TenantRole,
    /// Required scopes and how they combine.
    pub required_scopes: &'a [&'a str],
    pub scope_match: ScopeMatch,
    /// Whether plan usage guardrails apply (execution endpoints only).
    pub enforce_usage: bool,
}

impl<'a> GateRequest<'a> {
    pub fn new(bearer_token: Option<&'a str>) -> Self {
        Self {
            bearer_token,
            tenant_id_header: None,
            tenant_role_header: None,
            client_ip: None,
            min_role: TenantRole::Viewer,
            required_scopes: &[],
            scope_match: ScopeMatch::All,
            enforce_usage: false,
        }
    }
}

/// Outcome of a passed gate: who is calling, plus any soft-limit marker.
#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub actor: ActorContext,
    pub claims: Claims,
    pub usage: UsageDecision,
}

pub struct TenantGate {
    verifier: TokenVerifier,
    limiter: RateLimiter,
    usage_policy: UsagePolicy,
    store: Arc<Store>,
    email_verification_required: bool,
}

impl TenantGate {
    pub fn new(config: &MaestroConfig, store: Arc<Store>) -> Self {
        Self {
            verifier: TokenVerifier::new(&config.auth),
            limiter: RateLimiter::new(&config.rate_limit),
            usage_policy: UsagePolicy::new(&config.usage_guardrails, Arc::clone(&store)),
            store,
            email_verification_required: config.auth.email_verification_required,
        }
    }

    /// Authorize a request end to end: token, claims, subject class,
    /// email verification, tenant context, role, scopes, rate limits, and
    /// optionally plan usage.
    pub fn authorize(&self, req: &GateRequest<'_>) -> Result<GateOutcome> {
        let token = req.bearer_token.ok_or(AuthError::MissingToken)?;
        let claims = self.verifier.verify(token)?;

        if claims.token_use != "access" {
            return Err(AuthError::WrongTokenUse(claims.token_use.clone()));
        }
        let subject = claims
            .user_subject()
            .ok_or_else(|| AuthError::SubjectNotAllowed(claims.sub.clone()))?;
        let user_id = UserId::parse(subject)
            .ok_or_else(|| AuthError::InvalidToken("subject is not a user id".into()))?;

        // Legacy tokens without the claim pass through; the short access
        // token lifetime bounds the grace period.
        if self.email_verification_required && claims.email_verified == Some(false) {
            return Err(AuthError::EmailUnverified);
        }

        let scope_set = ScopeSet::from_claims(&claims);
        scope_set.ensure(req.required_scopes, req.scope_match)?;

        let actor = self.resolve_tenant(&claims, &scope_set, user_id, req)?;

        self.limiter.check(&RateIdentity {
            ip: req.client_ip.map(String::from),
            user: Some(actor.user_id.to_string()),
            tenant: Some(actor.tenant_id.to_string()),
        })?;

        let usage = if req.enforce_usage {
            self.usage_policy.evaluate(actor.tenant_id, None)?
        } else {
            UsageDecision::Allow
        };

        debug!(tenant_id = %actor.tenant_id, user_id = %actor.user_id, role = %actor.role, "gate passed");
        Ok(GateOutcome {
            actor,
            claims,
            usage,
        })
    }

    fn resolve_tenant(
        &self,
        _claims: &Claims,
        scope_set: &ScopeSet,
        user_id: UserId,
        req: &GateRequest<'_>,
    ) -> Result<ActorContext> {
        let tenant_id = req
            .tenant_id_header
            .and_then(TenantId::parse)
            .ok_or(AuthError::TenantMismatch)?;

        let tenant = self
            .store
            .get_tenant(tenant_id)?
            .ok_or(AuthError::TenantMismatch)?;
        if !tenant.status.accepts_work() {
            return Err(AuthError::TenantInactive {
                status: tenant.status.to_string(),
            });
        }

        let membership_role = match self.store.membership_role(user_id, tenant_id)? {
            Some(role) => role,
            // Platform operators may act without a membership row.
            None if scope_set.is_support_superuser() => TenantRole::Owner,
            None => return Err(AuthError::TenantMismatch),
        };

        // The header role is the role the caller *acts as*; it may not
        // exceed the actual membership.
        let effective_role = match req.tenant_role_header {
            Some(raw) => {
                let requested: TenantRole = raw
                    .parse()
                    .map_err(|_| AuthError::TenantMismatch)?;
                if !membership_role.satisfies(requested) {
                    return Err(AuthError::RoleDenied {
                        held: membership_role.to_string(),
                        required: requested.to_string(),
                    });
                }
                requested
            }
            None => membership_role,
        };

        if !effective_role.satisfies(req.min_role) {
            return Err(AuthError::RoleDenied {
                held: effective_role.to_string(),
                required: req.min_role.to_string(),
            });
        }

        Ok(ActorContext {
            tenant_id,
            user_id,
            role: effective_role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::sign;
    use maestro_core::config::AuthConfig;
    use maestro_core::types::TenantStatus;

    struct Fixture {
        gate: TenantGate,
        store: Arc<Store>,
        tenant: TenantId,
        user: UserId,
    }

    fn fixture() -> Fixture {
        let config = MaestroConfig::default();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();
        store
            .upsert_membership(user.id, tenant.id, TenantRole::Member)
            .unwrap();
        Fixture {
            gate: TenantGate::new(&config, Arc::clone(&store)),
            store,
            tenant: tenant.id,
            user: user.id,
        }
    }

    fn token_for(user: UserId) -> String {
        let now = chrono::Utc::now().timestamp();
        let auth = AuthConfig::default();
        sign(
            &auth.key_set.active,
            &Claims {
                sub: format!("user:{user}"),
                token_use: "access".to_string(),
                iss: auth.issuer,
                aud: auth.audience,
                iat: now - 5,
                nbf: None,
                exp: now + 300,
                scope: Some("conversations:* workflows:*".to_string()),
                scopes: None,
                email_verified: Some(true),
            },
        )
        .unwrap()
    }

    fn request<'a>(token: &'a str, tenant: &'a str) -> GateRequest<'a> {
        GateRequest {
            bearer_token: Some(token),
            tenant_id_header: Some(tenant),
            ..GateRequest::new(None)
        }
    }

    #[test]
    fn member_passes_member_endpoints() {
        let f = fixture();
        let token = token_for(f.user);
        let tenant = f.tenant.to_string();
        let mut req = request(&token, &tenant);
        req.min_role = TenantRole::Member;
        let outcome = f.gate.authorize(&req).unwrap();
        assert_eq!(outcome.actor.tenant_id, f.tenant);
        assert_eq!(outcome.actor.role, TenantRole::Member);
    }

    #[test]
    fn member_cannot_act_as_admin() {
        let f = fixture();
        let token = token_for(f.user);
        let tenant = f.tenant.to_string();
        let mut req = request(&token, &tenant);
        req.tenant_role_header = Some("admin");
        assert!(matches!(
            f.gate.authorize(&req).unwrap_err(),
            AuthError::RoleDenied { .. }
        ));
    }

    #[test]
    fn header_role_can_downscope() {
        let f = fixture();
        let token = token_for(f.user);
        let tenant = f.tenant.to_string();
        let mut req = request(&token, &tenant);
        req.tenant_role_header = Some("viewer");
        let outcome = f.gate.authorize(&req).unwrap();
        assert_eq!(outcome.actor.role, TenantRole::Viewer);
    }

    #[test]
    fn required_scopes_are_enforced() {
        let f = fixture();
        let token = token_for(f.user); // grants conversations:* and workflows:*
        let tenant = f.tenant.to_string();
        let mut req = request(&token, &tenant);
        req.required_scopes = &["conversations:read"];
        f.gate.authorize(&req).unwrap();

        req.required_scopes = &["billing:read"];
        assert!(matches!(
            f.gate.authorize(&req).unwrap_err(),
            AuthError::InsufficientScope
        ));
    }

    #[test]
    fn foreign_tenant_is_a_mismatch() {
        let f = fixture();
        let other = f.store.create_tenant("rival", "Rival").unwrap();
        let token = token_for(f.user);
        let tenant = other.id.to_string();
        assert!(matches!(
            f.gate.authorize(&request(&token, &tenant)).unwrap_err(),
            AuthError::TenantMismatch
        ));
    }

    #[test]
    fn suspended_tenant_refuses_work() {
        let f = fixture();
        f.store
            .set_tenant_status(f.tenant, TenantStatus::Suspended, None)
            .unwrap();
        let token = token_for(f.user);
        let tenant = f.tenant.to_string();
        assert!(matches!(
            f.gate.authorize(&request(&token, &tenant)).unwrap_err(),
            AuthError::TenantInactive { .. }
        ));
    }

    #[test]
    fn service_account_subjects_are_rejected() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp();
        let auth = AuthConfig::default();
        let token = sign(
            &auth.key_set.active,
            &Claims {
                sub: "service-account:0192aaaa-0000-7000-8000-000000000002".to_string(),
                token_use: "access".to_string(),
                iss: auth.issuer,
                aud: auth.audience,
                iat: now,
                nbf: None,
                exp: now + 300,
                scope: None,
                scopes: None,
                email_verified: None,
            },
        )
        .unwrap();
        let tenant = f.tenant.to_string();
        assert!(matches!(
            f.gate.authorize(&request(&token, &tenant)).unwrap_err(),
            AuthError::SubjectNotAllowed(_)
        ));
    }

    #[test]
    fn refresh_tokens_are_not_access_tokens() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp();
        let auth = AuthConfig::default();
        let token = sign(
            &auth.key_set.active,
            &Claims {
                sub: format!("user:{}", f.user),
                token_use: "refresh".to_string(),
                iss: auth.issuer,
                aud: auth.audience,
                iat: now,
                nbf: None,
                exp: now + 300,
                scope: None,
                scopes: None,
                email_verified: None,
            },
        )
        .unwrap();
        let tenant = f.tenant.to_string();
        assert!(matches!(
            f.gate.authorize(&request(&token, &tenant)).unwrap_err(),
            AuthError::WrongTokenUse(_)
        ));
    }
}

//! Handler-side gate helper: every endpoint calls `gate` first, so the
//! rest of the handler can assume an authenticated actor with a resolved
//! tenant context and the scopes the route demands.

use axum::http::HeaderMap;

use maestro_core::types::TenantRole;
use maestro_tenancy::context::GateOutcome;
use maestro_tenancy::{GateRequest, TenantGate};

use crate::error::ApiResult;

/// Authorize one request against the route's minimum role and required
/// scopes. Scopes are bound per route (`conversations:read`,
/// `workflows:write`, ...); `enforce_usage` is set on execution endpoints
/// (chat, workflow runs) only.
pub fn gate(
    tenant_gate: &TenantGate,
    headers: &HeaderMap,
    min_role: TenantRole,
    required_scopes: &[&str],
    enforce_usage: bool,
) -> ApiResult<GateOutcome> {
    let token = extract_bearer(headers);
    let tenant_id = header_str(headers, "x-tenant-id");
    let tenant_role = header_str(headers, "x-tenant-role");
    let client_ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim);

    let outcome = tenant_gate.authorize(&GateRequest {
        bearer_token: token,
        tenant_id_header: tenant_id,
        tenant_role_header: tenant_role,
        client_ip,
        min_role,
        required_scopes,
        enforce_usage,
        ..GateRequest::new(None)
    })?;
    Ok(outcome)
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

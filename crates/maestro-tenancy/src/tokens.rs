//! Compact JWS access tokens (HMAC-SHA256) with keyset rotation.
//!
//! Verification accepts the active signer and the previously rotated-out
//! key; the staged `next` key is known but refused until it becomes the
//! active signer. Claims are validated with a configurable clock-skew
//! tolerance.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use maestro_core::config::{AuthConfig, SigningKey};

use crate::error::{AuthError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    kid: String,
}

/// Verified token claims.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Claims {
    pub sub: String,
    pub token_use: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

impl Claims {
    /// `user:{uuid}` subjects are user tokens; everything else
    /// (`service-account:…`) is rejected on user-only endpoints.
    pub fn user_subject(&self) -> Option<&str> {
        self.sub.strip_prefix("user:")
    }
}

pub struct TokenVerifier {
    active: SigningKey,
    next: Option<SigningKey>,
    previous: Option<SigningKey>,
    issuer: String,
    audience: String,
    clock_skew_secs: i64,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            active: config.key_set.active.clone(),
            next: config.key_set.next.clone(),
            previous: config.key_set.previous.clone(),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            clock_skew_secs: config.clock_skew_secs,
        }
    }

    /// Verify signature and claims; returns the decoded claims.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        self.verify_at(token, chrono::Utc::now().timestamp())
    }

    /// Verification against an explicit clock, used by tests to pin the
    /// skew boundary exactly.
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Claims> {
        let mut parts = token.split('.');
        let (h, p, s) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(AuthError::InvalidToken("malformed token".into())),
        };

        let header: Header = decode_json(h)?;
        if header.alg != "HS256" {
            return Err(AuthError::InvalidToken(format!(
                "unsupported alg: {}",
                header.alg
            )));
        }
        let key = self.resolve_key(&header.kid)?;

        let mut mac = HmacSha256::new_from_slice(key.secret.as_bytes())
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        mac.update(format!("{h}.{p}").as_bytes());
        let signature = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| AuthError::InvalidToken("signature is not base64url".into()))?;
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::InvalidToken("signature mismatch".into()))?;

        let claims: Claims = decode_json(p)?;
        self.validate_claims(&claims, now)?;
        Ok(claims)
    }

    fn resolve_key(&self, kid: &str) -> Result<&SigningKey> {
        if kid == self.active.kid {
            return Ok(&self.active);
        }
        if let Some(prev) = &self.previous {
            if kid == prev.kid {
                return Ok(prev);
            }
        }
        // A token minted with the staged key means someone signed ahead of
        // rotation; refuse it until the key becomes the active signer.
        if let Some(next) = &self.next {
            if kid == next.kid {
                return Err(AuthError::FutureKey {
                    kid: kid.to_string(),
                });
            }
        }
        Err(AuthError::UnknownKey {
            kid: kid.to_string(),
        })
    }

    fn validate_claims(&self, claims: &Claims, now: i64) -> Result<()> {
        if claims.exp == 0 || claims.iat == 0 {
            return Err(AuthError::InvalidToken("missing exp or iat".into()));
        }
        if claims.iss != self.issuer {
            return Err(AuthError::InvalidToken("issuer mismatch".into()));
        }
        if claims.aud != self.audience {
            return Err(AuthError::InvalidToken("audience mismatch".into()));
        }
        let skew = self.clock_skew_secs;
        if claims.exp + skew <= now {
            return Err(AuthError::Expired);
        }
        if claims.iat - skew > now {
            return Err(AuthError::NotYetValid);
        }
        if let Some(nbf) = claims.nbf {
            if nbf - skew > now {
                return Err(AuthError::NotYetValid);
            }
        }
        Ok(())
    }
}

/// Sign claims with a key. Used by token-minting collaborators and tests;
/// the gate itself only verifies.
pub fn sign(key: &SigningKey, claims: &Claims) -> Result<String> {
    let header = Header {
        alg: "HS256".to_string(),
        kid: key.kid.clone(),
    };
    let h = encode_json(&header)?;
    let p = encode_json(claims)?;
    let mut mac = HmacSha256::new_from_slice(key.secret.as_bytes())
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    mac.update(format!("{h}.{p}").as_bytes());
    let s = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    Ok(format!("{h}.{p}.{s}"))
}

fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn decode_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::InvalidToken("segment is not base64url".into()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::config::KeySetConfig;

    fn key(kid: &str) -> SigningKey {
        SigningKey {
            kid: kid.to_string(),
            secret: format!("secret-{kid}"),
        }
    }

    fn verifier() -> TokenVerifier {
        let mut config = AuthConfig::default();
        config.key_set = KeySetConfig {
            active: key("k-active"),
            next: Some(key("k-next")),
            previous: Some(key("k-prev")),
        };
        TokenVerifier::new(&config)
    }

    fn claims(now: i64) -> Claims {
        Claims {
            sub: "user:0192aaaa-0000-7000-8000-000000000001".to_string(),
            token_use: "access".to_string(),
            iss: AuthConfig::default().issuer,
            aud: AuthConfig::default().audience,
            iat: now - 10,
            nbf: None,
            exp: now + 300,
            scope: Some("conversations:read conversations:write".to_string()),
            scopes: None,
            email_verified: Some(true),
        }
    }

    #[test]
    fn active_key_verifies() {
        let now = 1_700_000_000;
        let token = sign(&key("k-active"), &claims(now)).unwrap();
        let verified = verifier().verify_at(&token, now).unwrap();
        assert!(verified.user_subject().is_some());
    }

    #[test]
    fn previous_key_still_verifies() {
        let now = 1_700_000_000;
        let token = sign(&key("k-prev"), &claims(now)).unwrap();
        verifier().verify_at(&token, now).unwrap();
    }

    #[test]
    fn staged_next_key_is_refused() {
        let now = 1_700_000_000;
        let token = sign(&key("k-next"), &claims(now)).unwrap();
        assert!(matches!(
            verifier().verify_at(&token, now).unwrap_err(),
            AuthError::FutureKey { .. }
        ));
    }

    #[test]
    fn unknown_kid_is_refused() {
        let now = 1_700_000_000;
        let token = sign(&key("k-rogue"), &claims(now)).unwrap();
        assert!(matches!(
            verifier().verify_at(&token, now).unwrap_err(),
            AuthError::UnknownKey { .. }
        ));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let now = 1_700_000_000;
        let token = sign(&key("k-active"), &claims(now)).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut forged = claims(now);
        forged.sub = "user:0192aaaa-0000-7000-8000-0000000000ff".to_string();
        let forged_payload = encode_json(&forged).unwrap();
        parts[1] = &forged_payload;
        let tampered = parts.join(".");
        assert!(verifier().verify_at(&tampered, now).is_err());
    }

    #[test]
    fn expiry_honors_clock_skew() {
        let now = 1_700_000_000;
        let mut c = claims(now);
        c.exp = now - 10; // expired 10s ago, inside the 30s skew window
        let token = sign(&key("k-active"), &c).unwrap();
        verifier().verify_at(&token, now).unwrap();

        c.exp = now - 31; // just beyond the window
        let token = sign(&key("k-active"), &c).unwrap();
        assert!(matches!(
            verifier().verify_at(&token, now).unwrap_err(),
            AuthError::Expired
        ));
    }

    #[test]
    fn missing_exp_is_rejected() {
        let now = 1_700_000_000;
        let mut c = claims(now);
        c.exp = 0;
        let token = sign(&key("k-active"), &c).unwrap();
        assert!(verifier().verify_at(&token, now).is_err());
    }

    #[test]
    fn future_nbf_is_rejected() {
        let now = 1_700_000_000;
        let mut c = claims(now);
        c.nbf = Some(now + 120);
        let token = sign(&key("k-active"), &c).unwrap();
        assert!(matches!(
            verifier().verify_at(&token, now).unwrap_err(),
            AuthError::NotYetValid
        ));
    }
}

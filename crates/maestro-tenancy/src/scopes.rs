use std::collections::HashSet;

use crate::error::{AuthError, Result};
use crate::tokens::Claims;

/// How a scope requirement combines its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeMatch {
    #[default]
    All,
    Any,
}

/// Normalized view of a token's scope claims.
///
/// `namespace:*` grants every scope in that namespace. The reserved
/// `support:*` scope marks a platform operator and satisfies any
/// requirement; it is checked explicitly rather than falling out of the
/// wildcard rule.
#[derive(Debug, Clone)]
pub struct ScopeSet {
    scopes: HashSet<String>,
    wildcard_namespaces: HashSet<String>,
    support_superuser: bool,
}

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let normalized: HashSet<String> = scopes
            .into_iter()
            .map(|s| s.as_ref().trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let wildcard_namespaces = normalized
            .iter()
            .filter(|s| s.ends_with(":*") && s.len() > 2)
            .map(|s| s[..s.len() - 2].to_string())
            .collect();
        let support_superuser = normalized.contains("support:*");
        Self {
            scopes: normalized,
            wildcard_namespaces,
            support_superuser,
        }
    }

    /// Collect scopes from both the space-separated `scope` claim and the
    /// array-valued `scopes` claim.
    pub fn from_claims(claims: &Claims) -> Self {
        let mut all: Vec<String> = Vec::new();
        if let Some(scope) = &claims.scope {
            all.extend(scope.split_whitespace().map(String::from));
        }
        if let Some(scopes) = &claims.scopes {
            all.extend(scopes.iter().cloned());
        }
        Self::new(all)
    }

    pub fn is_support_superuser(&self) -> bool {
        self.support_superuser
    }

    pub fn allows(&self, required: &str) -> bool {
        if required.is_empty() {
            return true;
        }
        if self.scopes.contains(required) {
            return true;
        }
        if self.support_superuser {
            return true;
        }
        let namespace = required.split(':').next().unwrap_or("");
        self.wildcard_namespaces.contains(namespace)
    }

    pub fn ensure(&self, required: &[&str], mode: ScopeMatch) -> Result<()> {
        if required.is_empty() {
            return Ok(());
        }
        let ok = match mode {
            ScopeMatch::All => required.iter().all(|s| self.allows(s)),
            ScopeMatch::Any => required.iter().any(|s| self.allows(s)),
        };
        if ok {
            Ok(())
        } else {
            Err(AuthError::InsufficientScope)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_scope_matches() {
        let set = ScopeSet::new(["conversations:read"]);
        assert!(set.allows("conversations:read"));
        assert!(!set.allows("conversations:write"));
    }

    #[test]
    fn namespace_wildcard_covers_the_namespace() {
        let set = ScopeSet::new(["conversations:*"]);
        assert!(set.allows("conversations:read"));
        assert!(set.allows("conversations:delete"));
        assert!(!set.allows("workflows:run"));
    }

    #[test]
    fn support_superuser_satisfies_everything() {
        let set = ScopeSet::new(["support:*"]);
        assert!(set.is_support_superuser());
        assert!(set.allows("workflows:run"));
        assert!(set.allows("anything:at_all"));
    }

    #[test]
    fn all_vs_any_requirements() {
        let set = ScopeSet::new(["conversations:read"]);
        assert!(set
            .ensure(&["conversations:read", "workflows:run"], ScopeMatch::Any)
            .is_ok());
        assert!(set
            .ensure(&["conversations:read", "workflows:run"], ScopeMatch::All)
            .is_err());
    }

    #[test]
    fn claims_merge_both_scope_shapes() {
        let claims = Claims {
            scope: Some("a:read b:read".to_string()),
            scopes: Some(vec!["c:read".to_string()]),
            ..Default::default()
        };
        let set = ScopeSet::from_claims(&claims);
        for s in ["a:read", "b:read", "c:read"] {
            assert!(set.allows(s), "missing {s}");
        }
    }
}

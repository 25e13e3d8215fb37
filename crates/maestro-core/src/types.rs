use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for deriving conversation UUIDs from caller-supplied keys.
/// Changing this value changes every derived id; it is part of the contract.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6d, 0x61, 0x65, 0x73, 0x74, 0x72, 0x6f, 0x2e, 0x63, 0x6f, 0x6e, 0x76, 0x2e, 0x76, 0x31,
    0x00,
]);

/// Unique identifier for a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a user.
///
/// Token subjects carry a `user:` prefix (`user:{uuid}`); service accounts
/// use `service-account:{uuid}`. The prefix is stripped at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical conversation identifier.
///
/// Clients may address conversations with any opaque key; the UUID is
/// derived deterministically from that key so the server owns the canonical
/// id without a lookup. Passing the same key always lands on the same
/// conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    /// Derive the canonical id from a caller-supplied conversation key.
    pub fn from_key(key: &str) -> Self {
        // Keys that already are UUIDs map to themselves so existing ids
        // round-trip through clients unchanged.
        if let Ok(u) = Uuid::parse_str(key) {
            return Self(u);
        }
        Self(Uuid::new_v5(&CONVERSATION_NAMESPACE, key.as_bytes()))
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowRunId(pub Uuid);

impl WorkflowRunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for WorkflowRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkflowRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a tenant. Only `active` tenants accept new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deprovisioning,
    Deprovisioned,
}

impl TenantStatus {
    pub fn accepts_work(&self) -> bool {
        matches!(self, TenantStatus::Active)
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TenantStatus::Active => "active",
            TenantStatus::Suspended => "suspended",
            TenantStatus::Deprovisioning => "deprovisioning",
            TenantStatus::Deprovisioned => "deprovisioned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "suspended" => Ok(TenantStatus::Suspended),
            "deprovisioning" => Ok(TenantStatus::Deprovisioning),
            "deprovisioned" => Ok(TenantStatus::Deprovisioned),
            other => Err(format!("unknown tenant status: {other}")),
        }
    }
}

/// Account state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Pending,
    Active,
    Disabled,
    Locked,
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UserStatus::Pending => "pending",
            UserStatus::Active => "active",
            UserStatus::Disabled => "disabled",
            UserStatus::Locked => "locked",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UserStatus::Pending),
            "active" => Ok(UserStatus::Active),
            "disabled" => Ok(UserStatus::Disabled),
            "locked" => Ok(UserStatus::Locked),
            other => Err(format!("unknown user status: {other}")),
        }
    }
}

/// Membership role hierarchy: owner > admin > member > viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TenantRole {
    Owner,
    Admin,
    Member,
    #[default]
    Viewer,
}

impl TenantRole {
    fn rank(&self) -> u8 {
        match self {
            TenantRole::Owner => 3,
            TenantRole::Admin => 2,
            TenantRole::Member => 1,
            TenantRole::Viewer => 0,
        }
    }

    /// True when this role grants at least `other`'s privileges.
    pub fn satisfies(&self, other: TenantRole) -> bool {
        self.rank() >= other.rank()
    }
}

impl fmt::Display for TenantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TenantRole::Owner => "owner",
            TenantRole::Admin => "admin",
            TenantRole::Member => "member",
            TenantRole::Viewer => "viewer",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TenantRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(TenantRole::Owner),
            "admin" => Ok(TenantRole::Admin),
            "member" => Ok(TenantRole::Member),
            "viewer" => Ok(TenantRole::Viewer),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Resolved caller identity, produced by the gate and trusted downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorContext {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub role: TenantRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_is_stable_for_a_key() {
        let a = ConversationId::from_key("support-thread-42");
        let b = ConversationId::from_key("support-thread-42");
        assert_eq!(a, b);
        assert_ne!(a, ConversationId::from_key("support-thread-43"));
    }

    #[test]
    fn conversation_id_round_trips_uuid_keys() {
        let id = Uuid::new_v4();
        let derived = ConversationId::from_key(&id.to_string());
        assert_eq!(derived.0, id);
    }

    #[test]
    fn role_hierarchy_orders() {
        assert!(TenantRole::Owner.satisfies(TenantRole::Admin));
        assert!(TenantRole::Admin.satisfies(TenantRole::Member));
        assert!(TenantRole::Member.satisfies(TenantRole::Viewer));
        assert!(!TenantRole::Viewer.satisfies(TenantRole::Member));
        assert!(TenantRole::Member.satisfies(TenantRole::Member));
    }
}

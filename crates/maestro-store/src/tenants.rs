use maestro_core::types::{TenantId, TenantRole, TenantStatus, UserId, UserStatus};
use rusqlite::params;
use uuid::Uuid;

use crate::db::{now, Store};
use crate::error::{Result, StoreError};
use crate::types::{Membership, Tenant, User};

impl Store {
    /// Insert a new tenant. Slug uniqueness is enforced by the schema;
    /// a duplicate surfaces as `Conflict`.
    pub fn create_tenant(&self, slug: &str, name: &str) -> Result<Tenant> {
        let tenant = Tenant {
            id: TenantId::new(),
            slug: slug.to_string(),
            name: name.to_string(),
            status: TenantStatus::Active,
            status_updated_at: now(),
            status_reason: None,
            created_at: now(),
        };
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO tenants
                (id, slug, name, status, status_updated_at, status_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                tenant.id.to_string(),
                tenant.slug,
                tenant.name,
                tenant.status.to_string(),
                tenant.status_updated_at,
                tenant.status_reason,
                tenant.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict {
                what: "tenant",
                id: slug.to_string(),
            });
        }
        Ok(tenant)
    }

    pub fn get_tenant(&self, id: TenantId) -> Result<Option<Tenant>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, slug, name, status, status_updated_at, status_reason, created_at
             FROM tenants WHERE id = ?1",
            params![id.to_string()],
            row_to_tenant,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Transition a tenant's status, recording when and why.
    pub fn set_tenant_status(
        &self,
        id: TenantId,
        status: TenantStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE tenants SET status = ?2, status_updated_at = ?3, status_reason = ?4
             WHERE id = ?1",
            params![id.to_string(), status.to_string(), now(), reason],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("tenant", id));
        }
        Ok(())
    }

    pub fn create_user(&self, email: &str) -> Result<User> {
        let user = User {
            id: UserId::new(),
            email: email.to_string(),
            status: UserStatus::Active,
            email_verified_at: None,
            created_at: now(),
        };
        let db = self.db.lock().unwrap();
        let inserted = db.execute(
            "INSERT OR IGNORE INTO users (id, email, status, email_verified_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.to_string(),
                user.email,
                user.status.to_string(),
                user.email_verified_at,
                user.created_at,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Conflict {
                what: "user",
                id: email.to_string(),
            });
        }
        Ok(user)
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, email, status, email_verified_at, created_at FROM users WHERE id = ?1",
            params![id.to_string()],
            row_to_user,
        ) {
            Ok(u) => Ok(Some(u)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Link a user to a tenant with a role. Re-linking updates the role.
    pub fn upsert_membership(
        &self,
        user_id: UserId,
        tenant_id: TenantId,
        role: TenantRole,
    ) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO tenant_memberships (user_id, tenant_id, role, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, tenant_id) DO UPDATE SET role = excluded.role",
            params![
                user_id.to_string(),
                tenant_id.to_string(),
                role.to_string(),
                now()
            ],
        )?;
        Ok(())
    }

    /// The caller's actual role in a tenant, if any. Hot path: called by
    /// the gate on every request.
    pub fn membership_role(&self, user_id: UserId, tenant_id: TenantId) -> Result<Option<TenantRole>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT role FROM tenant_memberships WHERE user_id = ?1 AND tenant_id = ?2",
            params![user_id.to_string(), tenant_id.to_string()],
            |row| row.get::<_, String>(0),
        ) {
            Ok(role) => Ok(role.parse().ok()),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_memberships(&self, user_id: UserId) -> Result<Vec<Membership>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT user_id, tenant_id, role FROM tenant_memberships WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                let uid: String = row.get(0)?;
                let tid: String = row.get(1)?;
                let role: String = row.get(2)?;
                Ok((uid, tid, role))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(uid, tid, role)| {
                Some(Membership {
                    user_id: UserId::parse(&uid)?,
                    tenant_id: TenantId::parse(&tid)?,
                    role: role.parse().ok()?,
                })
            })
            .collect())
    }
}

fn row_to_tenant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tenant> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    Ok(Tenant {
        id: TenantId(Uuid::parse_str(&id).unwrap_or_default()),
        slug: row.get(1)?,
        name: row.get(2)?,
        status: status.parse().unwrap_or(TenantStatus::Suspended),
        status_updated_at: row.get(4)?,
        status_reason: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    Ok(User {
        id: UserId(Uuid::parse_str(&id).unwrap_or_default()),
        email: row.get(1)?,
        status: status.parse().unwrap_or(UserStatus::Disabled),
        email_verified_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_slug_conflicts() {
        let store = Store::open_in_memory().unwrap();
        store.create_tenant("acme", "Acme").unwrap();
        let err = store.create_tenant("acme", "Acme Again").unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn membership_role_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();
        assert!(store.membership_role(user.id, tenant.id).unwrap().is_none());

        store
            .upsert_membership(user.id, tenant.id, TenantRole::Member)
            .unwrap();
        assert_eq!(
            store.membership_role(user.id, tenant.id).unwrap(),
            Some(TenantRole::Member)
        );

        store
            .upsert_membership(user.id, tenant.id, TenantRole::Admin)
            .unwrap();
        assert_eq!(
            store.membership_role(user.id, tenant.id).unwrap(),
            Some(TenantRole::Admin)
        );
    }

    #[test]
    fn tenant_status_gates_work() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        assert!(tenant.status.accepts_work());
        store
            .set_tenant_status(tenant.id, TenantStatus::Suspended, Some("billing"))
            .unwrap();
        let reloaded = store.get_tenant(tenant.id).unwrap().unwrap();
        assert!(!reloaded.status.accepts_work());
        assert_eq!(reloaded.status_reason.as_deref(), Some("billing"));
    }
}

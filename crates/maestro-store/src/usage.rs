use chrono::{Datelike, Timelike, Utc};
use maestro_core::config::UsageGranularity;
use maestro_core::types::{TenantId, UserId};
use rusqlite::params;

use crate::db::{now, Store};
use crate::error::Result;
use crate::types::{RunUsage, UsageTotals};

const ALL_GRANULARITIES: [UsageGranularity; 4] = [
    UsageGranularity::Minute,
    UsageGranularity::Hour,
    UsageGranularity::Day,
    UsageGranularity::Month,
];

impl Store {
    /// Record detailed usage for one provider response and fold it into the
    /// per-period counters (per-user and tenant-wide buckets, all four
    /// granularities). Returns false when the idempotency key was already
    /// ingested; counters are untouched in that case.
    pub fn record_run_usage(
        &self,
        tenant_id: TenantId,
        user_id: Option<UserId>,
        usage: &RunUsage,
        idempotency_key: &str,
    ) -> Result<bool> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO run_usage
                (idempotency_key, conversation_id, response_id, run_id, agent_key, provider,
                 requests, input_tokens, output_tokens, cached_input_tokens,
                 reasoning_output_tokens, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                idempotency_key,
                usage.conversation_id.map(|c| c.to_string()),
                usage.response_id,
                usage.run_id,
                usage.agent_key,
                usage.provider,
                usage.requests as i64,
                usage.input_tokens as i64,
                usage.output_tokens as i64,
                usage.cached_input_tokens as i64,
                usage.reasoning_output_tokens as i64,
                now(),
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        // tenant-wide bucket (user_id = '') plus the per-user bucket
        let mut buckets = vec![String::new()];
        if let Some(u) = user_id {
            buckets.push(u.to_string());
        }
        for granularity in ALL_GRANULARITIES {
            let period = period_start(granularity);
            for bucket in &buckets {
                tx.execute(
                    "INSERT INTO usage_counters
                        (tenant_id, user_id, period_start, granularity,
                         input_tokens, output_tokens, requests, storage_bytes)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)
                     ON CONFLICT (tenant_id, user_id, period_start, granularity) DO UPDATE SET
                         input_tokens = input_tokens + excluded.input_tokens,
                         output_tokens = output_tokens + excluded.output_tokens,
                         requests = requests + excluded.requests",
                    params![
                        tenant_id.to_string(),
                        bucket,
                        period,
                        granularity.as_str(),
                        usage.input_tokens as i64,
                        usage.output_tokens as i64,
                        usage.requests as i64,
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    /// Current-period totals for a tenant (optionally one user's bucket).
    pub fn current_period_usage(
        &self,
        tenant_id: TenantId,
        user_id: Option<UserId>,
        granularity: UsageGranularity,
    ) -> Result<UsageTotals> {
        let period = period_start(granularity);
        let bucket = user_id.map(|u| u.to_string()).unwrap_or_default();
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT input_tokens, output_tokens, requests, storage_bytes
             FROM usage_counters
             WHERE tenant_id = ?1 AND user_id = ?2 AND period_start = ?3 AND granularity = ?4",
            params![tenant_id.to_string(), bucket, period, granularity.as_str()],
            |row| {
                Ok(UsageTotals {
                    input_tokens: row.get::<_, i64>(0)? as u64,
                    output_tokens: row.get::<_, i64>(1)? as u64,
                    requests: row.get::<_, i64>(2)? as u64,
                    storage_bytes: row.get::<_, i64>(3)? as u64,
                })
            },
        ) {
            Ok(t) => Ok(t),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(UsageTotals::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Truncate "now" to the containing period's start, UTC.
fn period_start(granularity: UsageGranularity) -> String {
    let now = Utc::now();
    let start = match granularity {
        UsageGranularity::Minute => now
            .date_naive()
            .and_hms_opt(now.hour(), now.minute(), 0),
        UsageGranularity::Hour => now.date_naive().and_hms_opt(now.hour(), 0, 0),
        UsageGranularity::Day => now.date_naive().and_hms_opt(0, 0, 0),
        UsageGranularity::Month => now
            .date_naive()
            .with_day(1)
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
    };
    start
        .map(|dt| format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S")))
        .unwrap_or_else(|| now.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::types::ConversationId;

    fn usage(tokens_in: u64, tokens_out: u64) -> RunUsage {
        RunUsage {
            conversation_id: Some(ConversationId::from_key("thread-1")),
            response_id: "resp_1".into(),
            requests: 1,
            input_tokens: tokens_in,
            output_tokens: tokens_out,
            ..Default::default()
        }
    }

    #[test]
    fn ingestion_is_idempotent_per_key() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();

        assert!(store
            .record_run_usage(tenant.id, Some(user.id), &usage(100, 40), "resp_1")
            .unwrap());
        assert!(!store
            .record_run_usage(tenant.id, Some(user.id), &usage(100, 40), "resp_1")
            .unwrap());

        let totals = store
            .current_period_usage(tenant.id, None, UsageGranularity::Day)
            .unwrap();
        assert_eq!(totals.input_tokens, 100);
        assert_eq!(totals.output_tokens, 40);
        assert_eq!(totals.requests, 1);
    }

    #[test]
    fn counters_are_additive_across_responses() {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();

        store
            .record_run_usage(tenant.id, Some(user.id), &usage(10, 5), "resp_1")
            .unwrap();
        store
            .record_run_usage(tenant.id, Some(user.id), &usage(20, 15), "resp_2")
            .unwrap();

        let tenant_wide = store
            .current_period_usage(tenant.id, None, UsageGranularity::Month)
            .unwrap();
        assert_eq!(tenant_wide.input_tokens, 30);

        let per_user = store
            .current_period_usage(tenant.id, Some(user.id), UsageGranularity::Month)
            .unwrap();
        assert_eq!(per_user.output_tokens, 20);
    }
}

use maestro_core::types::{ConversationId, TenantId, UserId, WorkflowRunId};
use rusqlite::params;
use serde_json::Value;
use uuid::Uuid;

use crate::db::{now, Store};
use crate::error::{Result, StoreError};
use crate::types::{WorkflowRun, WorkflowRunStatus, WorkflowStepRow};

impl Store {
    pub fn create_workflow_run(
        &self,
        run_id: WorkflowRunId,
        tenant_id: TenantId,
        user_id: UserId,
        workflow_key: &str,
        conversation_id: ConversationId,
        request_message: &str,
        output_schema: Option<&Value>,
    ) -> Result<WorkflowRun> {
        let run = WorkflowRun {
            id: run_id.to_string(),
            tenant_id,
            user_id,
            workflow_key: workflow_key.to_string(),
            status: WorkflowRunStatus::Running,
            conversation_id,
            request_message: request_message.to_string(),
            final_output_text: None,
            final_output_structured: None,
            output_schema: output_schema.cloned(),
            started_at: now(),
            ended_at: None,
        };
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO workflow_runs
                (id, tenant_id, user_id, workflow_key, status, conversation_id,
                 request_message, output_schema, started_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                run.id,
                tenant_id.to_string(),
                user_id.to_string(),
                workflow_key,
                run.status.as_str(),
                conversation_id.to_string(),
                request_message,
                output_schema.map(serde_json::to_string).transpose()?,
                run.started_at,
            ],
        )?;
        Ok(run)
    }

    pub fn get_workflow_run(
        &self,
        tenant_id: TenantId,
        run_id: WorkflowRunId,
    ) -> Result<Option<WorkflowRun>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, tenant_id, user_id, workflow_key, status, conversation_id,
                    request_message, final_output_text, final_output_structured,
                    output_schema, started_at, ended_at
             FROM workflow_runs WHERE id = ?1 AND tenant_id = ?2",
            params![run_id.to_string(), tenant_id.to_string()],
            row_to_run,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_workflow_steps(&self, run_id: WorkflowRunId) -> Result<Vec<WorkflowStepRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT run_id, sequence_no, step_name, agent_key, stage_name, parallel_group,
                    branch_index, response_id, response_text, structured_output,
                    output_schema, status
             FROM workflow_steps WHERE run_id = ?1 ORDER BY sequence_no ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id.to_string()], row_to_step)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record one completed (or skipped/failed) step.
    pub fn record_workflow_step(&self, step: &WorkflowStepRow) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO workflow_steps
                (run_id, sequence_no, step_name, agent_key, stage_name, parallel_group,
                 branch_index, response_id, response_text, structured_output,
                 output_schema, status, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                step.run_id,
                step.sequence_no,
                step.step_name,
                step.agent_key,
                step.stage_name,
                step.parallel_group,
                step.branch_index,
                step.response_id,
                step.response_text,
                step.structured_output
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                step.output_schema
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                step.status,
                now(),
            ],
        )?;
        Ok(())
    }

    /// Move a run to a terminal status. Terminal runs never transition
    /// again; cancelling an already-terminated run reports false (no-op).
    pub fn finish_workflow_run(
        &self,
        run_id: WorkflowRunId,
        status: WorkflowRunStatus,
        final_output_text: Option<&str>,
        final_output_structured: Option<&Value>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(StoreError::Invariant(format!(
                "finish_workflow_run called with non-terminal status {}",
                status.as_str()
            )));
        }
        let db = self.db.lock().unwrap();
        let changed = db.execute(
            "UPDATE workflow_runs
             SET status = ?2, final_output_text = ?3, final_output_structured = ?4,
                 ended_at = ?5
             WHERE id = ?1 AND status = 'running'",
            params![
                run_id.to_string(),
                status.as_str(),
                final_output_text,
                final_output_structured
                    .map(serde_json::to_string)
                    .transpose()?,
                now(),
            ],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowRun> {
    let tenant: String = row.get(1)?;
    let user: String = row.get(2)?;
    let status: String = row.get(4)?;
    let conv: String = row.get(5)?;
    let structured: Option<String> = row.get(8)?;
    let schema: Option<String> = row.get(9)?;
    Ok(WorkflowRun {
        id: row.get(0)?,
        tenant_id: TenantId(Uuid::parse_str(&tenant).unwrap_or_default()),
        user_id: UserId(Uuid::parse_str(&user).unwrap_or_default()),
        workflow_key: row.get(3)?,
        status: status.parse().unwrap_or(WorkflowRunStatus::Failed),
        conversation_id: ConversationId(Uuid::parse_str(&conv).unwrap_or_default()),
        request_message: row.get(6)?,
        final_output_text: row.get(7)?,
        final_output_structured: structured.and_then(|s| serde_json::from_str(&s).ok()),
        output_schema: schema.and_then(|s| serde_json::from_str(&s).ok()),
        started_at: row.get(10)?,
        ended_at: row.get(11)?,
    })
}

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowStepRow> {
    let structured: Option<String> = row.get(9)?;
    let schema: Option<String> = row.get(10)?;
    Ok(WorkflowStepRow {
        run_id: row.get(0)?,
        sequence_no: row.get::<_, i64>(1)? as u32,
        step_name: row.get(2)?,
        agent_key: row.get(3)?,
        stage_name: row.get(4)?,
        parallel_group: row.get(5)?,
        branch_index: row.get::<_, Option<i64>>(6)?.map(|v| v as u32),
        response_id: row.get(7)?,
        response_text: row.get(8)?,
        structured_output: structured.and_then(|s| serde_json::from_str(&s).ok()),
        output_schema: schema.and_then(|s| serde_json::from_str(&s).ok()),
        status: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Store, TenantId, UserId, WorkflowRunId) {
        let store = Store::open_in_memory().unwrap();
        let tenant = store.create_tenant("acme", "Acme").unwrap();
        let user = store.create_user("a@acme.test").unwrap();
        let conv = ConversationId::from_key("wf-thread");
        store
            .get_or_create_conversation(tenant.id, conv, "wf-thread", None)
            .unwrap();
        let run_id = WorkflowRunId::new();
        store
            .create_workflow_run(run_id, tenant.id, user.id, "analysis_code", conv, "hi", None)
            .unwrap();
        (store, tenant.id, user.id, run_id)
    }

    #[test]
    fn steps_come_back_in_sequence_order() {
        let (store, _t, _u, run_id) = setup();
        for (i, name) in ["analysis", "code"].iter().enumerate() {
            store
                .record_workflow_step(&WorkflowStepRow {
                    run_id: run_id.to_string(),
                    sequence_no: i as u32,
                    step_name: name.to_string(),
                    agent_key: name.to_string(),
                    stage_name: name.to_string(),
                    parallel_group: None,
                    branch_index: None,
                    response_id: Some(format!("resp_{i}")),
                    response_text: Some(format!("out {i}")),
                    structured_output: None,
                    output_schema: None,
                    status: "succeeded".to_string(),
                })
                .unwrap();
        }
        let steps = store.list_workflow_steps(run_id).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["analysis", "code"]);
    }

    #[test]
    fn terminal_transition_happens_once() {
        let (store, tenant, _u, run_id) = setup();
        assert!(store
            .finish_workflow_run(run_id, WorkflowRunStatus::Succeeded, Some("done"), None)
            .unwrap());
        // cancelling a finished run is a no-op
        assert!(!store
            .finish_workflow_run(run_id, WorkflowRunStatus::Cancelled, None, None)
            .unwrap());
        let run = store.get_workflow_run(tenant, run_id).unwrap().unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Succeeded);
        assert_eq!(run.final_output_text.as_deref(), Some("done"));
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn cross_tenant_run_lookup_is_scoped() {
        let (store, _t, _u, run_id) = setup();
        let other = store.create_tenant("rival", "Rival").unwrap();
        assert!(store.get_workflow_run(other.id, run_id).unwrap().is_none());
    }
}

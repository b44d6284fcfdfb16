//! PostgreSQL store over the `wf.*` schema.
//!
//! Queries are bound at runtime so the crate builds without a live database.
//! Enum columns are plain text parsed through each type's `FromStr`; rule and
//! snapshot payloads live in `jsonb`. `apply` runs the whole change set in
//! one transaction and rolls back on the first CAS miss.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{Change, ChangeSet, Store};
use crate::authz::{CapabilityRow, ConstraintType};
use crate::error::{EngineError, Result};
use crate::models::{
    ApprovalComment, ApprovalDefinition, ApprovalEscalation, ApprovalEvent, ApprovalInstance,
    ApprovalStage, ApprovalTask, AssignmentSnapshot, EntityRef, LifecycleDefinition,
    LifecycleVersion, TimerSchedule, TimerStatus, WorkflowInstance, WorkflowTransition,
};

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse<T>(value: String) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(EngineError::Database)
}

fn parse_opt<T>(value: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    value.map(parse).transpose()
}

fn map_lifecycle_definition(row: &PgRow) -> Result<LifecycleDefinition> {
    Ok(LifecycleDefinition {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        code: row.try_get("code")?,
        entity_type: row.try_get("entity_type")?,
        definition: row.try_get("definition")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_lifecycle_version(row: &PgRow) -> Result<LifecycleVersion> {
    Ok(LifecycleVersion {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        lifecycle_id: row.try_get("lifecycle_id")?,
        version: row.try_get("version")?,
        definition: row.try_get("definition")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_approval_definition(row: &PgRow) -> Result<ApprovalDefinition> {
    Ok(ApprovalDefinition {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        code: row.try_get("code")?,
        entity_type: row.try_get("entity_type")?,
        rules: row.try_get("rules")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_instance(row: &PgRow) -> Result<WorkflowInstance> {
    Ok(WorkflowInstance {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        lifecycle_id: row.try_get("lifecycle_id")?,
        version_id: row.try_get("version_id")?,
        current_state: row.try_get("current_state")?,
        previous_state: row.try_get("previous_state")?,
        status: parse(row.try_get("status")?)?,
        org_unit_id: row.try_get("org_unit_id")?,
        module_code: row.try_get("module_code")?,
        row_version: row.try_get("row_version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_transition(row: &PgRow) -> Result<WorkflowTransition> {
    Ok(WorkflowTransition {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        instance_id: row.try_get("instance_id")?,
        from_state: row.try_get("from_state")?,
        to_state: row.try_get("to_state")?,
        triggered_by: row.try_get("triggered_by")?,
        transition_data: row.try_get("transition_data")?,
        sort_key: row.try_get("sort_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_approval(row: &PgRow) -> Result<ApprovalInstance> {
    Ok(ApprovalInstance {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        definition_id: row.try_get("definition_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        entity_snapshot: row.try_get("entity_snapshot")?,
        status: parse(row.try_get("status")?)?,
        decision: parse_opt(row.try_get("decision")?)?,
        requested_by: row.try_get("requested_by")?,
        org_unit_id: row.try_get("org_unit_id")?,
        module_code: row.try_get("module_code")?,
        row_version: row.try_get("row_version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn map_stage(row: &PgRow) -> Result<ApprovalStage> {
    let quorum: Value = row.try_get("quorum")?;
    Ok(ApprovalStage {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        stage_no: row.try_get("stage_no")?,
        name: row.try_get("name")?,
        mode: parse(row.try_get("mode")?)?,
        quorum: serde_json::from_value(quorum)
            .map_err(|e| EngineError::Database(e.to_string()))?,
        status: parse(row.try_get("status")?)?,
        decision: parse_opt(row.try_get("decision")?)?,
        activated_at: row.try_get("activated_at")?,
        resolved_at: row.try_get("resolved_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_task(row: &PgRow) -> Result<ApprovalTask> {
    Ok(ApprovalTask {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        stage_id: row.try_get("stage_id")?,
        order_index: row.try_get("order_index")?,
        status: parse(row.try_get("status")?)?,
        decision: parse_opt(row.try_get("decision")?)?,
        reason: row.try_get("reason")?,
        assignee_principal_id: row.try_get("assignee_principal_id")?,
        assignee_group_id: row.try_get("assignee_group_id")?,
        due_at: row.try_get("due_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_snapshot(row: &PgRow) -> Result<AssignmentSnapshot> {
    let principals: Value = row.try_get("resolved_principals")?;
    Ok(AssignmentSnapshot {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        stage_id: row.try_get("stage_id")?,
        assignee_group_id: row.try_get("assignee_group_id")?,
        resolved_principals: serde_json::from_value(principals)
            .map_err(|e| EngineError::Database(e.to_string()))?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn map_event(row: &PgRow) -> Result<ApprovalEvent> {
    Ok(ApprovalEvent {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        task_id: row.try_get("task_id")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        actor: row.try_get("actor")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn map_escalation(row: &PgRow) -> Result<ApprovalEscalation> {
    Ok(ApprovalEscalation {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        task_id: row.try_get("task_id")?,
        kind: row.try_get("kind")?,
        payload: row.try_get("payload")?,
        occurred_at: row.try_get("occurred_at")?,
    })
}

fn map_comment(row: &PgRow) -> Result<ApprovalComment> {
    Ok(ApprovalComment {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        approval_id: row.try_get("approval_id")?,
        task_id: row.try_get("task_id")?,
        author: row.try_get("author")?,
        body: row.try_get("body")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_timer(row: &PgRow) -> Result<TimerSchedule> {
    Ok(TimerSchedule {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        lifecycle_id: row.try_get("lifecycle_id")?,
        state: row.try_get("state")?,
        timer_type: parse(row.try_get("timer_type")?)?,
        status: parse(row.try_get("status")?)?,
        fire_at: row.try_get("fire_at")?,
        policy_snapshot: row.try_get("policy_snapshot")?,
        job_id: row.try_get("job_id")?,
        created_at: row.try_get("created_at")?,
        fired_at: row.try_get("fired_at")?,
        canceled_at: row.try_get("canceled_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

type PgTx<'a> = sqlx::Transaction<'a, sqlx::Postgres>;

async fn insert_instance(tx: &mut PgTx<'_>, instance: &WorkflowInstance) -> Result<()> {
    let result = sqlx::query(
        "INSERT INTO wf.workflow_instance
           (id, tenant_id, entity_type, entity_id, lifecycle_id, version_id,
            current_state, previous_state, status, org_unit_id, module_code,
            row_version, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(instance.id)
    .bind(instance.tenant_id)
    .bind(&instance.entity_type)
    .bind(instance.entity_id)
    .bind(instance.lifecycle_id)
    .bind(instance.version_id)
    .bind(&instance.current_state)
    .bind(&instance.previous_state)
    .bind(instance.status.to_string())
    .bind(instance.org_unit_id)
    .bind(&instance.module_code)
    .bind(instance.row_version)
    .bind(instance.created_at)
    .bind(instance.updated_at)
    .execute(&mut **tx)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(EngineError::DuplicateInstance {
            entity_type: instance.entity_type.clone(),
            entity_id: instance.entity_id,
        }),
        Err(e) => Err(e.into()),
    }
}

async fn update_instance(
    tx: &mut PgTx<'_>,
    instance: &WorkflowInstance,
    expected_version: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE wf.workflow_instance
         SET current_state = $1, previous_state = $2, status = $3,
             row_version = $4, updated_at = $5
         WHERE id = $6 AND row_version = $7",
    )
    .bind(&instance.current_state)
    .bind(&instance.previous_state)
    .bind(instance.status.to_string())
    .bind(instance.row_version)
    .bind(instance.updated_at)
    .bind(instance.id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::StaleWrite);
    }
    Ok(())
}

async fn insert_transition(tx: &mut PgTx<'_>, t: &WorkflowTransition) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.workflow_transition
           (id, tenant_id, instance_id, from_state, to_state, triggered_by,
            transition_data, sort_key, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(t.id)
    .bind(t.tenant_id)
    .bind(t.instance_id)
    .bind(&t.from_state)
    .bind(&t.to_state)
    .bind(t.triggered_by)
    .bind(&t.transition_data)
    .bind(t.sort_key)
    .bind(t.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_approval(tx: &mut PgTx<'_>, a: &ApprovalInstance) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.approval_instance
           (id, tenant_id, definition_id, entity_type, entity_id,
            entity_snapshot, status, decision, requested_by, org_unit_id,
            module_code, row_version, created_at, updated_at, resolved_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
    )
    .bind(a.id)
    .bind(a.tenant_id)
    .bind(a.definition_id)
    .bind(&a.entity_type)
    .bind(a.entity_id)
    .bind(&a.entity_snapshot)
    .bind(a.status.to_string())
    .bind(a.decision.map(|d| d.to_string()))
    .bind(a.requested_by)
    .bind(a.org_unit_id)
    .bind(&a.module_code)
    .bind(a.row_version)
    .bind(a.created_at)
    .bind(a.updated_at)
    .bind(a.resolved_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_approval(
    tx: &mut PgTx<'_>,
    a: &ApprovalInstance,
    expected_version: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE wf.approval_instance
         SET status = $1, decision = $2, row_version = $3, updated_at = $4,
             resolved_at = $5
         WHERE id = $6 AND row_version = $7",
    )
    .bind(a.status.to_string())
    .bind(a.decision.map(|d| d.to_string()))
    .bind(a.row_version)
    .bind(a.updated_at)
    .bind(a.resolved_at)
    .bind(a.id)
    .bind(expected_version)
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::StaleWrite);
    }
    Ok(())
}

async fn upsert_stage(tx: &mut PgTx<'_>, s: &ApprovalStage) -> Result<()> {
    let quorum = serde_json::to_value(&s.quorum)
        .map_err(|e| EngineError::Database(e.to_string()))?;
    sqlx::query(
        "INSERT INTO wf.approval_stage
           (id, tenant_id, approval_id, stage_no, name, mode, quorum, status,
            decision, activated_at, resolved_at, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (id) DO UPDATE
         SET status = EXCLUDED.status, decision = EXCLUDED.decision,
             activated_at = EXCLUDED.activated_at,
             resolved_at = EXCLUDED.resolved_at",
    )
    .bind(s.id)
    .bind(s.tenant_id)
    .bind(s.approval_id)
    .bind(s.stage_no)
    .bind(&s.name)
    .bind(s.mode.to_string())
    .bind(quorum)
    .bind(s.status.to_string())
    .bind(s.decision.map(|d| d.to_string()))
    .bind(s.activated_at)
    .bind(s.resolved_at)
    .bind(s.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_task(tx: &mut PgTx<'_>, t: &ApprovalTask) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.approval_task
           (id, tenant_id, approval_id, stage_id, order_index, status,
            decision, reason, assignee_principal_id, assignee_group_id,
            due_at, completed_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         ON CONFLICT (id) DO UPDATE
         SET status = EXCLUDED.status, decision = EXCLUDED.decision,
             reason = EXCLUDED.reason,
             assignee_principal_id = EXCLUDED.assignee_principal_id,
             due_at = EXCLUDED.due_at, completed_at = EXCLUDED.completed_at,
             updated_at = EXCLUDED.updated_at",
    )
    .bind(t.id)
    .bind(t.tenant_id)
    .bind(t.approval_id)
    .bind(t.stage_id)
    .bind(t.order_index)
    .bind(t.status.to_string())
    .bind(t.decision.map(|d| d.to_string()))
    .bind(&t.reason)
    .bind(t.assignee_principal_id)
    .bind(t.assignee_group_id)
    .bind(t.due_at)
    .bind(t.completed_at)
    .bind(t.created_at)
    .bind(t.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_snapshot(tx: &mut PgTx<'_>, s: &AssignmentSnapshot) -> Result<()> {
    let principals = serde_json::to_value(&s.resolved_principals)
        .map_err(|e| EngineError::Database(e.to_string()))?;
    sqlx::query(
        "INSERT INTO wf.approval_assignment_snapshot
           (id, tenant_id, approval_id, stage_id, assignee_group_id,
            resolved_principals, resolved_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(s.id)
    .bind(s.tenant_id)
    .bind(s.approval_id)
    .bind(s.stage_id)
    .bind(s.assignee_group_id)
    .bind(principals)
    .bind(s.resolved_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_escalation(tx: &mut PgTx<'_>, e: &ApprovalEscalation) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.approval_escalation
           (id, tenant_id, approval_id, task_id, kind, payload, occurred_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(e.id)
    .bind(e.tenant_id)
    .bind(e.approval_id)
    .bind(e.task_id)
    .bind(&e.kind)
    .bind(&e.payload)
    .bind(e.occurred_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_event(tx: &mut PgTx<'_>, e: &ApprovalEvent) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.approval_event
           (id, tenant_id, approval_id, task_id, kind, payload, actor,
            occurred_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(e.id)
    .bind(e.tenant_id)
    .bind(e.approval_id)
    .bind(e.task_id)
    .bind(&e.kind)
    .bind(&e.payload)
    .bind(e.actor)
    .bind(e.occurred_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_comment(tx: &mut PgTx<'_>, c: &ApprovalComment) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.approval_comment
           (id, tenant_id, approval_id, task_id, author, body, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(c.id)
    .bind(c.tenant_id)
    .bind(c.approval_id)
    .bind(c.task_id)
    .bind(c.author)
    .bind(&c.body)
    .bind(c.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_timer(tx: &mut PgTx<'_>, t: &TimerSchedule) -> Result<()> {
    sqlx::query(
        "INSERT INTO wf.lifecycle_timer_schedule
           (id, tenant_id, entity_type, entity_id, lifecycle_id, state,
            timer_type, status, fire_at, policy_snapshot, job_id, created_at,
            fired_at, canceled_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(t.id)
    .bind(t.tenant_id)
    .bind(&t.entity_type)
    .bind(t.entity_id)
    .bind(t.lifecycle_id)
    .bind(&t.state)
    .bind(t.timer_type.to_string())
    .bind(t.status.to_string())
    .bind(t.fire_at)
    .bind(&t.policy_snapshot)
    .bind(&t.job_id)
    .bind(t.created_at)
    .bind(t.fired_at)
    .bind(t.canceled_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO wf.lifecycle_definition
               (id, tenant_id, code, entity_type, definition, created_at,
                updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(def.id)
        .bind(def.tenant_id)
        .bind(&def.code)
        .bind(&def.entity_type)
        .bind(&def.definition)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_lifecycle_definition(&self, def: LifecycleDefinition) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wf.lifecycle_definition
             SET definition = $1, entity_type = $2, updated_at = $3
             WHERE id = $4 AND tenant_id = $5",
        )
        .bind(&def.definition)
        .bind(&def.entity_type)
        .bind(def.updated_at)
        .bind(def.id)
        .bind(def.tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "lifecycle definition",
                id: def.id,
            });
        }
        Ok(())
    }

    async fn delete_lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<()> {
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM wf.lifecycle_version WHERE lifecycle_id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        if referenced {
            return Err(EngineError::DefinitionInUse { id });
        }

        let result = sqlx::query(
            "DELETE FROM wf.lifecycle_definition WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "lifecycle definition",
                id,
            });
        }
        Ok(())
    }

    async fn lifecycle_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<LifecycleDefinition> {
        let row = sqlx::query(
            "SELECT * FROM wf.lifecycle_definition WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound {
            kind: "lifecycle definition",
            id,
        })?;
        map_lifecycle_definition(&row)
    }

    async fn lifecycle_definition_by_code(
        &self,
        tenant_id: Uuid,
        code: &str,
    ) -> Result<Option<LifecycleDefinition>> {
        let row = sqlx::query(
            "SELECT * FROM wf.lifecycle_definition WHERE tenant_id = $1 AND code = $2",
        )
        .bind(tenant_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_lifecycle_definition).transpose()
    }

    async fn insert_lifecycle_version(&self, version: LifecycleVersion) -> Result<()> {
        sqlx::query(
            "INSERT INTO wf.lifecycle_version
               (id, tenant_id, lifecycle_id, version, definition, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(version.id)
        .bind(version.tenant_id)
        .bind(version.lifecycle_id)
        .bind(version.version)
        .bind(&version.definition)
        .bind(version.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lifecycle_version(&self, id: Uuid) -> Result<LifecycleVersion> {
        let row = sqlx::query("SELECT * FROM wf.lifecycle_version WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "lifecycle version",
                id,
            })?;
        map_lifecycle_version(&row)
    }

    async fn latest_lifecycle_version(
        &self,
        lifecycle_id: Uuid,
    ) -> Result<Option<LifecycleVersion>> {
        let row = sqlx::query(
            "SELECT * FROM wf.lifecycle_version
             WHERE lifecycle_id = $1
             ORDER BY version DESC
             LIMIT 1",
        )
        .bind(lifecycle_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_lifecycle_version).transpose()
    }

    async fn insert_approval_definition(&self, def: ApprovalDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO wf.approval_definition
               (id, tenant_id, code, entity_type, rules, created_at,
                updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(def.id)
        .bind(def.tenant_id)
        .bind(&def.code)
        .bind(&def.entity_type)
        .bind(&def.rules)
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_approval_definition(&self, def: ApprovalDefinition) -> Result<()> {
        let result = sqlx::query(
            "UPDATE wf.approval_definition
             SET rules = $1, entity_type = $2, updated_at = $3
             WHERE id = $4 AND tenant_id = $5",
        )
        .bind(&def.rules)
        .bind(&def.entity_type)
        .bind(def.updated_at)
        .bind(def.id)
        .bind(def.tenant_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound {
                kind: "approval definition",
                id: def.id,
            });
        }
        Ok(())
    }

    async fn approval_definition(&self, tenant_id: Uuid, id: Uuid) -> Result<ApprovalDefinition> {
        let row = sqlx::query(
            "SELECT * FROM wf.approval_definition WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(EngineError::NotFound {
            kind: "approval definition",
            id,
        })?;
        map_approval_definition(&row)
    }

    async fn workflow_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        let row = sqlx::query("SELECT * FROM wf.workflow_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "workflow instance",
                id,
            })?;
        map_instance(&row)
    }

    async fn workflow_instance_by_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>> {
        let row = sqlx::query(
            "SELECT * FROM wf.workflow_instance
             WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3",
        )
        .bind(tenant_id)
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_instance).transpose()
    }

    async fn transitions_for(&self, instance_id: Uuid) -> Result<Vec<WorkflowTransition>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.workflow_transition
             WHERE instance_id = $1
             ORDER BY sort_key",
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_transition).collect()
    }

    async fn next_transition_sort_key(&self, instance_id: Uuid) -> Result<i32> {
        let max: Option<i32> = sqlx::query_scalar(
            "SELECT MAX(sort_key) FROM wf.workflow_transition WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0) + 1)
    }

    async fn approval_instance(&self, id: Uuid) -> Result<ApprovalInstance> {
        let row = sqlx::query("SELECT * FROM wf.approval_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "approval instance",
                id,
            })?;
        map_approval(&row)
    }

    async fn open_approvals_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<ApprovalInstance>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_instance
             WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3
               AND status IN ('pending', 'escalated')",
        )
        .bind(tenant_id)
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_approval).collect()
    }

    async fn stages_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalStage>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_stage
             WHERE approval_id = $1
             ORDER BY stage_no",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_stage).collect()
    }

    async fn tasks_for_approval(&self, approval_id: Uuid) -> Result<Vec<ApprovalTask>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_task
             WHERE approval_id = $1
             ORDER BY stage_id, order_index",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_task).collect()
    }

    async fn approval_task(&self, id: Uuid) -> Result<ApprovalTask> {
        let row = sqlx::query("SELECT * FROM wf.approval_task WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "approval task",
                id,
            })?;
        map_task(&row)
    }

    async fn snapshots_for(&self, approval_id: Uuid) -> Result<Vec<AssignmentSnapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_assignment_snapshot
             WHERE approval_id = $1
             ORDER BY resolved_at",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_snapshot).collect()
    }

    async fn events_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_event
             WHERE approval_id = $1
             ORDER BY occurred_at",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_event).collect()
    }

    async fn escalations_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalEscalation>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_escalation
             WHERE approval_id = $1
             ORDER BY occurred_at",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_escalation).collect()
    }

    async fn comments_for(&self, approval_id: Uuid) -> Result<Vec<ApprovalComment>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.approval_comment
             WHERE approval_id = $1
             ORDER BY created_at",
        )
        .bind(approval_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_comment).collect()
    }

    async fn comment(&self, id: Uuid) -> Result<ApprovalComment> {
        let row = sqlx::query("SELECT * FROM wf.approval_comment WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "approval comment",
                id,
            })?;
        map_comment(&row)
    }

    async fn timer(&self, id: Uuid) -> Result<TimerSchedule> {
        let row = sqlx::query("SELECT * FROM wf.lifecycle_timer_schedule WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(EngineError::NotFound {
                kind: "timer schedule",
                id,
            })?;
        map_timer(&row)
    }

    async fn scheduled_timers_for_entity(
        &self,
        tenant_id: Uuid,
        entity: &EntityRef,
    ) -> Result<Vec<TimerSchedule>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.lifecycle_timer_schedule
             WHERE tenant_id = $1 AND entity_type = $2 AND entity_id = $3
               AND status = 'scheduled'",
        )
        .bind(tenant_id)
        .bind(&entity.entity_type)
        .bind(entity.entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_timer).collect()
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<TimerSchedule>> {
        let rows = sqlx::query(
            "SELECT * FROM wf.lifecycle_timer_schedule
             WHERE status = 'scheduled' AND fire_at <= $1
             ORDER BY fire_at",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_timer).collect()
    }

    async fn transition_timer(
        &self,
        id: Uuid,
        from: TimerStatus,
        to: TimerStatus,
    ) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE wf.lifecycle_timer_schedule
             SET status = $1,
                 fired_at = CASE WHEN $1 = 'fired' THEN $2 ELSE fired_at END,
                 canceled_at = CASE WHEN $1 = 'canceled' THEN $2 ELSE canceled_at END
             WHERE id = $3 AND status = $4",
        )
        .bind(to.to_string())
        .bind(now)
        .bind(id)
        .bind(from.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn capabilities_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<CapabilityRow>> {
        let rows = sqlx::query(
            "SELECT tenant_id, persona, operation, constraint_type
             FROM sec.persona_capability
             WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(CapabilityRow {
                    tenant_id: row.try_get("tenant_id")?,
                    persona: row.try_get("persona")?,
                    operation: row.try_get("operation")?,
                    constraint_type: parse::<ConstraintType>(row.try_get("constraint_type")?)?,
                })
            })
            .collect()
    }

    async fn apply(&self, changes: ChangeSet) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for change in changes.changes() {
            match change {
                Change::InsertInstance(instance) => insert_instance(&mut tx, instance).await?,
                Change::UpdateInstance {
                    instance,
                    expected_version,
                } => update_instance(&mut tx, instance, *expected_version).await?,
                Change::InsertTransition(transition) => {
                    insert_transition(&mut tx, transition).await?
                }
                Change::InsertApproval(approval) => insert_approval(&mut tx, approval).await?,
                Change::UpdateApproval {
                    approval,
                    expected_version,
                } => update_approval(&mut tx, approval, *expected_version).await?,
                Change::InsertStage(stage) | Change::UpdateStage(stage) => {
                    upsert_stage(&mut tx, stage).await?
                }
                Change::InsertTask(task) | Change::UpdateTask(task) => {
                    upsert_task(&mut tx, task).await?
                }
                Change::InsertSnapshot(snapshot) => insert_snapshot(&mut tx, snapshot).await?,
                Change::InsertEscalation(escalation) => {
                    insert_escalation(&mut tx, escalation).await?
                }
                Change::InsertEvent(event) => insert_event(&mut tx, event).await?,
                Change::InsertComment(comment) => insert_comment(&mut tx, comment).await?,
                Change::DeleteComment { comment_id } => {
                    sqlx::query("DELETE FROM wf.approval_comment WHERE id = $1")
                        .bind(comment_id)
                        .execute(&mut *tx)
                        .await?;
                }
                Change::InsertTimer(timer) => insert_timer(&mut tx, timer).await?,
                Change::CancelTimer { schedule_id } => {
                    sqlx::query(
                        "UPDATE wf.lifecycle_timer_schedule
                         SET status = 'canceled', canceled_at = $1
                         WHERE id = $2 AND status = 'scheduled'",
                    )
                    .bind(Utc::now())
                    .bind(schedule_id)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

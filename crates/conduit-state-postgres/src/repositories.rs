use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::debug;

use conduit_core::{
    domain::repository::{
        ConnectorInstanceRepository, FlowNodeInstanceRepository, Guard,
        ProcessDefinitionRepository, ProcessInstanceRepository, UnitOfWork,
        UnitOfWorkRepository, VariableUpdate, WorkItemRepository,
    },
    domain::work_item::WorkStatus,
    ConnectorInstance, ConnectorInstanceId, ContainerRef, ContainerState, CoreError, ExecutorId,
    FlowNodeInstance, FlowNodeInstanceId, ProcessDefinition, ProcessDefinitionId,
    ProcessInstance, ProcessInstanceId, WorkItem, WorkItemId, WorkKind,
};

use crate::PostgresStateStore;

const WORK_ITEM_COLUMNS: &str =
    "id, process_instance_id, sequence_key, kind, status, claimed_by, attempts, created_at, updated_at";

/// Postgres unique_violation
const UNIQUE_VIOLATION: &str = "23505";

fn store_error(action: &str, e: sqlx::Error) -> CoreError {
    CoreError::StateStoreError(format!("Failed to {}: {}", action, e))
}

fn decode<T: DeserializeOwned>(row: &PgRow, column: &str) -> Result<T, CoreError> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| store_error(&format!("read column {}", column), e))?;
    serde_json::from_value(value).map_err(|e| {
        CoreError::SerializationFailure(format!("Error deserializing {}: {}", column, e))
    })
}

fn work_item_from_row(row: &PgRow) -> Result<WorkItem, CoreError> {
    let read = |e| store_error("read work item", e);
    let status: String = row.try_get("status").map_err(read)?;
    let status = match status.as_str() {
        "pending" => WorkStatus::Pending,
        "claimed" => WorkStatus::Claimed,
        other => {
            return Err(CoreError::SerializationFailure(format!(
                "Unknown work item status: {}",
                other
            )))
        }
    };
    let claimed_by: Option<String> = row.try_get("claimed_by").map_err(read)?;
    let attempts: i32 = row.try_get("attempts").map_err(read)?;
    let kind: WorkKind = decode(row, "kind")?;

    Ok(WorkItem {
        id: WorkItemId(row.try_get("id").map_err(read)?),
        kind,
        process_instance_id: ProcessInstanceId(row.try_get("process_instance_id").map_err(read)?),
        sequence_key: row.try_get("sequence_key").map_err(read)?,
        status,
        claimed_by: claimed_by.map(ExecutorId),
        attempts: attempts.max(0) as u32,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

async fn check_guard(conn: &mut PgConnection, guard: &Guard) -> Result<(), CoreError> {
    let holds = match guard {
        Guard::ConnectorState { id, expected } => {
            let state: Option<String> =
                sqlx::query_scalar("SELECT state FROM connector_instances WHERE id = $1 FOR UPDATE")
                    .bind(&id.0)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| store_error("check connector state", e))?;
            state.as_deref() == Some(expected.as_str())
        }
        Guard::FlowNodeState { id, expected } => {
            let state: Option<i32> =
                sqlx::query_scalar("SELECT state FROM flow_node_instances WHERE id = $1 FOR UPDATE")
                    .bind(&id.0)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| store_error("check flow node state", e))?;
            state == Some(expected.state_id())
        }
        Guard::ProcessState { id, expected } => {
            let state: Option<i32> =
                sqlx::query_scalar("SELECT state FROM process_instances WHERE id = $1 FOR UPDATE")
                    .bind(&id.0)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(|e| store_error("check process state", e))?;
            state == Some(expected.state_id())
        }
        Guard::WorkClaimedBy { id, executor } => {
            let claim: Option<(String, Option<String>)> = sqlx::query_as(
                "SELECT status, claimed_by FROM work_items WHERE id = $1 FOR UPDATE",
            )
            .bind(&id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| store_error("check work claim", e))?;
            matches!(claim, Some((status, Some(owner))) if status == WorkStatus::Claimed.as_str() && owner == executor.0)
        }
        Guard::NoWorkFor { sequence_key } => {
            // Serializes concurrent checks of the same key until commit
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(sequence_key)
                .execute(&mut *conn)
                .await
                .map_err(|e| store_error("lock sequence", e))?;
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM work_items WHERE sequence_key = $1)")
                    .bind(sequence_key)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| store_error("check sequence", e))?;
            !exists
        }
    };

    if holds {
        Ok(())
    } else {
        Err(CoreError::ConcurrentModification(format!(
            "Guard failed: {:?}",
            guard
        )))
    }
}

async fn upsert_process(conn: &mut PgConnection, process: &ProcessInstance) -> Result<(), CoreError> {
    let data = serde_json::to_value(process)?;
    // Variables of a stored process change only through merges
    sqlx::query(
        "
        INSERT INTO process_instances (id, definition_id, state, data, created_at, last_update)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            last_update = EXCLUDED.last_update,
            data = process_instances.data || jsonb_build_object(
                'state', EXCLUDED.data->'state',
                'previous_state', EXCLUDED.data->'previous_state',
                'last_update', EXCLUDED.data->'last_update'
            )
        ",
    )
    .bind(&process.id.0)
    .bind(&process.definition_id.0)
    .bind(process.state.state_id())
    .bind(&data)
    .bind(process.created_at)
    .bind(process.last_update)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("save process instance", e))?;
    Ok(())
}

async fn upsert_flow_node(conn: &mut PgConnection, node: &FlowNodeInstance) -> Result<(), CoreError> {
    let data = serde_json::to_value(node)?;
    sqlx::query(
        "
        INSERT INTO flow_node_instances (id, process_instance_id, state, data, created_at, last_update)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            data = EXCLUDED.data,
            last_update = EXCLUDED.last_update
        ",
    )
    .bind(&node.id.0)
    .bind(&node.process_instance_id.0)
    .bind(node.state.state_id())
    .bind(&data)
    .bind(node.created_at)
    .bind(node.last_update)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("save flow node instance", e))?;
    Ok(())
}

async fn upsert_connector(
    conn: &mut PgConnection,
    connector: &ConnectorInstance,
) -> Result<(), CoreError> {
    let data = serde_json::to_value(connector)?;
    sqlx::query(
        "
        INSERT INTO connector_instances
            (id, process_instance_id, container_id, container_type, activation_event, execution_index, state, data, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            state = EXCLUDED.state,
            data = EXCLUDED.data,
            updated_at = EXCLUDED.updated_at
        ",
    )
    .bind(&connector.id.0)
    .bind(&connector.process_instance_id.0)
    .bind(&connector.container_id)
    .bind(connector.container_type.as_str())
    .bind(connector.activation_event.as_str())
    .bind(connector.execution_index as i32)
    .bind(connector.state.as_str())
    .bind(&data)
    .bind(connector.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("save connector instance", e))?;
    Ok(())
}

async fn merge_variable(conn: &mut PgConnection, update: &VariableUpdate) -> Result<(), CoreError> {
    let result = sqlx::query(
        "
        UPDATE process_instances
        SET data = jsonb_set(data, ARRAY['variables', $2::text], $3, true)
        WHERE id = $1
        ",
    )
    .bind(&update.process_instance_id.0)
    .bind(&update.name)
    .bind(&update.value)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("merge process variable", e))?;

    if result.rows_affected() == 0 {
        return Err(CoreError::ProcessInstanceNotFound(
            update.process_instance_id.0.clone(),
        ));
    }
    Ok(())
}

async fn release_work(conn: &mut PgConnection, id: &WorkItemId) -> Result<(), CoreError> {
    // An identical item queued meanwhile replaces the released one
    sqlx::query(
        "
        DELETE FROM work_items w
        WHERE w.id = $1 AND EXISTS (
            SELECT 1 FROM work_items p
            WHERE p.status = 'pending' AND p.sequence_key = w.sequence_key
              AND p.kind = w.kind AND p.id <> w.id
        )
        ",
    )
    .bind(&id.0)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("release work item", e))?;

    sqlx::query(
        "UPDATE work_items SET status = 'pending', claimed_by = NULL, updated_at = $2 WHERE id = $1",
    )
    .bind(&id.0)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("release work item", e))?;
    Ok(())
}

async fn enqueue_work(conn: &mut PgConnection, item: &WorkItem) -> Result<(), CoreError> {
    let kind = serde_json::to_value(&item.kind)?;
    let result = sqlx::query(
        "
        INSERT INTO work_items (id, process_instance_id, sequence_key, kind, status, attempts, created_at, updated_at)
        VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6)
        ON CONFLICT DO NOTHING
        ",
    )
    .bind(&item.id.0)
    .bind(&item.process_instance_id.0)
    .bind(&item.sequence_key)
    .bind(&kind)
    .bind(item.created_at)
    .bind(item.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| store_error("enqueue work item", e))?;

    if result.rows_affected() == 0 {
        debug!(sequence_key = %item.sequence_key, "Identical work already queued");
    }
    Ok(())
}

#[async_trait]
impl UnitOfWorkRepository for PostgresStateStore {
    async fn commit(&self, unit: UnitOfWork) -> Result<(), CoreError> {
        let mut tx = self
            .connection()
            .pool()
            .begin()
            .await
            .map_err(|e| store_error("begin transaction", e))?;

        for guard in &unit.guards {
            check_guard(&mut tx, guard).await?;
        }
        for process in &unit.process_instances {
            upsert_process(&mut tx, process).await?;
        }
        for node in &unit.flow_nodes {
            upsert_flow_node(&mut tx, node).await?;
        }
        for connector in &unit.connectors {
            upsert_connector(&mut tx, connector).await?;
        }
        for update in &unit.variable_updates {
            merge_variable(&mut tx, update).await?;
        }
        for id in &unit.complete_work {
            sqlx::query("DELETE FROM work_items WHERE id = $1")
                .bind(&id.0)
                .execute(&mut *tx)
                .await
                .map_err(|e| store_error("complete work item", e))?;
        }
        for id in &unit.release_work {
            release_work(&mut tx, id).await?;
        }
        for item in &unit.enqueue {
            enqueue_work(&mut tx, item).await?;
        }

        tx.commit()
            .await
            .map_err(|e| store_error("commit transaction", e))
    }
}

#[async_trait]
impl ProcessDefinitionRepository for PostgresStateStore {
    async fn find_definition(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, CoreError> {
        let row = sqlx::query("SELECT data FROM process_definitions WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.connection().pool())
            .await
            .map_err(|e| store_error("load process definition", e))?;
        row.map(|r| decode(&r, "data")).transpose()
    }

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<(), CoreError> {
        let data = serde_json::to_value(definition)?;
        sqlx::query(
            "
            INSERT INTO process_definitions (id, data)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET data = $2, updated_at = NOW()
            ",
        )
        .bind(&definition.id.0)
        .bind(&data)
        .execute(self.connection().pool())
        .await
        .map_err(|e| store_error("save process definition", e))?;
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM process_definitions ORDER BY id")
            .fetch_all(self.connection().pool())
            .await
            .map_err(|e| store_error("list process definitions", e))?;
        Ok(ids.into_iter().map(ProcessDefinitionId).collect())
    }
}

#[async_trait]
impl ProcessInstanceRepository for PostgresStateStore {
    async fn find_process_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError> {
        let row = sqlx::query("SELECT data FROM process_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.connection().pool())
            .await
            .map_err(|e| store_error("load process instance", e))?;
        row.map(|r| decode(&r, "data")).transpose()
    }

    async fn find_stale_process_instances(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ProcessInstance>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM process_instances WHERE state NOT IN ($2, $3) AND last_update < $1",
        )
        .bind(older_than)
        .bind(ContainerState::Completed.state_id())
        .bind(ContainerState::Failed.state_id())
        .fetch_all(self.connection().pool())
        .await
        .map_err(|e| store_error("find stale process instances", e))?;
        rows.iter().map(|r| decode(r, "data")).collect()
    }

    async fn delete_process_instance(&self, id: &ProcessInstanceId) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM process_instances WHERE id = $1")
            .bind(&id.0)
            .execute(self.connection().pool())
            .await
            .map_err(|e| store_error("delete process instance", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FlowNodeInstanceRepository for PostgresStateStore {
    async fn find_flow_node(
        &self,
        id: &FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, CoreError> {
        let row = sqlx::query("SELECT data FROM flow_node_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.connection().pool())
            .await
            .map_err(|e| store_error("load flow node instance", e))?;
        row.map(|r| decode(&r, "data")).transpose()
    }

    async fn find_flow_nodes_of_process(
        &self,
        process_instance_id: &ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM flow_node_instances WHERE process_instance_id = $1 ORDER BY created_at, id",
        )
        .bind(&process_instance_id.0)
        .fetch_all(self.connection().pool())
        .await
        .map_err(|e| store_error("load flow nodes of process", e))?;
        rows.iter().map(|r| decode(r, "data")).collect()
    }

    async fn find_stale_flow_nodes(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let rows = sqlx::query(
            "SELECT data FROM flow_node_instances WHERE state NOT IN ($2, $3) AND last_update < $1",
        )
        .bind(older_than)
        .bind(ContainerState::Completed.state_id())
        .bind(ContainerState::Failed.state_id())
        .fetch_all(self.connection().pool())
        .await
        .map_err(|e| store_error("find stale flow nodes", e))?;
        rows.iter().map(|r| decode(r, "data")).collect()
    }
}

#[async_trait]
impl ConnectorInstanceRepository for PostgresStateStore {
    async fn find_connector_instance(
        &self,
        id: &ConnectorInstanceId,
    ) -> Result<Option<ConnectorInstance>, CoreError> {
        let row = sqlx::query("SELECT data FROM connector_instances WHERE id = $1")
            .bind(&id.0)
            .fetch_optional(self.connection().pool())
            .await
            .map_err(|e| store_error("load connector instance", e))?;
        row.map(|r| decode(&r, "data")).transpose()
    }

    async fn find_connectors_of_container(
        &self,
        container: &ContainerRef,
    ) -> Result<Vec<ConnectorInstance>, CoreError> {
        let rows = sqlx::query(
            "
            SELECT data FROM connector_instances
            WHERE container_id = $1 AND container_type = $2
            ORDER BY activation_event, execution_index, id
            ",
        )
        .bind(container.container_id())
        .bind(container.container_type().as_str())
        .fetch_all(self.connection().pool())
        .await
        .map_err(|e| store_error("load connectors of container", e))?;
        rows.iter().map(|r| decode(r, "data")).collect()
    }
}

#[async_trait]
impl WorkItemRepository for PostgresStateStore {
    async fn claim_next_work_item(
        &self,
        executor: &ExecutorId,
    ) -> Result<Option<WorkItem>, CoreError> {
        let query = format!(
            "
            UPDATE work_items
            SET status = 'claimed', claimed_by = $1, attempts = attempts + 1, updated_at = $2
            WHERE id = (
                SELECT w.id FROM work_items w
                WHERE w.status = 'pending'
                  AND NOT EXISTS (
                      SELECT 1 FROM work_items c
                      WHERE c.sequence_key = w.sequence_key AND c.status = 'claimed'
                  )
                ORDER BY w.position
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            ",
            WORK_ITEM_COLUMNS
        );

        match sqlx::query(&query)
            .bind(&executor.0)
            .bind(Utc::now())
            .fetch_optional(self.connection().pool())
            .await
        {
            Ok(row) => row.map(|r| work_item_from_row(&r)).transpose(),
            // Another executor claimed the same sequence concurrently
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                debug!(executor_id = %executor, "Sequence claimed concurrently, retrying later");
                Ok(None)
            }
            Err(e) => Err(store_error("claim work item", e)),
        }
    }

    async fn find_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>, CoreError> {
        let query = format!("SELECT {} FROM work_items WHERE id = $1", WORK_ITEM_COLUMNS);
        let row = sqlx::query(&query)
            .bind(&id.0)
            .fetch_optional(self.connection().pool())
            .await
            .map_err(|e| store_error("load work item", e))?;
        row.map(|r| work_item_from_row(&r)).transpose()
    }

    async fn find_work_for_sequence(
        &self,
        sequence_key: &str,
    ) -> Result<Vec<WorkItem>, CoreError> {
        let query = format!(
            "SELECT {} FROM work_items WHERE sequence_key = $1 ORDER BY position",
            WORK_ITEM_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(sequence_key)
            .fetch_all(self.connection().pool())
            .await
            .map_err(|e| store_error("load work for sequence", e))?;
        rows.iter().map(work_item_from_row).collect()
    }

    async fn find_stale_work_items(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>, CoreError> {
        let query = format!(
            "SELECT {} FROM work_items WHERE updated_at < $1 ORDER BY position",
            WORK_ITEM_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(older_than)
            .fetch_all(self.connection().pool())
            .await
            .map_err(|e| store_error("find stale work items", e))?;
        rows.iter().map(work_item_from_row).collect()
    }

    async fn count_pending_work(&self) -> Result<usize, CoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM work_items WHERE status = 'pending'")
                .fetch_one(self.connection().pool())
                .await
                .map_err(|e| store_error("count pending work", e))?;
        Ok(count.max(0) as usize)
    }

    async fn touch_claim(&self, id: &WorkItemId, executor: &ExecutorId) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE work_items SET updated_at = $3 \
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2",
        )
        .bind(&id.0)
        .bind(&executor.0)
        .bind(Utc::now())
        .execute(self.connection().pool())
        .await
        .map_err(|e| store_error("refresh work claim", e))?;
        Ok(result.rows_affected() > 0)
    }
}

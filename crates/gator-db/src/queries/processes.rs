use std::collections::HashMap;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::ids;
use crate::models::{ProcessRow, ProcessRowSql, ProcessStatus, ProcessType};

/// Parameters for registering a new supervised process (§4.1/§4.5).
pub struct NewProcess<'a> {
    pub mission_id: Option<&'a str>,
    pub r#type: ProcessType,
    pub command: &'a str,
    pub cwd: Option<&'a str>,
    pub env: &'a HashMap<String, String>,
}

pub async fn create(pool: &SqlitePool, new: NewProcess<'_>) -> StoreResult<ProcessRow> {
    let id = ids::generate("proc");
    let now = Utc::now();
    let env = serde_json::to_string(new.env).unwrap_or_else(|_| "{}".to_string());

    sqlx::query(
        "INSERT INTO processes \
         (id, mission_id, type, command, cwd, env, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(new.mission_id)
    .bind(new.r#type.as_str())
    .bind(new.command)
    .bind(new.cwd)
    .bind(env)
    .bind(ProcessStatus::Queued.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(StoreError::from_sqlx_write)?;

    find_by_id(pool, &id)
        .await?
        .ok_or_else(|| StoreError::not_found("process", &id))
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> StoreResult<Option<ProcessRow>> {
    let row: Option<ProcessRowSql> = sqlx::query_as("SELECT * FROM processes WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(ProcessRow::from))
}

pub async fn find_by_container_id(
    pool: &SqlitePool,
    container_id: &str,
) -> StoreResult<Option<ProcessRow>> {
    let row: Option<ProcessRowSql> =
        sqlx::query_as("SELECT * FROM processes WHERE container_id = ?")
            .bind(container_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(ProcessRow::from))
}

pub async fn find_by_mission(pool: &SqlitePool, mission_id: &str) -> StoreResult<Vec<ProcessRow>> {
    let rows: Vec<ProcessRowSql> = sqlx::query_as(
        "SELECT * FROM processes WHERE mission_id = ? ORDER BY created_at ASC",
    )
    .bind(mission_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ProcessRow::from).collect())
}

/// Every process not yet in a terminal status, across all missions — the
/// working set `Recovery` reconciles at startup (§4.7).
pub async fn find_non_terminal(pool: &SqlitePool) -> StoreResult<Vec<ProcessRow>> {
    let rows: Vec<ProcessRowSql> = sqlx::query_as(
        "SELECT * FROM processes WHERE status IN ('QUEUED', 'RUNNING') ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(ProcessRow::from).collect())
}

pub async fn update_pid(pool: &SqlitePool, id: &str, pid: i64, pgid: i64) -> StoreResult<()> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE processes SET pid = ?, pgid = ?, status = ?, started_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(pid)
    .bind(pgid)
    .bind(ProcessStatus::Running.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("process", id));
    }
    Ok(())
}

pub async fn update_container_id(pool: &SqlitePool, id: &str, container_id: &str) -> StoreResult<()> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE processes SET container_id = ?, status = ?, started_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(container_id)
    .bind(ProcessStatus::Running.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("process", id));
    }
    Ok(())
}

pub async fn update_heartbeat(pool: &SqlitePool, id: &str) -> StoreResult<()> {
    let now = Utc::now();
    sqlx::query("UPDATE processes SET heartbeat_at = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Move a process into a terminal status, stamping `exit_code`/`ended_at`
/// once. Idempotent: re-applying the same terminal status is a no-op.
pub async fn finish(
    pool: &SqlitePool,
    id: &str,
    status: ProcessStatus,
    exit_code: Option<i64>,
) -> StoreResult<ProcessRow> {
    if !status.is_terminal() {
        return Err(StoreError::Precondition(format!(
            "{status} is not a terminal process status"
        )));
    }

    let existing = find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("process", id))?;

    if existing.status.is_terminal() {
        return Ok(existing);
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE processes SET status = ?, exit_code = ?, ended_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(exit_code)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("process", id))
}

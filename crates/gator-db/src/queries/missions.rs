use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::ids;
use crate::models::{Mission, MissionRow, MissionState};

/// The allowed transition table from §3. `force=true` (used only by
/// Recovery) bypasses this check entirely.
fn is_valid_transition(from: MissionState, to: MissionState) -> bool {
    use MissionState::*;
    matches!(
        (from, to),
        (Draft, GeneratingPrd)
            | (GeneratingPrd, PrdReview)
            | (GeneratingPrd, CompletedFailed)
            | (PrdReview, PreparingTasks)
            | (PrdReview, GeneratingPrd)
            | (PrdReview, CompletedFailed)
            | (PreparingTasks, TasksReview)
            | (PreparingTasks, CompletedFailed)
            | (TasksReview, InProgress)
            | (TasksReview, PreparingTasks)
            | (TasksReview, CompletedFailed)
            | (InProgress, CompletedSuccess)
            | (InProgress, CompletedFailed)
    )
}

pub async fn create(
    pool: &SqlitePool,
    project_id: &str,
    feature_name: &str,
    description: Option<&str>,
) -> StoreResult<Mission> {
    let id = ids::generate("mis");
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO missions \
         (id, project_id, feature_name, description, state, prd_iterations, tasks_iterations, \
          created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, 0, ?, ?)",
    )
    .bind(&id)
    .bind(project_id)
    .bind(feature_name)
    .bind(description)
    .bind(MissionState::Draft.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(StoreError::from_sqlx_write)?;

    find_by_id(pool, &id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", &id))
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> StoreResult<Option<Mission>> {
    let row: Option<MissionRow> = sqlx::query_as("SELECT * FROM missions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Mission::from))
}

pub async fn find_by_project(pool: &SqlitePool, project_id: &str) -> StoreResult<Vec<Mission>> {
    let rows: Vec<MissionRow> = sqlx::query_as(
        "SELECT * FROM missions WHERE project_id = ? ORDER BY created_at DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Mission::from).collect())
}

pub async fn find_by_states(
    pool: &SqlitePool,
    states: &[MissionState],
) -> StoreResult<Vec<Mission>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT * FROM missions WHERE state IN ({placeholders}) ORDER BY created_at DESC"
    );
    let mut query = sqlx::query_as::<_, MissionRow>(&sql);
    for state in states {
        query = query.bind(state.as_str());
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(Mission::from).collect())
}

pub async fn find_all(pool: &SqlitePool) -> StoreResult<Vec<Mission>> {
    let rows: Vec<MissionRow> = sqlx::query_as("SELECT * FROM missions ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(Mission::from).collect())
}

/// Validate and apply a state transition, stamping `started_at`/`ended_at`
/// exactly once (§3 task/process timestamp invariant applies to missions
/// too, via `started_at`/`ended_at`).
///
/// `force=true` bypasses the transition table; only Recovery is permitted
/// to pass `force=true` (§3).
pub async fn update_state(
    pool: &SqlitePool,
    id: &str,
    to: MissionState,
    force: bool,
) -> StoreResult<Mission> {
    let mission = find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))?;

    if !force && !is_valid_transition(mission.state, to) {
        return Err(StoreError::InvalidStateTransition {
            from: mission.state,
            to,
        });
    }

    let now = Utc::now();
    let started_at = if to == MissionState::GeneratingPrd && mission.started_at.is_none() {
        Some(now)
    } else {
        mission.started_at
    };
    let ended_at = if to.is_terminal() && mission.ended_at.is_none() {
        Some(now)
    } else {
        mission.ended_at
    };

    // CAS on the expected current state to guard against a concurrent
    // writer (§5: mission transitions are serialized per mission).
    let rows_affected = sqlx::query(
        "UPDATE missions SET state = ?, started_at = ?, ended_at = ?, updated_at = ? \
         WHERE id = ? AND state = ?",
    )
    .bind(to.as_str())
    .bind(started_at)
    .bind(ended_at)
    .bind(now)
    .bind(id)
    .bind(mission.state.as_str())
    .execute(pool)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::InvalidStateTransition {
            from: mission.state,
            to,
        });
    }

    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))
}

pub async fn update_fields(
    pool: &SqlitePool,
    id: &str,
    worktree_path: Option<&str>,
    prd_path: Option<&str>,
    tasks_path: Option<&str>,
    failure_reason: Option<&str>,
    result: Option<&str>,
) -> StoreResult<Mission> {
    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))?;
    let now = Utc::now();

    sqlx::query(
        "UPDATE missions SET \
           worktree_path = COALESCE(?, worktree_path), \
           prd_path = COALESCE(?, prd_path), \
           tasks_path = COALESCE(?, tasks_path), \
           failure_reason = COALESCE(?, failure_reason), \
           result = COALESCE(?, result), \
           updated_at = ? \
         WHERE id = ?",
    )
    .bind(worktree_path)
    .bind(prd_path)
    .bind(tasks_path)
    .bind(failure_reason)
    .bind(result)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))
}

pub async fn increment_prd_iterations(pool: &SqlitePool, id: &str) -> StoreResult<Mission> {
    sqlx::query(
        "UPDATE missions SET prd_iterations = prd_iterations + 1, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))
}

pub async fn increment_tasks_iterations(pool: &SqlitePool, id: &str) -> StoreResult<Mission> {
    sqlx::query(
        "UPDATE missions SET tasks_iterations = tasks_iterations + 1, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))
}

pub async fn delete(pool: &SqlitePool, id: &str) -> StoreResult<()> {
    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("mission", id))?;
    sqlx::query("DELETE FROM missions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

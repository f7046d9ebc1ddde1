use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::ids;
use crate::models::{NewTask, Task, TaskRow, TaskStatus};

/// Insert a batch of tasks for a mission in one transaction, assigning
/// `order_num` from each entry's position in `tasks` (§4.1).
pub async fn create_many(
    pool: &SqlitePool,
    mission_id: &str,
    tasks: &[NewTask],
) -> StoreResult<Vec<Task>> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let mut ids = Vec::with_capacity(tasks.len());

    for (order_num, task) in tasks.iter().enumerate() {
        let id = self::ids::generate("tsk");
        let agents = serde_json::to_string(&task.agents).unwrap_or_else(|_| "[]".to_string());
        let skills = serde_json::to_string(&task.skills).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            "INSERT INTO tasks \
             (id, mission_id, name, description, order_num, status, agents, skills, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(mission_id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(order_num as i64)
        .bind(TaskStatus::Pending.as_str())
        .bind(agents)
        .bind(skills)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx_write)?;

        ids.push(id);
    }

    tx.commit().await?;

    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        out.push(
            find_by_id(pool, &id)
                .await?
                .ok_or_else(|| StoreError::not_found("task", &id))?,
        );
    }
    Ok(out)
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> StoreResult<Option<Task>> {
    let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Task::from))
}

/// All tasks for a mission, ordered `order_num ASC` (§4.1).
pub async fn find_by_mission(pool: &SqlitePool, mission_id: &str) -> StoreResult<Vec<Task>> {
    let rows: Vec<TaskRow> = sqlx::query_as(
        "SELECT * FROM tasks WHERE mission_id = ? ORDER BY order_num ASC",
    )
    .bind(mission_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Task::from).collect())
}

/// Validate and apply a task status transition, stamping `started_at` on
/// first entry into `IN_PROGRESS` and `completed_at` on first entry into a
/// terminal status (§3).
pub async fn update_status(
    pool: &SqlitePool,
    id: &str,
    to: TaskStatus,
) -> StoreResult<Task> {
    let task = find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("task", id))?;

    let now = Utc::now();
    let started_at = if to == TaskStatus::InProgress && task.started_at.is_none() {
        Some(now)
    } else {
        task.started_at
    };
    let completed_at = if to.is_terminal() && task.completed_at.is_none() {
        Some(now)
    } else {
        task.completed_at
    };

    sqlx::query(
        "UPDATE tasks SET status = ?, started_at = ?, completed_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(to.as_str())
    .bind(started_at)
    .bind(completed_at)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("task", id))
}

/// Delete every task belonging to a mission (used by `rejectTasks`, §4.6).
pub async fn delete_by_mission(pool: &SqlitePool, mission_id: &str) -> StoreResult<()> {
    sqlx::query("DELETE FROM tasks WHERE mission_id = ?")
        .bind(mission_id)
        .execute(pool)
        .await?;
    Ok(())
}

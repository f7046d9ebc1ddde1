use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{StoreError, StoreResult};
use crate::ids;
use crate::models::{Project, ProjectRow, ProjectWithMissionCount};

pub async fn create(pool: &SqlitePool, name: &str, path: &str) -> StoreResult<Project> {
    let id = ids::generate("prj");
    let now = Utc::now();

    sqlx::query(
        "INSERT INTO projects (id, name, path, is_active, config, created_at, updated_at) \
         VALUES (?, ?, ?, 1, '{}', ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(path)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .map_err(StoreError::from_sqlx_write)?;

    find_by_id(pool, &id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", &id))
}

pub async fn find_by_id(pool: &SqlitePool, id: &str) -> StoreResult<Option<Project>> {
    let row: Option<ProjectRow> = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Project::from))
}

pub async fn find_by_path(pool: &SqlitePool, path: &str) -> StoreResult<Option<Project>> {
    let row: Option<ProjectRow> = sqlx::query_as("SELECT * FROM projects WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(Project::from))
}

/// List all projects with a count of their missions, newest first.
pub async fn find_all(pool: &SqlitePool) -> StoreResult<Vec<ProjectWithMissionCount>> {
    let rows: Vec<ProjectRow> = sqlx::query_as("SELECT * FROM projects ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let project = Project::from(row);
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM missions WHERE project_id = ?")
            .bind(&project.id)
            .fetch_one(pool)
            .await?;
        out.push(ProjectWithMissionCount {
            project,
            mission_count: count.0,
        });
    }
    Ok(out)
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    name: Option<&str>,
    is_active: Option<bool>,
) -> StoreResult<Project> {
    let existing = find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", id))?;

    let name = name.unwrap_or(&existing.name);
    let is_active = is_active.unwrap_or(existing.is_active);
    let now = Utc::now();

    sqlx::query("UPDATE projects SET name = ?, is_active = ?, updated_at = ? WHERE id = ?")
        .bind(name)
        .bind(is_active as i64)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(StoreError::from_sqlx_write)?;

    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", id))
}

/// Delete a project. Refuses when any of its missions is in a
/// non-terminal state (§3 invariant).
pub async fn delete(pool: &SqlitePool, id: &str) -> StoreResult<()> {
    find_by_id(pool, id)
        .await?
        .ok_or_else(|| StoreError::not_found("project", id))?;

    let active: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM missions \
         WHERE project_id = ? \
           AND state NOT IN ('COMPLETED_SUCCESS', 'COMPLETED_FAILED')",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    if active.0 > 0 {
        return Err(StoreError::Precondition(format!(
            "project {id} has {} mission(s) in a non-terminal state",
            active.0
        )));
    }

    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gator_test_utils::create_test_db;

    #[tokio::test]
    async fn create_and_find() {
        let db = create_test_db().await;
        let p = create(&db.pool, "demo", "/tmp/demo").await.unwrap();
        assert_eq!(p.name, "demo");
        assert!(p.is_active);

        let found = find_by_id(&db.pool, &p.id).await.unwrap().unwrap();
        assert_eq!(found.id, p.id);

        let by_path = find_by_path(&db.pool, "/tmp/demo").await.unwrap().unwrap();
        assert_eq!(by_path.id, p.id);
    }

    #[tokio::test]
    async fn duplicate_path_conflicts() {
        let db = create_test_db().await;
        create(&db.pool, "demo", "/tmp/demo").await.unwrap();
        let err = create(&db.pool, "demo2", "/tmp/demo").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_refuses_with_active_missions() {
        let db = create_test_db().await;
        let p = create(&db.pool, "demo", "/tmp/demo").await.unwrap();
        crate::queries::missions::create(&db.pool, &p.id, "feature x", None)
            .await
            .unwrap();

        let err = delete(&db.pool, &p.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Precondition(_)));
    }

    #[tokio::test]
    async fn delete_succeeds_once_missions_terminal() {
        let db = create_test_db().await;
        let p = create(&db.pool, "demo", "/tmp/demo").await.unwrap();
        let m = crate::queries::missions::create(&db.pool, &p.id, "feature x", None)
            .await
            .unwrap();
        crate::queries::missions::update_state(
            &db.pool,
            &m.id,
            crate::models::MissionState::CompletedFailed,
            true,
        )
        .await
        .unwrap();

        delete(&db.pool, &p.id).await.unwrap();
        assert!(find_by_id(&db.pool, &p.id).await.unwrap().is_none());
    }
}

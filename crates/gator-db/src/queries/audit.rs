use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::StoreResult;
use crate::ids;
use crate::models::{AuditEntry, AuditEntryRow};

/// Append an entry to the audit log. `details` is stored as JSON text;
/// pass `None` for events with nothing worth recording beyond the event
/// name and entity reference (§4.1).
pub async fn log(
    pool: &SqlitePool,
    event: &str,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    details: Option<serde_json::Value>,
) -> StoreResult<AuditEntry> {
    let id = ids::generate("aud");
    let now = Utc::now();
    let details_json = details.as_ref().map(|d| d.to_string());

    sqlx::query(
        "INSERT INTO audit_entries (id, event, entity_type, entity_id, details, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(event)
    .bind(entity_type)
    .bind(entity_id)
    .bind(details_json)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(AuditEntry {
        id,
        event: event.to_string(),
        entity_type: entity_type.map(str::to_string),
        entity_id: entity_id.map(str::to_string),
        details,
        created_at: now,
    })
}

/// Most recent entries first, optionally scoped to one entity.
pub async fn list(
    pool: &SqlitePool,
    entity_type: Option<&str>,
    entity_id: Option<&str>,
    limit: i64,
) -> StoreResult<Vec<AuditEntry>> {
    let rows: Vec<AuditEntryRow> = match (entity_type, entity_id) {
        (Some(et), Some(eid)) => {
            sqlx::query_as(
                "SELECT * FROM audit_entries \
                 WHERE entity_type = ? AND entity_id = ? \
                 ORDER BY created_at DESC LIMIT ?",
            )
            .bind(et)
            .bind(eid)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        _ => {
            sqlx::query_as("SELECT * FROM audit_entries ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(pool)
                .await?
        }
    };
    Ok(rows.into_iter().map(AuditEntry::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gator_test_utils::create_test_db;

    #[tokio::test]
    async fn log_and_list_round_trip() {
        let db = create_test_db().await;
        log(
            &db.pool,
            "mission.created",
            Some("mission"),
            Some("mis-1"),
            Some(serde_json::json!({"feature_name": "demo"})),
        )
        .await
        .unwrap();
        log(&db.pool, "project.created", Some("project"), Some("prj-1"), None)
            .await
            .unwrap();

        let all = list(&db.pool, None, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event, "project.created");

        let scoped = list(&db.pool, Some("mission"), Some("mis-1"), 10)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(
            scoped[0].details.as_ref().unwrap()["feature_name"],
            "demo"
        );
    }

    #[tokio::test]
    async fn list_respects_limit() {
        let db = create_test_db().await;
        for i in 0..5 {
            log(&db.pool, &format!("event.{i}"), None, None, None)
                .await
                .unwrap();
        }
        let limited = list(&db.pool, None, None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}

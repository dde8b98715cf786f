//! Deletion and renaming

use tracing::info;

use super::{Database, EntityKind};
use crate::error::{TrafficError, TrafficResult};

/// Empty or whitespace names clear the custom name
fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(str::trim).filter(|n| !n.is_empty()).map(str::to_string)
}

impl Database {
    /// Remove a source with every entity, history row and archived request
    /// under it.
    ///
    /// Children are deleted explicitly so the result does not depend on the
    /// connection having foreign keys enabled.
    pub async fn delete_source(&self, source_id: i64) -> TrafficResult<()> {
        let mut tx = self.pool.begin().await?;

        for kind in [EntityKind::Port, EntityKind::Client] {
            let queries = kind.queries();
            sqlx::query(queries.delete_history_by_source)
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(queries.delete_entities_by_source)
                .bind(source_id)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM raw_requests WHERE source_id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            // Dropping the transaction rolls back
            return Err(TrafficError::NotFound(format!("service {}", source_id)));
        }

        tx.commit().await?;
        info!("Deleted service {} with all its traffic history", source_id);
        Ok(())
    }

    pub async fn rename_source(&self, source_id: i64, name: Option<&str>) -> TrafficResult<()> {
        let updated = sqlx::query("UPDATE sources SET custom_name = ? WHERE id = ?")
            .bind(normalize_name(name))
            .bind(source_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(TrafficError::NotFound(format!("service {}", source_id)));
        }
        Ok(())
    }

    pub async fn rename_entity(
        &self,
        source_id: i64,
        kind: EntityKind,
        key: &str,
        name: Option<&str>,
    ) -> TrafficResult<()> {
        if key.trim().is_empty() {
            let message = format!("{} key must not be empty", kind.as_str());
            return Err(TrafficError::Validation(message));
        }
        let updated = sqlx::query(kind.queries().rename)
            .bind(normalize_name(name))
            .bind(source_id)
            .bind(key)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            let what = format!("{} '{}' on service {}", kind.as_str(), key, source_id);
            return Err(TrafficError::NotFound(what));
        }
        Ok(())
    }
}

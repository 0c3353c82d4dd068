//! Postgres schema bootstrap.

use sqlx::PgPool;
use tracing::info;

/// Tables for the event store and every read model. Idempotent.
pub const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(INIT_SQL).execute(pool).await?;
    info!("database schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_guards_stream_versions() {
        assert!(INIT_SQL.contains("UNIQUE (aggregate_type, aggregate_id, aggregate_version)"));
        assert!(INIT_SQL.contains("published_at"));
    }

    #[test]
    fn every_read_model_table_is_tenant_scoped() {
        for table in [
            "appointments",
            "patients",
            "conversations",
            "conversation_counted_messages",
            "patient_journeys",
        ] {
            let start = INIT_SQL
                .find(&format!("CREATE TABLE IF NOT EXISTS {table} ("))
                .unwrap_or_else(|| panic!("missing table {table}"));
            let body = &INIT_SQL[start..];
            let end = body.find(");").unwrap();
            assert!(body[..end].contains("PRIMARY KEY (tenant_id,"), "{table} key is not tenant scoped");
        }
    }
}

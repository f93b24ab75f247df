use super::schema::Database;
use super::types::DatabaseError;

impl Database {
    // ========================================================================
    // Key-Value Operations
    // ========================================================================

    /// Get the value stored under `key`, or `None` if the key was never set.
    pub async fn get_value(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    /// Set a value (UPSERT), refreshing its timestamp.
    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove `key`. Returns whether anything was deleted.
    pub async fn delete_value(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::Database;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let db = test_db().await;
        assert_eq!(db.get_value("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let db = test_db().await;
        db.set_value("greeting", "hello").await.unwrap();
        assert_eq!(
            db.get_value("greeting").await.unwrap().as_deref(),
            Some("hello")
        );
    }

    #[tokio::test]
    async fn test_set_overwrites() {
        let db = test_db().await;
        db.set_value("k", "one").await.unwrap();
        db.set_value("k", "two").await.unwrap();
        assert_eq!(db.get_value("k").await.unwrap().as_deref(), Some("two"));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM kv_store")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }

    #[tokio::test]
    async fn test_delete_value() {
        let db = test_db().await;
        db.set_value("k", "v").await.unwrap();
        assert!(db.delete_value("k").await.unwrap());
        assert!(!db.delete_value("k").await.unwrap());
        assert_eq!(db.get_value("k").await.unwrap(), None);
    }
}

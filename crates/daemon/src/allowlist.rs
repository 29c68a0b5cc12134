// App Proxy - Allow-List Store
// Persisted set of application identifiers routed through the tunnel

use sqlx::{Pool, Sqlite};

use app_proxy_common::{Error, Result};

use crate::db::Database;

/// Durable set of application identifiers. Membership only: duplicates
/// collapse and there is no ordering beyond the sorted read.
#[derive(Clone)]
pub struct AllowListStore {
    pool: Pool<Sqlite>,
}

impl AllowListStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// All entries, sorted for deterministic output.
    pub async fn all(&self) -> Result<Vec<String>> {
        let apps = sqlx::query_scalar::<_, String>(
            "SELECT app_id FROM allowed_apps ORDER BY app_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(apps)
    }

    /// Replace the whole set in one transaction.
    pub async fn replace(&self, apps: &[String]) -> Result<()> {
        if apps.iter().any(|app| app.trim().is_empty()) {
            return Err(Error::InvalidInput(
                "application identifier must not be blank".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM allowed_apps")
            .execute(&mut *tx)
            .await?;
        for app in apps {
            sqlx::query("INSERT OR IGNORE INTO allowed_apps (app_id) VALUES (?)")
                .bind(app)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// App Proxy - Configuration Store
// CRUD + selection over proxy_configs, with the single-selection invariant

use std::sync::Arc;

use sqlx::{Pool, Sqlite};
use tokio::sync::{watch, Mutex};

use app_proxy_common::{Error, ProxyConfig, ProxyConfigDraft, Result};

use crate::db::Database;

/// Durable store of proxy configurations.
///
/// Invariant: at most one row has `selected = 1`, and once the table is
/// non-empty, exactly one does. Mutations are serialized per store instance
/// and run as single transactions, so readers never observe a state where
/// rows exist but none is selected.
#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
    change_tx: Arc<watch::Sender<u64>>,
}

impl ConfigStore {
    pub fn new(db: &Database) -> Self {
        let (change_tx, _) = watch::channel(0);
        Self {
            pool: db.pool().clone(),
            write_lock: Arc::new(Mutex::new(())),
            change_tx: Arc::new(change_tx),
        }
    }

    /// Subscribe to mutation notifications. The value is a version counter;
    /// consumers re-query on change rather than consuming a record stream.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    fn notify(&self) {
        self.change_tx.send_modify(|version| *version += 1);
    }

    fn validate(draft: &ProxyConfigDraft) -> Result<()> {
        if draft.name.trim().is_empty() {
            return Err(Error::InvalidInput("name must not be blank".to_string()));
        }
        Ok(())
    }

    /// Insert a new configuration and return its assigned id.
    ///
    /// The very first record ever inserted is marked selected; later inserts
    /// never touch the selection.
    pub async fn insert(&self, draft: &ProxyConfigDraft) -> Result<i64> {
        Self::validate(draft)?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let id = sqlx::query(
            "INSERT INTO proxy_configs (name, kind, user, pass, server, port, selected) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(&draft.name)
        .bind(draft.kind)
        .bind(&draft.user)
        .bind(&draft.pass)
        .bind(&draft.server)
        .bind(draft.port)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxy_configs")
            .fetch_one(&mut *tx)
            .await?;
        if count == 1 {
            sqlx::query("UPDATE proxy_configs SET selected = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        self.notify();
        Ok(id)
    }

    /// Replace the record with the given id. The selected flag is owned by
    /// the store and is not part of the payload.
    pub async fn update(&self, id: i64, draft: &ProxyConfigDraft) -> Result<()> {
        Self::validate(draft)?;

        let _guard = self.write_lock.lock().await;
        let rows = sqlx::query(
            "UPDATE proxy_configs SET name = ?, kind = ?, user = ?, pass = ?, server = ?, port = ? \
             WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(draft.kind)
        .bind(&draft.user)
        .bind(&draft.pass)
        .bind(&draft.server)
        .bind(draft.port)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(Error::NotFound(id));
        }
        self.notify();
        Ok(())
    }

    /// Delete the record with the given id. If it was selected and other
    /// records remain, the one with the smallest id takes over the selection
    /// within the same transaction.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let was_selected: Option<bool> =
            sqlx::query_scalar("SELECT selected FROM proxy_configs WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(was_selected) = was_selected else {
            return Err(Error::NotFound(id));
        };

        sqlx::query("DELETE FROM proxy_configs WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if was_selected {
            sqlx::query(
                "UPDATE proxy_configs SET selected = \
                 CASE WHEN id = (SELECT MIN(id) FROM proxy_configs) THEN 1 ELSE 0 END",
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.notify();
        Ok(())
    }

    /// Mark the record with the given id as selected and every other record
    /// as not selected, atomically. Idempotent.
    pub async fn select(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM proxy_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::NotFound(id));
        }

        sqlx::query(
            "UPDATE proxy_configs SET selected = CASE WHEN id = ? THEN 1 ELSE 0 END",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.notify();
        Ok(())
    }

    /// All configurations, ordered by name ascending.
    pub async fn list(&self) -> Result<Vec<ProxyConfig>> {
        let configs = sqlx::query_as::<_, ProxyConfig>(
            "SELECT id, name, kind, user, pass, server, port, selected \
             FROM proxy_configs ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(configs)
    }

    pub async fn get(&self, id: i64) -> Result<Option<ProxyConfig>> {
        let config = sqlx::query_as::<_, ProxyConfig>(
            "SELECT id, name, kind, user, pass, server, port, selected \
             FROM proxy_configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }

    /// The unique selected configuration, or None when the store is empty.
    pub async fn get_selected(&self) -> Result<Option<ProxyConfig>> {
        let config = sqlx::query_as::<_, ProxyConfig>(
            "SELECT id, name, kind, user, pass, server, port, selected \
             FROM proxy_configs WHERE selected = 1 LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_proxy_common::ProxyKind;

    async fn store() -> ConfigStore {
        let db = Database::open_in_memory().await.expect("in-memory db");
        ConfigStore::new(&db)
    }

    fn draft(name: &str) -> ProxyConfigDraft {
        ProxyConfigDraft {
            name: name.to_string(),
            kind: ProxyKind::Http,
            user: "u".to_string(),
            pass: "p".to_string(),
            server: "proxy.example.com".to_string(),
            port: 8080,
        }
    }

    async fn selected_count(store: &ConfigStore) -> usize {
        store
            .list()
            .await
            .unwrap()
            .iter()
            .filter(|c| c.selected)
            .count()
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let store = store().await;
        let err = store.insert(&draft("   ")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn first_insert_auto_selects() {
        let store = store().await;
        let id = store.insert(&draft("a")).await.unwrap();
        let config = store.get(id).await.unwrap().unwrap();
        assert!(config.selected);
    }

    #[tokio::test]
    async fn later_inserts_do_not_move_selection() {
        let store = store().await;
        let first = store.insert(&draft("a")).await.unwrap();
        let second = store.insert(&draft("b")).await.unwrap();

        assert!(store.get(first).await.unwrap().unwrap().selected);
        assert!(!store.get(second).await.unwrap().unwrap().selected);
        assert_eq!(selected_count(&store).await, 1);
    }

    #[tokio::test]
    async fn select_moves_the_flag_and_is_idempotent() {
        let store = store().await;
        let first = store.insert(&draft("a")).await.unwrap();
        let second = store.insert(&draft("b")).await.unwrap();

        store.select(second).await.unwrap();
        assert!(!store.get(first).await.unwrap().unwrap().selected);
        assert!(store.get(second).await.unwrap().unwrap().selected);

        store.select(second).await.unwrap();
        assert_eq!(selected_count(&store).await, 1);
        assert_eq!(store.get_selected().await.unwrap().unwrap().id, second);
    }

    #[tokio::test]
    async fn select_unknown_id_is_not_found() {
        let store = store().await;
        store.insert(&draft("a")).await.unwrap();
        let err = store.select(999).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(999)));
        assert_eq!(selected_count(&store).await, 1);
    }

    #[tokio::test]
    async fn update_replaces_fields_but_not_selection() {
        let store = store().await;
        let first = store.insert(&draft("a")).await.unwrap();
        let second = store.insert(&draft("b")).await.unwrap();

        let mut changed = draft("b2");
        changed.kind = ProxyKind::Socks5;
        changed.port = 1080;
        store.update(second, &changed).await.unwrap();

        let config = store.get(second).await.unwrap().unwrap();
        assert_eq!(config.name, "b2");
        assert_eq!(config.kind, ProxyKind::Socks5);
        assert_eq!(config.port, 1080);
        assert!(!config.selected);
        assert_eq!(store.get_selected().await.unwrap().unwrap().id, first);
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = store().await;
        let err = store.update(42, &draft("a")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(42)));
    }

    #[tokio::test]
    async fn delete_selected_reselects_smallest_remaining_id() {
        let store = store().await;
        let a = store.insert(&draft("a")).await.unwrap();
        let b = store.insert(&draft("b")).await.unwrap();
        let c = store.insert(&draft("c")).await.unwrap();
        assert!(a < b && b < c);

        store.delete(a).await.unwrap();
        let selected = store.get_selected().await.unwrap().unwrap();
        assert_eq!(selected.id, b);
        assert_eq!(selected_count(&store).await, 1);
    }

    #[tokio::test]
    async fn delete_unselected_leaves_selection_alone() {
        let store = store().await;
        let a = store.insert(&draft("a")).await.unwrap();
        let b = store.insert(&draft("b")).await.unwrap();

        store.delete(b).await.unwrap();
        assert_eq!(store.get_selected().await.unwrap().unwrap().id, a);
    }

    #[tokio::test]
    async fn delete_last_record_empties_the_store() {
        let store = store().await;
        let a = store.insert(&draft("a")).await.unwrap();
        store.delete(a).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get_selected().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_unknown_id_is_not_found() {
        let store = store().await;
        let err = store.delete(7).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(7)));
    }

    #[tokio::test]
    async fn single_selection_holds_across_mixed_operations() {
        let store = store().await;
        let a = store.insert(&draft("a")).await.unwrap();
        assert_eq!(selected_count(&store).await, 1);

        let b = store.insert(&draft("b")).await.unwrap();
        let c = store.insert(&draft("c")).await.unwrap();
        assert_eq!(selected_count(&store).await, 1);

        store.select(c).await.unwrap();
        assert_eq!(selected_count(&store).await, 1);

        store.delete(c).await.unwrap();
        assert_eq!(selected_count(&store).await, 1);
        assert_eq!(store.get_selected().await.unwrap().unwrap().id, a);

        store.delete(a).await.unwrap();
        assert_eq!(store.get_selected().await.unwrap().unwrap().id, b);

        store.delete(b).await.unwrap();
        assert_eq!(selected_count(&store).await, 0);
    }

    #[tokio::test]
    async fn list_is_ordered_by_name() {
        let store = store().await;
        store.insert(&draft("charlie")).await.unwrap();
        store.insert(&draft("alpha")).await.unwrap();
        store.insert(&draft("bravo")).await.unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, ["alpha", "bravo", "charlie"]);
    }

    #[tokio::test]
    async fn changes_fire_on_every_mutation() {
        let store = store().await;
        let mut rx = store.changes();
        let start = *rx.borrow_and_update();

        let id = store.insert(&draft("a")).await.unwrap();
        rx.changed().await.unwrap();
        store.select(id).await.unwrap();
        rx.changed().await.unwrap();
        store.delete(id).await.unwrap();
        rx.changed().await.unwrap();

        assert_eq!(*rx.borrow(), start + 3);
    }
}

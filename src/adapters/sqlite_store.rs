//! SQLite store. Writes are serialized by one in-process mutex and run in
//! `BEGIN IMMEDIATE` transactions; the commit hook runs after the statements
//! and before `COMMIT`, so a hook failure rolls the whole write back.

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::domain::entity::{Entity, EntityId, Status, WorkKind};
use crate::domain::error::QuantopsError;
use crate::domain::ownership::OwnerId;
use crate::ports::config_port::ConfigPort;
use crate::ports::store_port::{AtomicStore, CommitHook, InsertOutcome, ListFilter, WriteOp};

const COLUMNS: &str = "id, owner_id, kind, payload, idempotency_key, status, result, \
                       error_code, error_message, executor_name, dispatch_id, \
                       created_at, updated_at, started_at, finished_at, revision";

pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
    write_lock: Mutex<()>,
    hook: Option<Arc<dyn CommitHook>>,
}

fn pool_err(e: r2d2::Error) -> QuantopsError {
    QuantopsError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> QuantopsError {
    QuantopsError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_failure(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

fn parse_json(idx: usize, raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| conversion_failure(idx, e))
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let owner: String = row.get(1)?;
    let kind_raw: String = row.get(2)?;
    let payload_raw: String = row.get(3)?;
    let status_raw: String = row.get(5)?;
    let result_raw: Option<String> = row.get(6)?;
    let created_raw: String = row.get(11)?;
    let updated_raw: String = row.get(12)?;
    let started_raw: Option<String> = row.get(13)?;
    let finished_raw: Option<String> = row.get(14)?;

    let kind: WorkKind = kind_raw.parse().map_err(|e| conversion_failure(2, e))?;
    let status: Status = status_raw.parse().map_err(|e| conversion_failure(5, e))?;
    if !kind.lifecycle().declares(status) {
        return Err(conversion_failure(
            5,
            QuantopsError::invalid_input(format!("{kind} does not declare status {status}")),
        ));
    }

    Ok(Entity {
        id: EntityId::from(row.get::<_, String>(0)?),
        owner_id: OwnerId::new(owner).map_err(|e| conversion_failure(1, e))?,
        kind,
        payload: parse_json(3, &payload_raw)?,
        idempotency_key: row.get(4)?,
        status,
        result: result_raw.as_deref().map(|r| parse_json(6, r)).transpose()?,
        error_code: row.get(7)?,
        error_message: row.get(8)?,
        executor_name: row.get(9)?,
        dispatch_id: row.get(10)?,
        created_at: parse_timestamp(11, &created_raw)?,
        updated_at: parse_timestamp(12, &updated_raw)?,
        started_at: started_raw.as_deref().map(|r| parse_timestamp(13, r)).transpose()?,
        finished_at: finished_raw.as_deref().map(|r| parse_timestamp(14, r)).transpose()?,
        revision: row.get(15)?,
    })
}

fn fetch(conn: &Connection, id: &str) -> Result<Option<Entity>, QuantopsError> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM entities WHERE id = ?1"),
        params![id],
        row_to_entity,
    )
    .optional()
    .map_err(query_err)
}

impl SqliteStore {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, QuantopsError> {
        let db_path = config
            .get_string("store", "path")
            .ok_or_else(|| QuantopsError::ConfigMissing {
                section: "store".into(),
                key: "path".into(),
            })?;

        let pool_size = u32::try_from(config.get_int("store", "pool_size", 4))
            .ok()
            .filter(|size| *size >= 1)
            .ok_or_else(|| QuantopsError::ConfigInvalid {
                section: "store".into(),
                key: "pool_size".into(),
                reason: "must be between 1 and 4294967295".into(),
            })?;
        Self::open(db_path, pool_size)
    }

    pub fn open<P: AsRef<Path>>(path: P, pool_size: u32) -> Result<Self, QuantopsError> {
        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(Duration::from_secs(5)));
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        let store = Self::from_pool(pool);
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, QuantopsError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(pool_err)?;

        let store = Self::from_pool(pool);
        store.initialize_schema()?;
        Ok(store)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        SqliteStore {
            pool,
            write_lock: Mutex::new(()),
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn initialize_schema(&self) -> Result<(), QuantopsError> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                idempotency_key TEXT,
                status TEXT NOT NULL,
                result TEXT,
                error_code TEXT,
                error_message TEXT,
                executor_name TEXT,
                dispatch_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                revision INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(owner_id, created_at);
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                owner_id TEXT NOT NULL,
                key TEXT NOT NULL,
                entity_id TEXT NOT NULL UNIQUE REFERENCES entities(id),
                PRIMARY KEY (owner_id, key)
            );",
        )
        .map_err(query_err)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, QuantopsError> {
        self.pool.get().map_err(pool_err)
    }

    fn run_hook(&self, entity: &Entity, op: WriteOp) -> Result<(), QuantopsError> {
        match &self.hook {
            Some(hook) => hook.before_commit(entity, op),
            None => Ok(()),
        }
    }

    /// One writer at a time; an `Err` from `body` drops the transaction,
    /// which rolls it back.
    fn write_tx<T>(
        &self,
        body: impl FnOnce(&Connection) -> Result<T, QuantopsError>,
    ) -> Result<T, QuantopsError> {
        let _writer = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(query_err)?;
        let value = body(&*tx)?;
        tx.commit().map_err(query_err)?;
        Ok(value)
    }
}

impl AtomicStore for SqliteStore {
    fn save_if_absent(&self, entity: &Entity) -> Result<InsertOutcome, QuantopsError> {
        let payload = serde_json::to_string(&entity.payload)?;
        let result = entity.result.as_ref().map(serde_json::to_string).transpose()?;

        self.write_tx(|tx| {
            if let Some(key) = &entity.idempotency_key {
                let existing: Option<String> = tx
                    .query_row(
                        "SELECT entity_id FROM idempotency_keys WHERE owner_id = ?1 AND key = ?2",
                        params![entity.owner_id.as_str(), key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(query_err)?;
                if let Some(found) = existing.and_then(|id| fetch(tx, &id).transpose()) {
                    return Ok(InsertOutcome::Existing(found?));
                }
            }

            tx.execute(
                &format!(
                    "INSERT INTO entities ({COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    entity.id.as_str(),
                    entity.owner_id.as_str(),
                    entity.kind.as_str(),
                    payload,
                    entity.idempotency_key,
                    entity.status.as_str(),
                    result,
                    entity.error_code,
                    entity.error_message,
                    entity.executor_name,
                    entity.dispatch_id,
                    timestamp(&entity.created_at),
                    timestamp(&entity.updated_at),
                    entity.started_at.as_ref().map(timestamp),
                    entity.finished_at.as_ref().map(timestamp),
                    entity.revision,
                ],
            )
            .map_err(query_err)?;

            if let Some(key) = &entity.idempotency_key {
                tx.execute(
                    "INSERT INTO idempotency_keys (owner_id, key, entity_id) VALUES (?1, ?2, ?3)",
                    params![entity.owner_id.as_str(), key, entity.id.as_str()],
                )
                .map_err(query_err)?;
            }

            self.run_hook(entity, WriteOp::Insert)?;
            Ok(InsertOutcome::Inserted(entity.clone()))
        })
    }

    fn save(&self, entity: &Entity) -> Result<Entity, QuantopsError> {
        let payload = serde_json::to_string(&entity.payload)?;
        let result = entity.result.as_ref().map(serde_json::to_string).transpose()?;
        let committed = Entity {
            revision: entity.revision + 1,
            ..entity.clone()
        };

        self.write_tx(|tx| {
            let stored: Option<(String, String)> = tx
                .query_row(
                    "SELECT owner_id, status FROM entities WHERE id = ?1",
                    params![entity.id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(query_err)?;

            let Some((_, status_raw)) =
                stored.filter(|(owner, _)| owner == entity.owner_id.as_str())
            else {
                return Err(QuantopsError::NotFound {
                    id: entity.id.to_string(),
                });
            };

            let changed = tx
                .execute(
                    "UPDATE entities SET
                        payload = ?2, status = ?3, result = ?4, error_code = ?5,
                        error_message = ?6, executor_name = ?7, dispatch_id = ?8,
                        updated_at = ?9, started_at = ?10, finished_at = ?11,
                        revision = ?12
                     WHERE id = ?1 AND revision = ?13",
                    params![
                        entity.id.as_str(),
                        payload,
                        entity.status.as_str(),
                        result,
                        entity.error_code,
                        entity.error_message,
                        entity.executor_name,
                        entity.dispatch_id,
                        timestamp(&entity.updated_at),
                        entity.started_at.as_ref().map(timestamp),
                        entity.finished_at.as_ref().map(timestamp),
                        committed.revision,
                        entity.revision,
                    ],
                )
                .map_err(query_err)?;
            if changed != 1 {
                return Err(QuantopsError::InvalidTransition {
                    from: status_raw.parse()?,
                    to: entity.status,
                });
            }

            self.run_hook(&committed, WriteOp::Update)?;
            Ok(committed.clone())
        })
    }

    fn get(&self, id: &EntityId) -> Result<Option<Entity>, QuantopsError> {
        let conn = self.conn()?;
        fetch(&conn, id.as_str())
    }

    fn find_by_key(&self, owner: &OwnerId, key: &str) -> Result<Option<Entity>, QuantopsError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM entities
                 WHERE id = (SELECT entity_id FROM idempotency_keys WHERE owner_id = ?1 AND key = ?2)"
            ),
            params![owner.as_str(), key],
            row_to_entity,
        )
        .optional()
        .map_err(query_err)
    }

    fn list(
        &self,
        owner: Option<&OwnerId>,
        filter: &ListFilter,
    ) -> Result<Vec<Entity>, QuantopsError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM entities
                 WHERE (?1 IS NULL OR owner_id = ?1)
                   AND (?2 IS NULL OR kind = ?2)
                   AND (?3 IS NULL OR status = ?3)
                 ORDER BY created_at ASC, id ASC"
            ))
            .map_err(query_err)?;

        let rows = stmt
            .query_map(
                params![
                    owner.map(OwnerId::as_str),
                    filter.kind.map(WorkKind::as_str),
                    filter.status.map(Status::as_str),
                ],
                row_to_entity,
            )
            .map_err(query_err)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row.map_err(query_err)?);
        }
        Ok(entities)
    }

    fn delete(&self, id: &EntityId) -> Result<bool, QuantopsError> {
        self.write_tx(|tx| {
            let Some(entity) = fetch(tx, id.as_str())? else {
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM idempotency_keys WHERE entity_id = ?1",
                params![id.as_str()],
            )
            .map_err(query_err)?;
            tx.execute("DELETE FROM entities WHERE id = ?1", params![id.as_str()])
                .map_err(query_err)?;

            self.run_hook(&entity, WriteOp::Delete)?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fault_hook::FailOnNthWrite;
    use crate::adapters::file_config_adapter::FileConfigAdapter;
    use serde_json::json;

    struct EmptyConfig;

    impl ConfigPort for EmptyConfig {
        fn get_string(&self, _section: &str, _key: &str) -> Option<String> {
            None
        }
        fn get_int(&self, _section: &str, _key: &str, default: i64) -> i64 {
            default
        }
        fn get_bool(&self, _section: &str, _key: &str, default: bool) -> bool {
            default
        }
        fn keys(&self, _section: &str) -> Vec<String> {
            Vec::new()
        }
    }

    fn order(owner: &str, key: Option<&str>) -> Entity {
        Entity::new(
            OwnerId::new(owner).unwrap(),
            WorkKind::TradeOrder,
            json!({"symbol": "BHP", "qty": 100}),
            key.map(str::to_string),
            Utc::now(),
        )
    }

    #[test]
    fn from_config_missing_path() {
        match SqliteStore::from_config(&EmptyConfig) {
            Err(QuantopsError::ConfigMissing { section, key }) => {
                assert_eq!(section, "store");
                assert_eq!(key, "path");
            }
            Err(other) => panic!("expected ConfigMissing, got: {other}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn from_config_rejects_pool_size_outside_u32() {
        for raw in ["0", "-3", "4294967297"] {
            let config = FileConfigAdapter::from_string(&format!(
                "[store]\npath = /tmp/never-opened.db\npool_size = {raw}\n"
            ))
            .unwrap();
            assert!(
                matches!(
                    SqliteStore::from_config(&config),
                    Err(QuantopsError::ConfigInvalid { ref key, .. }) if key == "pool_size"
                ),
                "pool_size = {raw} should be refused"
            );
        }
    }

    #[test]
    fn in_memory_initialization() {
        let store = SqliteStore::in_memory().unwrap();
        store.initialize_schema().unwrap();
    }

    #[test]
    fn round_trips_every_field() {
        let store = SqliteStore::in_memory().unwrap();
        let mut e = order("u-1", Some("k1"));
        store.save_if_absent(&e).unwrap();

        e.status = Status::Submitted;
        e.executor_name = Some("local".into());
        e.dispatch_id = Some("d-1".into());
        e.started_at = Some(e.created_at + chrono::Duration::milliseconds(5));
        e.updated_at = e.created_at + chrono::Duration::milliseconds(5);
        let mut e = store.save(&e).unwrap();

        e.status = Status::Filled;
        e.result = Some(json!({"avg_price": 41.5}));
        e.finished_at = Some(e.created_at + chrono::Duration::milliseconds(9));
        e.updated_at = e.created_at + chrono::Duration::milliseconds(9);
        let e = store.save(&e).unwrap();
        assert_eq!(e.revision, 2);

        assert_eq!(store.get(&e.id).unwrap().unwrap(), e);
        assert_eq!(store.find_by_key(&e.owner_id, "k1").unwrap().unwrap(), e);
    }

    #[test]
    fn hook_failure_rolls_back_insert_and_index() {
        let store = SqliteStore::in_memory()
            .unwrap()
            .with_hook(Arc::new(FailOnNthWrite::new(1)));
        let e = order("u-1", Some("k1"));

        assert!(matches!(
            store.save_if_absent(&e),
            Err(QuantopsError::CommitRejected { .. })
        ));
        assert!(store.get(&e.id).unwrap().is_none());
        assert!(store.find_by_key(&e.owner_id, "k1").unwrap().is_none());

        assert!(matches!(
            store.save_if_absent(&e).unwrap(),
            InsertOutcome::Inserted(_)
        ));
    }

    #[test]
    fn stale_revision_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        let e = order("u-1", None);
        store.save_if_absent(&e).unwrap();

        let mut submitted = e.clone();
        submitted.status = Status::Submitted;
        store.save(&submitted).unwrap();

        let mut cancelled = e.clone();
        cancelled.status = Status::Cancelled;
        assert!(matches!(
            store.save(&cancelled),
            Err(QuantopsError::InvalidTransition { from: Status::Submitted, to: Status::Cancelled })
        ));
    }

    #[test]
    fn save_for_wrong_owner_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let e = order("u-1", None);
        store.save_if_absent(&e).unwrap();

        let mut hijack = e.clone();
        hijack.owner_id = OwnerId::new("u-2").unwrap();
        hijack.status = Status::Cancelled;
        assert!(matches!(
            store.save(&hijack),
            Err(QuantopsError::NotFound { .. })
        ));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quantops.db");
        let e = order("u-1", Some("k1"));

        {
            let store = SqliteStore::open(&path, 2).unwrap();
            store.save_if_absent(&e).unwrap();
        }

        let reopened = SqliteStore::open(&path, 2).unwrap();
        assert_eq!(reopened.get(&e.id).unwrap().unwrap(), e);
        let listed = reopened
            .list(Some(&e.owner_id), &ListFilter { kind: Some(WorkKind::TradeOrder), status: None })
            .unwrap();
        assert_eq!(listed, vec![e]);
    }
}

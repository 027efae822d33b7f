//! Durable local store for offline operation.
//!
//! Holds cached reference data (medicines, customers), the queue of sales
//! made while offline, and small metadata entries such as `lastSync`. Each
//! collection is a table in the local SQLite database; every operation runs
//! as a single statement on the blocking pool so async callers are never
//! stalled by disk I/O.
//!
//! When the database cannot be opened the store is still constructed, but in
//! an unavailable state where every call fails immediately with
//! [`StoreError::Unavailable`]. Callers treat the store as optional.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};

use crate::db;
use crate::sales::PendingSale;

pub const LAST_SYNC_KEY: &str = "lastSync";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("local storage is unavailable")]
    Unavailable,
    #[error("duplicate key {key} in {collection}")]
    DuplicateKey { collection: Collection, key: StoreKey },
    #[error("record for {collection} has no usable id")]
    MissingKey { collection: Collection },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store task failed: {0}")]
    Task(String),
}

/// Named collections of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Medicines,
    Customers,
    SalesQueue,
    Metadata,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Medicines => "medicines",
            Collection::Customers => "customers",
            Collection::SalesQueue => "offline_sales_queue",
            Collection::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Primary key of a stored record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum StoreKey {
    Int(i64),
    Text(String),
}

impl StoreKey {
    /// Key taken from a JSON value (`id` fields may be numbers or strings).
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(StoreKey::Int),
            Value::String(s) if !s.trim().is_empty() => Some(StoreKey::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoreKey::Int(i) => Some(*i),
            StoreKey::Text(_) => None,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::Int(i) => write!(f, "{i}"),
            StoreKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for StoreKey {
    fn from(v: i64) -> Self {
        StoreKey::Int(v)
    }
}

impl From<&str> for StoreKey {
    fn from(v: &str) -> Self {
        StoreKey::Text(v.to_string())
    }
}

impl From<String> for StoreKey {
    fn from(v: String) -> Self {
        StoreKey::Text(v)
    }
}

impl ToSql for StoreKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            StoreKey::Int(i) => Ok(ToSqlOutput::from(*i)),
            StoreKey::Text(s) => Ok(ToSqlOutput::from(s.as_str())),
        }
    }
}

impl FromSql for StoreKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Integer(i) => Ok(StoreKey::Int(i)),
            ValueRef::Text(t) => std::str::from_utf8(t)
                .map(|s| StoreKey::Text(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// Result of scanning the offline queue: unsynced entries in enqueue order,
/// plus the keys of rows that could not be decoded.
#[derive(Debug, Default)]
pub struct QueueScan {
    pub pending: Vec<PendingSale>,
    pub corrupt: Vec<StoreKey>,
}

/// Run `f` against a shared connection on the blocking pool.
pub(crate) async fn run_blocking<T, F>(conn: Arc<Mutex<Connection>>, f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    })
    .await
    .map_err(|e| StoreError::Task(e.to_string()))?
}

pub struct LocalStore {
    conn: Option<Arc<Mutex<Connection>>>,
}

impl LocalStore {
    /// Open the store backed by the database at `path`. Never fails: an
    /// initialization error yields an unavailable store.
    pub fn open(path: &Path) -> Self {
        match db::open(path) {
            Ok(conn) => {
                info!(path = %path.display(), "Local store ready");
                Self::from_connection(conn)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Local store unavailable");
                Self::unavailable()
            }
        }
    }

    pub fn open_in_memory() -> Self {
        match db::open_in_memory() {
            Ok(conn) => Self::from_connection(conn),
            Err(e) => {
                error!(error = %e, "In-memory store unavailable");
                Self::unavailable()
            }
        }
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Some(Arc::new(Mutex::new(conn))),
        }
    }

    pub fn unavailable() -> Self {
        Self { conn: None }
    }

    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone().ok_or(StoreError::Unavailable)?;
        run_blocking(conn, f).await
    }

    // -----------------------------------------------------------------------
    // Generic collection operations
    // -----------------------------------------------------------------------

    /// Insert or overwrite the record stored under `key`.
    pub async fn put(
        &self,
        collection: Collection,
        key: StoreKey,
        value: &Value,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO {} (item_key, value, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(item_key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at",
                collection.table()
            );
            conn.execute(&sql, params![key, raw])?;
            Ok(())
        })
        .await
    }

    /// Insert a new record. An existing record under the same key is never
    /// overwritten; the collision is reported as [`StoreError::DuplicateKey`].
    pub async fn add(
        &self,
        collection: Collection,
        key: StoreKey,
        value: &Value,
    ) -> Result<StoreKey, StoreError> {
        let raw = serde_json::to_string(value)?;
        self.with_conn(move |conn| {
            let sql = format!(
                "INSERT INTO {} (item_key, value) VALUES (?1, ?2)",
                collection.table()
            );
            match conn.execute(&sql, params![key, raw]) {
                Ok(_) => Ok(key),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::DuplicateKey { collection, key })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn get(
        &self,
        collection: Collection,
        key: StoreKey,
    ) -> Result<Option<Value>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT value FROM {} WHERE item_key = ?1", collection.table());
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&raw)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// All records of a collection in ascending key order. Rows whose value
    /// is not valid JSON come back as `Value::Null`.
    pub async fn get_all(
        &self,
        collection: Collection,
    ) -> Result<Vec<(StoreKey, Value)>, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT item_key, value FROM {} ORDER BY item_key ASC",
                collection.table()
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, StoreKey>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (key, raw) = row?;
                let value = serde_json::from_str(&raw).unwrap_or(Value::Null);
                out.push((key, value));
            }
            Ok(out)
        })
        .await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, collection: Collection, key: StoreKey) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM {} WHERE item_key = ?1", collection.table());
            Ok(conn.execute(&sql, params![key])? > 0)
        })
        .await
    }

    /// Remove every record of a collection; returns the number removed.
    pub async fn clear(&self, collection: Collection) -> Result<usize, StoreError> {
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM {}", collection.table());
            Ok(conn.execute(&sql, [])?)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reference data
    // -----------------------------------------------------------------------

    async fn save_record(&self, collection: Collection, record: &Value) -> Result<(), StoreError> {
        let key = record
            .get("id")
            .and_then(StoreKey::from_json)
            .ok_or(StoreError::MissingKey { collection })?;
        self.put(collection, key, record).await
    }

    fn values(rows: Vec<(StoreKey, Value)>) -> Vec<Value> {
        rows.into_iter()
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
            .collect()
    }

    /// Cache a medicine record, keyed by its `id` field.
    pub async fn save_medicine(&self, medicine: &Value) -> Result<(), StoreError> {
        self.save_record(Collection::Medicines, medicine).await
    }

    pub async fn medicines(&self) -> Result<Vec<Value>, StoreError> {
        Ok(Self::values(self.get_all(Collection::Medicines).await?))
    }

    pub async fn medicine(&self, id: impl Into<StoreKey>) -> Result<Option<Value>, StoreError> {
        self.get(Collection::Medicines, id.into()).await
    }

    pub async fn save_customer(&self, customer: &Value) -> Result<(), StoreError> {
        self.save_record(Collection::Customers, customer).await
    }

    pub async fn customers(&self) -> Result<Vec<Value>, StoreError> {
        Ok(Self::values(self.get_all(Collection::Customers).await?))
    }

    // -----------------------------------------------------------------------
    // Offline sales queue
    // -----------------------------------------------------------------------

    /// Append a sale to the queue under its `queued_at` key.
    pub async fn queue_sale(&self, sale: &PendingSale) -> Result<i64, StoreError> {
        let value = serde_json::to_value(sale)?;
        self.add(Collection::SalesQueue, StoreKey::Int(sale.queued_at), &value)
            .await?;
        debug!(queued_at = sale.queued_at, "Sale queued locally");
        Ok(sale.queued_at)
    }

    /// Unsynced queue entries, oldest first.
    ///
    /// An entry counts as unsynced unless its `synced` flag is `true`.
    /// Entries that cannot be decoded into a [`PendingSale`] are reported in
    /// [`QueueScan::corrupt`] instead of failing the scan.
    pub async fn queued_sales(&self) -> Result<QueueScan, StoreError> {
        let rows = self.get_all(Collection::SalesQueue).await?;
        let mut scan = QueueScan::default();
        for (key, value) in rows {
            if value.get("synced").and_then(Value::as_bool) == Some(true) {
                continue;
            }
            let queued_at = match key.as_int() {
                Some(k) => k,
                None => {
                    scan.corrupt.push(key);
                    continue;
                }
            };
            match serde_json::from_value::<PendingSale>(value) {
                Ok(mut sale) => {
                    // The row key is the identity; the embedded copy is informational.
                    sale.queued_at = queued_at;
                    scan.pending.push(sale);
                }
                Err(_) => scan.corrupt.push(key),
            }
        }
        Ok(scan)
    }

    /// Flip `synced` to true for one entry. Returns `false` when no entry
    /// exists under `queued_at`.
    pub async fn mark_sale_synced(&self, queued_at: i64) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE offline_sales_queue
                 SET value = json_set(value, '$.synced', json('true')),
                     updated_at = datetime('now')
                 WHERE item_key = ?1",
                params![queued_at],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn clear_sales_queue(&self) -> Result<usize, StoreError> {
        self.clear(Collection::SalesQueue).await
    }

    /// Number of queue entries not yet synced.
    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.queued_sales().await?.pending.len())
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub async fn set_metadata(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let entry = serde_json::json!({ "key": key, "value": value });
        self.put(Collection::Metadata, StoreKey::from(key), &entry)
            .await
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .get(Collection::Metadata, StoreKey::from(key))
            .await?
            .and_then(|entry| entry.get("value").cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sales::SalePayload;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let store = LocalStore::open_in_memory();
        store
            .put(Collection::Medicines, StoreKey::Int(1), &json!({ "id": 1, "name": "Aspirin" }))
            .await
            .unwrap();
        store
            .put(Collection::Medicines, StoreKey::Int(1), &json!({ "id": 1, "name": "Aspirin 500" }))
            .await
            .unwrap();

        let got = store.get(Collection::Medicines, StoreKey::Int(1)).await.unwrap();
        assert_eq!(got.unwrap()["name"], "Aspirin 500");

        assert!(store.delete(Collection::Medicines, StoreKey::Int(1)).await.unwrap());
        assert!(!store.delete(Collection::Medicines, StoreKey::Int(1)).await.unwrap());
        assert!(store
            .get(Collection::Medicines, StoreKey::Int(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_collections_are_independent() {
        let store = LocalStore::open_in_memory();
        store
            .save_medicine(&json!({ "id": 5, "name": "Ibuprofen" }))
            .await
            .unwrap();
        store
            .save_customer(&json!({ "id": 5, "name": "Jane" }))
            .await
            .unwrap();

        assert_eq!(store.clear(Collection::Customers).await.unwrap(), 1);
        assert_eq!(store.medicines().await.unwrap().len(), 1);
        assert!(store.customers().await.unwrap().is_empty());
        assert_eq!(
            store.medicine(5_i64).await.unwrap().unwrap()["name"],
            "Ibuprofen"
        );
    }

    #[tokio::test]
    async fn test_save_record_requires_id() {
        let store = LocalStore::open_in_memory();
        let err = store
            .save_medicine(&json!({ "name": "no id" }))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingKey { .. }));
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_key() {
        let store = LocalStore::open_in_memory();
        let sale = PendingSale::new(SalePayload::new("M1", 2), 1000);
        store.queue_sale(&sale).await.unwrap();

        let dup = PendingSale::new(SalePayload::new("M2", 9), 1000);
        let err = store.queue_sale(&dup).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        // Original entry untouched
        let scan = store.queued_sales().await.unwrap();
        assert_eq!(scan.pending.len(), 1);
        assert_eq!(scan.pending[0].sale.medicine_id, "M1".into());
    }

    #[tokio::test]
    async fn test_queue_order_and_mark_synced() {
        let store = LocalStore::open_in_memory();
        for (ts, med) in [(3000, "C"), (1000, "A"), (2000, "B")] {
            store
                .queue_sale(&PendingSale::new(SalePayload::new(med, 1), ts))
                .await
                .unwrap();
        }

        let scan = store.queued_sales().await.unwrap();
        let order: Vec<i64> = scan.pending.iter().map(|s| s.queued_at).collect();
        assert_eq!(order, vec![1000, 2000, 3000]);
        assert!(scan.pending.iter().all(|s| !s.synced));

        assert!(store.mark_sale_synced(2000).await.unwrap());
        assert!(!store.mark_sale_synced(4242).await.unwrap());

        let raw = store
            .get(Collection::SalesQueue, StoreKey::Int(2000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw["synced"], json!(true));
        assert_eq!(raw["medicine_id"], json!("B"));
        assert_eq!(store.pending_count().await.unwrap(), 2);

        assert_eq!(store.clear_sales_queue().await.unwrap(), 3);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_scan_reports_corrupt_rows() {
        let store = LocalStore::open_in_memory();
        store
            .queue_sale(&PendingSale::new(SalePayload::new(1, 1), 10))
            .await
            .unwrap();
        store
            .put(Collection::SalesQueue, StoreKey::Int(20), &json!({ "quantity": 3 }))
            .await
            .unwrap();
        store
            .put(
                Collection::SalesQueue,
                "bogus".into(),
                &json!({ "medicine_id": 1, "quantity": 1 }),
            )
            .await
            .unwrap();

        let scan = store.queued_sales().await.unwrap();
        assert_eq!(scan.pending.len(), 1);
        assert_eq!(scan.corrupt, vec![StoreKey::Int(20), StoreKey::from("bogus")]);
    }

    #[tokio::test]
    async fn test_metadata_overwrites() {
        let store = LocalStore::open_in_memory();
        assert!(store.get_metadata(LAST_SYNC_KEY).await.unwrap().is_none());
        store
            .set_metadata(LAST_SYNC_KEY, json!("2026-10-19T10:00:00.000Z"))
            .await
            .unwrap();
        store
            .set_metadata(LAST_SYNC_KEY, json!("2026-10-19T11:00:00.000Z"))
            .await
            .unwrap();
        assert_eq!(
            store.get_metadata(LAST_SYNC_KEY).await.unwrap(),
            Some(json!("2026-10-19T11:00:00.000Z"))
        );
        assert_eq!(store.get_all(Collection::Metadata).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_fast() {
        let store = LocalStore::unavailable();
        assert!(!store.is_available());
        assert!(matches!(
            store.medicines().await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.mark_sale_synced(1).await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.set_metadata("k", json!(1)).await,
            Err(StoreError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_open_unwritable_path_yields_unavailable_store() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let store = LocalStore::open(dir.path());
        assert!(!store.is_available());
    }

    #[tokio::test]
    async fn test_on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pharmacy.db");
        {
            let store = LocalStore::open(&path);
            store
                .queue_sale(&PendingSale::new(SalePayload::new("M1", 2), 42))
                .await
                .unwrap();
        }
        let store = LocalStore::open(&path);
        let scan = store.queued_sales().await.unwrap();
        assert_eq!(scan.pending.len(), 1);
        assert_eq!(scan.pending[0].queued_at, 42);
    }
}

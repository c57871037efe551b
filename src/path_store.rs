//! Path Store: CRUD over path metadata rows.
//!
//! Every method takes the connection to run on, so callers decide whether a
//! call joins an open transaction or runs on its own pooled connection.
//! Rows whose expiry has passed are invisible to the lookups that mirror the
//! public surface (`exists`, `find`, `get`, `list_by_prefix`); `find_any`
//! sees them so writers can replace them.

use crate::backend::BackendType;
use crate::error::{FsError, Result};
use crate::schema::{PathType, Visibility, child_prefix};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::any::{Any, AnyRow};
use sqlx::decode::Decode;
use sqlx::{AnyConnection, Row, Type, TypeInfo, ValueRef};

const COLUMNS: &str = "path_id, type, path, mimetype, visibility, size, is_compressed, update_ts, expiry, meta";

/// Escape character for LIKE patterns; portable across backends, unlike `\`
const LIKE_ESCAPE: char = '!';

/// One filesystem entry's metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathRecord {
    pub path_id: i64,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: PathType,
    pub mimetype: Option<String>,
    pub visibility: Visibility,
    pub size: u64,
    pub is_compressed: bool,
    pub timestamp: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub meta: Option<serde_json::Value>,
}

impl PathRecord {
    pub fn is_file(&self) -> bool {
        self.kind == PathType::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == PathType::Dir
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry <= now)
    }
}

/// Column values for a new row
#[derive(Debug, Clone)]
pub struct NewPath {
    pub path: String,
    pub kind: PathType,
    pub mimetype: Option<String>,
    pub visibility: Visibility,
    pub size: u64,
    pub is_compressed: bool,
    pub timestamp: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub meta: Option<serde_json::Value>,
}

/// Column values rewritten when a file's content changes
#[derive(Debug, Clone)]
pub struct PathUpdate {
    pub size: u64,
    pub mimetype: Option<String>,
    pub is_compressed: bool,
    pub timestamp: DateTime<Utc>,
    pub visibility: Visibility,
    pub expiry: Option<DateTime<Utc>>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct PathStore {
    table: String,
    backend: BackendType,
}

impl PathStore {
    pub(crate) fn new(table: impl Into<String>, backend: BackendType) -> Self {
        Self {
            table: table.into(),
            backend,
        }
    }

    pub async fn exists(&self, conn: &mut AnyConnection, path: &str) -> Result<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE path = ? AND (expiry IS NULL OR expiry > ?)",
            self.table
        );
        let row = sqlx::query(&self.backend.sql(&sql))
            .bind(path)
            .bind(now_ts())
            .fetch_optional(conn)
            .await?;
        Ok(row.is_some())
    }

    /// Live entry at `path`, or `None`
    pub async fn find(&self, conn: &mut AnyConnection, path: &str) -> Result<Option<PathRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE path = ? AND (expiry IS NULL OR expiry > ?)",
            self.table
        );
        let row = sqlx::query(&self.backend.sql(&sql))
            .bind(path)
            .bind(now_ts())
            .fetch_optional(conn)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Entry at `path` whether or not it has expired
    pub async fn find_any(&self, conn: &mut AnyConnection, path: &str) -> Result<Option<PathRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM {} WHERE path = ?", self.table);
        let row = sqlx::query(&self.backend.sql(&sql))
            .bind(path)
            .fetch_optional(conn)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get(&self, conn: &mut AnyConnection, path: &str) -> Result<PathRecord> {
        self.find(conn, path)
            .await?
            .ok_or_else(|| FsError::not_found(path))
    }

    pub async fn create(&self, conn: &mut AnyConnection, new: NewPath) -> Result<PathRecord> {
        if self.find_any(&mut *conn, &new.path).await?.is_some() {
            return Err(FsError::already_exists(&new.path));
        }

        let meta = new.meta.as_ref().map(serde_json::to_string).transpose()?;
        let mut sql = format!(
            "INSERT INTO {} (type, path, mimetype, visibility, size, is_compressed, update_ts, expiry, meta) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        if self.backend.returns_inserted_id() {
            sql.push_str(" RETURNING path_id");
        }
        let sql = self.backend.sql(&sql);
        let query = sqlx::query(&sql)
            .bind(new.kind.as_str())
            .bind(new.path.as_str())
            .bind(new.mimetype.clone())
            .bind(new.visibility.as_str())
            .bind(new.size as i64)
            .bind(new.is_compressed as i64)
            .bind(new.timestamp.timestamp())
            .bind(new.expiry.map(|e| e.timestamp()))
            .bind(meta);

        let path_id = if self.backend.returns_inserted_id() {
            let row = query.fetch_one(conn).await?;
            row.try_get::<i64, _>("path_id")?
        } else {
            query
                .execute(conn)
                .await?
                .last_insert_id()
                .ok_or_else(|| FsError::Connection("driver did not report inserted path_id".to_string()))?
        };

        Ok(PathRecord {
            path_id,
            path: new.path,
            kind: new.kind,
            mimetype: new.mimetype,
            visibility: new.visibility,
            size: new.size,
            is_compressed: new.is_compressed,
            timestamp: truncate_to_seconds(new.timestamp),
            expiry: new.expiry.map(truncate_to_seconds),
            meta: new.meta,
        })
    }

    pub async fn update(&self, conn: &mut AnyConnection, path: &str, update: &PathUpdate) -> Result<()> {
        let meta = update.meta.as_ref().map(serde_json::to_string).transpose()?;
        let sql = format!(
            "UPDATE {} SET size = ?, mimetype = ?, is_compressed = ?, update_ts = ?, visibility = ?, expiry = ?, meta = ? \
             WHERE path = ?",
            self.table
        );
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(update.size as i64)
            .bind(update.mimetype.clone())
            .bind(update.is_compressed as i64)
            .bind(update.timestamp.timestamp())
            .bind(update.visibility.as_str())
            .bind(update.expiry.map(|e| e.timestamp()))
            .bind(meta)
            .bind(path)
            .execute(conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(FsError::not_found(path));
        }
        Ok(())
    }

    pub async fn set_visibility(
        &self,
        conn: &mut AnyConnection,
        path: &str,
        visibility: Visibility,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET visibility = ? WHERE path = ? AND (expiry IS NULL OR expiry > ?)",
            self.table
        );
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(visibility.as_str())
            .bind(path)
            .bind(now_ts())
            .execute(conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(FsError::not_found(path));
        }
        Ok(())
    }

    /// Move one row to a new path
    pub async fn rename(&self, conn: &mut AnyConnection, old_path: &str, new_path: &str) -> Result<()> {
        let record = self.get(&mut *conn, old_path).await?;
        if self.find_any(&mut *conn, new_path).await?.is_some() {
            return Err(FsError::already_exists(new_path));
        }
        self.move_row(conn, record.path_id, new_path).await
    }

    pub(crate) async fn move_row(&self, conn: &mut AnyConnection, path_id: i64, new_path: &str) -> Result<()> {
        let sql = format!("UPDATE {} SET path = ? WHERE path_id = ?", self.table);
        sqlx::query(&self.backend.sql(&sql))
            .bind(new_path)
            .bind(path_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Remove the row at `path`; returns whether a row was removed
    pub async fn delete(&self, conn: &mut AnyConnection, path: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE path = ?", self.table);
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(path)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(crate) async fn delete_by_id(&self, conn: &mut AnyConnection, path_id: i64) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE path_id = ?", self.table);
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(path_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live entries below `dir`, ordered by path.
    ///
    /// With `recursive` false only direct children are returned. The
    /// directory's own row is never included.
    pub async fn list_by_prefix(
        &self,
        conn: &mut AnyConnection,
        dir: &str,
        recursive: bool,
    ) -> Result<Vec<PathRecord>> {
        let now = Utc::now();
        let records = self.descendants(conn, dir).await?;
        let prefix = child_prefix(dir);
        Ok(records
            .into_iter()
            .filter(|r| !r.is_expired_at(now))
            .filter(|r| recursive || !r.path[prefix.len()..].contains('/'))
            .collect())
    }

    /// Every row below `dir` at any depth, expired ones included
    pub(crate) async fn descendants(&self, conn: &mut AnyConnection, dir: &str) -> Result<Vec<PathRecord>> {
        let prefix = child_prefix(dir);
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE path LIKE ? ESCAPE '{LIKE_ESCAPE}' ORDER BY path",
            self.table
        );
        let rows = sqlx::query(&self.backend.sql(&sql))
            .bind(like_prefix(&prefix))
            .fetch_all(conn)
            .await?;

        // LIKE is case-insensitive on some backends; keep exact prefix matches only
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = record_from_row(row)?;
            if record.path.len() > prefix.len() && record.path.starts_with(&prefix) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub(crate) async fn list_expired(&self, conn: &mut AnyConnection) -> Result<Vec<PathRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE expiry IS NOT NULL AND expiry <= ? ORDER BY path",
            self.table
        );
        let rows = sqlx::query(&self.backend.sql(&sql))
            .bind(now_ts())
            .fetch_all(conn)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub(crate) fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

fn from_ts(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| FsError::Config(format!("timestamp out of range: {secs}")))
}

/// LIKE pattern matching everything that starts with `prefix`
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars() {
        if c == LIKE_ESCAPE || c == '%' || c == '_' {
            pattern.push(LIKE_ESCAPE);
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn record_from_row(row: &AnyRow) -> Result<PathRecord> {
    let kind: String = row.try_get("type")?;
    let visibility: String = row.try_get("visibility")?;
    let size: i64 = row.try_get("size")?;
    let is_compressed: i64 = row.try_get("is_compressed")?;
    let update_ts: i64 = row.try_get("update_ts")?;
    let expiry: Option<i64> = nullable(row, "expiry")?;
    let meta: Option<String> = nullable(row, "meta")?;

    Ok(PathRecord {
        path_id: row.try_get("path_id")?,
        path: row.try_get("path")?,
        kind: kind.parse()?,
        mimetype: nullable(row, "mimetype")?,
        visibility: visibility.parse()?,
        size: size.max(0) as u64,
        is_compressed: is_compressed != 0,
        timestamp: from_ts(update_ts)?,
        expiry: expiry.map(from_ts).transpose()?,
        meta: meta.as_deref().map(serde_json::from_str).transpose()?,
    })
}

/// Decode a column that may be NULL.
///
/// `Option<T>` cannot be decoded through the `any` driver, whose values never
/// report themselves as null; the raw value's type name does.
fn nullable<'r, T>(row: &'r AnyRow, column: &str) -> Result<Option<T>>
where
    T: Decode<'r, Any> + Type<Any>,
{
    let raw = row.try_get_raw(column)?;
    if raw.type_info().name() == "NULL" {
        return Ok(None);
    }
    Ok(Some(row.try_get(column)?))
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::backend::{SqlBackend, SqlBackendConfig};
    use crate::schema::Tables;
    use chrono::Duration;

    async fn setup() -> (SqlBackend, PathStore) {
        let backend = SqlBackend::connect(SqlBackendConfig::Sqlite(":memory:".into()))
            .await
            .unwrap();
        let tables = Tables::with_prefix("t").unwrap();
        backend.migrate(&tables).await.unwrap();
        let store = PathStore::new(tables.path, backend.backend_type());
        (backend, store)
    }

    fn new_path(path: &str, kind: PathType) -> NewPath {
        NewPath {
            path: path.to_string(),
            kind,
            mimetype: None,
            visibility: Visibility::Public,
            size: 0,
            is_compressed: false,
            timestamp: Utc::now(),
            expiry: None,
            meta: None,
        }
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("/a_b/"), "/a!_b/%");
        assert_eq!(like_prefix("/100%!/"), "/100!%!!/%");
    }

    #[tokio::test]
    async fn test_create_get_exists() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();

        let mut new = new_path("/docs/a.txt", PathType::File);
        new.meta = Some(serde_json::json!({"owner": "ops"}));
        let created = store.create(&mut conn, new).await.unwrap();
        assert!(created.path_id > 0);

        assert!(store.exists(&mut conn, "/docs/a.txt").await.unwrap());
        assert!(!store.exists(&mut conn, "/docs/b.txt").await.unwrap());

        let fetched = store.get(&mut conn, "/docs/a.txt").await.unwrap();
        assert_eq!(fetched, created);

        assert!(matches!(
            store.get(&mut conn, "/missing").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            store.create(&mut conn, new_path("/docs/a.txt", PathType::File)).await,
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_update_and_visibility() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();
        store.create(&mut conn, new_path("/f.bin", PathType::File)).await.unwrap();

        let update = PathUpdate {
            size: 42,
            mimetype: Some("application/octet-stream".to_string()),
            is_compressed: true,
            timestamp: Utc::now(),
            visibility: Visibility::Public,
            expiry: None,
            meta: None,
        };
        store.update(&mut conn, "/f.bin", &update).await.unwrap();
        store.set_visibility(&mut conn, "/f.bin", Visibility::Private).await.unwrap();

        let record = store.get(&mut conn, "/f.bin").await.unwrap();
        assert_eq!(record.size, 42);
        assert!(record.is_compressed);
        assert_eq!(record.visibility, Visibility::Private);

        assert!(store.update(&mut conn, "/nope", &update).await.unwrap_err().is_not_found());
        assert!(store
            .set_visibility(&mut conn, "/nope", Visibility::Public)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_rename_and_delete() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();
        let created = store.create(&mut conn, new_path("/old", PathType::File)).await.unwrap();
        store.create(&mut conn, new_path("/taken", PathType::File)).await.unwrap();

        assert!(matches!(
            store.rename(&mut conn, "/old", "/taken").await,
            Err(FsError::AlreadyExists(_))
        ));
        assert!(store.rename(&mut conn, "/ghost", "/new").await.unwrap_err().is_not_found());

        store.rename(&mut conn, "/old", "/new").await.unwrap();
        let moved = store.get(&mut conn, "/new").await.unwrap();
        assert_eq!(moved.path_id, created.path_id);
        assert!(!store.exists(&mut conn, "/old").await.unwrap());

        assert!(store.delete(&mut conn, "/new").await.unwrap());
        assert!(!store.delete(&mut conn, "/new").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();
        for (path, kind) in [
            ("/test", PathType::Dir),
            ("/test/sub1", PathType::Dir),
            ("/test/sub1/deep.txt", PathType::File),
            ("/test/file1.txt", PathType::File),
            ("/testing/other.txt", PathType::File),
            ("/Test/upper.txt", PathType::File),
            ("/not/this", PathType::Dir),
        ] {
            store.create(&mut conn, new_path(path, kind)).await.unwrap();
        }

        let all: Vec<String> = store
            .list_by_prefix(&mut conn, "/test", true)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(all, vec!["/test/file1.txt", "/test/sub1", "/test/sub1/deep.txt"]);

        let direct: Vec<String> = store
            .list_by_prefix(&mut conn, "/test", false)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(direct, vec!["/test/file1.txt", "/test/sub1"]);

        let root = store.list_by_prefix(&mut conn, "/", false).await.unwrap();
        let names: Vec<&str> = root.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(names, vec!["/test"]);
    }

    #[tokio::test]
    async fn test_expired_rows_are_hidden() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();

        let mut stale = new_path("/dir/stale.txt", PathType::File);
        stale.expiry = Some(Utc::now() - Duration::hours(1));
        store.create(&mut conn, stale).await.unwrap();

        let mut fresh = new_path("/dir/fresh.txt", PathType::File);
        fresh.expiry = Some(Utc::now() + Duration::hours(1));
        store.create(&mut conn, fresh).await.unwrap();

        assert!(!store.exists(&mut conn, "/dir/stale.txt").await.unwrap());
        assert!(store.find(&mut conn, "/dir/stale.txt").await.unwrap().is_none());
        assert!(store.find_any(&mut conn, "/dir/stale.txt").await.unwrap().is_some());
        assert!(store.exists(&mut conn, "/dir/fresh.txt").await.unwrap());

        let listed = store.list_by_prefix(&mut conn, "/dir", true).await.unwrap();
        assert_eq!(listed.len(), 1);

        let expired = store.list_expired(&mut conn).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].path, "/dir/stale.txt");
    }

    #[tokio::test]
    async fn test_null_columns_decode_as_none() {
        let (backend, store) = setup().await;
        let mut conn = backend.pool().acquire().await.unwrap();

        sqlx::query(
            "INSERT INTO t_path (type, path, mimetype, visibility, size, is_compressed, update_ts, expiry, meta) \
             VALUES ('file', '/bare.txt', NULL, 'public', 0, 0, 1700000000, NULL, NULL)",
        )
        .execute(&mut *conn)
        .await
        .unwrap();

        let record = store.get(&mut conn, "/bare.txt").await.unwrap();
        assert_eq!(record.mimetype, None);
        assert_eq!(record.expiry, None);
        assert_eq!(record.meta, None);
        assert_eq!(record.timestamp.timestamp(), 1_700_000_000);

        // Rows written through the store with every optional column unset
        let created = store.create(&mut conn, new_path("/plain", PathType::Dir)).await.unwrap();
        assert_eq!(store.get(&mut conn, "/plain").await.unwrap(), created);
        assert_eq!(created.mimetype, None);
    }
}

//! Directory Engine: operations spanning several path rows.
//!
//! Directories are rows of type `dir`; membership is purely a matter of path
//! prefix, so ancestors are never created or checked. Every operation that
//! touches more than one row runs in a single transaction and rolls back on
//! any error.

use crate::backend::SqlBackend;
use crate::chunk_store::ChunkStore;
use crate::config::{FsConfig, ResolvedWrite, WriteConfig};
use crate::error::{FsError, Result};
use crate::path_store::{NewPath, PathRecord, PathStore};
use crate::schema::{PathType, Tables, child_prefix};
use chrono::Utc;
use sqlx::{AnyConnection, AnyPool};
use tracing::debug;

/// Remove a path row together with its chunks
pub(crate) async fn discard(
    paths: &PathStore,
    chunks: &ChunkStore,
    conn: &mut AnyConnection,
    path_id: i64,
) -> Result<()> {
    chunks.delete_chunks(&mut *conn, path_id).await?;
    paths.delete_by_id(conn, path_id).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DirectoryEngine {
    pool: AnyPool,
    paths: PathStore,
    chunks: ChunkStore,
    config: FsConfig,
}

impl DirectoryEngine {
    pub(crate) fn new(backend: &SqlBackend, tables: &Tables, config: FsConfig) -> Self {
        Self {
            pool: backend.pool().clone(),
            paths: PathStore::new(tables.path.clone(), backend.backend_type()),
            chunks: ChunkStore::new(tables.chunk.clone(), backend.backend_type()),
            config,
        }
    }

    pub async fn create_dir(&self, path: &str, call: &WriteConfig) -> Result<PathRecord> {
        let settings = ResolvedWrite::resolve(&self.config, call)?;
        let mut tx = self.pool.begin().await?;

        self.clear_target(&mut *tx, path).await?;
        let record = self
            .paths
            .create(
                &mut *tx,
                NewPath {
                    path: path.to_string(),
                    kind: PathType::Dir,
                    mimetype: None,
                    visibility: settings.visibility,
                    size: 0,
                    is_compressed: false,
                    timestamp: Utc::now(),
                    expiry: settings.expiry,
                    meta: settings.meta,
                },
            )
            .await?;

        tx.commit().await?;
        Ok(record)
    }

    /// Delete a file and its chunks; `false` when `path` is missing or a directory
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(record) = self.paths.find(&mut *tx, path).await? else {
            return Ok(false);
        };
        if record.is_dir() {
            return Ok(false);
        }

        discard(&self.paths, &self.chunks, &mut *tx, record.path_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Delete a directory row and everything below it.
    ///
    /// Returns whether anything was removed. Expired descendants are removed
    /// too, so no chunk rows outlive the directory.
    pub async fn delete_dir(&self, path: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let own = self.paths.find_any(&mut *tx, path).await?;
        if let Some(record) = &own {
            if record.is_file() && !record.is_expired_at(now) {
                return Err(FsError::NotADirectory(path.to_string()));
            }
        }

        let descendants = self.paths.descendants(&mut *tx, path).await?;
        let mut removed = 0usize;
        for record in &descendants {
            discard(&self.paths, &self.chunks, &mut *tx, record.path_id).await?;
            removed += 1;
        }
        if let Some(record) = own.filter(PathRecord::is_dir) {
            discard(&self.paths, &self.chunks, &mut *tx, record.path_id).await?;
            removed += 1;
        }

        tx.commit().await?;
        debug!(path, removed, "deleted directory");
        Ok(removed > 0)
    }

    /// Duplicate an entry and its chunks under a new path.
    ///
    /// `None` when the source is missing. A directory copy duplicates only
    /// the directory's own row.
    pub async fn copy(&self, from: &str, to: &str) -> Result<Option<PathRecord>> {
        let mut tx = self.pool.begin().await?;
        let Some(source) = self.paths.find(&mut *tx, from).await? else {
            return Ok(None);
        };

        self.clear_target(&mut *tx, to).await?;
        let record = self
            .paths
            .create(
                &mut *tx,
                NewPath {
                    path: to.to_string(),
                    kind: source.kind,
                    mimetype: source.mimetype.clone(),
                    visibility: source.visibility,
                    size: source.size,
                    is_compressed: source.is_compressed,
                    timestamp: Utc::now(),
                    expiry: source.expiry,
                    meta: source.meta.clone(),
                },
            )
            .await?;

        let mut copied = 0;
        if source.is_file() {
            copied = self
                .chunks
                .duplicate_chunks(&mut *tx, source.path_id, record.path_id)
                .await?;
        }

        tx.commit().await?;
        debug!(from, to, chunks = copied, "copied entry");
        Ok(Some(record))
    }

    /// Move an entry to a new path; a directory takes its descendants along.
    ///
    /// Returns `false` when the source is missing.
    pub async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let Some(source) = self.paths.find(&mut *tx, from).await? else {
            return Ok(false);
        };
        if from == to {
            return Ok(true);
        }
        if to.starts_with(&child_prefix(from)) {
            return Err(FsError::InvalidPath(format!(
                "cannot move {from} inside itself to {to}"
            )));
        }

        let mut moves = vec![(source.path_id, to.to_string())];
        if source.is_dir() {
            for record in self.paths.descendants(&mut *tx, from).await? {
                let moved = format!("{to}{}", &record.path[from.len()..]);
                moves.push((record.path_id, moved));
            }
        }

        for (_, new_path) in &moves {
            self.clear_target(&mut *tx, new_path).await?;
        }
        for (path_id, new_path) in &moves {
            self.paths.move_row(&mut *tx, *path_id, new_path).await?;
        }

        tx.commit().await?;
        debug!(from, to, rows = moves.len(), "renamed entry");
        Ok(true)
    }

    /// Live entries below `dir`
    pub async fn list_contents(&self, dir: &str, recursive: bool) -> Result<Vec<PathRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.paths.list_by_prefix(&mut conn, dir, recursive).await
    }

    /// Remove every expired entry and its chunks; returns how many were removed
    pub async fn purge_expired(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let expired = self.paths.list_expired(&mut *tx).await?;
        for record in &expired {
            discard(&self.paths, &self.chunks, &mut *tx, record.path_id).await?;
        }
        tx.commit().await?;

        if !expired.is_empty() {
            debug!(count = expired.len(), "purged expired entries");
        }
        Ok(expired.len() as u64)
    }

    /// Make `path` free for a new row: a live entry is an error, an expired
    /// one is discarded.
    async fn clear_target(&self, conn: &mut AnyConnection, path: &str) -> Result<()> {
        if let Some(existing) = self.paths.find_any(&mut *conn, path).await? {
            if !existing.is_expired_at(Utc::now()) {
                return Err(FsError::already_exists(path));
            }
            discard(&self.paths, &self.chunks, conn, existing.path_id).await?;
        }
        Ok(())
    }
}

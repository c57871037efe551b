//! The filesystem facade.
//!
//! [`SqlFs`] is the operation surface an adapter layer talks to. It
//! normalises every incoming path, then hands the call to the stream
//! pipeline (file content) or the directory engine (multi-row operations).
//! Operations whose natural answer for a missing path is "no" return `false`
//! or `None` rather than an error.

use crate::backend::{SqlBackend, SqlBackendConfig};
use crate::chunk_store::CursorMode;
use crate::config::{FsConfig, WriteConfig};
use crate::directory::DirectoryEngine;
use crate::error::{FsError, Result};
use crate::path_store::{PathRecord, PathStore};
use crate::pipeline::{FileContents, FileStream, StreamPipeline};
use crate::schema::{ROOT, Tables, Visibility, normalize_path};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tracing::{info, instrument, warn};

/// A chunked filesystem stored in two SQL tables
#[derive(Debug, Clone)]
pub struct SqlFs {
    backend: SqlBackend,
    config: FsConfig,
    tables: Tables,
    cursor: CursorMode,
    paths: PathStore,
    pipeline: StreamPipeline,
    directories: DirectoryEngine,
}

impl SqlFs {
    /// Connect to a database and open the filesystem stored in it.
    ///
    /// The path and chunk tables are created if they do not exist yet.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use sqlfs::{FsConfig, SqlBackendConfig, SqlFs, WriteConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = FsConfig::default().with_compression(true);
    ///     let fs = SqlFs::open(SqlBackendConfig::Sqlite("files.db".into()), config).await?;
    ///
    ///     fs.write("/notes/today.txt", "hello", &WriteConfig::new()).await?;
    ///     let file = fs.read("/notes/today.txt").await?;
    ///
    ///     Ok(())
    /// }
    /// ```
    pub async fn open(backend: SqlBackendConfig, config: FsConfig) -> Result<Self> {
        let backend = SqlBackend::connect(backend).await?;
        Self::with_backend(backend, config).await
    }

    /// Open the filesystem on an already connected backend
    pub async fn with_backend(backend: SqlBackend, config: FsConfig) -> Result<Self> {
        config.validate()?;
        let capabilities = *backend.capabilities();
        if let Some(max) = capabilities.max_chunk_size {
            if config.chunk_size > max {
                return Err(FsError::Config(format!(
                    "chunk_size {} exceeds backend limit {max}",
                    config.chunk_size
                )));
            }
        }

        let cursor = CursorMode::resolve(config.unbuffered_reads, &capabilities);
        if cursor == CursorMode::Buffered && capabilities.single_connection {
            return Err(FsError::Config(
                "buffered reads hold the only connection of this backend; use unbuffered reads".to_string(),
            ));
        }

        let tables = Tables::with_prefix(&config.table_prefix)?;
        backend.migrate(&tables).await?;

        if cursor == CursorMode::Buffered && !capabilities.streaming_cursor {
            warn!("buffered reads on a backend that loads whole result sets; read streams hold every chunk of a file");
        }
        info!(prefix = %tables.prefix, ?cursor, chunk_size = config.chunk_size, "opened filesystem");

        Ok(Self {
            paths: PathStore::new(tables.path.clone(), backend.backend_type()),
            pipeline: StreamPipeline::new(&backend, &tables, config.clone(), cursor),
            directories: DirectoryEngine::new(&backend, &tables, config.clone()),
            backend,
            config,
            tables,
            cursor,
        })
    }

    /// Convenience constructor for SQLite with default configuration
    #[cfg(feature = "sqlite")]
    pub async fn sqlite(path: impl Into<String>) -> Result<Self> {
        Self::open(SqlBackendConfig::Sqlite(path.into()), FsConfig::default()).await
    }

    /// Convenience constructor for PostgreSQL with default configuration
    #[cfg(feature = "postgres")]
    pub async fn postgres(url: impl Into<String>) -> Result<Self> {
        Self::open(SqlBackendConfig::Postgres(url.into()), FsConfig::default()).await
    }

    /// Convenience constructor for MySQL with default configuration
    #[cfg(feature = "mysql")]
    pub async fn mysql(url: impl Into<String>) -> Result<Self> {
        Self::open(SqlBackendConfig::Mysql(url.into()), FsConfig::default()).await
    }

    pub fn backend(&self) -> &SqlBackend {
        &self.backend
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// How chunk rows are fetched on read
    pub fn cursor_mode(&self) -> CursorMode {
        self.cursor
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn has(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        let mut conn = self.backend.pool().acquire().await?;
        self.paths.exists(&mut conn, &path).await
    }

    /// Create a file; fails with `AlreadyExists` if a live entry is present
    #[instrument(skip(self, content, call), level = "debug")]
    pub async fn write(&self, path: &str, content: impl Into<Bytes>, call: &WriteConfig) -> Result<PathRecord> {
        let path = entry_path(path)?;
        self.pipeline.write(&path, content, call).await
    }

    #[instrument(skip(self, reader, call), level = "debug")]
    pub async fn write_stream<R>(&self, path: &str, reader: R, call: &WriteConfig) -> Result<PathRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = entry_path(path)?;
        self.pipeline.write_stream(&path, reader, call).await
    }

    /// Replace a file's content; fails with `NotFound` if there is no such file
    #[instrument(skip(self, content, call), level = "debug")]
    pub async fn update(&self, path: &str, content: impl Into<Bytes>, call: &WriteConfig) -> Result<PathRecord> {
        let path = entry_path(path)?;
        self.pipeline.update(&path, content, call).await
    }

    #[instrument(skip(self, reader, call), level = "debug")]
    pub async fn update_stream<R>(&self, path: &str, reader: R, call: &WriteConfig) -> Result<PathRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let path = entry_path(path)?;
        self.pipeline.update_stream(&path, reader, call).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn read(&self, path: &str) -> Result<Option<FileContents>> {
        let path = normalize_path(path)?;
        self.pipeline.read(&path).await
    }

    /// Open a file for streaming. Chunks are fetched as the stream is polled.
    #[instrument(skip(self), level = "debug")]
    pub async fn read_stream(&self, path: &str) -> Result<Option<FileStream>> {
        let path = normalize_path(path)?;
        self.pipeline.read_stream(&path).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        self.directories.delete(&path).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn delete_dir(&self, path: &str) -> Result<bool> {
        let path = normalize_path(path)?;
        self.directories.delete_dir(&path).await
    }

    #[instrument(skip(self, call), level = "debug")]
    pub async fn create_dir(&self, path: &str, call: &WriteConfig) -> Result<PathRecord> {
        let path = entry_path(path)?;
        self.directories.create_dir(&path, call).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn copy(&self, from: &str, to: &str) -> Result<Option<PathRecord>> {
        let from = normalize_path(from)?;
        let to = entry_path(to)?;
        self.directories.copy(&from, &to).await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn rename(&self, from: &str, to: &str) -> Result<bool> {
        let from = normalize_path(from)?;
        let to = entry_path(to)?;
        self.directories.rename(&from, &to).await
    }

    /// Change an entry's visibility; `None` when there is no such entry
    #[instrument(skip(self), level = "debug")]
    pub async fn set_visibility(&self, path: &str, visibility: Visibility) -> Result<Option<PathRecord>> {
        let path = normalize_path(path)?;
        let mut conn = self.backend.pool().acquire().await?;
        match self.paths.set_visibility(&mut conn, &path, visibility).await {
            Ok(()) => self.paths.find(&mut conn, &path).await,
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Entries below `dir`, ordered by path
    #[instrument(skip(self), level = "debug")]
    pub async fn list_contents(&self, dir: &str, recursive: bool) -> Result<Vec<PathRecord>> {
        let dir = normalize_path(dir)?;
        self.directories.list_contents(&dir, recursive).await
    }

    pub async fn get_metadata(&self, path: &str) -> Result<Option<PathRecord>> {
        let path = normalize_path(path)?;
        let mut conn = self.backend.pool().acquire().await?;
        self.paths.find(&mut conn, &path).await
    }

    pub async fn get_size(&self, path: &str) -> Result<Option<u64>> {
        Ok(self.get_metadata(path).await?.map(|r| r.size))
    }

    pub async fn get_mimetype(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get_metadata(path).await?.and_then(|r| r.mimetype))
    }

    pub async fn get_timestamp(&self, path: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.get_metadata(path).await?.map(|r| r.timestamp))
    }

    pub async fn get_visibility(&self, path: &str) -> Result<Option<Visibility>> {
        Ok(self.get_metadata(path).await?.map(|r| r.visibility))
    }

    /// Delete every expired entry with its chunks
    #[instrument(skip(self), level = "debug")]
    pub async fn purge_expired(&self) -> Result<u64> {
        self.directories.purge_expired().await
    }

    pub async fn close(&self) {
        self.backend.close().await;
    }
}

/// Normalised path of an entry that can be created; the root cannot
fn entry_path(path: &str) -> Result<String> {
    let path = normalize_path(path)?;
    if path == ROOT {
        return Err(FsError::InvalidPath(path));
    }
    Ok(path)
}

//! Stream Pipeline: moving file content between callers and the chunk table.
//!
//! Writes split the source into chunks, encode each one and insert it as it
//! is produced, then record the final size on the path row. The whole write
//! runs in one transaction, so a failed source or a storage fault leaves the
//! previous state untouched.
//!
//! Reads hand back a lazy [`ByteStream`] that decodes one chunk at a time.

use crate::backend::SqlBackend;
use crate::chunk_store::{ChunkStore, CursorMode, StoredChunk};
use crate::codec::ChunkCodec;
use crate::config::{FsConfig, ResolvedWrite, WriteConfig};
use crate::directory::discard;
use crate::error::{FsError, Result};
use crate::mimetype::{self, SNIFF_LEN};
use crate::path_store::{NewPath, PathRecord, PathStore, PathUpdate, truncate_to_seconds};
use crate::schema::{PathType, Tables};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::AnyPool;
use std::fmt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Lazily produced file content
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// A whole file read into memory
#[derive(Debug, Clone, PartialEq)]
pub struct FileContents {
    pub record: PathRecord,
    pub contents: Bytes,
}

/// A file whose content is pulled from the database as the stream is polled.
///
/// Dropping the stream before the end releases its database resources.
pub struct FileStream {
    pub record: PathRecord,
    pub stream: ByteStream,
}

impl FileStream {
    /// Adapt the content into a [`tokio::io::AsyncRead`]
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.stream)
    }

    /// Drain the stream into one buffer
    pub async fn into_bytes(self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.record.size as usize);
        let mut stream = self.stream;
        while let Some(chunk) = stream.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Whether a store creates a new file or replaces an existing one's content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Create,
    Replace,
}

#[derive(Debug, Clone)]
pub struct StreamPipeline {
    pool: AnyPool,
    paths: PathStore,
    chunks: ChunkStore,
    config: FsConfig,
    cursor: CursorMode,
    max_chunk_size: Option<usize>,
}

impl StreamPipeline {
    pub(crate) fn new(backend: &SqlBackend, tables: &Tables, config: FsConfig, cursor: CursorMode) -> Self {
        Self {
            pool: backend.pool().clone(),
            paths: PathStore::new(tables.path.clone(), backend.backend_type()),
            chunks: ChunkStore::new(tables.chunk.clone(), backend.backend_type()),
            config,
            cursor,
            max_chunk_size: backend.capabilities().max_chunk_size,
        }
    }

    /// Create a new file from an in-memory buffer
    pub async fn write(&self, path: &str, content: impl Into<Bytes>, call: &WriteConfig) -> Result<PathRecord> {
        let settings = self.settings(call)?;
        let chunks = stream::iter(ChunkCodec::split_bytes(content.into(), settings.chunk_size).map(Ok));
        self.store(path, Target::Create, chunks, settings, call).await
    }

    /// Create a new file from a reader, holding one chunk at a time
    pub async fn write_stream<R>(&self, path: &str, reader: R, call: &WriteConfig) -> Result<PathRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let settings = self.settings(call)?;
        let chunks = ChunkCodec::split_reader(reader, settings.chunk_size);
        self.store(path, Target::Create, chunks, settings, call).await
    }

    /// Replace the content of an existing file
    pub async fn update(&self, path: &str, content: impl Into<Bytes>, call: &WriteConfig) -> Result<PathRecord> {
        let settings = self.settings(call)?;
        let chunks = stream::iter(ChunkCodec::split_bytes(content.into(), settings.chunk_size).map(Ok));
        self.store(path, Target::Replace, chunks, settings, call).await
    }

    pub async fn update_stream<R>(&self, path: &str, reader: R, call: &WriteConfig) -> Result<PathRecord>
    where
        R: AsyncRead + Unpin + Send,
    {
        let settings = self.settings(call)?;
        let chunks = ChunkCodec::split_reader(reader, settings.chunk_size);
        self.store(path, Target::Replace, chunks, settings, call).await
    }

    /// Read a whole file; `None` when no live entry exists at `path`
    pub async fn read(&self, path: &str) -> Result<Option<FileContents>> {
        let Some(file) = self.read_stream(path).await? else {
            return Ok(None);
        };
        let record = file.record.clone();
        let contents = file.into_bytes().await?;
        Ok(Some(FileContents { record, contents }))
    }

    /// Open a file for streaming; `None` when no live entry exists at `path`
    pub async fn read_stream(&self, path: &str) -> Result<Option<FileStream>> {
        let record = {
            let mut conn = self.pool.acquire().await?;
            self.paths.find(&mut conn, path).await?
        };
        let Some(record) = record else {
            return Ok(None);
        };
        if record.is_dir() {
            return Err(FsError::NotAFile(record.path));
        }

        let codec = ChunkCodec::new(record.is_compressed, self.config.compression_level);
        let chunks = self
            .chunks
            .read_chunks(self.pool.clone(), record.path_id, self.cursor);
        let stream = reassemble(chunks, codec, record.path_id, record.path.clone(), record.size).boxed();
        Ok(Some(FileStream { record, stream }))
    }

    fn settings(&self, call: &WriteConfig) -> Result<ResolvedWrite> {
        let settings = ResolvedWrite::resolve(&self.config, call)?;
        if let Some(max) = self.max_chunk_size {
            if settings.chunk_size > max {
                return Err(FsError::Config(format!(
                    "chunk_size {} exceeds backend limit {max}",
                    settings.chunk_size
                )));
            }
        }
        Ok(settings)
    }

    async fn store<S>(
        &self,
        path: &str,
        target: Target,
        chunks: S,
        settings: ResolvedWrite,
        call: &WriteConfig,
    ) -> Result<PathRecord>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let (path_id, visibility, expiry, meta) = match target {
            Target::Create => {
                if let Some(existing) = self.paths.find_any(&mut *tx, path).await? {
                    if !existing.is_expired_at(now) {
                        return Err(FsError::already_exists(path));
                    }
                    debug!(path, "replacing expired entry");
                    discard(&self.paths, &self.chunks, &mut *tx, existing.path_id).await?;
                }
                let record = self
                    .paths
                    .create(
                        &mut *tx,
                        NewPath {
                            path: path.to_string(),
                            kind: PathType::File,
                            mimetype: settings.mimetype.clone(),
                            visibility: settings.visibility,
                            size: 0,
                            is_compressed: settings.enable_compression,
                            timestamp: now,
                            expiry: settings.expiry,
                            meta: settings.meta.clone(),
                        },
                    )
                    .await?;
                (record.path_id, settings.visibility, settings.expiry, settings.meta)
            }
            Target::Replace => {
                let existing = self.paths.get(&mut *tx, path).await?;
                if existing.is_dir() {
                    return Err(FsError::NotAFile(existing.path));
                }
                self.chunks.delete_chunks(&mut *tx, existing.path_id).await?;
                (
                    existing.path_id,
                    call.visibility.unwrap_or(existing.visibility),
                    call.expiry.or(existing.expiry),
                    call.meta.clone().or(existing.meta),
                )
            }
        };

        let codec = ChunkCodec::new(settings.enable_compression, self.config.compression_level);
        let mut size = 0u64;
        let mut head = Vec::new();
        let encoded = chunks.map(|chunk| {
            let chunk = chunk?;
            size += chunk.len() as u64;
            if head.len() < SNIFF_LEN {
                let take = (SNIFF_LEN - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            codec.encode(chunk)
        });
        let written = self.chunks.append_chunks(&mut *tx, path_id, encoded).await?;

        let mimetype = match settings.mimetype {
            Some(mimetype) => mimetype,
            None => mimetype::guess(path, &head),
        };
        let update = PathUpdate {
            size,
            mimetype: Some(mimetype.clone()),
            is_compressed: settings.enable_compression,
            timestamp: now,
            visibility,
            expiry,
            meta: meta.clone(),
        };
        self.paths.update(&mut *tx, path, &update).await?;
        tx.commit().await?;

        debug!(path, path_id, size, chunks = written, ?target, "stored file");

        Ok(PathRecord {
            path_id,
            path: path.to_string(),
            kind: PathType::File,
            mimetype: Some(mimetype),
            visibility,
            size,
            is_compressed: settings.enable_compression,
            timestamp: truncate_to_seconds(now),
            expiry: expiry.map(truncate_to_seconds),
            meta,
        })
    }
}

/// Decode stored chunks in order, checking the sequence and recorded size
fn reassemble(
    chunks: BoxStream<'static, Result<StoredChunk>>,
    codec: ChunkCodec,
    path_id: i64,
    path: String,
    expected: u64,
) -> impl Stream<Item = Result<Bytes>> + Send {
    async_stream::try_stream! {
        let mut chunks = chunks;
        let mut next_no = 0i64;
        let mut total = 0u64;
        while let Some(stored) = chunks.try_next().await? {
            check_sequence(path_id, next_no, stored.chunk_no)?;
            let chunk = codec.decode(path_id, stored.chunk_no, stored.content)?;
            total += chunk.len() as u64;
            check_size(&path, expected, total, false)?;
            next_no += 1;
            yield chunk;
        }
        check_size(&path, expected, total, true)?;
    }
}

fn check_sequence(path_id: i64, expected: i64, found: i64) -> Result<()> {
    if expected != found {
        return Err(FsError::CorruptChunk {
            path_id,
            chunk_no: expected,
            reason: format!("chunk sequence broken, found chunk {found}"),
        });
    }
    Ok(())
}

/// Reassembled bytes may never exceed the recorded size, and must match it at the end
fn check_size(path: &str, expected: u64, actual: u64, finished: bool) -> Result<()> {
    if actual > expected || (finished && actual != expected) {
        return Err(FsError::SizeMismatch {
            path: path.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

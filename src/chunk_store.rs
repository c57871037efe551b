//! Chunk Store: ordered content chunks scoped to a path id.

use crate::backend::{BackendType, Capabilities};
use crate::error::Result;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::{AnyConnection, AnyPool, Row};
use std::pin::pin;
use tracing::debug;

/// How chunk rows are pulled from the database on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// One ordered query over all chunks of a path. Rows arrive as the
    /// driver delivers them, which for some drivers means only after the
    /// whole result set is resident.
    Buffered,

    /// One keyed query per chunk. At most one chunk row is in flight
    /// regardless of driver buffering.
    Unbuffered,
}

impl CursorMode {
    /// Pick a mode from the configured toggle, falling back to what the
    /// backend's cursor can do without buffering everything.
    ///
    /// A buffered read holds its connection until the stream ends, so a
    /// single-connection backend defaults to keyed reads.
    pub fn resolve(unbuffered_reads: Option<bool>, capabilities: &Capabilities) -> Self {
        match unbuffered_reads {
            Some(true) => CursorMode::Unbuffered,
            Some(false) => CursorMode::Buffered,
            None if capabilities.single_connection => CursorMode::Unbuffered,
            None if capabilities.streaming_cursor => CursorMode::Buffered,
            None => CursorMode::Unbuffered,
        }
    }
}

/// A chunk row as stored, before decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredChunk {
    pub chunk_no: i64,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    table: String,
    backend: BackendType,
}

impl ChunkStore {
    pub(crate) fn new(table: impl Into<String>, backend: BackendType) -> Self {
        Self {
            table: table.into(),
            backend,
        }
    }

    /// Insert payloads as chunks `0..n` of `path_id` in the order produced.
    ///
    /// The path must have no chunks yet. Payloads are written as they arrive,
    /// so only the current one is held. Returns the number of chunks written.
    pub async fn append_chunks<S>(&self, conn: &mut AnyConnection, path_id: i64, chunks: S) -> Result<i64>
    where
        S: Stream<Item = Result<Bytes>>,
    {
        let sql = format!(
            "INSERT INTO {} (path_id, chunk_no, content) VALUES (?, ?, ?)",
            self.table
        );
        let sql = self.backend.sql(&sql);

        let mut chunks = pin!(chunks);
        let mut chunk_no = 0i64;
        while let Some(payload) = chunks.try_next().await? {
            sqlx::query(&sql)
                .bind(path_id)
                .bind(chunk_no)
                .bind(&payload[..])
                .execute(&mut *conn)
                .await?;
            chunk_no += 1;
        }

        debug!(path_id, chunks = chunk_no, "appended chunks");
        Ok(chunk_no)
    }

    /// Lazily read every chunk of `path_id` in `chunk_no` order.
    ///
    /// Nothing is fetched until the stream is polled. Dropping the stream
    /// releases any connection it holds.
    pub fn read_chunks(&self, pool: AnyPool, path_id: i64, mode: CursorMode) -> BoxStream<'static, Result<StoredChunk>> {
        match mode {
            CursorMode::Buffered => {
                let sql = format!(
                    "SELECT chunk_no, content FROM {} WHERE path_id = ? ORDER BY chunk_no",
                    self.table
                );
                ordered_query(pool, self.backend.sql(&sql).into_owned(), path_id).boxed()
            }
            CursorMode::Unbuffered => {
                let sql = format!(
                    "SELECT content FROM {} WHERE path_id = ? AND chunk_no = ?",
                    self.table
                );
                keyed_queries(pool, self.backend.sql(&sql).into_owned(), path_id).boxed()
            }
        }
    }

    /// Remove every chunk of `path_id`; returns how many were removed
    pub async fn delete_chunks(&self, conn: &mut AnyConnection, path_id: i64) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE path_id = ?", self.table);
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(path_id)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Copy every chunk of `from` to `to`, keeping chunk numbers and content.
    ///
    /// Runs server-side; no chunk content passes through this process.
    pub async fn duplicate_chunks(&self, conn: &mut AnyConnection, from: i64, to: i64) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {table} (path_id, chunk_no, content) \
             SELECT ?, chunk_no, content FROM {table} WHERE path_id = ?",
            table = self.table
        );
        let result = sqlx::query(&self.backend.sql(&sql))
            .bind(to)
            .bind(from)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// Stored chunk numbers of `path_id`, ascending
    #[cfg(test)]
    pub(crate) async fn chunk_numbers(&self, conn: &mut AnyConnection, path_id: i64) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT chunk_no FROM {} WHERE path_id = ? ORDER BY chunk_no",
            self.table
        );
        let rows = sqlx::query(&self.backend.sql(&sql))
            .bind(path_id)
            .fetch_all(conn)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("chunk_no").map_err(Into::into))
            .collect()
    }
}

fn ordered_query(pool: AnyPool, sql: String, path_id: i64) -> impl Stream<Item = Result<StoredChunk>> + Send {
    async_stream::try_stream! {
        let mut conn = pool.acquire().await?;
        let mut rows = sqlx::query(&sql).bind(path_id).fetch(&mut *conn);
        while let Some(row) = rows.try_next().await? {
            let chunk_no: i64 = row.try_get("chunk_no")?;
            let content: Vec<u8> = row.try_get("content")?;
            yield StoredChunk { chunk_no, content };
        }
    }
}

fn keyed_queries(pool: AnyPool, sql: String, path_id: i64) -> impl Stream<Item = Result<StoredChunk>> + Send {
    async_stream::try_stream! {
        let mut chunk_no = 0i64;
        loop {
            let row = sqlx::query(&sql)
                .bind(path_id)
                .bind(chunk_no)
                .fetch_optional(&pool)
                .await?;
            match row {
                Some(row) => {
                    let content: Vec<u8> = row.try_get("content")?;
                    yield StoredChunk { chunk_no, content };
                    chunk_no += 1;
                }
                None => break,
            }
        }
    }
}

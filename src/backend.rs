//! Unified SQLx backend for SqlFs
//!
//! Provides a single backend type that works with SQLite, PostgreSQL, and MySQL
//! using runtime dispatch based on the connection URL.

use crate::error::{FsError, Result};
use crate::schema::{PREFIX_PLACEHOLDER, Tables};
use sqlx::AnyPool;
use sqlx::any::install_default_drivers;
use std::borrow::Cow;
use tracing::{debug, info};

/// Configuration for SQL backend
#[derive(Debug, Clone)]
pub enum SqlBackendConfig {
    /// SQLite: file path or ":memory:"
    #[cfg(feature = "sqlite")]
    Sqlite(String),

    /// PostgreSQL: connection URL
    #[cfg(feature = "postgres")]
    Postgres(String),

    /// MySQL: connection URL
    #[cfg(feature = "mysql")]
    Mysql(String),
}

/// What the underlying database family can do for the chunk engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Every operation shares one pooled connection, so a read stream must
    /// not hold a connection between chunks
    pub single_connection: bool,

    /// Whether a single result cursor yields rows incrementally.
    ///
    /// When false the driver holds a whole result set in memory before the
    /// first row is available, so reads must go chunk by chunk to stay bounded.
    pub streaming_cursor: bool,

    /// Largest payload a single chunk row can hold
    pub max_chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendType {
    #[cfg(feature = "sqlite")]
    Sqlite,
    #[cfg(feature = "postgres")]
    Postgres,
    #[cfg(feature = "mysql")]
    Mysql,
}

impl BackendType {
    /// Render a `?`-placeholder statement in this backend's parameter syntax
    pub(crate) fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
        match self {
            #[cfg(feature = "postgres")]
            BackendType::Postgres => Cow::Owned(numbered_placeholders(query)),
            #[allow(unreachable_patterns)]
            _ => Cow::Borrowed(query),
        }
    }

    /// Whether `INSERT ... RETURNING` must be used to learn a new row id.
    ///
    /// sqlx's `any` driver only forwards the last insert id for MySQL.
    pub(crate) fn returns_inserted_id(&self) -> bool {
        match self {
            #[cfg(feature = "sqlite")]
            BackendType::Sqlite => true,
            #[cfg(feature = "postgres")]
            BackendType::Postgres => true,
            #[cfg(feature = "mysql")]
            BackendType::Mysql => false,
        }
    }
}

/// Rewrite `?` placeholders to `$1, $2, ...`, leaving quoted literals alone
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
fn numbered_placeholders(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 8);
    let mut n = 0;
    let mut in_literal = false;
    for c in query.chars() {
        match c {
            '\'' => {
                in_literal = !in_literal;
                out.push(c);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(c),
        }
    }
    out
}

/// Connection pool plus the facts about the database family behind it
#[derive(Debug, Clone)]
pub struct SqlBackend {
    pool: AnyPool,
    backend_type: BackendType,
    capabilities: Capabilities,
}

impl SqlBackend {
    /// Connect to the database described by `config`.
    ///
    /// Migrations are not run here; [`SqlBackend::migrate`] creates the tables
    /// for a given prefix.
    pub async fn connect(config: SqlBackendConfig) -> Result<Self> {
        // Install default SQLx drivers
        install_default_drivers();

        let (url, backend_type, capabilities, is_memory) = match config {
            #[cfg(feature = "sqlite")]
            SqlBackendConfig::Sqlite(path) => {
                let is_memory = path == ":memory:";
                let url = if is_memory {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite:{}?mode=rwc", path)
                };
                (
                    url,
                    BackendType::Sqlite,
                    Capabilities {
                        single_connection: is_memory,
                        streaming_cursor: true,
                        max_chunk_size: Some(1_000_000_000), // SQLITE_MAX_LENGTH
                    },
                    is_memory,
                )
            }
            #[cfg(feature = "postgres")]
            SqlBackendConfig::Postgres(url) => (
                url,
                BackendType::Postgres,
                Capabilities {
                    single_connection: false,
                    streaming_cursor: true,
                    max_chunk_size: Some(1024 * 1024 * 1024), // bytea limit
                },
                false,
            ),
            #[cfg(feature = "mysql")]
            SqlBackendConfig::Mysql(url) => (
                url,
                BackendType::Mysql,
                Capabilities {
                    single_connection: false,
                    streaming_cursor: false,
                    max_chunk_size: None, // LONGBLOB, bounded by max_allowed_packet
                },
                false,
            ),
        };

        // An in-memory database lives as long as its one connection
        let pool = if is_memory {
            use sqlx::pool::PoolOptions;
            PoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(&url)
                .await
                .map_err(|e| FsError::Connection(e.to_string()))?
        } else {
            AnyPool::connect(&url)
                .await
                .map_err(|e| FsError::Connection(e.to_string()))?
        };

        info!(?backend_type, "connected sql backend");

        Ok(Self {
            pool,
            backend_type,
            capabilities,
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub(crate) fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    /// Create the path and chunk tables for `tables` if they do not exist
    pub async fn migrate(&self, tables: &Tables) -> Result<()> {
        let sql = match self.backend_type {
            #[cfg(feature = "sqlite")]
            BackendType::Sqlite => include_str!("../migrations/sqlite.sql"),
            #[cfg(feature = "postgres")]
            BackendType::Postgres => include_str!("../migrations/postgres.sql"),
            #[cfg(feature = "mysql")]
            BackendType::Mysql => include_str!("../migrations/mysql.sql"),
        };
        let sql = sql.replace(PREFIX_PLACEHOLDER, &tables.prefix);

        // DDL runs outside a transaction: SQLite auto-commits it anyway
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| FsError::Migration(format!("Failed to acquire connection: {}", e)))?;

        // SQLx executes one statement per query
        for (idx, statement) in migration_statements(&sql).into_iter().enumerate() {
            sqlx::query(&statement).execute(&mut *conn).await.map_err(|e| {
                FsError::Migration(format!(
                    "Failed to execute migration statement #{}: {} - Error: {}",
                    idx, statement, e
                ))
            })?;
        }

        debug!(path_table = %tables.path, chunk_table = %tables.chunk, "schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Split a migration script into statements, dropping comment-only lines
fn migration_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|statement| {
            statement
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("--")
                })
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|statement| !statement.is_empty())
        .collect()
}

//! Configuration for SqlFs
//!
//! [`FsConfig`] carries the engine-wide defaults and is fixed when the
//! filesystem is opened. [`WriteConfig`] is the per-call configuration passed
//! to write, update and createDir; every field it leaves unset falls back to
//! the engine default.

use crate::error::{FsError, Result};
use crate::schema::{DEFAULT_TABLE_PREFIX, Visibility};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default configuration constants
pub mod defaults {
    /// Default chunk size: 1 MiB
    pub const CHUNK_SIZE: usize = 1024 * 1024;

    /// Compression is opt-in
    pub const ENABLE_COMPRESSION: bool = false;

    /// zstd's own default level
    pub const COMPRESSION_LEVEL: i32 = zstd::DEFAULT_COMPRESSION_LEVEL;
}

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Tables are named `<table_prefix>_path` and `<table_prefix>_chunk`
    pub table_prefix: String,

    /// Split granularity for new content, in bytes
    pub chunk_size: usize,

    /// Whether new and updated content is stored compressed
    pub enable_compression: bool,

    /// zstd level used when compressing
    pub compression_level: i32,

    /// Chunk read mode.
    ///
    /// `None` picks per backend: chunk-at-a-time reads for drivers whose
    /// cursor buffers the whole result set, a single streamed query otherwise.
    pub unbuffered_reads: Option<bool>,

    /// Visibility of entries created without an explicit one
    pub visibility: Visibility,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            chunk_size: defaults::CHUNK_SIZE,
            enable_compression: defaults::ENABLE_COMPRESSION,
            compression_level: defaults::COMPRESSION_LEVEL,
            unbuffered_reads: None,
            visibility: Visibility::default(),
        }
    }
}

impl FsConfig {
    /// Load configuration from a JSON document; missing keys take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FsConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_compression(mut self, enable: bool) -> Self {
        self.enable_compression = enable;
        self
    }

    pub fn with_unbuffered_reads(mut self, unbuffered: bool) -> Self {
        self.unbuffered_reads = Some(unbuffered);
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.compression_level) {
            return Err(FsError::Config(format!(
                "compression_level {} outside {}..={}",
                self.compression_level,
                levels.start(),
                levels.end()
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 {
        return Err(FsError::Config("chunk_size must be positive".to_string()));
    }
    Ok(())
}

/// Per-call configuration for write, update and createDir
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    pub enable_compression: Option<bool>,
    pub chunk_size: Option<usize>,
    pub visibility: Option<Visibility>,

    /// Explicit content type; guessed from the path and content when unset
    pub mimetype: Option<String>,

    /// Entries are treated as absent once this instant has passed
    pub expiry: Option<DateTime<Utc>>,

    /// Caller-defined metadata stored alongside the entry
    pub meta: Option<serde_json::Value>,
}

impl WriteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compressed(mut self, enable: bool) -> Self {
        self.enable_compression = Some(enable);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = Some(mimetype.into());
        self
    }

    pub fn expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Write settings after merging a [`WriteConfig`] over the engine defaults
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedWrite {
    pub enable_compression: bool,
    pub chunk_size: usize,
    pub visibility: Visibility,
    pub mimetype: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub meta: Option<serde_json::Value>,
}

impl ResolvedWrite {
    pub fn resolve(engine: &FsConfig, call: &WriteConfig) -> Result<Self> {
        let chunk_size = call.chunk_size.unwrap_or(engine.chunk_size);
        validate_chunk_size(chunk_size)?;
        Ok(Self {
            enable_compression: call.enable_compression.unwrap_or(engine.enable_compression),
            chunk_size,
            visibility: call.visibility.unwrap_or(engine.visibility),
            mimetype: call.mimetype.clone(),
            expiry: call.expiry,
            meta: call.meta.clone(),
        })
    }
}

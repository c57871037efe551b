//! Database schema definitions for SqlFs
//!
//! Two relations back the filesystem: `<prefix>_path` holds one row per file
//! or directory, `<prefix>_chunk` holds the ordered content chunks of files.
//! The hierarchy is implied by path-string prefixes; there is no parent link.

use crate::error::{FsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default table prefix
pub const DEFAULT_TABLE_PREFIX: &str = "sqlfs";

/// Root path
pub const ROOT: &str = "/";

/// Placeholder substituted with the table prefix in migration scripts
pub(crate) const PREFIX_PLACEHOLDER: &str = "{prefix}";

/// Resolved table names for one filesystem instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tables {
    pub prefix: String,
    pub path: String,
    pub chunk: String,
}

impl Tables {
    pub fn with_prefix(prefix: &str) -> Result<Self> {
        let valid = !prefix.is_empty()
            && prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(FsError::Config(format!(
                "table prefix must be non-empty and [A-Za-z0-9_]: {prefix:?}"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
            path: format!("{prefix}_path"),
            chunk: format!("{prefix}_chunk"),
        })
    }
}

/// Entry type stored in the `type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathType {
    File,
    Dir,
}

impl PathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PathType::File => "file",
            PathType::Dir => "dir",
        }
    }
}

impl FromStr for PathType {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(PathType::File),
            "dir" => Ok(PathType::Dir),
            other => Err(FsError::Config(format!("unknown path type {other:?}"))),
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visibility stored in the `visibility` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            other => Err(FsError::Config(format!("unknown visibility {other:?}"))),
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a path to absolute form: leading slash, single separators,
/// no `.` segments and no trailing slash except for the root.
pub fn normalize_path(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FsError::InvalidPath(path.to_string()));
                }
            }
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Ok(ROOT.to_string());
    }

    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    Ok(normalized)
}

/// Prefix shared by every descendant of `dir`
pub(crate) fn child_prefix(dir: &str) -> String {
    if dir == ROOT {
        ROOT.to_string()
    } else {
        format!("{dir}/")
    }
}

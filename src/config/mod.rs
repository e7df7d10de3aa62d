//! # Repository Configuration
//!
//! Constants live in [`constants`]. [`RepositoryConfig`] turns the agent's
//! flat `key = value` properties into a [`RepositoryKind`], which the
//! [`crate::repository::RepositoryBuilder`] then opens.
//!
//! ## Recognized Properties
//!
//! | Key | Default |
//! |-----|---------|
//! | `nifi.content.repository.class.name` | `FileSystemRepository` |
//! | `nifi.content.repository.directory.default` | `./content_repository` |
//! | `nifi.database.content.repository.directory.default` | `./dbcontentrepository` |
//! | `nifi.volatile.repository.options.content.max.bytes` | 10 MiB |
//! | `nifi.volatile.repository.options.content.max.count` | 10000 |
//!
//! Class names are matched case-insensitively and the `Repository` suffix is
//! optional, so `volatile`, `VolatileContentRepository` and
//! `volatilecontent` all select the volatile backend.

pub mod constants;
pub use constants::*;

use std::collections::HashMap;
use std::path::PathBuf;

use eyre::{bail, Result, WrapErr};

use crate::repository::RepositoryKind;

#[derive(Debug, Clone, Default)]
pub struct RepositoryConfig {
    properties: HashMap<String, String>,
}

impl RepositoryConfig {
    pub fn from_properties(properties: &HashMap<String, String>) -> Self {
        Self {
            properties: properties.clone(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|v| v.trim())
    }

    pub fn repository_kind(&self) -> Result<RepositoryKind> {
        let class = self.get(PROP_REPOSITORY_CLASS).unwrap_or("FileSystemRepository");
        let normalized = class.to_ascii_lowercase();
        let normalized = normalized.trim_end_matches("repository");

        match normalized {
            "filesystem" | "file" => Ok(RepositoryKind::FileSystem {
                directory: self.path_or(PROP_CONTENT_DIRECTORY, DEFAULT_CONTENT_DIRECTORY),
            }),
            "volatilecontent" | "volatile" => Ok(RepositoryKind::Volatile {
                max_bytes: self.usize_or(PROP_VOLATILE_MAX_BYTES, DEFAULT_VOLATILE_MAX_BYTES)?,
                max_count: self.usize_or(PROP_VOLATILE_MAX_COUNT, DEFAULT_VOLATILE_MAX_COUNT)?,
            }),
            "databasecontent" | "database" => Ok(RepositoryKind::Database {
                path: self.path_or(PROP_DATABASE_DIRECTORY, DEFAULT_DATABASE_PATH),
            }),
            _ => bail!("unknown content repository class '{}'", class),
        }
    }

    fn path_or(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or(default))
    }

    fn usize_or(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            Some(raw) => raw
                .parse::<usize>()
                .wrap_err_with(|| format!("invalid value '{}' for property '{}'", raw, key)),
            None => Ok(default),
        }
    }
}

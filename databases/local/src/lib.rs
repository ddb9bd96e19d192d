//! Local filesystem database backend.
//!
//! One database directory holds a sharded content-addressed object store
//! shared by every client, plus per-client configuration, committed backup
//! manifests and in-progress session staging:
//!
//! ```text
//! <base>/config.json
//! <base>/store/<shard>/<digest>          file object, raw bytes
//! <base>/store/<shard>/<digest>.d        directory object, canonical JSON
//! <base>/client/<name>                   symlink -> <client_id>
//! <base>/client/<client_id>/config.json
//! <base>/client/<client_id>/backup/<timestamp>.json
//! <base>/client/<client_id>/sessions/<session_id>/...
//! ```
//!
//! Atomicity comes from create-exclusive and rename-into-place, never from
//! in-process locks: the store is append-only and concurrent writers at the
//! same key are idempotent.

mod session;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snapback_core::{ClientConfiguration, Error, FileType, Result};
use tracing::error;

pub use session::{LocalBackupSession, LocalServerSession};

pub(crate) const CONFIG_FILE: &str = "config.json";
const CLIENT_DIR: &str = "client";
const STORE_DIR: &str = "store";

/// Database-wide settings, stored in `<base>/config.json`.
///
/// The shard prefix of an object key is its first
/// `store_split_count * store_split_size` hex characters, split into
/// `store_split_count` path components. This flattens the keyspace for
/// filesystems that dislike huge directories and never appears in any
/// protocol message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_split_count")]
    pub store_split_count: usize,
    #[serde(default = "default_split_size")]
    pub store_split_size: usize,
}

fn default_split_count() -> usize {
    1
}

fn default_split_size() -> usize {
    2
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            store_split_count: default_split_count(),
            store_split_size: default_split_size(),
        }
    }
}

/// Handle on one database directory.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    base_path: PathBuf,
    config: DatabaseConfig,
}

impl LocalDatabase {
    /// Initialise a fresh database directory. Fails if `base_path` exists.
    pub async fn create_database(
        base_path: impl Into<PathBuf>,
        config: DatabaseConfig,
    ) -> Result<Self> {
        let base_path: PathBuf = base_path.into();
        if let Some(parent) = base_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir(&base_path).await?;
        tokio::fs::write(
            base_path.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )
        .await?;
        tokio::fs::create_dir(base_path.join(STORE_DIR)).await?;
        tokio::fs::create_dir(base_path.join(CLIENT_DIR)).await?;
        Ok(LocalDatabase { base_path, config })
    }

    /// Open an existing database directory.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path: PathBuf = base_path.into();
        let raw = tokio::fs::read(base_path.join(CONFIG_FILE)).await?;
        let config = serde_json::from_slice(&raw)?;
        Ok(LocalDatabase { base_path, config })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Register a new client and return a session attached to it. The
    /// client's name becomes a symlink alias for its id.
    pub async fn create_client(
        &self,
        client_config: &ClientConfiguration,
    ) -> Result<LocalServerSession> {
        let clients = self.base_path.join(CLIENT_DIR);
        tokio::fs::create_dir_all(&clients).await?;

        let client_path = clients.join(client_config.client_id.to_string());
        tokio::fs::create_dir(&client_path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                Error::AlreadyExists(format!("client {}", client_config.client_id))
            } else {
                err.into()
            }
        })?;
        tokio::fs::symlink(
            client_config.client_id.to_string(),
            clients.join(&client_config.client_name),
        )
        .await?;
        tokio::fs::write(
            client_path.join(CONFIG_FILE),
            serde_json::to_string_pretty(client_config)?,
        )
        .await?;

        LocalServerSession::open(self.clone(), client_path).await
    }

    /// Open a per-client session, resolving a name through its symlink
    /// alias. A missing client fails `session_closed`.
    pub async fn open_client_session(&self, client_id_or_name: &str) -> Result<LocalServerSession> {
        let mut client_path = self.base_path.join(CLIENT_DIR).join(client_id_or_name);
        match tokio::fs::symlink_metadata(&client_path).await {
            Ok(meta) if meta.is_symlink() => {
                let client_id = tokio::fs::read_link(&client_path).await?;
                client_path = self.base_path.join(CLIENT_DIR).join(client_id);
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                error!("session not found: {client_id_or_name}");
                return Err(Error::SessionClosed(format!(
                    "no such session {client_id_or_name}"
                )));
            }
            Err(err) => {
                error!("could not load session {client_id_or_name}: {err}");
                return Err(Error::Internal(err.to_string()));
            }
        }
        LocalServerSession::open(self.clone(), client_path).await
    }

    /// Where an object key lives in the main store.
    pub(crate) fn store_path_for(&self, key: &str) -> PathBuf {
        let mut path = self.base_path.join(STORE_DIR);
        let split_size = self.config.store_split_size;
        for i in 0..self.config.store_split_count {
            let start = i * split_size;
            let end = ((i + 1) * split_size).min(key.len());
            if start >= end {
                break;
            }
            path.push(&key[start..end]);
        }
        path.push(key);
        path
    }
}

/// The store key for an object: directory blobs carry a `.d` suffix so a
/// file and a directory with the same digest can never alias. The digest a
/// caller sees on the wire is always unsuffixed.
pub(crate) fn object_key(digest: &snapback_core::Digest, kind: FileType) -> String {
    if kind.is_directory() {
        format!("{digest}.d")
    } else {
        digest.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_paths_are_sharded() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db");
        let db = LocalDatabase::create_database(&base, DatabaseConfig::default())
            .await
            .unwrap();

        let key = "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e";
        assert_eq!(db.store_path_for(key), base.join("store").join("a5").join(key));

        let deep = LocalDatabase {
            base_path: base.clone(),
            config: DatabaseConfig {
                store_split_count: 2,
                store_split_size: 2,
            },
        };
        assert_eq!(
            deep.store_path_for(key),
            base.join("store").join("a5").join("91").join(key)
        );
    }

    #[tokio::test]
    async fn database_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db");
        LocalDatabase::create_database(
            &base,
            DatabaseConfig {
                store_split_count: 3,
                store_split_size: 1,
            },
        )
        .await
        .unwrap();

        let reopened = LocalDatabase::open(&base).await.unwrap();
        assert_eq!(reopened.config().store_split_count, 3);
        assert_eq!(reopened.config().store_split_size, 1);
    }

    #[tokio::test]
    async fn creating_an_existing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("db");
        LocalDatabase::create_database(&base, DatabaseConfig::default())
            .await
            .unwrap();
        assert!(
            LocalDatabase::create_database(&base, DatabaseConfig::default())
                .await
                .is_err()
        );
    }
}

//! In-memory database backend.
//!
//! Implements the same session traits as the local backend against plain
//! maps. Behaviour mirrors the filesystem backend exactly (staging,
//! promotion, the `.d` suffix discipline); it exists so the backup and
//! restore drivers can be exercised without touching disk.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use snapback_core::{
    Backup, BackupSession, BackupSessionConfig, ClientConfiguration, Digest, Directory,
    DirectoryDefResponse, Error, FileReader, FileType, Inode, Result, ServerSession,
    digest::Hasher, normalize_backup_date,
};
use uuid::Uuid;

fn object_key(digest: &Digest, kind: FileType) -> String {
    if kind.is_directory() {
        format!("{digest}.d")
    } else {
        digest.to_hex()
    }
}

#[derive(Debug)]
struct MemoryDatabaseInner {
    client_config: ClientConfiguration,
    objects: DashMap<String, Bytes>,
    backups: Mutex<BTreeMap<DateTime<Utc>, Backup>>,
    sessions: DashMap<Uuid, Arc<SessionState>>,
}

/// A whole backup database for one client, held in memory.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryDatabaseInner>,
}

impl MemoryDatabase {
    pub fn new(client_config: ClientConfiguration) -> Self {
        MemoryDatabase {
            inner: Arc::new(MemoryDatabaseInner {
                client_config,
                objects: DashMap::new(),
                backups: Mutex::new(BTreeMap::new()),
                sessions: DashMap::new(),
            }),
        }
    }

    /// Number of distinct objects in the committed store.
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// Whether the committed store holds the given key (digest, with the
    /// `.d` suffix for directories).
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.objects.contains_key(key)
    }

    fn normalize(&self, backup_date: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(normalize_backup_date(
            backup_date,
            self.inner.client_config.backup_granularity,
            self.inner.client_config.timezone()?,
        ))
    }
}

#[derive(Debug)]
struct SessionState {
    config: BackupSessionConfig,
    open: AtomicBool,
    staged: DashMap<String, Bytes>,
    partials: DashMap<Uuid, Vec<u8>>,
    completed_uploads: DashMap<Uuid, ()>,
    roots: DashMap<String, Inode>,
}

#[async_trait]
impl ServerSession for MemoryDatabase {
    fn client_config(&self) -> &ClientConfiguration {
        &self.inner.client_config
    }

    async fn start_backup(
        &self,
        backup_date: DateTime<Utc>,
        allow_overwrite: bool,
        description: Option<String>,
    ) -> Result<Arc<dyn BackupSession>> {
        let backup_date = self.normalize(backup_date)?;
        if !allow_overwrite && self.inner.backups.lock().unwrap().contains_key(&backup_date) {
            return Err(Error::DuplicateBackup(format!("backup exists {backup_date}")));
        }

        let config = BackupSessionConfig {
            client_id: self.inner.client_config.client_id,
            session_id: Uuid::new_v4(),
            backup_date,
            started: Utc::now(),
            allow_overwrite,
            description,
        };
        let state = Arc::new(SessionState {
            config,
            open: AtomicBool::new(true),
            staged: DashMap::new(),
            partials: DashMap::new(),
            completed_uploads: DashMap::new(),
            roots: DashMap::new(),
        });
        self.inner.sessions.insert(state.config.session_id, state.clone());
        Ok(Arc::new(MemoryBackupSession {
            database: self.inner.clone(),
            state,
        }))
    }

    async fn resume_backup(
        &self,
        session_id: Option<Uuid>,
        backup_date: Option<DateTime<Utc>>,
        discard_partial_files: bool,
    ) -> Result<Arc<dyn BackupSession>> {
        let state = if let Some(session_id) = session_id {
            self.inner
                .sessions
                .get(&session_id)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::SessionClosed(session_id.to_string()))?
        } else if let Some(backup_date) = backup_date {
            let backup_date = self.normalize(backup_date)?;
            self.inner
                .sessions
                .iter()
                .find(|entry| entry.value().config.backup_date == backup_date)
                .map(|entry| entry.value().clone())
                .ok_or_else(|| Error::NotFound(format!("backup date not found {backup_date}")))?
        } else {
            return Err(Error::InvalidArguments(
                "either session_id or backup_date must be specified but neither were".to_string(),
            ));
        };

        if discard_partial_files {
            state.partials.clear();
        }
        Ok(Arc::new(MemoryBackupSession {
            database: self.inner.clone(),
            state,
        }))
    }

    async fn list_backup_sessions(&self) -> Result<Vec<BackupSessionConfig>> {
        Ok(self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().config.clone())
            .collect())
    }

    async fn list_backups(&self) -> Result<Vec<(DateTime<Utc>, Option<String>)>> {
        Ok(self
            .inner
            .backups
            .lock()
            .unwrap()
            .values()
            .map(|backup| (backup.backup_date, backup.description.clone()))
            .collect())
    }

    async fn get_backup(&self, backup_date: Option<DateTime<Utc>>) -> Result<Option<Backup>> {
        let backups = self.inner.backups.lock().unwrap();
        match backup_date {
            Some(backup_date) => Ok(backups.get(&self.normalize(backup_date)?).cloned()),
            None => Ok(backups.values().next_back().cloned()),
        }
    }

    async fn get_directory(&self, inode: &Inode) -> Result<Directory> {
        if !inode.kind.is_directory() {
            return Err(Error::InvalidArguments(format!(
                "cannot open file type {} as a directory",
                inode.kind
            )));
        }
        let hash = inode
            .hash
            .ok_or_else(|| Error::InvalidArguments("directory inode has no hash".to_string()))?;
        let key = object_key(&hash, FileType::Directory);
        let bytes = self
            .inner
            .objects
            .get(&key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("no directory object {hash}")))?;
        serde_json_from_bytes(&bytes)
    }

    async fn get_file(&self, inode: &Inode) -> Result<FileReader> {
        if !matches!(
            inode.kind,
            FileType::Regular | FileType::Link | FileType::Pipe | FileType::Socket
        ) {
            return Err(Error::InvalidArguments(format!(
                "cannot read a file type {}",
                inode.kind
            )));
        }
        let hash = inode
            .hash
            .ok_or_else(|| Error::InvalidArguments("file inode has no hash".to_string()))?;
        let bytes = self
            .inner
            .objects
            .get(&hash.to_hex())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("no file object {hash}")))?;
        Ok(FileReader::from_bytes(bytes))
    }
}

fn serde_json_from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|err| Error::Internal(err.to_string()))
}

/// One staged backup session in memory.
pub struct MemoryBackupSession {
    database: Arc<MemoryDatabaseInner>,
    state: Arc<SessionState>,
}

impl MemoryBackupSession {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SessionClosed(self.state.config.session_id.to_string()))
        }
    }

    fn object_exists(&self, key: &str) -> bool {
        self.database.objects.contains_key(key) || self.state.staged.contains_key(key)
    }

    fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
        self.database.sessions.remove(&self.state.config.session_id);
        self.state.staged.clear();
        self.state.partials.clear();
        self.state.roots.clear();
    }
}

#[async_trait]
impl BackupSession for MemoryBackupSession {
    fn config(&self) -> &BackupSessionConfig {
        &self.state.config
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn directory_def(
        &self,
        definition: &Directory,
        replaces: Option<Uuid>,
    ) -> Result<DirectoryDefResponse> {
        self.ensure_open()?;
        let _ = replaces;
        for (name, child) in &definition.children {
            if child.hash.is_none() {
                return Err(Error::InvalidArguments(format!(
                    "child {name} has no hash value"
                )));
            }
        }

        let hashed = definition.ref_hash();
        let dir_key = object_key(&hashed.ref_hash, FileType::Directory);
        if self.object_exists(&dir_key) {
            return Ok(DirectoryDefResponse {
                ref_hash: Some(hashed.ref_hash),
                ..Default::default()
            });
        }

        let missing: Vec<String> = definition
            .children
            .iter()
            .filter(|(_, child)| {
                !self.object_exists(&object_key(&child.hash.expect("validated above"), child.kind))
            })
            .map(|(name, _)| name.clone())
            .collect();
        if !missing.is_empty() {
            return Ok(DirectoryDefResponse {
                ref_hash: None,
                missing_files: missing,
                missing_ref: Some(Uuid::new_v4()),
            });
        }

        self.state.staged.insert(dir_key, hashed.content.clone());
        Ok(DirectoryDefResponse {
            ref_hash: Some(hashed.ref_hash),
            ..Default::default()
        })
    }

    async fn upload_file_content(
        &self,
        mut content: FileReader,
        resume_id: Uuid,
        resume_from: u64,
        is_complete: bool,
    ) -> Result<Option<Digest>> {
        self.ensure_open()?;
        if self.state.completed_uploads.contains_key(&resume_id) {
            return Err(Error::AlreadyExists(format!(
                "resume id {resume_id} already completed"
            )));
        }

        let new_bytes = content.read_all().await?;
        let mut partial = self.state.partials.entry(resume_id).or_default();
        let buffer = partial.value_mut();
        // A resume past the end of the partial leaves a hole of zeros.
        buffer.resize(resume_from as usize, 0);
        buffer.extend_from_slice(&new_bytes);

        if !is_complete {
            return Ok(None);
        }

        let mut hasher = Hasher::new();
        hasher.update(buffer.as_slice());
        let digest = hasher.finalize();
        let bytes = Bytes::from(std::mem::take(buffer));
        drop(partial);

        self.state.partials.remove(&resume_id);
        self.state.completed_uploads.insert(resume_id, ());
        let key = digest.to_hex();
        if !self.object_exists(&key) {
            self.state.staged.insert(key, bytes);
        }
        Ok(Some(digest))
    }

    async fn add_root_dir(&self, name: &str, inode: &Inode) -> Result<()> {
        self.ensure_open()?;
        let hash = inode
            .hash
            .ok_or_else(|| Error::InvalidArguments(format!("root {name} has no hash value")))?;
        if !self.object_exists(&object_key(&hash, inode.kind)) {
            return Err(Error::InvalidArguments(format!(
                "cannot create {name} - does not exist: {hash}"
            )));
        }
        if self.state.roots.contains_key(name) {
            return Err(Error::AlreadyExists(format!("root {name}")));
        }
        self.state.roots.insert(name.to_string(), inode.clone());
        Ok(())
    }

    async fn check_file_upload_size(&self, resume_id: Uuid) -> Result<u64> {
        self.ensure_open()?;
        self.state
            .partials
            .get(&resume_id)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| Error::NotFound(format!("no partial upload {resume_id}")))
    }

    async fn complete(&self) -> Result<Backup> {
        self.ensure_open()?;

        let roots: BTreeMap<String, Inode> = self
            .state
            .roots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let client = &self.database.client_config;
        let backup = Backup {
            client_id: client.client_id,
            client_name: client.client_name.clone(),
            backup_date: self.state.config.backup_date,
            started: self.state.config.started,
            completed: Utc::now(),
            description: self.state.config.description.clone(),
            roots,
        };

        {
            let mut backups = self.database.backups.lock().unwrap();
            if !self.state.config.allow_overwrite
                && backups.contains_key(&self.state.config.backup_date)
            {
                return Err(Error::DuplicateBackup(format!(
                    "backup exists {}",
                    self.state.config.backup_date
                )));
            }

            // Promote staged objects; existing keys win.
            for entry in self.state.staged.iter() {
                self.database
                    .objects
                    .entry(entry.key().clone())
                    .or_insert_with(|| entry.value().clone());
            }
            backups.insert(self.state.config.backup_date, backup.clone());
        }

        self.close();
        Ok(backup)
    }

    async fn discard(&self) -> Result<()> {
        self.ensure_open()?;
        self.close();
        Ok(())
    }
}

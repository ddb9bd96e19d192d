//! Per-client server sessions and staged backup sessions over the local
//! database layout.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snapback_core::{
    Backup, BackupSession, BackupSessionConfig, ClientConfiguration, Digest, Directory,
    DirectoryDefResponse, DirectoryHash, Error, FileReader, FileType, Inode, READ_SIZE, Result,
    ServerSession, digest::Hasher, normalize_backup_date,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{CONFIG_FILE, LocalDatabase, object_key};

const BACKUPS_DIR: &str = "backup";
const SESSIONS_DIR: &str = "sessions";
const PARTIAL_DIR: &str = "partial";
const NEW_OBJECTS_DIR: &str = "new_objects";
const ROOTS_DIR: &str = "roots";

/// Backup manifest file names sort lexicographically in date order.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S.%6f";

/// Per-client view of a local database.
#[derive(Debug, Clone)]
pub struct LocalServerSession {
    database: LocalDatabase,
    client_path: PathBuf,
    client_config: ClientConfiguration,
}

impl LocalServerSession {
    pub(crate) async fn open(database: LocalDatabase, client_path: PathBuf) -> Result<Self> {
        let raw = tokio::fs::read(client_path.join(CONFIG_FILE))
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    Error::SessionClosed(format!("no such client at {}", client_path.display()))
                } else {
                    Error::Internal(err.to_string())
                }
            })?;
        let client_config = serde_json::from_slice(&raw)?;
        Ok(LocalServerSession {
            database,
            client_path,
            client_config,
        })
    }

    /// Persist an updated client configuration. Used by the admin tooling;
    /// clients themselves only read their configuration.
    pub async fn save_client_config(&mut self, client_config: ClientConfiguration) -> Result<()> {
        tokio::fs::write(
            self.client_path.join(CONFIG_FILE),
            serde_json::to_string_pretty(&client_config)?,
        )
        .await?;
        self.client_config = client_config;
        Ok(())
    }

    fn normalize(&self, backup_date: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(normalize_backup_date(
            backup_date,
            self.client_config.backup_granularity,
            self.client_config.timezone()?,
        ))
    }

    fn backups_path(&self) -> PathBuf {
        self.client_path.join(BACKUPS_DIR)
    }

    fn sessions_path(&self) -> PathBuf {
        self.client_path.join(SESSIONS_DIR)
    }

    fn path_for_backup_date(&self, backup_date: DateTime<Utc>) -> PathBuf {
        let name = format!("{}.json", backup_date.format(TIMESTAMP_FORMAT));
        self.backups_path().join(name)
    }

    fn path_for_session_id(&self, session_id: Uuid) -> PathBuf {
        self.sessions_path().join(session_id.to_string())
    }

    /// Write the committed manifest; exclusive-create is what enforces
    /// backup uniqueness under concurrent sessions.
    pub(crate) async fn write_backup_manifest(&self, backup: &Backup, overwrite: bool) -> Result<()> {
        let path = self.path_for_backup_date(backup.backup_date);
        tokio::fs::create_dir_all(self.backups_path()).await?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut file = options.open(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                Error::DuplicateBackup(format!("backup exists {}", backup.backup_date))
            } else {
                Error::from(err)
            }
        })?;
        file.write_all(serde_json::to_string_pretty(backup)?.as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl ServerSession for LocalServerSession {
    fn client_config(&self) -> &ClientConfiguration {
        &self.client_config
    }

    async fn start_backup(
        &self,
        backup_date: DateTime<Utc>,
        allow_overwrite: bool,
        description: Option<String>,
    ) -> Result<Arc<dyn BackupSession>> {
        let backup_date = self.normalize(backup_date)?;

        if !allow_overwrite && tokio::fs::try_exists(self.path_for_backup_date(backup_date)).await?
        {
            return Err(Error::DuplicateBackup(format!("backup exists {backup_date}")));
        }

        let session_id = Uuid::new_v4();
        let session_path = self.path_for_session_id(session_id);
        tokio::fs::create_dir_all(self.sessions_path()).await?;
        tokio::fs::create_dir(&session_path).await?;

        let config = BackupSessionConfig {
            client_id: self.client_config.client_id,
            session_id,
            backup_date,
            started: Utc::now(),
            allow_overwrite,
            description,
        };
        tokio::fs::write(
            session_path.join(CONFIG_FILE),
            serde_json::to_string_pretty(&config)?,
        )
        .await?;

        Ok(Arc::new(
            LocalBackupSession::open(self.clone(), session_path).await?,
        ))
    }

    async fn resume_backup(
        &self,
        session_id: Option<Uuid>,
        backup_date: Option<DateTime<Utc>>,
        discard_partial_files: bool,
    ) -> Result<Arc<dyn BackupSession>> {
        let session = if let Some(session_id) = session_id {
            let session_path = self.path_for_session_id(session_id);
            LocalBackupSession::open(self.clone(), session_path).await?
        } else if let Some(backup_date) = backup_date {
            // Linear scan; the list of open sessions is generally small.
            let backup_date = self.normalize(backup_date)?;
            let mut found = None;
            let mut entries = tokio::fs::read_dir(self.sessions_path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let session = LocalBackupSession::open(self.clone(), entry.path()).await?;
                if session.config().backup_date == backup_date {
                    found = Some(session);
                    break;
                }
            }
            found.ok_or_else(|| Error::NotFound(format!("backup date not found {backup_date}")))?
        } else {
            return Err(Error::InvalidArguments(
                "either session_id or backup_date must be specified but neither were".to_string(),
            ));
        };

        if discard_partial_files {
            session.discard_partial_files().await?;
        }
        Ok(Arc::new(session))
    }

    async fn list_backup_sessions(&self) -> Result<Vec<BackupSessionConfig>> {
        let mut results = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.sessions_path()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let raw = tokio::fs::read(entry.path().join(CONFIG_FILE)).await?;
            results.push(serde_json::from_slice(&raw)?);
        }
        Ok(results)
    }

    async fn list_backups(&self) -> Result<Vec<(DateTime<Utc>, Option<String>)>> {
        let mut results = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.backups_path()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(results),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let raw = tokio::fs::read(entry.path()).await?;
            let backup: Backup = serde_json::from_slice(&raw)?;
            results.push((backup.backup_date, backup.description));
        }
        results.sort_by_key(|(date, _)| *date);
        Ok(results)
    }

    async fn get_backup(&self, backup_date: Option<DateTime<Utc>>) -> Result<Option<Backup>> {
        let path = match backup_date {
            Some(backup_date) => self.path_for_backup_date(self.normalize(backup_date)?),
            None => {
                // Manifest names sort in date order; the latest is last.
                let mut names = Vec::new();
                let mut entries = match tokio::fs::read_dir(self.backups_path()).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        warn!(
                            "no backup found for {} ({})",
                            self.client_config.client_name, self.client_config.client_id
                        );
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    names.push(entry.path());
                }
                names.sort();
                match names.pop() {
                    Some(path) => path,
                    None => {
                        warn!(
                            "no backup found for {} ({})",
                            self.client_config.client_name, self.client_config.client_id
                        );
                        return Ok(None);
                    }
                }
            }
        };

        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
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
        let path = self
            .database
            .store_path_for(&object_key(&hash, FileType::Directory));
        let raw = tokio::fs::read(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("no directory object {hash}"))
            } else {
                Error::from(err)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
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
        let path = self.database.store_path_for(&hash.to_hex());
        let file = tokio::fs::File::open(&path).await.map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("no file object {hash}"))
            } else {
                Error::from(err)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok(FileReader::new(Box::new(file), Some(size)))
    }
}

/// One staged backup session on disk.
pub struct LocalBackupSession {
    server: LocalServerSession,
    session_path: PathBuf,
    config: BackupSessionConfig,
    /// Resume ids already finalised; reuse fails `already_exists`.
    completed_uploads: Mutex<HashSet<Uuid>>,
    /// Outstanding `missing_files` responses by their `missing_ref`.
    failed_attempts: Mutex<HashMap<Uuid, Digest>>,
}

impl LocalBackupSession {
    pub(crate) async fn open(server: LocalServerSession, session_path: PathBuf) -> Result<Self> {
        let raw = tokio::fs::read(session_path.join(CONFIG_FILE))
            .await
            .map_err(|_| {
                Error::SessionClosed(
                    session_path
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                )
            })?;
        let config = serde_json::from_slice(&raw)?;
        for sub in [PARTIAL_DIR, NEW_OBJECTS_DIR, ROOTS_DIR] {
            tokio::fs::create_dir_all(session_path.join(sub)).await?;
        }
        Ok(LocalBackupSession {
            server,
            session_path,
            config,
            completed_uploads: Mutex::new(HashSet::new()),
            failed_attempts: Mutex::new(HashMap::new()),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::SessionClosed(self.config.session_id.to_string()))
        }
    }

    fn partial_path(&self, resume_id: &Uuid) -> PathBuf {
        self.session_path.join(PARTIAL_DIR).join(resume_id.to_string())
    }

    fn staged_path(&self, key: &str) -> PathBuf {
        self.session_path.join(NEW_OBJECTS_DIR).join(key)
    }

    /// Present in the main store or in this session's staging area.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.server.database.store_path_for(key)).await?
            || tokio::fs::try_exists(self.staged_path(key)).await?)
    }

    pub(crate) async fn discard_partial_files(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(self.session_path.join(PARTIAL_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BackupSession for LocalBackupSession {
    fn config(&self) -> &BackupSessionConfig {
        &self.config
    }

    fn is_open(&self) -> bool {
        self.session_path.exists()
    }

    async fn directory_def(
        &self,
        definition: &Directory,
        replaces: Option<Uuid>,
    ) -> Result<DirectoryDefResponse> {
        self.ensure_open()?;
        for (name, child) in &definition.children {
            if child.hash.is_none() {
                return Err(Error::InvalidArguments(format!(
                    "child {name} has no hash value"
                )));
            }
        }
        if let Some(replaces) = replaces {
            self.failed_attempts.lock().unwrap().remove(&replaces);
        }

        let DirectoryHash { ref_hash, content } = definition.ref_hash();
        let dir_key = object_key(&ref_hash, FileType::Directory);
        if self.object_exists(&dir_key).await? {
            return Ok(DirectoryDefResponse {
                ref_hash: Some(ref_hash),
                ..Default::default()
            });
        }

        let mut missing = Vec::new();
        for (name, child) in &definition.children {
            let key = object_key(&child.hash.expect("validated above"), child.kind);
            if !self.object_exists(&key).await? {
                missing.push(name.clone());
            }
        }
        if !missing.is_empty() {
            let missing_ref = Uuid::new_v4();
            debug!(
                "directory {ref_hash} has {} missing children (attempt {missing_ref})",
                missing.len()
            );
            self.failed_attempts
                .lock()
                .unwrap()
                .insert(missing_ref, ref_hash);
            return Ok(DirectoryDefResponse {
                ref_hash: None,
                missing_files: missing,
                missing_ref: Some(missing_ref),
            });
        }

        // All children present: stage the directory blob.
        let tmp_path = self.partial_path(&Uuid::new_v4());
        tokio::fs::write(&tmp_path, &content).await?;
        if let Err(err) = tokio::fs::rename(&tmp_path, self.staged_path(&dir_key)).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(DirectoryDefResponse {
            ref_hash: Some(ref_hash),
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
        if self.completed_uploads.lock().unwrap().contains(&resume_id) {
            return Err(Error::AlreadyExists(format!(
                "resume id {resume_id} already completed"
            )));
        }

        let partial_path = self.partial_path(&resume_id);
        let mut partial = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&partial_path)
            .await?;

        let mut hasher = Hasher::new();
        if is_complete && resume_from > 0 {
            // Fold the bytes already on the server into the running digest.
            // A client may resume past the end of the partial; the hole
            // reads as zeros.
            partial.seek(SeekFrom::Start(0)).await?;
            let mut buf = vec![0u8; READ_SIZE];
            let mut remaining = resume_from;
            let mut at_eof = false;
            while remaining > 0 {
                let want = remaining.min(READ_SIZE as u64) as usize;
                let n = if at_eof {
                    0
                } else {
                    partial.read(&mut buf[..want]).await?
                };
                if n == 0 {
                    at_eof = true;
                    buf[..want].fill(0);
                    hasher.update(&buf[..want]);
                    remaining -= want as u64;
                } else {
                    hasher.update(&buf[..n]);
                    remaining -= n as u64;
                }
            }
        }

        partial.seek(SeekFrom::Start(resume_from)).await?;
        let mut position = resume_from;
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            let n = content.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if is_complete {
                hasher.update(&buf[..n]);
            }
            partial.write_all(&buf[..n]).await?;
            position += n as u64;
        }

        if !is_complete {
            partial.flush().await?;
            return Ok(None);
        }

        // Drop any stale tail a shorter resume left behind.
        partial.set_len(position).await?;
        partial.flush().await?;
        drop(partial);

        let digest = hasher.finalize();
        self.completed_uploads.lock().unwrap().insert(resume_id);
        if self.object_exists(&digest.to_hex()).await? {
            debug!("file already exists after upload {digest}");
            tokio::fs::remove_file(&partial_path).await?;
        } else {
            debug!("file upload complete {resume_id} as {digest}");
            tokio::fs::rename(&partial_path, self.staged_path(&digest.to_hex())).await?;
        }
        Ok(Some(digest))
    }

    async fn add_root_dir(&self, name: &str, inode: &Inode) -> Result<()> {
        self.ensure_open()?;
        let hash = inode
            .hash
            .ok_or_else(|| Error::InvalidArguments(format!("root {name} has no hash value")))?;
        if !self.object_exists(&object_key(&hash, inode.kind)).await? {
            return Err(Error::InvalidArguments(format!(
                "cannot create {name} - does not exist: {hash}"
            )));
        }
        let path = self.session_path.join(ROOTS_DIR).join(name);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists(format!("root {name}"))
                } else {
                    Error::from(err)
                }
            })?;
        file.write_all(serde_json::to_string(inode)?.as_bytes())
            .await?;
        file.flush().await?;
        Ok(())
    }

    async fn check_file_upload_size(&self, resume_id: Uuid) -> Result<u64> {
        self.ensure_open()?;
        match tokio::fs::metadata(self.partial_path(&resume_id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("no partial upload {resume_id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn complete(&self) -> Result<Backup> {
        self.ensure_open()?;
        let client = &self.server.client_config;
        info!(
            "committing {} for {} ({}) - {}",
            self.config.session_id, client.client_name, client.client_id, self.config.backup_date
        );

        // Promote staged objects, skipping keys another session already
        // committed. Rename-into-place keeps each promotion atomic.
        let mut entries = tokio::fs::read_dir(self.session_path.join(NEW_OBJECTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let key = entry.file_name().to_string_lossy().into_owned();
            let target = self.server.database.store_path_for(&key);
            if tokio::fs::try_exists(&target).await? {
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!("moving {key} to store");
            tokio::fs::rename(entry.path(), &target).await?;
        }

        let mut roots = std::collections::BTreeMap::new();
        let mut entries = tokio::fs::read_dir(self.session_path.join(ROOTS_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let raw = tokio::fs::read(entry.path()).await?;
            roots.insert(name, serde_json::from_slice(&raw)?);
        }

        let backup = Backup {
            client_id: client.client_id,
            client_name: client.client_name.clone(),
            backup_date: self.config.backup_date,
            started: self.config.started,
            completed: Utc::now(),
            description: self.config.description.clone(),
            roots,
        };
        self.server
            .write_backup_manifest(&backup, self.config.allow_overwrite)
            .await?;
        self.discard().await?;
        Ok(backup)
    }

    async fn discard(&self) -> Result<()> {
        self.ensure_open()?;
        tokio::fs::remove_dir_all(&self.session_path).await?;
        Ok(())
    }
}

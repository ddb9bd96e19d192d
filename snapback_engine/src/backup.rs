//! The client-side backup driver.
//!
//! Walks each configured root with bounded concurrency, produces directory
//! definitions, negotiates missing-file uploads with the session, and emits
//! root inodes. Two orthogonal shortcuts are supported: comparing metadata
//! against the previous backup instead of re-reading content, and
//! prescanning the whole tree before uploading anything instead of
//! committing leaf-first as the scan goes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use snapback_core::{
    Backup, BackupSession, ClientConfiguredBackupDirectory, Digest, Directory, DirectoryExplorer,
    Error, FileSystemExplorer, Inode, Result, ServerSession,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sync::{FairSemaphore, gather_all_or_nothing};

/// Default cap on concurrent open files and in-flight hashes.
const DEFAULT_CONCURRENCY: usize = 10;

/// One scanned directory; in full-prescan mode the children's results are
/// kept so the upload pass can recurse without touching the disk again.
struct ScanResult {
    definition: Directory,
    child_scan_results: Option<HashMap<String, ScanResult>>,
}

/// The per-child outcome of a scan task.
enum ChildOutcome {
    /// Scan-side failure already logged; drop the child from the listing.
    Omit(String),
    /// A file's content digest.
    File(String, Digest),
    /// A subdirectory committed leaf-first; only its hash is retained.
    Dir(String, Digest),
    /// A subdirectory prescanned for a later upload pass.
    Prescan(String, ScanResult),
}

pub struct BackupController {
    server_session: Arc<dyn ServerSession>,
    backup_session: Arc<dyn BackupSession>,
    explorer: Arc<dyn FileSystemExplorer>,
    /// Compare against the previous backup instead of treating every file
    /// as new.
    pub read_last_backup: bool,
    /// Reuse the previous backup's digest for children whose metadata is
    /// unchanged. Cheap, but misses content changes that leave metadata
    /// intact.
    pub match_meta_only: bool,
    /// Walk the whole tree before uploading anything, then upload from the
    /// root down. Fewer requests, more memory.
    pub full_prescan: bool,
    semaphore: FairSemaphore,
}

impl BackupController {
    pub fn new(
        server_session: Arc<dyn ServerSession>,
        backup_session: Arc<dyn BackupSession>,
        explorer: Arc<dyn FileSystemExplorer>,
    ) -> Self {
        BackupController {
            server_session,
            backup_session,
            explorer,
            read_last_backup: true,
            match_meta_only: true,
            full_prescan: false,
            // LIFO funnels the tree exploration depth-first.
            semaphore: FairSemaphore::new(DEFAULT_CONCURRENCY, false),
        }
    }

    /// Back up every configured root. On any error out of the scan/upload
    /// graph the session is discarded before the error propagates.
    pub async fn backup_all(self: &Arc<Self>) -> Result<()> {
        match self.backup_all_roots().await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("backup failed: {err}; discarding session");
                if self.backup_session.is_open()
                    && let Err(discard_err) = self.backup_session.discard().await
                {
                    warn!("could not discard session: {discard_err}");
                }
                Err(err)
            }
        }
    }

    async fn backup_all_roots(self: &Arc<Self>) -> Result<()> {
        let backup_roots = self.server_session.client_config().backup_directories.clone();

        let last_backup = if self.read_last_backup {
            let last_backup = self.server_session.get_backup(None).await?;
            match &last_backup {
                None => warn!("no previous backup found; every file will be read and hashed"),
                Some(_) => {
                    info!("comparing metadata to last backup; unchanged files are not re-read")
                }
            }
            last_backup
        } else {
            info!("ignoring last backup, will hash every file");
            None
        };

        // Roots are scanned one at a time; each scan is internally
        // parallel, and keeping this loop sequential makes failures easier
        // to attribute.
        for (name, scan_spec) in &backup_roots {
            self.backup_root(name, scan_spec, last_backup.as_ref()).await?;
        }
        Ok(())
    }

    async fn backup_root(
        self: &Arc<Self>,
        root_name: &str,
        scan_spec: &ClientConfiguredBackupDirectory,
        last_backup: Option<&Backup>,
    ) -> Result<()> {
        info!("backing up '{root_name}' ({})", scan_spec.base_path);
        let last_backup_root = last_backup.and_then(|backup| backup.roots.get(root_name)).cloned();
        if last_backup.is_some() && last_backup_root.is_none() {
            warn!("root '{root_name}' not in last backup");
        }

        let explorer: Arc<dyn DirectoryExplorer> =
            Arc::from(self.explorer.open_root(&scan_spec.base_path, &scan_spec.filters)?);
        let root_hash = self.backup_directory(explorer.clone(), last_backup_root).await?;
        let mut root_inode = explorer.inode().await?;
        root_inode.hash = Some(root_hash);
        self.backup_session.add_root_dir(root_name, &root_inode).await?;
        info!("done backing up '{root_name}'");
        Ok(())
    }

    /// Back up one directory, returning its ref hash. In leaf-first mode
    /// the whole subtree is committed to the session by the time this
    /// returns.
    async fn backup_directory(
        self: &Arc<Self>,
        explorer: Arc<dyn DirectoryExplorer>,
        last_backup: Option<Inode>,
    ) -> Result<Digest> {
        let last_backup_hash = last_backup.as_ref().and_then(|inode| inode.hash);
        let scan = self.scan_directory(explorer.clone(), last_backup).await?;
        let current_hash = scan.definition.ref_hash().ref_hash;
        if last_backup_hash == Some(current_hash) {
            // The server already holds an exact copy of this subtree.
            debug!("skipping {}, directory not changed", explorer.get_path(None));
            return Ok(current_hash);
        }
        self.upload_directory(explorer, scan).await
    }

    fn scan_directory<'a>(
        self: &'a Arc<Self>,
        explorer: Arc<dyn DirectoryExplorer>,
        last_backup: Option<Inode>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<ScanResult>> + Send + 'a>> {
        Box::pin(async move {
        // Enumerate and spawn child work while holding a permit; hashing
        // and recursion re-acquire their own.
        let (mut children, tasks) = {
            let _permit = self.semaphore.acquire().await;

            let last_backup_children = match (&last_backup, self.read_last_backup) {
                (Some(last), true) => {
                    self.server_session.get_directory(last).await?.children
                }
                _ => BTreeMap::new(),
            };

            let mut children: BTreeMap<String, Inode> = BTreeMap::new();
            let mut tasks = Vec::new();
            let mut child_stream = explorer.iter_children().await?;
            while let Some((name, mut child_inode)) = child_stream.next().await {
                if child_inode.hash.is_some() {
                    // Hard-linked duplicate the explorer already knows.
                    children.insert(name, child_inode);
                    continue;
                }

                if child_inode.kind.is_directory() {
                    let child_explorer: Arc<dyn DirectoryExplorer> =
                        Arc::from(explorer.get_child(&name));
                    let child_last = last_backup_children.get(&name).cloned();
                    let controller = self.clone();
                    children.insert(name.clone(), child_inode);
                    if self.full_prescan {
                        // Scan the entire tree now, upload in a second pass.
                        tasks.push(tokio::spawn(async move {
                            let scan =
                                controller.scan_directory(child_explorer, child_last).await?;
                            Ok(ChildOutcome::Prescan(name, scan))
                        }));
                    } else {
                        // Back up one directory at a time, scanning and
                        // uploading as we go; no scan state is retained.
                        tasks.push(tokio::spawn(async move {
                            let hash =
                                controller.backup_directory(child_explorer, child_last).await?;
                            Ok(ChildOutcome::Dir(name, hash))
                        }));
                    }
                } else {
                    if self.match_meta_only
                        && let Some(previous) = last_backup_children.get(&name)
                        && child_inode.metadata_matches(previous)
                    {
                        child_inode.hash = previous.hash;
                    }
                    if child_inode.hash.is_none() {
                        let controller = self.clone();
                        let child_explorer = explorer.clone();
                        let child_name = name.clone();
                        tasks.push(tokio::spawn(async move {
                            Ok(controller.hash_file(child_explorer, child_name).await)
                        }));
                    }
                    children.insert(name, child_inode);
                }
            }
            (children, tasks)
        };

        let mut child_scan_results = self.full_prescan.then(HashMap::new);
        for outcome in gather_all_or_nothing(tasks).await? {
            match outcome {
                ChildOutcome::Omit(name) => {
                    children.remove(&name);
                }
                ChildOutcome::File(name, hash) | ChildOutcome::Dir(name, hash) => {
                    if let Some(child) = children.get_mut(&name) {
                        child.hash = Some(hash);
                    }
                }
                ChildOutcome::Prescan(name, scan) => {
                    if let Some(child) = children.get_mut(&name) {
                        child.hash = Some(scan.definition.ref_hash().ref_hash);
                    }
                    child_scan_results
                        .as_mut()
                        .expect("prescan outcome only in full_prescan mode")
                        .insert(name, scan);
                }
            }
        }

        Ok(ScanResult {
            definition: Directory { children },
            child_scan_results,
        })
        })
    }

    /// Hash one file through the explorer. Scan-side failures (permission
    /// denied, file disappeared, broken link) are logged and the child is
    /// omitted; they do not abort the backup.
    async fn hash_file(
        self: Arc<Self>,
        explorer: Arc<dyn DirectoryExplorer>,
        name: String,
    ) -> ChildOutcome {
        let _permit = self.semaphore.acquire().await;
        debug!("hashing {}", explorer.get_path(Some(&name)));
        match explorer.hash_child(&name).await {
            Ok(hash) => ChildOutcome::File(name, hash),
            Err(err) => {
                error!("could not scan {}: {err}", explorer.get_path(Some(&name)));
                ChildOutcome::Omit(name)
            }
        }
    }

    /// Submit a directory definition, repairing a `missing_files` response
    /// by uploading the missing children and retrying once.
    fn upload_directory<'a>(
        self: &'a Arc<Self>,
        explorer: Arc<dyn DirectoryExplorer>,
        mut scan: ScanResult,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Digest>> + Send + 'a>> {
        Box::pin(async move {
        debug!("uploading directory {}", explorer.get_path(None));
        let response = {
            let _permit = self.semaphore.acquire().await;
            self.backup_session.directory_def(&scan.definition, None).await?
        };
        if response.success() {
            let ref_hash = response
                .ref_hash
                .unwrap_or_else(|| scan.definition.ref_hash().ref_hash);
            debug!("server accepted directory {} as {ref_hash}", explorer.get_path(None));
            return Ok(ref_hash);
        }

        debug!(
            "{} missing files in {}",
            response.missing_files.len(),
            explorer.get_path(None)
        );
        let mut upload_tasks = Vec::new();
        for missing_file in &response.missing_files {
            let child = scan.definition.children.get(missing_file).ok_or_else(|| {
                Error::Protocol(format!(
                    "server reported unknown missing file {missing_file:?}"
                ))
            })?;

            if child.kind.is_directory() {
                // Only possible in full-prescan mode; leaf-first recursion
                // has already committed every subdirectory.
                let child_scan = scan
                    .child_scan_results
                    .as_mut()
                    .and_then(|scans| scans.remove(missing_file))
                    .ok_or_else(|| {
                        Error::Protocol(format!(
                            "server does not have directory {} which should have been uploaded already",
                            explorer.get_path(Some(missing_file))
                        ))
                    })?;
                let controller = self.clone();
                let child_explorer: Arc<dyn DirectoryExplorer> =
                    Arc::from(explorer.get_child(missing_file));
                let name = missing_file.clone();
                upload_tasks.push(tokio::spawn(async move {
                    let hash = controller.upload_directory(child_explorer, child_scan).await?;
                    Ok((name, Some(hash)))
                }));
            } else {
                let controller = self.clone();
                let child_explorer = explorer.clone();
                let name = missing_file.clone();
                let expected = child.hash;
                upload_tasks.push(tokio::spawn(async move {
                    let uploaded = controller
                        .upload_file(child_explorer, &name, expected)
                        .await?;
                    Ok((name, uploaded))
                }));
            }
        }

        for (name, uploaded) in gather_all_or_nothing(upload_tasks).await? {
            match uploaded {
                Some(hash) => {
                    if let Some(child) = scan.definition.children.get_mut(&name) {
                        child.hash = Some(hash);
                    }
                }
                // Vanished between stat and read; drop it from the
                // definition rather than fail the whole backup.
                None => {
                    scan.definition.children.remove(&name);
                }
            }
        }

        // Retry, telling the server which failed attempt this replaces.
        let response = {
            let _permit = self.semaphore.acquire().await;
            self.backup_session
                .directory_def(&scan.definition, response.missing_ref)
                .await?
        };
        if !response.success() {
            return Err(Error::Protocol(format!(
                "files disappeared server-side while backup is in progress; \
                 this must not happen or the backup will be corrupted: {:?}",
                response.missing_files
            )));
        }
        let ref_hash = response
            .ref_hash
            .unwrap_or_else(|| scan.definition.ref_hash().ref_hash);
        debug!("server accepted directory {} as {ref_hash}", explorer.get_path(None));
        Ok(ref_hash)
        })
    }

    /// Upload one file the server reported missing. Returns `None` when the
    /// file disappeared before it could be read.
    async fn upload_file(
        self: &Arc<Self>,
        explorer: Arc<dyn DirectoryExplorer>,
        name: &str,
        expected: Option<Digest>,
    ) -> Result<Option<Digest>> {
        let file_path = explorer.get_path(Some(name));
        info!("uploading {file_path}");
        let _permit = self.semaphore.acquire().await;

        let content = match explorer.open_child(name).await {
            Ok(content) => content,
            Err(Error::NotFound(_)) => {
                error!("file disappeared before it could be uploaded: {file_path}");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let resume_id = Uuid::new_v4();
        let new_hash = self
            .backup_session
            .upload_file_content(content, resume_id, 0, true)
            .await?
            .ok_or_else(|| {
                Error::InvalidResponse("completed upload returned no digest".to_string())
            })?;

        if expected != Some(new_hash) {
            warn!(
                "calculated hash for {file_path} ({resume_id}) was {expected:?} but the server \
                 computed {new_hash}; did the file content change?"
            );
        }
        debug!("uploaded {file_path} - {new_hash}");
        Ok(Some(new_hash))
    }
}

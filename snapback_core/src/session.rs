//! The abstract session interface and filesystem capability traits.
//!
//! A database backend (local filesystem, remote transport) implements
//! `ServerSession` and `BackupSession`; a filesystem implementation exposes
//! `DirectoryExplorer`. The backup and restore drivers are written purely
//! against these traits.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use uuid::Uuid;

use crate::{
    Backup, BackupSessionConfig, ClientConfiguration, Digest, Directory, DirectoryDefResponse,
    FileType, Inode, Result,
};

/// A readable handle on file content with a known size where one exists.
///
/// Pipes and sockets have no meaningful size, hence the `Option`. The reader
/// yields the link target bytes for symlinks; links are never followed.
pub struct FileReader {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    size: Option<u64>,
}

impl FileReader {
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, size: Option<u64>) -> Self {
        FileReader { reader, size }
    }

    /// A reader over an in-memory buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        FileReader {
            reader: Box::new(std::io::Cursor::new(bytes)),
            size: Some(size),
        }
    }

    /// The empty reader, used for pipes, sockets and device nodes.
    pub fn empty() -> Self {
        FileReader {
            reader: Box::new(std::io::Cursor::new(Bytes::new())),
            size: Some(0),
        }
    }

    /// Size of the underlying content, if the source knows it.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Drain the reader to EOF and return everything it produced.
    pub async fn read_all(&mut self) -> std::io::Result<Bytes> {
        let mut buf = Vec::with_capacity(self.size.unwrap_or(0) as usize);
        self.reader.read_to_end(&mut buf).await?;
        Ok(buf.into())
    }
}

impl AsyncRead for FileReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl std::fmt::Debug for FileReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReader").field("size", &self.size).finish()
    }
}

/// Lazy, finite, non-restartable sequence of `(name, inode)` pairs.
pub type ChildStream = BoxStream<'static, (String, Inode)>;

/// Per-attribute toggles for metadata restoration.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaRestoreToggles {
    pub uid: bool,
    pub gid: bool,
    pub mode: bool,
    pub modified_time: bool,
}

/// Per-directory cursor over a filesystem tree.
///
/// One explorer is attached to one directory; `get_child` descends, carrying
/// the matching filter sub-tree with it.
#[async_trait]
pub trait DirectoryExplorer: Send + Sync {
    /// Enumerate children, applying exclusion filters and patterns.
    ///
    /// Inodes for non-directory entries carry full metadata; `hash` is
    /// populated only when the explorer can infer it (a hard-linked
    /// duplicate already hashed). Unreadable children are logged and
    /// skipped; they do not abort the enumeration.
    async fn iter_children(&self) -> Result<ChildStream>;

    /// An explorer over the named subdirectory.
    fn get_child(&self, name: &str) -> Box<dyn DirectoryExplorer>;

    /// Open a child for reading according to its file type: file bytes for
    /// regular files, the target path bytes for links (not followed), an
    /// empty reader for everything else.
    async fn open_child(&self, name: &str) -> Result<FileReader>;

    /// The inode of the directory itself.
    async fn inode(&self) -> Result<Inode>;

    /// Create the named child during restore. `content` is `None` for
    /// directories. Clobbering a directory with a non-directory is refused.
    async fn restore_child(
        &self,
        name: &str,
        kind: FileType,
        content: Option<&mut FileReader>,
        clobber: bool,
    ) -> Result<()>;

    /// Apply the toggled metadata attributes of `inode` to the named child.
    async fn restore_meta(
        &self,
        name: &str,
        inode: &Inode,
        toggles: MetaRestoreToggles,
    ) -> Result<()>;

    /// Stream the named child's content through SHA-256 and return the
    /// digest. Implementations may reuse a cached digest for hard-linked
    /// duplicates so the same bytes are never hashed twice.
    async fn hash_child(&self, name: &str) -> Result<Digest> {
        let mut reader = self.open_child(name).await?;
        Ok(Digest::from_reader(&mut reader).await?)
    }

    /// A printable identifier for logs and diagnostics only.
    fn get_path(&self, child: Option<&str>) -> String;
}

/// Factory for explorers; one call per backup root or restore target.
pub trait FileSystemExplorer: Send + Sync {
    /// Open an explorer over `base_path` with the given filter rules
    /// compiled in.
    fn open_root(
        &self,
        base_path: &str,
        filters: &[crate::Filter],
    ) -> Result<Box<dyn DirectoryExplorer>>;
}

/// A transactional staging area for one in-progress backup.
#[async_trait]
pub trait BackupSession: Send + Sync {
    /// The immutable settings of this session.
    fn config(&self) -> &BackupSessionConfig;

    /// Initially true; false once the session completes or is discarded.
    /// Every operation on a closed session fails `session_closed`.
    fn is_open(&self) -> bool;

    /// Submit a directory definition. Fails `invalid_arguments` when any
    /// child hash is null. Children whose blobs are absent are reported in
    /// `missing_files` together with a fresh `missing_ref`; the caller
    /// uploads them and retries with `replaces` set to pair the attempts.
    async fn directory_def(
        &self,
        definition: &Directory,
        replaces: Option<Uuid>,
    ) -> Result<DirectoryDefResponse>;

    /// Upload file content, or part of it, into the partial file named by
    /// `resume_id`. With `is_complete` the partial is finalised: bytes
    /// `[0, resume_from)` already on the server are folded into the running
    /// digest (holes read as zeros), the new bytes are appended, and the
    /// result lands in staging under its digest, which is returned.
    ///
    /// Callers MUST serialise calls per `resume_id` and MUST NOT reuse a
    /// `resume_id` after successful completion.
    async fn upload_file_content(
        &self,
        content: FileReader,
        resume_id: Uuid,
        resume_from: u64,
        is_complete: bool,
    ) -> Result<Option<Digest>>;

    /// Record a named root. The referenced object must already exist in
    /// staging or the main store.
    async fn add_root_dir(&self, name: &str, inode: &Inode) -> Result<()>;

    /// Bytes currently in the partial for `resume_id`. Fails `not_found`
    /// once the upload completed or if it was never started; callers use
    /// that to detect that an interrupted final request in fact finished.
    async fn check_file_upload_size(&self, resume_id: Uuid) -> Result<u64>;

    /// Promote staged objects into the store, write the backup manifest and
    /// discard the session. The backup becomes visible to other sessions
    /// only at this point.
    async fn complete(&self) -> Result<Backup>;

    /// Delete this partial backup entirely. Cannot be undone.
    async fn discard(&self) -> Result<()>;
}

/// Per-client view of a backup database.
#[async_trait]
pub trait ServerSession: Send + Sync {
    fn client_config(&self) -> &ClientConfiguration;

    /// Open a staging session for a new backup. The date is normalised to
    /// the client's granularity; an existing committed backup at that date
    /// fails `duplicate_backup` unless `allow_overwrite`.
    async fn start_backup(
        &self,
        backup_date: DateTime<Utc>,
        allow_overwrite: bool,
        description: Option<String>,
    ) -> Result<std::sync::Arc<dyn BackupSession>>;

    /// Retrieve an open session by id, or by normalised backup date when no
    /// id is given. `discard_partial_files` purges every partial upload
    /// before returning.
    async fn resume_backup(
        &self,
        session_id: Option<Uuid>,
        backup_date: Option<DateTime<Utc>>,
        discard_partial_files: bool,
    ) -> Result<std::sync::Arc<dyn BackupSession>>;

    /// The open sessions, with full details; this list is generally small.
    async fn list_backup_sessions(&self) -> Result<Vec<BackupSessionConfig>>;

    /// Completed backups as `(date, description)`; the full manifests can
    /// stack up large, so only the keys are returned.
    async fn list_backups(&self) -> Result<Vec<(DateTime<Utc>, Option<String>)>>;

    /// A completed backup manifest, the latest one when no date is given.
    async fn get_backup(&self, backup_date: Option<DateTime<Utc>>) -> Result<Option<Backup>>;

    /// Read a directory object. Fails `invalid_arguments` when the inode is
    /// not a directory.
    async fn get_directory(&self, inode: &Inode) -> Result<Directory>;

    /// Open a file object for reading.
    async fn get_file(&self, inode: &Inode) -> Result<FileReader>;
}

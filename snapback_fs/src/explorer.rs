//! Local-disk implementation of the `DirectoryExplorer` capability set.
//!
//! One `LocalFileSystemExplorer` is shared across all roots of a backup so
//! the hard-link cache spans the whole scan: the first time a given
//! `(device, inode)` pair is hashed, every later occurrence reuses the
//! digest instead of re-reading the file. Directories are never cached;
//! POSIX does not allow hard links to them.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use glob::Pattern;
use snapback_core::{
    ChildStream, Digest, DirectoryExplorer, Error, FileReader, FileSystemExplorer, FileType,
    Filter, Inode, MetaRestoreToggles, Result,
};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::filter::{FilterView, normalize_filters};

type InodeKey = (u64, u64);

/// Factory for local-disk directory explorers.
///
/// Holds the process-wide hard-link state; hand the same instance to every
/// root of one backup run.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystemExplorer {
    inode_cache: Arc<DashMap<InodeKey, Inode>>,
    hash_jobs: Arc<DashMap<InodeKey, Arc<OnceCell<Digest>>>>,
}

impl LocalFileSystemExplorer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystemExplorer for LocalFileSystemExplorer {
    fn open_root(&self, base_path: &str, filters: &[Filter]) -> Result<Box<dyn DirectoryExplorer>> {
        let path = PathBuf::from(base_path);
        if !path.is_absolute() {
            return Err(Error::InvalidArguments(format!(
                "root path is not absolute: {base_path}"
            )));
        }
        let (patterns, tree) = normalize_filters(filters)?;
        Ok(Box::new(LocalDirectoryExplorer {
            path,
            filter: FilterView::root(tree),
            patterns: Arc::new(patterns),
            inode_cache: self.inode_cache.clone(),
            hash_jobs: self.hash_jobs.clone(),
        }))
    }
}

/// Cursor over one local directory.
pub struct LocalDirectoryExplorer {
    path: PathBuf,
    filter: FilterView,
    patterns: Arc<Vec<Pattern>>,
    inode_cache: Arc<DashMap<InodeKey, Inode>>,
    hash_jobs: Arc<DashMap<InodeKey, Arc<OnceCell<Digest>>>>,
}

impl LocalDirectoryExplorer {
    fn child_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    async fn open_by_type(&self, path: &Path, kind: FileType) -> Result<FileReader> {
        match kind {
            FileType::Regular => {
                let file = tokio::fs::File::open(path).await?;
                let size = file.metadata().await?.len();
                Ok(FileReader::new(Box::new(file), Some(size)))
            }
            FileType::Link => {
                // The link itself, never the file it points at.
                let target = tokio::fs::read_link(path).await?;
                Ok(FileReader::from_bytes(target.as_os_str().as_bytes().to_vec()))
            }
            FileType::Directory => Err(Error::InvalidArguments(format!(
                "cannot open a directory for content: {}",
                path.display()
            ))),
            // Pipes, sockets and device nodes carry no content. Opening a
            // fifo for reading would block until a writer appears.
            _ => Ok(FileReader::empty()),
        }
    }
}

#[async_trait::async_trait]
impl DirectoryExplorer for LocalDirectoryExplorer {
    async fn iter_children(&self) -> Result<ChildStream> {
        struct IterState {
            read_dir: tokio::fs::ReadDir,
            dir_path: PathBuf,
            filter: FilterView,
            patterns: Arc<Vec<Pattern>>,
            inode_cache: Arc<DashMap<InodeKey, Inode>>,
        }

        let state = IterState {
            read_dir: tokio::fs::read_dir(&self.path).await?,
            dir_path: self.path.clone(),
            filter: self.filter.clone(),
            patterns: self.patterns.clone(),
            inode_cache: self.inode_cache.clone(),
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                let entry = match st.read_dir.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => return None,
                    Err(err) => {
                        warn!("error listing {}: {err}", st.dir_path.display());
                        return None;
                    }
                };

                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(name) => {
                        warn!(
                            "skipping non-UTF-8 name {name:?} in {}",
                            st.dir_path.display()
                        );
                        continue;
                    }
                };

                if st.patterns.iter().any(|pattern| pattern.matches(&name)) {
                    debug!("skipping {} (pattern excluded)", st.dir_path.join(&name).display());
                    continue;
                }
                if st.filter.child_excluded(&name) {
                    debug!("skipping {} (excluded)", st.dir_path.join(&name).display());
                    continue;
                }

                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(err) => {
                        warn!("could not stat {}: {err}", st.dir_path.join(&name).display());
                        continue;
                    }
                };

                let inode = if meta.is_dir() {
                    Inode::from_metadata(&meta, None)
                } else {
                    use std::os::unix::fs::MetadataExt;
                    let key = (meta.dev(), meta.ino());
                    match st.inode_cache.get(&key) {
                        Some(cached) => {
                            debug!(
                                "reusing hard-linked inode for {}",
                                st.dir_path.join(&name).display()
                            );
                            Ok(cached.value().clone())
                        }
                        None => Inode::from_metadata(&meta, None),
                    }
                };
                match inode {
                    Ok(inode) => return Some(((name, inode), st)),
                    Err(err) => {
                        warn!("skipping {}: {err}", st.dir_path.join(&name).display());
                        continue;
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn get_child(&self, name: &str) -> Box<dyn DirectoryExplorer> {
        Box::new(LocalDirectoryExplorer {
            path: self.child_path(name),
            filter: self.filter.descend(name),
            patterns: self.patterns.clone(),
            inode_cache: self.inode_cache.clone(),
            hash_jobs: self.hash_jobs.clone(),
        })
    }

    async fn open_child(&self, name: &str) -> Result<FileReader> {
        let path = self.child_path(name);
        let meta = tokio::fs::symlink_metadata(&path).await?;
        let inode = Inode::from_metadata(&meta, None)?;
        self.open_by_type(&path, inode.kind).await
    }

    async fn inode(&self) -> Result<Inode> {
        if self.filter.fully_excluded() {
            // Distinguished marker for a root whose filters exclude
            // everything; nothing about the real directory is read.
            return Ok(Inode {
                modified_time: chrono::DateTime::UNIX_EPOCH,
                kind: FileType::Directory,
                mode: 0,
                size: 0,
                uid: 0,
                gid: 0,
                hash: None,
            });
        }
        let meta = tokio::fs::symlink_metadata(&self.path).await?;
        Inode::from_metadata(&meta, None)
    }

    async fn hash_child(&self, name: &str) -> Result<Digest> {
        use std::os::unix::fs::MetadataExt;

        let path = self.child_path(name);
        let meta = tokio::fs::symlink_metadata(&path).await?;
        if meta.is_dir() {
            return Err(Error::InvalidArguments(format!(
                "cannot hash a directory: {}",
                path.display()
            )));
        }

        let key = (meta.dev(), meta.ino());
        if let Some(cached) = self.inode_cache.get(&key)
            && let Some(hash) = cached.hash
        {
            debug!("reusing hard-linked digest for {}", path.display());
            return Ok(hash);
        }

        // Single-flight per (device, inode): concurrent hard-linked
        // siblings wait for the first hash instead of re-reading.
        let cell = self
            .hash_jobs
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let inode = Inode::from_metadata(&meta, None)?;
        let kind = inode.kind;
        let digest = *cell
            .get_or_try_init(|| async {
                debug!("hashing {}", path.display());
                let mut reader = self.open_by_type(&path, kind).await?;
                Ok::<_, Error>(Digest::from_reader(&mut reader).await?)
            })
            .await?;

        self.inode_cache.insert(
            key,
            Inode {
                hash: Some(digest),
                ..inode
            },
        );
        Ok(digest)
    }

    async fn restore_child(
        &self,
        name: &str,
        kind: FileType,
        content: Option<&mut FileReader>,
        clobber: bool,
    ) -> Result<()> {
        let path = self.child_path(name);
        let existing = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => Some(meta),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if kind == FileType::Directory {
            match existing {
                Some(meta) if meta.is_dir() => return Ok(()),
                Some(_) if clobber => {
                    tokio::fs::remove_file(&path).await?;
                }
                Some(_) => {
                    return Err(Error::AlreadyExists(format!("{} exists", path.display())));
                }
                None => {}
            }
            tokio::fs::create_dir(&path).await?;
            return Ok(());
        }

        match existing {
            Some(meta) if meta.is_dir() => {
                return Err(Error::InvalidArguments(format!(
                    "refusing to replace directory {} with a {kind}",
                    path.display()
                )));
            }
            Some(_) if clobber => {
                tokio::fs::remove_file(&path).await?;
            }
            Some(_) => {
                return Err(Error::AlreadyExists(format!("{} exists", path.display())));
            }
            None => {}
        }

        match kind {
            FileType::Regular => {
                let content = content.ok_or_else(|| {
                    Error::InvalidArguments("regular file restore needs content".to_string())
                })?;
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await?;
                tokio::io::copy(&mut *content, &mut file).await?;
                file.flush().await?;
            }
            FileType::Link => {
                let content = content.ok_or_else(|| {
                    Error::InvalidArguments("link restore needs the target path".to_string())
                })?;
                let target = content.read_all().await?;
                let target = std::ffi::OsStr::from_bytes(&target).to_os_string();
                tokio::fs::symlink(&target, &path).await?;
            }
            FileType::Pipe => {
                mkfifo(&path).await?;
            }
            FileType::Socket | FileType::CharacterDevice | FileType::BlockDevice => {
                // These cannot be recreated from a backup (sockets are
                // meaningless without their process, device nodes need
                // privileges); their metadata is all the backup holds.
                warn!("not restoring {kind} {}", path.display());
            }
            FileType::Directory => unreachable!("handled above"),
        }
        Ok(())
    }

    async fn restore_meta(
        &self,
        name: &str,
        inode: &Inode,
        toggles: MetaRestoreToggles,
    ) -> Result<()> {
        let path = self.child_path(name);

        if toggles.uid || toggles.gid {
            let uid = if toggles.uid { inode.uid } else { libc::uid_t::MAX };
            let gid = if toggles.gid { inode.gid } else { libc::gid_t::MAX };
            let chown_path = path.clone();
            tokio::task::spawn_blocking(move || lchown(&chown_path, uid, gid))
                .await
                .map_err(|err| Error::Internal(err.to_string()))??;
        }

        // Symlink permissions are fixed on Linux; skip rather than chmod the
        // link target.
        if toggles.mode && inode.kind != FileType::Link {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(inode.mode)).await?;
        }

        if toggles.modified_time {
            let times_path = path.clone();
            let secs = inode.modified_time.timestamp();
            let nanos = inode.modified_time.timestamp_subsec_nanos();
            tokio::task::spawn_blocking(move || set_file_times(&times_path, secs, nanos))
                .await
                .map_err(|err| Error::Internal(err.to_string()))??;
        }
        Ok(())
    }

    fn get_path(&self, child: Option<&str>) -> String {
        match child {
            Some(child) => self.child_path(child).display().to_string(),
            None => self.path.display().to_string(),
        }
    }
}

fn c_path(path: &Path) -> std::io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

fn lchown(path: &Path, uid: libc::uid_t, gid: libc::gid_t) -> std::io::Result<()> {
    let cpath = c_path(path)?;
    let rc = unsafe { libc::lchown(cpath.as_ptr(), uid, gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn set_file_times(path: &Path, secs: i64, nanos: u32) -> std::io::Result<()> {
    let cpath = c_path(path)?;
    let ts = libc::timespec {
        tv_sec: secs,
        tv_nsec: nanos as libc::c_long,
    };
    let times = [ts, ts];
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            cpath.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

async fn mkfifo(path: &Path) -> Result<()> {
    let cpath = c_path(path)?;
    tokio::task::spawn_blocking(move || {
        let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o666) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    })
    .await
    .map_err(|err| Error::Internal(err.to_string()))?
    .map_err(Error::from)
}

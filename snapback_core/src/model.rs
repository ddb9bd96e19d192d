//! Wire-stable data model: inodes, directories, backups and configuration.
//!
//! The canonical serialised form of a `Directory` defines its identity in
//! the object store, so everything in this module that derives `Serialize`
//! is part of the protocol. Field order in the JSON output follows struct
//! declaration order; map keys are lexicographically sorted by `BTreeMap`.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Digest, Error, Result};

/// File type codes as stored in directory blobs.
///
/// Content is stored only for `Regular`, `Link` (the target path bytes) and
/// `Pipe`/`Socket` (empty). Device nodes are represented by metadata only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "f")]
    Regular,
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "c")]
    CharacterDevice,
    #[serde(rename = "b")]
    BlockDevice,
    #[serde(rename = "s")]
    Socket,
    #[serde(rename = "p")]
    Pipe,
    #[serde(rename = "l")]
    Link,
}

impl FileType {
    pub fn is_directory(self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// True for types whose content bytes are read from the filesystem.
    /// Pipes, sockets and device nodes all store the empty blob.
    pub fn reads_content(self) -> bool {
        matches!(self, FileType::Regular | FileType::Link)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileType::Regular => "regular",
            FileType::Directory => "directory",
            FileType::CharacterDevice => "character_device",
            FileType::BlockDevice => "block_device",
            FileType::Socket => "socket",
            FileType::Pipe => "pipe",
            FileType::Link => "link",
        };
        f.write_str(name)
    }
}

/// A single entry in a directory listing.
///
/// `hash` is the digest of the referenced object and is `None` during
/// scanning, before the child has been hashed or uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub modified_time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: FileType,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub hash: Option<Digest>,
}

impl Inode {
    /// Build an inode from filesystem metadata (not following symlinks).
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata, hash: Option<Digest>) -> Result<Inode> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let ft = meta.file_type();
        let kind = if ft.is_file() {
            FileType::Regular
        } else if ft.is_dir() {
            FileType::Directory
        } else if ft.is_symlink() {
            FileType::Link
        } else if ft.is_fifo() {
            FileType::Pipe
        } else if ft.is_socket() {
            FileType::Socket
        } else if ft.is_char_device() {
            FileType::CharacterDevice
        } else if ft.is_block_device() {
            FileType::BlockDevice
        } else {
            return Err(Error::InvalidArguments(format!(
                "no file type for mode {:o}",
                meta.mode()
            )));
        };

        let modified_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|err| Error::Internal(format!("mtime unavailable: {err}")))?;

        Ok(Inode {
            modified_time,
            kind,
            // Permission bits only; the type is explicit.
            mode: meta.mode() & 0o7777,
            size: meta.len(),
            uid: meta.uid(),
            gid: meta.gid(),
            hash,
        })
    }

    /// The metadata fast path: true iff every field except `hash` is equal.
    pub fn metadata_matches(&self, other: &Inode) -> bool {
        self.modified_time == other.modified_time
            && self.kind == other.kind
            && self.mode == other.mode
            && self.size == other.size
            && self.uid == other.uid
            && self.gid == other.gid
    }
}

/// The digest of a directory's canonical form together with the bytes that
/// produced it, so callers never hash one rendering and store another.
#[derive(Debug, Clone)]
pub struct DirectoryHash {
    pub ref_hash: Digest,
    pub content: Bytes,
}

/// A directory listing: file name to inode.
///
/// The canonical serialised form (compact JSON, keys sorted) is the
/// directory's identity in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Directory {
    pub children: BTreeMap<String, Inode>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonical bytes: compact JSON, UTF-8, no trailing newline.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Serialising a BTreeMap of plain structs cannot fail.
        serde_json::to_vec(self).expect("directory serialisation is infallible")
    }

    /// Digest of the canonical form; this is the directory's identity.
    pub fn ref_hash(&self) -> DirectoryHash {
        let content = self.canonical_bytes();
        DirectoryHash {
            ref_hash: Digest::new(&content),
            content: content.into(),
        }
    }
}

/// A committed backup manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub client_id: Uuid,
    pub client_name: String,
    pub backup_date: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub description: Option<String>,
    pub roots: BTreeMap<String, Inode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Include,
    Exclude,
    PatternExclude,
}

/// One include/exclude/pattern rule. A bare `"."` path targets the root of
/// the configured directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub filter_type: FilterType,
    pub path: String,
}

impl Filter {
    pub fn new(filter_type: FilterType, path: impl Into<String>) -> Self {
        Filter {
            filter_type,
            path: path.into(),
        }
    }
}

/// One configured backup root on a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfiguredBackupDirectory {
    pub base_path: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

/// Client configuration is stored on the server so it can be centrally
/// managed; clients read it to discover what to back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfiguration {
    pub client_id: Uuid,

    /// Friendly name for the client, useful for logging.
    pub client_name: String,

    /// Backup granularity in seconds. Typically one day or one hour.
    #[serde(default = "default_backup_granularity")]
    pub backup_granularity: u64,

    /// IANA timezone name the granularity boundary is computed in.
    #[serde(default = "default_named_timezone")]
    pub named_timezone: String,

    #[serde(default)]
    pub backup_directories: BTreeMap<String, ClientConfiguredBackupDirectory>,
}

fn default_backup_granularity() -> u64 {
    86_400
}

fn default_named_timezone() -> String {
    "Etc/UTC".to_string()
}

impl ClientConfiguration {
    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.named_timezone.parse().map_err(|_| {
            Error::InvalidArguments(format!("unknown timezone {:?}", self.named_timezone))
        })
    }

    /// Render a backup date in the client's timezone for display.
    pub fn date_string(&self, date: DateTime<Utc>) -> String {
        match self.timezone() {
            Ok(tz) => date.with_timezone(&tz).to_rfc3339(),
            Err(_) => date.to_rfc3339(),
        }
    }
}

/// Immutable settings of one backup session, fixed at `start_backup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSessionConfig {
    pub client_id: Uuid,
    pub session_id: Uuid,
    pub backup_date: DateTime<Utc>,
    pub started: DateTime<Utc>,
    pub allow_overwrite: bool,
    pub description: Option<String>,
}

/// Server reply to `directory_def`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryDefResponse {
    /// Set on success; the directory's identity in the store.
    pub ref_hash: Option<Digest>,

    /// Names (not paths) of children whose blobs are absent from the store.
    /// The client must upload these and retry.
    #[serde(default)]
    pub missing_files: Vec<String>,

    /// Server-side reference to this failed attempt. The client passes it
    /// back as `replaces` so the server can pair the retry with the attempt
    /// it repairs. Does not change with content, but may change per request.
    pub missing_ref: Option<Uuid>,
}

impl DirectoryDefResponse {
    /// If there were no missing files the definition succeeded. This
    /// structure is not used to report errors.
    pub fn success(&self) -> bool {
        self.missing_files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_inode(hash: Option<Digest>) -> Inode {
        Inode {
            modified_time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            kind: FileType::Regular,
            mode: 0o644,
            size: 11,
            uid: 1000,
            gid: 1000,
            hash,
        }
    }

    #[test]
    fn empty_directory_canonical_form_is_pinned() {
        let dir = Directory::new();
        assert_eq!(dir.canonical_bytes(), b"{}");
        assert_eq!(
            dir.ref_hash().ref_hash.to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn directory_canonical_form_is_stable() {
        let mut dir = Directory::new();
        dir.children.insert(
            "test.txt".to_string(),
            sample_inode(Some(Digest::new(b"Hello World"))),
        );

        let expected = concat!(
            r#"{"test.txt":{"modified_time":"2024-01-02T03:04:05Z","type":"f","#,
            r#""mode":420,"size":11,"uid":1000,"gid":1000,"#,
            r#""hash":"a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"}}"#
        );
        assert_eq!(dir.canonical_bytes(), expected.as_bytes());
        assert_eq!(
            dir.ref_hash().ref_hash.to_hex(),
            "a36a851bad3d2a54fb059a38e46ba1194b1d813671caea6750710e1123a36b70"
        );

        // Key order is sorted, not insertion order.
        let mut reordered = Directory::new();
        reordered
            .children
            .insert("b".to_string(), sample_inode(Some(Digest::EMPTY)));
        reordered
            .children
            .insert("a".to_string(), sample_inode(Some(Digest::EMPTY)));
        let bytes = reordered.canonical_bytes();
        let a = bytes.windows(4).position(|w| w == &b"\"a\":"[..]).unwrap();
        let b = bytes.windows(4).position(|w| w == &b"\"b\":"[..]).unwrap();
        assert!(a < b);
    }

    #[test]
    fn directory_digest_is_a_function_of_content() {
        let mut one = Directory::new();
        one.children
            .insert("x".to_string(), sample_inode(Some(Digest::EMPTY)));
        let mut two = Directory::new();
        two.children
            .insert("x".to_string(), sample_inode(Some(Digest::EMPTY)));
        assert_eq!(one.ref_hash().ref_hash, two.ref_hash().ref_hash);

        two.children.get_mut("x").unwrap().size = 12;
        assert_ne!(one.ref_hash().ref_hash, two.ref_hash().ref_hash);
    }

    #[test]
    fn metadata_matches_ignores_hash() {
        let scanned = sample_inode(None);
        let previous = sample_inode(Some(Digest::EMPTY));
        assert!(scanned.metadata_matches(&previous));

        let mut touched = previous.clone();
        touched.size += 1;
        assert!(!scanned.metadata_matches(&touched));
    }

    #[test]
    fn file_type_codes_round_trip() {
        for (kind, code) in [
            (FileType::Regular, "\"f\""),
            (FileType::Directory, "\"d\""),
            (FileType::CharacterDevice, "\"c\""),
            (FileType::BlockDevice, "\"b\""),
            (FileType::Socket, "\"s\""),
            (FileType::Pipe, "\"p\""),
            (FileType::Link, "\"l\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), code);
            let back: FileType = serde_json::from_str(code).unwrap();
            assert_eq!(back, kind);
        }
    }
}

//! Core snapback protocol types and traits.
//!
//! This crate defines the shared types and traits used by all snapback
//! crates.
//!
//! ## Protocol types (wire-stable)
//!
//! The following are on-the-wire / on-disk formats shared by every database
//! backend and client:
//!
//! - Content digests (`digest::Digest`, lowercase hex SHA-256)
//! - Inodes, directories and their canonical serialised form
//!   (`model::Inode`, `model::Directory`)
//! - Backup manifests and client/session configuration
//!   (`model::Backup`, `model::ClientConfiguration`,
//!   `model::BackupSessionConfig`)
//! - The closed error taxonomy and its wire envelope
//!   (`error::Error`, `error::RemoteError`)
//!
//! Either side of a connection can hash the same content and the result MUST
//! match, so the digest and the directory codec are absolutely part of the
//! protocol; changes to them are protocol changes.
//!
//! ## Capability traits (non-wire)
//!
//! The `ServerSession` / `BackupSession` pair is the abstract session
//! interface every database backend implements (local filesystem, remote
//! transports). `DirectoryExplorer` is the capability set a filesystem
//! implementation exposes to the backup and restore drivers.

pub mod digest;
pub mod error;
pub mod model;
pub mod session;
pub mod time;

// --- Core Public Surface ---

// Content addressing
pub use digest::{Digest, Hasher};

// Data model
pub use model::{
    Backup, BackupSessionConfig, ClientConfiguration, ClientConfiguredBackupDirectory, Directory,
    DirectoryDefResponse, DirectoryHash, FileType, Filter, FilterType, Inode,
};

// Errors
pub use error::{Error, RemoteError, Result};

// Session & explorer capability traits
pub use session::{
    BackupSession, ChildStream, DirectoryExplorer, FileReader, FileSystemExplorer,
    MetaRestoreToggles, ServerSession,
};

// Date normalisation
pub use time::normalize_backup_date;

/// Chunk size for streaming file content and hashing.
pub const READ_SIZE: usize = 1024 * 1024;

//! Local filesystem access for snapback.
//!
//! This crate implements the `DirectoryExplorer` capability set over a local
//! disk: filter compilation, lazy directory enumeration with a hard-link
//! inode cache, content readers per file type, and the restore primitives.

pub mod explorer;
pub mod filter;

pub use explorer::{LocalDirectoryExplorer, LocalFileSystemExplorer};
pub use filter::{FilterNode, FilterView, normalize_filters};

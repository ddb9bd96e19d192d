//! Backup and restore drivers.
//!
//! `BackupController` walks configured roots through a `DirectoryExplorer`
//! and feeds a `BackupSession`; `RestoreController` does the reverse. Both
//! are written purely against the traits in `snapback_core`, so any
//! database backend and any filesystem implementation plug in.

pub mod backup;
pub mod restore;
pub mod sync;

pub use backup::BackupController;
pub use restore::RestoreController;
pub use sync::{FairSemaphore, SemaphorePermit, gather_all_or_nothing};

pub mod backup;
pub mod catalog;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod fmtsize;
pub mod index;
pub mod remote;
pub mod restore;
mod retention;
pub mod safe;
mod walk;

#[cfg(test)]
mod testutil;

pub use backup::BackupSummary;
pub use catalog::Backup;
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use index::{BackupKind, FileEntry, FileKind, Index, Previous};
pub use remote::{BlobReader, BlobWrite, Remote};
pub use restore::RestoreOptions;

//! Enumerating and resolving backups at the remote.

use crate::engine::Engine;
use crate::index::BackupKind;
use crate::{Error, Result};

const FULL_SUFFIX: &str = ".index1.full";
const INCR_SUFFIX: &str = ".index1.incr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub name: String,
    pub kind: BackupKind,
}

impl Backup {
    pub fn index_object(&self) -> String {
        format!("{}.index1.{}", self.name, self.kind.suffix())
    }

    pub fn data_object(&self) -> String {
        format!("{}.data", self.name)
    }
}

impl Engine {
    /// All backups at the remote, sorted ascending by name. Names are
    /// timestamps, so lexical order is chronological order.
    pub async fn list_backups(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        for name in self.remote().list().await? {
            if let Some(stem) = name.strip_suffix(FULL_SUFFIX) {
                backups.push(Backup {
                    name: stem.to_string(),
                    kind: BackupKind::Full,
                });
            } else if let Some(stem) = name.strip_suffix(INCR_SUFFIX) {
                backups.push(Backup {
                    name: stem.to_string(),
                    kind: BackupKind::Incremental,
                });
            }
        }
        backups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(backups)
    }

    /// Resolve a backup by name; `"latest"` means the most recent one.
    pub async fn find_backup(&self, name: &str) -> Result<Backup> {
        let backups = self.list_backups().await?;
        if name == "latest" {
            return backups.into_iter().next_back().ok_or(Error::NotFound);
        }
        backups
            .into_iter()
            .find(|b| b.name == name)
            .ok_or(Error::NotFound)
    }

    /// The backup and its predecessors up to and including the enclosing
    /// full backup, newest first.
    pub async fn backup_chain(&self, name: &str) -> Result<Vec<Backup>> {
        let backups = self.list_backups().await?;
        let mut last_full = None;
        for (i, b) in backups.iter().enumerate() {
            if b.kind == BackupKind::Full {
                last_full = Some(i);
            }
            if b.name == name || (name == "latest" && i == backups.len() - 1) {
                let full = last_full.ok_or(Error::NotFound)?;
                return Ok(backups[full..=i].iter().rev().cloned().collect());
            }
        }
        Err(Error::NotFound)
    }
}

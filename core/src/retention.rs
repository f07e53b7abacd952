//! Pruning of old backups after a successful publish.

use crate::catalog::Backup;
use crate::engine::Engine;
use crate::index::BackupKind;
use crate::Result;
use tracing::{debug, warn};

impl Engine {
    /// Apply the retention policy: walking the catalog newest-first and
    /// counting fulls, once `full_keep` fulls are seen everything older is
    /// deleted; once `incremental_for_full_keep` fulls are seen only older
    /// incrementals are deleted. A zero value disables that knob. Deletion
    /// failures are logged and do not fail the backup. Applying the policy
    /// twice is a no-op.
    pub async fn apply_retention(&self) -> Result<()> {
        let mut backups = self.list_backups().await?;

        if self.config().full_keep > 0 {
            let mut fulls_seen = 0;
            for i in (1..backups.len()).rev() {
                if backups[i].kind != BackupKind::Full {
                    continue;
                }
                fulls_seen += 1;
                if fulls_seen < self.config().full_keep {
                    continue;
                }
                for b in &backups[..i] {
                    debug!("cleaning up old backup {}", b.name);
                    self.delete_backup(b).await;
                }
                backups.drain(..i);
                break;
            }
        }

        if self.config().incremental_for_full_keep > 0 {
            let mut fulls_seen = 0;
            for i in (1..backups.len()).rev() {
                if backups[i].kind != BackupKind::Full {
                    continue;
                }
                fulls_seen += 1;
                if fulls_seen < self.config().incremental_for_full_keep {
                    continue;
                }
                for b in &backups[..i] {
                    if b.kind != BackupKind::Incremental {
                        continue;
                    }
                    debug!("cleaning up old incremental backup {}", b.name);
                    self.delete_backup(b).await;
                }
                break;
            }
        }
        Ok(())
    }

    async fn delete_backup(&self, backup: &Backup) {
        if let Err(e) = self.remote().delete(&backup.data_object()).await {
            warn!("removing old backup: {}", e);
        }
        if let Err(e) = self.remote().delete(&backup.index_object()).await {
            warn!("removing old backup: {}", e);
        }
    }
}

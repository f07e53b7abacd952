//! The snapshot writer: walk the source tree, diff against the previous
//! snapshot, stream payloads into a new data blob and atomically publish the
//! index.

use crate::catalog::Backup;
use crate::counter::CountingWriter;
use crate::engine::Engine;
use crate::fmtsize::format_size;
use crate::index::{BackupKind, FileEntry, FileKind, Index, Previous};
use crate::remote::{BlobWrite, Remote};
use crate::safe::SafeWriter;
use crate::walk::{Filter, Walker};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct BackupSummary {
    pub name: String,
    pub kind: BackupKind,
    /// Paths recorded in the snapshot, directories included.
    pub files: u64,
    /// Payload bytes, before the codec.
    pub payload_bytes: u64,
    /// Bytes written to the remote for data blob plus index.
    pub stored_bytes: u64,
    pub added: usize,
    pub deleted: usize,
}

struct Earlier {
    prev: Previous,
    used: bool,
}

impl Engine {
    /// Take a snapshot of `dir` and publish it under `name`. Whether the
    /// snapshot is full or incremental follows from `incrementals_per_full`
    /// and the chain of the latest backup. Runs retention afterwards.
    pub async fn backup(&self, dir: &Path, name: &str) -> Result<BackupSummary> {
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| source_err(dir, e))?;
        if !meta.is_dir() {
            return Err(Error::Config(format!(
                "can only back up directories, {} is not one",
                dir.display()
            )));
        }
        let filter = Filter::new(&self.config().include, &self.config().exclude)?;

        // Decide full or incremental, loading the predecessor index if the
        // chain after the last full is still short enough.
        let mut predecessor = None;
        if self.config().incrementals_per_full > 0 {
            match self.backup_chain("latest").await {
                Ok(chain) => {
                    if chain.len() - 1 < self.config().incrementals_per_full as usize {
                        let backup = chain.into_iter().next().expect("chain is never empty");
                        let oidx = self.read_index(&backup).await?;
                        predecessor = Some((backup, oidx));
                    }
                }
                Err(Error::NotFound) => {} // first backup, do a full
                Err(e) => return Err(e),
            }
        }

        // Paths of half-written remote objects. The signal task owns a copy
        // for SIGINT/SIGTERM cleanup; the error path below cleans up the
        // same set before surfacing the error.
        let (paths_tx, paths_rx) = mpsc::unbounded_channel::<String>();
        spawn_cleanup_task(self.remote().clone(), paths_rx);
        let mut partials: Vec<String> = Vec::new();

        let result = self
            .write_snapshot(dir, name, filter, predecessor, &paths_tx, &mut partials)
            .await;

        match result {
            Ok(summary) => {
                drop(paths_tx);
                if self.config().full_keep > 0 || self.config().incremental_for_full_keep > 0 {
                    self.apply_retention().await?;
                }
                Ok(summary)
            }
            Err(e) => {
                for path in &partials {
                    if let Err(derr) = self.remote().delete(path).await {
                        warn!("cleaning up partial remote path {}: {}", path, derr);
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_snapshot(
        &self,
        dir: &Path,
        name: &str,
        filter: Filter,
        predecessor: Option<(Backup, Index)>,
        paths_tx: &mpsc::UnboundedSender<String>,
        partials: &mut Vec<String>,
    ) -> Result<BackupSummary> {
        let incremental = predecessor.is_some();

        // Unconsumed predecessor entries become the delete list; sorted so
        // the published index is deterministic.
        let mut unseen: BTreeMap<String, FileEntry> = BTreeMap::new();
        let mut earliers: Vec<Earlier> = Vec::new();
        if let Some((backup, oidx)) = &predecessor {
            for f in &oidx.contents {
                unseen.insert(f.name.clone(), f.clone());
            }
            earliers = oidx
                .previous
                .iter()
                .map(|p| Earlier {
                    prev: p.clone(),
                    used: false,
                })
                .collect();
            earliers.push(Earlier {
                prev: Previous {
                    kind: backup.kind,
                    name: backup.name.clone(),
                    data_size: oidx.data_size,
                },
                used: false,
            });
        }

        let mut register = |path: &str| {
            let _ = paths_tx.send(path.to_string());
            partials.push(path.to_string());
        };

        let data_path = format!("{}.data", name);
        let writer = self.remote().create(&data_path).await?;
        register(&data_path);
        let counter = CountingWriter::new(writer);
        let mut data = SafeWriter::new(counter, &self.config().passphrase).await?;

        let mut nidx = Index::default();
        let mut data_offset: i64 = 0;
        let mut nfiles: u64 = 0;

        for item in Walker::new(dir, filter) {
            let (path, mut nf) = item?;
            nfiles += 1;

            if incremental {
                if let Some(of) = unseen.remove(&nf.name) {
                    if !file_changed(&of, &nf) {
                        if nf.kind != FileKind::Directory {
                            // Inherit the payload. The previous index still
                            // points into the predecessor's list; renumbered
                            // below once we know which slots stay.
                            nf.data_offset = of.data_offset;
                            let slot = if of.previous_index >= 0 {
                                of.previous_index as usize
                            } else {
                                earliers.len() - 1
                            };
                            nf.previous_index = slot as i64;
                            earliers[slot].used = true;
                        }
                        nidx.contents.push(nf);
                        continue;
                    }
                } else {
                    debug!("new file {}", nf.name);
                    nidx.add.push(nf.name.clone());
                }
            } else {
                debug!("storing {}", nf.name);
            }

            if nf.kind == FileKind::Directory {
                nidx.contents.push(nf);
                continue;
            }

            nf.data_offset = data_offset;
            match nf.kind {
                FileKind::Symlink => {
                    let target = tokio::fs::read_link(&path)
                        .await
                        .map_err(|e| source_err(&path, e))?;
                    let buf = target.as_os_str().as_bytes();
                    data.write(buf).await?;
                    nf.size = buf.len() as i64;
                }
                FileKind::Regular => {
                    store(&path, nf.size, &mut data).await?;
                }
                FileKind::Directory => unreachable!(),
            }
            data_offset += nf.size;
            nidx.contents.push(nf);
        }

        if incremental {
            // Keep only the previous entries some file still references and
            // renumber the contents accordingly.
            let mut renumber: HashMap<i64, i64> = HashMap::new();
            for (i, e) in earliers.iter().enumerate() {
                if e.used {
                    renumber.insert(i as i64, nidx.previous.len() as i64);
                    nidx.previous.push(e.prev.clone());
                }
            }
            for f in &mut nidx.contents {
                if f.previous_index >= 0 {
                    f.previous_index = renumber[&f.previous_index];
                }
            }
            nidx.delete = unseen.into_keys().collect();
        }

        data.finish().await?;
        nidx.data_size = data.get_ref().written();
        let data_wire = nidx.data_size;

        let kind = if incremental {
            BackupKind::Incremental
        } else {
            BackupKind::Full
        };
        let index_path = format!("{}.index1.{}", name, kind.suffix());
        let tmp_path = format!("{}.tmp", index_path);
        let writer = self.remote().create(&tmp_path).await?;
        register(&tmp_path);
        let counter = CountingWriter::new(writer);
        let mut index_writer = SafeWriter::new(counter, &self.config().passphrase).await?;
        index_writer
            .write(crate::index::serialize(&nidx).as_bytes())
            .await?;
        index_writer.finish().await?;
        let index_wire = index_writer.get_ref().written();

        // The rename is the commit point: the snapshot exists once the
        // final index name is listable. Clear the cleanup set right away so
        // a late signal cannot delete what was just published.
        self.remote().rename(&tmp_path, &index_path).await?;
        let _ = paths_tx.send(String::new());
        partials.clear();

        let summary = BackupSummary {
            name: name.to_string(),
            kind,
            files: nfiles,
            payload_bytes: data_offset as u64,
            stored_bytes: data_wire + index_wire,
            added: nidx.add.len(),
            deleted: nidx.delete.len(),
        };
        let add_del = if incremental {
            format!(", +{} files, -{} files", summary.added, summary.deleted)
        } else {
            String::new()
        };
        info!(
            "new {} backup: {}",
            if incremental { "incremental" } else { "full" },
            name
        );
        info!(
            "total files {}, total size {}, backup size {}{}",
            summary.files,
            format_size(summary.payload_bytes),
            format_size(summary.stored_bytes),
            add_del
        );
        Ok(summary)
    }
}

/// The differ's notion of change. Content is never hashed; a file with the
/// same kind, size, whole-second mtime, permissions and ownership is
/// considered unchanged.
fn file_changed(old: &FileEntry, new: &FileEntry) -> bool {
    debug_assert_eq!(old.name, new.name);
    old.kind != new.kind
        || old.size != new.size
        || old.mtime != new.mtime
        || old.permissions != new.permissions
        || old.user != new.user
        || old.group != new.group
}

/// Copy a regular file into the data stream, verifying it still has the
/// size the walker saw.
async fn store<W: BlobWrite>(path: &Path, size: i64, data: &mut SafeWriter<W>) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| source_err(path, e))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut written: i64 = 0;
    loop {
        let n = file.read(&mut buf).await.map_err(|e| source_err(path, e))?;
        if n == 0 {
            break;
        }
        data.write(&buf[..n]).await?;
        written += n as i64;
    }
    if written != size {
        return Err(source_err(
            path,
            std::io::Error::other(format!(
                "expected to write {} bytes, wrote {}",
                size, written
            )),
        ));
    }
    Ok(())
}

fn source_err(path: &Path, e: std::io::Error) -> Error {
    Error::Source {
        path: path.to_path_buf(),
        source: e,
    }
}

/// Watches for SIGINT/SIGTERM during a backup and best-effort-deletes the
/// registered partial paths. The main task communicates only through the
/// channel: a path registers it, an empty string clears the set, closing
/// the channel ends the task. A second signal during cleanup exits
/// immediately.
fn spawn_cleanup_task(remote: Arc<dyn Remote>, mut paths_rx: mpsc::UnboundedReceiver<String>) {
    tokio::spawn(async move {
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            warn!("cannot install signal handlers, no cleanup on interrupt");
            return;
        };
        let mut paths: Vec<String> = Vec::new();
        loop {
            tokio::select! {
                path = paths_rx.recv() => match path {
                    Some(path) if path.is_empty() => paths.clear(),
                    Some(path) => paths.push(path),
                    None => return,
                },
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
            }
        }
        let cleanup = futures::future::join_all(paths.into_iter().map(|path| {
            let remote = remote.clone();
            async move {
                info!("cleaning up remote path {}", path);
                if let Err(e) = remote.delete(&path).await {
                    warn!("failed to clean up remote path: {}", e);
                }
            }
        }));
        tokio::select! {
            _ = cleanup => {}
            _ = sigint.recv() => warn!("signal while cleaning up, quitting"),
            _ = sigterm.recv() => warn!("signal while cleaning up, quitting"),
        }
        std::process::exit(1);
    });
}

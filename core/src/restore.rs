//! Reconstructing a snapshot into a destination directory.
//!
//! The planner groups the wanted files by the data blob that holds their
//! payload; the executor fetches those blobs with three parallel workers,
//! each streaming through its blob once in offset order.

use crate::counter::CountingReader;
use crate::engine::Engine;
use crate::index::{FileEntry, FileKind, Index, Previous};
use crate::remote::Remote;
use crate::safe::SafeReader;
use crate::walk::match_any;
use crate::{Error, Result};
use filetime::FileTime;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct RestoreOptions {
    /// Suppress the progress meter and the non-root ownership warning.
    pub quiet: bool,
}

/// Files to restore out of one previous snapshot's data blob.
struct WorkItem {
    previous: Previous,
    files: Vec<FileEntry>,
}

struct Plan {
    items: Vec<WorkItem>,
    /// Every directory in the snapshot, in walk order, carrying the
    /// permissions and times to restore.
    dirs: Vec<FileEntry>,
    /// Directories that must exist in the destination: matched directories
    /// plus all ancestors of matched files.
    need_dirs: HashSet<String>,
    /// Wire bytes that will be fetched, for the progress meter.
    fetch_size: u64,
    payload_size: u64,
    nfiles: usize,
}

/// Group the selected files by the previous entry holding their payload.
/// `idx.previous` must already carry the synthetic trailing entry for the
/// snapshot's own data blob. Work items are ordered by first appearance.
fn plan_restore(idx: &Index, patterns: &[Regex]) -> Plan {
    let mut plan = Plan {
        items: Vec::new(),
        dirs: Vec::new(),
        need_dirs: HashSet::new(),
        fetch_size: 0,
        payload_size: 0,
        nfiles: 0,
    };
    let mut by_previous: HashMap<usize, usize> = HashMap::new();

    for f in &idx.contents {
        if f.kind == FileKind::Directory {
            plan.dirs.push(f.clone());
        }
        if !patterns.is_empty() && !match_any(patterns, &f.name) {
            continue;
        }
        if f.kind == FileKind::Directory {
            plan.need_dirs.insert(f.name.clone());
            continue;
        }

        let mut dir = parent_dir(&f.name);
        loop {
            plan.need_dirs.insert(dir.clone());
            if dir == "." {
                break;
            }
            dir = parent_dir(&dir);
        }

        let slot = if f.previous_index >= 0 {
            f.previous_index as usize
        } else {
            idx.previous.len() - 1
        };
        let item = match by_previous.get(&slot) {
            Some(&i) => i,
            None => {
                by_previous.insert(slot, plan.items.len());
                plan.fetch_size += idx.previous[slot].data_size;
                plan.items.push(WorkItem {
                    previous: idx.previous[slot].clone(),
                    files: Vec::new(),
                });
                plan.items.len() - 1
            }
        };
        plan.items[item].files.push(f.clone());
        plan.payload_size += f.size as u64;
        plan.nfiles += 1;
    }
    plan
}

fn parent_dir(name: &str) -> String {
    match name.rfind('/') {
        Some(i) => name[..i].to_string(),
        None => ".".to_string(),
    }
}

impl Engine {
    /// Restore snapshot `name` ("latest" for the most recent) into `target`.
    /// With a non-empty `patterns` list only matching paths are restored,
    /// though parent directories of matches are always created.
    pub async fn restore(
        &self,
        name: &str,
        target: &Path,
        patterns: &[String],
        opts: &RestoreOptions,
    ) -> Result<()> {
        let mut regexps = Vec::new();
        for p in patterns {
            regexps
                .push(Regex::new(p).map_err(|e| Error::Config(format!("bad pattern {:?}: {}", p, e)))?);
        }

        let backup = self.find_backup(name).await?;
        let as_root = nix::unistd::geteuid().is_root();
        if !as_root && !opts.quiet {
            warn!("not running as root, not restoring user/group file ownership");
        }
        info!("restoring {} to {}", backup.name, target.display());

        let mut idx = self.read_index(&backup).await?;
        // Extend previous with the snapshot itself so its own data blob can
        // be addressed like any other.
        idx.previous.push(Previous {
            kind: backup.kind,
            name: backup.name.clone(),
            data_size: idx.data_size,
        });
        let plan = plan_restore(&idx, &regexps);
        info!(
            "restoring {} dirs and {} files totalling {}, fetching {} for {} backup parts",
            plan.dirs.len(),
            plan.nfiles,
            crate::fmtsize::format_size(plan.payload_size),
            crate::fmtsize::format_size(plan.fetch_size),
            plan.items.len()
        );

        tokio::fs::create_dir_all(target).await?;

        // All needed directories exist before any file is restored, so
        // workers never race against missing parents.
        for d in &plan.dirs {
            if d.name != "." && plan.need_dirs.contains(&d.name) {
                let mut builder = std::fs::DirBuilder::new();
                builder.mode(d.permissions);
                builder.create(target.join(&d.name))?;
            }
        }

        let owners = Arc::new(OwnerCache::new(as_root));
        let nitems = plan.items.len();

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(nitems.max(1));
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::channel::<Result<()>>(nitems + 1);
        let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel::<usize>();

        let mut workers = Vec::new();
        for _ in 0..3 {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let transfer_tx = transfer_tx.clone();
            let remote = self.remote().clone();
            let passphrase = self.config().passphrase.clone();
            let target = target.to_path_buf();
            let owners = owners.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = { work_rx.lock().await.recv().await };
                    let Some(item) = item else { break };
                    let result = restore_item(
                        remote.as_ref(),
                        &passphrase,
                        &target,
                        &owners,
                        transfer_tx.clone(),
                        item,
                    )
                    .await;
                    if done_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);
        drop(transfer_tx);

        // Seed the queue with the first and last items before the middle:
        // they tend to be the big ones and should overlap with the tail.
        let mut items = plan.items;
        if !items.is_empty() {
            let first = items.remove(0);
            send_work(&work_tx, first).await?;
        }
        if !items.is_empty() {
            let last = items.pop().expect("non-empty after check");
            send_work(&work_tx, last).await?;
            for item in items {
                send_work(&work_tx, item).await?;
            }
        }
        drop(work_tx);

        let mut progress = Progress::new(plan.fetch_size);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut completed = 0;
        let mut failure = None;
        while completed < nitems {
            tokio::select! {
                Some(n) = transfer_rx.recv() => progress.transferred += n as u64,
                _ = ticker.tick() => {
                    if !opts.quiet {
                        progress.print_tick();
                    }
                }
                result = done_rx.recv() => match result {
                    Some(Ok(())) => completed += 1,
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                },
            }
        }
        if let Some(e) = failure {
            for w in &workers {
                w.abort();
            }
            return Err(e);
        }
        if !opts.quiet {
            progress.print_tick();
            println!();
        }

        // Ownership and mtimes for directories last: restoring files into
        // them updates directory mtimes.
        for d in &plan.dirs {
            if plan.need_dirs.contains(&d.name) {
                let tpath = target.join(&d.name);
                owners.lchown(d, &tpath)?;
                set_times(&tpath, d.mtime)?;
            }
        }
        Ok(())
    }
}

async fn send_work(tx: &mpsc::Sender<WorkItem>, item: WorkItem) -> Result<()> {
    tx.send(item)
        .await
        .map_err(|_| Error::Remote("restore workers stopped unexpectedly".into()))
}

/// Stream one previous data blob, restoring its files in offset order.
async fn restore_item(
    remote: &dyn Remote,
    passphrase: &str,
    target: &Path,
    owners: &OwnerCache,
    transfer: mpsc::UnboundedSender<usize>,
    mut item: WorkItem,
) -> Result<()> {
    let data_path = format!("{}.data", item.previous.name);
    let reader = remote.open(&data_path).await?;
    let reader = CountingReader::new(reader, transfer);
    let mut data = SafeReader::new(reader, passphrase).await?;

    item.files.sort_by_key(|f| f.data_offset);

    let mut buf = vec![0u8; 64 * 1024];
    let mut offset: i64 = 0;
    for f in &item.files {
        debug!("restoring {}", f.name);
        let tpath = target.join(&f.name);

        if f.data_offset > offset {
            data.skip((f.data_offset - offset) as u64).await?;
            offset = f.data_offset;
        }

        match f.kind {
            FileKind::Symlink => {
                let mut link = vec![0u8; f.size as usize];
                data.read_exact(&mut link).await.map_err(|e| match e {
                    Error::DataTruncated(_) => Error::DataTruncated(format!(
                        "short contents for symlink {}",
                        f.name
                    )),
                    e => e,
                })?;
                offset += f.size;
                tokio::fs::symlink(std::ffi::OsStr::from_bytes(&link), &tpath).await?;
                // no chmod or times for symlinks, only ownership
                owners.lchown(f, &tpath)?;
            }
            FileKind::Regular => {
                let mut out = tokio::fs::File::create(&tpath).await?;
                let mut remaining = f.size as u64;
                while remaining > 0 {
                    let want = buf.len().min(remaining as usize);
                    let n = data.read(&mut buf[..want]).await?;
                    if n == 0 {
                        return Err(Error::DataTruncated(format!(
                            "short contents for file {}: expected {} more bytes",
                            f.name, remaining
                        )));
                    }
                    out.write_all(&buf[..n]).await?;
                    remaining -= n as u64;
                }
                out.flush().await?;
                drop(out);
                offset += f.size;
                owners.lchown(f, &tpath)?;
                tokio::fs::set_permissions(
                    &tpath,
                    std::fs::Permissions::from_mode(f.permissions),
                )
                .await?;
                set_times(&tpath, f.mtime)?;
            }
            FileKind::Directory => {} // the planner never queues directories
        }
    }
    Ok(())
}

fn set_times(path: &Path, mtime: i64) -> Result<()> {
    let t = FileTime::from_unix_time(mtime, 0);
    filetime::set_file_times(path, t, t)?;
    Ok(())
}

/// uid/gid lookups for restoring ownership, with negative caching. Names
/// that resolve nowhere fall back to a numeric parse; failing that, the id
/// is not restored.
struct OwnerCache {
    enabled: bool,
    euid: u32,
    egid: u32,
    users: std::sync::Mutex<HashMap<String, Option<u32>>>,
    groups: std::sync::Mutex<HashMap<String, Option<u32>>>,
}

impl OwnerCache {
    fn new(as_root: bool) -> OwnerCache {
        OwnerCache {
            enabled: as_root,
            euid: nix::unistd::geteuid().as_raw(),
            egid: nix::unistd::getegid().as_raw(),
            users: std::sync::Mutex::new(HashMap::new()),
            groups: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn uid(&self, name: &str) -> Option<u32> {
        let mut users = self.users.lock().expect("owner cache lock");
        if let Some(&uid) = users.get(name) {
            return uid;
        }
        let uid = match nix::unistd::User::from_name(name) {
            Ok(Some(u)) => Some(u.uid.as_raw()),
            _ => name.parse().ok(),
        };
        if uid.is_none() {
            warn!("unknown user {:?}, not restoring that file owner", name);
        }
        users.insert(name.to_string(), uid);
        uid
    }

    fn gid(&self, name: &str) -> Option<u32> {
        let mut groups = self.groups.lock().expect("owner cache lock");
        if let Some(&gid) = groups.get(name) {
            return gid;
        }
        let gid = match nix::unistd::Group::from_name(name) {
            Ok(Some(g)) => Some(g.gid.as_raw()),
            _ => name.parse().ok(),
        };
        if gid.is_none() {
            warn!("unknown group {:?}, not restoring that file group", name);
        }
        groups.insert(name.to_string(), gid);
        gid
    }

    fn lchown(&self, f: &FileEntry, path: &Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let uid = self.uid(&f.user);
        let gid = self.gid(&f.group);
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        std::os::unix::fs::lchown(
            path,
            Some(uid.unwrap_or(self.euid)),
            Some(gid.unwrap_or(self.egid)),
        )?;
        Ok(())
    }
}

/// Progress line state: `transferred/total<unit>, eta ...`, rewritten in
/// place once per second. The ETA comes from a sliding window of the last
/// five samples.
struct Progress {
    transferred: u64,
    total: u64,
    window: [u64; 5],
    ticks: usize,
    unit_size: f64,
    unit: &'static str,
    prev_len: usize,
}

impl Progress {
    fn new(total: u64) -> Progress {
        let (unit_size, unit) = if total > 1024 * 1024 * 1024 {
            ((1u64 << 30) as f64, "gb")
        } else {
            ((1u64 << 20) as f64, "mb")
        };
        Progress {
            transferred: 0,
            total,
            window: [0; 5],
            ticks: 0,
            unit_size,
            unit,
            prev_len: 0,
        }
    }

    fn print_tick(&mut self) {
        let mut eta = String::new();
        if self.ticks >= self.window.len() {
            let delta = self.transferred as i64 - self.window[self.ticks % self.window.len()] as i64;
            eta.push_str(", eta ");
            if delta > 0 {
                let secs = self.window.len() as i64
                    * (self.total.saturating_sub(self.transferred) as i64)
                    / delta;
                let hours = secs / 3600;
                let mins = (secs % 3600) / 60;
                let secs = secs % 60;
                if hours > 0 {
                    eta.push_str(&format!("{:02}h", hours));
                }
                if mins > 0 || hours > 0 {
                    eta.push_str(&format!("{:02}m", mins));
                }
                if hours == 0 {
                    eta.push_str(&format!("{:02}s", secs));
                }
            } else {
                eta.push('∞');
            }
        }
        let line = format!(
            "{:.2}/{:.2}{}{}",
            self.transferred as f64 / self.unit_size,
            self.total as f64 / self.unit_size,
            self.unit,
            eta
        );
        print!("\r{:<width$}", line, width = self.prev_len);
        let _ = std::io::stdout().flush();
        self.prev_len = line.len();
        self.window[self.ticks % self.window.len()] = self.transferred;
        self.ticks += 1;
    }
}

//! Source tree traversal: lexicographic walk, include/exclude filtering and
//! candidate file entries with their Unix metadata.

use crate::config::CONFIG_NAME;
use crate::index::{FileEntry, FileKind};
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub(crate) fn match_any(patterns: &[Regex], s: &str) -> bool {
    patterns.iter().any(|re| re.find(s).is_some())
}

/// Compiled include/exclude patterns.
///
/// A match is any partial match within the relative path; directory paths
/// get a trailing `/` appended so patterns can match "directory names".
pub(crate) struct Filter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl Filter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Filter> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| Error::Config(format!("bad pattern {:?}: {}", p, e)))
                })
                .collect()
        };
        Ok(Filter {
            includes: compile(include)?,
            excludes: compile(exclude)?,
        })
    }
}

/// Looks up user and group names for uids/gids, remembering results. Falls
/// back to the numeric value as a string when there is no name.
#[derive(Default)]
struct NameCache {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

impl NameCache {
    fn user(&mut self, uid: u32) -> String {
        self.users
            .entry(uid)
            .or_insert_with(|| {
                match nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) {
                    Ok(Some(u)) => u.name,
                    _ => uid.to_string(),
                }
            })
            .clone()
    }

    fn group(&mut self, gid: u32) -> String {
        self.groups
            .entry(gid)
            .or_insert_with(|| {
                match nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid)) {
                    Ok(Some(g)) => g.name,
                    _ => gid.to_string(),
                }
            })
            .clone()
    }
}

/// Iterator over the filtered source tree, yielding each kept path together
/// with its candidate index entry (offsets still unset).
pub(crate) struct Walker {
    it: walkdir::IntoIter,
    root: PathBuf,
    filter: Filter,
    /// Match paths of directories whitelisted by an include match; all their
    /// descendants are kept.
    whitelist: Vec<String>,
    names: NameCache,
}

impl Walker {
    pub fn new(root: &Path, filter: Filter) -> Walker {
        Walker {
            it: WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter(),
            root: root.to_path_buf(),
            filter,
            whitelist: Vec::new(),
            names: NameCache::default(),
        }
    }

    fn entry(&mut self, entry: &walkdir::DirEntry) -> Result<Option<(PathBuf, FileEntry)>> {
        let path = entry.path().to_path_buf();
        let rel = path
            .strip_prefix(&self.root)
            .map_err(|_| Error::PathInvalid {
                path: path.display().to_string(),
                reason: "not under the backup root",
            })?;
        let relpath = match rel.to_str() {
            Some("") => ".".to_string(),
            Some(s) => s.to_string(),
            None => {
                return Err(Error::PathInvalid {
                    path: path.display().to_string(),
                    reason: "not valid UTF-8",
                })
            }
        };
        if relpath == CONFIG_NAME || relpath.ends_with(&format!("/{}", CONFIG_NAME)) {
            return Ok(None);
        }

        let meta = entry
            .metadata()
            .map_err(|e| source_error(&path, e.into_io_error()))?;
        let is_dir = meta.is_dir();

        let match_path = if is_dir && relpath != "." {
            format!("{}/", relpath)
        } else if relpath == "." {
            String::new()
        } else {
            relpath.clone()
        };

        if !self.filter.includes.is_empty() {
            let matched = match_any(&self.filter.includes, &match_path);
            if matched && is_dir {
                self.whitelist.push(match_path.clone());
            }
            if !matched && !is_dir {
                let keep = self
                    .whitelist
                    .iter()
                    .any(|w| match_path.starts_with(w.as_str()));
                if !keep {
                    debug!("no include match, skipping {}", match_path);
                    return Ok(None);
                }
            }
        }
        if !self.filter.excludes.is_empty() && match_any(&self.filter.excludes, &match_path) {
            debug!("exclude match, skipping {}", match_path);
            if is_dir {
                self.it.skip_current_dir();
            }
            return Ok(None);
        }

        let kind = if is_dir {
            FileKind::Directory
        } else if meta.file_type().is_symlink() {
            FileKind::Symlink
        } else {
            FileKind::Regular
        };
        let size = if is_dir { 0 } else { meta.len() as i64 };
        let file = FileEntry {
            kind,
            permissions: meta.mode() & 0o777,
            mtime: meta.mtime(),
            size,
            user: self.names.user(meta.uid()),
            group: self.names.group(meta.gid()),
            data_offset: -1,
            previous_index: -1,
            name: relpath,
        };
        Ok(Some((path, file)))
    }
}

impl Iterator for Walker {
    type Item = Result<(PathBuf, FileEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.it.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
                    return Some(Err(source_error(&path, e.into_io_error())));
                }
            };
            match self.entry(&entry) {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

fn source_error(path: &Path, e: Option<std::io::Error>) -> Error {
    Error::Source {
        path: path.to_path_buf(),
        source: e.unwrap_or_else(|| std::io::Error::other("walk error")),
    }
}

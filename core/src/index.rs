//! Text codec for snapshot index files.
//!
//! An index enumerates the complete live tree of one snapshot plus the
//! earlier snapshots whose data blobs still hold payloads for it. Example:
//!
//! ```text
//! index1
//! 12345
//! f 20171222-0001 10240
//! i 20171222-0002 512
//! + path/to/file
//! - path/removed
//! = d 755 1506578834 0 mjl mjl -1 -1 path/to
//! = f 644 1506578834 1234 mjl mjl 0 0 path/to/file
//! = f 644 1506578834 100 mjl mjl 0 -1 path/to/another-file
//! .
//! ```
//!
//! The writer is deterministic: serializing the same index twice produces
//! identical bytes, so fixtures can be byte-compared.

use crate::{Error, Result};

const MAGIC: &str = "index1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    fn tag(&self) -> &'static str {
        match self {
            FileKind::Regular => "f",
            FileKind::Directory => "d",
            FileKind::Symlink => "s",
        }
    }

    fn from_tag(tag: &str) -> Option<FileKind> {
        match tag {
            "f" => Some(FileKind::Regular),
            "d" => Some(FileKind::Directory),
            "s" => Some(FileKind::Symlink),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    /// Suffix used in index object names: `{name}.index1.{suffix}`.
    pub fn suffix(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incr",
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            BackupKind::Full => "f",
            BackupKind::Incremental => "i",
        }
    }
}

/// Reference to an earlier snapshot whose data blob holds payloads that are
/// still live in the referencing snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Previous {
    pub kind: BackupKind,
    pub name: String,
    pub data_size: u64,
}

/// One path in a snapshot.
///
/// `data_offset` is -1 when no payload for this entry is stored in the
/// snapshot's own data blob; `previous_index` is -1 or an index into the
/// index's `previous` list naming the snapshot that does hold the payload.
/// The sentinels are kept signed because they round-trip the text format
/// directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub kind: FileKind,
    pub permissions: u32,
    pub mtime: i64,
    pub size: i64,
    pub user: String,
    pub group: String,
    pub data_offset: i64,
    pub previous_index: i64,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Index {
    /// Byte size of the companion data blob, after compression+encryption.
    pub data_size: u64,
    /// Earlier snapshots referenced by `previous_index` fields, a full
    /// followed by incrementals in chronological order. Empty in a full
    /// backup.
    pub previous: Vec<Previous>,
    /// Paths new in this snapshot versus its predecessor.
    pub add: Vec<String>,
    /// Paths present in the predecessor but gone in this snapshot.
    pub delete: Vec<String>,
    /// The complete live tree, in walk order.
    pub contents: Vec<FileEntry>,
}

fn next_line<'a>(rest: &mut &'a str) -> Option<&'a str> {
    if rest.is_empty() {
        return None;
    }
    match rest.find('\n') {
        Some(i) => {
            let line = &rest[..i];
            *rest = &rest[i + 1..];
            Some(line)
        }
        None => {
            let line = *rest;
            *rest = "";
            Some(line)
        }
    }
}

pub fn parse(data: &str) -> Result<Index> {
    let mut rest = data;

    let magic = next_line(&mut rest).ok_or_else(|| malformed("empty index"))?;
    if magic != MAGIC {
        return Err(malformed(format!(
            "first line is not magic {:?} but {:?}",
            MAGIC, magic
        )));
    }
    let size_line = next_line(&mut rest).ok_or_else(|| malformed("missing data size line"))?;
    let data_size: u64 = size_line
        .parse()
        .map_err(|_| malformed(format!("invalid data size {:?}", size_line)))?;

    let mut idx = Index {
        data_size,
        ..Index::default()
    };

    // Previous lines come first; add/delete/content lines may interleave.
    let mut in_previous = true;
    loop {
        let line = next_line(&mut rest).ok_or_else(|| malformed("unexpected end of index"))?;
        if line == "." {
            break;
        }
        if line.is_empty() {
            return Err(malformed("empty line in index"));
        }
        if let Some(prev) = line.strip_prefix("f ").or_else(|| line.strip_prefix("i ")) {
            if !in_previous {
                return Err(malformed(format!("stray previous line {:?}", line)));
            }
            let kind = if line.starts_with('f') {
                BackupKind::Full
            } else {
                BackupKind::Incremental
            };
            if kind == BackupKind::Full && !idx.previous.is_empty() {
                return Err(malformed("only the first previous entry may be a full"));
            }
            idx.previous.push(parse_previous(prev, kind)?);
            continue;
        }
        in_previous = false;
        if let Some(name) = line.strip_prefix("+ ") {
            idx.add.push(name.to_string());
        } else if let Some(name) = line.strip_prefix("- ") {
            idx.delete.push(name.to_string());
        } else if let Some(file) = line.strip_prefix("= ") {
            idx.contents.push(parse_file(file, idx.previous.len())?);
        } else {
            return Err(malformed(format!("unrecognized line {:?}", line)));
        }
    }
    if next_line(&mut rest).is_some() {
        return Err(malformed("data after closing dot"));
    }
    Ok(idx)
}

fn parse_previous(line: &str, kind: BackupKind) -> Result<Previous> {
    let mut t = line.splitn(2, ' ');
    let (Some(name), Some(size)) = (t.next(), t.next()) else {
        return Err(malformed(format!("invalid previous line {:?}", line)));
    };
    if name.is_empty() {
        return Err(malformed("previous entry with empty name"));
    }
    let data_size: u64 = size
        .parse()
        .map_err(|_| malformed(format!("invalid previous data size {:?}", size)))?;
    Ok(Previous {
        kind,
        name: name.to_string(),
        data_size,
    })
}

fn parse_file(line: &str, nprevious: usize) -> Result<FileEntry> {
    let t: Vec<&str> = line.splitn(9, ' ').collect();
    if t.len() != 9 {
        return Err(malformed(format!(
            "file line doesn't have 9 tokens: {:?}",
            line
        )));
    }
    let kind = FileKind::from_tag(t[0])
        .ok_or_else(|| malformed(format!("invalid file type {:?}", t[0])))?;
    let permissions = u32::from_str_radix(t[1], 8)
        .map_err(|_| malformed(format!("invalid permissions {:?}", t[1])))?;
    let mtime: i64 = t[2]
        .parse()
        .map_err(|_| malformed(format!("invalid mtime {:?}", t[2])))?;
    if mtime < 0 {
        return Err(malformed(format!("negative mtime {}", mtime)));
    }
    let size: i64 = t[3]
        .parse()
        .map_err(|_| malformed(format!("invalid size {:?}", t[3])))?;
    if size < 0 {
        return Err(malformed(format!("negative size {}", size)));
    }
    let data_offset: i64 = t[6]
        .parse()
        .map_err(|_| malformed(format!("invalid offset {:?}", t[6])))?;
    if data_offset < -1 {
        return Err(malformed(format!("invalid offset {}", data_offset)));
    }
    let previous_index: i64 = t[7]
        .parse()
        .map_err(|_| malformed(format!("invalid previous index {:?}", t[7])))?;
    if previous_index < -1 {
        return Err(malformed(format!("invalid previous index {}", previous_index)));
    }
    if previous_index >= nprevious as i64 {
        return Err(malformed(format!(
            "previous index {} out of range, only {} previous entries",
            previous_index, nprevious
        )));
    }
    verify_path(t[8])?;
    Ok(FileEntry {
        kind,
        permissions,
        mtime,
        size,
        user: t[4].to_string(),
        group: t[5].to_string(),
        data_offset,
        previous_index,
        name: t[8].to_string(),
    })
}

pub fn serialize(idx: &Index) -> String {
    let mut out = String::new();
    out.push_str(MAGIC);
    out.push('\n');
    out.push_str(&format!("{}\n", idx.data_size));
    for p in &idx.previous {
        out.push_str(&format!("{} {} {}\n", p.kind.tag(), p.name, p.data_size));
    }
    for name in &idx.add {
        out.push_str(&format!("+ {}\n", name));
    }
    for name in &idx.delete {
        out.push_str(&format!("- {}\n", name));
    }
    for f in &idx.contents {
        out.push_str(&format!(
            "= {} {:o} {} {} {} {} {} {} {}\n",
            f.kind.tag(),
            f.permissions,
            f.mtime,
            f.size,
            f.user,
            f.group,
            f.data_offset,
            f.previous_index,
            f.name
        ));
    }
    out.push_str(".\n");
    out
}

/// Paths in an index are relative, `/`-separated, with `.` denoting the
/// snapshot root.
pub fn verify_path(path: &str) -> Result<()> {
    if path == "." {
        return Ok(());
    }
    let invalid = |reason| Error::PathInvalid {
        path: path.to_string(),
        reason,
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') {
        return Err(invalid("starts with /"));
    }
    for elem in path.split('/') {
        if elem == "." {
            return Err(invalid(r#"contains needless ".""#));
        }
        if elem == ".." {
            return Err(invalid(r#"contains "..""#));
        }
        if elem.is_empty() {
            return Err(invalid(r#"contains empty elements, eg "//""#));
        }
    }
    Ok(())
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::IndexMalformed(msg.into())
}

//! End-to-end backup/restore scenarios against the local driver: full and
//! incremental snapshots with include/exclude filtering, chain restores,
//! retention, and subset restores.

use bolong_backends::local::LocalRemote;
use bolong_core::{
    BackupKind, BlobReader, BlobWrite, Config, Engine, Remote, RestoreOptions,
};
use bolong_core::config::{LocalConfig, StoreKind};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

struct TestTree {
    dirs: Vec<&'static str>,
    files: Vec<(&'static str, &'static str)>,
}

/// Reset `workdir` to exactly `tree`, with a decoy config file that the
/// walker must skip. Every entry gets a fixed mtime so that a recreated,
/// identical file is seen as unchanged by the differ regardless of how fast
/// the test runs; intentional changes always change the file size too.
fn ensure_tree(workdir: &Path, tree: &TestTree) {
    if workdir.exists() {
        fs::remove_dir_all(workdir).unwrap();
    }
    fs::create_dir_all(workdir).unwrap();
    for d in &tree.dirs {
        fs::create_dir_all(workdir.join(d)).unwrap();
    }
    for (path, contents) in &tree.files {
        fs::write(workdir.join(path), contents).unwrap();
    }
    fs::write(workdir.join(".bolong.json"), "{}").unwrap();
    let stamp = filetime::FileTime::from_unix_time(1_513_900_000, 0);
    for entry in walkdir::WalkDir::new(workdir).contents_first(true) {
        let entry = entry.unwrap();
        filetime::set_file_times(entry.path(), stamp, stamp).unwrap();
    }
}

/// Collect (dirs, files-with-contents) under `root`, skipping .bolong.json.
fn fs_tree(root: &Path) -> (BTreeSet<String>, Vec<(String, String)>) {
    let mut dirs = BTreeSet::new();
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        let rel = entry.path().strip_prefix(root).unwrap();
        let name = if rel.as_os_str().is_empty() {
            ".".to_string()
        } else {
            rel.to_str().unwrap().to_string()
        };
        if name == ".bolong.json" || name.ends_with("/.bolong.json") {
            continue;
        }
        if entry.file_type().is_dir() {
            dirs.insert(name);
        } else {
            let contents = fs::read_to_string(entry.path()).unwrap();
            files.push((name, contents));
        }
    }
    files.sort();
    (dirs, files)
}

fn assert_tree(root: &Path, dirs: &[&str], files: &[(&str, &str)]) {
    let (got_dirs, got_files) = fs_tree(root);
    let want_dirs: BTreeSet<String> = dirs.iter().map(|d| d.to_string()).collect();
    let want_files: Vec<(String, String)> = {
        let mut v: Vec<(String, String)> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect();
        v.sort();
        v
    };
    assert_eq!(got_dirs, want_dirs, "directory sets differ");
    assert_eq!(got_files, want_files, "file sets differ");
}

fn test_config() -> Config {
    Config {
        kind: StoreKind::Local,
        local: Some(LocalConfig {
            path: "unused".into(),
        }),
        googles3: None,
        include: vec!["\\.txt$".into(), "^a/b/$".into()],
        exclude: vec!["excluded".into()],
        incrementals_per_full: 2,
        full_keep: 2,
        incremental_for_full_keep: 1,
        passphrase: "test1234".into(),
    }
}

fn tree1() -> TestTree {
    TestTree {
        dirs: vec![".", "a", "a/a", "a/b", "a/c"],
        files: vec![
            ("a/a/excluded.txt", "not in backup"),
            ("a/a/not-included.ext", "not in backup"),
            ("a/a/test.txt", "more"),
            ("a/b/t1.txt", "this is a test"),
            ("a/b/t2.txt", "another test"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    }
}

fn tree2() -> TestTree {
    TestTree {
        dirs: vec![".", "a", "a/a", "a/b", "a/d"],
        files: vec![
            ("a/a/excluded.txt", "not in backup"),
            ("a/a/not-included.ext", "not in backup"),
            ("a/a/test.txt", "more"),
            // a/b/t1.txt removed, in the middle of tree1's data blob
            ("a/b/t2.txt", "different content"),
            ("a/b/t3.txt", "test3"),
            ("a/b/t4.txt", "test4"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    }
}

fn tree3() -> TestTree {
    TestTree {
        dirs: vec![".", "a", "a/a", "a/b", "a/d"],
        files: vec![
            ("a/a/excluded.txt", "not in backup"),
            ("a/a/not-included.ext", "not in backup"),
            ("a/a/test.txt", "more"),
            ("a/b/t2.txt", "new different content"),
            ("a/b/t3.txt", "new test3"),
            ("a/b/t4.txt", "new test4"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    }
}

struct Ctx {
    _root: tempfile::TempDir,
    workdir: std::path::PathBuf,
    restoredir: std::path::PathBuf,
    engine: Engine,
}

fn setup() -> Ctx {
    let root = tempfile::tempdir().unwrap();
    let store = root.path().join("backup");
    let workdir = root.path().join("workdir");
    let restoredir = root.path().join("restore");
    fs::create_dir_all(&store).unwrap();
    let engine = Engine::new(test_config(), Arc::new(LocalRemote::new(&store))).unwrap();
    Ctx {
        _root: root,
        workdir,
        restoredir,
        engine,
    }
}

impl Ctx {
    async fn restore_to_fresh_dir(&self, patterns: &[&str]) {
        if self.restoredir.exists() {
            fs::remove_dir_all(&self.restoredir).unwrap();
        }
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        self.engine
            .restore(
                "latest",
                &self.restoredir,
                &patterns,
                &RestoreOptions { quiet: true },
            )
            .await
            .unwrap();
    }

    async fn catalog(&self) -> Vec<(String, BackupKind)> {
        self.engine
            .list_backups()
            .await
            .unwrap()
            .into_iter()
            .map(|b| (b.name, b.kind))
            .collect()
    }
}

#[tokio::test]
async fn full_and_incremental_cycle() {
    let ctx = setup();

    assert!(ctx.catalog().await.is_empty());

    // First backup is a full; excluded and non-included files stay out.
    ensure_tree(&ctx.workdir, &tree1());
    let summary = ctx.engine.backup(&ctx.workdir, "20171222-0001").await.unwrap();
    assert_eq!(summary.kind, BackupKind::Full);

    let catalog = ctx.catalog().await;
    assert_eq!(catalog, vec![("20171222-0001".to_string(), BackupKind::Full)]);

    let backup = ctx.engine.find_backup("latest").await.unwrap();
    let idx = ctx.engine.read_index(&backup).await.unwrap();
    assert!(idx.previous.is_empty());
    let names: Vec<&str> = idx.contents.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(
        names,
        [
            ".",
            "a",
            "a/a",
            "a/a/test.txt",
            "a/b",
            "a/b/t1.txt",
            "a/b/t2.txt",
            "a/b/whitelisted",
            "a/c",
        ]
    );

    ctx.restore_to_fresh_dir(&[]).await;
    assert_tree(
        &ctx.restoredir,
        &[".", "a", "a/a", "a/b", "a/c"],
        &[
            ("a/a/test.txt", "more"),
            ("a/b/t1.txt", "this is a test"),
            ("a/b/t2.txt", "another test"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    );

    // Second backup is incremental; unchanged files inherit their payload
    // from the full.
    ensure_tree(&ctx.workdir, &tree2());
    let summary = ctx.engine.backup(&ctx.workdir, "20171222-0002").await.unwrap();
    assert_eq!(summary.kind, BackupKind::Incremental);

    let backup = ctx.engine.find_backup("latest").await.unwrap();
    let idx = ctx.engine.read_index(&backup).await.unwrap();
    assert_eq!(idx.previous.len(), 1);
    assert_eq!(idx.previous[0].kind, BackupKind::Full);
    assert_eq!(idx.previous[0].name, "20171222-0001");
    assert_eq!(idx.add, ["a/b/t3.txt", "a/b/t4.txt", "a/d"]);
    let deletes: BTreeSet<&str> = idx.delete.iter().map(|s| s.as_str()).collect();
    assert_eq!(deletes, BTreeSet::from(["a/b/t1.txt", "a/c"]));

    // the unchanged files point at the full backup's blob with their
    // original offsets
    let test_txt = idx.contents.iter().find(|f| f.name == "a/a/test.txt").unwrap();
    assert_eq!(test_txt.previous_index, 0);
    let whitelisted = idx
        .contents
        .iter()
        .find(|f| f.name == "a/b/whitelisted")
        .unwrap();
    assert_eq!(whitelisted.previous_index, 0);
    // all previous entries referenced, all previous_index values in range
    for f in &idx.contents {
        assert!(f.previous_index >= -1);
        assert!(f.previous_index < idx.previous.len() as i64);
    }
    for (i, _) in idx.previous.iter().enumerate() {
        assert!(
            idx.contents.iter().any(|f| f.previous_index == i as i64),
            "previous entry {} is unreferenced",
            i
        );
    }

    ctx.restore_to_fresh_dir(&[]).await;
    assert_tree(
        &ctx.restoredir,
        &[".", "a", "a/a", "a/b", "a/d"],
        &[
            ("a/a/test.txt", "more"),
            ("a/b/t2.txt", "different content"),
            ("a/b/t3.txt", "test3"),
            ("a/b/t4.txt", "test4"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    );

    // Third backup touches every stored file except a/a/test.txt and
    // a/b/whitelisted, so only the full stays in the previous list.
    ensure_tree(&ctx.workdir, &tree3());
    ctx.engine.backup(&ctx.workdir, "20171222-0003").await.unwrap();

    let backup = ctx.engine.find_backup("latest").await.unwrap();
    let idx = ctx.engine.read_index(&backup).await.unwrap();
    assert_eq!(idx.previous.len(), 1);
    assert_eq!(idx.previous[0].name, "20171222-0001");
    let test_txt = idx.contents.iter().find(|f| f.name == "a/a/test.txt").unwrap();
    assert_eq!(test_txt.previous_index, 0);

    ctx.restore_to_fresh_dir(&[]).await;
    assert_tree(
        &ctx.restoredir,
        &[".", "a", "a/a", "a/b", "a/d"],
        &[
            ("a/a/test.txt", "more"),
            ("a/b/t2.txt", "new different content"),
            ("a/b/t3.txt", "new test3"),
            ("a/b/t4.txt", "new test4"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    );

    // Retention: publish 0004 (full), 0005/0006 (incr), 0007 (full),
    // 0008 (incr); with fullKeep=2 and incrementalForFullKeep=1 only
    // 0004, 0007 and 0008 survive.
    for name in [
        "20171222-0004",
        "20171222-0005",
        "20171222-0006",
        "20171222-0007",
        "20171222-0008",
    ] {
        ctx.engine.backup(&ctx.workdir, name).await.unwrap();
    }
    let catalog = ctx.catalog().await;
    assert_eq!(
        catalog,
        vec![
            ("20171222-0004".to_string(), BackupKind::Full),
            ("20171222-0007".to_string(), BackupKind::Full),
            ("20171222-0008".to_string(), BackupKind::Incremental),
        ]
    );

    // Subset restore: parents of matches are created, nothing else is.
    ctx.engine.backup(&ctx.workdir, "20171222-0009").await.unwrap();
    ctx.restore_to_fresh_dir(&["^a/a/", "/whitelisted$"]).await;
    assert_tree(
        &ctx.restoredir,
        &[".", "a", "a/a", "a/b"],
        &[
            ("a/a/test.txt", "more"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    );
}

/// Restoring an incremental must be byte-identical to what a full backup of
/// the same tree would restore.
#[tokio::test]
async fn incremental_restore_equals_full_restore() {
    let ctx = setup();
    ensure_tree(&ctx.workdir, &tree1());
    ctx.engine.backup(&ctx.workdir, "20180101-0001").await.unwrap();
    ensure_tree(&ctx.workdir, &tree2());
    ctx.engine.backup(&ctx.workdir, "20180101-0002").await.unwrap();
    ctx.restore_to_fresh_dir(&[]).await;
    let from_chain = fs_tree(&ctx.restoredir);

    // same tree, taken as a full by a second engine on a fresh store
    let other = setup();
    ensure_tree(&other.workdir, &tree2());
    other.engine.backup(&other.workdir, "20180101-0003").await.unwrap();
    other.restore_to_fresh_dir(&[]).await;
    let from_full = fs_tree(&other.restoredir);

    assert_eq!(from_chain, from_full);
}

/// Wrapper that records which blobs get opened, to verify a chain restore
/// fetches only the data blobs the index references.
struct RecordingRemote {
    inner: LocalRemote,
    opened: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl Remote for RecordingRemote {
    async fn list(&self) -> bolong_core::Result<Vec<String>> {
        self.inner.list().await
    }

    async fn open(&self, path: &str) -> bolong_core::Result<BlobReader> {
        self.opened.lock().unwrap().push(path.to_string());
        self.inner.open(path).await
    }

    async fn create(&self, path: &str) -> bolong_core::Result<Box<dyn BlobWrite>> {
        self.inner.create(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> bolong_core::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn delete(&self, path: &str) -> bolong_core::Result<()> {
        self.inner.delete(path).await
    }
}

#[tokio::test]
async fn chain_restore_skips_unreferenced_blobs() {
    let root = tempfile::tempdir().unwrap();
    let store = root.path().join("backup");
    let workdir = root.path().join("workdir");
    fs::create_dir_all(&store).unwrap();

    let opened = Arc::new(Mutex::new(Vec::new()));
    let remote = RecordingRemote {
        inner: LocalRemote::new(&store),
        opened: opened.clone(),
    };
    let mut config = test_config();
    config.include = vec![];
    config.exclude = vec![];
    config.full_keep = 0;
    config.incremental_for_full_keep = 0;
    let engine = Engine::new(config, Arc::new(remote)).unwrap();

    // keep: unchanged through the chain; b: rewritten by both incrementals
    ensure_tree(
        &workdir,
        &TestTree {
            dirs: vec!["."],
            files: vec![("keep", "inherited"), ("b", "v1")],
        },
    );
    engine.backup(&workdir, "0001").await.unwrap();
    fs::write(workdir.join("b"), "v2 now").unwrap();
    engine.backup(&workdir, "0002").await.unwrap();
    fs::write(workdir.join("b"), "v3 finally").unwrap();
    engine.backup(&workdir, "0003").await.unwrap();

    opened.lock().unwrap().clear();
    let dest = root.path().join("restore");
    engine
        .restore("latest", &dest, &[], &RestoreOptions { quiet: true })
        .await
        .unwrap();

    let opened_data: BTreeSet<String> = opened
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.ends_with(".data"))
        .cloned()
        .collect();
    // the middle incremental owns no live payload and must not be fetched
    assert_eq!(
        opened_data,
        BTreeSet::from(["0001.data".to_string(), "0003.data".to_string()])
    );

    assert_tree(
        &dest,
        &["."],
        &[("b", "v3 finally"), ("keep", "inherited")],
    );
}

#[tokio::test]
async fn symlinks_and_metadata_survive_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let ctx = setup();
    let mut config = test_config();
    config.include = vec![];
    config.exclude = vec![];
    config.incrementals_per_full = 0;
    let store = ctx._root.path().join("backup2");
    fs::create_dir_all(&store).unwrap();
    let engine = Engine::new(config, Arc::new(LocalRemote::new(&store))).unwrap();

    ensure_tree(
        &ctx.workdir,
        &TestTree {
            dirs: vec![".", "sub"],
            files: vec![("sub/data.txt", "payload"), ("exec", "#!/bin/sh\n")],
        },
    );
    std::os::unix::fs::symlink("sub/data.txt", ctx.workdir.join("link")).unwrap();
    fs::set_permissions(ctx.workdir.join("exec"), fs::Permissions::from_mode(0o755)).unwrap();

    engine.backup(&ctx.workdir, "0001").await.unwrap();
    let dest = ctx._root.path().join("restore2");
    engine
        .restore("latest", &dest, &[], &RestoreOptions { quiet: true })
        .await
        .unwrap();

    let link = fs::read_link(dest.join("link")).unwrap();
    assert_eq!(link.to_str().unwrap(), "sub/data.txt");
    assert_eq!(fs::read_to_string(dest.join("sub/data.txt")).unwrap(), "payload");

    let mode = fs::metadata(dest.join("exec")).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);

    // whole-second mtimes are preserved
    use std::os::unix::fs::MetadataExt;
    let src_mtime = fs::metadata(ctx.workdir.join("sub/data.txt")).unwrap().mtime();
    let dst_mtime = fs::metadata(dest.join("sub/data.txt")).unwrap().mtime();
    assert_eq!(src_mtime, dst_mtime);
}

/// An unchanged tree backed up incrementally produces an empty data payload
/// and a previous list pointing at the predecessor.
#[tokio::test]
async fn unchanged_tree_incremental_is_cheap() {
    let ctx = setup();
    ensure_tree(&ctx.workdir, &tree1());
    ctx.engine.backup(&ctx.workdir, "0001").await.unwrap();
    let summary = ctx.engine.backup(&ctx.workdir, "0002").await.unwrap();
    assert_eq!(summary.kind, BackupKind::Incremental);
    assert_eq!(summary.added, 0);
    assert_eq!(summary.deleted, 0);

    let idx = ctx
        .engine
        .read_index(&ctx.engine.find_backup("0002").await.unwrap())
        .await
        .unwrap();
    assert_eq!(idx.previous.len(), 1);
    assert_eq!(idx.previous[0].name, "0001");
    ctx.restore_to_fresh_dir(&[]).await;
    assert_tree(
        &ctx.restoredir,
        &[".", "a", "a/a", "a/b", "a/c"],
        &[
            ("a/a/test.txt", "more"),
            ("a/b/t1.txt", "this is a test"),
            ("a/b/t2.txt", "another test"),
            ("a/b/whitelisted", "included because of a/b/"),
        ],
    );
}

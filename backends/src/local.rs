use async_trait::async_trait;
use bolong_core::{BlobReader, BlobWrite, Error, Remote, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Remote store backed by a directory on the local filesystem. `rename` is
/// a real rename and therefore atomic, which makes index publication a true
/// commit point on this driver.
pub struct LocalRemote {
    base: PathBuf,
}

impl LocalRemote {
    pub fn new<P: AsRef<Path>>(base: P) -> LocalRemote {
        LocalRemote {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

struct LocalWriter {
    file: fs::File,
    path: PathBuf,
}

#[async_trait]
impl BlobWrite for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| Error::Remote(format!("writing {}: {}", self.path.display(), e)))
    }

    async fn finish(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::Remote(format!("closing {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl Remote for LocalRemote {
    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.base)
            .await
            .map_err(|e| Error::Remote(format!("listing {}: {}", self.base.display(), e)))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Remote(format!("listing {}: {}", self.base.display(), e)))?
        {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    async fn open(&self, path: &str) -> Result<BlobReader> {
        let full = self.full_path(path);
        let file = fs::File::open(&full)
            .await
            .map_err(|e| Error::Remote(format!("opening {}: {}", full.display(), e)))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn BlobWrite>> {
        let full = self.full_path(path);
        let file = fs::File::create(&full)
            .await
            .map_err(|e| Error::Remote(format!("creating {}: {}", full.display(), e)))?;
        Ok(Box::new(LocalWriter { file, path: full }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.full_path(from), self.full_path(to))
            .await
            .map_err(|e| Error::Remote(format!("renaming {} to {}: {}", from, to, e)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        fs::remove_file(&full)
            .await
            .map_err(|e| Error::Remote(format!("deleting {}: {}", full.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(remote: &LocalRemote, path: &str) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut r = remote.open(path).await.unwrap();
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn create_list_rename_delete() {
        let dir = tempfile::tempdir().unwrap();
        let remote = LocalRemote::new(dir.path());

        let mut w = remote.create("x.tmp").await.unwrap();
        w.write(b"hello ").await.unwrap();
        w.write(b"world").await.unwrap();
        w.finish().await.unwrap();
        drop(w);

        assert_eq!(remote.list().await.unwrap(), vec!["x.tmp".to_string()]);
        remote.rename("x.tmp", "x").await.unwrap();
        assert_eq!(remote.list().await.unwrap(), vec!["x".to_string()]);
        assert_eq!(read_all(&remote, "x").await, b"hello world");

        remote.delete("x").await.unwrap();
        assert!(remote.list().await.unwrap().is_empty());
        assert!(remote.open("x").await.is_err());
        assert!(remote.delete("x").await.is_err());
    }
}

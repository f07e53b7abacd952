//! In-memory remote store for tests.

use crate::config::{Config, LocalConfig, StoreKind};
use crate::remote::{BlobReader, BlobWrite, Remote};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

type Blobs = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

#[derive(Default)]
pub(crate) struct MemRemote {
    blobs: Blobs,
}

impl MemRemote {
    pub fn put(&self, name: &str, data: &[u8]) {
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
    }

    pub fn names(&self) -> Vec<String> {
        self.blobs.lock().unwrap().keys().cloned().collect()
    }
}

struct MemWriter {
    blobs: Blobs,
    name: String,
    data: Vec<u8>,
}

#[async_trait]
impl BlobWrite for MemWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.data.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .insert(self.name.clone(), std::mem::take(&mut self.data));
        Ok(())
    }
}

#[async_trait]
impl Remote for MemRemote {
    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.names())
    }

    async fn open(&self, path: &str) -> Result<BlobReader> {
        let blobs = self.blobs.lock().unwrap();
        let data = blobs
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Remote(format!("no such blob {}", path)))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn create(&self, path: &str) -> Result<Box<dyn BlobWrite>> {
        Ok(Box::new(MemWriter {
            blobs: self.blobs.clone(),
            name: path.to_string(),
            data: Vec::new(),
        }))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        let data = blobs
            .remove(from)
            .ok_or_else(|| Error::Remote(format!("no such blob {}", from)))?;
        blobs.insert(to.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::Remote(format!("no such blob {}", path)))
    }
}

pub(crate) fn test_config() -> Config {
    Config {
        kind: StoreKind::Local,
        local: Some(LocalConfig {
            path: "/nonexistent".into(),
        }),
        googles3: None,
        include: vec![],
        exclude: vec![],
        incrementals_per_full: 0,
        full_keep: 0,
        incremental_for_full_keep: 0,
        passphrase: "test1234".into(),
    }
}

use crate::Result;
use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Byte-stream read handle for one remote blob.
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte-stream write handle for one remote blob.
///
/// `finish` must be called exactly once after the last `write`; drivers that
/// upload on close report their errors there.
#[async_trait]
pub trait BlobWrite: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;
    async fn finish(&mut self) -> Result<()>;
}

/// The operations the engine needs from a remote store.
///
/// `rename` is the commit step of publishing a snapshot. The local driver
/// renames atomically; S3-style drivers implement it as copy-then-delete and
/// must document that a crash in between can leave both names. Readers only
/// consider a snapshot to exist once its final index name is listable.
#[async_trait]
pub trait Remote: Send + Sync {
    /// All blob names at the configured location, in no particular order.
    async fn list(&self) -> Result<Vec<String>>;

    async fn open(&self, path: &str) -> Result<BlobReader>;

    async fn create(&self, path: &str) -> Result<Box<dyn BlobWrite>>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;
}

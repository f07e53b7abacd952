//! Byte counters sitting between the codec and the remote.
//!
//! `CountingWriter` measures the wire size of a blob as it is produced (the
//! `data_size` recorded in indexes). `CountingReader` reports every read to
//! a channel so the restore progress meter can aggregate transfer across
//! parallel workers.

use crate::remote::{BlobReader, BlobWrite};
use crate::Result;
use async_trait::async_trait;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

pub struct CountingWriter {
    inner: Box<dyn BlobWrite>,
    written: u64,
}

impl CountingWriter {
    pub fn new(inner: Box<dyn BlobWrite>) -> CountingWriter {
        CountingWriter { inner, written: 0 }
    }

    /// Bytes written so far, post-codec.
    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl BlobWrite for CountingWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.write(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.inner.finish().await
    }
}

pub struct CountingReader {
    inner: BlobReader,
    counts: mpsc::UnboundedSender<usize>,
}

impl CountingReader {
    pub fn new(inner: BlobReader, counts: mpsc::UnboundedSender<usize>) -> CountingReader {
        CountingReader { inner, counts }
    }
}

impl AsyncRead for CountingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n > 0 {
                    // receiver gone means nobody cares about progress
                    let _ = me.counts.send(n);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn reader_reports_counts() {
        let data: Vec<u8> = vec![7u8; 10_000];
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut r = CountingReader::new(Box::new(std::io::Cursor::new(data)), tx);
        let mut out = Vec::new();
        r.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 10_000);
        drop(r);
        let mut total = 0;
        while let Some(n) = rx.recv().await {
            total += n;
        }
        assert_eq!(total, 10_000);
    }
}

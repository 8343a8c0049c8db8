//! Ordered reassembly of concurrently-delivered byte ranges.
//!
//! Downloads split an object into ranges fetched by concurrent workers, but
//! the destination is a forward-only sink: a freshly-created file written as
//! a stream, a pipe, stdout. This writer accepts ranges in any order and
//! emits bytes to the sink in strict offset order. A range that arrives at
//! the watermark goes straight through; anything ahead of the watermark is
//! copied into a pending set keyed by offset and flushed as soon as its
//! predecessors land. Workers never block on their siblings, at the memory
//! cost of whatever is currently out of order.

use std::collections::BTreeMap;

use bytes::Bytes;
use stevedore_io::WriteAt;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};

#[derive(Debug)]
pub struct OrderedWriter<W> {
    inner: Mutex<Inner<W>>,
}

#[derive(Debug)]
struct Inner<W> {
    sink: W,
    /// Bytes `[0, written)` have reached the sink, in order.
    written: u64,
    /// Out-of-order payloads, keyed by offset. All offsets are `> written`;
    /// chunks never overlap.
    pending: BTreeMap<u64, Bytes>,
}

impl<W> OrderedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(sink: W) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sink,
                written: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Bytes flushed to the sink so far.
    pub async fn written(&self) -> u64 {
        self.inner.lock().await.written
    }

    /// Number of buffered out-of-order chunks.
    pub async fn pending_chunks(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    /// Flush the sink and return it together with the watermark. Chunks
    /// still waiting behind a gap are discarded.
    ///
    /// # Errors
    /// Propagates the sink's flush error.
    pub async fn finish(self) -> std::io::Result<(W, u64)> {
        let mut inner = self.inner.into_inner();
        inner.sink.flush().await?;
        Ok((inner.sink, inner.written))
    }
}

impl<W> WriteAt for OrderedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Accept the payload for `offset`. The slice is copied if it cannot be
    /// written through immediately; it is never retained after return.
    ///
    /// A sink failure surfaces to the caller whose write triggered the
    /// flush. The watermark and pending set keep the successfully-written
    /// prefix, so later calls simply retry the flush.
    async fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        let mut inner = self.inner.lock().await;

        if offset < inner.written {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "offset {offset} overlaps already-written range [0, {})",
                    inner.written
                ),
            ));
        }

        // Fast path: an in-order write goes straight to the sink, no copy.
        if inner.pending.is_empty() && offset == inner.written {
            inner.sink.write_all(buf).await?;
            inner.written += buf.len() as u64;
            return Ok(buf.len());
        }

        inner.pending.insert(offset, Bytes::copy_from_slice(buf));

        let Inner {
            sink,
            written,
            pending,
        } = &mut *inner;
        while let Some(entry) = pending.first_entry() {
            if *entry.key() != *written {
                break;
            }
            // The chunk stays pending if the write errors, so a later call
            // re-drives the flush from the same watermark.
            sink.write_all(entry.get()).await?;
            *written += entry.get().len() as u64;
            entry.remove();
        }

        Ok(buf.len())
    }
}

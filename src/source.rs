//! Ordered iteration over compressed segments.
//!
//! [`SegmentSource`] yields one [`Segment`] per key, strictly in key order.
//! Absent objects come back with no stream. In direct mode an object is only
//! fetched when the consumer asks for it, so segments after a stop are never
//! touched. In prefetch mode a worker thread reads ahead over a bounded
//! channel (one object queued, one in flight). Closing the source or
//! cancelling the request abandons the in-flight read at the next chunk and
//! releases its body.
use std::io::{self, BufRead, BufReader, Cursor, Read};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use flate2::read::MultiGzDecoder;
use tracing::{debug, trace, warn};

use crate::error::{Result, SnapshotError, StorageError};
use crate::replay::CancelToken;
use crate::segment::SegmentKey;
use crate::store::{ObjectBody, ObjectStore};

/// One key of the request and its stream, if the object exists.
pub struct Segment {
    pub key: SegmentKey,
    pub stream: Option<SegmentStream>,
}

/// Decompressing reader over one segment object.
pub struct SegmentStream {
    key: SegmentKey,
    reader: BufReader<MultiGzDecoder<Box<dyn ObjectBody>>>,
}

impl SegmentStream {
    pub fn new(key: SegmentKey, body: Box<dyn ObjectBody>) -> Self {
        Self { key, reader: BufReader::new(MultiGzDecoder::new(body)) }
    }

    /// Decompressed bytes of the segment.
    pub fn reader(&mut self) -> &mut impl BufRead {
        &mut self.reader
    }

    /// Release the decoder and the underlying object.
    pub fn close(self) -> std::result::Result<(), StorageError> {
        let body = self.reader.into_inner().into_inner();
        body.close().map_err(|source| StorageError::Close { key: self.key.to_string(), source })
    }
}

const READ_CHUNK: usize = 64 * 1024;

type Fetched = (SegmentKey, std::result::Result<Option<Vec<u8>>, StorageError>);

enum Mode {
    Direct { store: Arc<dyn ObjectStore>, keys: std::vec::IntoIter<SegmentKey> },
    Prefetch { rx: Option<Receiver<Fetched>>, worker: Option<JoinHandle<()>>, stop: CancelToken },
}

pub struct SegmentSource {
    mode: Mode,
    cancel: CancelToken,
    done: bool,
}

impl SegmentSource {
    pub fn open(
        store: Arc<dyn ObjectStore>,
        keys: Vec<SegmentKey>,
        prefetch: bool,
        cancel: CancelToken,
    ) -> Result<Self> {
        let mode = if prefetch {
            // capacity 1: one finished object waiting while the next is fetched
            let (tx, rx) = bounded::<Fetched>(1);
            let stop = CancelToken::new();
            let (worker_cancel, worker_stop) = (cancel.clone(), stop.clone());
            let worker = std::thread::Builder::new()
                .name("segment-prefetch".into())
                .spawn(move || prefetch_worker(store, keys, tx, worker_cancel, worker_stop))
                .map_err(|e| StorageError::Prefetch(e.to_string()))?;
            Mode::Prefetch { rx: Some(rx), worker: Some(worker), stop }
        } else {
            Mode::Direct { store, keys: keys.into_iter() }
        };
        Ok(Self { mode, cancel, done: false })
    }

    /// Stop iterating, discard anything prefetched and wait for the worker.
    pub fn close(mut self) -> std::result::Result<(), StorageError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> std::result::Result<(), StorageError> {
        self.done = true;
        if let Mode::Prefetch { rx, worker, stop } = &mut self.mode {
            // stop before draining so freed capacity does not start another fetch
            stop.cancel();
            if let Some(rx) = rx.take() {
                let discarded = rx.try_iter().count();
                if discarded > 0 {
                    trace!(discarded, "dropping prefetched segments");
                }
            }
            if let Some(worker) = worker.take() {
                worker.join().map_err(|_| StorageError::Prefetch("worker panicked".into()))?;
            }
        }
        Ok(())
    }

    fn next_direct(store: &Arc<dyn ObjectStore>, key: SegmentKey) -> Result<Segment> {
        let body = store.fetch(&key)?;
        Ok(Segment { stream: body.map(|b| SegmentStream::new(key.clone(), b)), key })
    }

    fn next_prefetched(fetched: Fetched) -> Result<Segment> {
        let (key, bytes) = fetched;
        let stream = bytes?.map(|b| SegmentStream::new(key.clone(), Box::new(Cursor::new(b))));
        Ok(Segment { key, stream })
    }
}

impl Iterator for SegmentSource {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(SnapshotError::Cancelled));
        }
        let item = match &mut self.mode {
            Mode::Direct { store, keys } => keys.next().map(|key| Self::next_direct(store, key)),
            Mode::Prefetch { rx, .. } => match rx.as_ref().map(Receiver::recv) {
                Some(Ok(fetched)) => Some(Self::next_prefetched(fetched)),
                // worker finished or was cancelled
                _ if self.cancel.is_cancelled() => Some(Err(SnapshotError::Cancelled)),
                _ => None,
            },
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

impl Drop for SegmentSource {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "segment source shutdown failed");
        }
    }
}

/// Read a whole object in chunks, checking `halted` between them.
///
/// `Ok(None)` means the read was abandoned; the body is released either way.
fn read_object(
    key: &SegmentKey,
    mut body: Box<dyn ObjectBody>,
    halted: impl Fn() -> bool,
) -> std::result::Result<Option<Vec<u8>>, StorageError> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let read = loop {
        if halted() {
            break Ok(false);
        }
        match body.read(&mut chunk) {
            Ok(0) => break Ok(true),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(source) => break Err(StorageError::Fetch { key: key.to_string(), source }),
        }
    };
    let closed = body.close().map_err(|source| StorageError::Close { key: key.to_string(), source });
    match (read, closed) {
        (Ok(true), Ok(())) => Ok(Some(buf)),
        (Ok(false), closed) => {
            if let Err(e) = closed {
                debug!(error = %e, "release of abandoned segment failed");
            }
            Ok(None)
        }
        (Err(primary), Ok(())) => Err(primary),
        (Ok(true), Err(close)) => Err(close),
        (Err(primary), Err(close)) => Err(StorageError::compound(close, primary)),
    }
}

fn prefetch_worker(
    store: Arc<dyn ObjectStore>,
    keys: Vec<SegmentKey>,
    tx: Sender<Fetched>,
    cancel: CancelToken,
    stop: CancelToken,
) {
    let halted = || cancel.is_cancelled() || stop.is_cancelled();
    for key in keys {
        if halted() {
            debug!("prefetch halted");
            return;
        }
        let fetched = match store.fetch(&key) {
            Ok(Some(body)) => match read_object(&key, body, halted) {
                Ok(Some(bytes)) => Ok(Some(bytes)),
                Ok(None) => {
                    debug!(key = %key, "prefetch abandoned mid-object");
                    return;
                }
                Err(e) => Err(e),
            },
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        let failed = fetched.is_err();
        trace!(key = %key, failed, "prefetched segment");
        if tx.send((key, fetched)).is_err() {
            // consumer stopped; the object we just read is dropped here
            return;
        }
        if failed {
            return;
        }
    }
}

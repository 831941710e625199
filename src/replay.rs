//! Replay of capture records into a state engine up to a cutoff.
//!
//! The [`Dispatcher`] reads record heads first and compares any timestamp
//! against the cutoff before consuming the rest of the record. Once a
//! timestamp reaches the cutoff the dispatcher stops: nothing else in the
//! segment is read and no further segment is opened.
use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{ChannelSnapshot, EngineFactory, StateEngine};
use crate::error::{Result, SnapshotError, merge_close};
use crate::record::{LogRecord, Tokenizer};
use crate::scan::ScanCounter;
use crate::source::SegmentSource;

/// Where replay stops relative to the requested timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutoffPolicy {
    /// Stop at the first timestamp `>= cutoff`; the snapshot reflects state
    /// strictly before the requested instant.
    #[default]
    AtOrAfter,
    /// Stop at the first timestamp `> cutoff`; records stamped exactly at
    /// the requested instant are applied.
    After,
}

impl CutoffPolicy {
    pub fn reached(self, timestamp: i64, cutoff: i64) -> bool {
        match self {
            CutoffPolicy::AtOrAfter => timestamp >= cutoff,
            CutoffPolicy::After => timestamp > cutoff,
        }
    }
}

impl FromStr for CutoffPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "at-or-after" => Ok(CutoffPolicy::AtOrAfter),
            "after" => Ok(CutoffPolicy::After),
            other => Err(format!("unknown cutoff policy {other:?} (expected at-or-after or after)")),
        }
    }
}

/// Shared flag used to abort a request from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// How a single segment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// The segment was read to its end.
    Exhausted,
    /// A record at `timestamp` reached the cutoff.
    Stopped { timestamp: i64 },
}

/// Totals for one replay across segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub opened: u32,
    pub skipped: u32,
    pub stopped_at: Option<i64>,
}

pub struct Dispatcher {
    cutoff: i64,
    policy: CutoffPolicy,
    channels: Vec<String>,
    factory: EngineFactory,
    engine: Box<dyn StateEngine>,
    scanned: ScanCounter,
    stopped: bool,
    cancel: CancelToken,
}

impl Dispatcher {
    /// Create a dispatcher with an engine scoped to `channels`.
    pub fn new(
        cutoff: i64,
        policy: CutoffPolicy,
        channels: Vec<String>,
        factory: EngineFactory,
        cancel: CancelToken,
    ) -> Result<Self> {
        let engine = factory(&channels)?;
        Ok(Self { cutoff, policy, channels, factory, engine, scanned: ScanCounter::new(), stopped: false, cancel })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn scanned(&self) -> ScanCounter {
        self.scanned
    }

    pub fn take_snapshot(&mut self) -> Result<Vec<ChannelSnapshot>> {
        Ok(self.engine.take_snapshot()?)
    }

    /// Replay one decompressed segment. Bytes read are counted even when the
    /// segment fails.
    pub fn feed<R: BufRead>(&mut self, reader: R) -> Result<SegmentOutcome> {
        let mut tokenizer = Tokenizer::new(reader);
        let outcome = self.drain(&mut tokenizer);
        self.scanned.add_segment(tokenizer.scanned());
        if let Err(SnapshotError::Parse(e)) = &outcome {
            warn!(error = %e, offset = tokenizer.scanned(), "corrupt capture record");
        }
        outcome
    }

    fn drain<R: BufRead>(&mut self, tokenizer: &mut Tokenizer<R>) -> Result<SegmentOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled);
            }
            let Some(head) = tokenizer.next_head()? else {
                return Ok(SegmentOutcome::Exhausted);
            };
            if let Some(timestamp) = head.timestamp() {
                if self.policy.reached(timestamp, self.cutoff) {
                    self.stopped = true;
                    return Ok(SegmentOutcome::Stopped { timestamp });
                }
            }
            match tokenizer.read_body()? {
                LogRecord::Start { source_url } => {
                    debug!(source_url, "capture session start, re-creating engine");
                    self.engine = (self.factory)(&self.channels)?;
                    self.engine.process_start(source_url)?;
                }
                LogRecord::Message { channel, payload, .. } => self.engine.process_message(channel, payload)?,
                LogRecord::State { channel, payload } => self.engine.process_state(channel, payload)?,
                LogRecord::End { .. } | LogRecord::Unknown { .. } => {}
            }
        }
    }

    /// Replay segments in order until the cutoff is reached or the source
    /// runs out. Every opened stream is closed before the next one is opened.
    pub fn run(&mut self, source: &mut SegmentSource) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        for segment in source {
            if self.cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled);
            }
            let segment = segment?;
            let Some(mut stream) = segment.stream else {
                debug!(key = %segment.key, "skipping segment: did not exist");
                summary.skipped += 1;
                continue;
            };
            debug!(key = %segment.key, "reading segment");
            summary.opened += 1;
            let fed = self.feed(stream.reader());
            let outcome = merge_close(fed, stream.close())?;
            if let SegmentOutcome::Stopped { timestamp } = outcome {
                debug!(key = %segment.key, timestamp, "cutoff reached");
                summary.stopped_at = Some(timestamp);
                break;
            }
        }
        Ok(summary)
    }
}

//! Snapshot serialization.
//!
//! Every output line is `<nanosec>\t<channel>\t<payload>\n`, appended in the
//! order the engine reported its channels. A formatter, when present, may
//! turn one channel state into any number of lines; the post-filter runs on
//! the formatted lines, so formatters always see the full channel set.
use std::collections::BTreeSet;

use tracing::trace;

use crate::engine::{ChannelSnapshot, FormattedLine, Formatter};
use crate::error::Result;
use crate::record::{FIELD_SEP, RECORD_END};

/// Serialized snapshot and line counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Assembled {
    pub body: Vec<u8>,
    pub lines: usize,
    pub suppressed: usize,
}

impl Assembled {
    /// No channel produced a line; the caller sees "no data".
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

fn push_line(body: &mut Vec<u8>, nanosec: &[u8], channel: &str, payload: &[u8]) {
    body.extend_from_slice(nanosec);
    body.push(FIELD_SEP);
    body.extend_from_slice(channel.as_bytes());
    body.push(FIELD_SEP);
    body.extend_from_slice(payload);
    body.push(RECORD_END);
}

pub fn assemble(
    nanosec: i64,
    snapshots: &[ChannelSnapshot],
    mut formatter: Option<&mut (dyn Formatter + '_)>,
    filter: Option<&BTreeSet<String>>,
) -> Result<Assembled> {
    let stamp = nanosec.to_string();
    let mut out = Assembled::default();
    let allowed = |channel: &str| filter.is_none_or(|f| f.contains(channel));

    for snap in snapshots {
        let lines = match formatter.as_deref_mut() {
            Some(f) => f.format(&snap.channel, &snap.state)?,
            None => vec![FormattedLine { channel: snap.channel.clone(), payload: snap.state.clone() }],
        };
        trace!(channel = %snap.channel, lines = lines.len(), "formatted channel");
        for line in lines {
            if !allowed(&line.channel) {
                out.suppressed += 1;
                continue;
            }
            push_line(&mut out.body, stamp.as_bytes(), &line.channel, &line.payload);
            out.lines += 1;
        }
    }
    Ok(out)
}

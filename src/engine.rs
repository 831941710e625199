//! Pluggable state engines and formatters.
//!
//! A [`StateEngine`] ingests replayed records for one exchange and rebuilds
//! per-channel state; a [`Formatter`] renders that state into a requested
//! output encoding. Both are selected per exchange through an
//! [`EngineRegistry`].
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::trace;

use crate::book::{DepthEngine, LevelsFormatter};
use crate::error::{EngineError, FormatterError};

/// Format name meaning "no formatter, emit engine state as is".
pub const RAW_FORMAT: &str = "raw";

/// Final state of one channel as reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: String,
    pub state: Vec<u8>,
}

/// One output line produced by a formatter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedLine {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Exchange-specific state reconstruction.
///
/// Channel names and payloads passed in are borrowed from the tokenizer and
/// must be copied if retained.
pub trait StateEngine: Send {
    /// A new capture session begins at `source_url`.
    fn process_start(&mut self, source_url: &str) -> Result<(), EngineError>;

    fn process_message(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError>;

    /// Apply a recorder-emitted baseline for `channel`.
    fn process_state(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError>;

    /// Current state of every tracked channel, in engine-defined order.
    fn take_snapshot(&mut self) -> Result<Vec<ChannelSnapshot>, EngineError>;
}

pub trait Formatter: Send {
    fn format(&mut self, channel: &str, state: &[u8]) -> Result<Vec<FormattedLine>, FormatterError>;
}

/// Builds an engine scoped to exactly the given channels.
pub type EngineFactory = Arc<dyn Fn(&[String]) -> Result<Box<dyn StateEngine>, EngineError> + Send + Sync>;

pub type FormatterFactory = Arc<dyn Fn(&[String]) -> Result<Box<dyn Formatter>, FormatterError> + Send + Sync>;

/// Built-in engine implementations an exchange can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Price-level order book per channel.
    Depth,
    /// Latest payload per channel.
    LastValue,
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depth" => Ok(EngineKind::Depth),
            "last" => Ok(EngineKind::LastValue),
            other => Err(format!("unknown engine kind {other:?} (expected depth or last)")),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Depth => "depth",
            EngineKind::LastValue => "last",
        })
    }
}

#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, EngineFactory>,
    formatters: HashMap<(String, String), FormatterFactory>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_engine(&mut self, exchange: impl Into<String>, factory: EngineFactory) -> &mut Self {
        self.engines.insert(exchange.into(), factory);
        self
    }

    pub fn register_formatter(
        &mut self,
        exchange: impl Into<String>,
        format: impl Into<String>,
        factory: FormatterFactory,
    ) -> &mut Self {
        self.formatters.insert((exchange.into(), format.into()), factory);
        self
    }

    /// Bind `exchange` to a built-in engine and its formatters.
    pub fn bind(&mut self, exchange: &str, kind: EngineKind) -> &mut Self {
        match kind {
            EngineKind::Depth => {
                self.register_engine(exchange, Arc::new(|channels: &[String]| {
                    Ok::<_, EngineError>(Box::new(DepthEngine::new(channels)) as Box<dyn StateEngine>)
                }));
                self.register_formatter(exchange, LevelsFormatter::NAME, Arc::new(|_channels: &[String]| {
                    Ok::<_, FormatterError>(Box::new(LevelsFormatter) as Box<dyn Formatter>)
                }));
            }
            EngineKind::LastValue => {
                self.register_engine(exchange, Arc::new(|channels: &[String]| {
                    Ok::<_, EngineError>(Box::new(LastValueEngine::new(channels)) as Box<dyn StateEngine>)
                }));
            }
        }
        self
    }

    pub fn engine_factory(&self, exchange: &str) -> Result<EngineFactory, EngineError> {
        self.engines
            .get(exchange)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedExchange(exchange.to_string()))
    }

    /// Formatter for `format`, or `None` for [`RAW_FORMAT`].
    pub fn formatter(
        &self,
        exchange: &str,
        format: &str,
        channels: &[String],
    ) -> Result<Option<Box<dyn Formatter>>, FormatterError> {
        if format == RAW_FORMAT {
            return Ok(None);
        }
        let factory = self
            .formatters
            .get(&(exchange.to_string(), format.to_string()))
            .ok_or_else(|| FormatterError::Unsupported { exchange: exchange.to_string(), format: format.to_string() })?;
        factory(channels).map(Some)
    }
}

/// Keeps the latest message or state payload of each requested channel.
#[derive(Debug, Default)]
pub struct LastValueEngine {
    channels: Vec<String>,
    latest: HashMap<String, Vec<u8>>,
}

impl LastValueEngine {
    pub fn new(channels: &[String]) -> Self {
        Self { channels: channels.to_vec(), latest: HashMap::new() }
    }

    fn store(&mut self, channel: &str, payload: &[u8]) {
        if !self.channels.iter().any(|c| c == channel) {
            trace!(channel, "ignoring unrequested channel");
            return;
        }
        let slot = self.latest.entry(channel.to_string()).or_default();
        slot.clear();
        slot.extend_from_slice(payload);
    }
}

impl StateEngine for LastValueEngine {
    fn process_start(&mut self, _source_url: &str) -> Result<(), EngineError> {
        self.latest.clear();
        Ok(())
    }

    fn process_message(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.store(channel, payload);
        Ok(())
    }

    fn process_state(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError> {
        self.store(channel, payload);
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<Vec<ChannelSnapshot>, EngineError> {
        Ok(self
            .channels
            .iter()
            .filter_map(|c| self.latest.get(c).map(|s| ChannelSnapshot { channel: c.clone(), state: s.clone() }))
            .collect())
    }
}

//! Price-level order book engine and its formatter.
//!
//! This module defines a minimal Level-2 book (`Book`, keyed by [`Price`])
//! plus the text grammar the depth engine consumes:
//! - Message payload: `;`-separated level updates `<b|a> <price> <qty>`,
//!   a zero quantity removes the level
//! - State payload: full book replacement in the same grammar
//!
//! [`DepthEngine`] keeps one book per requested channel and renders it back
//! in the same grammar (bids best first, then asks best first).
//! [`LevelsFormatter`] fans a rendered book out into one line per level.
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::trace;

use crate::engine::{ChannelSnapshot, FormattedLine, Formatter, StateEngine};
use crate::error::{EngineError, FormatterError};

/// Level price, totally ordered.
#[derive(Debug, Clone, Copy)]
pub struct Price(pub f64);

impl PartialEq for Price {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Price {}

impl PartialOrd for Price {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Price {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    fn code(self) -> &'static str {
        match self {
            Side::Bid => "b",
            Side::Ask => "a",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }
}

/// One `<side> <price> <qty>` update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelUpdate {
    pub side: Side,
    pub price: f64,
    pub qty: f64,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Book {
    /// Bid levels; best is the last key.
    pub bids: BTreeMap<Price, f64>,
    /// Ask levels; best is the first key.
    pub asks: BTreeMap<Price, f64>,
}

impl Book {
    /// Replace both sides with the given levels.
    pub fn apply_full(&mut self, levels: &[LevelUpdate]) {
        self.bids.clear();
        self.asks.clear();
        for u in levels {
            self.apply_level(*u);
        }
    }

    /// Set or (with zero quantity) remove one level.
    pub fn apply_level(&mut self, u: LevelUpdate) {
        let side = match u.side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if u.qty == 0.0 {
            side.remove(&Price(u.price));
        } else {
            side.insert(Price(u.price), u.qty);
        }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, q)| (p.0, *q))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, q)| (p.0, *q))
    }

    /// Levels best first: bids descending, then asks ascending.
    pub fn levels(&self) -> impl Iterator<Item = LevelUpdate> + '_ {
        let bids = self.bids.iter().rev().map(|(p, q)| LevelUpdate { side: Side::Bid, price: p.0, qty: *q });
        let asks = self.asks.iter().map(|(p, q)| LevelUpdate { side: Side::Ask, price: p.0, qty: *q });
        bids.chain(asks)
    }

    /// Render in the payload grammar, e.g. `b 100 1;b 99.5 2;a 101 1`.
    pub fn render(&self) -> String {
        self.levels().map(|l| format!("{} {} {}", l.side.code(), l.price, l.qty)).collect::<Vec<_>>().join(";")
    }
}

/// Parse a `;`-separated list of level updates. Empty items are ignored.
pub fn parse_levels(payload: &[u8]) -> Result<Vec<LevelUpdate>, String> {
    let text = std::str::from_utf8(payload).map_err(|_| "payload is not UTF-8".to_string())?;
    let mut out = Vec::new();
    for item in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = item.split_whitespace();
        let (Some(side), Some(price), Some(qty), None) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
            return Err(format!("expected `<b|a> <price> <qty>`, got {item:?}"));
        };
        let side = match side {
            "b" => Side::Bid,
            "a" => Side::Ask,
            other => return Err(format!("unknown side {other:?}")),
        };
        let price: f64 = price.parse().map_err(|_| format!("invalid price {price:?}"))?;
        let qty: f64 = qty.parse().map_err(|_| format!("invalid quantity {qty:?}"))?;
        if !price.is_finite() || !qty.is_finite() || qty < 0.0 {
            return Err(format!("level out of range: {item:?}"));
        }
        out.push(LevelUpdate { side, price, qty });
    }
    Ok(out)
}

/// One book per requested channel.
#[derive(Debug, Default)]
pub struct DepthEngine {
    channels: Vec<String>,
    books: HashMap<String, Book>,
}

impl DepthEngine {
    pub fn new(channels: &[String]) -> Self {
        Self { channels: channels.to_vec(), books: HashMap::new() }
    }

    pub fn book(&self, channel: &str) -> Option<&Book> {
        self.books.get(channel)
    }

    fn tracks(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }

    fn parse(channel: &str, payload: &[u8]) -> Result<Vec<LevelUpdate>, EngineError> {
        parse_levels(payload).map_err(|reason| EngineError::Payload { channel: channel.to_string(), reason })
    }
}

impl StateEngine for DepthEngine {
    fn process_start(&mut self, source_url: &str) -> Result<(), EngineError> {
        trace!(source_url, "new capture session");
        self.books.clear();
        Ok(())
    }

    fn process_message(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError> {
        if !self.tracks(channel) {
            return Ok(());
        }
        // parse everything first so a bad update leaves the book untouched
        let updates = Self::parse(channel, payload)?;
        let book = self.books.entry(channel.to_string()).or_default();
        for u in updates {
            book.apply_level(u);
        }
        Ok(())
    }

    fn process_state(&mut self, channel: &str, payload: &[u8]) -> Result<(), EngineError> {
        if !self.tracks(channel) {
            return Ok(());
        }
        let levels = Self::parse(channel, payload)?;
        self.books.entry(channel.to_string()).or_default().apply_full(&levels);
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<Vec<ChannelSnapshot>, EngineError> {
        Ok(self
            .channels
            .iter()
            .filter_map(|c| {
                self.books.get(c).map(|b| ChannelSnapshot { channel: c.clone(), state: b.render().into_bytes() })
            })
            .collect())
    }
}

/// Renders a depth snapshot as one `bid|ask <price> <qty>` line per level,
/// or a single empty line for an empty book.
#[derive(Debug, Default, Clone, Copy)]
pub struct LevelsFormatter;

impl LevelsFormatter {
    pub const NAME: &'static str = "levels";
}

impl Formatter for LevelsFormatter {
    fn format(&mut self, channel: &str, state: &[u8]) -> Result<Vec<FormattedLine>, FormatterError> {
        let levels =
            parse_levels(state).map_err(|reason| FormatterError::Render { channel: channel.to_string(), reason })?;
        if levels.is_empty() {
            // an empty book is still a tracked channel
            return Ok(vec![FormattedLine { channel: channel.to_string(), payload: Vec::new() }]);
        }
        Ok(levels
            .into_iter()
            .map(|l| FormattedLine {
                channel: channel.to_string(),
                payload: format!("{} {} {}", l.side.label(), l.price, l.qty).into_bytes(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(chans: &[&str]) -> DepthEngine {
        let chans: Vec<String> = chans.iter().map(|s| s.to_string()).collect();
        DepthEngine::new(&chans)
    }

    #[test]
    fn levels_apply_and_render_best_first() {
        let mut b = Book::default();
        b.apply_full(&parse_levels(b"b 99 2;b 100 1;a 102 3;a 101 1").unwrap());
        assert_eq!(b.best_bid(), Some((100.0, 1.0)));
        assert_eq!(b.best_ask(), Some((101.0, 1.0)));
        assert_eq!(b.render(), "b 100 1;b 99 2;a 101 1;a 102 3");

        b.apply_level(LevelUpdate { side: Side::Bid, price: 100.0, qty: 0.0 });
        b.apply_level(LevelUpdate { side: Side::Ask, price: 101.5, qty: 0.25 });
        assert_eq!(b.render(), "b 99 2;a 101 1;a 101.5 0.25;a 102 3");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_levels(b"b 100").is_err());
        assert!(parse_levels(b"x 100 1").is_err());
        assert!(parse_levels(b"b abc 1").is_err());
        assert!(parse_levels(b"b 100 -1").is_err());
        assert!(parse_levels(b"b 100 1 extra").is_err());
        assert_eq!(parse_levels(b" ; b 1 1 ;").unwrap().len(), 1);
        assert!(parse_levels(b"").unwrap().is_empty());
    }

    #[test]
    fn engine_state_then_messages() {
        let mut e = engine(&["book"]);
        e.process_state("book", b"b 100 1;a 101 1").unwrap();
        e.process_message("book", b"b 100 0;b 99 5").unwrap();
        e.process_message("trades", b"not a level update").unwrap();
        let snap = e.take_snapshot().unwrap();
        assert_eq!(snap, vec![ChannelSnapshot { channel: "book".into(), state: b"b 99 5;a 101 1".to_vec() }]);
    }

    #[test]
    fn malformed_message_leaves_book_untouched() {
        let mut e = engine(&["book"]);
        e.process_message("book", b"b 100 1").unwrap();
        let err = e.process_message("book", b"b 101 1;b oops 1").unwrap_err();
        assert!(matches!(err, EngineError::Payload { ref channel, .. } if channel == "book"));
        assert_eq!(e.book("book").unwrap().render(), "b 100 1");
    }

    #[test]
    fn start_clears_books_and_snapshot_follows_channel_order() {
        let mut e = engine(&["b2", "b1", "b3"]);
        e.process_message("b1", b"a 5 1").unwrap();
        e.process_message("b2", b"a 6 1").unwrap();
        let order: Vec<_> = e.take_snapshot().unwrap().into_iter().map(|s| s.channel).collect();
        assert_eq!(order, vec!["b2", "b1"]);

        e.process_start("wss://other").unwrap();
        assert!(e.take_snapshot().unwrap().is_empty());
    }

    #[test]
    fn levels_formatter_fans_out() {
        let mut f = LevelsFormatter;
        let lines = f.format("book", b"b 100 1;b 99 2;a 101 1").unwrap();
        let payloads: Vec<_> = lines.iter().map(|l| String::from_utf8(l.payload.clone()).unwrap()).collect();
        assert_eq!(payloads, vec!["bid 100 1", "bid 99 2", "ask 101 1"]);
        assert!(lines.iter().all(|l| l.channel == "book"));
        let empty = f.format("book", b"").unwrap();
        assert_eq!(empty.len(), 1);
        assert!(empty[0].payload.is_empty());
        assert!(matches!(f.format("book", b"???"), Err(FormatterError::Render { .. })));
    }
}

//! Point-in-time market data snapshots from segmented capture logs.
//!
//! This crate rebuilds the per-channel state of an exchange feed as of a
//! nanosecond timestamp by replaying minute segments of a text capture log
//! into a pluggable state engine, stopping as soon as the cutoff is reached:
//!
//! - `record`: capture record grammar and the byte-counting tokenizer
//! - `replay`: dispatcher, cutoff policy and cancellation
//! - `segment`, `manifest`, `store`, `source`: which segments to read, where
//!   they live, and ordered (optionally prefetched) gzip streaming
//! - `engine`, `book`: state engine and formatter seams with the built-in
//!   depth and last-value engines
//! - `snapshot`, `request`, `service`: assembly of the response and the
//!   request handler with auth and usage billing
//! - `writer`: turns a plain capture into segments and a manifest
//!
//! The binaries (`src/main.rs` and `src/bin/pack.rs`) serve a snapshot from
//! a local segment directory and build such directories.
pub mod book;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod record;
pub mod replay;
pub mod request;
pub mod scan;
pub mod segment;
pub mod service;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod writer;

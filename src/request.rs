//! Request surface: raw parameters, validated requests, responses.
use std::collections::BTreeSet;
use std::fmt;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::engine::RAW_FORMAT;
use crate::error::{Result, SnapshotError};

/// Parameters as received from the caller, before validation.
#[derive(Debug, Clone, Default)]
pub struct RequestParams {
    pub exchange: Option<String>,
    pub nanosec: Option<String>,
    pub channels: Vec<String>,
    pub format: Option<String>,
    pub filter: Vec<String>,
    pub token: Option<String>,
}

/// A validated snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub exchange: String,
    pub nanosec: i64,
    /// Requested channels, unique, in first-seen order.
    pub channels: Vec<String>,
    pub format: String,
    pub filter: Option<BTreeSet<String>>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn unique_in_order(values: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && seen.insert(v.to_string()))
        .map(str::to_string)
        .collect()
}

impl SnapshotRequest {
    pub fn from_params(params: &RequestParams) -> Result<Self> {
        let exchange = non_empty(params.exchange.as_deref())
            .ok_or_else(|| SnapshotError::validation("exchange is required"))?
            .to_string();

        let raw_ns = non_empty(params.nanosec.as_deref())
            .ok_or_else(|| SnapshotError::validation("nanosec is required"))?;
        let nanosec: i64 = raw_ns
            .parse()
            .map_err(|_| SnapshotError::validation(format!("nanosec must be an integer, got {raw_ns:?}")))?;
        if nanosec < 0 {
            return Err(SnapshotError::validation(format!("nanosec must not be negative, got {nanosec}")));
        }

        let channels = unique_in_order(&params.channels);
        if channels.is_empty() {
            return Err(SnapshotError::validation("at least one channel is required"));
        }

        let format = non_empty(params.format.as_deref()).unwrap_or(RAW_FORMAT).to_string();

        let filter = unique_in_order(&params.filter);
        let filter = (!filter.is_empty()).then(|| filter.into_iter().collect());

        Ok(Self { exchange, nanosec, channels, format, filter })
    }
}

/// Outcome class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Empty,
    Validation,
    Auth,
    Internal,
}

impl Status {
    /// HTTP-style status code.
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Empty => 404,
            Status::Validation => 400,
            Status::Auth => 401,
            Status::Internal => 500,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::Empty)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::Empty => "no data",
            Status::Validation => "invalid request",
            Status::Auth => "unauthorized",
            Status::Internal => "internal error",
        };
        write!(f, "{} {name}", self.code())
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotResponse {
    pub status: Status,
    /// Serialized snapshot on success, the error message otherwise.
    pub body: Vec<u8>,
    /// Decompressed bytes read while replaying.
    pub scanned: u64,
    /// Usage units charged to the caller.
    pub billed: u64,
}

impl SnapshotResponse {
    pub fn error(err: &SnapshotError, scanned: u64) -> Self {
        Self { status: err.status(), body: err.to_string().into_bytes(), scanned, billed: 0 }
    }
}

/// Render a nanosecond timestamp as RFC 3339 for logs.
pub fn format_nanos(nanosec: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(nanosec as i128)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| nanosec.to_string())
}

/// Parse either integer nanoseconds or an RFC 3339 instant into nanoseconds.
pub fn parse_instant(value: &str) -> std::result::Result<i64, String> {
    let value = value.trim();
    if let Ok(ns) = value.parse::<i64>() {
        return Ok(ns);
    }
    let t = OffsetDateTime::parse(value, &Rfc3339).map_err(|e| format!("invalid instant {value:?}: {e}"))?;
    i64::try_from(t.unix_timestamp_nanos()).map_err(|_| format!("instant {value:?} out of range"))
}

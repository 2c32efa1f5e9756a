//! Incremental reader for the edge's JSON access log.
//!
//! The tailer remembers a byte offset into the file and only reads what was
//! appended since. Reading and advancing are separate steps: a cycle reads a
//! batch, persists it, and only then commits the batch's end offset, so a
//! failed commit re-reads the same lines on the next poll.
//!
//! # Line format
//!
//! One JSON object per line with the fields `timestamp`, `url`, `remote_ip`,
//! `request_id`, `method`, `status`, `rate_limited`, `user_agent`,
//! `nginx_latency_s`, `backend_latency_s` and `user_id`. Numeric fields may be
//! JSON numbers or strings, as nginx emits them quoted.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use super::Collection;
use crate::model::{MetricSnapshot, new_id, service_for_url};

/// Records read from the log and the offset just past the last consumed line.
#[derive(Debug)]
pub struct LogBatch {
    pub records: Collection<MetricSnapshot>,
    pub end_offset: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAccessLogEntry {
    timestamp: String,
    url: String,
    remote_ip: String,
    request_id: String,
    method: String,
    status: Value,
    rate_limited: Value,
    user_agent: String,
    nginx_latency_s: Value,
    backend_latency_s: Value,
    user_id: Option<String>,
}

pub struct AccessLogTailer {
    path: PathBuf,
    offset: u64,
}

impl AccessLogTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the committed offset.
    ///
    /// Does not advance the offset. A trailing line without a newline is left
    /// for the next poll. If the file is now shorter than the committed
    /// offset it was truncated or rotated, and reading restarts at zero.
    pub async fn read_batch(&self) -> LogBatch {
        let unchanged = |records| LogBatch {
            records,
            end_offset: self.offset,
        };

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Access log not found");
                return unchanged(Collection::Empty);
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open access log");
                return unchanged(Collection::failed(e.to_string()));
            }
        };

        let len = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => return unchanged(Collection::failed(e.to_string())),
        };

        let start = if len < self.offset {
            warn!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Access log shrank, reading from the start"
            );
            0
        } else {
            self.offset
        };

        let buf = match read_from(&mut file, start).await {
            Ok(buf) => buf,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read access log");
                return unchanged(Collection::failed(e.to_string()));
            }
        };

        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(last_newline) => last_newline + 1,
            None => 0,
        };

        let now = Utc::now().naive_utc();
        let records: Vec<MetricSnapshot> = String::from_utf8_lossy(&buf[..consumed])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| parse_line(line, now))
            .collect();

        if !records.is_empty() {
            info!(count = records.len(), "Parsed new access log entries");
        }

        LogBatch {
            records: Collection::from_items(records),
            end_offset: start + consumed as u64,
        }
    }

    /// Advance the committed offset after the batch ending there was persisted.
    pub fn commit_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Read and commit in one step.
    pub async fn parse_new_entries(&mut self) -> Vec<MetricSnapshot> {
        let batch = self.read_batch().await;
        self.commit_offset(batch.end_offset);
        batch.records.into_items()
    }

    /// Forget the offset; the next read starts at the beginning of the file.
    pub fn reset_position(&mut self) {
        self.offset = 0;
        info!(path = %self.path.display(), "Access log position reset");
    }

    /// Current size of the log file, or 0 if it does not exist.
    pub async fn file_size(&self) -> u64 {
        tokio::fs::metadata(&self.path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0)
    }
}

async fn read_from(file: &mut File, start: u64) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Parse one log line. Malformed JSON, a missing or non-numeric status, or a
/// non-numeric edge latency is logged and the line skipped.
fn parse_line(line: &str, now: NaiveDateTime) -> Option<MetricSnapshot> {
    let raw: RawAccessLogEntry = match serde_json::from_str(line.trim()) {
        Ok(raw) => raw,
        Err(e) => {
            let excerpt: String = line.chars().take(100).collect();
            warn!(error = %e, line = %excerpt, "Skipping malformed access log line");
            return None;
        }
    };

    let Some(status) = number(&raw.status) else {
        warn!(status = %raw.status, url = %raw.url, "Skipping access log line with non-numeric status");
        return None;
    };
    let nginx_latency_s = match &raw.nginx_latency_s {
        Value::Null => 0.0,
        value => match number(value) {
            Some(latency) => latency,
            None => {
                warn!(latency = %value, url = %raw.url, "Skipping access log line with non-numeric latency");
                return None;
            }
        },
    };

    let timestamp = parse_timestamp(&raw.timestamp).unwrap_or_else(|| {
        debug!(timestamp = %raw.timestamp, "Unparsable timestamp, using current time");
        now
    });

    Some(MetricSnapshot {
        id: new_id(),
        timestamp,
        service: service_for_url(&raw.url).to_string(),
        remote_ip: raw.remote_ip,
        request_id: raw.request_id,
        method: raw.method,
        status: status as i32,
        rate_limited: flag(&raw.rate_limited),
        user_agent: raw.user_agent,
        nginx_latency_ms: nginx_latency_s * 1000.0,
        backend_latency_ms: number(&raw.backend_latency_s).map(|s| s * 1000.0),
        user_id: raw.user_id.filter(|id| !id.is_empty()),
        url: raw.url,
    })
}

/// ISO-8601 with an offset is converted to UTC; without one it is taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "true" | "1"),
        _ => false,
    }
}

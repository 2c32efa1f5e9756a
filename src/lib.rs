//! Vigil - monitoring and security analytics for a fleet of authentication
//! services.
//!
//! # Overview
//!
//! Vigil tails the edge proxy's access log, scans rate-limit counters and
//! probes its own dependencies on a fixed interval. Raw snapshots are rolled
//! up into hourly per-service summaries, scanned for abusive traffic, and
//! purged once they age out.
//!
//! # Pipeline
//!
//! ```text
//! collectors -> collection -> storage -> aggregation / security -> retention
//!                                  ^
//!                                  +-- api (read-only queries, triggers)
//! ```
//!
//! Every periodic stage runs as a [`scheduler`] loop inside one process.
//!
//! # Modules
//!
//! - [`model`]: Data types for snapshots, summaries and detected activity
//! - [`storage`]: SQLite storage layer
//! - [`collectors`]: Access-log tailer, rate-limit scanner and health prober
//! - [`collection`]: One transactional collection cycle
//! - [`aggregation`]: Hourly summaries and percentiles
//! - [`security`]: Rule-based detection and threat assessment
//! - [`retention`]: Age-based purging
//! - [`scheduler`]: Background loops with graceful shutdown
//! - [`triggers`]: On-demand engine runs
//! - [`api`]: HTTP API handlers

pub mod aggregation;
pub mod api;
pub mod collection;
pub mod collectors;
pub mod config;
pub mod counters;
pub mod crypto;
pub mod error;
pub mod model;
pub mod retention;
pub mod scheduler;
pub mod security;
pub mod storage;
pub mod triggers;

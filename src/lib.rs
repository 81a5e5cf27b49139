//! # crowdclaim
//!
//! Claim coordination for crowdsourced annotation surveys.
//!
//! Hands work units to anonymous crowd workers under per-unit capacity
//! limits, records each completion exactly once, and returns abandoned
//! claims to the pool. All coordination goes through store transactions
//! (Postgres via sqlx, or the in-memory store), with OpenTelemetry
//! observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod outcome;
pub mod policy;
pub mod retry;
pub mod store;
pub mod telemetry;

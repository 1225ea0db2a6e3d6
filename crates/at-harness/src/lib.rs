//! Harness — reliability and operational infrastructure shared by the
//! tracker client, the worker pool, and the daemon.
//!
//! - [`circuit_breaker`] — per-organisation, store-backed circuit breaker
//!   fronting the tracker client (spec §4.2).
//! - [`rate_limiter`] — in-process token-bucket and sliding-window LRU rate
//!   limiters for public endpoints (spec §4.11).
//! - [`security`] — constant-time worker API key comparison and startup
//!   environment validation (spec §4.11).
//! - [`shutdown`] — cooperative shutdown coordination.
//! - [`trace_ctx`] — W3C trace-context propagation for correlating a
//!   session's store calls, tracker calls, and agent-process spawns.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod security;
pub mod shutdown;
pub mod trace_ctx;

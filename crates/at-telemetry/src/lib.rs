//! Logging infrastructure for the control-plane services.
//!
//! Structured, human-readable or JSON-formatted output via `tracing-subscriber`,
//! driven by `RUST_LOG`/config-file level, shared by the daemon and worker
//! binaries.

pub mod logging;

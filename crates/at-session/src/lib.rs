//! Per-worktree supervisor state: the `.agent/` directory a session's
//! orchestrator writes inside its own scratch working tree.
//!
//! This is deliberately not shared coordination state — that lives in the
//! store (`at_core::store`). It's the local crash-recovery record an
//! orchestrator reads on resume to decide what phase a session was in and
//! how many recovery attempts it has already burned.

pub mod session;

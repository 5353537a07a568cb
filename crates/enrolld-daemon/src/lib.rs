//! enrolld-daemon - Registration Allocation Daemon Library
//!
//! The runtime around `enrolld-core`: SQLite-backed stores, the timer-driven
//! allocation cycle, the finalization pipeline (submission, charge capture,
//! notifications), the human-verification resume service, and a Unix-socket
//! control plane.
//!
//! # Runtime Requirements
//!
//! The engine drives blocking SQLite and `ureq` collaborator calls through
//! the tokio runtime; the `enrolld` binary configures a multi-threaded
//! runtime. Library users embedding the engine should do the same.
//!
//! # Modules
//!
//! - [`store`]: SQLite persistence and the per-session allocation transaction
//! - [`engine`]: cycle orchestration, finalization, resume, collaborator
//!   seams
//! - [`notify`]: best-effort notification dispatch with an audit log
//! - [`protocol`]: typed control-plane messages (trigger-cycle, resume)
//! - [`server`]: Unix-socket JSON-line control plane

pub mod engine;
pub mod notify;
pub mod protocol;
pub mod server;
pub mod store;

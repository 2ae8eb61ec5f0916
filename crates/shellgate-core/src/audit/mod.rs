//! Durable, append-only audit log.
//!
//! | Item              | Role                                              |
//! |-------------------|---------------------------------------------------|
//! | `AuditLog`        | async append / read / verify trait                |
//! | `JsonlAuditLog`   | one JSON entry per line, fsync per append         |
//! | `MemoryAuditLog`  | in-memory fake                                    |
//! | `AuditEntry`      | sealed entry with `seq`, `prev_digest`, `digest`  |
//!
//! Entries form a SHA-256 hash chain, so editing or deleting a line is
//! detected by `verify()`.

pub mod entry;
pub mod error;
pub mod fakes;
pub mod store;

pub use entry::{verify_chain, AuditEntry, AuditOutcome, AuditRecord};
pub use error::{AuditError, AuditResult};
pub use fakes::MemoryAuditLog;
pub use store::{AuditLog, JsonlAuditLog};

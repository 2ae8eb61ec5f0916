//! Sandbox executor.
//!
//! - [`executor`] - `SandboxExecutor::execute()` for every `SandboxMode`
//! - [`overlay`] - disposable Simulation root
//! - [`process`] - spawn, capture, timeout, graceful-then-forced stop
//! - [`lock`] - per-scope execution locks for real-system runs
//! - [`worker`] - mpsc request / oneshot reply front end
//! - [`error`] - `SandboxError`

pub mod error;
pub mod executor;
pub mod lock;
pub mod overlay;
pub mod process;
pub mod worker;

pub use error::{SandboxError, SandboxResult};
pub use executor::{ExecRequest, SandboxExecutor};
pub use lock::{LockGuard, LockScope, ResourceLocks};
pub use worker::{spawn_executor, ExecutorHandle};

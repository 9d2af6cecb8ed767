//! `jobline-core`: building blocks shared by the job executor.
//!
//! This crate contains **pure** primitives (no IO, no threads): identifiers,
//! optimistic-concurrency expectations and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{ExecutionContextId, IncidentId, JobId, LockOwner};
pub use version::ExpectedVersion;

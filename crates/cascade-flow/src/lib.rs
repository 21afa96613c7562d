//! Flow control between Cascade stages.
//!
//! Everything here sits between a Spoke that receives events and the
//! collaborator call that turns them into new events: recent text is kept
//! in a [`ContextWindow`], bursts are merged by an [`IntervalGate`], the
//! expensive image stage is guarded by an [`AdmissionQueue`], and blocking
//! collaborator calls run on a [`WorkerPool`].

pub mod admission;
pub mod clock;
pub mod context;
pub mod interval;
pub mod worker;

pub use admission::{AdmissionQueue, GenerationRequest, Rejection, RequestState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::ContextWindow;
pub use interval::IntervalGate;
pub use worker::{WorkerError, WorkerPool};

//! Message bus for Cascade stages.
//!
//! Every stage exposes one [`Hub`]: a WebSocket endpoint that broadcasts the
//! stage's envelopes to whoever is connected and hands inbound envelopes to
//! a single handler. A stage subscribes to another stage through a
//! [`Spoke`], which keeps reconnecting for as long as the stage runs.

pub mod connection;
pub mod events;
pub mod handler;
pub mod server;
pub mod spoke;
pub mod state;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use handler::{EnvelopeHandler, FnHandler, handler_fn};
pub use server::{Hub, HubHandle};
pub use spoke::Spoke;
pub use state::HubState;

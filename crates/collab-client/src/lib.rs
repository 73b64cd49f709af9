//! Client side of the collaboration hub: a websocket connection with typed
//! send helpers, plus [`Presence`] for folding server events into local state.

pub mod client;
pub mod presence;

pub use client::{ClientError, CollabClient};
pub use presence::Presence;

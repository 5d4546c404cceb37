//! The node's long-lived, reconnecting signaling stream to the
//! controller (§4.7).
//!
//! Exactly one stream is active at a time: `connect` performs the
//! first join inline so the caller gets an immediate answer (or
//! error) for login, then hands back a handle whose background task
//! keeps the stream alive, reconnecting with exponential backoff and
//! re-joining (so the controller re-issues `INIT`) whenever the
//! socket drops.

mod client;
mod frame;

pub use client::{connect, ClientEvent, ControllerClient, SignalingError};
pub use frame::{ClientFrame, ServerFrame};

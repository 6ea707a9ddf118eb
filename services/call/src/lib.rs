//! Voice Call Service Library Crate
//!
//! This library wires the pure call pipeline from `voice-call-core` to the
//! outside world: configuration from the environment, the WebSocket
//! transport to the remote agent, the audio devices, and the controller
//! actor that owns a call from start to teardown. The `call` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod controller;
pub mod device;
pub mod transport;

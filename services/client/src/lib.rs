//! Voice Agent Client Library Crate
//!
//! Runs real-time voice agent sessions on tokio: configuration loading, the
//! agent websocket, cpal audio devices and the per-session event loop. The
//! `voice-agent` binary is a thin wrapper around this library.

pub mod audio;
pub mod config;
pub mod config_source;
pub mod session;
pub mod socket;

pub use session::{SessionEvent, SessionHandle, VoiceAgent};

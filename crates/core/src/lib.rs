pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod timer;
pub mod watchdog;

pub use config::{AgentSessionConfig, SessionTimings};
pub use error::{CaptureError, ErrorClass, PlaybackError, SessionError, TransportError};
pub use session::{
    SessionController, SessionDeps, SessionObserver, SessionState, Termination, Transport,
};

/// Commands an embedding application issues to a running session.
///
/// The runtime owns the controller, so UI threads talk to it through these
/// rather than calling into the controller directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Suppress or resume outgoing microphone audio without touching the socket.
    Mute(bool),
    /// End the session and release every resource it holds.
    Stop,
}

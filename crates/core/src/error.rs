use thiserror::Error;

/// Failure to acquire or run the microphone.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no microphone device available")]
    NoDevice,

    #[error("unsupported microphone configuration: {0}")]
    Unsupported(String),

    #[error("microphone device error: {0}")]
    Device(String),
}

/// Failure to open the audio output timeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("no audio output device available")]
    NoDevice,

    #[error("audio output device error: {0}")]
    Device(String),
}

/// Failure to open the agent socket or hand it a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("socket is closed")]
    Closed,

    #[error("failed to send frame: {0}")]
    Send(String),
}

/// Coarse classification of session failures, used by the UI to pick a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Missing or invalid config; no socket was opened.
    Precondition,
    /// Microphone could not be acquired.
    Acquisition,
    /// Socket failed or closed underneath the session.
    Transport,
    /// The agent reported an error over the control channel.
    Protocol,
}

/// Terminal session error reported to the embedding application.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("voice agent is disabled for this project")]
    Disabled,

    #[error("config response did not include an access token")]
    MissingToken,

    #[error("invalid agent settings: {0}")]
    InvalidSettings(String),

    #[error("failed to fetch session config: {0}")]
    ConfigFetch(String),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("socket error: {0}")]
    Transport(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("session was already started")]
    AlreadyStarted,

    #[error("previous session has not finished stopping")]
    Busy,
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SessionError::Disabled
            | SessionError::MissingToken
            | SessionError::InvalidSettings(_)
            | SessionError::ConfigFetch(_)
            | SessionError::AlreadyStarted
            | SessionError::Busy => ErrorClass::Precondition,
            SessionError::Capture(_) => ErrorClass::Acquisition,
            SessionError::Transport(_) => ErrorClass::Transport,
            SessionError::Agent(_) => ErrorClass::Protocol,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e.to_string())
    }
}

//! The session state machine that ties socket, capture, playback and watchdog together.
//!
//! `SessionController` is sans-IO: the embedding runtime feeds it socket
//! events, captured frames and timer expirations, and it acts through the
//! injected [`Transport`], [`Microphone`], [`OutputFactory`] and
//! [`SessionObserver`].

use crate::capture::{CaptureEngine, FrameSink, Microphone};
use crate::config::{AgentSessionConfig, SessionTimings};
use crate::error::{CaptureError, SessionError, TransportError};
use crate::playback::{OutputFactory, PlaybackScheduler};
use crate::protocol::{ClientMessage, Role, ServerMessage, settings_frame};
use crate::timer::{Clock, TimerKind, TimerQueue};
use crate::watchdog::{InactivityWatchdog, WatchdogAction, WatchdogState};
use bytes::Bytes;
use secrecy::SecretString;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Coarse conversation state reported to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Listening,
    Thinking,
    Speaking,
    Ended,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Thinking => "thinking",
            SessionState::Speaking => "speaking",
            SessionState::Ended => "ended",
            SessionState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session finished. Exactly one is reported per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Ended,
    Error(SessionError),
}

/// Outbound half of the agent socket.
pub trait Transport: Send {
    fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    fn send_binary(&mut self, frame: Bytes) -> Result<(), TransportError>;
    fn close(&mut self);
}

/// Receives transcript lines, state changes and the final termination notice.
pub trait SessionObserver: Send {
    fn on_state_change(&mut self, _state: SessionState) {}
    fn on_transcript(&mut self, _role: Role, _text: &str) {}
    fn on_terminated(&mut self, _termination: &Termination) {}
}

/// Everything a session needs from its environment.
pub struct SessionDeps {
    pub microphone: Box<dyn Microphone>,
    pub output: Box<dyn OutputFactory>,
    /// Where the capture engine delivers encoded frames; the runtime passes
    /// them back through [`SessionController::send_audio`].
    pub frames: FrameSink,
    pub observer: Box<dyn SessionObserver>,
    pub clock: Arc<dyn Clock>,
    pub timings: SessionTimings,
}

pub struct SessionController {
    state: SessionState,
    transport: Option<Box<dyn Transport>>,
    pending_settings: Option<Map<String, Value>>,
    key_id: Option<String>,
    capture: CaptureEngine,
    playback: PlaybackScheduler,
    watchdog: InactivityWatchdog,
    timers: TimerQueue,
    observer: Box<dyn SessionObserver>,
    keep_alive: Duration,
    probe_message: String,
    terminated: bool,
}

impl SessionController {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            state: SessionState::Idle,
            transport: None,
            pending_settings: None,
            key_id: None,
            capture: CaptureEngine::new(deps.microphone, deps.frames),
            playback: PlaybackScheduler::new(deps.output),
            watchdog: InactivityWatchdog::new(&deps.timings),
            timers: TimerQueue::new(deps.clock),
            observer: deps.observer,
            keep_alive: deps.timings.keep_alive,
            probe_message: deps.timings.probe_message,
            terminated: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_gated(&self) -> bool {
        self.capture.is_gated()
    }

    pub fn is_muted(&self) -> bool {
        self.capture.is_muted()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_playback_open(&self) -> bool {
        self.playback.is_open()
    }

    pub fn watchdog_state(&self) -> WatchdogState {
        self.watchdog.state()
    }

    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub fn is_timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    /// Earliest timer deadline, on the session clock.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    /// Moves `idle -> connecting`. A controller can be started once.
    pub fn begin(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle || self.terminated {
            return Err(SessionError::AlreadyStarted);
        }
        self.set_state(SessionState::Connecting);
        Ok(())
    }

    /// Applies the fetched config and returns the socket token.
    ///
    /// A failed fetch or a config that fails its preconditions ends the
    /// session in `error` before any socket exists.
    pub fn configure(
        &mut self,
        fetched: Result<AgentSessionConfig, SessionError>,
    ) -> Result<SecretString, SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::AlreadyStarted);
        }
        match fetched.and_then(AgentSessionConfig::validate) {
            Ok(config) => {
                self.pending_settings = Some(config.settings);
                self.key_id = config.key_id;
                Ok(config.token)
            }
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    /// Takes ownership of the connected socket. Settings wait for `Welcome`.
    pub fn socket_opened(&mut self, mut transport: Box<dyn Transport>) {
        if self.terminated {
            transport.close();
            return;
        }
        info!(key_id = ?self.key_id, "Agent socket open, awaiting Welcome");
        self.transport = Some(transport);
    }

    /// Dispatches an inbound text frame.
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => warn!(error = %e, "Ignoring unparseable control message"),
        }
    }

    pub fn handle_message(&mut self, message: ServerMessage) {
        if self.terminated {
            return;
        }
        debug!(?message, "Control message received");
        match message {
            ServerMessage::Welcome { .. } => self.send_settings(),
            ServerMessage::SettingsApplied {} => self.on_settings_applied(),
            ServerMessage::UserStartedSpeaking {} => {
                self.set_state(SessionState::Listening);
                self.watchdog.on_user_started_speaking(&mut self.timers);
                self.playback.flush();
                self.sync_gate();
            }
            ServerMessage::AgentThinking { .. } => self.set_state(SessionState::Thinking),
            ServerMessage::AgentStartedSpeaking { .. } => {
                self.set_state(SessionState::Speaking);
                self.watchdog.on_agent_started_speaking(&mut self.timers);
                self.sync_gate();
            }
            ServerMessage::AgentAudioDone {} => {
                self.set_state(SessionState::Listening);
                self.watchdog.on_agent_audio_done(&mut self.timers);
                self.sync_gate();
            }
            ServerMessage::ConversationText { role, content } => {
                self.observer.on_transcript(role, &content);
            }
            ServerMessage::InjectionRefused { .. } | ServerMessage::Warning { .. } => {
                match message.refusal() {
                    Some(refusal) => {
                        self.watchdog.on_refusal(refusal, &mut self.timers);
                        self.sync_gate();
                    }
                    None => warn!(?message, "Agent warning"),
                }
            }
            ServerMessage::Error { description, .. } => self.fail(SessionError::Agent(description)),
            ServerMessage::Unknown => debug!("Ignoring unknown control message type"),
        }
    }

    /// Plays an inbound agent audio frame.
    pub fn handle_binary(&mut self, frame: Bytes) {
        if self.terminated {
            return;
        }
        self.set_state(SessionState::Speaking);
        self.watchdog.on_agent_audio();
        self.sync_gate();
        self.playback.enqueue(&frame);
    }

    /// The socket closed underneath the session.
    pub fn handle_socket_closed(&mut self, code: Option<u16>, reason: &str) {
        // The socket is already gone; nothing left to close.
        self.transport = None;
        if self.terminated {
            return;
        }
        info!(?code, reason, "Agent socket closed");
        self.stop();
    }

    pub fn handle_socket_error(&mut self, message: impl Into<String>) {
        self.transport = None;
        self.fail(SessionError::Transport(message.into()));
    }

    /// The microphone failed after capture had already started.
    pub fn handle_capture_error(&mut self, err: CaptureError) {
        self.fail(SessionError::Capture(err));
    }

    /// Forwards one captured frame once the handshake has completed.
    pub fn send_audio(&mut self, frame: Bytes) {
        if !matches!(
            self.state,
            SessionState::Listening | SessionState::Thinking | SessionState::Speaking
        ) {
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if let Err(e) = transport.send_binary(frame) {
            self.fail(e.into());
        }
    }

    /// Fires every timer whose deadline has passed.
    pub fn poll_timers(&mut self) {
        for kind in self.timers.take_expired() {
            if self.terminated {
                return;
            }
            match kind {
                TimerKind::KeepAlive => {
                    self.send_control(&ClientMessage::KeepAlive);
                    if !self.terminated {
                        self.timers.arm(TimerKind::KeepAlive, self.keep_alive);
                    }
                }
                _ => match self.watchdog.on_timer(kind, &mut self.timers) {
                    Some(WatchdogAction::InjectProbe) => {
                        self.sync_gate();
                        info!(message = %self.probe_message, "Injecting inactivity probe");
                        let probe = ClientMessage::InjectAgentMessage {
                            content: self.probe_message.clone(),
                        };
                        self.send_control(&probe);
                    }
                    Some(WatchdogAction::HangUp) => self.stop(),
                    None => self.sync_gate(),
                },
            }
        }
    }

    pub fn mute(&mut self, muted: bool) {
        self.capture.set_muted(muted);
    }

    /// Tears the session down and reports `Ended` unless it already terminated.
    /// Safe to call repeatedly and from error paths.
    pub fn stop(&mut self) {
        self.teardown();
        if !self.terminated {
            self.terminated = true;
            self.set_state(SessionState::Ended);
            info!(key_id = ?self.key_id, "Session ended");
            self.observer.on_terminated(&Termination::Ended);
        }
    }

    fn fail(&mut self, err: SessionError) {
        if self.terminated {
            return;
        }
        error!(error = %err, class = ?err.class(), key_id = ?self.key_id, "Session failed");
        self.terminated = true;
        self.set_state(SessionState::Error);
        self.observer.on_terminated(&Termination::Error(err));
        self.teardown();
    }

    fn teardown(&mut self) {
        self.timers.disarm_all();
        self.watchdog.reset(&mut self.timers);
        self.capture.set_gated(false);
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.capture.stop();
        self.playback.flush();
        self.pending_settings = None;
    }

    fn send_settings(&mut self) {
        let Some(settings) = self.pending_settings.take() else {
            debug!("Welcome received with no pending settings");
            return;
        };
        match settings_frame(&settings) {
            Ok(frame) => {
                info!("Welcome received, sending settings");
                self.send_text(frame);
            }
            Err(e) => self.fail(SessionError::InvalidSettings(e.to_string())),
        }
    }

    fn on_settings_applied(&mut self) {
        info!("Settings applied, starting microphone");
        self.set_state(SessionState::Listening);
        self.watchdog.reset(&mut self.timers);
        self.sync_gate();
        self.timers.arm(TimerKind::KeepAlive, self.keep_alive);
        if let Err(e) = self.capture.start() {
            self.fail(SessionError::Capture(e));
        }
    }

    fn send_control(&mut self, message: &ClientMessage) {
        match message.to_json() {
            Ok(text) => self.send_text(text),
            Err(e) => warn!(error = %e, "Failed to serialize control message"),
        }
    }

    fn send_text(&mut self, text: String) {
        let Some(transport) = self.transport.as_mut() else {
            warn!("Dropping control message, socket not open");
            return;
        };
        if let Err(e) = transport.send_text(text) {
            self.fail(e.into());
        }
    }

    fn sync_gate(&mut self) {
        self.capture.set_gated(self.watchdog.is_gated());
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Session state changed");
            self.state = state;
            self.observer.on_state_change(state);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

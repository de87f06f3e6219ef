//! Runs a [`SessionController`] on tokio: one task per live session.

use crate::audio::AudioDevices;
use crate::config_source::{ConfigRequest, ConfigSource};
use crate::socket::{Connector, Inbound};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, Span, field, info, info_span, warn};
use voice_agent_core::capture::FrameSink;
use voice_agent_core::protocol::Role;
use voice_agent_core::timer::Clock;
use voice_agent_core::{
    CaptureError, Command, SessionController, SessionDeps, SessionError, SessionObserver,
    SessionState, SessionTimings, Termination,
};

/// Everything a session reports to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Transcript { role: Role, text: String },
    Terminated(Termination),
}

struct ChannelObserver(mpsc::UnboundedSender<SessionEvent>);

impl SessionObserver for ChannelObserver {
    fn on_state_change(&mut self, state: SessionState) {
        let _ = self.0.send(SessionEvent::StateChanged(state));
    }

    fn on_transcript(&mut self, role: Role, text: &str) {
        let _ = self.0.send(SessionEvent::Transcript {
            role,
            text: text.to_string(),
        });
    }

    fn on_terminated(&mut self, termination: &Termination) {
        let _ = self.0.send(SessionEvent::Terminated(termination.clone()));
    }
}

/// Session clock backed by tokio's clock, so paused test time drives it too.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Converts a session-clock deadline into a tokio instant.
    pub fn instant(&self, at: Duration) -> Instant {
        self.origin + at
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.origin)
    }
}

/// Clears the agent's busy flag when the session task finishes.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Starts voice sessions, at most one at a time.
pub struct VoiceAgent {
    agent_url: String,
    timings: SessionTimings,
    config_source: Arc<dyn ConfigSource>,
    connector: Arc<dyn Connector>,
    devices: Arc<dyn AudioDevices>,
    active: Arc<AtomicBool>,
}

impl VoiceAgent {
    pub fn new(
        agent_url: impl Into<String>,
        timings: SessionTimings,
        config_source: Arc<dyn ConfigSource>,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn AudioDevices>,
    ) -> Self {
        Self {
            agent_url: agent_url.into(),
            timings,
            config_source,
            connector,
            devices,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a session is live or still shutting down.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Hands a new session to a background task and returns its handle.
    ///
    /// The session starts in `connecting`: config fetch and the socket
    /// connect happen on the task, so the handle can stop it at any point.
    /// Failures after this returns arrive as the session's termination event.
    /// Fails with [`SessionError::Busy`] while a previous session has not
    /// finished stopping. Must be called from within a tokio runtime.
    pub fn start(&self, request: ConfigRequest) -> Result<SessionHandle, SessionError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::Busy);
        }
        let guard = ActiveGuard(self.active.clone());

        let (event_tx, events) = mpsc::unbounded_channel();
        let (frame_tx, frames) = mpsc::unbounded_channel::<Bytes>();
        let (capture_error_tx, capture_errors) = mpsc::unbounded_channel();
        let sink: FrameSink = Arc::new(move |frame: Bytes| {
            let _ = frame_tx.send(frame);
        });
        let clock = MonotonicClock::new();
        let mut controller = SessionController::new(SessionDeps {
            microphone: self.devices.microphone(capture_error_tx),
            output: self.devices.output(),
            frames: sink,
            observer: Box::new(ChannelObserver(event_tx)),
            clock: Arc::new(clock),
            timings: self.timings.clone(),
        });
        controller.begin()?;

        let span = info_span!(
            "voice_session",
            key_id = field::Empty,
            project_id = %request.project_id
        );
        let setup = Setup {
            request,
            agent_url: self.agent_url.clone(),
            config_source: self.config_source.clone(),
            connector: self.connector.clone(),
        };
        let session = LiveSession {
            controller,
            clock,
            frames,
            capture_errors,
            devices: self.devices.clone(),
        };
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(session, setup, command_rx, guard).instrument(span));

        Ok(SessionHandle {
            commands,
            events: Some(events),
            task,
        })
    }
}

/// Controls a running session. Dropping the handle stops the session.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    /// Takes the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    pub fn mute(&self, muted: bool) {
        let _ = self.commands.send(Command::Mute(muted));
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the session and resolves once every resource is released.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Session task did not finish cleanly");
        }
    }

    /// Waits for the session to end on its own (hang-up, close or error).
    pub async fn finished(self) {
        let SessionHandle { commands, task, .. } = self;
        if let Err(e) = task.await {
            warn!(error = %e, "Session task did not finish cleanly");
        }
        drop(commands);
    }
}

/// What the task needs to bring a session from `connecting` to live.
struct Setup {
    request: ConfigRequest,
    agent_url: String,
    config_source: Arc<dyn ConfigSource>,
    connector: Arc<dyn Connector>,
}

struct LiveSession {
    controller: SessionController,
    clock: MonotonicClock,
    frames: mpsc::UnboundedReceiver<Bytes>,
    capture_errors: mpsc::UnboundedReceiver<CaptureError>,
    devices: Arc<dyn AudioDevices>,
}

/// Fetches config and opens the socket. Returns `None` once the controller
/// has failed.
async fn establish(
    controller: &mut SessionController,
    setup: &Setup,
) -> Option<mpsc::UnboundedReceiver<Inbound>> {
    let fetched = setup.config_source.fetch(&setup.request).await;
    let token = controller.configure(fetched).ok()?;

    let key_id = controller
        .key_id()
        .map(str::to_string)
        .unwrap_or_else(|| format!("temp-{}", rand::random::<u32>()));
    Span::current().record("key_id", key_id.as_str());

    match setup.connector.connect(&setup.agent_url, &token).await {
        Ok(link) => {
            controller.socket_opened(link.transport);
            Some(link.inbound)
        }
        Err(e) => {
            controller.handle_socket_error(e.to_string());
            None
        }
    }
}

/// Resolves on `Stop` or when the handle is gone, remembering the last mute.
async fn until_stopped(commands: &mut mpsc::UnboundedReceiver<Command>, muted: &mut Option<bool>) {
    loop {
        match commands.recv().await {
            Some(Command::Mute(value)) => *muted = Some(value),
            Some(Command::Stop) | None => return,
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The main event loop for a session, from `connecting` to release.
async fn run_session(
    mut session: LiveSession,
    setup: Setup,
    mut commands: mpsc::UnboundedReceiver<Command>,
    _guard: ActiveGuard,
) {
    let mut muted = None;
    let inbound = tokio::select! {
        inbound = establish(&mut session.controller, &setup) => inbound,
        () = until_stopped(&mut commands, &mut muted) => None,
    };
    if let Some(muted) = muted {
        session.controller.mute(muted);
    }
    match inbound {
        Some(inbound) => drive(&mut session, inbound, &mut commands).await,
        None => session.controller.stop(),
    }

    let LiveSession {
        controller,
        devices,
        ..
    } = session;
    // Signals the microphone and speaker threads, then waits for them.
    drop(controller);
    devices.released().await;
    info!("Voice session finished.");
}

async fn drive(
    session: &mut LiveSession,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) {
    let LiveSession {
        controller,
        clock,
        frames,
        capture_errors,
        ..
    } = session;
    while !controller.is_terminated() {
        let deadline = controller.next_deadline().map(|at| clock.instant(at));
        tokio::select! {
            message = inbound.recv() => match message {
                Some(Inbound::Text(text)) => controller.handle_text(&text),
                Some(Inbound::Binary(data)) => controller.handle_binary(data),
                Some(Inbound::Closed { code, reason }) => controller.handle_socket_closed(code, &reason),
                Some(Inbound::Error(e)) => controller.handle_socket_error(e),
                None => controller.handle_socket_closed(None, "socket reader finished"),
            },
            Some(frame) = frames.recv() => controller.send_audio(frame),
            Some(err) = capture_errors.recv() => controller.handle_capture_error(err),
            command = commands.recv() => match command {
                Some(Command::Mute(muted)) => controller.mute(muted),
                Some(Command::Stop) | None => controller.stop(),
            },
            _ = wait_until(deadline) => controller.poll_timers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::CaptureErrors;
    use crate::config_source::MockConfigSource;
    use crate::socket::SocketLink;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use tokio::sync::Notify;
    use voice_agent_core::capture::{ActiveCapture, CaptureOptions, Microphone, SampleCallback};
    use voice_agent_core::playback::{AudioOutput, OutputFactory};
    use voice_agent_core::{PlaybackError, TransportError};

    struct NoMic;

    impl Microphone for NoMic {
        fn open(
            &mut self,
            _options: &CaptureOptions,
            _on_samples: SampleCallback,
        ) -> Result<Box<dyn ActiveCapture>, CaptureError> {
            Err(CaptureError::NoDevice)
        }
    }

    struct NoOutput;

    impl OutputFactory for NoOutput {
        fn create(&mut self, _sample_rate: u32) -> Result<Box<dyn AudioOutput>, PlaybackError> {
            Err(PlaybackError::NoDevice)
        }
    }

    /// Devices whose hardware is released only when `release` is notified.
    #[derive(Default)]
    struct NoDevices {
        release: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl AudioDevices for NoDevices {
        fn microphone(&self, _errors: CaptureErrors) -> Box<dyn Microphone> {
            Box::new(NoMic)
        }

        fn output(&self) -> Box<dyn OutputFactory> {
            Box::new(NoOutput)
        }

        async fn released(&self) {
            if let Some(release) = &self.release {
                release.notified().await;
            }
        }
    }

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(
            &self,
            _url: &str,
            _token: &SecretString,
        ) -> Result<SocketLink, TransportError> {
            Err(TransportError::Connect("connection refused".into()))
        }
    }

    fn agent(source: MockConfigSource, devices: NoDevices) -> VoiceAgent {
        VoiceAgent::new(
            "ws://agent.test",
            SessionTimings::default(),
            Arc::new(source),
            Arc::new(RefusingConnector),
            Arc::new(devices),
        )
    }

    fn enabled_config() -> voice_agent_core::AgentSessionConfig {
        serde_json::from_value(serde_json::json!({
            "enabled": true,
            "token": "tok",
            "settings": {}
        }))
        .unwrap()
    }

    /// Runs a session to completion and returns every termination it reported.
    async fn terminations(agent: &VoiceAgent) -> Vec<Termination> {
        let mut handle = agent.start(ConfigRequest::new("proj")).unwrap();
        let mut events = handle.take_events().unwrap();
        handle.finished().await;

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if let SessionEvent::Terminated(termination) = event {
                seen.push(termination);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_config_failure_is_reported_and_frees_agent() {
        let mut source = MockConfigSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(SessionError::ConfigFetch("timeout".into())));
        let agent = agent(source, NoDevices::default());

        assert_eq!(
            terminations(&agent).await,
            vec![Termination::Error(SessionError::ConfigFetch("timeout".into()))]
        );
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_disabled_config_never_connects() {
        let mut source = MockConfigSource::new();
        source.expect_fetch().returning(|_| {
            Ok(serde_json::from_value(serde_json::json!({"enabled": false})).unwrap())
        });
        let agent = agent(source, NoDevices::default());

        assert_eq!(
            terminations(&agent).await,
            vec![Termination::Error(SessionError::Disabled)]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let mut source = MockConfigSource::new();
        source.expect_fetch().returning(|_| Ok(enabled_config()));
        let agent = agent(source, NoDevices::default());

        let seen = terminations(&agent).await;
        assert!(
            matches!(seen.as_slice(), [Termination::Error(SessionError::Transport(msg))] if msg.contains("refused"))
        );
        assert!(!agent.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_device_release() {
        let mut source = MockConfigSource::new();
        source
            .expect_fetch()
            .returning(|_| Err(SessionError::ConfigFetch("timeout".into())));
        let release = Arc::new(Notify::new());
        let agent = agent(
            source,
            NoDevices {
                release: Some(release.clone()),
            },
        );

        let handle = agent.start(ConfigRequest::new("proj")).unwrap();
        assert!(matches!(
            agent.start(ConfigRequest::new("proj")).err(),
            Some(SessionError::Busy)
        ));
        let stopping = tokio::spawn(handle.stop());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        assert!(agent.is_busy());

        release.notify_one();
        stopping.await.unwrap();
        assert!(!agent.is_busy());
    }

    #[tokio::test]
    async fn test_monotonic_clock_maps_deadlines() {
        let clock = MonotonicClock::new();
        let at = Duration::from_millis(1500);
        assert_eq!(clock.instant(at) - clock.origin, at);
        assert!(clock.now() < Duration::from_secs(60));
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use voice_agent_client::audio::{AudioDevices, CaptureErrors};
use voice_agent_client::config_source::{ConfigRequest, ConfigSource};
use voice_agent_client::socket::{ChannelTransport, Connector, Inbound, Outbound, SocketLink};
use voice_agent_client::{SessionEvent, SessionHandle, VoiceAgent};
use voice_agent_core::capture::{ActiveCapture, CaptureOptions, Microphone, SampleCallback};
use voice_agent_core::playback::{AudioOutput, OutputFactory};
use voice_agent_core::{
    AgentSessionConfig, CaptureError, PlaybackError, SessionError, SessionState, SessionTimings,
    Termination, TransportError, codec,
};

struct StaticSource;

#[async_trait]
impl ConfigSource for StaticSource {
    async fn fetch(&self, request: &ConfigRequest) -> Result<AgentSessionConfig, SessionError> {
        assert_eq!(request.project_id, "proj-1");
        Ok(serde_json::from_value(json!({
            "enabled": true,
            "token": "tok-live",
            "keyId": "key-7",
            "settings": {"audio": {"input": {"encoding": "linear16", "sample_rate": 16000}}}
        }))
        .unwrap())
    }
}

/// The server side of an in-memory agent socket.
struct Server {
    token: String,
    inbound: mpsc::UnboundedSender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Server {
    fn send(&self, message: Value) {
        self.inbound.send(Inbound::Text(message.to_string())).unwrap();
    }

    /// Next control message other than a heartbeat.
    async fn next_control(&mut self) -> Value {
        loop {
            match self.outbound.recv().await {
                Some(Outbound::Text(text)) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] != "KeepAlive" {
                        return value;
                    }
                }
                Some(Outbound::Binary(_)) => {}
                other => panic!("expected a control message, got {other:?}"),
            }
        }
    }

    async fn next_audio(&mut self) -> Bytes {
        loop {
            match self.outbound.recv().await {
                Some(Outbound::Binary(frame)) => return frame,
                Some(Outbound::Text(_)) => {}
                other => panic!("expected audio, got {other:?}"),
            }
        }
    }

    async fn expect_close(&mut self) {
        loop {
            match self.outbound.recv().await {
                Some(Outbound::Close) | None => return,
                Some(_) => {}
            }
        }
    }
}

struct MemoryConnector(mpsc::UnboundedSender<Server>);

/// A connector whose handshake never completes.
struct StalledConnector;

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _url: &str, _token: &SecretString) -> Result<SocketLink, TransportError> {
        std::future::pending().await
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str, token: &SecretString) -> Result<SocketLink, TransportError> {
        assert_eq!(url, "ws://agent.test/converse");
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.0
            .send(Server {
                token: token.expose_secret().to_string(),
                inbound: in_tx,
                outbound: out_rx,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(SocketLink {
            transport: Box::new(ChannelTransport::new(out_tx)),
            inbound: in_rx,
        })
    }
}

#[derive(Default)]
struct MicState {
    callback: Option<SampleCallback>,
    stopped: usize,
}

#[derive(Clone, Default)]
struct SharedMic(Arc<Mutex<MicState>>);

impl SharedMic {
    fn speak(&self, level: f32) {
        if let Some(callback) = self.0.lock().unwrap().callback.as_mut() {
            callback(&[level; 1024]);
        }
    }
}

struct MicStream(Arc<Mutex<MicState>>);

impl ActiveCapture for MicStream {
    fn stop(&mut self) {
        let mut state = self.0.lock().unwrap();
        state.callback = None;
        state.stopped += 1;
    }
}

impl Microphone for SharedMic {
    fn open(
        &mut self,
        _options: &CaptureOptions,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        self.0.lock().unwrap().callback = Some(on_samples);
        Ok(Box::new(MicStream(self.0.clone())))
    }
}

struct SilentOutput(Arc<Mutex<usize>>);

impl AudioOutput for SilentOutput {
    fn current_time(&self) -> f64 {
        0.0
    }

    fn schedule(&mut self, _samples: &[f32], _start_at: f64) {
        *self.0.lock().unwrap() += 1;
    }

    fn close(&mut self) {}
}

struct SilentFactory(Arc<Mutex<usize>>);

impl OutputFactory for SilentFactory {
    fn create(&mut self, _sample_rate: u32) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        Ok(Box::new(SilentOutput(self.0.clone())))
    }
}

#[derive(Default)]
struct FakeDevices {
    mic: SharedMic,
    scheduled: Arc<Mutex<usize>>,
    mic_errors: Mutex<Option<CaptureErrors>>,
}

impl FakeDevices {
    /// Reports a microphone failure the way a device thread would.
    fn fail_mic(&self, err: CaptureError) {
        if let Some(errors) = self.mic_errors.lock().unwrap().as_ref() {
            errors.send(err).unwrap();
        }
    }
}

impl AudioDevices for FakeDevices {
    fn microphone(&self, errors: CaptureErrors) -> Box<dyn Microphone> {
        *self.mic_errors.lock().unwrap() = Some(errors);
        Box::new(self.mic.clone())
    }

    fn output(&self) -> Box<dyn OutputFactory> {
        Box::new(SilentFactory(self.scheduled.clone()))
    }
}

struct Fixture {
    agent: VoiceAgent,
    servers: mpsc::UnboundedReceiver<Server>,
    devices: Arc<FakeDevices>,
}

impl Fixture {
    fn new() -> Self {
        let (server_tx, servers) = mpsc::unbounded_channel();
        let devices = Arc::new(FakeDevices::default());
        let agent = VoiceAgent::new(
            "ws://agent.test/converse",
            SessionTimings::default(),
            Arc::new(StaticSource),
            Arc::new(MemoryConnector(server_tx)),
            devices.clone(),
        );
        Self {
            agent,
            servers,
            devices,
        }
    }

    /// Starts a session and completes the handshake.
    async fn live_session(
        &mut self,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>, Server) {
        let mut handle = self.agent.start(ConfigRequest::new("proj-1")).unwrap();
        let events = handle.take_events().unwrap();
        let mut server = self.servers.recv().await.unwrap();
        assert_eq!(server.token, "tok-live");

        server.send(json!({"type": "Welcome", "request_id": "req-1"}));
        let settings = server.next_control().await;
        assert_eq!(settings["type"], "Settings");
        assert_eq!(settings["audio"]["input"]["sample_rate"], 16000);
        server.send(json!({"type": "SettingsApplied"}));
        settle().await;
        (handle, events, server)
    }
}

async fn termination(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Termination {
    while let Some(event) = events.recv().await {
        if let SessionEvent::Terminated(termination) = event {
            return termination;
        }
    }
    panic!("session ended without a termination event");
}

/// Lets the session task drain its queues.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_silence_probe_then_hang_up() {
    let mut fixture = Fixture::new();
    let (handle, mut events, mut server) = fixture.live_session().await;

    fixture.devices.mic.speak(0.25);
    assert_eq!(server.next_audio().await.len(), 2048);

    let silence_started = Instant::now();
    server.send(json!({"type": "AgentAudioDone"}));
    let probe = server.next_control().await;
    assert_eq!(
        probe,
        json!({"type": "InjectAgentMessage", "content": "Are you still there?"})
    );
    let waited = silence_started.elapsed();
    assert!(waited >= Duration::from_millis(10_300), "probed after {waited:?}");
    assert!(waited < Duration::from_millis(10_400), "probed after {waited:?}");

    server.send(json!({"type": "AgentStartedSpeaking"}));
    server.inbound.send(Inbound::Binary(Bytes::from(vec![0u8; 960]))).unwrap();
    server.send(json!({"type": "AgentAudioDone"}));
    let reply_window = Instant::now();

    assert_eq!(termination(&mut events).await, Termination::Ended);
    assert!(reply_window.elapsed() >= Duration::from_secs(50));
    server.expect_close().await;
    handle.finished().await;

    assert!(!fixture.agent.is_busy());
    assert_eq!(fixture.devices.mic.0.lock().unwrap().stopped, 1);
    assert_eq!(*fixture.devices.scheduled.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_resolves_after_release_and_frees_agent() {
    let mut fixture = Fixture::new();
    let (handle, mut events, mut server) = fixture.live_session().await;

    assert!(matches!(
        fixture.agent.start(ConfigRequest::new("proj-1")).err(),
        Some(SessionError::Busy)
    ));

    handle.stop().await;
    assert!(!fixture.agent.is_busy());
    assert_eq!(fixture.devices.mic.0.lock().unwrap().stopped, 1);
    server.expect_close().await;

    let mut terminations = 0;
    while let Some(event) = events.recv().await {
        if matches!(event, SessionEvent::Terminated(_)) {
            terminations += 1;
        }
    }
    assert_eq!(terminations, 1);

    // The agent accepts a fresh session afterwards.
    let (handle, _events, _server) = fixture.live_session().await;
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_mute_drops_frames_without_touching_session() {
    let mut fixture = Fixture::new();
    let (handle, _events, mut server) = fixture.live_session().await;

    handle.mute(true);
    settle().await;
    fixture.devices.mic.speak(0.1);
    handle.mute(false);
    settle().await;
    fixture.devices.mic.speak(0.5);

    let frame = server.next_audio().await;
    assert_eq!(frame.as_ref(), codec::encode(&[0.5; 1024]).as_slice());
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_agent_error_ends_session_with_error() {
    let mut fixture = Fixture::new();
    let (handle, mut events, mut server) = fixture.live_session().await;

    server.send(json!({"type": "ConversationText", "role": "assistant", "content": "Hi!"}));
    server.send(json!({"type": "Error", "description": "bad settings", "code": "INVALID"}));

    let mut saw_transcript = false;
    let mut saw_error_state = false;
    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Transcript { text, .. } => saw_transcript = text == "Hi!",
            SessionEvent::StateChanged(SessionState::Error) => saw_error_state = true,
            SessionEvent::Terminated(termination) => outcome = Some(termination),
            SessionEvent::StateChanged(_) => {}
        }
    }

    assert!(saw_transcript);
    assert!(saw_error_state);
    assert_eq!(
        outcome,
        Some(Termination::Error(SessionError::Agent("bad settings".into())))
    );
    server.expect_close().await;
    handle.finished().await;
}

#[tokio::test(start_paused = true)]
async fn test_server_close_ends_session() {
    let mut fixture = Fixture::new();
    let (handle, mut events, server) = fixture.live_session().await;

    server
        .inbound
        .send(Inbound::Closed {
            code: Some(1000),
            reason: "done".into(),
        })
        .unwrap();

    assert_eq!(termination(&mut events).await, Termination::Ended);
    handle.finished().await;
    assert!(!fixture.agent.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_connecting_ends_once() {
    let devices = Arc::new(FakeDevices::default());
    let agent = VoiceAgent::new(
        "ws://agent.test/converse",
        SessionTimings::default(),
        Arc::new(StaticSource),
        Arc::new(StalledConnector),
        devices.clone(),
    );

    let mut handle = agent.start(ConfigRequest::new("proj-1")).unwrap();
    let mut events = handle.take_events().unwrap();
    settle().await;
    assert!(!handle.is_finished());

    handle.stop().await;
    assert!(!agent.is_busy());

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    assert_eq!(
        seen.last(),
        Some(&SessionEvent::Terminated(Termination::Ended))
    );
    let terminations = seen
        .iter()
        .filter(|event| matches!(event, SessionEvent::Terminated(_)))
        .count();
    assert_eq!(terminations, 1);
    assert_eq!(devices.mic.0.lock().unwrap().stopped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_microphone_failure_after_start_ends_in_error() {
    let mut fixture = Fixture::new();
    let (handle, mut events, mut server) = fixture.live_session().await;

    fixture
        .devices
        .fail_mic(CaptureError::PermissionDenied("revoked".into()));

    assert_eq!(
        termination(&mut events).await,
        Termination::Error(SessionError::Capture(CaptureError::PermissionDenied(
            "revoked".into()
        )))
    );
    server.expect_close().await;
    handle.finished().await;
    assert!(!fixture.agent.is_busy());
}

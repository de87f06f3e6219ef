//! Defines the control-message protocol spoken with the agent endpoint.
//!
//! Text frames carry JSON objects tagged by `type`; binary frames carry raw
//! PCM16 audio and never pass through this module.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Warning code sent when an injected message arrives while the agent is talking.
pub const CODE_AGENT_SPEAKING: &str = "INJECT_AGENT_MESSAGE_DURING_AGENT_SPEECH";

/// Warning code sent when an injected message arrives while the user is talking.
pub const CODE_USER_SPEAKING: &str = "INJECT_AGENT_MESSAGE_DURING_USER_SPEECH";

/// Speaker of a conversation transcript line.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Messages sent from the agent endpoint to the client.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First message on every connection; settings may be sent only after it.
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    /// The server accepted the settings; audio may flow.
    SettingsApplied {},
    /// Server-side voice activity detection heard the user.
    UserStartedSpeaking {},
    /// The agent is generating a reply.
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    /// The agent started producing speech.
    AgentStartedSpeaking {
        #[serde(default)]
        total_latency: Option<f64>,
        #[serde(default)]
        tts_latency: Option<f64>,
        #[serde(default)]
        ttt_latency: Option<f64>,
    },
    /// The agent finished generating audio for the current turn.
    AgentAudioDone {},
    /// A finalized transcript line for either side of the conversation.
    ConversationText { role: Role, content: String },
    /// An `InjectAgentMessage` was not accepted.
    InjectionRefused {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    /// Non-fatal server notice. Older servers report refused injections here.
    Warning {
        #[serde(default)]
        code: String,
        #[serde(default)]
        description: Option<String>,
    },
    /// Fatal server error; the session cannot continue.
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    /// Any message type this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Why an injected probe was not spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The agent was still producing audio; worth retrying later.
    AgentSpeaking,
    /// The user is talking, so the probe is moot.
    UserSpeaking,
}

impl ServerMessage {
    /// Interprets the message as a probe refusal, if it is one.
    ///
    /// `InjectionRefused` is always a refusal and defaults to the agent-speaking
    /// meaning; `Warning` is a refusal only for the two injection codes.
    pub fn refusal(&self) -> Option<Refusal> {
        match self {
            ServerMessage::InjectionRefused { code, .. } => match code.as_deref() {
                Some(CODE_USER_SPEAKING) => Some(Refusal::UserSpeaking),
                _ => Some(Refusal::AgentSpeaking),
            },
            ServerMessage::Warning { code, .. } => match code.as_str() {
                CODE_AGENT_SPEAKING => Some(Refusal::AgentSpeaking),
                CODE_USER_SPEAKING => Some(Refusal::UserSpeaking),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Control messages sent from the client to the agent endpoint.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Asks the agent to speak `content` verbatim.
    InjectAgentMessage { content: String },
    /// No-op heartbeat.
    KeepAlive,
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Builds the `Settings` frame from the server-provided settings object.
///
/// The caller guarantees `settings` is an object; `type` is forced to `Settings`.
pub fn settings_frame(settings: &Map<String, Value>) -> serde_json::Result<String> {
    let mut frame = settings.clone();
    frame.insert("type".to_string(), Value::String("Settings".to_string()));
    serde_json::to_string(&frame)
}

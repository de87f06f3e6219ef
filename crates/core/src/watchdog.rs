//! Inactivity watchdog: probes a silent user and eventually hangs up.
//!
//! ```text
//! Idle --AgentAudioDone--> Armed --10s--> ProbePending --300ms--> ProbeInjected
//!                                                                  |  |  |
//!             +--------------- refused (first) --------------------+  |  |
//!             v                                                       |  |
//!       RetryScheduled --2.5s--> ProbeInjected{retried}               |  |
//!                                  | refused again -> Idle            |  |
//!                                  v                                  |  |
//!                            ProbeSpeaking <-- agent audio -----------+  |
//!                                  | AgentAudioDone                      |
//!                                  v                                     |
//!                            AwaitingReply <-- AgentAudioDone -----------+
//!                                  | 50s
//!                                  v
//!                               hang up
//! ```
//!
//! User speech, or the agent starting a new utterance, returns the watchdog
//! to `Idle` from any state. The microphone gate is derived from the state,
//! never stored separately.

use crate::config::SessionTimings;
use crate::protocol::Refusal;
use crate::timer::{TimerKind, TimerQueue};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Position of the watchdog within one inactivity cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    /// No silence is being measured.
    Idle,
    /// The primary inactivity timer is running.
    Armed,
    /// Microphone gated; waiting out the grace delay before injecting.
    ProbePending,
    /// Probe sent, not yet confirmed spoken or refused.
    ProbeInjected { retried: bool },
    /// Probe was refused once; the single retry is scheduled.
    RetryScheduled,
    /// Probe audio is arriving.
    ProbeSpeaking,
    /// Probe was spoken; the hang-up timer is running.
    AwaitingReply,
}

/// Side effect requested by the watchdog when one of its timers fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Send the probe as an injected agent message.
    InjectProbe,
    /// The user never answered; end the session.
    HangUp,
}

const WATCHDOG_TIMERS: [TimerKind; 4] = [
    TimerKind::Inactivity,
    TimerKind::ProbeGrace,
    TimerKind::ProbeRetry,
    TimerKind::HangUp,
];

pub struct InactivityWatchdog {
    state: WatchdogState,
    inactivity: Duration,
    grace: Duration,
    retry: Duration,
    hang_up: Duration,
}

impl InactivityWatchdog {
    pub fn new(timings: &SessionTimings) -> Self {
        Self {
            state: WatchdogState::Idle,
            inactivity: timings.inactivity,
            grace: timings.probe_grace,
            retry: timings.probe_retry,
            hang_up: timings.hang_up,
        }
    }

    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Whether captured audio must be withheld from the agent.
    pub fn is_gated(&self) -> bool {
        matches!(
            self.state,
            WatchdogState::ProbePending
                | WatchdogState::ProbeInjected { .. }
                | WatchdogState::RetryScheduled
        )
    }

    /// The agent finished generating audio for a turn.
    pub fn on_agent_audio_done(&mut self, timers: &mut TimerQueue) {
        match self.state {
            WatchdogState::Idle | WatchdogState::Armed => {
                timers.arm(TimerKind::Inactivity, self.inactivity);
                self.state = WatchdogState::Armed;
                debug!(timeout = ?self.inactivity, "Inactivity timer armed");
            }
            WatchdogState::ProbeInjected { .. } | WatchdogState::ProbeSpeaking => {
                timers.arm(TimerKind::HangUp, self.hang_up);
                self.state = WatchdogState::AwaitingReply;
                info!(timeout = ?self.hang_up, "Probe spoken, hang-up timer armed");
            }
            WatchdogState::ProbePending
            | WatchdogState::RetryScheduled
            | WatchdogState::AwaitingReply => {
                debug!(state = ?self.state, "AgentAudioDone ignored by watchdog");
            }
        }
    }

    /// The agent began a new utterance.
    pub fn on_agent_started_speaking(&mut self, timers: &mut TimerQueue) {
        match self.state {
            WatchdogState::ProbeInjected { .. } => self.state = WatchdogState::ProbeSpeaking,
            WatchdogState::ProbeSpeaking | WatchdogState::Idle => {}
            _ => self.reset(timers),
        }
    }

    /// An agent audio frame arrived.
    ///
    /// Only an injected probe reacts: its audio confirms delivery. While a
    /// probe is still pending delivery the trailing agent audio that caused
    /// the wait must not reopen the microphone.
    pub fn on_agent_audio(&mut self) {
        if let WatchdogState::ProbeInjected { .. } = self.state {
            self.state = WatchdogState::ProbeSpeaking;
        }
    }

    /// The user started speaking: the silence cycle is over.
    pub fn on_user_started_speaking(&mut self, timers: &mut TimerQueue) {
        if self.state != WatchdogState::Idle {
            debug!(state = ?self.state, "User speech disarmed watchdog");
        }
        self.reset(timers);
    }

    /// The server refused an injected probe.
    pub fn on_refusal(&mut self, refusal: Refusal, timers: &mut TimerQueue) {
        match (refusal, self.state) {
            (Refusal::UserSpeaking, _) if self.is_gated() => {
                info!("Probe refused because the user is speaking, ungating microphone");
                self.reset(timers);
            }
            (Refusal::AgentSpeaking, WatchdogState::ProbeInjected { retried: false }) => {
                timers.arm(TimerKind::ProbeRetry, self.retry);
                self.state = WatchdogState::RetryScheduled;
                warn!(delay = ?self.retry, "Probe refused while agent speaking, retrying once");
            }
            (Refusal::AgentSpeaking, WatchdogState::ProbeInjected { retried: true }) => {
                warn!("Probe refused twice, giving up on this cycle");
                self.reset(timers);
            }
            _ => debug!(?refusal, state = ?self.state, "Refusal with no probe outstanding"),
        }
    }

    /// Handles an expired watchdog timer.
    pub fn on_timer(&mut self, kind: TimerKind, timers: &mut TimerQueue) -> Option<WatchdogAction> {
        match (kind, self.state) {
            (TimerKind::Inactivity, WatchdogState::Armed) => {
                timers.arm(TimerKind::ProbeGrace, self.grace);
                self.state = WatchdogState::ProbePending;
                info!("User inactive, gating microphone before probe");
                None
            }
            (TimerKind::ProbeGrace, WatchdogState::ProbePending) => {
                self.state = WatchdogState::ProbeInjected { retried: false };
                Some(WatchdogAction::InjectProbe)
            }
            (TimerKind::ProbeRetry, WatchdogState::RetryScheduled) => {
                self.state = WatchdogState::ProbeInjected { retried: true };
                Some(WatchdogAction::InjectProbe)
            }
            (TimerKind::HangUp, WatchdogState::AwaitingReply) => {
                self.state = WatchdogState::Idle;
                info!("No reply to probe, hanging up");
                Some(WatchdogAction::HangUp)
            }
            _ => {
                warn!(?kind, state = ?self.state, "Stale watchdog timer ignored");
                None
            }
        }
    }

    /// Cancels every watchdog timer and returns to `Idle`.
    pub fn reset(&mut self, timers: &mut TimerQueue) {
        for kind in WATCHDOG_TIMERS {
            timers.disarm(kind);
        }
        self.state = WatchdogState::Idle;
    }
}

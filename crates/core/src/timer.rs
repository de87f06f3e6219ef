//! Clock and timer capabilities for the session state machine.
//!
//! The controller never sleeps. It arms deadlines on a [`TimerQueue`] and the
//! embedding loop calls back into it once the earliest deadline has passed.
//! Tests drive the same queue with a [`ManualClock`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// A clock that only moves when [`ManualClock::advance`] is called.
#[derive(Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Every timer a session can arm. At most one of each kind is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Periodic heartbeat to keep the socket open.
    KeepAlive,
    /// Primary silence timer armed after the agent finishes speaking.
    Inactivity,
    /// Short delay between gating the microphone and injecting the probe.
    ProbeGrace,
    /// One-shot retry after the probe was refused.
    ProbeRetry,
    /// Final timer after the probe was spoken; expiry ends the session.
    HangUp,
}

impl TimerKind {
    pub const ALL: [TimerKind; 5] = [
        TimerKind::KeepAlive,
        TimerKind::Inactivity,
        TimerKind::ProbeGrace,
        TimerKind::ProbeRetry,
        TimerKind::HangUp,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::KeepAlive => 0,
            TimerKind::Inactivity => 1,
            TimerKind::ProbeGrace => 2,
            TimerKind::ProbeRetry => 3,
            TimerKind::HangUp => 4,
        }
    }
}

/// Deadlines for each [`TimerKind`], measured on an injected [`Clock`].
pub struct TimerQueue {
    clock: Arc<dyn Clock>,
    deadlines: [Option<Duration>; 5],
}

impl TimerQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deadlines: [None; 5],
        }
    }

    /// Arms `kind` to fire after `delay`, replacing any earlier deadline of the same kind.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.deadlines[kind.slot()] = Some(self.clock.now() + delay);
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        self.deadlines[kind.slot()] = None;
    }

    pub fn disarm_all(&mut self) {
        self.deadlines = [None; 5];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.deadlines[kind.slot()].is_some()
    }

    /// Deadline of `kind` if armed.
    pub fn deadline(&self, kind: TimerKind) -> Option<Duration> {
        self.deadlines[kind.slot()]
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.deadlines.iter().flatten().min().copied()
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Removes and returns every timer whose deadline has passed, earliest first.
    pub fn take_expired(&mut self) -> Vec<TimerKind> {
        let now = self.clock.now();
        let mut due: Vec<(Duration, TimerKind)> = TimerKind::ALL
            .iter()
            .filter_map(|&kind| match self.deadlines[kind.slot()] {
                Some(at) if at <= now => Some((at, kind)),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(at, _)| *at);
        for (_, kind) in &due {
            self.deadlines[kind.slot()] = None;
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in TimerKind::ALL {
            if let Some(at) = self.deadlines[kind.slot()] {
                map.entry(&kind, &at);
            }
        }
        map.finish()
    }
}

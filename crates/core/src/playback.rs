//! Gapless scheduling of inbound agent audio on an output timeline.

use crate::codec;
use crate::error::PlaybackError;
use tracing::{debug, warn};

/// An open audio output with its own monotonic timeline.
pub trait AudioOutput: Send {
    /// Current position of the output timeline, in seconds.
    fn current_time(&self) -> f64;

    /// Schedules `samples` (mono, at the rate the output was created with)
    /// to start playing at `start_at` on the output timeline.
    fn schedule(&mut self, samples: &[f32], start_at: f64);

    /// Stops playback immediately and releases the device.
    fn close(&mut self);
}

/// Opens audio outputs on demand.
pub trait OutputFactory: Send {
    fn create(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, PlaybackError>;
}

/// Where a chunk landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
}

/// Schedules PCM chunks back to back on a lazily created output.
///
/// Each chunk starts at `max(now, next_play_time)`, so chunks that arrive
/// before their predecessor finishes play without a gap, and a chunk that
/// arrives late starts immediately instead of in the past.
pub struct PlaybackScheduler {
    factory: Box<dyn OutputFactory>,
    output: Option<Box<dyn AudioOutput>>,
    sample_rate: u32,
    next_play_time: f64,
}

impl PlaybackScheduler {
    pub fn new(factory: Box<dyn OutputFactory>) -> Self {
        Self::with_sample_rate(factory, codec::OUTPUT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(factory: Box<dyn OutputFactory>, sample_rate: u32) -> Self {
        Self {
            factory,
            output: None,
            sample_rate,
            next_play_time: 0.0,
        }
    }

    /// Schedules one PCM16 chunk. Corrupt chunks and output failures are
    /// logged and skipped without moving the timeline.
    pub fn enqueue(&mut self, pcm: &[u8]) -> Option<ScheduledChunk> {
        if pcm.is_empty() || pcm.len() % 2 != 0 {
            warn!(len = pcm.len(), "Skipping malformed PCM16 chunk");
            return None;
        }

        if self.output.is_none() {
            match self.factory.create(self.sample_rate) {
                Ok(output) => {
                    debug!(sample_rate = self.sample_rate, "Opened audio output");
                    self.output = Some(output);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to open audio output, dropping chunk");
                    return None;
                }
            }
        }
        let output = self.output.as_mut()?;

        let samples = codec::decode(pcm);
        let duration = codec::duration_secs(pcm.len(), self.sample_rate);
        let start = output.current_time().max(self.next_play_time);
        output.schedule(&samples, start);
        self.next_play_time = start + duration;

        Some(ScheduledChunk { start, duration })
    }

    /// Drops everything queued and tears down the output (barge-in).
    pub fn flush(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.close();
            debug!("Audio output flushed");
        }
        self.next_play_time = 0.0;
    }

    pub fn is_open(&self) -> bool {
        self.output.is_some()
    }

    pub fn next_play_time(&self) -> f64 {
        self.next_play_time
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.flush();
    }
}

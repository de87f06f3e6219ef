//! Microphone capture: fixed-size windows encoded to PCM16 frames.
//!
//! The hardware side is behind [`Microphone`]. The engine only decides,
//! window by window, whether the encoded frame is emitted, so muting and
//! gating never touch the device.

use crate::codec;
use crate::error::CaptureError;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Samples per processing window (64 ms at 16 kHz).
pub const WINDOW_SAMPLES: usize = 1024;

/// Constraints requested from the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    /// Rate the device layer must deliver samples at.
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            sample_rate: codec::INPUT_SAMPLE_RATE,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Called from the audio thread with mono samples at the requested rate.
pub type SampleCallback = Box<dyn FnMut(&[f32]) + Send>;

/// Receives encoded PCM16 frames ready for the socket.
pub type FrameSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A microphone that can be opened with a sample callback.
pub trait Microphone: Send {
    fn open(
        &mut self,
        options: &CaptureOptions,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError>;
}

/// A running capture stream. Dropping it without `stop` must also release the device.
pub trait ActiveCapture: Send {
    fn stop(&mut self);
}

/// Flags read by the audio callback on every window.
#[derive(Debug, Default)]
pub struct CaptureFlags {
    muted: AtomicBool,
    gated: AtomicBool,
}

impl CaptureFlags {
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn is_gated(&self) -> bool {
        self.gated.load(Ordering::Acquire)
    }

    fn suppressed(&self) -> bool {
        self.is_muted() || self.is_gated()
    }
}

/// Accumulates arbitrary sample blocks into fixed windows.
struct Windower {
    buffer: Vec<f32>,
    flags: Arc<CaptureFlags>,
    sink: FrameSink,
}

impl Windower {
    fn push(&mut self, samples: &[f32]) {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (WINDOW_SAMPLES - self.buffer.len()).min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == WINDOW_SAMPLES {
                if !self.flags.suppressed() {
                    (self.sink)(Bytes::from(codec::encode(&self.buffer)));
                }
                self.buffer.clear();
            }
        }
    }
}

/// Owns microphone acquisition and emits one PCM16 frame per window.
pub struct CaptureEngine {
    microphone: Box<dyn Microphone>,
    options: CaptureOptions,
    flags: Arc<CaptureFlags>,
    sink: FrameSink,
    active: Option<Box<dyn ActiveCapture>>,
}

impl CaptureEngine {
    pub fn new(microphone: Box<dyn Microphone>, sink: FrameSink) -> Self {
        Self {
            microphone,
            options: CaptureOptions::default(),
            flags: Arc::new(CaptureFlags::default()),
            sink,
            active: None,
        }
    }

    /// Opens the microphone. Calling it while already running is a no-op.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.active.is_some() {
            return Ok(());
        }
        let mut windower = Windower {
            buffer: Vec::with_capacity(WINDOW_SAMPLES),
            flags: self.flags.clone(),
            sink: self.sink.clone(),
        };
        let active = self
            .microphone
            .open(&self.options, Box::new(move |samples: &[f32]| windower.push(samples)))?;
        self.active = Some(active);
        info!(
            sample_rate = self.options.sample_rate,
            window = WINDOW_SAMPLES,
            "Microphone capture started"
        );
        Ok(())
    }

    /// Releases the microphone. Idempotent.
    pub fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.stop();
            info!("Microphone capture stopped");
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.flags.muted.store(muted, Ordering::Release);
        debug!(muted, "Microphone mute toggled");
    }

    pub fn set_gated(&self, gated: bool) {
        if self.flags.gated.swap(gated, Ordering::AcqRel) != gated {
            debug!(gated, "Microphone gate toggled");
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.flags.is_muted()
    }

    pub fn is_gated(&self) -> bool {
        self.flags.is_gated()
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Shared view of a fake microphone, for assertions and for feeding samples.
    #[derive(Default)]
    pub(crate) struct MicState {
        pub callback: Option<SampleCallback>,
        pub opened: usize,
        pub stopped: usize,
        pub fail_with: Option<CaptureError>,
        pub options: Option<CaptureOptions>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeMic(pub Arc<Mutex<MicState>>);

    impl FakeMic {
        pub(crate) fn feed(&self, samples: &[f32]) {
            let mut state = self.0.lock().unwrap();
            if let Some(cb) = state.callback.as_mut() {
                cb(samples);
            }
        }
    }

    struct FakeActive(Arc<Mutex<MicState>>);

    impl ActiveCapture for FakeActive {
        fn stop(&mut self) {
            let mut state = self.0.lock().unwrap();
            state.callback = None;
            state.stopped += 1;
        }
    }

    impl Microphone for FakeMic {
        fn open(
            &mut self,
            options: &CaptureOptions,
            on_samples: SampleCallback,
        ) -> Result<Box<dyn ActiveCapture>, CaptureError> {
            let mut state = self.0.lock().unwrap();
            if let Some(e) = state.fail_with.clone() {
                return Err(e);
            }
            state.opened += 1;
            state.options = Some(options.clone());
            state.callback = Some(on_samples);
            Ok(Box::new(FakeActive(self.0.clone())))
        }
    }

    pub(crate) fn collecting_sink() -> (Arc<Mutex<Vec<Bytes>>>, FrameSink) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink_frames = frames.clone();
        let sink: FrameSink = Arc::new(move |frame: Bytes| sink_frames.lock().unwrap().push(frame));
        (frames, sink)
    }

    fn engine() -> (FakeMic, Arc<Mutex<Vec<Bytes>>>, CaptureEngine) {
        let mic = FakeMic::default();
        let (frames, sink) = collecting_sink();
        let engine = CaptureEngine::new(Box::new(mic.clone()), sink);
        (mic, frames, engine)
    }

    #[test]
    fn test_start_requests_processing_constraints() {
        let (mic, _frames, mut capture) = engine();
        capture.start().unwrap();
        let options = mic.0.lock().unwrap().options.clone().unwrap();
        assert_eq!(options.sample_rate, 16_000);
        assert!(options.echo_cancellation);
        assert!(options.noise_suppression);
    }

    #[test]
    fn test_emits_one_frame_per_full_window() {
        let (mic, frames, mut capture) = engine();
        capture.start().unwrap();

        mic.feed(&[0.1; 600]);
        assert!(frames.lock().unwrap().is_empty());
        mic.feed(&[0.1; 600]);
        mic.feed(&[0.1; 900]);

        let frames = frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == WINDOW_SAMPLES * 2));
    }

    #[test]
    fn test_mute_and_gate_suppress_next_window() {
        let (mic, frames, mut capture) = engine();
        capture.start().unwrap();

        capture.set_muted(true);
        mic.feed(&[0.2; WINDOW_SAMPLES]);
        capture.set_muted(false);
        capture.set_gated(true);
        mic.feed(&[0.2; WINDOW_SAMPLES]);
        assert!(frames.lock().unwrap().is_empty());

        capture.set_gated(false);
        mic.feed(&[0.2; WINDOW_SAMPLES]);
        assert_eq!(frames.lock().unwrap().len(), 1);
        assert!(capture.is_running());
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_device() {
        let (mic, _frames, mut capture) = engine();
        capture.start().unwrap();
        capture.start().unwrap();
        capture.stop();
        capture.stop();

        let state = mic.0.lock().unwrap();
        assert_eq!(state.opened, 1);
        assert_eq!(state.stopped, 1);
        assert!(state.callback.is_none());
    }

    #[test]
    fn test_open_failure_is_typed() {
        let (mic, _frames, mut capture) = engine();
        mic.0.lock().unwrap().fail_with = Some(CaptureError::PermissionDenied("denied".into()));

        let err = capture.start().unwrap_err();
        assert_eq!(err, CaptureError::PermissionDenied("denied".into()));
        assert!(!capture.is_running());
    }
}

//! Microphone capture on the default cpal input device.
//!
//! cpal streams are not `Send` on every platform, so each capture owns a
//! dedicated thread that builds the stream, plays it and parks until stopped.
//! The session task only ever signals that thread.

use super::resample::StreamResampler;
use super::{CaptureErrors, DeviceThreads};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use std::sync::mpsc;
use tracing::{debug, info, warn};
use voice_agent_core::capture::{ActiveCapture, CaptureOptions, Microphone, SampleCallback};
use voice_agent_core::CaptureError;

/// Input frames per resampler chunk.
const RESAMPLER_CHUNK: usize = 480;

/// The system default microphone.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    threads: DeviceThreads,
    errors: CaptureErrors,
}

impl CpalMicrophone {
    pub fn new(threads: DeviceThreads, errors: CaptureErrors) -> Self {
        Self { threads, errors }
    }
}

impl Microphone for CpalMicrophone {
    /// Hands the device to a capture thread and returns immediately. Failures
    /// to open or start the stream arrive on the capture error channel.
    fn open(
        &mut self,
        options: &CaptureOptions,
        on_samples: SampleCallback,
    ) -> Result<Box<dyn ActiveCapture>, CaptureError> {
        if options.echo_cancellation || options.noise_suppression {
            debug!("Echo cancellation and noise suppression are left to the platform");
        }
        let target_rate = options.sample_rate;
        let capture = spawn_capture(&self.threads, self.errors.clone(), move || {
            build_input_stream(target_rate, on_samples)
        })?;
        Ok(Box::new(capture))
    }
}

/// A stream the capture thread can start.
trait Playable {
    fn start(&self) -> Result<(), CaptureError>;
}

impl Playable for cpal::Stream {
    fn start(&self) -> Result<(), CaptureError> {
        self.play().map_err(|e| CaptureError::Device(e.to_string()))
    }
}

fn spawn_capture<S, B>(
    threads: &DeviceThreads,
    errors: CaptureErrors,
    build: B,
) -> Result<CpalCapture, CaptureError>
where
    S: Playable,
    B: FnOnce() -> Result<S, CaptureError> + Send + 'static,
{
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    threads
        .spawn("mic-capture", move || {
            let stream = match build().and_then(|stream| stream.start().map(|()| stream)) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Microphone failed to start");
                    let _ = errors.send(e);
                    return;
                }
            };
            // Parks until `stop` sends or the handle is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| CaptureError::Device(e.to_string()))?;
    Ok(CpalCapture {
        stop: Some(stop_tx),
    })
}

struct CpalCapture {
    stop: Option<mpsc::Sender<()>>,
}

impl ActiveCapture for CpalCapture {
    /// Signals the capture thread, which drops the stream on its way out.
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Downmixes device frames to mono and resamples them to the session rate.
struct InputPipeline {
    channels: usize,
    mono: Vec<f32>,
    resampler: StreamResampler,
    on_samples: SampleCallback,
}

impl InputPipeline {
    fn process<T>(&mut self, data: &[T])
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        self.mono.clear();
        for frame in data.chunks(self.channels) {
            let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
            self.mono.push(sum / frame.len() as f32);
        }
        match self.resampler.push(&self.mono) {
            Ok(samples) if !samples.is_empty() => (self.on_samples)(&samples),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Dropping microphone block that failed to resample"),
        }
    }
}

fn build_input_stream(
    target_rate: u32,
    on_samples: SampleCallback,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;
    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => CaptureError::NoDevice,
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            CaptureError::Unsupported(e.to_string())
        }
        other => classify_backend_error(other.to_string()),
    })?;

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        device_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        target_rate,
        "Opening microphone"
    );

    let pipeline = InputPipeline {
        channels: config.channels.max(1) as usize,
        mono: Vec::new(),
        resampler: StreamResampler::new(config.sample_rate.0, target_rate, RESAMPLER_CHUNK)
            .map_err(|e| CaptureError::Unsupported(e.to_string()))?,
        on_samples,
    };

    match sample_format {
        SampleFormat::F32 => build_typed::<f32>(&device, &config, pipeline),
        SampleFormat::I16 => build_typed::<i16>(&device, &config, pipeline),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, pipeline),
        other => Err(CaptureError::Unsupported(format!(
            "sample format {:?}",
            other
        ))),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut pipeline: InputPipeline,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| pipeline.process(data),
            |err| warn!(error = %err, "Microphone stream error"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoDevice,
            cpal::BuildStreamError::StreamConfigNotSupported => {
                CaptureError::Unsupported(e.to_string())
            }
            other => classify_backend_error(other.to_string()),
        })
}

/// Backends report permission problems only through their error text.
fn classify_backend_error(message: String) -> CaptureError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CaptureError::PermissionDenied(message)
    } else {
        CaptureError::Device(message)
    }
}

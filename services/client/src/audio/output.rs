//! Agent audio playback on the default cpal output device.
//!
//! The output timeline is the number of frames the device callback has
//! rendered, so it advances in real time whether or not audio is queued.
//! Scheduled samples go through one resampler for the life of the output, so
//! chunk boundaries are seamless, and into a ring buffer; the callback plays
//! silence when the buffer runs dry.

use super::DeviceThreads;
use super::resample::StreamResampler;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use tracing::{debug, info, warn};
use voice_agent_core::PlaybackError;
use voice_agent_core::playback::{AudioOutput, OutputFactory};

/// Seconds of audio the ring buffer can hold ahead of the device.
const BUFFER_SECONDS: u32 = 60;

/// What the playback thread hands back once its stream is playing.
type Ready = Result<(HeapProd<f32>, u32, Arc<AtomicU64>), PlaybackError>;

/// Input frames per playback resampler chunk.
const RESAMPLER_CHUNK: usize = 240;

/// Opens playback streams on the system default output device.
#[derive(Debug, Default, Clone)]
pub struct CpalOutputFactory {
    threads: DeviceThreads,
}

impl CpalOutputFactory {
    pub fn new(threads: DeviceThreads) -> Self {
        Self { threads }
    }
}

impl OutputFactory for CpalOutputFactory {
    fn create(&mut self, sample_rate: u32) -> Result<Box<dyn AudioOutput>, PlaybackError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Ready>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        self.threads
            .spawn("agent-playback", move || {
                let rendered = Arc::new(AtomicU64::new(0));
                let stream = match build_output_stream(rendered.clone()) {
                    Ok((stream, producer, device_rate)) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(PlaybackError::Device(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok((producer, device_rate, rendered)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Parks until `close` sends or the output is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        Ok(Box::new(CpalOutput::opening(sample_rate, ready_rx, stop_tx)))
    }
}

/// Resamples scheduled audio onto the device ring buffer.
struct OutputQueue {
    source_rate: u32,
    device_rate: u32,
    resampler: StreamResampler,
    producer: HeapProd<f32>,
    rendered: Arc<AtomicU64>,
    /// Output-clock time at which the last scheduled chunk ends.
    scheduled_end: Option<f64>,
}

impl OutputQueue {
    fn new(
        source_rate: u32,
        producer: HeapProd<f32>,
        device_rate: u32,
        rendered: Arc<AtomicU64>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            source_rate,
            device_rate,
            resampler: StreamResampler::new(source_rate, device_rate, RESAMPLER_CHUNK)?,
            producer,
            rendered,
            scheduled_end: None,
        })
    }

    fn current_time(&self) -> f64 {
        self.rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    /// Device frame at which the last queued sample finishes.
    fn queued_until(&self) -> u64 {
        self.rendered.load(Ordering::Acquire) + self.producer.occupied_len() as u64
    }

    fn schedule(&mut self, samples: &[f32], start_at: f64) {
        let device_rate = self.device_rate as f64;
        // A chunk that starts where the previous one ended is spliced straight
        // on; silence only fills real gaps on the timeline.
        let contiguous = self
            .scheduled_end
            .is_some_and(|end| ((start_at - end) * device_rate).abs() < 1.0);
        if !contiguous {
            let start_frame = (start_at * device_rate).round() as u64;
            let gap = start_frame.saturating_sub(self.queued_until()) as usize;
            if gap > 0 {
                let silence = vec![0.0; gap.min(self.producer.vacant_len())];
                self.producer.push_slice(&silence);
            }
        }
        self.scheduled_end = Some(start_at + samples.len() as f64 / self.source_rate as f64);

        let resampled = match self.resampler.push(samples) {
            Ok(resampled) => resampled,
            Err(e) => {
                warn!(error = %e, "Dropping agent audio that failed to resample");
                return;
            }
        };
        let pushed = self.producer.push_slice(&resampled);
        if pushed < resampled.len() {
            warn!(
                dropped = resampled.len() - pushed,
                "Playback buffer full, dropping agent audio"
            );
        }
    }
}

enum OutputState {
    /// The device thread has not answered yet; chunks wait here in order.
    Opening {
        ready: mpsc::Receiver<Ready>,
        stash: Vec<(Vec<f32>, f64)>,
    },
    Playing(OutputQueue),
    Closed,
}

pub struct CpalOutput {
    source_rate: u32,
    state: OutputState,
    stop: Option<mpsc::Sender<()>>,
}

impl CpalOutput {
    fn opening(source_rate: u32, ready: mpsc::Receiver<Ready>, stop: mpsc::Sender<()>) -> Self {
        Self {
            source_rate,
            state: OutputState::Opening {
                ready,
                stash: Vec::new(),
            },
            stop: Some(stop),
        }
    }

    /// Moves to `Playing` once the device thread reports in.
    fn poll_ready(&mut self) {
        let OutputState::Opening { ready, stash } = &mut self.state else {
            return;
        };
        let answer = match ready.try_recv() {
            Ok(answer) => answer,
            Err(mpsc::TryRecvError::Empty) => return,
            Err(mpsc::TryRecvError::Disconnected) => {
                Err(PlaybackError::Device("playback thread exited".into()))
            }
        };
        let stash = std::mem::take(stash);
        let source_rate = self.source_rate;

        self.state = match answer.and_then(|(producer, device_rate, rendered)| {
            OutputQueue::new(source_rate, producer, device_rate, rendered)
                .map_err(|e| PlaybackError::Device(e.to_string()))
        }) {
            Ok(mut queue) => {
                debug!(
                    device_rate = queue.device_rate,
                    stashed = stash.len(),
                    "Audio output ready"
                );
                for (samples, start_at) in stash {
                    queue.schedule(&samples, start_at);
                }
                OutputState::Playing(queue)
            }
            Err(e) => {
                warn!(error = %e, "Failed to open audio output, dropping agent audio");
                OutputState::Closed
            }
        };
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        match &self.state {
            OutputState::Playing(queue) => queue.current_time(),
            _ => 0.0,
        }
    }

    fn schedule(&mut self, samples: &[f32], start_at: f64) {
        self.poll_ready();
        match &mut self.state {
            OutputState::Opening { stash, .. } => stash.push((samples.to_vec(), start_at)),
            OutputState::Playing(queue) => queue.schedule(samples, start_at),
            OutputState::Closed => {}
        }
    }

    /// Signals the playback thread and returns; the thread drops the stream.
    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
            debug!("Audio output closed");
        }
        self.state = OutputState::Closed;
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Copies mono samples from the ring buffer into interleaved device frames.
fn render<T>(data: &mut [T], channels: usize, consumer: &mut HeapCons<f32>, rendered: &AtomicU64)
where
    T: SizedSample + FromSample<f32>,
{
    let mut frames = 0u64;
    for frame in data.chunks_mut(channels) {
        let sample = T::from_sample(consumer.try_pop().unwrap_or(0.0));
        frame.fill(sample);
        frames += 1;
    }
    rendered.fetch_add(frames, Ordering::Release);
}

fn build_output_stream(
    rendered: Arc<AtomicU64>,
) -> Result<(cpal::Stream, HeapProd<f32>, u32), PlaybackError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(PlaybackError::NoDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();
    let device_rate = config.sample_rate.0;
    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".into()),
        device_rate,
        channels = config.channels,
        ?sample_format,
        "Opening audio output"
    );

    let (producer, consumer) = HeapRb::<f32>::new((device_rate * BUFFER_SECONDS) as usize).split();
    let stream = match sample_format {
        SampleFormat::F32 => build_typed::<f32>(&device, &config, consumer, rendered),
        SampleFormat::I16 => build_typed::<i16>(&device, &config, consumer, rendered),
        SampleFormat::U16 => build_typed::<u16>(&device, &config, consumer, rendered),
        other => Err(PlaybackError::Device(format!(
            "unsupported sample format {:?}",
            other
        ))),
    }?;
    Ok((stream, producer, device_rate))
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: HeapCons<f32>,
    rendered: Arc<AtomicU64>,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                render(data, channels, &mut consumer, &rendered)
            },
            |err| warn!(error = %err, "Audio output stream error"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => PlaybackError::NoDevice,
            other => PlaybackError::Device(other.to_string()),
        })
}

//! cpal-backed microphone and speaker for the session controller.
//!
//! Devices live on their own threads. Opening and closing only signal those
//! threads, so the session task never waits on hardware; [`DeviceThreads`]
//! lets shutdown await the moment every stream has actually been dropped.

pub mod capture;
pub mod output;
pub mod resample;

pub use capture::CpalMicrophone;
pub use output::CpalOutputFactory;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use voice_agent_core::CaptureError;
use voice_agent_core::capture::Microphone;
use voice_agent_core::playback::OutputFactory;

/// Where a microphone reports failures detected after `open` returned.
pub type CaptureErrors = mpsc::UnboundedSender<CaptureError>;

/// Hands out fresh audio devices for each session.
#[async_trait]
pub trait AudioDevices: Send + Sync {
    fn microphone(&self, errors: CaptureErrors) -> Box<dyn Microphone>;
    fn output(&self) -> Box<dyn OutputFactory>;

    /// Resolves once every device handed out so far has released its hardware.
    async fn released(&self) {}
}

/// Counts live device threads.
#[derive(Debug, Clone)]
pub struct DeviceThreads(Arc<watch::Sender<usize>>);

impl Default for DeviceThreads {
    fn default() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }
}

struct LiveThread(Arc<watch::Sender<usize>>);

impl Drop for LiveThread {
    fn drop(&mut self) {
        self.0.send_modify(|live| *live -= 1);
    }
}

impl DeviceThreads {
    /// Spawns a named device thread that stays counted until `body` returns.
    pub fn spawn<F>(&self, name: &str, body: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.send_modify(|live| *live += 1);
        let guard = LiveThread(self.0.clone());
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let _guard = guard;
                body();
            })
            .map(|_| ())
    }

    pub fn live(&self) -> usize {
        *self.0.borrow()
    }

    pub async fn idle(&self) {
        let mut live = self.0.subscribe();
        let _ = live.wait_for(|count| *count == 0).await;
    }
}

/// The system default input and output devices.
#[derive(Debug, Default, Clone)]
pub struct CpalDevices {
    threads: DeviceThreads,
}

#[async_trait]
impl AudioDevices for CpalDevices {
    fn microphone(&self, errors: CaptureErrors) -> Box<dyn Microphone> {
        Box::new(CpalMicrophone::new(self.threads.clone(), errors))
    }

    fn output(&self) -> Box<dyn OutputFactory> {
        Box::new(CpalOutputFactory::new(self.threads.clone()))
    }

    async fn released(&self) {
        self.threads.idle().await;
    }
}

//! Renderer traits and the render loop
//!
//! The render loop owns one [`ImageRenderer`] on a dedicated OS thread. Each cycle
//! renders a compressed raster and publishes it to a single-slot mailbox; consumers
//! only ever see the newest frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;

use super::config::StillImageConfig;
use super::frame::StillImageFrame;
use crate::error::RenderError;

/// Single-slot mailbox holding the newest frame
pub(crate) type FrameMailbox = Arc<watch::Sender<Option<StillImageFrame>>>;

/// Produces compressed still images
///
/// Runs on the render thread; `render` may block for as long as one frame takes.
pub trait ImageRenderer: Send {
    /// Render one image, already compressed (e.g. JPEG)
    fn render(&mut self) -> Result<Bytes, RenderError>;
}

impl<F> ImageRenderer for F
where
    F: FnMut() -> Result<Bytes, RenderError> + Send,
{
    fn render(&mut self) -> Result<Bytes, RenderError> {
        self()
    }
}

/// Creates a renderer when the first client attaches and takes it back afterwards
pub trait RendererFactory: Send + Sync + 'static {
    /// An error rejects the attaching client with `500`
    fn create(&self, config: &StillImageConfig) -> Result<Box<dyn ImageRenderer>, RenderError>;

    /// Called with the renderer once the render thread exited in time
    fn release(&self, renderer: Box<dyn ImageRenderer>) {
        drop(renderer);
    }
}

/// Handle of a running render thread
pub(crate) struct RenderLoop {
    /// Once set, the thread publishes nothing more
    stopped: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<Box<dyn ImageRenderer>>,
    handle: thread::JoinHandle<()>,
}

impl RenderLoop {
    pub(crate) fn spawn(
        renderer: Box<dyn ImageRenderer>,
        interval: Duration,
        mailbox: FrameMailbox,
    ) -> Result<Self, RenderError> {
        let stopped = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let gate = Arc::clone(&stopped);
        let handle = thread::Builder::new()
            .name("still-render".into())
            .spawn(move || {
                let renderer = run(renderer, interval, &mailbox, &gate, &stop_rx);
                let _ = done_tx.send(renderer);
            })
            .map_err(|e| RenderError::new(format!("failed to spawn render thread: {}", e)))?;

        Ok(Self {
            stopped,
            stop_tx,
            done_rx,
            handle,
        })
    }

    /// Signal the thread and wait at most `join_timeout` for it
    ///
    /// Returns the renderer when the thread exited in time. Otherwise the thread is
    /// abandoned and drops the renderer itself whenever the current render returns.
    /// Either way the mailbox receives no frame from this loop after `stop` returns.
    pub(crate) fn stop(self, join_timeout: Duration) -> Option<Box<dyn ImageRenderer>> {
        self.stopped.store(true, Ordering::SeqCst);
        let _ = self.stop_tx.send(());

        match self.done_rx.recv_timeout(join_timeout) {
            Ok(renderer) => {
                let _ = self.handle.join();
                Some(renderer)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = join_timeout.as_millis() as u64,
                    "Render thread did not stop in time, abandoning it"
                );
                None
            }
        }
    }
}

fn run(
    mut renderer: Box<dyn ImageRenderer>,
    interval: Duration,
    mailbox: &watch::Sender<Option<StillImageFrame>>,
    stopped: &AtomicBool,
    stop_rx: &mpsc::Receiver<()>,
) -> Box<dyn ImageRenderer> {
    let mut sequence = 0u64;
    let mut failing = false;

    loop {
        let started = Instant::now();

        match renderer.render() {
            Ok(data) if data.is_empty() => {
                tracing::trace!("Renderer returned an empty image");
            }
            Ok(data) => {
                // Checked under the mailbox lock, so a clear issued after `stop`
                // always lands after the last frame of this loop
                let published = mailbox.send_if_modified(|slot| {
                    if stopped.load(Ordering::SeqCst) {
                        return false;
                    }
                    *slot = Some(StillImageFrame::new(data, sequence + 1));
                    true
                });
                if !published {
                    break;
                }
                sequence += 1;
                failing = false;
            }
            Err(e) => {
                // Log once per failure streak
                if !failing {
                    tracing::warn!(error = %e, "Render failed");
                }
                failing = true;
            }
        }

        let wait = interval.saturating_sub(started.elapsed());
        match stop_rx.recv_timeout(wait) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::debug!(frames = sequence, "Render loop stopped");
    renderer
}

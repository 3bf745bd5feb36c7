//! Lazy render loop lifecycle
//!
//! Same shape as the transport stream session: the render loop starts when the
//! first client attaches and stops when the last one detaches. All methods block
//! while the factory runs or the render thread is joined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::config::StillImageConfig;
use super::frame::StillImageFrame;
use super::renderer::{FrameMailbox, RenderLoop, RendererFactory};
use crate::error::SessionError;
use crate::registry::{ClientId, ClientRegistry, PacketSink, Transition};
use crate::server::event::{EventSender, ServerEvent};
use crate::stats::ServerCounters;

struct ActiveLoop {
    id: u64,
    render_loop: RenderLoop,
}

pub(crate) struct RenderController {
    config: StillImageConfig,
    factory: Arc<dyn RendererFactory>,
    registry: Arc<ClientRegistry>,
    mailbox: FrameMailbox,
    /// Newest frame already framed as a multipart part
    current_part: Mutex<Option<Bytes>>,
    active: Mutex<Option<ActiveLoop>>,
    next_loop_id: AtomicU64,
    counters: Arc<ServerCounters>,
    events: EventSender,
}

impl RenderController {
    pub(crate) fn new(
        config: StillImageConfig,
        factory: Arc<dyn RendererFactory>,
        counters: Arc<ServerCounters>,
        events: EventSender,
    ) -> Self {
        let (mailbox, _) = watch::channel(None);
        Self {
            config,
            factory,
            registry: Arc::new(ClientRegistry::new()),
            mailbox: Arc::new(mailbox),
            current_part: Mutex::new(None),
            active: Mutex::new(None),
            next_loop_id: AtomicU64::new(1),
            counters,
            events,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub(crate) fn frames(&self) -> watch::Receiver<Option<StillImageFrame>> {
        self.mailbox.subscribe()
    }

    pub(crate) fn is_rendering(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Attach a client, starting the render loop if none runs
    ///
    /// The client receives the current frame right away when one exists.
    pub(crate) fn attach<S: PacketSink + 'static>(
        &self,
        conn: &Arc<S>,
    ) -> Result<(), SessionError> {
        let mut active = self.active.lock();
        self.registry.register(conn);

        if active.is_none() {
            match self.start_loop() {
                Ok(started) => *active = Some(started),
                Err(e) => {
                    self.registry.deregister(conn.id());
                    tracing::warn!(
                        client_id = conn.id(),
                        error = %e,
                        "Render loop creation failed"
                    );
                    self.events.emit(ServerEvent::SessionFailed {
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        if let Some(part) = self.current_part.lock().clone() {
            let _ = conn.send(part);
        }
        Ok(())
    }

    /// Detach a client; stops the render loop when it was the last one
    pub(crate) fn detach(&self, id: ClientId) -> bool {
        let mut active = self.active.lock();
        if self.registry.deregister(id) != Transition::LastDetached {
            return false;
        }

        match active.take() {
            Some(running) => {
                self.stop_loop(running);
                true
            }
            None => false,
        }
    }

    /// Close every client and stop the render loop regardless of attach count
    pub(crate) fn force_release(&self) -> bool {
        let mut active = self.active.lock();
        let clients = self.registry.clear();

        match active.take() {
            Some(running) => {
                tracing::info!(loop_id = running.id, clients = clients, "Forcing render loop stop");
                self.stop_loop(running);
                true
            }
            None => false,
        }
    }

    /// Frame the newest image and fan it out to every attached client
    pub(crate) fn publish(&self, frame: &StillImageFrame) -> usize {
        let part = super::http::part(&self.config.boundary, &self.config.content_type, &frame.data);
        *self.current_part.lock() = Some(part.clone());

        let outcome = self.registry.broadcast(&part);
        tracing::trace!(
            sequence = frame.sequence,
            bytes = part.len(),
            delivered = outcome.delivered,
            evicted = outcome.evicted,
            "Frame broadcast"
        );
        outcome.delivered
    }

    fn start_loop(&self) -> Result<ActiveLoop, SessionError> {
        let id = self.next_loop_id.fetch_add(1, Ordering::Relaxed);
        let renderer = self.factory.create(&self.config)?;
        let render_loop = RenderLoop::spawn(
            renderer,
            self.config.frame_interval(),
            Arc::clone(&self.mailbox),
        )?;

        self.counters.record_session_created();
        self.events.emit(ServerEvent::SessionCreated { session_id: id });
        tracing::info!(
            loop_id = id,
            width = self.config.width,
            height = self.config.height,
            fps = self.config.frame_rate,
            "Render loop started"
        );
        Ok(ActiveLoop { id, render_loop })
    }

    fn stop_loop(&self, running: ActiveLoop) {
        if let Some(renderer) = running.render_loop.stop(self.config.join_timeout) {
            self.factory.release(renderer);
        }
        // A restarted loop must not hand out a frame of the previous one
        self.mailbox.send_replace(None);
        *self.current_part.lock() = None;

        self.counters.record_session_released();
        self.events.emit(ServerEvent::SessionReleased {
            session_id: running.id,
        });
        tracing::info!(loop_id = running.id, "Render loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use super::*;
    use crate::error::RenderError;
    use crate::registry::SendError;
    use crate::still::renderer::ImageRenderer;

    #[derive(Default)]
    struct CountingFactory {
        creates: AtomicUsize,
        releases: AtomicUsize,
        fail: AtomicBool,
    }

    impl RendererFactory for CountingFactory {
        fn create(
            &self,
            _config: &StillImageConfig,
        ) -> Result<Box<dyn ImageRenderer>, RenderError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RenderError::new("no surface"));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(|| -> Result<Bytes, RenderError> {
                Ok(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]))
            }))
        }

        fn release(&self, _renderer: Box<dyn ImageRenderer>) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestSink {
        id: ClientId,
        received: Mutex<Vec<Bytes>>,
    }

    impl PacketSink for TestSink {
        fn id(&self) -> ClientId {
            self.id
        }

        fn send(&self, payload: Bytes) -> Result<(), SendError> {
            self.received.lock().push(payload);
            Ok(())
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn sink(id: ClientId) -> Arc<TestSink> {
        Arc::new(TestSink {
            id,
            received: Mutex::new(Vec::new()),
        })
    }

    fn controller(factory: &Arc<CountingFactory>) -> RenderController {
        let config = StillImageConfig::default()
            .boundary("b")
            .join_timeout(Duration::from_secs(1));
        RenderController::new(
            config,
            Arc::clone(factory) as Arc<dyn RendererFactory>,
            Arc::new(ServerCounters::new()),
            EventSender::new(),
        )
    }

    #[test]
    fn test_loop_follows_attach_count() {
        let factory = Arc::new(CountingFactory::default());
        let controller = controller(&factory);

        controller.attach(&sink(1)).unwrap();
        controller.attach(&sink(2)).unwrap();
        assert!(controller.is_rendering());
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);

        assert!(!controller.detach(1));
        assert!(controller.detach(2));
        assert!(!controller.is_rendering());
        assert_eq!(factory.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_factory_failure_rejects_client() {
        let factory = Arc::new(CountingFactory::default());
        factory.fail.store(true, Ordering::SeqCst);
        let controller = controller(&factory);

        let err = controller.attach(&sink(1)).unwrap_err();
        assert!(matches!(err, SessionError::Renderer(_)));
        assert!(!controller.is_rendering());
        assert_eq!(controller.registry().attached_count(), 0);
    }

    #[test]
    fn test_new_client_gets_current_frame() {
        let factory = Arc::new(CountingFactory::default());
        let controller = controller(&factory);
        let first = sink(1);
        controller.attach(&first).unwrap();

        let frame = StillImageFrame::new(Bytes::from_static(b"jpeg"), 1);
        assert_eq!(controller.publish(&frame), 1);

        let late = sink(2);
        controller.attach(&late).unwrap();
        let received = late.received.lock();
        assert_eq!(received.len(), 1);
        assert!(received[0].starts_with(b"--b\r\n"));
        assert_eq!(first.received.lock()[0], received[0]);
    }

    #[test]
    fn test_force_release_clears_current_frame() {
        let factory = Arc::new(CountingFactory::default());
        let controller = controller(&factory);
        controller.attach(&sink(1)).unwrap();
        controller.publish(&StillImageFrame::new(Bytes::from_static(b"old"), 1));

        assert!(controller.force_release());
        assert!(!controller.force_release());
        assert_eq!(factory.releases.load(Ordering::SeqCst), 1);

        let next = sink(2);
        controller.attach(&next).unwrap();
        assert!(next.received.lock().is_empty());
        controller.force_release();
    }

    /// First renderer is slow, every later one never produces an image
    struct SlowThenBrokenFactory {
        creates: AtomicUsize,
    }

    impl RendererFactory for SlowThenBrokenFactory {
        fn create(
            &self,
            _config: &StillImageConfig,
        ) -> Result<Box<dyn ImageRenderer>, RenderError> {
            if self.creates.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::new(|| -> Result<Bytes, RenderError> {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(Bytes::from_static(b"previous-loop"))
                }))
            } else {
                Ok(Box::new(|| -> Result<Bytes, RenderError> {
                    Err(RenderError::new("not ready"))
                }))
            }
        }
    }

    #[test]
    fn test_abandoned_loop_cannot_publish_into_next_loop() {
        let config = StillImageConfig::default().join_timeout(Duration::from_millis(50));
        let controller = RenderController::new(
            config,
            Arc::new(SlowThenBrokenFactory {
                creates: AtomicUsize::new(0),
            }),
            Arc::new(ServerCounters::new()),
            EventSender::new(),
        );
        let frames = controller.frames();

        controller.attach(&sink(1)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(controller.detach(1));

        controller.attach(&sink(2)).unwrap();
        std::thread::sleep(Duration::from_millis(450));

        assert!(frames.borrow().is_none());
        assert!(controller.current_part.lock().is_none());
        controller.force_release();
    }
}

//! Transport stream and still-image servers fed by synthetic encoders
//!
//! Run with: cargo run --example synthetic_server [PORT]
//!
//! The video encoder emits a fake H.264 stream (parameter sets plus an IDR every
//! second) and the audio encoder emits silent AAC frames, so the output is a
//! well-formed transport stream even without a camera:
//!
//!   nc localhost 9000 > capture.ts
//!   ffplay capture.ts
//!
//! The still-image server prints its URL on startup; open it in a browser to see
//! the multipart stream (the images are placeholders, not decodable pictures).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tscast::error::{EncoderError, RenderError, SessionError};
use tscast::media::{AacProfile, AudioFormat, AudioSpecificConfig, EncodedFrame, VideoFormat};
use tscast::server::{ClientInfo, ServerEvent};
use tscast::still::{ImageRenderer, RendererFactory, StillImageHandler};
use tscast::{
    EncoderOutput, MediaEncoder, ServerConfig, ServerHandler, Session, StillImageConfig,
    StillImageServer, TsServer,
};

const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5];
const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xCE, 0x3C, 0x80];

/// Runs a frame generator on its own thread until stopped
struct Generator {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Generator {
    fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn spawn<F>(&mut self, name: &str, interval: Duration, mut tick: F) -> Result<(), EncoderError>
    where
        F: FnMut(u64) + Send + 'static,
    {
        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                let mut n = 0;
                while !stop.load(Ordering::SeqCst) {
                    tick(n);
                    n += 1;
                    thread::sleep(interval);
                }
            })
            .map_err(|e| EncoderError::new(e.to_string()))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct SyntheticVideo(Generator);

impl MediaEncoder for SyntheticVideo {
    fn start(&mut self, output: EncoderOutput) -> Result<(), EncoderError> {
        let mut parameter_sets = SPS.to_vec();
        parameter_sets.extend_from_slice(PPS);
        output.describe_format(VideoFormat::h264(640, 480).with_parameter_sets(parameter_sets));

        let started = Instant::now();
        self.0.spawn("synthetic-video", Duration::from_millis(33), move |n| {
            let pts = started.elapsed().as_micros() as u64;
            let frame = if n % 30 == 0 {
                EncodedFrame::keyframe(vec![0, 0, 0, 1, 0x65, 0x88, 0x84, (n & 0xFF) as u8], pts)
            } else {
                EncodedFrame::new(vec![0, 0, 0, 1, 0x41, 0x9A, (n & 0xFF) as u8], pts)
            };
            output.push_frame(frame);
        })
    }

    fn stop(&mut self) {
        self.0.stop();
    }
}

struct SyntheticAudio(Generator);

impl MediaEncoder for SyntheticAudio {
    fn start(&mut self, output: EncoderOutput) -> Result<(), EncoderError> {
        let config = AudioSpecificConfig::new(AacProfile::Lc, 44_100, 2)
            .map_err(|e| EncoderError::new(e.to_string()))?;
        let frame_duration = config.frame_duration_us();
        output.describe_format(AudioFormat::aac(config));

        self.0.spawn("synthetic-audio", Duration::from_micros(frame_duration), move |n| {
            // Smallest valid raw AAC frame: silent channel pair element
            let silence = vec![0x21, 0x00, 0x49, 0x90, 0x02, 0x19, 0x00, 0x23, 0x80];
            output.push_frame(EncodedFrame::new(silence, n * frame_duration));
        })
    }

    fn stop(&mut self) {
        self.0.stop();
    }
}

/// Attaches both synthetic encoders and logs client activity
struct DemoHandler;

impl ServerHandler for DemoHandler {
    fn on_accept(&self, client: &ClientInfo) -> bool {
        println!("[ts] client {} connected from {}", client.id, client.peer);
        true
    }

    fn on_closed(&self, client: &ClientInfo) {
        println!("[ts] client {} disconnected", client.id);
    }

    fn on_session_create(&self, session: &mut Session) -> Result<(), SessionError> {
        println!("[ts] session {} starting encoders", session.id());
        session.attach_encoders(
            Some(Box::new(SyntheticVideo(Generator::new()))),
            Some(Box::new(SyntheticAudio(Generator::new()))),
        )
    }

    fn on_session_release(&self, session: &mut Session) {
        let stats = session.muxer_stats();
        println!(
            "[ts] session {} released: video={} audio={} bytes={}",
            session.id(),
            stats.video_frames,
            stats.audio_frames,
            stats.bytes_out
        );
    }
}

impl StillImageHandler for DemoHandler {
    fn on_accept(&self, client: &ClientInfo) -> bool {
        println!("[still] viewer {} connected from {}", client.id, client.peer);
        true
    }
}

/// Produces placeholder JPEG-framed images carrying a counter
struct CounterRenderer {
    frames: Arc<AtomicU64>,
}

impl ImageRenderer for CounterRenderer {
    fn render(&mut self) -> Result<Bytes, RenderError> {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        let mut image = vec![0xFF, 0xD8];
        image.extend_from_slice(&n.to_be_bytes());
        image.extend_from_slice(&[0xFF, 0xD9]);
        Ok(Bytes::from(image))
    }
}

struct CounterFactory {
    frames: Arc<AtomicU64>,
}

impl RendererFactory for CounterFactory {
    fn create(&self, config: &StillImageConfig) -> Result<Box<dyn ImageRenderer>, RenderError> {
        println!(
            "[still] renderer created ({}x{} @ {} fps)",
            config.width, config.height, config.frame_rate
        );
        Ok(Box::new(CounterRenderer {
            frames: Arc::clone(&self.frames),
        }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => tscast::server::config::DEFAULT_PORT,
    };

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tscast=debug".parse()?)
                .add_directive("synthetic_server=debug".parse()?),
        )
        .init();

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
    let ts = TsServer::new(ServerConfig::with_addr(bind_addr).max_clients(4), DemoHandler);
    let still = StillImageServer::new(
        StillImageConfig::default().path("preview").frame_rate(5),
        CounterFactory {
            frames: Arc::new(AtomicU64::new(0)),
        },
        DemoHandler,
    );

    let ts_addr = ts.start().await?;
    still.start().await?;

    println!("Transport stream: tcp://{}", ts_addr);
    if let Some(url) = still.url() {
        println!("Still images:     {}", url);
    }
    println!();

    let mut events = ts.events();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
            event = events.recv() => match event {
                Ok(ServerEvent::ClientRejected { peer, reason }) => {
                    println!("[ts] rejected {}: {:?}", peer, reason);
                }
                Ok(ServerEvent::Stats(stats)) => {
                    println!(
                        "[ts] stats: clients={} accepted={} bytes={}",
                        stats.active_clients, stats.total_accepted, stats.total_bytes_sent
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    ts.stop().await;
    still.stop().await;
    Ok(())
}

mod interpret;
mod overlay;
mod throttle;

use facecam_common::config::Config;
use facecam_common::encoder::FrameEncoder;
use facecam_common::mjpeg::spawn_camera_feed;
use facecam_common::service::HttpFaceService;
use facecam_common::source::{wait_until_ready, FrameSource, LiveFrameSource, Readiness};
use facecam_common::status::{StatusSink, TracingStatus};
use overlay::{DrawList, OverlayRenderer, OverlaySurface, RasterSurface};
use std::path::PathBuf;
use std::sync::Arc;
use throttle::{RecognitionLoop, Schedule};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        service = %config.service.base_url,
        camera = %config.camera.url,
        mode = %config.camera.mode,
        interval_ms = config.recognition.interval_ms,
        "starting facecam recognizer"
    );

    let service = match HttpFaceService::new(&config.service) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to build face service client");
            std::process::exit(1);
        }
    };
    let encoder = match FrameEncoder::new(config.recognition.jpeg_quality) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "invalid recognition encoder settings");
            std::process::exit(1);
        }
    };

    let source = Arc::new(LiveFrameSource::new());
    let feed = match spawn_camera_feed(&config.camera, Arc::clone(&source)) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "failed to start camera feed");
            std::process::exit(1);
        }
    };

    let status: Arc<dyn StatusSink> = Arc::new(TracingStatus);
    let renderer = OverlayRenderer::new(overlay_surface(config.recognition.overlay_snapshot.as_deref()));
    let mut recognition = RecognitionLoop::new(
        Arc::clone(&source) as Arc<dyn FrameSource>,
        encoder,
        service,
        renderer,
        Arc::clone(&status),
        Schedule::Every(config.recognition.interval()),
    );

    let mut readiness = source.subscribe();
    tokio::select! {
        ready = wait_until_ready(&mut readiness) => match ready {
            Ok((width, height)) => {
                recognition.resize_overlay(width, height);
                status.info("Camera ready. Type 'start' to begin recognition.");
            }
            Err(e) => {
                status.error(&format!("Camera access failed: {e}"));
                std::process::exit(1);
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted before camera became ready");
            feed.abort();
            source.end();
            return;
        }
    }

    if config.recognition.auto_start {
        recognition.start();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "start" => recognition.start(),
                    "stop" => {
                        recognition.stop();
                    }
                    "" | "toggle" => {
                        recognition.toggle();
                    }
                    "quit" | "exit" => break,
                    other => warn!(command = other, "unknown command; use start, stop, toggle or quit"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed, commands disabled");
                    stdin_open = false;
                }
            },
            changed = readiness.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *readiness.borrow_and_update();
                match state {
                    Readiness::Ready { width, height } => recognition.resize_overlay(width, height),
                    Readiness::NotStarted | Readiness::Paused => status.info("Camera not ready."),
                    Readiness::Ended => status.error("Camera feed ended."),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    recognition.stop();
    feed.abort();
    source.end();
    info!("facecam recognizer stopped");
}

/// A `.json` snapshot path selects the draw-list surface; anything else is
/// written as a transparent PNG.
fn overlay_surface(snapshot: Option<&str>) -> Box<dyn OverlaySurface> {
    match snapshot.map(PathBuf::from) {
        Some(path) if path.extension().is_some_and(|ext| ext == "json") => {
            Box::new(DrawList::new(0, 0).with_snapshot(path))
        }
        path => Box::new(RasterSurface::new(0, 0, path)),
    }
}

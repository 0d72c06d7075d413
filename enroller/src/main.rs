mod commands;
mod session;

use facecam_common::config::Config;
use facecam_common::encoder::FrameEncoder;
use facecam_common::mjpeg::spawn_camera_feed;
use facecam_common::service::HttpFaceService;
use facecam_common::source::{wait_until_ready, FrameSource, LiveFrameSource, Readiness};
use facecam_common::status::{StatusSink, TracingStatus};
use commands::{dispatch, Command, Outcome};
use session::CaptureController;
use std::path::PathBuf;
use std::sync::Arc;
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
        quota = config.enrollment.quota,
        "starting facecam enroller"
    );

    let service = match HttpFaceService::new(&config.service) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to build face service client");
            std::process::exit(1);
        }
    };
    let encoder = match FrameEncoder::new(config.enrollment.jpeg_quality) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "invalid enrollment encoder settings");
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
    let controller = Arc::new(CaptureController::new(
        Arc::clone(&source) as Arc<dyn FrameSource>,
        encoder,
        service,
        Arc::clone(&status),
        config.enrollment.quota,
    ));

    let mut readiness = source.subscribe();
    tokio::select! {
        ready = wait_until_ready(&mut readiness) => match ready {
            Ok((width, height)) => {
                info!(width, height, "camera ready");
                status.info(&format!("Camera ready. {}", controller.controls().instruction));
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

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Outcome::Quit = dispatch(&controller, status.as_ref(), Command::parse(&line)) {
                        break;
                    }
                }
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
                    Readiness::Ready { .. } => {}
                    Readiness::NotStarted | Readiness::Paused => status.info("Camera not ready."),
                    Readiness::Ended => status.error("Camera feed ended."),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let abandoned = controller.captured();
    if abandoned > 0 {
        info!(images = abandoned, "discarding unsubmitted captures");
        controller.clear();
    }
    feed.abort();
    source.end();
    info!("facecam enroller stopped");
}

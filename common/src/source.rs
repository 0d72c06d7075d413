use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use image::RgbImage;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::frame::FrameBuffer;

/// Readiness of a live video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// No frame decoded yet (not started, or reconnecting).
    NotStarted,
    /// Frames are flowing; dimensions are known.
    Ready { width: u32, height: u32 },
    Paused,
    Ended,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready { .. })
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match *self {
            Readiness::Ready { width, height } => Some((width, height)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("camera is not ready")]
    Unavailable,
    #[error("camera feed was dropped")]
    Closed,
}

/// On-demand access to the current frame of a live stream.
pub trait FrameSource: Send + Sync {
    /// Snapshot of the most recent frame. Read-only.
    fn current_frame(&self) -> Result<FrameBuffer, FrameError>;

    /// Readiness transitions, starting from the current state.
    fn subscribe(&self) -> watch::Receiver<Readiness>;

    fn is_ready(&self) -> bool {
        self.subscribe().borrow().is_ready()
    }
}

/// Wait until the stream reports `Ready` and return its dimensions. Fails
/// with `Closed` if the stream ends first.
pub async fn wait_until_ready(
    readiness: &mut watch::Receiver<Readiness>,
) -> Result<(u32, u32), FrameError> {
    let state = readiness
        .wait_for(|state| state.is_ready() || *state == Readiness::Ended)
        .await
        .map_err(|_| FrameError::Closed)?;
    state.dimensions().ok_or(FrameError::Closed)
}

/// Latest-frame slot fed by a camera reader.
///
/// The reader calls [`publish`](Self::publish) for every decoded frame and
/// the lifecycle methods on stream events; consumers only ever see the most
/// recent frame.
pub struct LiveFrameSource {
    latest: RwLock<Option<FrameBuffer>>,
    readiness: watch::Sender<Readiness>,
    seq: AtomicU64,
}

impl Default for LiveFrameSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveFrameSource {
    pub fn new() -> Self {
        let (readiness, _) = watch::channel(Readiness::NotStarted);
        Self {
            latest: RwLock::new(None),
            readiness,
            seq: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, pixels: RgbImage) -> FrameBuffer {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame = FrameBuffer::new(pixels, Utc::now().timestamp_millis(), seq);
        let (width, height) = (frame.width(), frame.height());
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(frame.clone());

        self.readiness.send_if_modified(|state| match *state {
            Readiness::Ready { width: w, height: h } if w == width && h == height => false,
            Readiness::Paused | Readiness::Ended => false,
            _ => {
                info!(width, height, "camera ready");
                *state = Readiness::Ready { width, height };
                true
            }
        });
        frame
    }

    pub fn pause(&self) {
        self.readiness.send_if_modified(|state| {
            if state.is_ready() {
                debug!("camera paused");
                *state = Readiness::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        let dims = self
            .latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| (f.width(), f.height()));
        self.readiness.send_if_modified(|state| {
            if *state != Readiness::Paused {
                return false;
            }
            *state = match dims {
                Some((width, height)) => Readiness::Ready { width, height },
                None => Readiness::NotStarted,
            };
            true
        });
    }

    /// Stream dropped; waiting for the reader to reconnect.
    pub fn reset(&self) {
        self.latest.write().unwrap_or_else(|e| e.into_inner()).take();
        self.readiness.send_if_modified(|state| {
            let changed = *state != Readiness::NotStarted;
            *state = Readiness::NotStarted;
            changed
        });
    }

    pub fn end(&self) {
        self.latest.write().unwrap_or_else(|e| e.into_inner()).take();
        self.readiness.send_replace(Readiness::Ended);
        info!("camera feed ended");
    }
}

impl FrameSource for LiveFrameSource {
    fn current_frame(&self) -> Result<FrameBuffer, FrameError> {
        if !self.readiness.borrow().is_ready() {
            return Err(FrameError::Unavailable);
        }
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(FrameError::Unavailable)
    }

    fn subscribe(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }
}

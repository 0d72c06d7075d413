use facecam_common::encoder::FrameEncoder;
use facecam_common::frame::EncodedImage;
use facecam_common::service::{FaceService, ServiceError};
use facecam_common::source::{FrameError, FrameSource};
use facecam_common::status::StatusSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("camera not ready")]
    NotReady,
    #[error("already captured {quota} images")]
    QuotaReached { quota: usize },
    #[error("{0}")]
    InvalidInput(String),
    #[error("failed to encode frame: {0}")]
    EncodeFailed(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Images held client-side until a full batch is submitted.
#[derive(Debug)]
pub struct CaptureSession {
    username: String,
    held: Vec<EncodedImage>,
    quota: usize,
}

impl CaptureSession {
    pub fn new(quota: usize) -> Self {
        Self {
            username: String::new(),
            held: Vec::with_capacity(quota),
            quota,
        }
    }

    /// Append one image; returns the new count. Rejected once the quota is met.
    pub fn add(&mut self, image: EncodedImage) -> Result<usize, CaptureError> {
        if self.is_full() {
            return Err(CaptureError::QuotaReached { quota: self.quota });
        }
        self.held.push(image);
        Ok(self.held.len())
    }

    pub fn clear(&mut self) {
        self.held.clear();
        self.username.clear();
    }

    /// Drop the first `count` images once they have been accepted.
    pub fn release_submitted(&mut self, count: usize) {
        self.held.drain(..count.min(self.held.len()));
        self.username.clear();
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn remaining(&self) -> usize {
        self.quota - self.held.len()
    }

    pub fn is_full(&self) -> bool {
        self.held.len() >= self.quota
    }

    pub fn images(&self) -> &[EncodedImage] {
        &self.held
    }
}

/// What the enrollment controls should look like right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Controls {
    /// Last submitted username, kept after a failed submission for retry.
    pub username: String,
    pub captured: usize,
    pub remaining: usize,
    pub capture_enabled: bool,
    pub submit_enabled: bool,
    pub submitting: bool,
    pub instruction: String,
}

/// Outcome of a successful batch submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub name: String,
    pub encodings: Option<usize>,
    pub message: Option<String>,
}

/// Drives the bounded capture workflow: grab stills up to the quota, then
/// upload them as one enrollment batch.
pub struct CaptureController {
    source: Arc<dyn FrameSource>,
    encoder: FrameEncoder,
    service: Arc<dyn FaceService>,
    status: Arc<dyn StatusSink>,
    session: Mutex<CaptureSession>,
    submitting: AtomicBool,
}

impl CaptureController {
    pub fn new(
        source: Arc<dyn FrameSource>,
        encoder: FrameEncoder,
        service: Arc<dyn FaceService>,
        status: Arc<dyn StatusSink>,
        quota: usize,
    ) -> Self {
        Self {
            source,
            encoder,
            service,
            status,
            session: Mutex::new(CaptureSession::new(quota)),
            submitting: AtomicBool::new(false),
        }
    }

    fn session(&self) -> MutexGuard<'_, CaptureSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn captured(&self) -> usize {
        self.session().len()
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    /// Grab the current frame and hold it. Returns the new held count.
    pub async fn capture(&self) -> Result<usize, CaptureError> {
        let frame = match self.source.current_frame() {
            Ok(frame) => frame,
            Err(FrameError::Unavailable | FrameError::Closed) => {
                self.status.error("Camera not ready.");
                return Err(CaptureError::NotReady);
            }
        };

        if self.is_submitting() {
            self.status.info("Submission in progress.");
            return Err(CaptureError::InvalidInput("a submission is in progress".into()));
        }

        let (index, quota) = {
            let session = self.session();
            if session.is_full() {
                let quota = session.quota();
                drop(session);
                self.status.info(&format!("Already captured {quota} images."));
                return Err(CaptureError::QuotaReached { quota });
            }
            (session.len() + 1, session.quota())
        };

        let image = match self
            .encoder
            .encode_async(frame, format!("capture_{index}.jpg"))
            .await
        {
            Ok(image) => image,
            Err(e) => {
                warn!(error = %e, "capture encode failed");
                self.status.error(&format!("Failed to capture image: {e}"));
                return Err(CaptureError::EncodeFailed(e.to_string()));
            }
        };

        let count = self.session().add(image);
        match count {
            Ok(count) => {
                debug!(count, quota, "frame captured");
                self.status.info(&format!("Captured {count}/{quota}"));
                Ok(count)
            }
            Err(e) => {
                self.status.info(&format!("Already captured {quota} images."));
                Err(e)
            }
        }
    }

    /// Upload every held image for `username` in one batch. The session is
    /// cleared only when the service accepts it.
    pub async fn submit(&self, username: &str) -> Result<Enrollment, CaptureError> {
        let username = username.trim();
        if username.is_empty() {
            self.status.error("Please enter a username.");
            return Err(CaptureError::InvalidInput("username is empty".into()));
        }

        if self.submitting.swap(true, Ordering::SeqCst) {
            self.status.info("Submission in progress.");
            return Err(CaptureError::InvalidInput("a submission is already in progress".into()));
        }

        let images = {
            let mut session = self.session();
            if session.is_empty() {
                drop(session);
                self.submitting.store(false, Ordering::SeqCst);
                self.status.error("Please capture images first.");
                return Err(CaptureError::InvalidInput("no images captured".into()));
            }
            session.username = username.to_string();
            session
                .images()
                .iter()
                .enumerate()
                .map(|(i, image)| image.with_filename(format!("{username}_capture_{}.jpg", i + 1)))
                .collect::<Vec<_>>()
        };

        let count = images.len();
        self.status
            .info(&format!("Sending {count} images for user '{username}'..."));
        let outcome = self.service.enroll(username, images).await;
        self.submitting.store(false, Ordering::SeqCst);

        match outcome {
            Ok(response) => {
                self.session().release_submitted(count);
                let enrollment = Enrollment {
                    encodings: response.encoding_count(),
                    name: response.name,
                    message: response.message,
                };
                info!(
                    username,
                    images = count,
                    encodings = ?enrollment.encodings,
                    "enrollment accepted"
                );
                self.status.success(&success_message(&enrollment));
                Ok(enrollment)
            }
            Err(e) => {
                warn!(username, error = %e, "enrollment failed, keeping captured images");
                self.status.error(&format!("Registration error: {e}"));
                Err(e.into())
            }
        }
    }

    /// Drop held images without submitting.
    pub fn clear(&self) {
        self.session().clear();
        self.status.info("Captured images discarded.");
    }

    pub fn controls(&self) -> Controls {
        let session = self.session();
        let submitting = self.is_submitting();
        let remaining = session.remaining();
        let instruction = if submitting {
            "Submitting...".to_string()
        } else if remaining > 0 {
            format!("Capture {remaining} more image(s).")
        } else {
            "All images captured. Enter a username and submit.".to_string()
        };
        Controls {
            username: session.username.clone(),
            captured: session.len(),
            remaining,
            capture_enabled: !session.is_full() && !submitting,
            submit_enabled: session.is_full() && !submitting,
            submitting,
            instruction,
        }
    }
}

fn success_message(enrollment: &Enrollment) -> String {
    let mut message = format!("Registered: {}.", enrollment.name);
    if let Some(count) = enrollment.encodings {
        message.push_str(&format!(" Stored encodings: {count}."));
    }
    if let Some(extra) = &enrollment.message {
        message.push(' ');
        message.push_str(extra);
    }
    message
}

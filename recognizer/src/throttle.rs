use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use facecam_common::encoder::FrameEncoder;
use facecam_common::frame::FrameBuffer;
use facecam_common::service::FaceService;
use facecam_common::source::FrameSource;
use facecam_common::status::StatusSink;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::interpret::{interpret, Interpretation};
use crate::overlay::OverlayRenderer;

const FRAME_FILENAME: &str = "recognition_frame.jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Running,
}

/// How cycles are triggered while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// A periodic timer; the first tick fires immediately on start.
    Every(Duration),
    /// Only explicit [`RecognitionLoop::trigger`] calls.
    Manual,
}

#[derive(Debug)]
struct LoopState {
    phase: Phase,
    request_in_flight: bool,
    /// Bumped by every stop; responses tagged with an older value are dropped.
    generation: u64,
}

struct Shared {
    state: Mutex<LoopState>,
    source: Arc<dyn FrameSource>,
    encoder: FrameEncoder,
    service: Arc<dyn FaceService>,
    renderer: Mutex<OverlayRenderer>,
    status: Arc<dyn StatusSink>,
}

/// Continuous capture → submit → render, with at most one request in flight.
///
/// Lock order is `state` then `renderer`; neither is held across an await.
pub struct RecognitionLoop {
    shared: Arc<Shared>,
    schedule: Schedule,
    ticker: Option<JoinHandle<()>>,
}

impl RecognitionLoop {
    pub fn new(
        source: Arc<dyn FrameSource>,
        encoder: FrameEncoder,
        service: Arc<dyn FaceService>,
        renderer: OverlayRenderer,
        status: Arc<dyn StatusSink>,
        schedule: Schedule,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopState {
                    phase: Phase::Stopped,
                    request_in_flight: false,
                    generation: 0,
                }),
                source,
                encoder,
                service,
                renderer: Mutex::new(renderer),
                status,
            }),
            schedule,
            ticker: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock_state().phase
    }

    pub fn is_request_in_flight(&self) -> bool {
        self.shared.lock_state().request_in_flight
    }

    #[allow(dead_code)]
    pub fn has_timer(&self) -> bool {
        self.ticker.is_some()
    }

    /// Match the overlay to new video dimensions.
    pub fn resize_overlay(&self, width: u32, height: u32) {
        self.shared.lock_renderer().resize(width, height);
    }

    /// Start cycling. Starting a running loop does nothing.
    pub fn start(&mut self) {
        {
            let mut state = self.shared.lock_state();
            if state.phase == Phase::Running {
                return;
            }
            state.phase = Phase::Running;
        }

        if let Schedule::Every(period) = self.schedule {
            let shared = Arc::clone(&self.shared);
            self.ticker = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    Shared::try_cycle(&shared);
                }
            }));
        }

        info!(schedule = ?self.schedule, "recognition started");
        self.shared.status.info("Recognizing...");
    }

    /// Cancel the trigger, forget any in-flight request and clear the
    /// overlay. Returns `false` (and changes nothing) if already stopped.
    ///
    /// A request already on the wire still completes, but its response is
    /// discarded when it arrives.
    pub fn stop(&mut self) -> bool {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }

        let mut state = self.shared.lock_state();
        if state.phase == Phase::Stopped {
            return false;
        }
        state.phase = Phase::Stopped;
        state.request_in_flight = false;
        state.generation += 1;
        self.shared.lock_renderer().render(None);
        drop(state);

        info!("recognition stopped");
        self.shared
            .status
            .info("Recognition stopped. Start again to continue.");
        true
    }

    pub fn toggle(&mut self) -> Phase {
        match self.phase() {
            Phase::Running => {
                self.stop();
            }
            Phase::Stopped => self.start(),
        }
        self.phase()
    }

    /// Attempt one cycle now. Returns the handle of the spawned cycle, or
    /// `None` when the attempt was a no-op (stopped, busy, or no frame).
    pub fn trigger(&self) -> Option<JoinHandle<()>> {
        Shared::try_cycle(&self.shared)
    }
}

impl Drop for RecognitionLoop {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_renderer(&self) -> MutexGuard<'_, OverlayRenderer> {
        self.renderer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_cycle(shared: &Arc<Shared>) -> Option<JoinHandle<()>> {
        let (frame, generation) = {
            let mut state = shared.lock_state();
            if state.phase != Phase::Running || state.request_in_flight {
                return None;
            }
            let frame = shared.source.current_frame().ok()?;
            state.request_in_flight = true;
            (frame, state.generation)
        };

        let shared = Arc::clone(shared);
        Some(tokio::spawn(async move {
            shared.run_cycle(frame, generation).await;
        }))
    }

    async fn run_cycle(self: Arc<Self>, frame: FrameBuffer, generation: u64) {
        let seq = frame.seq;
        let image = match self.encoder.encode_async(frame, FRAME_FILENAME.into()).await {
            Ok(image) => image,
            Err(e) => {
                debug!(error = %e, seq, "frame encode failed, skipping cycle");
                self.finish(generation);
                return;
            }
        };

        let outcome = self.service.recognize(image).await;

        let mut state = self.lock_state();
        if state.generation != generation {
            debug!(seq, generation, "dropping response from a stopped cycle");
            return;
        }

        match outcome {
            Ok(response) => {
                let Interpretation { result, status } = interpret(response);
                debug!(seq, faces = result.faces.len(), message = ?result.message, "recognition result");
                self.lock_renderer().render(Some(&result));
                if let Some(status) = status {
                    self.status.info(&status);
                }
            }
            Err(e) => {
                warn!(error = %e, seq, "recognition request failed");
                self.lock_renderer().render(None);
                let message = if e.is_transport() {
                    e.to_string()
                } else {
                    format!("Recognition error: {e}")
                };
                self.status.error(&message);
            }
        }
        state.request_in_flight = false;
    }

    fn finish(&self, generation: u64) {
        let mut state = self.lock_state();
        if state.generation == generation {
            state.request_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::{DrawList, DrawOp, OverlaySurface, AFFIRMATIVE};
    use async_trait::async_trait;
    use facecam_common::frame::EncodedImage;
    use facecam_common::service::{EnrollResponse, FaceRecord, RecognitionResponse, ServiceError};
    use facecam_common::source::LiveFrameSource;
    use facecam_common::status::{MessageKind, MessageLog};
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    enum Reply {
        Faces(RecognitionResponse),
        Status(u16, Option<String>),
    }

    struct MockService {
        calls: AtomicUsize,
        reply: Reply,
        /// Call `i` waits on `gates[i]` when present.
        gates: Vec<Arc<Notify>>,
    }

    impl MockService {
        fn new(reply: Reply) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply,
                gates: Vec::new(),
            }
        }

        fn gated(reply: Reply, gates: &[&Arc<Notify>]) -> Self {
            Self {
                gates: gates.iter().map(|g| Arc::clone(g)).collect(),
                ..Self::new(reply)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FaceService for MockService {
        async fn recognize(&self, image: EncodedImage) -> Result<RecognitionResponse, ServiceError> {
            assert_eq!(image.filename(), FRAME_FILENAME);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = self.gates.get(call) {
                gate.notified().await;
            }
            match &self.reply {
                Reply::Faces(response) => Ok(response.clone()),
                Reply::Status(status, detail) => Err(ServiceError::Status {
                    status: *status,
                    detail: detail.clone(),
                }),
            }
        }

        async fn enroll(
            &self,
            _username: &str,
            _images: Vec<EncodedImage>,
        ) -> Result<EnrollResponse, ServiceError> {
            unreachable!("recognition loop never enrolls")
        }
    }

    fn alice() -> Reply {
        Reply::Faces(RecognitionResponse {
            recognized_faces: vec![FaceRecord {
                bbox: Some([10, 110, 60, 10]),
                name: "Alice".into(),
                distance: Some(0.32),
            }],
            message: Some("1 face".into()),
        })
    }

    struct Harness {
        recognition: RecognitionLoop,
        source: Arc<LiveFrameSource>,
        service: Arc<MockService>,
        surface: Arc<Mutex<DrawList>>,
        log: Arc<MessageLog>,
    }

    fn harness(service: MockService, schedule: Schedule) -> Harness {
        let source = Arc::new(LiveFrameSource::new());
        source.publish(RgbImage::new(64, 48));
        let service = Arc::new(service);
        let surface = Arc::new(Mutex::new(DrawList::new(64, 48)));
        let log = Arc::new(MessageLog::new());
        let recognition = RecognitionLoop::new(
            Arc::clone(&source) as Arc<dyn FrameSource>,
            FrameEncoder::new(0.85).unwrap(),
            Arc::clone(&service) as Arc<dyn FaceService>,
            OverlayRenderer::new(Box::new(Arc::clone(&surface))),
            Arc::clone(&log) as Arc<dyn StatusSink>,
            schedule,
        );
        Harness {
            recognition,
            source,
            service,
            surface,
            log,
        }
    }

    async fn wait_for_calls(service: &MockService, n: usize) {
        for _ in 0..200 {
            if service.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} calls, saw {}", service.calls());
    }

    #[tokio::test]
    async fn triggers_while_in_flight_make_no_calls() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(MockService::gated(alice(), &[&gate]), Schedule::Manual);
        h.recognition.start();

        let first = h.recognition.trigger().expect("first trigger runs a cycle");
        assert!(h.recognition.trigger().is_none());
        assert!(h.recognition.is_request_in_flight());

        wait_for_calls(&h.service, 1).await;
        assert!(h.recognition.trigger().is_none());

        gate.notify_one();
        first.await.unwrap();
        assert_eq!(h.service.calls(), 1);
        assert!(!h.recognition.is_request_in_flight());
    }

    #[tokio::test]
    async fn timer_does_not_pile_up_requests() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(
            MockService::gated(alice(), &[&gate]),
            Schedule::Every(Duration::from_millis(1)),
        );
        h.recognition.start();

        wait_for_calls(&h.service, 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.service.calls(), 1);

        gate.notify_one();
        wait_for_calls(&h.service, 2).await;
        h.recognition.stop();
    }

    #[tokio::test]
    async fn successful_cycle_renders_and_reports() {
        let mut h = harness(MockService::new(alice()), Schedule::Manual);
        h.recognition.start();
        h.recognition.trigger().unwrap().await.unwrap();

        let surface = h.surface.lock().unwrap();
        assert_eq!(surface.rects().count(), 1);
        assert!(matches!(
            surface.ops()[0],
            DrawOp::StrokeRect { x: 10, y: 10, width: 100, height: 50, color: AFFIRMATIVE, .. }
        ));
        assert_eq!(
            h.log.last(),
            Some((MessageKind::Info, "Detected: Alice (1 face)".into()))
        );
    }

    #[tokio::test]
    async fn service_error_clears_overlay_and_keeps_running() {
        let mut h = harness(
            MockService::new(Reply::Status(503, Some("model not loaded".into()))),
            Schedule::Manual,
        );
        h.recognition.start();
        h.surface.lock().unwrap().stroke_rect(0, 0, 5, 5, AFFIRMATIVE, 2);
        let clears_before = h.surface.lock().unwrap().clear_count();

        h.recognition.trigger().unwrap().await.unwrap();

        {
            let surface = h.surface.lock().unwrap();
            assert_eq!(surface.clear_count(), clears_before + 1);
            assert!(surface.ops().is_empty());
        }
        let (kind, message) = h.log.last().unwrap();
        assert_eq!(kind, MessageKind::Error);
        assert!(message.contains("model not loaded"));

        assert_eq!(h.recognition.phase(), Phase::Running);
        h.recognition.trigger().expect("loop retries").await.unwrap();
        assert_eq!(h.service.calls(), 2);
    }

    #[tokio::test]
    async fn unavailable_source_is_a_silent_no_op() {
        let mut h = harness(MockService::new(alice()), Schedule::Manual);
        h.recognition.start();
        h.source.pause();

        assert!(h.recognition.trigger().is_none());
        assert!(!h.recognition.is_request_in_flight());
        assert_eq!(h.service.calls(), 0);
    }

    #[tokio::test]
    async fn encode_failure_skips_cycle_silently() {
        let mut h = harness(MockService::new(alice()), Schedule::Manual);
        h.source.publish(RgbImage::new(0, 0));
        h.recognition.start();
        let messages_before = h.log.entries().len();

        h.recognition.trigger().unwrap().await.unwrap();
        assert_eq!(h.service.calls(), 0);
        assert!(!h.recognition.is_request_in_flight());
        assert_eq!(h.log.entries().len(), messages_before);
    }

    #[tokio::test]
    async fn stopped_loop_never_cycles() {
        let h = harness(MockService::new(alice()), Schedule::Manual);
        assert!(h.recognition.trigger().is_none());
        assert_eq!(h.service.calls(), 0);
    }

    #[tokio::test]
    async fn stop_on_stopped_loop_has_no_effect() {
        let mut h = harness(MockService::new(alice()), Schedule::Every(Duration::from_millis(1)));
        h.surface.lock().unwrap().stroke_rect(1, 1, 2, 2, AFFIRMATIVE, 2);

        assert!(!h.recognition.stop());
        assert!(!h.recognition.has_timer());
        let surface = h.surface.lock().unwrap();
        assert_eq!(surface.clear_count(), 0);
        assert_eq!(surface.ops().len(), 1);
        assert!(h.log.entries().is_empty());
    }

    #[tokio::test]
    async fn stop_clears_overlay_and_drops_late_response() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(MockService::gated(alice(), &[&gate]), Schedule::Manual);
        h.recognition.start();
        let pending = h.recognition.trigger().unwrap();
        wait_for_calls(&h.service, 1).await;

        assert!(h.recognition.stop());
        assert!(!h.recognition.is_request_in_flight());
        assert_eq!(h.surface.lock().unwrap().clear_count(), 1);

        gate.notify_one();
        pending.await.unwrap();

        let surface = h.surface.lock().unwrap();
        assert_eq!(surface.clear_count(), 1);
        assert_eq!(surface.rects().count(), 0);
        assert!(!h
            .log
            .entries()
            .iter()
            .any(|(_, message)| message.starts_with("Detected")));
    }

    #[tokio::test]
    async fn late_response_does_not_release_a_newer_cycle() {
        let stale_gate = Arc::new(Notify::new());
        let fresh_gate = Arc::new(Notify::new());
        let mut h = harness(
            MockService::gated(alice(), &[&stale_gate, &fresh_gate]),
            Schedule::Manual,
        );
        h.recognition.start();
        let stale = h.recognition.trigger().unwrap();
        wait_for_calls(&h.service, 1).await;

        h.recognition.stop();
        h.recognition.start();
        let fresh = h.recognition.trigger().unwrap();
        wait_for_calls(&h.service, 2).await;

        stale_gate.notify_one();
        stale.await.unwrap();
        assert!(h.recognition.is_request_in_flight());
        assert!(h.recognition.trigger().is_none());

        fresh_gate.notify_one();
        fresh.await.unwrap();
        assert!(!h.recognition.is_request_in_flight());
        assert_eq!(h.surface.lock().unwrap().rects().count(), 1);
        assert_eq!(h.service.calls(), 2);
    }

    #[tokio::test]
    async fn toggle_flips_phase() {
        let mut h = harness(MockService::new(alice()), Schedule::Manual);
        assert_eq!(h.recognition.toggle(), Phase::Running);
        assert_eq!(h.recognition.toggle(), Phase::Stopped);
    }
}

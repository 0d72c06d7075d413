use bytes::BytesMut;
use futures_util::StreamExt;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CameraConfig;
use crate::source::LiveFrameSource;

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("unknown camera mode '{0}', expected 'mjpeg' or 'polling'")]
    UnknownMode(String),
}

/// Start the camera reader selected by `config.mode`, feeding `source`.
pub fn spawn_camera_feed(
    config: &CameraConfig,
    source: Arc<LiveFrameSource>,
) -> Result<JoinHandle<()>, SourceError> {
    match config.mode.as_str() {
        "mjpeg" => {
            let url = config.url.clone();
            Ok(tokio::spawn(async move {
                run_mjpeg_source(&url, &source).await;
            }))
        }
        "polling" => {
            let url = config.url.clone();
            let interval = Duration::from_secs_f64(1.0 / config.fps);
            Ok(tokio::spawn(async move {
                run_polling_source(&url, &source, interval).await;
            }))
        }
        other => Err(SourceError::UnknownMode(other.to_string())),
    }
}

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for a `multipart/x-mixed-replace` MJPEG body.
pub struct MjpegParser {
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MjpegParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    /// Feed one network chunk; returns every JPEG completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep a tail in case the boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        break;
                    }
                }
                ParseState::CollectingJpeg => {
                    if let Some(pos) = find_subsequence(&self.buffer[self.jpeg_start..], BOUNDARY) {
                        let jpeg_end = self.jpeg_start + pos;
                        // Strip trailing \r\n before boundary
                        let end = if jpeg_end >= 2
                            && self.buffer[jpeg_end - 2] == b'\r'
                            && self.buffer[jpeg_end - 1] == b'\n'
                        {
                            jpeg_end - 2
                        } else {
                            jpeg_end
                        };

                        let jpeg = self.buffer[..end].to_vec();
                        let _ = self.buffer.split_to(jpeg_end + BOUNDARY.len());
                        if !jpeg.is_empty() {
                            frames.push(jpeg);
                        }
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        self.jpeg_start = self.buffer.len().saturating_sub(BOUNDARY.len());
                        break;
                    }
                }
            }
        }

        frames
    }
}

/// Follow an MJPEG stream forever, reconnecting with exponential backoff.
pub async fn run_mjpeg_source(stream_url: &str, source: &LiveFrameSource) {
    let mut backoff = Duration::from_secs(2);
    let max_backoff = Duration::from_secs(30);

    loop {
        info!(url = stream_url, "connecting to MJPEG stream");
        match consume_stream(stream_url, source).await {
            Ok(()) => {
                info!("stream ended cleanly, reconnecting");
                backoff = Duration::from_secs(2);
            }
            Err(e) => {
                error!(error = %e, "stream error, reconnecting in {:?}", backoff);
            }
        }
        source.reset();
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max_backoff);
    }
}

async fn consume_stream(url: &str, source: &LiveFrameSource) -> Result<(), SourceError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(SourceError::HttpConnect)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    info!(status = %response.status(), "connected to MJPEG stream");

    let mut byte_stream = response.bytes_stream();
    let mut parser = MjpegParser::new();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(SourceError::HttpStream)?;
        for jpeg in parser.push(&chunk) {
            publish_jpeg(source, &jpeg);
        }
    }

    Ok(())
}

/// Polling fallback: periodically fetch single frames.
pub async fn run_polling_source(frame_url: &str, source: &LiveFrameSource, interval: Duration) {
    let client = reqwest::Client::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match client.get(frame_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(jpeg) => publish_jpeg(source, &jpeg),
                Err(e) => {
                    warn!(error = %e, "failed to read camera frame body");
                    source.reset();
                }
            },
            Ok(resp) => {
                warn!(status = %resp.status(), "non-success response from camera");
                source.reset();
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch camera frame");
                source.reset();
            }
        }
    }
}

fn publish_jpeg(source: &LiveFrameSource, jpeg: &[u8]) {
    match decode_jpeg(jpeg) {
        Some(pixels) => {
            let frame = source.publish(pixels);
            debug!(seq = frame.seq, bytes = jpeg.len(), "camera frame");
        }
        None => warn!(bytes = jpeg.len(), "failed to decode camera frame, skipping"),
    }
}

fn decode_jpeg(jpeg: &[u8]) -> Option<RgbImage> {
    image::load_from_memory(jpeg).ok().map(|img| img.to_rgb8())
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BOUNDARY);
        out.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        out.extend_from_slice(body);
        out.extend_from_slice(b"\r\n");
        out
    }

    #[test]
    fn splits_frames_on_boundaries() {
        let mut stream = part(b"first");
        stream.extend(part(b"second"));
        stream.extend_from_slice(BOUNDARY);

        let mut parser = MjpegParser::new();
        let frames = parser.push(&stream);
        assert_eq!(frames, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn boundary_split_across_chunks() {
        let mut stream = part(b"payload");
        stream.extend_from_slice(BOUNDARY);

        let mut parser = MjpegParser::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(parser.push(chunk));
        }
        assert_eq!(frames, vec![b"payload".to_vec()]);
    }

    #[test]
    fn incomplete_frame_is_held_back() {
        let mut parser = MjpegParser::new();
        assert!(parser.push(&part(b"partial")).is_empty());
    }

    #[test]
    fn undecodable_jpeg_does_not_publish() {
        let source = LiveFrameSource::new();
        publish_jpeg(&source, b"not a jpeg");
        assert!(!crate::source::FrameSource::is_ready(&source));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let config = CameraConfig {
            url: "http://camera".into(),
            mode: "rtsp".into(),
            fps: 10.0,
        };
        let err = spawn_camera_feed(&config, Arc::new(LiveFrameSource::new())).unwrap_err();
        assert!(matches!(err, SourceError::UnknownMode(ref m) if m == "rtsp"));
    }
}

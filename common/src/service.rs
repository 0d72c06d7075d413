use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::frame::EncodedImage;

const RECOGNIZE_PATH: &str = "/api/recognize/";
const ENROLL_PATH: &str = "/api/users/register_with_multiple_faces/";
const RECOGNIZE_FIELD: &str = "image_file";
const ENROLL_FIELD: &str = "image_files";

/// One face as reported by the recognition endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FaceRecord {
    /// `[top, right, bottom, left]` in frame pixels.
    #[serde(rename = "box", default)]
    pub bbox: Option<[i32; 4]>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecognitionResponse {
    #[serde(default)]
    pub recognized_faces: Vec<FaceRecord>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EnrollResponse {
    pub name: String,
    #[serde(default)]
    pub encodings: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub message: Option<String>,
}

impl EnrollResponse {
    pub fn encoding_count(&self) -> Option<usize> {
        self.encodings.as_ref().map(Vec::len)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("connection or processing error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(String),
    #[error("{}", status_message(.status, .detail))]
    Status { status: u16, detail: Option<String> },
}

impl ServiceError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ServiceError::Transport(_) | ServiceError::Decode(_))
    }
}

fn status_message(status: &u16, detail: &Option<String>) -> String {
    match detail {
        Some(detail) => detail.clone(),
        None => format!("server error (status {status})"),
    }
}

/// The remote recognition/enrollment service.
#[async_trait]
pub trait FaceService: Send + Sync {
    async fn recognize(&self, image: EncodedImage) -> Result<RecognitionResponse, ServiceError>;

    /// Upload a whole capture batch for `username` in one request.
    async fn enroll(
        &self,
        username: &str,
        images: Vec<EncodedImage>,
    ) -> Result<EnrollResponse, ServiceError>;
}

/// `FaceService` over HTTP multipart uploads.
pub struct HttpFaceService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFaceService {
    pub fn new(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn image_part(image: &EncodedImage) -> Result<Part, ServiceError> {
    Ok(Part::bytes(image.data().to_vec())
        .file_name(image.filename().to_string())
        .mime_str(image.mime_type())?)
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ServiceError> {
    let status = response.status();
    let body = response.bytes().await?;

    if status.is_success() {
        return serde_json::from_slice(&body).map_err(|e| ServiceError::Decode(e.to_string()));
    }

    let detail = serde_json::from_slice::<ErrorBody>(&body)
        .ok()
        .and_then(|b| b.detail)
        .map(|detail| match detail {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
    warn!(status = status.as_u16(), detail = ?detail, "face service returned an error");
    Err(ServiceError::Status {
        status: status.as_u16(),
        detail,
    })
}

#[async_trait]
impl FaceService for HttpFaceService {
    async fn recognize(&self, image: EncodedImage) -> Result<RecognitionResponse, ServiceError> {
        let form = Form::new().part(RECOGNIZE_FIELD, image_part(&image)?);
        debug!(bytes = image.len(), "submitting frame for recognition");

        let response = self
            .client
            .post(self.url(RECOGNIZE_PATH))
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }

    async fn enroll(
        &self,
        username: &str,
        images: Vec<EncodedImage>,
    ) -> Result<EnrollResponse, ServiceError> {
        let mut form = Form::new();
        for image in &images {
            form = form.part(ENROLL_FIELD, image_part(image)?);
        }
        debug!(username, images = images.len(), "submitting enrollment batch");

        let response = self
            .client
            .post(self.url(ENROLL_PATH))
            .query(&[("username", username)])
            .multipart(form)
            .send()
            .await?;
        read_json(response).await
    }
}

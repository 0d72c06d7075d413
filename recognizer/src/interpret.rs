use facecam_common::service::RecognitionResponse;
use tracing::debug;

/// `(top, right, bottom, left)` in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceBox {
    pub fn from_trbl([top, right, bottom, left]: [i32; 4]) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    /// Saturates instead of overflowing on out-of-range coordinates.
    pub fn width(&self) -> i32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> i32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() <= 0 || self.height() <= 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bbox: FaceBox,
    pub name: String,
    pub distance: Option<f64>,
}

impl DetectedFace {
    pub fn is_recognized(&self) -> bool {
        is_recognized_name(&self.name)
    }
}

/// Faces to draw for one cycle, plus the server's message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognitionResult {
    pub faces: Vec<DetectedFace>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub result: RecognitionResult,
    /// One-line status for the message surface, if there is anything to say.
    pub status: Option<String>,
}

/// A name counts as recognized unless it is blank or one of the service's
/// "Unknown" / "Unrecognized" labels, including parameterized forms such as
/// `Unknown (low confidence)`.
pub fn is_recognized_name(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    let lower = name.to_lowercase();
    !["unknown", "unrecognized"].iter().any(|label| {
        lower
            .strip_prefix(label)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '(']))
    })
}

pub fn interpret(response: RecognitionResponse) -> Interpretation {
    let mut names: Vec<&str> = Vec::new();
    for face in &response.recognized_faces {
        if is_recognized_name(&face.name) && !names.contains(&face.name.as_str()) {
            names.push(&face.name);
        }
    }

    let status = if names.is_empty() {
        response.message.clone()
    } else {
        let detected = format!("Detected: {}", names.join(", "));
        Some(match &response.message {
            Some(message) => format!("{detected} ({message})"),
            None => detected,
        })
    };

    let faces = response
        .recognized_faces
        .into_iter()
        .filter_map(|face| match face.bbox {
            Some(bbox) => Some(DetectedFace {
                bbox: FaceBox::from_trbl(bbox),
                name: face.name,
                distance: face.distance,
            }),
            None => {
                debug!(name = %face.name, "face without a box, not drawn");
                None
            }
        })
        .collect();

    Interpretation {
        result: RecognitionResult {
            faces,
            message: response.message,
        },
        status,
    }
}

use image::{Rgba, RgbaImage};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::interpret::{DetectedFace, RecognitionResult};

pub type Color = [u8; 4];

/// Drawn for faces with a recognized name.
pub const AFFIRMATIVE: Color = [0, 255, 0, 255];
/// Drawn for every unknown / unrecognized face.
pub const CAUTION: Color = [255, 0, 0, 255];

const LINE_WIDTH: u32 = 2;
/// Labels go above the box only when the box top leaves this much room.
const LABEL_HEADROOM: i32 = 20;
const LABEL_GAP_ABOVE: i32 = 5;
const LABEL_GAP_BELOW: i32 = 15;
const FONT_PX: u32 = 16;

/// A transparent drawing layer aligned with the video.
pub trait OverlaySurface: Send {
    fn size(&self) -> (u32, u32);
    fn resize(&mut self, width: u32, height: u32);
    fn clear(&mut self);
    fn stroke_rect(&mut self, x: i32, y: i32, width: i32, height: i32, color: Color, line_width: u32);
    /// `y` is the text baseline.
    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color);
    /// Called once a full render pass is on the surface.
    fn present(&mut self) {}
}

impl<S: OverlaySurface> OverlaySurface for Arc<Mutex<S>> {
    fn size(&self) -> (u32, u32) {
        self.lock().unwrap_or_else(|e| e.into_inner()).size()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.lock().unwrap_or_else(|e| e.into_inner()).resize(width, height);
    }

    fn clear(&mut self) {
        self.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: i32, height: i32, color: Color, line_width: u32) {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .stroke_rect(x, y, width, height, color, line_width);
    }

    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color) {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .fill_text(text, x, y, color);
    }

    fn present(&mut self) {
        self.lock().unwrap_or_else(|e| e.into_inner()).present();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawOp {
    StrokeRect {
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        color: Color,
        line_width: u32,
    },
    FillText {
        text: String,
        x: i32,
        y: i32,
        color: Color,
    },
}

/// Records draw calls since the last clear; serializable for a remote viewer.
#[derive(Debug, Default, Serialize)]
pub struct DrawList {
    width: u32,
    height: u32,
    ops: Vec<DrawOp>,
    #[serde(skip)]
    clears: usize,
    #[serde(skip)]
    snapshot: Option<PathBuf>,
}

impl DrawList {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Also write the list as JSON to `path` after every render.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot = Some(path);
        self
    }

    #[allow(dead_code)]
    pub fn ops(&self) -> &[DrawOp] {
        &self.ops
    }

    #[allow(dead_code)]
    pub fn clear_count(&self) -> usize {
        self.clears
    }

    #[allow(dead_code)]
    pub fn rects(&self) -> impl Iterator<Item = &DrawOp> {
        self.ops
            .iter()
            .filter(|op| matches!(op, DrawOp::StrokeRect { .. }))
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl OverlaySurface for DrawList {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.ops.clear();
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.clears += 1;
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: i32, height: i32, color: Color, line_width: u32) {
        self.ops.push(DrawOp::StrokeRect {
            x,
            y,
            width,
            height,
            color,
            line_width,
        });
    }

    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color) {
        self.ops.push(DrawOp::FillText {
            text: text.to_string(),
            x,
            y,
            color,
        });
    }

    fn present(&mut self) {
        let Some(path) = &self.snapshot else {
            return;
        };
        let written = self
            .to_json()
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to write overlay snapshot");
        }
    }
}

/// RGBA raster layer, optionally written out as a transparent PNG after
/// every render.
///
/// No font rasterizer is bundled: a label is drawn as a solid tag covering
/// the text's extent at its baseline, in the label colour.
pub struct RasterSurface {
    canvas: RgbaImage,
    snapshot: Option<PathBuf>,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32, snapshot: Option<PathBuf>) -> Self {
        Self {
            canvas: RgbaImage::new(width, height),
            snapshot,
        }
    }

    #[allow(dead_code)]
    pub fn canvas(&self) -> &RgbaImage {
        &self.canvas
    }

    /// Fill `[x0, x1) × [y0, y1)` clipped to the canvas.
    fn fill_clipped(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, color: Color) {
        let (w, h) = (i64::from(self.canvas.width()), i64::from(self.canvas.height()));
        let (x0, x1) = (x0.clamp(0, w), x1.clamp(0, w));
        let (y0, y1) = (y0.clamp(0, h), y1.clamp(0, h));
        for y in y0..y1 {
            for x in x0..x1 {
                self.canvas.put_pixel(x as u32, y as u32, Rgba(color));
            }
        }
    }
}

impl OverlaySurface for RasterSurface {
    fn size(&self) -> (u32, u32) {
        self.canvas.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.canvas = RgbaImage::new(width, height);
    }

    fn clear(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn stroke_rect(&mut self, x: i32, y: i32, width: i32, height: i32, color: Color, line_width: u32) {
        let (x0, y0) = (i64::from(x), i64::from(y));
        let (x1, y1) = (x0 + i64::from(width), y0 + i64::from(height));
        let lw = i64::from(line_width.max(1));
        self.fill_clipped(x0, y0, x1, (y0 + lw).min(y1), color);
        self.fill_clipped(x0, (y1 - lw).max(y0), x1, y1, color);
        self.fill_clipped(x0, y0, (x0 + lw).min(x1), y1, color);
        self.fill_clipped((x1 - lw).max(x0), y0, x1, y1, color);
    }

    fn fill_text(&mut self, text: &str, x: i32, y: i32, color: Color) {
        let advance = i64::from(FONT_PX / 2);
        let (x0, baseline) = (i64::from(x), i64::from(y));
        let x1 = x0 + advance * text.chars().count() as i64;
        self.fill_clipped(x0, baseline - i64::from(FONT_PX) + 4, x1, baseline, color);
    }

    fn present(&mut self) {
        if let Some(path) = &self.snapshot {
            if let Err(e) = self.canvas.save(path) {
                warn!(path = %path.display(), error = %e, "failed to write overlay snapshot");
            }
        }
    }
}

/// Draws recognition results onto an overlay surface.
pub struct OverlayRenderer {
    surface: Box<dyn OverlaySurface>,
}

impl OverlayRenderer {
    pub fn new(surface: Box<dyn OverlaySurface>) -> Self {
        Self { surface }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
    }

    /// Clear the whole surface, then draw one box and label per face.
    /// `None` only clears.
    pub fn render(&mut self, result: Option<&RecognitionResult>) {
        self.surface.clear();

        if let Some(result) = result {
            for face in &result.faces {
                self.draw_face(face);
            }
        }

        self.surface.present();
    }

    fn draw_face(&mut self, face: &DetectedFace) {
        let bbox = face.bbox;
        if bbox.is_degenerate() {
            debug!(name = %face.name, ?bbox, "degenerate face box, not drawn");
            return;
        }

        let color = face_color(face);
        let (x, y) = (bbox.left, bbox.top);
        let (width, height) = (bbox.width(), bbox.height());
        self.surface.stroke_rect(x, y, width, height, color, LINE_WIDTH);

        let text_y = if y > LABEL_HEADROOM {
            y - LABEL_GAP_ABOVE
        } else {
            y.saturating_add(height).saturating_add(LABEL_GAP_BELOW)
        };
        self.surface.fill_text(&label_text(face), x, text_y, color);
    }
}

pub fn face_color(face: &DetectedFace) -> Color {
    if face.is_recognized() {
        AFFIRMATIVE
    } else {
        CAUTION
    }
}

pub fn label_text(face: &DetectedFace) -> String {
    match face.distance {
        Some(distance) => format!("{} ({distance:.2})", face.name),
        None => face.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::FaceBox;

    fn face(name: &str, trbl: [i32; 4], distance: Option<f64>) -> DetectedFace {
        DetectedFace {
            bbox: FaceBox::from_trbl(trbl),
            name: name.into(),
            distance,
        }
    }

    fn renderer() -> (OverlayRenderer, Arc<Mutex<DrawList>>) {
        let surface = Arc::new(Mutex::new(DrawList::new(640, 480)));
        (OverlayRenderer::new(Box::new(Arc::clone(&surface))), surface)
    }

    fn result(faces: Vec<DetectedFace>) -> RecognitionResult {
        RecognitionResult {
            faces,
            message: None,
        }
    }

    #[test]
    fn one_face_draws_one_rect_and_label() {
        let (mut renderer, surface) = renderer();
        renderer.render(Some(&result(vec![face("Alice", [10, 110, 60, 10], Some(0.32))])));

        let list = surface.lock().unwrap();
        assert_eq!(list.rects().count(), 1);
        assert_eq!(
            list.ops()[0],
            DrawOp::StrokeRect {
                x: 10,
                y: 10,
                width: 100,
                height: 50,
                color: AFFIRMATIVE,
                line_width: 2
            }
        );
        match &list.ops()[1] {
            DrawOp::FillText { text, .. } => {
                assert!(text.contains("Alice"));
                assert!(text.contains("0.32"));
            }
            other => panic!("expected label, got {other:?}"),
        }
    }

    #[test]
    fn unknown_faces_use_caution_color() {
        let (mut renderer, surface) = renderer();
        renderer.render(Some(&result(vec![
            face("Unknown", [100, 200, 200, 100], None),
            face("Unrecognized (low confidence)", [100, 400, 200, 300], Some(0.71)),
            face("Alice", [300, 200, 400, 100], None),
        ])));

        let colors: Vec<Color> = surface
            .lock()
            .unwrap()
            .rects()
            .map(|op| match op {
                DrawOp::StrokeRect { color, .. } => *color,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(colors, vec![CAUTION, CAUTION, AFFIRMATIVE]);
    }

    #[test]
    fn label_goes_below_box_near_top_edge() {
        let (mut renderer, surface) = renderer();
        renderer.render(Some(&result(vec![
            face("Top", [5, 50, 45, 10], None),
            face("Low", [100, 50, 140, 10], None),
        ])));

        let baselines: Vec<i32> = surface
            .lock()
            .unwrap()
            .ops()
            .iter()
            .filter_map(|op| match op {
                DrawOp::FillText { y, .. } => Some(*y),
                _ => None,
            })
            .collect();
        assert_eq!(baselines, vec![45 + 15, 100 - 5]);
    }

    #[test]
    fn render_none_only_clears() {
        let (mut renderer, surface) = renderer();
        renderer.render(Some(&result(vec![face("Alice", [10, 110, 60, 10], None)])));
        renderer.render(None);

        let list = surface.lock().unwrap();
        assert_eq!(list.clear_count(), 2);
        assert!(list.ops().is_empty());
    }

    #[test]
    fn degenerate_and_out_of_bounds_boxes_do_not_panic() {
        let mut raster = RasterSurface::new(32, 32, None);
        raster.stroke_rect(-10, -10, 100, 100, CAUTION, 2);
        raster.fill_text("Unknown", 30, 2, CAUTION);

        let mut renderer = OverlayRenderer::new(Box::new(raster));
        renderer.render(Some(&result(vec![
            face("Inverted", [50, 10, 10, 50], None),
            face("Huge", [-100, 5000, 5000, -100], Some(0.5)),
        ])));
    }

    #[test]
    fn overflowing_box_coordinates_render() {
        let (mut renderer, surface) = renderer();
        renderer.render(Some(&result(vec![
            face("Wide", [0, i32::MAX, 10, -10], None),
            face("Deep", [i32::MAX - 5, 20, i32::MAX, 0], None),
        ])));
        assert_eq!(surface.lock().unwrap().rects().count(), 2);

        let mut raster = OverlayRenderer::new(Box::new(RasterSurface::new(32, 32, None)));
        raster.render(Some(&result(vec![face("Wide", [0, i32::MAX, 10, -10], Some(0.4))])));
    }

    #[test]
    fn raster_rect_outline_covers_box_edges() {
        let mut raster = RasterSurface::new(200, 100, None);
        raster.stroke_rect(10, 10, 100, 50, AFFIRMATIVE, 2);

        let canvas = raster.canvas();
        assert_eq!(canvas.get_pixel(10, 10).0, AFFIRMATIVE);
        assert_eq!(canvas.get_pixel(109, 59).0, AFFIRMATIVE);
        assert_eq!(canvas.get_pixel(110, 60).0, [0, 0, 0, 0]);
        assert_eq!(canvas.get_pixel(50, 30).0, [0, 0, 0, 0]);

        raster.clear();
        assert!(raster.canvas().pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn draw_list_snapshot_written_on_present() {
        let path = std::env::temp_dir().join(format!("facecam-overlay-{}.json", std::process::id()));
        let surface = DrawList::new(640, 480).with_snapshot(path.clone());
        let mut renderer = OverlayRenderer::new(Box::new(surface));
        renderer.render(Some(&result(vec![face("Alice", [10, 110, 60, 10], Some(0.32))])));

        let json = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["width"], 640);
        assert_eq!(value["ops"][0]["op"], "stroke_rect");
        assert_eq!(value["ops"][1]["text"], "Alice (0.32)");
    }

    #[test]
    fn draw_list_serializes_ops() {
        let mut list = DrawList::new(640, 480);
        list.fill_text("Alice (0.32)", 10, 5, AFFIRMATIVE);
        let json = list.to_json().unwrap();
        assert!(json.contains(r#""op":"fill_text""#));
        assert!(json.contains("Alice (0.32)"));
    }
}

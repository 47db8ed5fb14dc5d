//! Timeline description rendered by [`crate::renderer::Renderer`].
//!
//! Layers are drawn in list order, first = bottom. Each layer is visible in
//! `[start_ms, end_ms)`. Effect layers post-process everything composed below
//! them while they are visible.
//!
//! ```json
//! {
//!   "width": 1280, "height": 720, "frame_rate": 30, "duration_ms": 4000,
//!   "layers": [
//!     { "start_ms": 0, "end_ms": 4000, "kind": { "type": "color", "rgba": [0, 0, 0, 255] } },
//!     { "start_ms": 0, "end_ms": 4000, "kind": { "type": "video", "path": "clip.mp4" } },
//!     { "start_ms": 2000, "end_ms": 4000, "kind": { "type": "effect", "shader": "grayscale" } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};

use glam::{Mat4, Vec3};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gpu::{ChromaKey, CropRect, UniformValue};

/// Placement of a layer in output pixels, Y up, relative to the frame center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerTransform {
    pub position: [f32; 2],
    /// Degrees, clockwise positive.
    pub rotation: f32,
    pub scale: [f32; 2],
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0],
            rotation: 0.0,
            scale: [1.0, 1.0],
        }
    }
}

impl LayerTransform {
    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    /// Clip-space matrix for a full-frame quad in a `width`×`height` output.
    pub fn mvp(&self, width: u32, height: u32) -> Mat4 {
        if self.is_identity() {
            return Mat4::IDENTITY;
        }
        let half = Vec3::new(width as f32 / 2.0, height as f32 / 2.0, 1.0);
        let to_pixels = Mat4::from_scale(half);
        let to_clip = Mat4::from_scale(half.recip());
        let model = Mat4::from_translation(Vec3::new(self.position[0], self.position[1], 0.0))
            * Mat4::from_rotation_z(-self.rotation.to_radians())
            * Mat4::from_scale(Vec3::new(self.scale[0], self.scale[1], 1.0));
        to_clip * model * to_pixels
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LayerKind {
    Video {
        path: PathBuf,
        /// Source time shown at the layer's start.
        #[serde(default)]
        trim_in_ms: i64,
        #[serde(default)]
        chroma_key: Option<ChromaKey>,
    },
    Color {
        rgba: [u8; 4],
    },
    Image {
        path: PathBuf,
    },
    Effect {
        /// Library name or path to a `.glsl` file.
        shader: String,
        #[serde(default)]
        crop: CropRect,
        #[serde(default)]
        uniforms: IndexMap<String, UniformValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub start_ms: i64,
    pub end_ms: i64,
    #[serde(default)]
    pub transform: LayerTransform,
    pub kind: LayerKind,
}

impl Layer {
    pub fn new(start_ms: i64, end_ms: i64, kind: LayerKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: String::new(),
            start_ms,
            end_ms,
            transform: LayerTransform::default(),
            kind,
        }
    }

    pub fn is_visible(&self, t_ms: i64) -> bool {
        self.start_ms <= t_ms && t_ms < self.end_ms
    }

    /// Source time at timeline time `t_ms` (adds the trim for video layers).
    pub fn local_time_ms(&self, t_ms: i64) -> i64 {
        let offset = match &self.kind {
            LayerKind::Video { trim_in_ms, .. } => *trim_in_ms,
            _ => 0,
        };
        (t_ms - self.start_ms).max(0) + offset
    }

    /// 0..1 position inside the display window.
    pub fn progress(&self, t_ms: i64) -> f32 {
        let span = (self.end_ms - self.start_ms).max(1) as f64;
        ((t_ms - self.start_ms) as f64 / span).clamp(0.0, 1.0) as f32
    }

    pub fn label(&self) -> String {
        if self.name.is_empty() {
            self.id.to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration_ms: i64,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Timeline {
    /// Read and validate a timeline file. Relative media paths are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut timeline: Timeline =
            serde_json::from_str(&text).map_err(|e| Error::Timeline(format!("{}: {}", path.display(), e)))?;
        if let Some(base) = path.parent() {
            timeline.resolve_paths(base);
        }
        timeline.validate()?;
        Ok(timeline)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| Error::Timeline(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        for layer in &mut self.layers {
            match &mut layer.kind {
                LayerKind::Video { path, .. } | LayerKind::Image { path } if path.is_relative() => {
                    *path = base.join(&*path);
                }
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Timeline(format!("invalid size {}x{}", self.width, self.height)));
        }
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(Error::Timeline(format!("invalid frame rate {}", self.frame_rate)));
        }
        if self.duration_ms <= 0 {
            return Err(Error::Timeline(format!("invalid duration {}ms", self.duration_ms)));
        }
        for layer in &self.layers {
            if layer.start_ms < 0 || layer.end_ms <= layer.start_ms {
                return Err(Error::Timeline(format!(
                    "layer {}: empty range {}..{}ms",
                    layer.label(),
                    layer.start_ms,
                    layer.end_ms
                )));
            }
            match &layer.kind {
                LayerKind::Effect { crop, shader, .. } => {
                    if !crop.is_valid() {
                        return Err(Error::Timeline(format!("layer {}: invalid crop {:?}", layer.label(), crop)));
                    }
                    if shader.is_empty() {
                        return Err(Error::Timeline(format!("layer {}: missing shader", layer.label())));
                    }
                }
                LayerKind::Video { trim_in_ms, .. } if *trim_in_ms < 0 => {
                    return Err(Error::Timeline(format!("layer {}: negative trim", layer.label())));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Layers visible at `t_ms`, bottom first.
    pub fn visible_at(&self, t_ms: i64) -> impl Iterator<Item = &Layer> {
        self.layers.iter().filter(move |l| l.is_visible(t_ms))
    }

    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.frame_rate
    }

    /// Timeline positions of every output frame in `[from_ms, to_ms)`, spaced
    /// `step_ms` apart (one frame duration when None).
    pub fn frame_times(&self, from_ms: i64, to_ms: Option<i64>, step_ms: Option<i64>) -> Vec<i64> {
        let end = to_ms.unwrap_or(self.duration_ms).min(self.duration_ms);
        match step_ms {
            Some(step) => (from_ms.max(0)..end).step_by(step.max(1) as usize).collect(),
            None => {
                let frame = self.frame_duration_ms();
                (0..)
                    .map(|i| (i as f64 * frame).round() as i64)
                    .skip_while(|&t| t < from_ms)
                    .take_while(|&t| t < end)
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline() -> Timeline {
        Timeline {
            width: 64,
            height: 36,
            frame_rate: 25.0,
            duration_ms: 1000,
            layers: vec![
                Layer::new(0, 1000, LayerKind::Color { rgba: [0, 0, 0, 255] }),
                Layer::new(
                    200,
                    600,
                    LayerKind::Video {
                        path: "clip.mp4".into(),
                        trim_in_ms: 1500,
                        chroma_key: None,
                    },
                ),
            ],
        }
    }

    #[test]
    fn test_visibility_is_half_open() {
        let t = timeline();
        assert_eq!(t.visible_at(199).count(), 1);
        assert_eq!(t.visible_at(200).count(), 2);
        assert_eq!(t.visible_at(600).count(), 1);
    }

    #[test]
    fn test_local_time_adds_trim() {
        let layer = &timeline().layers[1];
        assert_eq!(layer.local_time_ms(200), 1500);
        assert_eq!(layer.local_time_ms(450), 1750);
    }

    #[test]
    fn test_progress() {
        let layer = &timeline().layers[1];
        assert_eq!(layer.progress(200), 0.0);
        assert_eq!(layer.progress(400), 0.5);
        assert_eq!(layer.progress(900), 1.0);
    }

    #[test]
    fn test_validate_rejects_empty_range() {
        let mut t = timeline();
        assert!(t.validate().is_ok());
        t.layers[1].end_ms = 200;
        assert!(matches!(t.validate(), Err(Error::Timeline(_))));
    }

    #[test]
    fn test_identity_transform_is_identity_mvp() {
        assert_eq!(LayerTransform::default().mvp(1920, 1080), Mat4::IDENTITY);
    }

    #[test]
    fn test_transform_moves_in_pixels() {
        let transform = LayerTransform {
            position: [960.0, 0.0],
            scale: [0.5, 0.5],
            ..LayerTransform::default()
        };
        let corner = transform.mvp(1920, 1080) * glam::Vec4::new(1.0, 1.0, 0.0, 1.0);
        assert!((corner.x - 1.5).abs() < 1e-5);
        assert!((corner.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_json_parsing_and_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.json");
        std::fs::write(
            &path,
            r#"{
                "width": 320, "height": 240, "frame_rate": 30, "duration_ms": 2000,
                "layers": [
                    { "start_ms": 0, "end_ms": 2000, "kind": { "type": "video", "path": "a.mp4",
                      "chroma_key": { "color": [0, 1, 0], "threshold": 0.3 } } },
                    { "start_ms": 0, "end_ms": 2000, "kind": { "type": "effect", "shader": "vignette",
                      "uniforms": { "uStrength": 0.8 } } }
                ]
            }"#,
        )
        .unwrap();
        let t = Timeline::load(&path).unwrap();
        let LayerKind::Video { path: video, chroma_key, .. } = &t.layers[0].kind else {
            panic!("expected video layer");
        };
        assert_eq!(video, &dir.path().join("a.mp4"));
        assert_eq!(chroma_key.unwrap().threshold, 0.3);
        let LayerKind::Effect { uniforms, crop, .. } = &t.layers[1].kind else {
            panic!("expected effect layer");
        };
        assert_eq!(uniforms["uStrength"], UniformValue::Float(0.8));
        assert_eq!(*crop, CropRect::default());
    }

    #[test]
    fn test_frame_times() {
        let t = timeline();
        assert_eq!(t.frame_times(0, Some(200), None), vec![0, 40, 80, 120, 160]);
        assert_eq!(t.frame_times(100, Some(400), Some(100)), vec![100, 200, 300]);
        assert_eq!(t.frame_times(900, None, Some(50)), vec![900, 950]);
    }
}

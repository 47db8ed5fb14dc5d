//! One composed frame per `prepare_draw` .. `finish` sequence.
//!
//! ```text
//! prepare_draw   ping-pong, clear write target
//! draw_*         layers blended over the opaque write target
//! apply_effect   ping-pong, previous output -> effect -> new write target
//! finish         ping-pong, last output -> presentable surface
//! ```

use std::time::Duration;

use glam::Mat4;
use glow::HasContext;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::context::ColorMode;
use super::effect::{EffectParams, EffectShader};
use super::external::ExternalTexture;
use super::framebuffer::{FrameBufferPair, StageTargets};
use super::shader::{ShaderProgram, UniformKind, UniformValue};
use super::{assets, check_gl, GpuError};
use crate::bitmap::Bitmap;

const VIDEO_UNIT: u32 = 0;
const CANVAS_UNIT: u32 = 1;
const PREVIOUS_UNIT: u32 = 2;

/// Layer blend as (src_rgb, dst_rgb, src_alpha, dst_alpha): straight-alpha
/// "over" for color while the destination alpha is kept. Stages clear to
/// opaque black, so every composed frame stays opaque.
const LAYER_BLEND: [u32; 4] = [glow::SRC_ALPHA, glow::ONE_MINUS_SRC_ALPHA, glow::ZERO, glow::ONE];

const DRAW_MODE_VIDEO: i32 = 1;
const DRAW_MODE_CANVAS: i32 = 2;
const DRAW_MODE_PREVIOUS: i32 = 3;

/// Discard fragments whose color lies within `threshold` (RGB distance, 0..1
/// channels) of `color`. A threshold of 0 disables keying.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChromaKey {
    pub color: [f32; 3],
    pub threshold: f32,
}

impl ChromaKey {
    pub fn new(color: [f32; 3], threshold: f32) -> Self {
        Self { color, threshold }
    }

    /// Green screen with a moderate tolerance.
    pub fn green() -> Self {
        Self::new([0.0, 1.0, 0.0], 0.4)
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0.0
    }

    /// CPU mirror of the layer shader's discard test.
    pub fn discards(&self, rgb: [f32; 3]) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let d2: f32 = rgb.iter().zip(self.color).map(|(a, b)| (a - b) * (a - b)).sum();
        d2.sqrt() < self.threshold
    }

    /// Uniform values `(color, threshold)` with keying off for `None`.
    pub fn uniforms(key: Option<&ChromaKey>) -> ([f32; 3], f32) {
        match key {
            Some(k) if k.is_enabled() => (k.color, k.threshold),
            _ => ([0.0; 3], 0.0),
        }
    }
}

/// Interleaved (x, y, u, v) triangle strip covering clip space.
#[derive(Debug)]
pub struct FullScreenQuad {
    vao: glow::VertexArray,
    vbo: glow::Buffer,
}

impl FullScreenQuad {
    pub fn create(gl: &glow::Context) -> Result<Self, GpuError> {
        #[rustfmt::skip]
        let vertices: [f32; 16] = [
            // pos      // tex
            -1.0, -1.0,  0.0, 0.0,
             1.0, -1.0,  1.0, 0.0,
            -1.0,  1.0,  0.0, 1.0,
             1.0,  1.0,  1.0, 1.0,
        ];
        unsafe {
            let vao = gl
                .create_vertex_array()
                .map_err(|e| GpuError::Resource(format!("Failed to create VAO: {}", e)))?;
            let vbo = match gl.create_buffer() {
                Ok(b) => b,
                Err(e) => {
                    gl.delete_vertex_array(vao);
                    return Err(GpuError::Resource(format!("Failed to create VBO: {}", e)));
                }
            };
            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytemuck::cast_slice(&vertices), glow::STATIC_DRAW);
            gl.bind_vertex_array(None);
            gl.bind_buffer(glow::ARRAY_BUFFER, None);
            Ok(Self { vao, vbo })
        }
    }

    /// Point `program`'s attributes at the quad and draw it.
    pub fn draw(&self, gl: &glow::Context, program: &ShaderProgram) {
        let stride = 4 * std::mem::size_of::<f32>() as i32;
        let position = program.position_attribute();
        let texcoord = program.texcoord_attribute();
        unsafe {
            gl.bind_vertex_array(Some(self.vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(self.vbo));
            gl.vertex_attrib_pointer_f32(position, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(position);
            gl.vertex_attrib_pointer_f32(texcoord, 2, glow::FLOAT, false, stride, 2 * std::mem::size_of::<f32>() as i32);
            gl.enable_vertex_attrib_array(texcoord);
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, 4);
            gl.disable_vertex_attrib_array(position);
            gl.disable_vertex_attrib_array(texcoord);
            gl.bind_vertex_array(None);
        }
    }

    pub fn delete(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_buffer(self.vbo);
            gl.delete_vertex_array(self.vao);
        }
    }
}

struct Resources {
    targets: FrameBufferPair,
    quad: FullScreenQuad,
    layer: ShaderProgram,
    canvas: glow::Texture,
}

/// Ping-pong compositor bound to one graphics context.
pub struct FrameCompositor {
    context_id: u64,
    width: u32,
    height: u32,
    resources: Option<Resources>,
    stage: Option<StageTargets>,
}

fn flip_v() -> Mat4 {
    Mat4::from_translation(glam::Vec3::new(0.0, 1.0, 0.0)) * Mat4::from_scale(glam::Vec3::new(1.0, -1.0, 1.0))
}

impl FrameCompositor {
    /// Allocate targets and the layer program in the current context.
    pub fn new(gl: &glow::Context, context_id: u64, width: u32, height: u32, color_mode: ColorMode) -> Result<Self, GpuError> {
        let mut layer = ShaderProgram::compile(gl, assets::VERTEX_ES3, assets::LAYER_FRAGMENT)?;
        for (name, kind) in [
            ("uMVPMatrix", UniformKind::Mat4),
            ("uSTMatrix", UniformKind::Mat4),
            ("iDrawMode", UniformKind::Int),
            ("sTexture", UniformKind::Sampler),
            ("sCanvas", UniformKind::Sampler),
            ("sPrevious", UniformKind::Sampler),
            ("uChromaKeyColor", UniformKind::Vec3),
            ("uChromaKeyThreshold", UniformKind::Float),
        ] {
            if let Err(e) = layer.register_uniform(gl, name, kind) {
                layer.destroy(gl);
                return Err(e);
            }
        }

        let targets = match FrameBufferPair::create(gl, width, height, color_mode) {
            Ok(t) => t,
            Err(e) => {
                layer.destroy(gl);
                return Err(e);
            }
        };
        let quad = match FullScreenQuad::create(gl) {
            Ok(q) => q,
            Err(e) => {
                targets.delete(gl);
                layer.destroy(gl);
                return Err(e);
            }
        };
        let canvas = unsafe {
            match gl.create_texture() {
                Ok(t) => t,
                Err(e) => {
                    quad.delete(gl);
                    targets.delete(gl);
                    layer.destroy(gl);
                    return Err(GpuError::Resource(format!("glGenTextures: {}", e)));
                }
            }
        };
        unsafe {
            gl.bind_texture(glow::TEXTURE_2D, Some(canvas));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.bind_texture(glow::TEXTURE_2D, None);
        }
        check_gl(gl, "create compositor")?;

        debug!("FrameCompositor {}x{} ({:?}) on context {}", width, height, color_mode, context_id);
        Ok(Self {
            context_id,
            width,
            height,
            resources: Some(Resources {
                targets,
                quad,
                layer,
                canvas,
            }),
            stage: None,
        })
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_destroyed(&self) -> bool {
        self.resources.is_none()
    }

    fn resources(&mut self) -> Result<&mut Resources, GpuError> {
        self.resources
            .as_mut()
            .ok_or_else(|| GpuError::Resource("compositor already destroyed".into()))
    }

    fn require_stage(&self) -> Result<StageTargets, GpuError> {
        self.stage
            .ok_or_else(|| GpuError::Resource("draw outside prepare_draw/finish".into()))
    }

    /// Start a frame: advance ping-pong and clear the new write target.
    pub fn prepare_draw(&mut self, gl: &glow::Context) -> Result<(), GpuError> {
        let (w, h) = (self.width as i32, self.height as i32);
        let res = self.resources()?;
        let stage = res.targets.ping_pong();
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(stage.write_framebuffer));
            gl.viewport(0, 0, w, h);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
        }
        self.stage = Some(stage);
        trace!("prepare_draw: write={:?}", stage.write_framebuffer);
        check_gl(gl, "prepare_draw")
    }

    fn draw_layer(
        &mut self,
        gl: &glow::Context,
        mode: i32,
        mvp: &Mat4,
        st: &Mat4,
        chroma_key: Option<&ChromaKey>,
    ) -> Result<(), GpuError> {
        let stage = self.require_stage()?;
        let (w, h) = (self.width as i32, self.height as i32);
        let res = self.resources()?;
        let (key_color, key_threshold) = ChromaKey::uniforms(chroma_key);
        let layer = &mut res.layer;
        layer.use_program(gl);
        layer.set_uniform(gl, "uMVPMatrix", UniformValue::Mat4(mvp.to_cols_array()));
        layer.set_uniform(gl, "uSTMatrix", UniformValue::Mat4(st.to_cols_array()));
        layer.set_uniform(gl, "iDrawMode", UniformValue::Int(mode));
        layer.set_uniform(gl, "sTexture", UniformValue::Int(VIDEO_UNIT as i32));
        layer.set_uniform(gl, "sCanvas", UniformValue::Int(CANVAS_UNIT as i32));
        layer.set_uniform(gl, "sPrevious", UniformValue::Int(PREVIOUS_UNIT as i32));
        layer.set_uniform(gl, "uChromaKeyColor", UniformValue::Vec3(key_color));
        layer.set_uniform(gl, "uChromaKeyThreshold", UniformValue::Float(key_threshold));
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(stage.write_framebuffer));
            gl.viewport(0, 0, w, h);
            gl.enable(glow::BLEND);
            let [src_rgb, dst_rgb, src_alpha, dst_alpha] = LAYER_BLEND;
            gl.blend_func_separate(src_rgb, dst_rgb, src_alpha, dst_alpha);
        }
        res.quad.draw(gl, &res.layer);
        check_gl(gl, "draw layer")
    }

    /// Upload `bitmap` and blend it into the current target through `transform`.
    pub fn draw_canvas_layer(&mut self, gl: &glow::Context, bitmap: &Bitmap, transform: &Mat4) -> Result<(), GpuError> {
        self.require_stage()?;
        let canvas = self.resources()?.canvas;
        unsafe {
            gl.active_texture(glow::TEXTURE0 + CANVAS_UNIT);
            gl.bind_texture(glow::TEXTURE_2D, Some(canvas));
            gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                glow::RGBA8 as i32,
                bitmap.width() as i32,
                bitmap.height() as i32,
                0,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelUnpackData::Slice(Some(bitmap.data())),
            );
        }
        check_gl(gl, "upload canvas")?;
        self.draw_layer(gl, DRAW_MODE_CANVAS, transform, &flip_v(), None)
    }

    /// Blend the newest decoded frame of `source` into the current target.
    ///
    /// Re-attaches the texture to this context when needed, then waits up to
    /// `wait` for a new frame; on timeout the last latched frame is reused.
    /// Returns false (and draws nothing) when no frame was ever delivered.
    pub fn draw_external_texture(
        &mut self,
        gl: &glow::Context,
        source: &ExternalTexture,
        transform: &Mat4,
        chroma_key: Option<&ChromaKey>,
        wait: Duration,
    ) -> Result<bool, GpuError> {
        self.require_stage()?;
        unsafe { gl.active_texture(glow::TEXTURE0 + VIDEO_UNIT) };
        if source.needs_attach(self.context_id) {
            source.detach(gl, self.context_id);
            source.attach(gl, self.context_id)?;
        }
        if source.await_frame_available(wait) {
            source.update_tex_image(gl)?;
        } else if source.current_frame().is_some() {
            warn!("No new video frame within {:?}, reusing last frame", wait);
        }
        let (Some(texture), Some(_)) = (source.texture(), source.current_frame()) else {
            trace!("draw_external_texture: nothing delivered yet");
            return Ok(false);
        };
        unsafe {
            gl.active_texture(glow::TEXTURE0 + VIDEO_UNIT);
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        }
        self.draw_layer(gl, DRAW_MODE_VIDEO, transform, &source.transform_matrix(), chroma_key)?;
        Ok(true)
    }

    /// Run `effect` over the composed image so far.
    pub fn apply_effect(&mut self, gl: &glow::Context, effect: &mut EffectShader, params: &EffectParams<'_>) -> Result<(), GpuError> {
        self.require_stage()?;
        let (w, h) = (self.width, self.height);
        let stage = self.resources()?.targets.ping_pong();
        unsafe {
            gl.active_texture(glow::TEXTURE0 + PREVIOUS_UNIT);
            gl.bind_texture(glow::TEXTURE_2D, Some(stage.read_texture));
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(stage.write_framebuffer));
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
        }
        self.stage = Some(stage);
        trace!("apply_effect '{}': read={:?} write={:?}", effect.name(), stage.read_texture, stage.write_framebuffer);
        let quad = &self.resources()?.quad;
        effect.apply_effect(gl, quad, w, h, PREVIOUS_UNIT as i32, params)
    }

    /// Draw the last target onto the presentable surface.
    pub fn finish(&mut self, gl: &glow::Context) -> Result<(), GpuError> {
        self.require_stage()?;
        let (w, h) = (self.width as i32, self.height as i32);
        let res = self.resources()?;
        let stage = res.targets.ping_pong();
        let identity = Mat4::IDENTITY.to_cols_array();
        let layer = &mut res.layer;
        layer.use_program(gl);
        layer.set_uniform(gl, "uMVPMatrix", UniformValue::Mat4(identity));
        layer.set_uniform(gl, "uSTMatrix", UniformValue::Mat4(identity));
        layer.set_uniform(gl, "iDrawMode", UniformValue::Int(DRAW_MODE_PREVIOUS));
        layer.set_uniform(gl, "sPrevious", UniformValue::Int(PREVIOUS_UNIT as i32));
        layer.set_uniform(gl, "uChromaKeyThreshold", UniformValue::Float(0.0));
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.viewport(0, 0, w, h);
            gl.disable(glow::BLEND);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT | glow::DEPTH_BUFFER_BIT);
            gl.active_texture(glow::TEXTURE0 + PREVIOUS_UNIT);
            gl.bind_texture(glow::TEXTURE_2D, Some(stage.read_texture));
        }
        res.quad.draw(gl, &res.layer);
        self.stage = None;
        check_gl(gl, "finish")
    }

    /// Read back the presentable surface (call after `finish`, before swap).
    pub fn read_pixels(&self, gl: &glow::Context) -> Result<Bitmap, GpuError> {
        let mut data = vec![0u8; self.width as usize * self.height as usize * 4];
        unsafe {
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            gl.read_pixels(
                0,
                0,
                self.width as i32,
                self.height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(Some(&mut data)),
            );
        }
        check_gl(gl, "read_pixels")?;
        let mut bitmap = Bitmap::from_rgba(self.width, self.height, data)
            .map_err(|e| GpuError::Resource(e.to_string()))?;
        bitmap.flip_vertical();
        Ok(bitmap)
    }

    /// Release all GL objects. Safe to call more than once.
    pub fn destroy(&mut self, gl: &glow::Context) {
        let Some(res) = self.resources.take() else {
            return;
        };
        res.quad.delete(gl);
        res.layer.destroy(gl);
        res.targets.delete(gl);
        unsafe { gl.delete_texture(res.canvas) };
        self.stage = None;
        debug!("FrameCompositor on context {} destroyed", self.context_id);
    }
}

impl std::fmt::Debug for FrameCompositor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCompositor")
            .field("context_id", &self.context_id)
            .field("size", &(self.width, self.height))
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

//! Full-screen fragment effects run between two ping-pong targets.
//!
//! Uniform ABI seen by an effect shader:
//! - `vec2 vResolution` (required)
//! - `int iDrawMode` (3 = sample the previous stage through `sPrevious`)
//! - `vec4 vCropLocation` normalized x start/end, y start/end (optional)
//! - `float f_time` progress 0..1 within the layer's window (optional)
//! - `uMVPMatrix`, `uSTMatrix` in the vertex stage (required)

use glam::Mat4;
use glow::HasContext;
use indexmap::IndexMap;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use super::assets::GlslVersion;
use super::compositor::FullScreenQuad;
use super::shader::{ShaderProgram, UniformKind, UniformValue};
use super::{check_gl, GpuError};

/// Draw mode selecting the previous-FBO sampler.
pub const DRAW_MODE_PREVIOUS: i32 = 3;

/// Normalized region an effect is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropRect {
    pub x_start: f32,
    pub x_end: f32,
    pub y_start: f32,
    pub y_end: f32,
}

impl Default for CropRect {
    fn default() -> Self {
        Self {
            x_start: 0.0,
            x_end: 1.0,
            y_start: 0.0,
            y_end: 1.0,
        }
    }
}

impl CropRect {
    pub fn as_vec4(&self) -> [f32; 4] {
        [self.x_start, self.x_end, self.y_start, self.y_end]
    }

    pub fn is_valid(&self) -> bool {
        let unit = 0.0..=1.0;
        unit.contains(&self.x_start)
            && unit.contains(&self.x_end)
            && unit.contains(&self.y_start)
            && unit.contains(&self.y_end)
            && self.x_start < self.x_end
            && self.y_start < self.y_end
    }
}

/// Per-frame inputs of one effect pass.
#[derive(Debug, Clone, Default)]
pub struct EffectParams<'a> {
    pub crop: CropRect,
    pub progress: f32,
    pub custom: Option<&'a IndexMap<String, UniformValue>>,
}

/// Compiled effect shader with the ABI uniforms registered.
#[derive(Debug)]
pub struct EffectShader {
    name: String,
    program: ShaderProgram,
}

impl EffectShader {
    /// Compile `fragment_src` against the vertex stage of the same GLSL version.
    pub fn compile(gl: &glow::Context, name: &str, fragment_src: &str) -> Result<Self, GpuError> {
        let version = GlslVersion::detect(fragment_src);
        let mut program = ShaderProgram::compile(gl, version.vertex_source(), fragment_src)?;

        let registered = (|| {
            program.register_uniform(gl, "uMVPMatrix", UniformKind::Mat4)?;
            program.register_uniform(gl, "uSTMatrix", UniformKind::Mat4)?;
            program.register_uniform(gl, "vResolution", UniformKind::Vec2)?;
            Ok::<_, GpuError>(())
        })();
        if let Err(e) = registered {
            program.destroy(gl);
            return Err(e);
        }
        program.register_optional_uniform(gl, "iDrawMode", UniformKind::Int);
        program.register_optional_uniform(gl, "sPrevious", UniformKind::Sampler);
        program.register_optional_uniform(gl, "vCropLocation", UniformKind::Vec4);
        program.register_optional_uniform(gl, "f_time", UniformKind::Float);

        debug!("Effect '{}' compiled ({:?})", name, version);
        Ok(Self {
            name: name.to_string(),
            program,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    /// Register a shader-specific uniform. Returns false if the shader lacks it.
    pub fn register_uniform(&mut self, gl: &glow::Context, name: &str, kind: UniformKind) -> bool {
        self.program.register_optional_uniform(gl, name, kind)
    }

    /// Upload a uniform; binds the program first.
    pub fn set_uniform(&mut self, gl: &glow::Context, name: &str, value: UniformValue) {
        self.program.use_program(gl);
        self.program.set_uniform(gl, name, value);
    }

    /// Draw a full-screen pass sampling texture unit `source_unit` into the
    /// bound framebuffer, then wait for the GPU.
    pub fn apply_effect(
        &mut self,
        gl: &glow::Context,
        quad: &FullScreenQuad,
        width: u32,
        height: u32,
        source_unit: i32,
        params: &EffectParams<'_>,
    ) -> Result<(), GpuError> {
        let program = &mut self.program;
        program.use_program(gl);
        program.set_uniform(gl, "uMVPMatrix", UniformValue::Mat4(Mat4::IDENTITY.to_cols_array()));
        program.set_uniform(gl, "uSTMatrix", UniformValue::Mat4(Mat4::IDENTITY.to_cols_array()));
        program.set_uniform(gl, "vResolution", UniformValue::Vec2([width as f32, height as f32]));
        program.set_uniform(gl, "iDrawMode", UniformValue::Int(DRAW_MODE_PREVIOUS));
        program.set_uniform(gl, "sPrevious", UniformValue::Int(source_unit));
        program.set_uniform(gl, "vCropLocation", UniformValue::Vec4(params.crop.as_vec4()));
        program.set_uniform(gl, "f_time", UniformValue::Float(params.progress.clamp(0.0, 1.0)));
        if let Some(custom) = params.custom {
            for (name, value) in custom {
                if !program.has_uniform(name) {
                    // Register with the declared type, not the JSON one
                    let Some(kind) = program.declared_uniform_kind(gl, name) else {
                        trace!("Effect has no uniform {}", name);
                        continue;
                    };
                    program.register_optional_uniform(gl, name, kind);
                }
                let value = program
                    .uniform_kind(name)
                    .and_then(|kind| value.coerce(kind))
                    .unwrap_or(*value);
                program.set_uniform(gl, name, value);
            }
        }

        unsafe {
            gl.viewport(0, 0, width as i32, height as i32);
            gl.disable(glow::BLEND);
        }
        quad.draw(gl, program);
        unsafe { gl.finish() };
        check_gl(gl, "apply effect")
    }

    pub fn destroy(self, gl: &glow::Context) {
        self.program.destroy(gl);
    }
}

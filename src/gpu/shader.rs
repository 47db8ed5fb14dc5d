//! GLSL program compilation and name-based uniform handling.
//!
//! Uniforms live in one map keyed by name; each entry records its kind, its
//! resolved location and the last value set, so callers can read back what
//! they uploaded without a GL round trip.

use glow::HasContext;
use indexmap::IndexMap;
use log::{trace, warn};
use serde::{Deserialize, Serialize};

use super::{check_gl, GpuError};

/// Position attribute names accepted from the vertex shader.
const POSITION_ATTRIBUTES: [&str; 2] = ["aPosition", "a_position"];
const TEXCOORD_ATTRIBUTE: &str = "aTextureCoord";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UniformKind {
    Int,
    Float,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    /// Texture unit index, uploaded as an int.
    Sampler,
}

impl UniformKind {
    /// Kind of a GL uniform type enum as reported by `glGetActiveUniform`.
    pub fn from_gl_type(utype: u32) -> Option<Self> {
        match utype {
            glow::INT | glow::BOOL => Some(UniformKind::Int),
            glow::FLOAT => Some(UniformKind::Float),
            glow::FLOAT_VEC2 => Some(UniformKind::Vec2),
            glow::FLOAT_VEC3 => Some(UniformKind::Vec3),
            glow::FLOAT_VEC4 => Some(UniformKind::Vec4),
            glow::FLOAT_MAT4 => Some(UniformKind::Mat4),
            glow::SAMPLER_2D | glow::SAMPLER_CUBE => Some(UniformKind::Sampler),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UniformValue {
    Int(i32),
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat4([f32; 16]),
}

impl UniformValue {
    /// Natural kind of the value. `Int` values also fit `Sampler` slots.
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Int(_) => UniformKind::Int,
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
            UniformValue::Mat4(_) => UniformKind::Mat4,
        }
    }

    pub fn fits(&self, kind: UniformKind) -> bool {
        let own = self.kind();
        own == kind || (own == UniformKind::Int && kind == UniformKind::Sampler)
    }

    /// The value as `kind`. JSON `1` parses as `Int`, so ints widen to
    /// float slots; anything else must already fit.
    pub fn coerce(self, kind: UniformKind) -> Option<UniformValue> {
        match (self, kind) {
            (UniformValue::Int(v), UniformKind::Float) => Some(UniformValue::Float(v as f32)),
            (value, kind) if value.fits(kind) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct UniformSlot<L> {
    kind: UniformKind,
    location: L,
    value: Option<UniformValue>,
}

/// Name → {kind, location, last value}.
#[derive(Debug, Clone)]
pub struct UniformRegistry<L> {
    slots: IndexMap<String, UniformSlot<L>>,
}

impl<L> Default for UniformRegistry<L> {
    fn default() -> Self {
        Self { slots: IndexMap::new() }
    }
}

impl<L> UniformRegistry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a uniform. Returns false if it already existed.
    pub fn insert(&mut self, name: &str, kind: UniformKind, location: L) -> bool {
        self.slots
            .insert(name.to_string(), UniformSlot { kind, location, value: None })
            .is_none()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> Option<UniformKind> {
        self.slots.get(name).map(|s| s.kind)
    }

    /// Record a value. Returns the location to upload to, or None when the
    /// name is unregistered or the value does not fit the registered kind.
    pub fn set(&mut self, name: &str, value: UniformValue) -> Option<&L> {
        let slot = self.slots.get_mut(name)?;
        if !value.fits(slot.kind) {
            warn!("Uniform {} is {:?}, ignoring {:?} value", name, slot.kind, value.kind());
            return None;
        }
        slot.value = Some(value);
        Some(&slot.location)
    }

    /// Last value set for `name`.
    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.slots.get(name).and_then(|s| s.value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Linked vertex + fragment program with resolved attribute locations.
pub struct ShaderProgram {
    program: glow::Program,
    position: u32,
    texcoord: u32,
    uniforms: UniformRegistry<glow::UniformLocation>,
}

impl ShaderProgram {
    /// Compile and link both stages.
    ///
    /// A failed compile (or any compiler log output) is `ShaderSyntax`; a link
    /// failure or a missing vertex attribute is `ShaderLinkage`.
    pub fn compile(gl: &glow::Context, vertex_src: &str, fragment_src: &str) -> Result<Self, GpuError> {
        unsafe {
            let vertex = compile_stage(gl, glow::VERTEX_SHADER, vertex_src)?;
            let fragment = match compile_stage(gl, glow::FRAGMENT_SHADER, fragment_src) {
                Ok(shader) => shader,
                Err(e) => {
                    gl.delete_shader(vertex);
                    return Err(e);
                }
            };

            let program = match gl.create_program() {
                Ok(p) => p,
                Err(e) => {
                    gl.delete_shader(vertex);
                    gl.delete_shader(fragment);
                    return Err(GpuError::Resource(format!("glCreateProgram: {}", e)));
                }
            };
            gl.attach_shader(program, vertex);
            gl.attach_shader(program, fragment);
            gl.link_program(program);
            let linked = gl.get_program_link_status(program);
            gl.detach_shader(program, vertex);
            gl.detach_shader(program, fragment);
            gl.delete_shader(vertex);
            gl.delete_shader(fragment);

            if !linked {
                let log = gl.get_program_info_log(program);
                gl.delete_program(program);
                return Err(GpuError::ShaderLinkage(format!("link failed: {}", log.trim())));
            }

            let position = POSITION_ATTRIBUTES
                .iter()
                .find_map(|name| gl.get_attrib_location(program, name));
            let texcoord = gl.get_attrib_location(program, TEXCOORD_ATTRIBUTE);
            let (Some(position), Some(texcoord)) = (position, texcoord) else {
                gl.delete_program(program);
                return Err(GpuError::ShaderLinkage(format!(
                    "missing vertex attribute (aPosition/a_position: {:?}, {}: {:?})",
                    position, TEXCOORD_ATTRIBUTE, texcoord
                )));
            };

            check_gl(gl, "link program")?;
            trace!("Linked program {:?}", program);

            Ok(Self {
                program,
                position,
                texcoord,
                uniforms: UniformRegistry::new(),
            })
        }
    }

    /// Resolve and cache a uniform that must exist. Missing is `ShaderLinkage`.
    pub fn register_uniform(&mut self, gl: &glow::Context, name: &str, kind: UniformKind) -> Result<(), GpuError> {
        if self.register_optional_uniform(gl, name, kind) {
            Ok(())
        } else {
            Err(GpuError::ShaderLinkage(format!("uniform {} not found", name)))
        }
    }

    /// Resolve and cache a uniform the shader may leave out. Returns whether it exists.
    pub fn register_optional_uniform(&mut self, gl: &glow::Context, name: &str, kind: UniformKind) -> bool {
        if self.uniforms.kind(name) == Some(kind) {
            return true;
        }
        match unsafe { gl.get_uniform_location(self.program, name) } {
            Some(location) => {
                self.uniforms.insert(name, kind, location);
                true
            }
            None => false,
        }
    }

    /// Kind the linked program declares for `name`, if it is an active uniform.
    pub fn declared_uniform_kind(&self, gl: &glow::Context, name: &str) -> Option<UniformKind> {
        unsafe {
            (0..gl.get_active_uniforms(self.program))
                .filter_map(|index| gl.get_active_uniform(self.program, index))
                .find(|active| active.name == name)
                .and_then(|active| UniformKind::from_gl_type(active.utype))
        }
    }

    pub fn uniform_kind(&self, name: &str) -> Option<UniformKind> {
        self.uniforms.kind(name)
    }

    /// Upload a value. Unregistered names are ignored.
    ///
    /// The program must be bound (`use_program`).
    pub fn set_uniform(&mut self, gl: &glow::Context, name: &str, value: UniformValue) {
        let Some(location) = self.uniforms.set(name, value) else {
            return;
        };
        let loc = Some(location);
        unsafe {
            match value {
                UniformValue::Int(v) => gl.uniform_1_i32(loc, v),
                UniformValue::Float(v) => gl.uniform_1_f32(loc, v),
                UniformValue::Vec2([x, y]) => gl.uniform_2_f32(loc, x, y),
                UniformValue::Vec3([x, y, z]) => gl.uniform_3_f32(loc, x, y, z),
                UniformValue::Vec4([x, y, z, w]) => gl.uniform_4_f32(loc, x, y, z, w),
                UniformValue::Mat4(m) => gl.uniform_matrix_4_f32_slice(loc, false, &m),
            }
        }
    }

    /// Last value uploaded for `name`.
    pub fn uniform(&self, name: &str) -> Option<UniformValue> {
        self.uniforms.get(name)
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.uniforms.contains(name)
    }

    pub fn use_program(&self, gl: &glow::Context) {
        unsafe { gl.use_program(Some(self.program)) };
    }

    pub fn position_attribute(&self) -> u32 {
        self.position
    }

    pub fn texcoord_attribute(&self) -> u32 {
        self.texcoord
    }

    pub fn destroy(self, gl: &glow::Context) {
        unsafe { gl.delete_program(self.program) };
    }
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("program", &self.program)
            .field("uniforms", &self.uniforms.names().collect::<Vec<_>>())
            .finish()
    }
}

unsafe fn compile_stage(gl: &glow::Context, stage: u32, source: &str) -> Result<glow::Shader, GpuError> {
    let stage_name = if stage == glow::VERTEX_SHADER { "vertex" } else { "fragment" };
    unsafe {
        let shader = gl
            .create_shader(stage)
            .map_err(|e| GpuError::Resource(format!("glCreateShader({}): {}", stage_name, e)))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        let compiled = gl.get_shader_compile_status(shader);
        let log = gl.get_shader_info_log(shader);
        if !compiled || !log.trim().is_empty() {
            gl.delete_shader(shader);
            let log = if log.trim().is_empty() {
                format!("{} shader failed to compile", stage_name)
            } else {
                format!("{} shader: {}", stage_name, log.trim())
            };
            return Err(GpuError::ShaderSyntax { log });
        }
        Ok(shader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_set_is_noop() {
        let mut registry: UniformRegistry<u32> = UniformRegistry::new();
        assert!(registry.set("f_time", UniformValue::Float(0.5)).is_none());
        assert!(registry.get("f_time").is_none());
    }

    #[test]
    fn test_set_returns_location_and_records_value() {
        let mut registry = UniformRegistry::new();
        registry.insert("vResolution", UniformKind::Vec2, 7u32);
        assert_eq!(registry.set("vResolution", UniformValue::Vec2([640.0, 360.0])), Some(&7));
        assert_eq!(registry.get("vResolution"), Some(UniformValue::Vec2([640.0, 360.0])));
    }

    #[test]
    fn test_kind_mismatch_is_ignored() {
        let mut registry = UniformRegistry::new();
        registry.insert("iDrawMode", UniformKind::Int, 1u32);
        assert!(registry.set("iDrawMode", UniformValue::Float(1.0)).is_none());
        assert!(registry.get("iDrawMode").is_none());
    }

    #[test]
    fn test_int_widens_to_float_slot() {
        assert_eq!(UniformValue::Int(1).coerce(UniformKind::Float), Some(UniformValue::Float(1.0)));
        assert_eq!(UniformValue::Int(2).coerce(UniformKind::Sampler), Some(UniformValue::Int(2)));
        assert_eq!(UniformValue::Float(0.5).coerce(UniformKind::Float), Some(UniformValue::Float(0.5)));
        assert_eq!(UniformValue::Float(1.0).coerce(UniformKind::Int), None);
        assert_eq!(UniformValue::Vec2([1.0, 2.0]).coerce(UniformKind::Vec3), None);
    }

    #[test]
    fn test_json_int_reaches_float_uniform() {
        let value: UniformValue = serde_json::from_str("1").unwrap();
        assert_eq!(value, UniformValue::Int(1));
        let mut registry = UniformRegistry::new();
        registry.insert("uStrength", UniformKind::Float, 4u32);
        let coerced = value.coerce(UniformKind::Float).unwrap();
        assert_eq!(registry.set("uStrength", coerced), Some(&4));
        assert_eq!(registry.get("uStrength"), Some(UniformValue::Float(1.0)));
    }

    #[test]
    fn test_gl_type_to_kind() {
        assert_eq!(UniformKind::from_gl_type(glow::FLOAT), Some(UniformKind::Float));
        assert_eq!(UniformKind::from_gl_type(glow::BOOL), Some(UniformKind::Int));
        assert_eq!(UniformKind::from_gl_type(glow::SAMPLER_2D), Some(UniformKind::Sampler));
        assert_eq!(UniformKind::from_gl_type(glow::FLOAT_MAT3), None);
    }

    #[test]
    fn test_int_fits_sampler() {
        let mut registry = UniformRegistry::new();
        registry.insert("sTexture", UniformKind::Sampler, 3u32);
        assert_eq!(registry.set("sTexture", UniformValue::Int(0)), Some(&3));
    }

    #[test]
    fn test_reregister_keeps_single_entry() {
        let mut registry = UniformRegistry::new();
        assert!(registry.insert("uMVPMatrix", UniformKind::Mat4, 1u32));
        assert!(!registry.insert("uMVPMatrix", UniformKind::Mat4, 2u32));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["uMVPMatrix"]);
    }

    #[test]
    fn test_uniform_value_json_is_untagged() {
        let v: UniformValue = serde_json::from_str("[1.0, 0.5, 0.0]").unwrap();
        assert_eq!(v, UniformValue::Vec3([1.0, 0.5, 0.0]));
        let v: UniformValue = serde_json::from_str("0.25").unwrap();
        assert_eq!(v, UniformValue::Float(0.25));
    }
}

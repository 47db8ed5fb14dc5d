//! GPU side: EGL context, shader programs, framebuffers and the compositor.
//!
//! Every function taking a `&glow::Context` must run on the GL thread owned
//! by [`crate::core::queue::ExecutionQueue`] with the context current.

pub mod assets;
pub mod compositor;
pub mod context;
pub mod effect;
pub mod external;
pub mod framebuffer;
pub mod shader;

use glow::HasContext;
use thiserror::Error;

pub use compositor::{ChromaKey, FrameCompositor};
pub use context::{ColorMode, GraphicsContext, NativeWindow, RenderTarget};
pub use effect::{CropRect, EffectShader};
pub use external::{ExternalTexture, SurfaceFrame};
pub use framebuffer::{FrameBufferObject, FrameBufferPair, PingPong};
pub use shader::{ShaderProgram, UniformKind, UniformValue};

#[derive(Debug, Error)]
pub enum GpuError {
    /// Display, config, context or surface setup failed. Unrecoverable.
    #[error("graphics context init failed: {0}")]
    ContextInit(String),
    /// Compiler log of a shader stage. Recoverable: disable the layer.
    #[error("shader syntax error:\n{log}")]
    ShaderSyntax { log: String },
    /// Attribute/uniform contract between code and shader is broken.
    #[error("shader linkage error: {0}")]
    ShaderLinkage(String),
    /// Non-zero `glGetError` after a call.
    #[error("GL error 0x{code:04X} after {op}")]
    GlRuntime { op: &'static str, code: u32 },
    /// Buffer swap or presentation on the EGL surface failed.
    #[error("surface error: {0}")]
    Surface(String),
    /// Object creation failed or a framebuffer is incomplete.
    #[error("GL resource error: {0}")]
    Resource(String),
}

impl GpuError {
    /// Only shader syntax errors are recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, GpuError::ShaderSyntax { .. })
    }
}

/// Fail with `GlRuntime` if the GL error flag is set.
pub fn check_gl(gl: &glow::Context, op: &'static str) -> Result<(), GpuError> {
    let code = unsafe { gl.get_error() };
    if code == glow::NO_ERROR {
        Ok(())
    } else {
        Err(GpuError::GlRuntime { op, code })
    }
}

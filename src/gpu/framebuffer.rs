//! Offscreen render targets and ping-pong alternation.
//!
//! A composition stage reads the previous stage's color texture and writes
//! into the other framebuffer. `FrameBufferPair::ping_pong` flips which side
//! is which and hands out both handles; read and write never coincide.

use glow::HasContext;
use log::trace;

use super::context::ColorMode;
use super::{check_gl, GpuError};

/// Color texture + depth renderbuffer attached to one framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferObject {
    pub texture: glow::Texture,
    pub framebuffer: glow::Framebuffer,
    pub depth: glow::Renderbuffer,
    pub width: u32,
    pub height: u32,
}

impl FrameBufferObject {
    /// Allocate a `width`×`height` target (RGBA8, or RGB10_A2 for HDR).
    pub fn create(gl: &glow::Context, width: u32, height: u32, color_mode: ColorMode) -> Result<Self, GpuError> {
        let (internal, format, ty) = match color_mode {
            ColorMode::Sdr => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
            ColorMode::Hdr => (glow::RGB10_A2, glow::RGBA, glow::UNSIGNED_INT_2_10_10_10_REV),
        };
        let (w, h) = (width as i32, height as i32);

        unsafe {
            let texture = gl
                .create_texture()
                .map_err(|e| GpuError::Resource(format!("glGenTextures: {}", e)))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            gl.tex_image_2d(
                glow::TEXTURE_2D,
                0,
                internal as i32,
                w,
                h,
                0,
                format,
                ty,
                glow::PixelUnpackData::Slice(None),
            );

            let depth = match gl.create_renderbuffer() {
                Ok(rb) => rb,
                Err(e) => {
                    gl.delete_texture(texture);
                    return Err(GpuError::Resource(format!("glGenRenderbuffers: {}", e)));
                }
            };
            gl.bind_renderbuffer(glow::RENDERBUFFER, Some(depth));
            gl.renderbuffer_storage(glow::RENDERBUFFER, glow::DEPTH_COMPONENT16, w, h);

            let framebuffer = match gl.create_framebuffer() {
                Ok(fb) => fb,
                Err(e) => {
                    gl.delete_renderbuffer(depth);
                    gl.delete_texture(texture);
                    return Err(GpuError::Resource(format!("glGenFramebuffers: {}", e)));
                }
            };
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(framebuffer));
            gl.framebuffer_texture_2d(
                glow::FRAMEBUFFER,
                glow::COLOR_ATTACHMENT0,
                glow::TEXTURE_2D,
                Some(texture),
                0,
            );
            gl.framebuffer_renderbuffer(glow::FRAMEBUFFER, glow::DEPTH_ATTACHMENT, glow::RENDERBUFFER, Some(depth));

            let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
            gl.bind_framebuffer(glow::FRAMEBUFFER, None);
            gl.bind_renderbuffer(glow::RENDERBUFFER, None);
            gl.bind_texture(glow::TEXTURE_2D, None);

            let fbo = Self {
                texture,
                framebuffer,
                depth,
                width,
                height,
            };
            if status != glow::FRAMEBUFFER_COMPLETE {
                fbo.delete(gl);
                return Err(GpuError::Resource(format!("framebuffer incomplete: 0x{:04X}", status)));
            }
            check_gl(gl, "create framebuffer")?;
            Ok(fbo)
        }
    }

    pub fn delete(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_framebuffer(self.framebuffer);
            gl.delete_renderbuffer(self.depth);
            gl.delete_texture(self.texture);
        }
    }
}

/// Which side of a pair is written next.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    write: usize,
}

impl PingPong {
    /// Toggle sides. Returns `(read_index, write_index)`.
    pub fn flip(&mut self) -> (usize, usize) {
        self.write ^= 1;
        (self.write ^ 1, self.write)
    }

    pub fn write_index(&self) -> usize {
        self.write
    }
}

/// Handles for one composition stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTargets {
    /// Color texture of the previous stage's output.
    pub read_texture: glow::Texture,
    /// Framebuffer this stage renders into.
    pub write_framebuffer: glow::Framebuffer,
}

/// Two same-sized framebuffers used alternately.
#[derive(Debug)]
pub struct FrameBufferPair {
    objects: [FrameBufferObject; 2],
    state: PingPong,
}

impl FrameBufferPair {
    pub fn create(gl: &glow::Context, width: u32, height: u32, color_mode: ColorMode) -> Result<Self, GpuError> {
        let first = FrameBufferObject::create(gl, width, height, color_mode)?;
        let second = match FrameBufferObject::create(gl, width, height, color_mode) {
            Ok(fbo) => fbo,
            Err(e) => {
                first.delete(gl);
                return Err(e);
            }
        };
        trace!("FrameBufferPair {}x{} created", width, height);
        Ok(Self::from_objects([first, second]))
    }

    pub(crate) fn from_objects(objects: [FrameBufferObject; 2]) -> Self {
        Self {
            objects,
            state: PingPong::default(),
        }
    }

    /// Advance to the next stage.
    pub fn ping_pong(&mut self) -> StageTargets {
        let (read, write) = self.state.flip();
        StageTargets {
            read_texture: self.objects[read].texture,
            write_framebuffer: self.objects[write].framebuffer,
        }
    }

    /// Target currently being written.
    pub fn current_write(&self) -> &FrameBufferObject {
        &self.objects[self.state.write_index()]
    }

    /// Color texture attached to `framebuffer`, if it belongs to this pair.
    pub fn texture_of(&self, framebuffer: glow::Framebuffer) -> Option<glow::Texture> {
        self.objects
            .iter()
            .find(|o| o.framebuffer == framebuffer)
            .map(|o| o.texture)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.objects[0].width, self.objects[0].height)
    }

    pub fn delete(self, gl: &glow::Context) {
        for object in &self.objects {
            object.delete(gl);
        }
    }
}

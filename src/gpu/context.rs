//! EGL display/context/surface ownership.
//!
//! One `GraphicsContext` per GL worker thread. The context is made current on
//! the thread that initializes it and must only be used from that thread.
//!
//! # Color modes
//!
//! - `Sdr8`: 8-bit RGBA config
//! - `Hdr10`: 10-bit RGB + 2-bit alpha config with the BT.2020 HLG surface
//!   colour space. The extension is queried at runtime; if it is missing (or
//!   no 10-bit config exists) the context silently falls back to `Sdr8`.
//!   Check [`GraphicsContext::color_mode`] for the mode actually in use.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};

use khronos_egl as egl;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};

use super::GpuError;

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// `eglPresentationTimeANDROID(display, surface, nanoseconds)`
type PresentationTimeFn = unsafe extern "system" fn(*mut c_void, *mut c_void, i64) -> u32;

const EGL_OPENGL_ES3_BIT: egl::Int = 0x0040;
const EGL_GL_COLORSPACE_KHR: egl::Int = 0x309D;
const EGL_GL_COLORSPACE_BT2020_HLG_EXT: egl::Int = 0x3540;
const HLG_EXTENSION: &str = "EGL_EXT_gl_colorspace_bt2020_hlg";

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Output pixel format of the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    #[serde(alias = "sdr8")]
    Sdr,
    #[serde(alias = "hdr10")]
    Hdr,
}

/// Platform window handle (`EGLNativeWindowType`).
#[derive(Debug, Clone, Copy)]
pub struct NativeWindow(pub *mut c_void);

// SAFETY: the handle is only passed to eglCreateWindowSurface on the GL
// thread; this crate never dereferences it.
unsafe impl Send for NativeWindow {}

/// Where composed frames are presented.
#[derive(Debug, Clone, Copy)]
pub enum RenderTarget {
    /// Window surface bound to a platform output (display or encoder input).
    Window(NativeWindow),
    /// Pbuffer surface of a fixed size, for offscreen rendering and readback.
    Offscreen { width: u32, height: u32 },
}

struct EglState {
    instance: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
    presentation_time: Option<PresentationTimeFn>,
}

/// Owns the EGL display, context and surface plus the GL function table.
pub struct GraphicsContext {
    id: u64,
    color_mode: ColorMode,
    width: u32,
    height: u32,
    egl: Option<EglState>,
    gl: Option<glow::Context>,
}

impl GraphicsContext {
    /// Create display, config, GLES3 context and surface, and make them current.
    ///
    /// Any failure along the way is a `ContextInit` error.
    pub fn initialize(target: RenderTarget, requested: ColorMode) -> Result<Self, GpuError> {
        let instance = unsafe { EglInstance::load_required() }
            .map_err(|e| GpuError::ContextInit(format!("failed to load libEGL: {}", e)))?;

        let display = unsafe { instance.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| GpuError::ContextInit("eglGetDisplay returned no display".into()))?;
        let (major, minor) = instance
            .initialize(display)
            .map_err(|e| GpuError::ContextInit(format!("eglInitialize: {}", e)))?;
        debug!("EGL {}.{} initialized", major, minor);

        // From here on, tear the display down again on failure.
        let result = Self::create_on_display(&instance, display, target, requested);
        match result {
            Ok((context, surface, color_mode, config_desc)) => {
                let presentation_time = instance
                    .get_proc_address("eglPresentationTimeANDROID")
                    .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), PresentationTimeFn>(f) });

                let gl = unsafe {
                    glow::Context::from_loader_function(|name| {
                        instance
                            .get_proc_address(name)
                            .map_or(std::ptr::null(), |f| f as *const c_void)
                    })
                };

                let (width, height) = match target {
                    RenderTarget::Offscreen { width, height } => (width, height),
                    RenderTarget::Window(_) => match surface_size(&instance, display, surface) {
                        Ok(size) => size,
                        Err(e) => {
                            let _ = instance.make_current(display, None, None, None);
                            let _ = instance.destroy_surface(display, surface);
                            let _ = instance.destroy_context(display, context);
                            let _ = instance.terminate(display);
                            return Err(e);
                        }
                    },
                };

                let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
                info!(
                    "GraphicsContext #{} ready: {} ({}x{}, {:?})",
                    id, config_desc, width, height, color_mode
                );

                Ok(Self {
                    id,
                    color_mode,
                    width,
                    height,
                    egl: Some(EglState {
                        instance,
                        display,
                        context,
                        surface,
                        presentation_time,
                    }),
                    gl: Some(gl),
                })
            }
            Err(e) => {
                let _ = instance.terminate(display);
                Err(e)
            }
        }
    }

    fn create_on_display(
        instance: &EglInstance,
        display: egl::Display,
        target: RenderTarget,
        requested: ColorMode,
    ) -> Result<(egl::Context, egl::Surface, ColorMode, &'static str), GpuError> {
        let surface_bit = match target {
            RenderTarget::Window(_) => egl::WINDOW_BIT,
            RenderTarget::Offscreen { .. } => egl::PBUFFER_BIT,
        };

        let mut color_mode = requested;
        if color_mode == ColorMode::Hdr && !has_extension(instance, display, HLG_EXTENSION) {
            info!("{} not available, using SDR output", HLG_EXTENSION);
            color_mode = ColorMode::Sdr;
        }

        let mut config = None;
        if color_mode == ColorMode::Hdr {
            config = choose_config(instance, display, surface_bit, [10, 10, 10, 2])?;
            if config.is_none() {
                info!("No 10-bit EGL config, using SDR output");
                color_mode = ColorMode::Sdr;
            }
        }
        let (config, config_desc) = match config {
            Some(config) => (config, "RGBA1010102 + HLG"),
            None => (
                choose_config(instance, display, surface_bit, [8, 8, 8, 8])?
                    .ok_or_else(|| GpuError::ContextInit("no RGBA8888 GLES3 EGL config".into()))?,
                "RGBA8888",
            ),
        };

        instance
            .bind_api(egl::OPENGL_ES_API)
            .map_err(|e| GpuError::ContextInit(format!("eglBindAPI: {}", e)))?;
        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        let context = instance
            .create_context(display, config, None, &context_attribs)
            .map_err(|e| GpuError::ContextInit(format!("eglCreateContext: {}", e)))?;

        let mut surface_attribs: Vec<egl::Int> = Vec::with_capacity(7);
        if let RenderTarget::Offscreen { width, height } = target {
            surface_attribs.extend_from_slice(&[egl::WIDTH, width as egl::Int, egl::HEIGHT, height as egl::Int]);
        }
        if color_mode == ColorMode::Hdr {
            surface_attribs.extend_from_slice(&[EGL_GL_COLORSPACE_KHR, EGL_GL_COLORSPACE_BT2020_HLG_EXT]);
        }
        surface_attribs.push(egl::NONE);

        let surface = match target {
            RenderTarget::Window(window) => unsafe {
                instance.create_window_surface(display, config, window.0, Some(&surface_attribs))
            },
            RenderTarget::Offscreen { .. } => instance.create_pbuffer_surface(display, config, &surface_attribs),
        };
        let surface = match surface {
            Ok(surface) => surface,
            Err(e) => {
                let _ = instance.destroy_context(display, context);
                return Err(GpuError::ContextInit(format!("surface creation: {}", e)));
            }
        };

        if let Err(e) = instance.make_current(display, Some(surface), Some(surface), Some(context)) {
            let _ = instance.destroy_surface(display, surface);
            let _ = instance.destroy_context(display, context);
            return Err(GpuError::ContextInit(format!("eglMakeCurrent: {}", e)));
        }

        Ok((context, surface, color_mode, config_desc))
    }

    /// Process-unique id, used to tell which context a texture is attached to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Color mode actually in use (after any HDR fallback).
    pub fn color_mode(&self) -> ColorMode {
        self.color_mode
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_destroyed(&self) -> bool {
        self.egl.is_none()
    }

    /// GL function table. Fails after `destroy()`.
    pub fn gl(&self) -> Result<&glow::Context, GpuError> {
        self.gl
            .as_ref()
            .ok_or_else(|| GpuError::ContextInit("graphics context already destroyed".into()))
    }

    /// Bind context and surface to the calling thread.
    pub fn make_current(&self) -> Result<(), GpuError> {
        let state = self.state()?;
        state
            .instance
            .make_current(state.display, Some(state.surface), Some(state.surface), Some(state.context))
            .map_err(|e| GpuError::ContextInit(format!("eglMakeCurrent: {}", e)))
    }

    /// Timestamp the next swapped frame (used by encoder surfaces).
    pub fn set_presentation_time(&self, nanos: i64) -> Result<(), GpuError> {
        let state = self.state()?;
        match state.presentation_time {
            Some(f) => {
                let ok = unsafe { f(state.display.as_ptr(), state.surface.as_ptr(), nanos) };
                if ok == 0 {
                    warn!("eglPresentationTimeANDROID rejected {}ns", nanos);
                }
            }
            None => trace!("presentation time {}ns (no extension)", nanos),
        }
        Ok(())
    }

    /// Publish the back buffer. A failed swap is fatal.
    pub fn swap_buffers(&self) -> Result<(), GpuError> {
        let state = self.state()?;
        state
            .instance
            .swap_buffers(state.display, state.surface)
            .map_err(|e| GpuError::Surface(format!("eglSwapBuffers: {}", e)))
    }

    /// Release context, surface and display. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        let Some(state) = self.egl.take() else {
            return;
        };
        // GL objects die with the context; drop the function table first.
        self.gl = None;

        let EglState {
            instance,
            display,
            context,
            surface,
            ..
        } = state;
        if let Err(e) = instance.make_current(display, None, None, None) {
            warn!("eglMakeCurrent(none) failed: {}", e);
        }
        if let Err(e) = instance.destroy_surface(display, surface) {
            warn!("eglDestroySurface failed: {}", e);
        }
        if let Err(e) = instance.destroy_context(display, context) {
            warn!("eglDestroyContext failed: {}", e);
        }
        if let Err(e) = instance.release_thread() {
            warn!("eglReleaseThread failed: {}", e);
        }
        if let Err(e) = instance.terminate(display) {
            warn!("eglTerminate failed: {}", e);
        }
        debug!("GraphicsContext #{} destroyed", self.id);
    }

    fn state(&self) -> Result<&EglState, GpuError> {
        self.egl
            .as_ref()
            .ok_or_else(|| GpuError::ContextInit("graphics context already destroyed".into()))
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for GraphicsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsContext")
            .field("id", &self.id)
            .field("color_mode", &self.color_mode)
            .field("size", &(self.width, self.height))
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

/// Window surface size; a zero-sized surface is a setup failure.
fn surface_size(instance: &EglInstance, display: egl::Display, surface: egl::Surface) -> Result<(u32, u32), GpuError> {
    let query = |attribute, name| {
        instance
            .query_surface(display, surface, attribute)
            .map_err(|e| GpuError::ContextInit(format!("eglQuerySurface({}): {}", name, e)))
    };
    let width = query(egl::WIDTH, "EGL_WIDTH")?;
    let height = query(egl::HEIGHT, "EGL_HEIGHT")?;
    validate_surface_size(width, height)
}

fn validate_surface_size(width: egl::Int, height: egl::Int) -> Result<(u32, u32), GpuError> {
    if width <= 0 || height <= 0 {
        return Err(GpuError::ContextInit(format!("window surface is {}x{}", width, height)));
    }
    Ok((width as u32, height as u32))
}

fn has_extension(instance: &EglInstance, display: egl::Display, name: &str) -> bool {
    instance
        .query_string(Some(display), egl::EXTENSIONS)
        .map(|exts| exts.to_string_lossy().split_whitespace().any(|e| e == name))
        .unwrap_or(false)
}

fn choose_config(
    instance: &EglInstance,
    display: egl::Display,
    surface_bit: egl::Int,
    [r, g, b, a]: [egl::Int; 4],
) -> Result<Option<egl::Config>, GpuError> {
    let attribs = [
        egl::RED_SIZE,
        r,
        egl::GREEN_SIZE,
        g,
        egl::BLUE_SIZE,
        b,
        egl::ALPHA_SIZE,
        a,
        egl::RENDERABLE_TYPE,
        EGL_OPENGL_ES3_BIT,
        egl::SURFACE_TYPE,
        surface_bit,
        egl::NONE,
    ];
    instance
        .choose_first_config(display, &attribs)
        .map_err(|e| GpuError::ContextInit(format!("eglChooseConfig: {}", e)))
}

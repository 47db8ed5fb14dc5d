//! Decoder output surface.
//!
//! The decode side publishes RGBA frames from any thread; the GL side owns a
//! texture bound to one context at a time and latches the newest published
//! frame into it with `update_tex_image`. Attachment is per seek, not per
//! frame: a delivering seek marks the binding stale and the next draw
//! re-attaches.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use glam::Mat4;
use glow::HasContext;
use log::{debug, trace, warn};

use super::{check_gl, GpuError};

/// One decoded picture, RGBA8, top row first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceFrame {
    pub width: u32,
    pub height: u32,
    pub pts_us: i64,
    pub data: Vec<u8>,
}

impl SurfaceFrame {
    pub fn solid(width: u32, height: u32, pts_us: i64, rgba: [u8; 4]) -> Self {
        let data = rgba.repeat(width as usize * height as usize);
        Self {
            width,
            height,
            pts_us,
            data,
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = (y as usize * self.width as usize + x as usize) * 4;
        self.data.get(i..i + 4).map(|p| [p[0], p[1], p[2], p[3]])
    }
}

#[derive(Debug, Default)]
struct Pending {
    frame: Option<Arc<SurfaceFrame>>,
    available: bool,
    published: u64,
}

#[derive(Debug, Default)]
struct Binding {
    texture: Option<glow::Texture>,
    context: Option<u64>,
    stale: bool,
    current: Option<Arc<SurfaceFrame>>,
}

/// Producer/consumer texture shared between a video source and the compositor.
#[derive(Debug, Default)]
pub struct ExternalTexture {
    pending: Mutex<Pending>,
    frame_ready: Condvar,
    binding: Mutex<Binding>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ExternalTexture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ---- producer side ----

    /// Hand a rendered decoder output to the surface and wake waiters.
    pub fn publish(&self, frame: SurfaceFrame) {
        let mut pending = lock(&self.pending);
        trace!("ExternalTexture: publish pts={}us", frame.pts_us);
        pending.frame = Some(Arc::new(frame));
        pending.available = true;
        pending.published += 1;
        self.frame_ready.notify_all();
    }

    /// Frames published so far.
    pub fn published_count(&self) -> u64 {
        lock(&self.pending).published
    }

    /// Force re-attachment on the next draw.
    pub fn mark_for_reattach(&self) {
        lock(&self.binding).stale = true;
    }

    // ---- consumer side ----

    /// Wait up to `timeout` for an unlatched frame. Returns false on timeout.
    pub fn await_frame_available(&self, timeout: Duration) -> bool {
        let pending = lock(&self.pending);
        let (pending, _) = self
            .frame_ready
            .wait_timeout_while(pending, timeout, |p| !p.available)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.available
    }

    /// Whether `context` must (re)attach before sampling.
    pub fn needs_attach(&self, context: u64) -> bool {
        let binding = lock(&self.binding);
        binding.stale || binding.texture.is_none() || binding.context != Some(context)
    }

    /// Create the texture in `context` and upload the retained frame, if any.
    ///
    /// A binding still held by another context is dropped without deleting
    /// its texture, since that needs the other context current.
    pub fn attach(&self, gl: &glow::Context, context: u64) -> Result<(), GpuError> {
        let mut binding = lock(&self.binding);
        if let Some(texture) = binding.texture.take() {
            if binding.context == Some(context) {
                unsafe { gl.delete_texture(texture) };
            } else {
                warn!(
                    "ExternalTexture: abandoning texture of context {:?} while attaching to {}",
                    binding.context, context
                );
            }
        }

        let texture = unsafe {
            let texture = gl
                .create_texture()
                .map_err(|e| GpuError::Resource(format!("glGenTextures: {}", e)))?;
            gl.bind_texture(glow::TEXTURE_2D, Some(texture));
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
            gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
            texture
        };
        binding.texture = Some(texture);
        binding.context = Some(context);
        binding.stale = false;
        if let Some(frame) = binding.current.clone() {
            upload(gl, texture, &frame)?;
        }
        unsafe { gl.bind_texture(glow::TEXTURE_2D, None) };
        check_gl(gl, "attach external texture")?;
        debug!("ExternalTexture: attached to context {}", context);
        Ok(())
    }

    /// Delete the texture if it belongs to `context`. Returns whether it did.
    pub fn detach(&self, gl: &glow::Context, context: u64) -> bool {
        let mut binding = lock(&self.binding);
        if binding.context != Some(context) {
            return false;
        }
        if let Some(texture) = binding.texture.take() {
            unsafe { gl.delete_texture(texture) };
        }
        binding.context = None;
        debug!("ExternalTexture: detached from context {}", context);
        true
    }

    /// Latch the newest published frame into the texture.
    ///
    /// Returns the latched frame's pts, or None when nothing new was published.
    pub fn update_tex_image(&self, gl: &glow::Context) -> Result<Option<i64>, GpuError> {
        let frame = {
            let mut pending = lock(&self.pending);
            pending.available = false;
            pending.frame.take()
        };
        let Some(frame) = frame else {
            return Ok(None);
        };

        let mut binding = lock(&self.binding);
        if let Some(texture) = binding.texture {
            upload(gl, texture, &frame)?;
            unsafe { gl.bind_texture(glow::TEXTURE_2D, None) };
        }
        let pts = frame.pts_us;
        binding.current = Some(frame);
        Ok(Some(pts))
    }

    pub fn texture(&self) -> Option<glow::Texture> {
        lock(&self.binding).texture
    }

    /// Frame currently latched (what a draw would show).
    pub fn current_frame(&self) -> Option<Arc<SurfaceFrame>> {
        lock(&self.binding).current.clone()
    }

    /// Newest frame, latched or not.
    pub fn latest_frame(&self) -> Option<Arc<SurfaceFrame>> {
        let pending = lock(&self.pending).frame.clone();
        pending.or_else(|| self.current_frame())
    }

    /// Texture-coordinate transform: frames are stored top row first, so V is flipped.
    pub fn transform_matrix(&self) -> Mat4 {
        Mat4::from_translation(glam::Vec3::new(0.0, 1.0, 0.0)) * Mat4::from_scale(glam::Vec3::new(1.0, -1.0, 1.0))
    }
}

/// Byte length of an RGBA8 frame.
fn frame_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

fn upload(gl: &glow::Context, texture: glow::Texture, frame: &SurfaceFrame) -> Result<(), GpuError> {
    let expected = frame_len(frame.width, frame.height);
    if frame.data.len() != expected {
        return Err(GpuError::Resource(format!(
            "frame pts={} has {} bytes, expected {}",
            frame.pts_us,
            frame.data.len(),
            expected
        )));
    }
    unsafe {
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
        gl.tex_image_2d(
            glow::TEXTURE_2D,
            0,
            glow::RGBA8 as i32,
            frame.width as i32,
            frame.height as i32,
            0,
            glow::RGBA,
            glow::UNSIGNED_BYTE,
            glow::PixelUnpackData::Slice(Some(&frame.data)),
        );
    }
    check_gl(gl, "upload external frame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_await_times_out_without_frame() {
        let surface = ExternalTexture::new();
        let start = Instant::now();
        assert!(!surface.await_frame_available(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_publish_from_other_thread_wakes_waiter() {
        let surface = ExternalTexture::new();
        let producer = Arc::clone(&surface);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            producer.publish(SurfaceFrame::solid(2, 2, 40_000, [0, 255, 0, 255]));
        });
        assert!(surface.await_frame_available(Duration::from_secs(5)));
        handle.join().unwrap();
        assert_eq!(surface.published_count(), 1);
        assert_eq!(surface.latest_frame().unwrap().pts_us, 40_000);
    }

    #[test]
    fn test_needs_attach_until_bound() {
        let surface = ExternalTexture::new();
        assert!(surface.needs_attach(1));
        assert!(surface.texture().is_none());
        surface.mark_for_reattach();
        assert!(surface.needs_attach(1));
    }

    #[test]
    fn test_transform_flips_v() {
        let surface = ExternalTexture::new();
        let m = surface.transform_matrix();
        let top = m * glam::Vec4::new(0.25, 1.0, 0.0, 1.0);
        let bottom = m * glam::Vec4::new(0.25, 0.0, 0.0, 1.0);
        assert_eq!((top.x, top.y), (0.25, 0.0));
        assert_eq!((bottom.x, bottom.y), (0.25, 1.0));
    }

    #[test]
    fn test_frame_len_does_not_wrap() {
        // 32768 x 32768 x 4 is 2^32, which wraps to 0 in u32
        assert_eq!(frame_len(32_768, 32_768), 1usize << 32);
        assert_eq!(frame_len(1920, 1080), 1920 * 1080 * 4);
        assert_ne!(frame_len(65_536, 65_536), 0);
    }

    #[test]
    fn test_frame_pixel_far_corner() {
        let frame = SurfaceFrame::solid(4096, 2, 0, [9, 8, 7, 6]);
        assert_eq!(frame.data.len(), frame_len(4096, 2));
        assert_eq!(frame.pixel(4095, 1), Some([9, 8, 7, 6]));
    }

    #[test]
    fn test_frame_pixel() {
        let frame = SurfaceFrame::solid(3, 2, 0, [1, 2, 3, 4]);
        assert_eq!(frame.pixel(2, 1), Some([1, 2, 3, 4]));
        assert_eq!(frame.pixel(3, 0), None);
    }
}

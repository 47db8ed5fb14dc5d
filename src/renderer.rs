//! Per-frame orchestration: decode pool for seeks, GL queue for drawing.
//!
//! `render_frame(t)`:
//! 1. release video layers that left the visible set, prepare the ones that entered
//! 2. seek every visible video layer in parallel on the decode pool
//! 3. one GL task: prepare_draw, layers bottom-up, effects, finish, readback,
//!    presentation time, swap

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use glam::Mat4;
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use uuid::Uuid;

use crate::bitmap::Bitmap;
use crate::core::{ExecutionQueue, Workers};
use crate::error::{Error, Result};
use crate::gpu::assets::ShaderLibrary;
use crate::gpu::effect::EffectParams;
use crate::gpu::{
    ChromaKey, CropRect, EffectShader, ExternalTexture, FrameCompositor, GpuError, GraphicsContext, RenderTarget,
    UniformValue,
};
use crate::settings::RenderSettings;
use crate::timeline::{LayerKind, Timeline};
use crate::video::timestamp::ms_to_ns;
use crate::video::{DecodeOptions, FfmpegBackend, MediaBackend, SeekResult, VideoFrameSource};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---- video layers ----

struct VideoSlot {
    path: PathBuf,
    source: Arc<Mutex<VideoFrameSource>>,
}

/// Open decoders of the currently visible video layers, keyed by layer id.
pub(crate) struct VideoLayers {
    backend: Arc<dyn MediaBackend>,
    options: DecodeOptions,
    slots: HashMap<Uuid, VideoSlot>,
}

impl VideoLayers {
    pub(crate) fn new(backend: Arc<dyn MediaBackend>, options: DecodeOptions) -> Self {
        Self {
            backend,
            options,
            slots: HashMap::new(),
        }
    }

    /// Release layers not in `visible`.
    ///
    /// Returns the surfaces of released layers; their textures must be
    /// detached on the GL thread.
    pub(crate) fn release_hidden(&mut self, visible: &[(Uuid, &Path)]) -> Vec<Arc<ExternalTexture>> {
        let keep: HashSet<Uuid> = visible.iter().map(|(id, _)| *id).collect();
        let leaving: Vec<Uuid> = self.slots.keys().filter(|id| !keep.contains(id)).copied().collect();
        let mut released = Vec::with_capacity(leaving.len());
        for id in leaving {
            if let Some(slot) = self.slots.remove(&id) {
                released.push(Self::release(slot));
                debug!("Video layer {} left the visible range", id);
            }
        }
        released
    }

    /// Open decoders for layers of `visible` that have none yet.
    pub(crate) fn prepare_visible(&mut self, visible: &[(Uuid, &Path)]) -> Result<()> {
        for (id, path) in visible {
            if self.slots.contains_key(id) {
                continue;
            }
            let mut source = VideoFrameSource::new(ExternalTexture::new(), self.options);
            source.prepare(self.backend.as_ref(), path)?;
            debug!("Video layer {} prepared: {}", id, path.display());
            self.slots.insert(
                *id,
                VideoSlot {
                    path: path.to_path_buf(),
                    source: Arc::new(Mutex::new(source)),
                },
            );
        }
        Ok(())
    }

    fn release(slot: VideoSlot) -> Arc<ExternalTexture> {
        let mut source = lock(&slot.source);
        source.destroy();
        trace!("Released decoder for {}", slot.path.display());
        Arc::clone(source.external_texture())
    }

    /// Seek every requested layer on the pool, results in request order.
    pub(crate) fn seek_all(&self, workers: &Workers, requests: &[(Uuid, i64)]) -> Result<Vec<(Uuid, SeekResult)>> {
        let jobs = requests
            .iter()
            .map(|(id, t_ms)| {
                let slot = self
                    .slots
                    .get(id)
                    .ok_or_else(|| Error::Timeline(format!("video layer {} is not prepared", id)))?;
                Ok((*id, Arc::clone(&slot.source), *t_ms))
            })
            .collect::<Result<Vec<_>>>()?;

        let results = workers.map(jobs, |(id, source, t_ms)| {
            let outcome = lock(&source).seek_to(t_ms);
            (id, outcome)
        })?;
        results
            .into_iter()
            .map(|(id, outcome)| Ok((id, outcome?)))
            .collect()
    }

    pub(crate) fn texture(&self, id: &Uuid) -> Option<Arc<ExternalTexture>> {
        self.slots
            .get(id)
            .map(|slot| Arc::clone(lock(&slot.source).external_texture()))
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Release everything (renderer shutdown).
    pub(crate) fn release_all(&mut self) -> Vec<Arc<ExternalTexture>> {
        self.slots.drain().map(|(_, slot)| Self::release(slot)).collect()
    }
}

// ---- frame plan ----

/// One draw step of a frame, in composition order.
#[derive(Debug, Clone)]
pub(crate) enum DrawOp {
    Canvas {
        bitmap: Arc<Bitmap>,
        mvp: Mat4,
    },
    Video {
        texture: Arc<ExternalTexture>,
        mvp: Mat4,
        chroma_key: Option<ChromaKey>,
        /// Zero when the seek published nothing new.
        wait: Duration,
    },
    Effect {
        shader: String,
        crop: CropRect,
        progress: f32,
        uniforms: IndexMap<String, UniformValue>,
    },
}

/// Turn the visible layers at `t_ms` into draw steps.
pub(crate) fn plan_frame(
    timeline: &Timeline,
    t_ms: i64,
    videos: &VideoLayers,
    seeks: &HashMap<Uuid, SeekResult>,
    images: &HashMap<Uuid, Arc<Bitmap>>,
    frame_wait: Duration,
) -> Vec<DrawOp> {
    let mut ops = Vec::new();
    for layer in timeline.visible_at(t_ms) {
        let mvp = layer.transform.mvp(timeline.width, timeline.height);
        match &layer.kind {
            LayerKind::Color { rgba } => ops.push(DrawOp::Canvas {
                bitmap: Arc::new(Bitmap::solid(1, 1, *rgba)),
                mvp,
            }),
            LayerKind::Image { .. } => {
                if let Some(bitmap) = images.get(&layer.id) {
                    ops.push(DrawOp::Canvas {
                        bitmap: Arc::clone(bitmap),
                        mvp,
                    });
                }
            }
            LayerKind::Video { chroma_key, .. } => {
                let Some(texture) = videos.texture(&layer.id) else {
                    continue;
                };
                let wait = match seeks.get(&layer.id) {
                    Some(SeekResult::Delivered { .. }) => frame_wait,
                    _ => Duration::ZERO,
                };
                ops.push(DrawOp::Video {
                    texture,
                    mvp,
                    chroma_key: *chroma_key,
                    wait,
                });
            }
            LayerKind::Effect { shader, crop, uniforms } => ops.push(DrawOp::Effect {
                shader: shader.clone(),
                crop: *crop,
                progress: layer.progress(t_ms),
                uniforms: uniforms.clone(),
            }),
        }
    }
    ops
}

// ---- GL thread ----

struct GlState {
    context: GraphicsContext,
    compositor: FrameCompositor,
    library: ShaderLibrary,
    effects: HashMap<String, EffectShader>,
    disabled: HashSet<String>,
}

impl GlState {
    fn new(target: RenderTarget, settings: &RenderSettings, library: ShaderLibrary) -> Result<Self> {
        let context = GraphicsContext::initialize(target, settings.color_mode)?;
        let (width, height) = context.size();
        let compositor = FrameCompositor::new(context.gl()?, context.id(), width, height, context.color_mode())?;
        Ok(Self {
            context,
            compositor,
            library,
            effects: HashMap::new(),
            disabled: HashSet::new(),
        })
    }

    /// Compile `reference` on first use. None when it is (now) disabled.
    fn effect(&mut self, reference: &str) -> Result<Option<&mut EffectShader>> {
        if self.disabled.contains(reference) {
            return Ok(None);
        }
        if !self.effects.contains_key(reference) {
            let Some(source) = self.library.resolve(reference) else {
                warn!("Effect '{}' not found, layer disabled", reference);
                self.disabled.insert(reference.to_string());
                return Ok(None);
            };
            match EffectShader::compile(self.context.gl()?, reference, &source) {
                Ok(effect) => {
                    self.effects.insert(reference.to_string(), effect);
                }
                Err(e @ GpuError::ShaderSyntax { .. }) => {
                    warn!("Effect '{}' disabled: {}", reference, e);
                    self.disabled.insert(reference.to_string());
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.effects.get_mut(reference))
    }

    fn compose(&mut self, ops: &[DrawOp], t_ms: i64, readback: bool) -> Result<Option<Bitmap>> {
        for op in ops {
            if let DrawOp::Effect { shader, .. } = op {
                self.effect(shader)?;
            }
        }

        let gl = self.context.gl()?;
        self.compositor.prepare_draw(gl)?;
        for op in ops {
            match op {
                DrawOp::Canvas { bitmap, mvp } => self.compositor.draw_canvas_layer(gl, bitmap, mvp)?,
                DrawOp::Video {
                    texture,
                    mvp,
                    chroma_key,
                    wait,
                } => {
                    let drawn = self
                        .compositor
                        .draw_external_texture(gl, texture, mvp, chroma_key.as_ref(), *wait)?;
                    if !drawn {
                        trace!("Video layer has no frame at {}ms", t_ms);
                    }
                }
                DrawOp::Effect {
                    shader,
                    crop,
                    progress,
                    uniforms,
                } => {
                    let Some(effect) = self.effects.get_mut(shader) else {
                        continue;
                    };
                    let params = EffectParams {
                        crop: *crop,
                        progress: *progress,
                        custom: Some(uniforms),
                    };
                    self.compositor.apply_effect(gl, effect, &params)?;
                }
            }
        }
        self.compositor.finish(gl)?;

        let bitmap = if readback {
            Some(self.compositor.read_pixels(gl)?)
        } else {
            None
        };
        self.context.set_presentation_time(ms_to_ns(t_ms))?;
        self.context.swap_buffers()?;
        Ok(bitmap)
    }

    fn detach_all(&self, textures: &[Arc<ExternalTexture>]) {
        let Ok(gl) = self.context.gl() else {
            return;
        };
        for texture in textures {
            texture.detach(gl, self.context.id());
        }
    }

    fn teardown(&mut self, textures: &[Arc<ExternalTexture>]) {
        if let Ok(gl) = self.context.gl() {
            for texture in textures {
                texture.detach(gl, self.context.id());
            }
            for (_, effect) in self.effects.drain() {
                effect.destroy(gl);
            }
            self.compositor.destroy(gl);
        }
        self.context.destroy();
    }
}

// ---- renderer ----

/// Renders a [`Timeline`] frame by frame into a window or offscreen surface.
pub struct Renderer {
    timeline: Timeline,
    gl: ExecutionQueue<GlState>,
    workers: Workers,
    videos: VideoLayers,
    images: HashMap<Uuid, Arc<Bitmap>>,
    frame_wait: Duration,
}

impl Renderer {
    pub fn new(settings: &RenderSettings, timeline: Timeline, target: RenderTarget) -> Result<Self> {
        let backend = Arc::new(FfmpegBackend::new(settings.max_decoders));
        Self::with_backend(settings, timeline, target, backend)
    }

    /// Like `new`, with a custom media backend.
    pub fn with_backend(
        settings: &RenderSettings,
        timeline: Timeline,
        target: RenderTarget,
        backend: Arc<dyn MediaBackend>,
    ) -> Result<Self> {
        timeline.validate()?;
        let library = ShaderLibrary::with_directory(settings.shader_dir.as_deref());
        let gl_settings = settings.clone();
        let gl = ExecutionQueue::spawn("gl", move || GlState::new(target, &gl_settings, library))?;
        info!(
            "Renderer ready: {}x{} @ {}fps, {} layer(s), {} decode thread(s)",
            timeline.width,
            timeline.height,
            timeline.frame_rate,
            timeline.layers.len(),
            settings.worker_threads
        );
        Ok(Self {
            timeline,
            gl,
            workers: Workers::new(settings.worker_threads),
            videos: VideoLayers::new(backend, settings.decode_options()),
            images: HashMap::new(),
            frame_wait: settings.frame_wait_timeout(),
        })
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Compose and present the frame at `t_ms`.
    pub fn render_frame(&mut self, t_ms: i64) -> Result<()> {
        self.render(t_ms, false).map(|_| ())
    }

    /// Compose and present the frame at `t_ms`, returning its pixels.
    pub fn render_frame_to_bitmap(&mut self, t_ms: i64) -> Result<Bitmap> {
        self.render(t_ms, true)?
            .ok_or_else(|| Error::Image("readback produced no image".into()))
    }

    fn render(&mut self, t_ms: i64, readback: bool) -> Result<Option<Bitmap>> {
        if self.gl.is_closed() {
            return Err(Error::QueueClosed);
        }
        trace!("render_frame {}ms", t_ms);

        let mut visible = Vec::new();
        let mut requests = Vec::new();
        for layer in self.timeline.visible_at(t_ms) {
            match &layer.kind {
                LayerKind::Video { path, .. } => {
                    visible.push((layer.id, path.as_path()));
                    requests.push((layer.id, layer.local_time_ms(t_ms)));
                }
                LayerKind::Image { path } if !self.images.contains_key(&layer.id) => {
                    let bitmap = Bitmap::load(path)?;
                    self.images.insert(layer.id, Arc::new(bitmap));
                }
                _ => {}
            }
        }

        // Leavers before joiners.
        let released = self.videos.release_hidden(&visible);
        if !released.is_empty() {
            self.gl.run(move |state| {
                state.detach_all(&released);
                Ok(())
            })?;
        }
        self.videos.prepare_visible(&visible)?;
        trace!("{} decoder(s) open", self.videos.len());

        let seeks: HashMap<Uuid, SeekResult> = self.videos.seek_all(&self.workers, &requests)?.into_iter().collect();
        let ops = plan_frame(&self.timeline, t_ms, &self.videos, &seeks, &self.images, self.frame_wait);
        self.gl.run(move |state| state.compose(&ops, t_ms, readback))
    }

    /// Tear down decoders, GL objects and the context. Safe to call twice.
    pub fn close(&mut self) -> Result<()> {
        if self.gl.is_closed() {
            return Ok(());
        }
        let textures = self.videos.release_all();
        self.images.clear();
        self.gl.close_with(move |state| state.teardown(&textures))
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Renderer close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::Layer;
    use crate::video::media::mock::{MockBackend, MockVideo};

    fn video_layer(start_ms: i64, end_ms: i64, path: &str) -> Layer {
        Layer::new(
            start_ms,
            end_ms,
            LayerKind::Video {
                path: path.into(),
                trim_in_ms: 0,
                chroma_key: None,
            },
        )
    }

    fn sync(videos: &mut VideoLayers, visible: &[(Uuid, &Path)]) -> Vec<Arc<ExternalTexture>> {
        let released = videos.release_hidden(visible);
        videos.prepare_visible(visible).unwrap();
        released
    }

    fn mock_layers() -> (VideoLayers, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(MockVideo::three_colors()));
        let layers = VideoLayers::new(backend.clone(), DecodeOptions::default());
        (layers, backend)
    }

    #[test]
    fn test_sync_prepares_and_releases() {
        let (mut videos, backend) = mock_layers();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let released = sync(&mut videos, &[(a, Path::new("a.mp4")), (b, Path::new("b.mp4"))]);
        assert!(released.is_empty());
        assert_eq!(videos.len(), 2);
        assert_eq!(backend.budget.in_use(), 2);

        let released = sync(&mut videos, &[(b, Path::new("b.mp4"))]);
        assert_eq!(released.len(), 1);
        assert_eq!(videos.len(), 1);
        assert_eq!(backend.budget.in_use(), 1);
        assert!(videos.texture(&a).is_none());
        assert!(videos.texture(&b).is_some());
    }

    #[test]
    fn test_sync_propagates_decoder_init_failure() {
        let backend = Arc::new(MockBackend {
            budget: crate::video::media::DecoderBudget::new(1),
            ..MockBackend::new(MockVideo::three_colors())
        });
        let mut videos = VideoLayers::new(backend, DecodeOptions::default());
        let err = videos
            .prepare_visible(&[(Uuid::new_v4(), Path::new("a.mp4")), (Uuid::new_v4(), Path::new("b.mp4"))])
            .unwrap_err();
        assert!(matches!(err, Error::Video(crate::video::VideoError::DecoderInit(_))));
    }

    #[test]
    fn test_leavers_are_released_when_a_joiner_fails() {
        let backend = Arc::new(MockBackend {
            budget: crate::video::media::DecoderBudget::new(1),
            ..MockBackend::new(MockVideo::three_colors())
        });
        let mut videos = VideoLayers::new(backend.clone(), DecodeOptions::default());
        let a = Uuid::new_v4();
        sync(&mut videos, &[(a, Path::new("a.mp4"))]);

        let next = [(Uuid::new_v4(), Path::new("b.mp4")), (Uuid::new_v4(), Path::new("c.mp4"))];
        let released = videos.release_hidden(&next);
        assert_eq!(released.len(), 1);
        assert_eq!(backend.budget.in_use(), 0);
        assert!(videos.prepare_visible(&next).is_err());
        assert!(videos.texture(&a).is_none());
    }

    #[test]
    fn test_parallel_seeks_publish_each_layer() {
        let (mut videos, _backend) = mock_layers();
        let workers = Workers::new(2);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let visible: Vec<(Uuid, &Path)> = ids.iter().map(|id| (*id, Path::new("clip.mp4"))).collect();
        sync(&mut videos, &visible);

        let requests = vec![(ids[0], 500), (ids[1], 1500), (ids[2], 2500)];
        let results = videos.seek_all(&workers, &requests).unwrap();
        assert_eq!(results.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        let expected = [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]];
        for (id, rgba) in ids.iter().zip(expected) {
            let frame = videos.texture(id).unwrap().latest_frame().unwrap();
            assert_eq!(frame.pixel(0, 0), Some(rgba));
        }
    }

    #[test]
    fn test_seek_of_unprepared_layer_fails() {
        let (videos, _backend) = mock_layers();
        let workers = Workers::new(1);
        assert!(videos.seek_all(&workers, &[(Uuid::new_v4(), 0)]).is_err());
    }

    #[test]
    fn test_plan_keeps_layer_order_and_waits_only_for_new_frames() {
        let (mut videos, _backend) = mock_layers();
        let video = video_layer(0, 3000, "clip.mp4");
        let effect = Layer::new(
            1000,
            3000,
            LayerKind::Effect {
                shader: "grayscale".into(),
                crop: CropRect::default(),
                uniforms: IndexMap::new(),
            },
        );
        let timeline = Timeline {
            width: 8,
            height: 4,
            frame_rate: 30.0,
            duration_ms: 3000,
            layers: vec![
                Layer::new(0, 3000, LayerKind::Color { rgba: [0, 0, 0, 255] }),
                video.clone(),
                effect,
            ],
        };
        sync(&mut videos, &[(video.id, Path::new("clip.mp4"))]);
        let wait = Duration::from_millis(500);

        let mut seeks = HashMap::new();
        seeks.insert(video.id, SeekResult::Delivered { pts_us: 0 });
        let ops = plan_frame(&timeline, 2000, &videos, &seeks, &HashMap::new(), wait);
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[0], DrawOp::Canvas { .. }));
        assert!(matches!(&ops[1], DrawOp::Video { wait: w, .. } if *w == wait));
        assert!(matches!(&ops[2], DrawOp::Effect { progress, .. } if (*progress - 0.5).abs() < 1e-6));

        seeks.insert(video.id, SeekResult::Reused { pts_us: 0 });
        let ops = plan_frame(&timeline, 500, &videos, &seeks, &HashMap::new(), wait);
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[1], DrawOp::Video { wait: w, .. } if w.is_zero()));
    }

    #[test]
    fn test_release_all_frees_budget() {
        let (mut videos, backend) = mock_layers();
        sync(&mut videos, &[(Uuid::new_v4(), Path::new("a.mp4"))]);
        assert_eq!(videos.release_all().len(), 1);
        assert_eq!(videos.len(), 0);
        assert_eq!(backend.budget.in_use(), 0);
    }
}

//! Keyframe-aware seek/decode state machine for one video layer.
//!
//! `seek_to` picks one of four paths:
//!
//! | request                                   | path                 |
//! |-------------------------------------------|----------------------|
//! | before the last delivered frame           | SeekingBackward      |
//! | inside the last delivered frame           | no-op, reuse         |
//! | later sync sample than the current one    | SeekingForwardFar    |
//! | otherwise                                 | SequentialDecode / SeekingForwardNear |
//!
//! A frame is delivered for target `t` when its display interval
//! `[pts, pts + frame duration)` reaches `t`, i.e. the first decoded frame with
//! `pts + frame_duration > t`. Frames before that are released unrendered.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use super::keyframes::KeyframeIndex;
use super::media::{DecoderOutput, MediaBackend, MediaSession, TrackFormat};
use super::timestamp::{frame_duration_us, ms_to_us};
use super::VideoError;
use crate::gpu::ExternalTexture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Uninitialized,
    Prepared,
    SequentialDecode,
    SeekingBackward,
    SeekingForwardNear,
    SeekingForwardFar,
    Released,
}

/// Outcome of a seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekResult {
    /// A new frame was published to the surface.
    Delivered { pts_us: i64 },
    /// The last delivered frame already covers the target. No I/O happened.
    Reused { pts_us: i64 },
    /// The stream ended before reaching the target.
    EndOfStream,
}

/// Poll limits of the decode loop.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub dequeue_timeout: Duration,
    pub max_stalled_polls: u32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            dequeue_timeout: Duration::from_millis(10),
            max_stalled_polls: 500,
        }
    }
}

/// Path chosen for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeekPlan {
    Reuse { pts_us: i64 },
    Backward { sync_us: i64 },
    ForwardFar { sync_us: i64 },
    Sequential,
    ForwardNear,
    EndOfStream,
}

/// Decide how to reach `target_us`.
///
/// `last_delivered_us` is None before the first delivery, when the demuxer
/// sits at the stream start. `eos_target_us` is the request that ran into the
/// end of the stream, if the decoder is drained.
pub(crate) fn plan_seek(
    target_us: i64,
    last_delivered_us: Option<i64>,
    frame_us: i64,
    index: Option<&KeyframeIndex>,
    eos_target_us: Option<i64>,
) -> SeekPlan {
    let frame_us = frame_us.max(1);

    if let Some(last) = last_delivered_us {
        if target_us < last {
            let sync_us = index.map_or(target_us, |i| i.sync_at_or_before(target_us));
            return SeekPlan::Backward { sync_us };
        }
        if target_us < last + frame_us {
            return SeekPlan::Reuse { pts_us: last };
        }
    }

    if let Some(eos_target) = eos_target_us {
        if target_us >= eos_target {
            return SeekPlan::EndOfStream;
        }
        // Cursor is at the end of the stream: anything earlier is behind it
        let sync_us = index.map_or(target_us, |i| i.sync_at_or_before(target_us));
        return SeekPlan::Backward { sync_us };
    }

    if let Some(index) = index {
        let target_sync = index.sync_at_or_before(target_us);
        let current_sync = match last_delivered_us {
            Some(last) => index.sync_at_or_before(last),
            None => index.times_us()[0],
        };
        if target_sync > current_sync {
            return SeekPlan::ForwardFar { sync_us: target_sync };
        }
    }

    match last_delivered_us {
        Some(last) if target_us < last + 2 * frame_us => SeekPlan::Sequential,
        None if target_us < frame_us => SeekPlan::Sequential,
        _ => SeekPlan::ForwardNear,
    }
}

/// Work done by the last `seek_to`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekStats {
    pub samples_queued: u32,
    pub frames_decoded: u32,
    pub frames_dropped: u32,
    pub demuxer_seeks: u32,
}

/// One decoder + demuxer feeding an [`ExternalTexture`].
pub struct VideoFrameSource {
    state: SourceState,
    path: Option<PathBuf>,
    session: Option<MediaSession>,
    format: Option<TrackFormat>,
    index: Option<KeyframeIndex>,
    surface: Arc<ExternalTexture>,
    options: DecodeOptions,
    last_delivered_us: Option<i64>,
    last_requested_us: Option<i64>,
    input_eos: bool,
    eos_target_us: Option<i64>,
    stats: SeekStats,
}

impl VideoFrameSource {
    pub fn new(surface: Arc<ExternalTexture>, options: DecodeOptions) -> Self {
        Self {
            state: SourceState::Uninitialized,
            path: None,
            session: None,
            format: None,
            index: None,
            surface,
            options,
            last_delivered_us: None,
            last_requested_us: None,
            input_eos: false,
            eos_target_us: None,
            stats: SeekStats::default(),
        }
    }

    /// Open demuxer and decoder for `path` and build the keyframe index.
    ///
    /// Index failure is not an error: seeking falls back to sequential decode
    /// and demuxer reseeks. Also valid after `destroy` (re-prepare).
    pub fn prepare(&mut self, backend: &dyn MediaBackend, path: &Path) -> Result<(), VideoError> {
        self.destroy();
        let session = backend.open(path)?;
        let format = session.demuxer.format().clone();
        if format.width == 0 || format.height == 0 {
            return Err(VideoError::DecoderInit(format!(
                "{}: invalid frame size {}x{}",
                path.display(),
                format.width,
                format.height
            )));
        }
        self.index = backend.keyframe_index(path);
        debug!(
            "Prepared {} ({}x{} @ {:.3} fps, {}, keyframe index: {})",
            path.display(),
            format.width,
            format.height,
            format.frame_rate,
            format.codec,
            self.index.as_ref().map_or("none".to_string(), |i| format!("{} entries", i.len()))
        );
        self.session = Some(session);
        self.format = Some(format);
        self.path = Some(path.to_path_buf());
        self.last_delivered_us = None;
        self.last_requested_us = None;
        self.input_eos = false;
        self.eos_target_us = None;
        self.state = SourceState::Prepared;
        Ok(())
    }

    /// Bring the surface to the frame shown at `target_ms`.
    pub fn seek_to(&mut self, target_ms: i64) -> Result<SeekResult, VideoError> {
        match self.state {
            SourceState::Uninitialized => return Err(VideoError::NotPrepared),
            SourceState::Released => return Err(VideoError::Released),
            _ => {}
        }
        let target_us = ms_to_us(target_ms.max(0));
        let frame_us = self.format.as_ref().map_or(0, |f| frame_duration_us(f.frame_rate));
        let plan = plan_seek(
            target_us,
            self.last_delivered_us,
            frame_us,
            self.index.as_ref(),
            self.eos_target_us,
        );
        trace!("seek_to {}ms: {:?}", target_ms, plan);
        self.last_requested_us = Some(target_us);
        self.stats = SeekStats::default();

        let result = match plan {
            SeekPlan::Reuse { pts_us } => return Ok(SeekResult::Reused { pts_us }),
            SeekPlan::EndOfStream => return Ok(SeekResult::EndOfStream),
            SeekPlan::Backward { sync_us } => {
                self.state = SourceState::SeekingBackward;
                self.reposition(sync_us)?;
                self.decode_until(target_us, frame_us)
            }
            SeekPlan::ForwardFar { sync_us } => {
                self.state = SourceState::SeekingForwardFar;
                self.reposition(sync_us)?;
                self.decode_until(target_us, frame_us)
            }
            SeekPlan::Sequential => {
                self.state = SourceState::SequentialDecode;
                self.decode_until(target_us, frame_us)
            }
            SeekPlan::ForwardNear => {
                self.state = SourceState::SeekingForwardNear;
                self.decode_until(target_us, frame_us)
            }
        }?;

        debug!("seek_to {}ms ({:?}): {:?} {:?}", target_ms, self.state, result, self.stats);
        Ok(result)
    }

    /// Flush the decoder and move the demuxer to `sync_us`.
    fn reposition(&mut self, sync_us: i64) -> Result<(), VideoError> {
        let session = self.session.as_mut().ok_or(VideoError::NotPrepared)?;
        session.decoder.flush()?;
        session.demuxer.seek_to_sync(sync_us)?;
        self.stats.demuxer_seeks += 1;
        self.input_eos = false;
        self.eos_target_us = None;
        Ok(())
    }

    fn decode_until(&mut self, target_us: i64, frame_us: i64) -> Result<SeekResult, VideoError> {
        let frame_us = frame_us.max(1);
        let session = self.session.as_mut().ok_or(VideoError::NotPrepared)?;
        let mut stalled: u32 = 0;

        loop {
            let mut progressed = false;

            if !self.input_eos {
                match session.demuxer.peek_sample()? {
                    Some(sample) => {
                        if session.decoder.queue_sample(sample)? {
                            session.demuxer.advance();
                            self.stats.samples_queued += 1;
                            progressed = true;
                        }
                    }
                    None => {
                        session.decoder.queue_end_of_stream()?;
                        self.input_eos = true;
                        progressed = true;
                    }
                }
            }

            // Only block when the input side had nothing to do
            let timeout = if progressed { Duration::ZERO } else { self.options.dequeue_timeout };
            match session.decoder.dequeue_output(timeout)? {
                DecoderOutput::Frame { pts_us } => {
                    self.stats.frames_decoded += 1;
                    if pts_us + frame_us.max(1) > target_us {
                        session.decoder.release_output(true, &self.surface)?;
                        self.surface.mark_for_reattach();
                        self.last_delivered_us = Some(pts_us);
                        return Ok(SeekResult::Delivered { pts_us });
                    }
                    session.decoder.release_output(false, &self.surface)?;
                    self.stats.frames_dropped += 1;
                    stalled = 0;
                }
                DecoderOutput::FormatChanged { width, height } => {
                    debug!("Decoder output format changed to {}x{}", width, height);
                    if let Some(format) = self.format.as_mut() {
                        format.width = width;
                        format.height = height;
                    }
                    stalled = 0;
                }
                DecoderOutput::EndOfStream => {
                    self.eos_target_us = Some(target_us);
                    debug!("End of stream before {}us", target_us);
                    return Ok(SeekResult::EndOfStream);
                }
                DecoderOutput::TryAgain => {
                    if progressed {
                        stalled = 0;
                    } else {
                        stalled += 1;
                        if stalled >= self.options.max_stalled_polls {
                            return Err(VideoError::DecoderStalled { polls: stalled });
                        }
                    }
                }
            }
        }
    }

    /// Release decoder and demuxer. Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(session) = self.session.take() {
            drop(session);
            debug!(
                "Released decoder for {}",
                self.path.as_deref().map_or("?".into(), |p| p.display().to_string())
            );
        }
        if self.state != SourceState::Uninitialized {
            self.state = SourceState::Released;
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn format(&self) -> Option<&TrackFormat> {
        self.format.as_ref()
    }

    pub fn keyframe_index(&self) -> Option<&KeyframeIndex> {
        self.index.as_ref()
    }

    pub fn external_texture(&self) -> &Arc<ExternalTexture> {
        &self.surface
    }

    pub fn last_delivered_us(&self) -> Option<i64> {
        self.last_delivered_us
    }

    pub fn last_requested_us(&self) -> Option<i64> {
        self.last_requested_us
    }

    /// Work done by the most recent seek.
    pub fn last_stats(&self) -> SeekStats {
        self.stats
    }
}

impl Drop for VideoFrameSource {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for VideoFrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrameSource")
            .field("state", &self.state)
            .field("path", &self.path)
            .field("last_delivered_us", &self.last_delivered_us)
            .finish()
    }
}

//! Demuxer / decoder seams and the FFmpeg implementation behind them.
//!
//! The seek engine only talks to [`Demuxer`] and [`FrameDecoder`]. Decoding is
//! a synchronous bounded poll: queue input while the decoder accepts it,
//! dequeue outputs with a timeout, and release each output either rendered
//! (published to the [`ExternalTexture`]) or dropped.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use playa_ffmpeg as ffmpeg;

use super::keyframes::KeyframeIndex;
use super::VideoError;
use crate::gpu::{ExternalTexture, SurfaceFrame};

/// Properties of the selected video track.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackFormat {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration_us: i64,
}

/// One compressed access unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    pub pts_us: i64,
    pub is_sync: bool,
    /// Timestamps in the container's own time base, handed back to the decoder.
    pub stream_pts: Option<i64>,
    pub stream_dts: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderOutput {
    /// A frame is ready; release it with `release_output`.
    Frame { pts_us: i64 },
    /// Nothing ready within the timeout.
    TryAgain,
    FormatChanged { width: u32, height: u32 },
    EndOfStream,
}

/// Sample cursor over the video track.
pub trait Demuxer: Send {
    fn format(&self) -> &TrackFormat;

    /// Sample under the cursor, None at end of track.
    fn peek_sample(&mut self) -> Result<Option<&EncodedSample>, VideoError>;

    /// Move past the current sample.
    fn advance(&mut self);

    /// Put the cursor on the last sync sample at or before `time_us`.
    fn seek_to_sync(&mut self, time_us: i64) -> Result<(), VideoError>;
}

pub trait FrameDecoder: Send {
    /// Submit one sample. False when the decoder cannot take input right now.
    fn queue_sample(&mut self, sample: &EncodedSample) -> Result<bool, VideoError>;

    fn queue_end_of_stream(&mut self) -> Result<(), VideoError>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<DecoderOutput, VideoError>;

    /// Hand back the last `Frame` output, publishing it to `surface` if `render`.
    fn release_output(&mut self, render: bool, surface: &ExternalTexture) -> Result<(), VideoError>;

    /// Drop all queued input and pending output.
    fn flush(&mut self) -> Result<(), VideoError>;
}

/// Demuxer + decoder opened together for one file.
pub struct MediaSession {
    pub demuxer: Box<dyn Demuxer>,
    pub decoder: Box<dyn FrameDecoder>,
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession").field("format", self.demuxer.format()).finish()
    }
}

pub trait MediaBackend: Send + Sync {
    fn open(&self, path: &Path) -> Result<MediaSession, VideoError>;

    /// Best-effort sparse keyframe index.
    fn keyframe_index(&self, path: &Path) -> Option<KeyframeIndex> {
        KeyframeIndex::build(path)
    }
}

// ---------------------------------------------------------------------------
// Decoder budget
// ---------------------------------------------------------------------------

/// Shared cap on concurrently open decoders.
#[derive(Debug, Clone)]
pub struct DecoderBudget {
    limit: usize,
    in_use: Arc<AtomicUsize>,
}

/// Held by an open decoder; returns its slot on drop.
#[derive(Debug)]
pub struct DecoderPermit {
    in_use: Arc<AtomicUsize>,
}

impl Drop for DecoderPermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

impl DecoderBudget {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Option<DecoderPermit> {
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
            .ok()
            .map(|_| DecoderPermit {
                in_use: Arc::clone(&self.in_use),
            })
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

// ---------------------------------------------------------------------------
// FFmpeg backend
// ---------------------------------------------------------------------------

static FFMPEG_INIT: Once = Once::new();

fn init_ffmpeg() {
    FFMPEG_INIT.call_once(|| {
        if let Err(e) = ffmpeg::init() {
            warn!("FFmpeg init failed: {}", e);
        }
        unsafe {
            // Silence FFmpeg's own stderr logging
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

/// Value wrapper for FFmpeg handles that lack a `Send` impl.
struct Unshared<T>(T);

// SAFETY: the wrapped handle is owned by exactly one demuxer/decoder and only
// used through `&mut self`; it is never aliased across threads.
unsafe impl<T> Send for Unshared<T> {}

const MICROS: ffmpeg::ffi::AVRational = ffmpeg::ffi::AVRational { num: 1, den: 1_000_000 };

fn av_rational(r: ffmpeg::Rational) -> ffmpeg::ffi::AVRational {
    ffmpeg::ffi::AVRational {
        num: r.numerator(),
        den: r.denominator(),
    }
}

fn rescale(value: i64, from: ffmpeg::ffi::AVRational, to: ffmpeg::ffi::AVRational) -> i64 {
    unsafe { ffmpeg::ffi::av_rescale_q(value, from, to) }
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::error::EAGAIN)
}

/// Sleep slice between two empty polls.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Retry `attempt` until it yields something other than `TryAgain` or
/// `timeout` has passed. A zero timeout makes exactly one attempt.
pub(crate) fn poll_with_timeout<F>(timeout: Duration, mut attempt: F) -> Result<DecoderOutput, VideoError>
where
    F: FnMut() -> Result<DecoderOutput, VideoError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let output = attempt()?;
        if output != DecoderOutput::TryAgain {
            return Ok(output);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(DecoderOutput::TryAgain);
        }
        thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}

/// Opens FFmpeg demuxer/decoder pairs within a decoder budget.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    budget: DecoderBudget,
}

impl FfmpegBackend {
    pub fn new(max_decoders: usize) -> Self {
        init_ffmpeg();
        Self {
            budget: DecoderBudget::new(max_decoders),
        }
    }

    pub fn budget(&self) -> &DecoderBudget {
        &self.budget
    }

    /// Track format without opening a decoder.
    pub fn track_format(path: &Path) -> Result<TrackFormat, VideoError> {
        init_ffmpeg();
        Ok(FfmpegDemuxer::open(path)?.0.format)
    }

    /// Presentation times (µs) of every keyframe packet of the best video
    /// stream. Demux only, nothing is decoded.
    pub fn scan_keyframes(path: &Path) -> Result<Vec<i64>, VideoError> {
        init_ffmpeg();
        let mut input = ffmpeg::format::input(path)
            .map_err(|e| VideoError::Demux(format!("Failed to open {}: {}", path.display(), e)))?;
        let (stream_index, time_base) = {
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| VideoError::Demux(format!("No video stream in {}", path.display())))?;
            (stream.index(), av_rational(stream.time_base()))
        };

        let mut times = Vec::new();
        let mut packets = 0usize;
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut input) {
                Ok(()) => {}
                Err(ffmpeg::Error::Eof) => break,
                Err(e) => return Err(VideoError::Demux(format!("scan stopped after {} packets: {}", packets, e))),
            }
            if packet.stream() != stream_index {
                continue;
            }
            packets += 1;
            if !packet.is_key() {
                continue;
            }
            // Packets without any timestamp can't be seek targets
            if let Some(ts) = packet.pts().or(packet.dts()) {
                times.push(rescale(ts, time_base, MICROS));
            }
        }
        trace!("{}: {} of {} packets are keyframes", path.display(), times.len(), packets);
        Ok(times)
    }
}

impl MediaBackend for FfmpegBackend {
    fn open(&self, path: &Path) -> Result<MediaSession, VideoError> {
        let permit = self.budget.try_acquire().ok_or_else(|| {
            VideoError::DecoderInit(format!(
                "decoder budget exhausted ({} of {} in use)",
                self.budget.in_use(),
                self.budget.limit()
            ))
        })?;
        let (demuxer, context) = FfmpegDemuxer::open(path)?;
        let decoder = FfmpegDecoder::new(context, demuxer.time_base, permit)?;
        debug!("Opened {} ({:?})", path.display(), demuxer.format);
        Ok(MediaSession {
            demuxer: Box::new(demuxer),
            decoder: Box::new(decoder),
        })
    }
}

pub struct FfmpegDemuxer {
    input: Unshared<ffmpeg::format::context::Input>,
    stream_index: usize,
    time_base: ffmpeg::ffi::AVRational,
    format: TrackFormat,
    peeked: Option<EncodedSample>,
    eof: bool,
}

impl FfmpegDemuxer {
    /// Open `path` and select its best video stream. Also returns the codec
    /// context for that stream so the caller can build a decoder.
    fn open(path: &Path) -> Result<(Self, ffmpeg::codec::context::Context), VideoError> {
        let input = ffmpeg::format::input(path)
            .map_err(|e| VideoError::DecoderInit(format!("Failed to open {}: {}", path.display(), e)))?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| VideoError::DecoderInit(format!("No video stream in {}", path.display())))?;
        let stream_index = stream.index();
        let time_base = av_rational(stream.time_base());

        let fps = stream.avg_frame_rate();
        let frame_rate = if fps.denominator() != 0 {
            fps.numerator() as f64 / fps.denominator() as f64
        } else {
            0.0
        };
        let duration_us = if stream.duration() > 0 {
            rescale(stream.duration(), time_base, MICROS)
        } else {
            // Container duration is already in AV_TIME_BASE (µs)
            input.duration().max(0)
        };

        let parameters = stream.parameters();
        let codec = format!("{:?}", parameters.id()).to_lowercase();
        let context = ffmpeg::codec::context::Context::from_parameters(parameters)
            .map_err(|e| VideoError::DecoderInit(format!("Failed to create decoder context: {}", e)))?;
        let (width, height) = unsafe {
            let raw = context.as_ptr();
            ((*raw).width.max(0) as u32, (*raw).height.max(0) as u32)
        };

        let format = TrackFormat {
            codec,
            width,
            height,
            frame_rate,
            duration_us,
        };
        Ok((
            Self {
                input: Unshared(input),
                stream_index,
                time_base,
                format,
                peeked: None,
                eof: false,
            },
            context,
        ))
    }

    fn read_next(&mut self) -> Result<Option<EncodedSample>, VideoError> {
        loop {
            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input.0) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    let pts = packet.pts().or(packet.dts()).unwrap_or(0);
                    return Ok(Some(EncodedSample {
                        data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
                        pts_us: rescale(pts, self.time_base, MICROS),
                        is_sync: packet.is_key(),
                        stream_pts: packet.pts(),
                        stream_dts: packet.dts(),
                    }));
                }
                Err(ffmpeg::Error::Eof) => return Ok(None),
                Err(e) => return Err(VideoError::Demux(e.to_string())),
            }
        }
    }
}

impl Demuxer for FfmpegDemuxer {
    fn format(&self) -> &TrackFormat {
        &self.format
    }

    fn peek_sample(&mut self) -> Result<Option<&EncodedSample>, VideoError> {
        if self.peeked.is_none() && !self.eof {
            self.peeked = self.read_next()?;
            self.eof = self.peeked.is_none();
        }
        Ok(self.peeked.as_ref())
    }

    fn advance(&mut self) {
        self.peeked = None;
    }

    fn seek_to_sync(&mut self, time_us: i64) -> Result<(), VideoError> {
        let ts = rescale(time_us, MICROS, self.time_base);
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.0.as_mut_ptr(),
                self.stream_index as i32,
                ts,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            return Err(VideoError::Demux(format!("seek to {}us failed (ret={})", time_us, ret)));
        }
        self.peeked = None;
        self.eof = false;
        trace!("Demuxer seek to {}us", time_us);
        Ok(())
    }
}

pub struct FfmpegDecoder {
    decoder: Unshared<ffmpeg::decoder::Video>,
    time_base: ffmpeg::ffi::AVRational,
    scaler: Option<(Unshared<ffmpeg::software::scaling::Context>, ffmpeg::format::Pixel, u32, u32)>,
    size: (u32, u32),
    stashed: Option<ffmpeg::frame::Video>,
    pending: Option<(i64, ffmpeg::frame::Video)>,
    _permit: DecoderPermit,
}

impl FfmpegDecoder {
    fn new(
        mut context: ffmpeg::codec::context::Context,
        time_base: ffmpeg::ffi::AVRational,
        permit: DecoderPermit,
    ) -> Result<Self, VideoError> {
        // Multi-threaded frame decoding
        unsafe {
            (*context.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*context.as_mut_ptr()).thread_count = 0;
        }
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| VideoError::DecoderInit(format!("Failed to create video decoder: {}", e)))?;
        let size = (decoder.width(), decoder.height());
        Ok(Self {
            decoder: Unshared(decoder),
            time_base,
            scaler: None,
            size,
            stashed: None,
            pending: None,
            _permit: permit,
        })
    }

    fn take_frame(&mut self, frame: ffmpeg::frame::Video) -> DecoderOutput {
        let pts = frame.timestamp().or(frame.pts()).unwrap_or(0);
        let pts_us = rescale(pts, self.time_base, MICROS);
        self.pending = Some((pts_us, frame));
        DecoderOutput::Frame { pts_us }
    }

    fn receive(&mut self) -> Result<DecoderOutput, VideoError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.0.receive_frame(&mut frame) {
            Ok(()) => {
                let size = (frame.width(), frame.height());
                if size != self.size {
                    self.size = size;
                    self.stashed = Some(frame);
                    return Ok(DecoderOutput::FormatChanged {
                        width: size.0,
                        height: size.1,
                    });
                }
                Ok(self.take_frame(frame))
            }
            Err(e) if is_again(&e) => Ok(DecoderOutput::TryAgain),
            Err(ffmpeg::Error::Eof) => Ok(DecoderOutput::EndOfStream),
            Err(e) => Err(VideoError::Decode(format!("Failed to receive frame: {}", e))),
        }
    }

    fn to_rgba(&mut self, frame: &ffmpeg::frame::Video) -> Result<Vec<u8>, VideoError> {
        let (width, height, pixel) = (frame.width(), frame.height(), frame.format());
        let stale = !matches!(&self.scaler, Some((_, p, w, h)) if *p == pixel && *w == width && *h == height);
        if stale {
            let context = ffmpeg::software::scaling::Context::get(
                pixel,
                width,
                height,
                ffmpeg::format::Pixel::RGBA,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| VideoError::Decode(format!("Failed to create scaler: {}", e)))?;
            self.scaler = Some((Unshared(context), pixel, width, height));
        }
        let Some((scaler, ..)) = self.scaler.as_mut() else {
            return Err(VideoError::Decode("scaler missing".into()));
        };

        let mut rgba = ffmpeg::frame::Video::empty();
        scaler
            .0
            .run(frame, &mut rgba)
            .map_err(|e| VideoError::Decode(format!("Failed to scale frame: {}", e)))?;

        // Strip row padding
        let stride = rgba.stride(0);
        let row_bytes = width as usize * 4;
        let src = rgba.data(0);
        let mut out = vec![0u8; row_bytes * height as usize];
        for (y, row) in out.chunks_exact_mut(row_bytes).enumerate() {
            let start = y * stride;
            row.copy_from_slice(&src[start..start + row_bytes]);
        }
        Ok(out)
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn queue_sample(&mut self, sample: &EncodedSample) -> Result<bool, VideoError> {
        let mut packet = ffmpeg::Packet::copy(&sample.data);
        packet.set_pts(sample.stream_pts);
        packet.set_dts(sample.stream_dts);
        if sample.is_sync {
            packet.set_flags(ffmpeg::packet::Flags::KEY);
        }
        match self.decoder.0.send_packet(&packet) {
            Ok(()) => Ok(true),
            Err(e) if is_again(&e) => Ok(false),
            Err(e) => Err(VideoError::Decode(format!("Failed to send packet: {}", e))),
        }
    }

    fn queue_end_of_stream(&mut self) -> Result<(), VideoError> {
        match self.decoder.0.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(VideoError::Decode(format!("Failed to send EOF: {}", e))),
        }
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<DecoderOutput, VideoError> {
        if self.pending.is_some() {
            return Err(VideoError::Decode("previous output not released".into()));
        }
        if let Some(frame) = self.stashed.take() {
            return Ok(self.take_frame(frame));
        }
        // Frame threads may still be working on queued packets
        poll_with_timeout(timeout, || self.receive())
    }

    fn release_output(&mut self, render: bool, surface: &ExternalTexture) -> Result<(), VideoError> {
        let Some((pts_us, frame)) = self.pending.take() else {
            return Ok(());
        };
        if render {
            let data = self.to_rgba(&frame)?;
            surface.publish(SurfaceFrame {
                width: frame.width(),
                height: frame.height(),
                pts_us,
                data,
            });
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), VideoError> {
        self.decoder.0.flush();
        self.stashed = None;
        self.pending = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod mock {
    //! Synthetic constant-frame-rate track with I/O counters.

    use super::*;
    use std::collections::VecDeque;

    /// Shared I/O counters of every mock opened from one backend.
    #[derive(Debug, Default)]
    pub struct IoCounters {
        pub samples_read: AtomicUsize,
        pub samples_queued: AtomicUsize,
        pub frames_decoded: AtomicUsize,
        pub frames_rendered: AtomicUsize,
        pub seeks: AtomicUsize,
        pub flushes: AtomicUsize,
    }

    impl IoCounters {
        pub fn total(&self) -> usize {
            [
                &self.samples_read,
                &self.samples_queued,
                &self.frames_decoded,
                &self.frames_rendered,
                &self.seeks,
                &self.flushes,
            ]
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
        }

        pub fn get(counter: &AtomicUsize) -> usize {
            counter.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone)]
    pub struct MockVideo {
        pub frame_count: usize,
        pub frame_rate: f64,
        /// Frames per GOP; frame `i` is a sync sample when `i % gop == 0`.
        pub gop: usize,
        pub width: u32,
        pub height: u32,
        pub color: fn(i64, i64) -> [u8; 4],
    }

    fn thirds(pts_us: i64, duration_us: i64) -> [u8; 4] {
        match pts_us * 3 / duration_us.max(1) {
            0 => [255, 0, 0, 255],
            1 => [0, 255, 0, 255],
            _ => [0, 0, 255, 255],
        }
    }

    impl MockVideo {
        /// 3 s, 30 fps, GOP 15: red / green / blue thirds.
        pub fn three_colors() -> Self {
            Self {
                frame_count: 90,
                frame_rate: 30.0,
                gop: 15,
                width: 8,
                height: 4,
                color: thirds,
            }
        }

        /// `seconds` long at 30 fps with one keyframe per second.
        pub fn long(seconds: usize) -> Self {
            Self {
                frame_count: seconds * 30,
                frame_rate: 30.0,
                gop: 30,
                width: 4,
                height: 4,
                color: thirds,
            }
        }

        pub fn frame_us(&self) -> i64 {
            (1_000_000.0 / self.frame_rate).round() as i64
        }

        pub fn pts_us(&self, i: usize) -> i64 {
            (i as f64 * 1_000_000.0 / self.frame_rate).round() as i64
        }

        pub fn duration_us(&self) -> i64 {
            self.pts_us(self.frame_count)
        }

        pub fn sync_times(&self) -> Vec<i64> {
            (0..self.frame_count).step_by(self.gop).map(|i| self.pts_us(i)).collect()
        }

        pub fn format(&self) -> TrackFormat {
            TrackFormat {
                codec: "mock".into(),
                width: self.width,
                height: self.height,
                frame_rate: self.frame_rate,
                duration_us: self.duration_us(),
            }
        }

        fn sample(&self, i: usize) -> EncodedSample {
            EncodedSample {
                data: (i as u32).to_le_bytes().to_vec(),
                pts_us: self.pts_us(i),
                is_sync: i % self.gop == 0,
                stream_pts: Some(i as i64),
                stream_dts: Some(i as i64),
            }
        }
    }

    pub struct MockDemuxer {
        video: MockVideo,
        format: TrackFormat,
        cursor: usize,
        peeked: Option<EncodedSample>,
        counters: Arc<IoCounters>,
    }

    impl Demuxer for MockDemuxer {
        fn format(&self) -> &TrackFormat {
            &self.format
        }

        fn peek_sample(&mut self) -> Result<Option<&EncodedSample>, VideoError> {
            if self.peeked.is_none() && self.cursor < self.video.frame_count {
                self.counters.samples_read.fetch_add(1, Ordering::SeqCst);
                self.peeked = Some(self.video.sample(self.cursor));
            }
            Ok(self.peeked.as_ref())
        }

        fn advance(&mut self) {
            if self.cursor < self.video.frame_count {
                self.cursor += 1;
            }
            self.peeked = None;
        }

        fn seek_to_sync(&mut self, time_us: i64) -> Result<(), VideoError> {
            self.counters.seeks.fetch_add(1, Ordering::SeqCst);
            let at_or_before = (0..self.video.frame_count)
                .take_while(|&i| self.video.pts_us(i) <= time_us)
                .last()
                .unwrap_or(0);
            self.cursor = at_or_before - at_or_before % self.video.gop;
            self.peeked = None;
            Ok(())
        }
    }

    /// Decoder with a small input queue that, like real decoders, cannot
    /// produce frames until it has seen a sync sample.
    pub struct MockDecoder {
        video: MockVideo,
        queue: VecDeque<i64>,
        capacity: usize,
        eos: bool,
        synced: bool,
        pending: Option<i64>,
        counters: Arc<IoCounters>,
    }

    impl FrameDecoder for MockDecoder {
        fn queue_sample(&mut self, sample: &EncodedSample) -> Result<bool, VideoError> {
            if self.queue.len() >= self.capacity {
                return Ok(false);
            }
            self.counters.samples_queued.fetch_add(1, Ordering::SeqCst);
            self.synced |= sample.is_sync;
            if self.synced {
                self.queue.push_back(sample.pts_us);
            }
            Ok(true)
        }

        fn queue_end_of_stream(&mut self) -> Result<(), VideoError> {
            self.eos = true;
            Ok(())
        }

        fn dequeue_output(&mut self, _timeout: Duration) -> Result<DecoderOutput, VideoError> {
            if self.pending.is_some() {
                return Err(VideoError::Decode("previous output not released".into()));
            }
            // Hold back one frame of latency until input is exhausted
            if self.queue.len() > 1 || (self.eos && !self.queue.is_empty()) {
                let pts_us = self.queue.pop_front().unwrap_or_default();
                self.counters.frames_decoded.fetch_add(1, Ordering::SeqCst);
                self.pending = Some(pts_us);
                return Ok(DecoderOutput::Frame { pts_us });
            }
            if self.eos {
                return Ok(DecoderOutput::EndOfStream);
            }
            Ok(DecoderOutput::TryAgain)
        }

        fn release_output(&mut self, render: bool, surface: &ExternalTexture) -> Result<(), VideoError> {
            let Some(pts_us) = self.pending.take() else {
                return Ok(());
            };
            if render {
                self.counters.frames_rendered.fetch_add(1, Ordering::SeqCst);
                let color = (self.video.color)(pts_us, self.video.duration_us());
                surface.publish(SurfaceFrame::solid(self.video.width, self.video.height, pts_us, color));
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), VideoError> {
            self.counters.flushes.fetch_add(1, Ordering::SeqCst);
            self.queue.clear();
            self.pending = None;
            self.eos = false;
            self.synced = false;
            Ok(())
        }
    }

    /// Decoder that never produces output.
    pub struct StuckDecoder;

    impl FrameDecoder for StuckDecoder {
        fn queue_sample(&mut self, _sample: &EncodedSample) -> Result<bool, VideoError> {
            Ok(true)
        }
        fn queue_end_of_stream(&mut self) -> Result<(), VideoError> {
            Ok(())
        }
        fn dequeue_output(&mut self, timeout: Duration) -> Result<DecoderOutput, VideoError> {
            poll_with_timeout(timeout, || Ok(DecoderOutput::TryAgain))
        }
        fn release_output(&mut self, _render: bool, _surface: &ExternalTexture) -> Result<(), VideoError> {
            Ok(())
        }
        fn flush(&mut self) -> Result<(), VideoError> {
            Ok(())
        }
    }

    pub struct MockBackend {
        pub video: MockVideo,
        pub counters: Arc<IoCounters>,
        pub with_index: bool,
        pub stuck: bool,
        pub budget: DecoderBudget,
    }

    impl MockBackend {
        pub fn new(video: MockVideo) -> Self {
            Self {
                video,
                counters: Arc::new(IoCounters::default()),
                with_index: true,
                stuck: false,
                budget: DecoderBudget::new(16),
            }
        }

        pub fn without_index(mut self) -> Self {
            self.with_index = false;
            self
        }
    }

    impl MediaBackend for MockBackend {
        fn open(&self, _path: &Path) -> Result<MediaSession, VideoError> {
            let permit = self
                .budget
                .try_acquire()
                .ok_or_else(|| VideoError::DecoderInit("decoder budget exhausted".into()))?;
            let demuxer = MockDemuxer {
                format: self.video.format(),
                video: self.video.clone(),
                cursor: 0,
                peeked: None,
                counters: Arc::clone(&self.counters),
            };
            let decoder: Box<dyn FrameDecoder> = if self.stuck {
                Box::new(StuckDecoder)
            } else {
                Box::new(PermitDecoder {
                    inner: MockDecoder {
                        video: self.video.clone(),
                        queue: VecDeque::new(),
                        capacity: 4,
                        eos: false,
                        synced: false,
                        pending: None,
                        counters: Arc::clone(&self.counters),
                    },
                    _permit: permit,
                })
            };
            Ok(MediaSession {
                demuxer: Box::new(demuxer),
                decoder,
            })
        }

        fn keyframe_index(&self, _path: &Path) -> Option<KeyframeIndex> {
            if self.with_index {
                KeyframeIndex::from_times(self.video.sync_times())
            } else {
                None
            }
        }
    }

    /// Keeps a budget slot for as long as the decoder lives.
    struct PermitDecoder {
        inner: MockDecoder,
        _permit: DecoderPermit,
    }

    impl FrameDecoder for PermitDecoder {
        fn queue_sample(&mut self, sample: &EncodedSample) -> Result<bool, VideoError> {
            self.inner.queue_sample(sample)
        }
        fn queue_end_of_stream(&mut self) -> Result<(), VideoError> {
            self.inner.queue_end_of_stream()
        }
        fn dequeue_output(&mut self, timeout: Duration) -> Result<DecoderOutput, VideoError> {
            self.inner.dequeue_output(timeout)
        }
        fn release_output(&mut self, render: bool, surface: &ExternalTexture) -> Result<(), VideoError> {
            self.inner.release_output(render, surface)
        }
        fn flush(&mut self) -> Result<(), VideoError> {
            self.inner.flush()
        }
    }
}

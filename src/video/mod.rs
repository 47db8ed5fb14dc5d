//! Video side: demux/decode seams, keyframe index and the seek engine.

pub mod keyframes;
pub mod media;
pub mod source;
pub mod timestamp;

use thiserror::Error;

pub use keyframes::KeyframeIndex;
pub use media::{DecoderOutput, Demuxer, EncodedSample, FfmpegBackend, FrameDecoder, MediaBackend, MediaSession, TrackFormat};
pub use source::{DecodeOptions, SeekResult, SourceState, VideoFrameSource};

#[derive(Debug, Error)]
pub enum VideoError {
    /// Demuxer/decoder could not be opened or configured. Unrecoverable.
    #[error("decoder init failed: {0}")]
    DecoderInit(String),

    #[error("demux error: {0}")]
    Demux(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// Input is exhausted but the decoder keeps reporting "try again".
    #[error("decoder stalled after {polls} empty polls")]
    DecoderStalled { polls: u32 },

    #[error("video source not prepared")]
    NotPrepared,

    #[error("video source released")]
    Released,
}

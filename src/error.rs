//! Crate-level error taxonomy.
//!
//! Setup failures (`GpuError::ContextInit`, `VideoError::DecoderInit`) abort
//! the job. `GpuError::ShaderSyntax` is the only recoverable kind: the caller
//! disables the one layer that failed. End of stream is not an error, see
//! [`crate::video::SeekResult::EndOfStream`].

use thiserror::Error;

use crate::gpu::GpuError;
use crate::video::VideoError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Video(#[from] VideoError),

    /// Submission after `close()`: caller lifecycle misuse.
    #[error("execution queue is closed")]
    QueueClosed,

    #[error("task panicked on worker thread: {0}")]
    WorkerPanicked(String),

    #[error("invalid timeline: {0}")]
    Timeline(String),

    #[error("image error: {0}")]
    Image(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Gpu(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

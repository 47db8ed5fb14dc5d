//! FRAMECRAFT - GPU frame compositor with a keyframe-aware video seek engine
//!
//! Re-exports all modules for use by the binary target.

// Threading primitives (GL queue, decode pool)
pub mod core;

// Engine
pub mod bitmap;
pub mod error;
pub mod gpu;
pub mod renderer;
pub mod timeline;
pub mod video;

// App modules
pub mod cli;
pub mod config;
pub mod settings;

pub use bitmap::Bitmap;
pub use error::{Error, Result};
pub use renderer::Renderer;
pub use settings::RenderSettings;
pub use timeline::{Layer, LayerKind, LayerTransform, Timeline};

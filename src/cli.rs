use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "GPU:    EGL + OpenGL ES 3 (glow)\n",
    "Video:  playa-ffmpeg 8.0 (static)\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// GPU frame compositor for layered video timelines
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug logging to file (default: framecraft.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE", global = true)]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    /// Custom configuration directory (overrides default platform paths)
    #[arg(short = 'c', long = "config-dir", value_name = "DIR", global = true)]
    pub config_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render one frame of a timeline to PNG
    Render {
        /// Timeline JSON file
        #[arg(value_name = "TIMELINE")]
        timeline: PathBuf,

        /// Timeline position in milliseconds
        #[arg(long = "at", value_name = "MS", default_value_t = 0)]
        at_ms: i64,

        /// Output PNG file
        #[arg(short = 'o', long = "output", value_name = "PNG")]
        output: PathBuf,

        /// Request a 10-bit surface (falls back to 8-bit when unsupported)
        #[arg(long = "hdr")]
        hdr: bool,
    },

    /// Render a range of frames to numbered PNG files
    Frames {
        /// Timeline JSON file
        #[arg(value_name = "TIMELINE")]
        timeline: PathBuf,

        /// Output directory
        #[arg(short = 'o', long = "out-dir", value_name = "DIR")]
        out_dir: PathBuf,

        /// First position in milliseconds
        #[arg(long = "from", value_name = "MS", default_value_t = 0)]
        from_ms: i64,

        /// End position in milliseconds, exclusive (default: timeline end)
        #[arg(long = "to", value_name = "MS")]
        to_ms: Option<i64>,

        /// Spacing in milliseconds (default: one frame)
        #[arg(long = "step", value_name = "MS")]
        step_ms: Option<i64>,
    },

    /// Print the video track format and keyframe index of a file
    Probe {
        #[arg(value_name = "VIDEO")]
        video: PathBuf,
    },
}

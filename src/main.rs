use framecraft::cli::{Args, Command};
use framecraft::config;
use framecraft::gpu::{ColorMode, RenderTarget};
use framecraft::video::{FfmpegBackend, KeyframeIndex};
use framecraft::{Renderer, RenderSettings, Timeline};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::Path;

fn init_logging(args: &Args, path_config: &config::PathConfig) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| config::data_file(config::LOG_FILE, path_config));

        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging, RUST_LOG wins if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };

        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn offscreen_renderer(settings: &RenderSettings, timeline_path: &Path) -> Result<Renderer> {
    let timeline = Timeline::load(timeline_path)
        .with_context(|| format!("Failed to load timeline {}", timeline_path.display()))?;
    let target = RenderTarget::Offscreen {
        width: timeline.width,
        height: timeline.height,
    };
    Renderer::new(settings, timeline, target).context("Failed to start renderer")
}

fn render(settings: &RenderSettings, timeline_path: &Path, at_ms: i64, output: &Path) -> Result<()> {
    let mut renderer = offscreen_renderer(settings, timeline_path)?;
    let bitmap = renderer.render_frame_to_bitmap(at_ms)?;
    bitmap
        .save_png(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    renderer.close()?;
    println!("{} ({}x{}, {}ms)", output.display(), bitmap.width(), bitmap.height(), at_ms);
    Ok(())
}

fn frames(
    settings: &RenderSettings,
    timeline_path: &Path,
    out_dir: &Path,
    from_ms: i64,
    to_ms: Option<i64>,
    step_ms: Option<i64>,
) -> Result<()> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let mut renderer = offscreen_renderer(settings, timeline_path)?;
    let times = renderer.timeline().frame_times(from_ms, to_ms, step_ms);
    info!("Rendering {} frame(s) to {}", times.len(), out_dir.display());
    for (i, t_ms) in times.iter().enumerate() {
        let bitmap = renderer.render_frame_to_bitmap(*t_ms)?;
        let path = out_dir.join(format!("frame_{:05}.png", i));
        bitmap
            .save_png(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("{}ms -> {}", t_ms, path.display());
    }
    renderer.close()?;
    println!("{} frame(s) written to {}", times.len(), out_dir.display());
    Ok(())
}

fn describe(video: &Path) -> Result<()> {
    let format = FfmpegBackend::track_format(video)?;
    println!("File:       {}", video.display());
    println!("Codec:      {}", format.codec);
    println!("Size:       {}x{}", format.width, format.height);
    println!("Frame rate: {:.3}", format.frame_rate);
    println!("Duration:   {:.3}s", format.duration_us as f64 / 1_000_000.0);
    match KeyframeIndex::build(video) {
        Some(index) => {
            println!(
                "Keyframes:  {} (interval ~{:.3}s)",
                index.len(),
                index.interval_hint_us() as f64 / 1_000_000.0
            );
            for t in index.times_us() {
                println!("  {:.6}s", *t as f64 / 1_000_000.0);
            }
        }
        None => println!("Keyframes:  no index (sequential seeking)"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let path_config = config::PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = config::ensure_dirs(&path_config) {
        eprintln!("Warning: Failed to create application directories: {}", e);
    }
    init_logging(&args, &path_config)?;
    debug!("Command-line args: {:?}", args);

    let settings_path = config::config_file(config::SETTINGS_FILE, &path_config);
    info!("Config path: {}", settings_path.display());
    let mut settings = RenderSettings::load(&settings_path);

    match &args.command {
        Command::Render {
            timeline,
            at_ms,
            output,
            hdr,
        } => {
            if *hdr {
                settings.color_mode = ColorMode::Hdr;
            }
            render(&settings, timeline, *at_ms, output)
        }
        Command::Frames {
            timeline,
            out_dir,
            from_ms,
            to_ms,
            step_ms,
        } => frames(&settings, timeline, out_dir, *from_ms, *to_ms, *step_ms),
        Command::Probe { video } => describe(video),
    }
}

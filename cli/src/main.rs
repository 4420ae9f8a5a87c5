use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tabletrack_core::{
    config::AnalysisConfig,
    frame::ImageSequence,
    pipeline::{Analyzer, JsonLinesSink},
    rendering::OverlayRenderer,
    table::TableDetector,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "tabletrack",
    version,
    about = "Table-tennis table detection and ball tracking",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the table in one frame and print its corners and net as JSON.
    Table {
        /// Directory of PNG/JPEG frames
        #[arg(short, long)]
        frames: PathBuf,

        /// Index of the frame to search
        #[arg(long, default_value_t = 0)]
        index: usize,

        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Calibrate on the table, then track the ball through every frame.
    Track {
        /// Directory of PNG/JPEG frames
        #[arg(short, long)]
        frames: PathBuf,

        /// JSON-lines file receiving samples and bounces
        #[arg(short, long, default_value = "samples.jsonl")]
        output: PathBuf,

        /// JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured frame rate
        #[arg(long)]
        fps: Option<f64>,

        /// Write annotated frames here
        #[arg(long)]
        overlay_dir: Option<PathBuf>,
    },

    /// Print the default configuration as JSON.
    Config,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Table {
            frames,
            index,
            config,
        } => cmd_table(frames, index, config),
        Commands::Track {
            frames,
            output,
            config,
            fps,
            overlay_dir,
        } => cmd_track(frames, output, config, fps, overlay_dir),
        Commands::Config => cmd_config(),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::load(path),
        None => Ok(AnalysisConfig::default()),
    }
}

// ── table ─────────────────────────────────────────────────────────────────────

fn cmd_table(frames: PathBuf, index: usize, config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let sequence = ImageSequence::open(&frames)?;
    let frame = sequence.frame(index)?;
    info!(width = frame.width, height = frame.height, index, "searching for table");

    let Some(found) = TableDetector::new(config.table).detect(&frame) else {
        bail!("no table found in frame {index} of {}", frames.display());
    };
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

// ── track ─────────────────────────────────────────────────────────────────────

fn cmd_track(
    frames: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    fps: Option<f64>,
    overlay_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config)?;
    if let Some(fps) = fps {
        if fps <= 0.0 {
            bail!("--fps must be positive, got {fps}");
        }
        config.analyzer.fps = fps;
    }

    info!("Ball tracking");
    info!("  frames : {}", frames.display());
    info!("  output : {}", output.display());

    let sequence = ImageSequence::open(&frames)?;
    info!(frames = sequence.len(), "frame sequence opened");

    if let Some(dir) = &overlay_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("cannot create overlay directory {}", dir.display()))?;
    }
    let renderer = OverlayRenderer::new(config.overlay.clone());

    let mut analyzer = Analyzer::new(&config);
    analyzer.calibrate(|i| sequence.frame(i as usize));

    let mut sink = JsonLinesSink::create(&output)?;
    let pb = spinner("Tracking ball…");

    for frame in sequence {
        let frame = frame?;
        pb.tick();
        let outcome = analyzer.process(&frame, &mut sink);

        if let Some(dir) = &overlay_dir {
            let path = dir.join(format!("{:06}.png", frame.index));
            let annotated = renderer.draw(&frame, &analyzer, &outcome.update);
            if let Err(e) = annotated.save(&path) {
                warn!("overlay write failed for {}: {e}", path.display());
            }
        }
    }

    let summary = analyzer.finish(&mut sink);
    pb.finish_with_message(format!("Done: {} bounces.", summary.bounces.len()));
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

// ── config ────────────────────────────────────────────────────────────────────

fn cmd_config() -> Result<()> {
    println!("{}", AnalysisConfig::default().to_json_pretty()?);
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

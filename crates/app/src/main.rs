use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::{Parser, Subcommand};
use cuesync_core::{
    analysis::compute_rms, encode_png, still_filename, AppConfig, CaptureLoop, ClockSource,
    CueScheduler, DecodedTrack, DirectorySink, HandlerRegistry, LiveClock, Player,
    PreviewRenderer, Scene, Score, SharedClock, VirtualClock,
};
use tracing_subscriber::EnvFilter;

fn main() -> cuesync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Inspect { score } => run_inspect(&score),
        Commands::Capture {
            score,
            audio,
            out,
            prefix,
        } => run_capture(config, &score, &audio, out, prefix),
        Commands::Play {
            score,
            audio,
            seconds,
        } => run_play(config, &score, &audio, seconds),
        Commands::Still {
            score,
            audio,
            at,
            out,
        } => run_still(config, &score, &audio, at, out),
    }
}

fn run_inspect(path: &Path) -> cuesync_core::Result<()> {
    let score = Score::load(path)?;
    let clock: SharedClock = Arc::new(LiveClock::new());
    let mut scheduler = CueScheduler::new(clock);
    let counts = score.schedule(&mut scheduler)?;

    for (track, cues) in score.tracks.iter().zip(&counts) {
        println!(
            "{:<16} handler={:<8} events={:<6} cues={}",
            track.name,
            track.handler,
            track.events.len(),
            cues
        );
    }
    println!(
        "total cues={} last event at {:.3}s",
        scheduler.cues().len(),
        score.end_time()
    );
    Ok(())
}

fn run_capture(
    mut config: AppConfig,
    score_path: &Path,
    audio: &Path,
    out: Option<PathBuf>,
    prefix: Option<String>,
) -> cuesync_core::Result<()> {
    config.capture.enabled = true;
    if let Some(out) = out {
        config.capture.output_dir = out;
    }
    if let Some(prefix) = prefix {
        config.capture.prefix = prefix;
    }
    config.validate()?;
    tracing::info!(?score_path, ?audio, out = ?config.capture.output_dir, "starting capture");

    let score = Score::load(score_path)?;
    let track = Arc::new(DecodedTrack::open(audio)?);
    tracing::info!(
        seconds = track.duration_seconds(),
        rms = compute_rms(track.samples()),
        "track loaded"
    );

    let clock: SharedClock = Arc::new(LiveClock::with_duration(track.duration_seconds()));
    let mut scheduler = CueScheduler::new(clock);
    score.schedule(&mut scheduler)?;

    let mut registry = HandlerRegistry::new();
    Scene::bind_handlers(&mut registry);
    let mut scene = Scene::new(&config.scene, config.score.clone());
    let mut renderer = PreviewRenderer::new(config.scene.width, config.scene.height)
        .transparent(config.capture.capture_css_background)
        .with_waveform(config.audio.waveform_bins)
        .with_spectrum(config.audio.spectrum_bins);

    let sink = DirectorySink::new(&config.capture.output_dir);
    let mut capture = CaptureLoop::new(config.capture.clone(), sink)?;
    if let Some(report) = capture.run(&scheduler, &mut registry, &mut scene, &mut renderer, track)? {
        for part in &report.parts {
            println!("{} ({} frames)", part.file_name, part.frames.len());
        }
        println!("captured {} frames in {} parts", report.frames, report.parts.len());
    }
    Ok(())
}

fn run_play(
    config: AppConfig,
    score_path: &Path,
    audio: &Path,
    seconds: Option<f64>,
) -> cuesync_core::Result<()> {
    let score = Score::load(score_path)?;
    let track = Arc::new(DecodedTrack::open(audio)?);
    let limit = seconds.unwrap_or_else(|| track.duration_seconds());
    tracing::info!(?score_path, limit, "starting live playback");

    let mut registry = HandlerRegistry::new();
    Scene::bind_handlers(&mut registry);
    let scene = Scene::new(&config.scene, config.score.clone());
    let renderer = PreviewRenderer::new(config.scene.width, config.scene.height)
        .with_waveform(config.audio.waveform_bins)
        .with_spectrum(config.audio.spectrum_bins);

    let mut player = Player::new(track, registry, scene, renderer);
    player.schedule(&score)?;
    let clock: SharedClock = player.clock().clone();
    player.scene_mut().show_static(&clock);
    player.toggle();

    let frame_time = Duration::from_secs_f64(1.0 / config.capture.frame_rate as f64);
    let mut frames = 0u64;
    while player.clock().is_running() && player.clock().now_seconds() < limit {
        let started = Instant::now();
        player.tick()?;
        frames += 1;
        if let Some(rest) = frame_time.checked_sub(started.elapsed()) {
            std::thread::sleep(rest);
        }
    }
    player.pause();

    tracing::info!(
        frames,
        position = player.clock().now_seconds(),
        pending = player.scheduler().pending(),
        "playback stopped"
    );
    Ok(())
}

fn run_still(
    config: AppConfig,
    score_path: &Path,
    audio: &Path,
    at: f64,
    out: Option<PathBuf>,
) -> cuesync_core::Result<()> {
    config.validate()?;
    let score = Score::load(score_path)?;
    let track = Arc::new(DecodedTrack::open(audio)?);

    let mut registry = HandlerRegistry::new();
    Scene::bind_handlers(&mut registry);
    let scene = Scene::new(&config.scene, config.score.clone());
    let renderer = PreviewRenderer::new(config.scene.width, config.scene.height)
        .with_waveform(config.audio.waveform_bins)
        .with_spectrum(config.audio.spectrum_bins);

    let clock = Arc::new(VirtualClock::new());
    let mut player = Player::with_clock(clock, track, registry, scene, renderer);
    player.schedule(&score)?;
    let image = player.render_at(at, config.capture.frame_rate)?;

    let path = out.unwrap_or_else(|| config.capture.output_dir.join(still_filename(Utc::now())));
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(&path, encode_png(&image)?)?;
    tracing::info!(?path, at, "still saved");
    println!("{}", path.display());
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-synchronised cue scheduling and frame capture", long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults apply to anything it leaves out.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse a score and report how many cues each track schedules.
    Inspect {
        /// Score JSON file.
        score: PathBuf,
    },
    /// Export every frame of the piece into zip archive parts.
    Capture {
        score: PathBuf,
        /// Audio file that sets the capture length.
        audio: PathBuf,
        /// Directory receiving the archive parts.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// File name prefix for frames and archives.
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// Play the piece headless against the live clock, logging cues.
    Play {
        score: PathBuf,
        audio: PathBuf,
        /// Stop after this many seconds instead of at the end of the track.
        #[arg(short, long)]
        seconds: Option<f64>,
    },
    /// Save the frame shown at one point of the piece as a PNG.
    Still {
        score: PathBuf,
        audio: PathBuf,
        /// Position in seconds.
        #[arg(long, default_value_t = 0.0)]
        at: f64,
        /// Output file. Defaults to a timestamped name in the capture directory.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

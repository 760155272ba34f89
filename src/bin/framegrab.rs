//! framegrab - list, probe and capture from video devices

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use framegrab::config::CaptureConfig;
use framegrab::device::{DeviceEnumerator, DeviceWatcher, SystemEnumerator};
use framegrab::{CaptureSession, FrameRate, PixelFormat, PlaybackController, PlaybackEvent};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Device path (overrides FRAMEGRAB_DEVICE and the config file).
    #[arg(long, global = true)]
    device: Option<String>,
    /// Requested resolution, e.g. 1280x720.
    #[arg(long, global = true)]
    size: Option<String>,
    /// Requested frame rate, e.g. 30 or 30000/1001.
    #[arg(long, global = true)]
    fps: Option<FrameRate>,
    /// Requested pixel format, e.g. yuyv or mjpeg.
    #[arg(long, global = true)]
    pixel_format: Option<PixelFormat>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List capture devices.
    List {
        /// Keep watching for devices being added or removed until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },
    /// Open a device and print the negotiated format.
    Probe,
    /// Capture a number of frames with blocking reads.
    Capture {
        #[arg(long, default_value_t = 10)]
        frames: u64,
    },
    /// Run the playback loop for a while.
    Play {
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = CaptureConfig::load().context("load configuration")?;
    if let Some(device) = &args.device {
        cfg.device = device.clone();
    }
    if let Some(size) = &args.size {
        let resolution: framegrab::Resolution = size.parse()?;
        cfg.width = Some(resolution.width);
        cfg.height = Some(resolution.height);
    }
    if args.fps.is_some() {
        cfg.fps = args.fps;
    }
    if args.pixel_format.is_some() {
        cfg.pixel_format = args.pixel_format;
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("set Ctrl-C handler")?;

    match args.command {
        Command::List { watch } => list(watch, &stop_rx),
        Command::Probe => probe(&cfg),
        Command::Capture { frames } => capture(&cfg, frames),
        Command::Play { seconds } => play(&cfg, Duration::from_secs(seconds), &stop_rx),
    }
}

fn open(cfg: &CaptureConfig) -> Result<CaptureSession> {
    let device = cfg.device_path();
    CaptureSession::open(&device, &cfg.format_request(), cfg.session_config())
        .with_context(|| format!("open {}", device.path))
}

fn list(watch: bool, stop_rx: &mpsc::Receiver<()>) -> Result<()> {
    if !watch {
        for device in SystemEnumerator::new().enumerate()? {
            println!("{}", device);
        }
        return Ok(());
    }

    let mut watcher = DeviceWatcher::start(
        Box::new(SystemEnumerator::new()),
        Duration::from_secs(1),
        |event| println!("{:?}", event),
    )?;
    let _ = stop_rx.recv();
    watcher.stop();
    Ok(())
}

fn probe(cfg: &CaptureConfig) -> Result<()> {
    let session = open(cfg)?;
    let format = session.format().clone();
    println!("device:  {}", session.device());
    println!("format:  {}", format);
    if let Some(size) = format.frame_size() {
        println!("frame:   {} bytes", size);
    }
    for (key, value) in cfg.format_request().to_options() {
        println!("option:  {}={}", key, value);
    }
    session.close()?;
    Ok(())
}

fn capture(cfg: &CaptureConfig, frames: u64) -> Result<()> {
    let mut session = open(cfg)?;
    session.start_capture()?;
    let started = Instant::now();
    for _ in 0..frames {
        let frame = match session.read_frame() {
            Ok(frame) => frame,
            Err(framegrab::CaptureError::EndOfStream) => {
                log::info!("capture: end of stream");
                break;
            }
            Err(err) => return Err(err.into()),
        };
        println!(
            "#{} {}x{} {} {} bytes",
            frame.sequence,
            frame.width,
            frame.height,
            frame.format,
            frame.len()
        );
    }
    let elapsed = started.elapsed();
    let stats = session.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    log::info!(
        "capture: {} frames in {:.2}s",
        stats.frames_read,
        elapsed.as_secs_f64()
    );
    session.close()?;
    Ok(())
}

fn play(cfg: &CaptureConfig, duration: Duration, stop_rx: &mpsc::Receiver<()>) -> Result<()> {
    let session = open(cfg)?;
    let (mut controller, events) =
        PlaybackController::with_channel(session, cfg.playback_config());
    controller.play()?;

    let deadline = Instant::now() + duration;
    let mut frames = 0u64;
    let mut outcome = Ok(());
    while Instant::now() < deadline {
        if stop_rx.try_recv().is_ok() {
            log::info!("play: interrupted");
            break;
        }
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PlaybackEvent::Frame(_)) => frames += 1,
            Ok(PlaybackEvent::EndOfStream) => {
                log::info!("play: end of stream");
                break;
            }
            Ok(PlaybackEvent::Error(message)) => {
                outcome = Err(anyhow!("playback failed: {}", message));
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let session = match controller.into_session() {
        Ok(session) => session,
        Err(err) => return outcome.and(Err(err.into())),
    };
    println!("{}", serde_json::to_string_pretty(&session.stats())?);
    println!("{} frames delivered", frames);
    session.close()?;
    outcome
}

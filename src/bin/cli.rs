use anyhow::{anyhow, bail, Context, Result};
use crabreel::recording::{
    DevicePreset, FrameSampler, FrameSource, RawFrame, Recorder, RecordingConfig,
};
use crabreel::testing::synthetic_i420_frame;
use crabreel::RecorderSettings;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() -> Result<()> {
    crabreel::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: crabreel-cli <record|init-settings|list-audio> [args]");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "record" => cmd_record(&args[2..]),
        "init-settings" => cmd_init_settings(&args[2..]),
        "list-audio" => cmd_list_audio(&args[2..]),
        other => {
            eprintln!("Unknown command: {}", other);
            std::process::exit(1);
        }
    }
}

/// Test pattern rendered on demand, as a poll-mode surface would be
struct PatternSampler {
    frame: u64,
}

impl FrameSampler for PatternSampler {
    fn capture_current_frame(&mut self, width: u32, height: u32) -> Option<RawFrame> {
        let frame = synthetic_i420_frame(self.frame, width, height);
        self.frame += 1;
        Some(frame)
    }
}

struct RecordArgs {
    config: RecordingConfig,
    frames: u64,
    poll: bool,
    json: bool,
    settings: Option<PathBuf>,
}

fn parse_preset(s: &str) -> Result<DevicePreset> {
    match s {
        "256" => Ok(DevicePreset::Mini2_256),
        "384" => Ok(DevicePreset::Mini2_384),
        "640" => Ok(DevicePreset::Mini2_640),
        _ => bail!("preset must be 256, 384 or 640, got {}", s),
    }
}

fn parse_record_args(args: &[String]) -> Result<RecordArgs> {
    let mut preset = DevicePreset::Mini2_256;
    let mut fps = None;
    let mut bitrate_mbps = None;
    let mut frames = 100;
    let mut poll = false;
    let mut audio = false;
    let mut json = false;
    let mut settings = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .ok_or_else(|| anyhow!("{} needs a value", arg))
        };
        match arg.as_str() {
            "--preset" => preset = parse_preset(value()?)?,
            "--fps" => fps = Some(value()?.parse().context("--fps")?),
            "--bitrate" => bitrate_mbps = Some(value()?.parse().context("--bitrate")?),
            "--frames" => frames = value()?.parse().context("--frames")?,
            "--settings" => settings = Some(PathBuf::from(value()?)),
            "--poll" => poll = true,
            "--audio" => audio = true,
            "--json" => json = true,
            other => bail!("Unknown option: {}", other),
        }
    }

    let fps = fps.unwrap_or(preset.fps_options()[0]);
    let mut config = RecordingConfig::from_preset(preset, fps)?.with_audio(audio);
    if let Some(mbps) = bitrate_mbps {
        config = config.with_bitrate_mbps(mbps);
    }

    Ok(RecordArgs {
        config,
        frames,
        poll,
        json,
        settings,
    })
}

fn cmd_record(args: &[String]) -> Result<()> {
    let args = parse_record_args(args)?;
    let settings = match &args.settings {
        Some(path) => RecorderSettings::load_from_file(path)?,
        None => RecorderSettings::load_or_default(),
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install Ctrl-C handler")?;

    let recorder = Recorder::with_settings(settings);
    recorder.configure(args.config.clone());

    let interval = args.config.frame_interval();
    if args.poll {
        if !recorder.start(FrameSource::Poll(Box::new(PatternSampler { frame: 0 }))) {
            bail!("Recorder failed to start");
        }
        let wait = interval * args.frames as u32;
        let mut waited = Duration::ZERO;
        while waited < wait && !interrupted.load(Ordering::SeqCst) {
            thread::sleep(interval);
            waited += interval;
        }
    } else {
        let (sender, source) = recorder.push_channel();
        if !recorder.start(FrameSource::Push(source)) {
            bail!("Recorder failed to start");
        }
        let (w, h) = (args.config.width, args.config.height);
        for n in 0..args.frames {
            if interrupted.load(Ordering::SeqCst) {
                break;
            }
            let frame = synthetic_i420_frame(n, w, h);
            sender.on_frame(frame.data, w, h, None);
            thread::sleep(interval);
        }
    }

    recorder.stop();
    let stats = recorder
        .last_stats()
        .ok_or_else(|| anyhow!("Recording produced no stats"))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        match &stats.persisted_path {
            Some(path) => println!("Saved {}", path.display()),
            None => println!("Recording not persisted ({})", stats.output_path.display()),
        }
        println!(
            "{} frames ({} dropped, {} rejected), {:.2}s, {} bytes, {:.0} bps",
            stats.frames_submitted,
            stats.frames_dropped,
            stats.frames_rejected,
            stats.media_duration_secs,
            stats.bytes_written,
            stats.avg_bitrate()
        );
    }
    Ok(())
}

fn cmd_init_settings(args: &[String]) -> Result<()> {
    let path = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(RecorderSettings::default_path);
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    RecorderSettings::default().save_to_file(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(feature = "audio")]
fn cmd_list_audio(args: &[String]) -> Result<()> {
    let devices = crabreel::audio::list_audio_devices()?;
    if args.iter().any(|a| a == "--json") {
        println!("{}", serde_json::to_string(&devices)?);
    } else {
        for d in devices {
            let marker = if d.is_default { " (default)" } else { "" };
            println!("{}: {} {} Hz x{}{}", d.id, d.name, d.sample_rate, d.channels, marker);
        }
    }
    Ok(())
}

#[cfg(not(feature = "audio"))]
fn cmd_list_audio(_args: &[String]) -> Result<()> {
    bail!("Built without the `audio` feature")
}

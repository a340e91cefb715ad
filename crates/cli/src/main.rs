mod settings;
mod transcode;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use splashstream::config::{
    Config, DeviceConfig, ProtocolConfig, REPORT_ID_CONTROL_VIDEO, REPORT_ID_VIDEO_ONLY,
    StreamConfig,
};
use splashstream::{AnnexBFile, CancelToken, Packetizer, Sink, Streamer, UsbTransport, WriterSink};

use settings::Settings;
use transcode::TempStream;

#[derive(Parser)]
#[command(
    name = "splashstream",
    about = "Loop a GIF or video on a USB-attached LCD display"
)]
struct Args {
    /// Input GIF or video (defaults to the saved current video)
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// USB vendor id, decimal or 0x-prefixed hex [default: 0x0416]
    #[arg(long, short, value_parser = parse_u16)]
    vid: Option<u16>,

    /// USB product id, decimal or 0x-prefixed hex [default: 0x7395]
    #[arg(long, short, value_parser = parse_u16)]
    pid: Option<u16>,

    /// Frame interval multiplier, higher is slower (0.5 - 2) [default: 1]
    #[arg(long, short)]
    speed: Option<f64>,

    /// Report id expected by the firmware: 0x02 or 0x03 [default: 0x02]
    #[arg(long, value_parser = parse_u8)]
    report_id: Option<u8>,

    /// Source frame rate, overriding the rate read from the input
    #[arg(long)]
    fps: Option<f64>,

    /// Input is already a 480x480 Annex B H.264 stream; skip conversion
    #[arg(long)]
    raw: bool,

    /// Stop after this many passes over the video
    #[arg(long)]
    loops: Option<u64>,

    /// Abort after this many consecutive failed packet writes
    #[arg(long)]
    max_write_failures: Option<u64>,

    /// Write packets to this file instead of the device
    #[arg(long, value_name = "FILE")]
    dry_run: Option<PathBuf>,

    /// Settings file [default: $XDG_CONFIG_HOME/splashstream/config.json]
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Save the effective input and device settings
    #[arg(long)]
    save: bool,

    /// More logging; repeat for trace output
    #[arg(long, action = ArgAction::Count)]
    verbose: u8,
}

fn parse_u16(s: &str) -> Result<u16, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid id '{s}': {e}"))
}

fn parse_u8(s: &str) -> Result<u8, String> {
    let value = parse_u16(s)?;
    u8::try_from(value).map_err(|_| format!("'{s}' does not fit in one byte"))
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Merge stored settings with command-line overrides into a session config.
fn build_config(args: &Args, settings: &Settings) -> Config {
    let device_defaults = DeviceConfig::default();
    let protocol_defaults = ProtocolConfig::default();
    Config {
        protocol: ProtocolConfig {
            report_id: args
                .report_id
                .or(settings.report_id)
                .unwrap_or(protocol_defaults.report_id),
            ..protocol_defaults
        },
        device: DeviceConfig {
            vendor_id: args
                .vid
                .or(settings.vendor_id)
                .unwrap_or(device_defaults.vendor_id),
            product_id: args
                .pid
                .or(settings.product_id)
                .unwrap_or(device_defaults.product_id),
            ..device_defaults
        },
        stream: StreamConfig {
            speed_multiplier: args.speed.or(settings.speed).unwrap_or(1.0),
            max_loops: args.loops,
            max_consecutive_write_failures: args.max_write_failures,
        },
    }
}

fn is_known_report_id(report_id: u8) -> bool {
    matches!(report_id, REPORT_ID_CONTROL_VIDEO | REPORT_ID_VIDEO_ONLY)
}

fn open_sink(args: &Args, device: &DeviceConfig) -> Result<Box<dyn Sink>> {
    match &args.dry_run {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("creating {}", path.display()))?;
            tracing::info!(path = %path.display(), "dry run, writing packets to file");
            Ok(Box::new(WriterSink::new(BufWriter::new(file))))
        }
        None => Ok(Box::new(UsbTransport::open(device)?)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    // Ctrl-C only sets the token; every exit below drops `temp`.
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("installing Ctrl-C handler")?;

    let settings_path = args.config.clone().or_else(settings::default_path);
    let mut settings = match &settings_path {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };

    let Some(input) = args.input.clone().or_else(|| settings.current_video.clone()) else {
        bail!("no input given and no current video saved; pass --input");
    };

    let config = build_config(&args, &settings);
    config.validate()?;
    if !is_known_report_id(config.protocol.report_id) {
        tracing::warn!(
            report_id = format_args!("{:#04x}", config.protocol.report_id),
            "report id not used by any known firmware"
        );
    }

    if args.save {
        settings.current_video = Some(input.clone());
        settings.vendor_id = Some(config.device.vendor_id);
        settings.product_id = Some(config.device.product_id);
        settings.report_id = Some(config.protocol.report_id);
        settings.speed = Some(config.stream.speed_multiplier);
        match &settings_path {
            Some(path) => settings.save(path)?,
            None => tracing::warn!("cannot locate a config directory, settings not saved"),
        }
    }

    // Fail on a missing device before spending time converting.
    let sink = open_sink(&args, &config.device)?;

    if !(args.raw && args.fps.is_some()) {
        transcode::init()?;
    }

    let fps = match args.fps {
        Some(fps) => fps,
        None => match transcode::probe_frame_rate(&input)? {
            Some(fps) => fps,
            None => {
                let fallback = transcode::default_frame_rate(&input);
                tracing::warn!(fallback, "source frame rate missing, using default");
                fallback
            }
        },
    };
    tracing::info!(fps, "using frame rate");

    let temp = TempStream::new();
    let stream_path = if args.raw {
        input.clone()
    } else {
        transcode::transcode(&input, temp.path(), fps, &cancel)?;
        temp.path().to_path_buf()
    };
    if cancel.is_cancelled() {
        tracing::info!("cancelled before streaming");
        return Ok(());
    }

    let mut source = AnnexBFile::open(&stream_path, Some(fps))?;
    let packetizer = Packetizer::new(config.protocol.clone())?;
    let mut streamer =
        Streamer::new(packetizer, config.stream.clone(), sink)?.with_cancel_token(cancel);

    tracing::info!(input = %input.display(), "streaming, press Ctrl-C to stop");
    let report = streamer.run(&mut source)?;

    tracing::info!(
        frames = report.frames_sent,
        packets = report.packets_sent,
        write_failures = report.write_failures,
        loops = report.loops_completed,
        "stopped"
    );
    Ok(())
}

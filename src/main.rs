//! `gpspod` — talk to a GpsPod USB GPS track recorder.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gpspod::codec::{self, PacketCodec};
use gpspod::command::{CommandId, REPLY_FLAG};
use gpspod::command::system::{DeviceInfoReply, DeviceStatusReply};
use gpspod::error::{Error, Result};
use gpspod::gpx::{write_gpx, GpxOptions};
use gpspod::memory::MemoryView;
use gpspod::samples::{read_tracks, TrackLog};
use gpspod::session::Session;
use gpspod::transport::{
    Direction, HidTransport, Pacing, RecordingTransport, ReplayTransport, Transport,
    DEFAULT_REPORT_LEN,
};

#[derive(Parser)]
#[command(name = "gpspod", about = "Host-side client for the GpsPod GPS track recorder", version)]
struct Cli {
    /// Milliseconds per transport read
    #[arg(long, env = "GPSPOD_READ_TIMEOUT", value_name = "MS", global = true)]
    read_timeout: Option<u64>,

    /// Transfer size in bytes above which to pause after a read
    #[arg(long, env = "GPSPOD_READ_SLEEP_MINSIZE", value_name = "BYTES", global = true)]
    read_sleep_minsize: Option<usize>,

    /// Milliseconds to pause after a large read
    #[arg(long, env = "GPSPOD_READ_SLEEP_DURATION", value_name = "MS", global = true)]
    read_sleep_duration: Option<u64>,

    /// Record every exchanged report to a replayable log
    #[arg(long, value_name = "PATH", global = true)]
    record: Option<PathBuf>,

    /// Decode from a memory dump instead of a live device
    #[arg(long, value_name = "PATH", global = true)]
    image: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print device model, serial number and versions
    Device {
        #[arg(long)]
        json: bool,
    },
    /// Print battery status
    Status,
    /// Read or write the device settings blob
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// List the recorded tracks
    Tracks {
        #[arg(long)]
        json: bool,
    },
    /// Download one track and export it as GPX
    Retrieve {
        /// Track index as shown by `tracks`
        index: usize,
        #[arg(long, short, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Emit a waypoint per lap marker
        #[arg(long)]
        lap_waypoints: bool,
        /// Start a new track segment at every lap
        #[arg(long)]
        lap_segments: bool,
        /// Keep GPS samples without a fix
        #[arg(long)]
        all_points: bool,
    },
    /// Dump the whole memory region to a file
    Dump { path: PathBuf },
    /// List files on the device volume
    Files,
    /// Decode and print a recorded exchange
    Debug { log: PathBuf },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the settings blob
    Get {
        #[arg(long)]
        json: bool,
    },
    /// Write bytes into the settings blob
    Set {
        /// Offset within the blob
        offset: u16,
        /// Bytes to write, in hex
        bytes: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Keep the documented 0/1 exit codes: clap would exit 2 on bad usage.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = e.print();
            return code;
        }
    };
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn pacing(cli: &Cli) -> Pacing {
    let mut pacing = Pacing::default();
    if let Some(ms) = cli.read_timeout {
        pacing.read_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = cli.read_sleep_minsize {
        pacing.sleep_min_size = bytes;
    }
    if let Some(ms) = cli.read_sleep_duration {
        pacing.sleep_duration = Duration::from_millis(ms);
    }
    pacing
}

fn open_session(cli: &Cli) -> Result<Session<Box<dyn Transport>>> {
    let transport = HidTransport::open().map_err(|e| {
        eprintln!("hint: the pod enumerates slowly after plug-in; wait a few seconds and try again");
        e
    })?;

    let transport: Box<dyn Transport> = match &cli.record {
        Some(path) => Box::new(RecordingTransport::new(
            transport,
            BufWriter::new(fs::File::create(path)?),
        )),
        None => Box::new(transport),
    };
    Ok(Session::new(transport, pacing(cli)))
}

/// Track log from the live device, or from a dump when `--image` is given.
fn load_tracks(cli: &Cli) -> Result<TrackLog> {
    match &cli.image {
        Some(path) => {
            let image = fs::read(path)?;
            let mut view = MemoryView::from_image(&image)?;
            read_tracks(|offset, len| {
                view.read_with(offset, len, |window_offset, _| {
                    Err(Error::Usage(format!(
                        "image does not cover offset {window_offset:#x}"
                    )))
                })
                .map(|bytes| bytes.to_vec())
            })
        }
        None => open_session(cli)?.tracks(),
    }
}

fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Device { json } => {
            let info = open_session(&cli)?.device_info()?;
            if *json {
                let value = serde_json::json!({
                    "model": info.model(),
                    "serial": info.serial(),
                    "firmware": info.firmware.to_string(),
                    "hardware": info.hardware.to_string(),
                    "bootloader": info.bootloader.to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&value).expect("infallible"));
            } else {
                println!("Model: {}", info.model());
                println!("Serial: {}", info.serial());
                println!("Firmware: {}", info.firmware);
                println!("Hardware: {}", info.hardware);
                println!("Bootloader: {}", info.bootloader);
            }
        }
        Command::Status => {
            let status = open_session(&cli)?.device_status()?;
            println!("Charge: {}%", status.charge);
            let names = status.flags.active_names();
            if !names.is_empty() {
                println!("Status: {}", names.join(", "));
            }
        }
        Command::Settings { action } => match action {
            SettingsAction::Get { json } => {
                let blob = open_session(&cli)?.read_settings()?;
                if *json {
                    let value = serde_json::json!({ "settings": hex::encode(&blob) });
                    println!("{}", serde_json::to_string_pretty(&value).expect("infallible"));
                } else {
                    for (row, chunk) in blob.chunks(16).enumerate() {
                        println!("{:#06x}: {}", row * 16, hex::encode(chunk));
                    }
                }
            }
            SettingsAction::Set { offset, bytes } => {
                let bytes = hex::decode(bytes)
                    .map_err(|e| Error::Usage(format!("settings bytes are not valid hex: {e}")))?;
                open_session(&cli)?.write_setting(*offset, &bytes)?;
                println!("wrote {} bytes at offset {offset}", bytes.len());
            }
        },
        Command::Tracks { json } => {
            let log = load_tracks(&cli)?;
            if let Some(warning) = &log.warning {
                eprintln!("warning: {warning}");
            }
            if *json {
                let summaries: Vec<_> = log.tracks.iter().map(|t| t.summary()).collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summaries).expect("infallible")
                );
            } else {
                for (index, track) in log.tracks.iter().enumerate() {
                    let summary = track.summary();
                    let mark = if summary.truncated { " (truncated)" } else { "" };
                    println!(
                        "{index}: {} distance: {} samples: {} interval: {}{mark}",
                        summary.start_time, summary.distance_m, summary.samples, summary.interval_s
                    );
                }
            }
        }
        Command::Retrieve {
            index,
            output,
            lap_waypoints,
            lap_segments,
            all_points,
        } => {
            let log = load_tracks(&cli)?;
            if let Some(warning) = &log.warning {
                eprintln!("warning: {warning}");
            }
            let track = log.tracks.get(*index).ok_or_else(|| {
                Error::Usage(format!(
                    "track index {index} out of range ({} tracks)",
                    log.tracks.len()
                ))
            })?;

            let path = output
                .clone()
                .unwrap_or_else(|| PathBuf::from(format!("track_{index}.gpx")));
            let options = GpxOptions {
                lap_waypoints: *lap_waypoints,
                lap_segments: *lap_segments,
                all_points: *all_points,
            };
            let file = fs::File::create(&path)?;
            write_gpx(track, &options, BufWriter::new(file))?;
            println!("wrote {}", path.display());
        }
        Command::Dump { path } => {
            let mut session = open_session(&cli)?;
            let bytes = session.dump()?;
            fs::write(path, bytes)?;
            println!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        Command::Files => {
            let entries = open_session(&cli)?.list_files()?;
            for entry in entries {
                println!(
                    "{:<16} {:>8} bytes attrs {:#04x}",
                    entry.name(),
                    entry.size,
                    entry.attributes
                );
            }
        }
        Command::Debug { log } => inspect_log(log)?,
    }
    Ok(())
}

/// Pretty-print the messages of a recorded exchange.
fn inspect_log(path: &Path) -> Result<()> {
    let replay = ReplayTransport::from_path(path)?;
    let codec = PacketCodec::new(DEFAULT_REPORT_LEN);

    let mut host = Vec::new();
    let mut device = Vec::new();
    for (direction, raw) in replay.entries() {
        let buffer = match direction {
            Direction::HostToDevice => &mut host,
            Direction::DeviceToHost => &mut device,
        };

        if raw.len() < 7 {
            println!("{direction} short report ({} bytes)", raw.len());
            continue;
        }
        // Take the expected sequence and index from the packet itself; the
        // inspector only validates framing and checksums.
        let packet = match codec.parse_packet(raw, raw[1], raw[2]) {
            Ok(packet) => packet,
            Err(e) => {
                println!("{direction} {e}");
                buffer.clear();
                continue;
            }
        };
        buffer.extend_from_slice(&packet.payload);
        if packet.index != packet.total {
            continue;
        }

        let message = std::mem::take(buffer);
        match codec::parse_message(&message) {
            Ok((code, body)) => describe_message(*direction, code, &body),
            Err(e) => println!("{direction} {e}"),
        }
    }
    Ok(())
}

fn describe_message(direction: Direction, code: u16, body: &[u8]) {
    let name = CommandId::from_u16(code & !REPLY_FLAG)
        .map(CommandId::name)
        .unwrap_or("unknown");
    let kind = if code & REPLY_FLAG != 0 { "reply" } else { "request" };
    print!("{direction} {name} {kind} ({code:#06x}), {} bytes", body.len());

    if code == CommandId::DeviceInfo.reply_code() {
        if let Ok(info) = DeviceInfoReply::try_from(body) {
            print!(": {} {} fw {}", info.model(), info.serial(), info.firmware);
        }
    } else if code == CommandId::DeviceStatus.reply_code() {
        if let Ok(status) = DeviceStatusReply::try_from(body) {
            print!(": charge {}%", status.charge);
        }
    } else if !body.is_empty() {
        let snippet = &body[..body.len().min(16)];
        print!(": {}", hex::encode(snippet));
        if body.len() > 16 {
            print!("…");
        }
    }
    println!();
}

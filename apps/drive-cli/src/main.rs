use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use audit_log::{read_records, AuditLog, FileStore};
use can_transport as can;
use can_transport::CanBus;
use drive_control::sim::SimulatedDrive;
use drive_control::{
    load_config_file, parse_trigger_line, AnalogError, AnalogSource, BusDiagnostics,
    ChannelTriggers, Clock, DriveConfig, DriveIo, DriveLink, FileAnalog, FixedAnalog, MetricsHub,
    Scheduler, ScriptedTriggers, Sequencer, SystemClock, TriggerSource,
};
use drive_protocol::{decode_can, encode, registers, Command, Direction, TorqueMapper};

#[derive(Parser, Debug)]
#[command(
    name = "drivectl",
    version,
    about = "Drive bring-up console",
    disable_help_subcommand = true
)]
struct Cli {
    /// YAML config file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Bitrate {
    #[value(name = "125k")]
    B125k,
    #[value(name = "250k")]
    B250k,
    #[value(name = "500k")]
    B500k,
    #[value(name = "1m")]
    B1M,
}

impl Bitrate {
    fn into_transport(self) -> can::Bitrate {
        match self {
            Bitrate::B125k => can::Bitrate::B125k,
            Bitrate::B250k => can::Bitrate::B250k,
            Bitrate::B500k => can::Bitrate::B500k,
            Bitrate::B1M => can::Bitrate::B1M,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CmdKind {
    /// One telemetry reply (--register)
    Request,
    /// Cyclic telemetry (--register, --interval)
    Cyclic,
    ClearErrors,
    Lock,
    Enable,
    /// Torque setpoint (--value, signed counts)
    Torque,
    /// Drive CAN watchdog (--value, ms)
    Timeout,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bring-up sequence against a drive
    Run {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        /// Interface name or serial path
        #[arg(long, default_value = "mock0")]
        device: String,
        /// Override the configured bitrate
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// Advance on a timer instead of operator input
        #[arg(long, action = ArgAction::SetTrue)]
        headless: bool,
        /// Stop after this many seconds (headless runs otherwise hold torque control)
        #[arg(long)]
        duration_s: Option<u64>,
        /// Constant pedal reading (raw ADC counts)
        #[arg(long, conflicts_with = "pedal_file")]
        pedal_raw: Option<u16>,
        /// File holding the pedal reading, e.g. /sys/bus/iio/devices/iio:device0/in_voltage0_raw
        #[arg(long)]
        pedal_file: Option<PathBuf>,
        /// Directory for the CSV audit log
        #[arg(long)]
        log_dir: Option<PathBuf>,
        /// Print Prometheus metrics when the run ends
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Show the wire bytes of one command
    Encode {
        #[arg(value_enum)]
        kind: CmdKind,
        /// Register in hex (request/cyclic)
        #[arg(long, default_value = "0x40")]
        register: String,
        /// Cyclic interval in ms
        #[arg(long, default_value_t = 100)]
        interval: u8,
        /// Torque counts or timeout ms
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        value: i32,
    },
    /// Decode a reply frame given its data bytes
    Decode {
        /// CAN ID in hex (defaults to the configured reply id)
        #[arg(long)]
        id: Option<String>,
        /// Data bytes as hex (e.g. 30 D2 04)
        #[arg(required = true, num_args = 1..)]
        data: Vec<String>,
        /// Print JSON instead of text
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Print and decode bus traffic with periodic statistics
    Listen {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        #[arg(long, default_value = "mock0")]
        device: String,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// How long to listen
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Only show frames from the drive's reply id
        #[arg(long, action = ArgAction::SetTrue)]
        reply_only: bool,
    },
    /// Print an audit log, optionally re-sending its TX frames
    Replay {
        /// CSV audit log path
        path: PathBuf,
        #[arg(long, action = ArgAction::SetTrue)]
        send: bool,
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
        #[arg(long, default_value = "mock0")]
        device: String,
        #[arg(long, value_enum)]
        bitrate: Option<Bitrate>,
        /// Honour the recorded spacing between frames
        #[arg(long, action = ArgAction::SetTrue)]
        realtime: bool,
    },
    /// List available CAN interfaces
    BusList {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
    },
    /// Print the effective configuration as JSON
    Config,
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => DriveConfig::default(),
    };

    match cli.command {
        Commands::Run {
            backend,
            device,
            bitrate,
            headless,
            duration_s,
            pedal_raw,
            pedal_file,
            log_dir,
            metrics,
        } => {
            let mut config = config;
            if let Some(br) = bitrate {
                config.bus.bitrate = br.into_transport().bps();
            }
            if let Some(dir) = log_dir {
                config.log.dir = dir;
            }
            let pedal = match (pedal_raw, pedal_file) {
                (_, Some(path)) => Pedal::File(FileAnalog::new(path)),
                (Some(raw), None) => Pedal::Fixed(FixedAnalog(raw)),
                (None, None) => Pedal::Fixed(FixedAnalog(0)),
            };
            let opts = RunOpts {
                headless,
                duration_s,
                metrics,
            };
            run_backend(backend, &device, &config, pedal, &opts)
        }
        Commands::Encode {
            kind,
            register,
            interval,
            value,
        } => encode_command(&config, kind, &register, interval, value),
        Commands::Decode { id, data, json } => decode_frame(&config, id.as_deref(), &data, json),
        Commands::Listen {
            backend,
            device,
            bitrate,
            seconds,
            reply_only,
        } => {
            let br = bitrate.map_or(config.bitrate()?, Bitrate::into_transport);
            let mut bus = open_bus(backend, &device, br)?;
            listen(&mut *bus, &config, seconds, reply_only)
        }
        Commands::Replay {
            path,
            send,
            backend,
            device,
            bitrate,
            realtime,
        } => {
            let bus = if send {
                let br = bitrate.map_or(config.bitrate()?, Bitrate::into_transport);
                Some(open_bus(backend, &device, br)?)
            } else {
                None
            };
            replay(&path, bus, realtime)
        }
        Commands::BusList { backend } => bus_list(backend),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init();
}

struct RunOpts {
    headless: bool,
    duration_s: Option<u64>,
    metrics: bool,
}

/// Torque input chosen on the command line.
enum Pedal {
    Fixed(FixedAnalog),
    File(FileAnalog),
}

impl AnalogSource for Pedal {
    fn read_raw(&mut self) -> Result<u16, AnalogError> {
        match self {
            Pedal::Fixed(p) => p.read_raw(),
            Pedal::File(p) => p.read_raw(),
        }
    }
}

fn run_backend(
    backend: Backend,
    device: &str,
    config: &DriveConfig,
    pedal: Pedal,
    opts: &RunOpts,
) -> Result<()> {
    config.validate()?;
    let ids = config.drive_ids()?;
    let bitrate = config.bitrate()?;
    match backend {
        Backend::Mock => {
            let mut bus =
                can::MockBus::open(device)?.with_responder(SimulatedDrive::new(ids).into_responder());
            bus.configure_bitrate(bitrate)?;
            run_with_bus(bus, config, pedal, opts)
        }
        Backend::Slcan => {
            let bus = can::SlcanBus::open_with(device, Some(bitrate))?;
            run_with_bus(bus, config, pedal, opts)
        }
    }
}

fn run_with_bus<B: CanBus>(
    bus: B,
    config: &DriveConfig,
    pedal: Pedal,
    opts: &RunOpts,
) -> Result<()> {
    let ids = config.drive_ids()?;
    let mut store = FileStore::new(&config.log.dir);
    let log = match AuditLog::open(&mut store, &config.log.prefix) {
        Ok(log) => log,
        Err(e) => {
            error!(error = %e, dir = %config.log.dir.display(), "cannot open audit log");
            eprintln!("Audit log could not be opened in {}: {e}", config.log.dir.display());
            return Err(e).context("opening audit log");
        }
    };
    println!("Logging to {}", store.path_of(log.file_name()).display());

    let metrics = MetricsHub::new()?;
    let link = DriveLink::new(bus, ids, log, Box::new(io::stdout()), metrics.clone());
    let clock = SystemClock::new();
    let diagnostics = BusDiagnostics::new(
        metrics.clone(),
        config.scheduler.stats_interval_ms,
        config.scheduler.silence_timeout_ms,
        clock.now_ms(),
    );
    let io = DriveIo::new(link, clock, pedal);
    let sequencer = Sequencer::new(config.sequencer.clone(), TorqueMapper::new(config.torque)?);

    let cancel = Arc::new(AtomicBool::new(false));
    if let Some(secs) = opts.duration_s {
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            cancel.store(true, Ordering::Relaxed);
        });
    }

    let outcome = if opts.headless {
        info!("headless bring-up");
        schedule(io, sequencer, diagnostics, ScriptedTriggers::bring_up(), config, &cancel)
    } else {
        println!("Keys: Enter=advance  s=stop  x=disable  l=dump log  q=quit");
        let triggers = operator_input(Arc::clone(&cancel));
        schedule(io, sequencer, diagnostics, triggers, config, &cancel)
    };
    if opts.metrics {
        print!("{}", metrics.encode_text());
    }
    outcome
}

fn schedule<B: CanBus, A: AnalogSource, T: TriggerSource>(
    io: DriveIo<B, SystemClock, A>,
    sequencer: Sequencer,
    diagnostics: BusDiagnostics,
    triggers: T,
    config: &DriveConfig,
    cancel: &AtomicBool,
) -> Result<()> {
    let mut scheduler =
        Scheduler::new(io, sequencer, diagnostics, triggers, config.scheduler.clone());
    scheduler.run(cancel)?;
    println!("Finished in stage {}", scheduler.sequencer().stage());
    Ok(())
}

/// Read operator keys on a background thread; `q` cancels the run.
fn operator_input(cancel: Arc<AtomicBool>) -> ChannelTriggers {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if matches!(line.trim(), "q" | "quit") {
                cancel.store(true, Ordering::Relaxed);
                break;
            }
            match parse_trigger_line(&line) {
                Some(trigger) => {
                    if tx.send(trigger).is_err() {
                        break;
                    }
                }
                None => eprintln!("Keys: Enter=advance  s=stop  x=disable  l=dump log  q=quit"),
            }
        }
    });
    ChannelTriggers::new(rx)
}

fn open_bus(backend: Backend, device: &str, bitrate: can::Bitrate) -> Result<Box<dyn CanBus>> {
    Ok(match backend {
        Backend::Mock => {
            let mut bus = can::MockBus::open(device)?;
            bus.configure_bitrate(bitrate)?;
            Box::new(bus)
        }
        Backend::Slcan => Box::new(can::SlcanBus::open_with(device, Some(bitrate))?),
    })
}

fn bus_list(backend: Backend) -> Result<()> {
    let buses = match backend {
        Backend::Mock => can::MockBus::list()?,
        Backend::Slcan => can::SlcanBus::list()?,
    };
    for bus in buses {
        println!("{}\t{}", bus.name, bus.driver);
    }
    Ok(())
}

fn encode_command(
    config: &DriveConfig,
    kind: CmdKind,
    register: &str,
    interval: u8,
    value: i32,
) -> Result<()> {
    let cmd = match kind {
        CmdKind::Request => Command::RequestTelemetryOnce(parse_register(register)?),
        CmdKind::Cyclic => Command::RequestTelemetryCyclic(parse_register(register)?, interval),
        CmdKind::ClearErrors => Command::ClearErrors,
        CmdKind::Lock => Command::SetArmed(false),
        CmdKind::Enable => Command::SetArmed(true),
        CmdKind::Torque => Command::SetTorque(
            i16::try_from(value).with_context(|| format!("torque {value} outside i16"))?,
        ),
        CmdKind::Timeout => Command::SetBusTimeout(
            u16::try_from(value).with_context(|| format!("timeout {value} outside u16"))?,
        ),
    };
    let frame = encode(cmd).to_can(config.drive_ids()?.command);
    println!("0x{:03X}\t{}\t{cmd}", frame.id.raw(), hex(frame.payload()));
    Ok(())
}

fn decode_frame(config: &DriveConfig, id: Option<&str>, data: &[String], json: bool) -> Result<()> {
    let ids = config.drive_ids()?;
    let id = match id {
        Some(s) => parse_id(s).ok_or_else(|| anyhow::anyhow!("invalid CAN id: {s}"))?,
        None => ids.reply,
    };
    let bytes = parse_hex_bytes(data)?;
    let frame =
        can::CanFrame::new(id, &bytes).ok_or_else(|| anyhow::anyhow!("invalid frame length"))?;
    let telemetry = decode_can(&ids, &frame);
    if json {
        let out = serde_json::json!({
            "id": format!("0x{:03X}", id.raw()),
            "telemetry": telemetry,
            "text": telemetry.to_string(),
        });
        println!("{out}");
    } else {
        println!("{telemetry}");
    }
    Ok(())
}

fn listen(bus: &mut dyn CanBus, config: &DriveConfig, seconds: u64, reply_only: bool) -> Result<()> {
    let ids = config.drive_ids()?;
    if reply_only {
        let filter = can::CanFilter {
            id: ids.reply,
            mask: 0x7FF,
        };
        if let Err(e) = bus.set_filters(&[filter]) {
            warn!(error = %e, "hardware filter unavailable, filtering in software");
        }
    }
    let mut clock = SystemClock::new();
    let mut diag = BusDiagnostics::new(
        MetricsHub::new()?,
        config.scheduler.stats_interval_ms,
        config.scheduler.silence_timeout_ms,
        0,
    );
    let deadline = seconds.saturating_mul(1000);
    while clock.now_ms() < deadline {
        let now = clock.now_ms();
        match bus.try_recv() {
            Ok(Some(frame)) => {
                if reply_only && frame.id != ids.reply {
                    continue;
                }
                diag.record_rx(frame.id, now);
                let text = if frame.id == ids.reply {
                    decode_can(&ids, &frame).to_string()
                } else {
                    String::new()
                };
                println!(
                    "{now:>8} 0x{:03X} [{}] {text}",
                    frame.id.raw(),
                    hex(frame.payload())
                );
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                diag.record_rx_error();
                warn!(error = %e, "receive failed");
            }
        }
        if let Some(stats) = diag.stats_due(now) {
            println!("{stats}");
        }
        if let Some(notice) = diag.check_silence(now) {
            println!("No CAN traffic for {} ms", notice.silent_for_ms);
        }
        clock.sleep_ms(config.scheduler.idle_sleep_ms.max(1));
    }
    println!("{}", diag.snapshot(clock.now_ms()));
    Ok(())
}

fn replay(path: &Path, mut bus: Option<Box<dyn CanBus>>, realtime: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    println!("replay: {} send={} realtime={realtime}", path.display(), bus.is_some());
    let mut last_ms: Option<u64> = None;
    let mut resent = 0usize;
    for record in read_records(BufReader::new(file)) {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                error!("bad record: {e}");
                continue;
            }
        };
        if realtime {
            if let Some(prev) = last_ms {
                let gap = record.timestamp_ms.saturating_sub(prev);
                if gap > 0 {
                    thread::sleep(Duration::from_millis(gap));
                }
            }
            last_ms = Some(record.timestamp_ms);
        }
        println!(
            "{:>8} {} 0x{:03X} [{}] {}",
            record.timestamp_ms,
            record.direction,
            record.frame.id.raw(),
            hex(record.frame.payload()),
            record.text
        );
        if record.direction == Direction::Outbound {
            if let Some(bus) = bus.as_mut() {
                bus.send(&record.frame)?;
                resent += 1;
            }
        }
    }
    println!("replay: done ({resent} frames sent)");
    Ok(())
}

fn parse_register(s: &str) -> Result<u8> {
    let t = s.trim();
    let no_prefix = t.strip_prefix("0x").unwrap_or(t);
    let reg = u8::from_str_radix(no_prefix, 16)
        .map_err(|e| anyhow::anyhow!("invalid register '{t}': {e}"))?;
    if ![
        registers::STATUS,
        registers::SPEED,
        registers::DC_BUS_VOLTAGE,
        registers::CURRENT,
        registers::TORQUE_FEEDBACK,
    ]
    .contains(&reg)
    {
        warn!(register = reg, "not a known telemetry register");
    }
    Ok(reg)
}

fn parse_id(s: &str) -> Option<can::CanId> {
    let s_trim = s.trim();
    let no_prefix = s_trim.strip_prefix("0x").unwrap_or(s_trim);
    let parsed = u32::from_str_radix(no_prefix, 16).ok()?;
    can::CanId::from_raw(parsed)
}

fn parse_hex_bytes(items: &[String]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(items.len());
    for s in items {
        let t = s.trim();
        let no_prefix = t.strip_prefix("0x").unwrap_or(t);
        let b = u8::from_str_radix(no_prefix, 16)
            .map_err(|e| anyhow::anyhow!("invalid hex byte '{t}': {e}"))?;
        out.push(b);
    }
    Ok(out)
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_helpers_round_trip_operator_input() -> Result<()> {
        let bytes = parse_hex_bytes(&["30".into(), "0xD2".into(), "04".into()])?;
        assert_eq!(bytes, vec![0x30, 0xD2, 0x04]);
        assert_eq!(hex(&bytes), "30 D2 04");
        assert!(parse_hex_bytes(&["zz".into()]).is_err());
        Ok(())
    }

    #[test]
    fn ids_and_registers_parse_with_or_without_prefix() -> Result<()> {
        assert_eq!(parse_id("0x181").map(|id| id.raw()), Some(0x181));
        assert_eq!(parse_id("201").map(|id| id.raw()), Some(0x201));
        assert_eq!(parse_register("0x40")?, registers::STATUS);
        assert!(parse_register("0x400").is_err());
        Ok(())
    }

    #[test]
    fn cli_accepts_negative_torque() {
        let cli = Cli::try_parse_from(["drivectl", "encode", "torque", "--value", "-16384"]);
        assert!(matches!(
            cli.map(|c| c.command),
            Ok(Commands::Encode {
                kind: CmdKind::Torque,
                value: -16384,
                ..
            })
        ));
    }
}

use anyhow::{bail, Context};
use clap::Parser;
use odrive_sine::session::{self, ExitReason, SessionConfig};
use odrive_sine::sim::SimulatedODrive;
use odrive_sine::sine::SineWave;
use odrive_sine::transport::{self, Discovery};
use odrive_sine::{ODrive, Transport};
use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Calibrates an ODrive axis, then drives it with a sine-wave velocity until Ctrl+C.
///
/// WARNING: calibration and the sine wave both make the motor move.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial port of the board. Waits for one on the USB bus when omitted
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Axis to drive
    #[arg(long, default_value_t = 0)]
    axis: u8,

    /// Peak speed in turns/s. Asked for on stdin when omitted
    #[arg(short, long, allow_negative_numbers = true)]
    amplitude: Option<f32>,

    /// Oscillations per second, in Hz. Asked for on stdin when omitted
    #[arg(short, long)]
    frequency: Option<f32>,

    /// Velocity the wave oscillates around, in turns/s
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    center: f32,

    /// Milliseconds between two setpoints
    #[arg(long, default_value_t = 10)]
    period_ms: u64,

    /// Seconds to wait for calibration to finish
    #[arg(long, default_value_t = 30.0)]
    calibration_timeout: f32,

    /// Stop after this many seconds instead of running until Ctrl+C
    #[arg(short, long)]
    duration: Option<f32>,

    /// Append checksums to every request
    #[arg(long)]
    checksum: bool,

    /// Talk to a simulated board instead of hardware
    #[arg(long)]
    simulate: bool,
}

fn prompt(question: &str) -> anyhow::Result<f32> {
    let stdin = io::stdin();
    loop {
        print!("{question}: ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            bail!("stdin closed while asking for {question}");
        }
        match line.trim().parse() {
            Ok(value) => return Ok(value),
            Err(_) => eprintln!("not a number: {:?}", line.trim()),
        }
    }
}

fn seconds(value: f32, what: &str) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f32(value).with_context(|| format!("invalid {what}: {value}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let amplitude = match args.amplitude {
        Some(amplitude) => amplitude,
        None => prompt("Enter amplitude (peak speed in turns/s)")?,
    };
    let frequency = match args.frequency {
        Some(frequency) => frequency,
        None => prompt("Enter frequency (oscillations per second, in Hz)")?,
    };
    let wave = SineWave::new(amplitude, frequency, args.center)?;

    let mut config = SessionConfig::new(wave);
    config.axis = args.axis;
    config.period = Duration::from_millis(args.period_ms);
    config.calibration_timeout = seconds(args.calibration_timeout, "calibration timeout")?;
    config.duration = args
        .duration
        .map(|duration| seconds(duration, "duration"))
        .transpose()?;

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nReceived Ctrl+C, stopping...");
        handler_stop.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let link: Box<dyn Transport> = if args.simulate {
        Box::new(SimulatedODrive::new())
    } else {
        if args.port.is_none() {
            log::info!("waiting for ODrive...");
        }
        let discovery = Discovery {
            baud_rate: args.baud_rate,
            ..Discovery::default()
        };
        let port = transport::open(args.port.as_deref(), &discovery, &stop)
            .context("opening board")?;
        Box::new(port)
    };
    let mut device = ODrive::new(link, args.checksum);

    let result = session::run(&mut device, &config, &stop, |_, setpoint| {
        print!("Velocity: {setpoint:6.2}\r");
        let _ = io::stdout().flush();
    });
    println!();
    let report = result?;

    log::info!(
        "sent {} setpoints over {:.1}s",
        report.setpoints_sent,
        report.streamed_for.as_secs_f32()
    );
    if let ExitReason::LeftClosedLoop(state) = report.exit {
        log::warn!("axis left closed-loop control on its own and is now {state:?}");
    }
    if !report.errors.is_clean() {
        bail!("board reported faults: {}", report.errors);
    }
    Ok(())
}

use anyhow::Context;
use clap::Parser;
use odrive_sine::sim::SimulatedODrive;
use odrive_sine::transport::{self, Discovery};
use odrive_sine::{format_serial, ODrive, Transport};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Program that prints identity and fault state of a connected ODrive
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Serial port of the board. Waits for one on the USB bus when omitted
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Axis to report on
    #[arg(long, default_value_t = 0)]
    axis: u8,

    /// Append checksums to every request
    #[arg(long)]
    checksum: bool,

    /// Talk to a simulated board instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Only list serial ports that belong to a board
    #[arg(short, long)]
    list: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if args.list {
        for port in transport::ports()? {
            println!("{}", port.port_name);
        }
        return Ok(());
    }

    let link: Box<dyn Transport> = if args.simulate {
        Box::new(SimulatedODrive::new())
    } else {
        let discovery = Discovery {
            baud_rate: args.baud_rate,
            deadline: Some(Duration::from_secs(10)),
            ..Discovery::default()
        };
        // No Ctrl+C handler here, so the default signal behaviour interrupts discovery.
        let never = AtomicBool::new(false);
        let port = transport::open(args.port.as_deref(), &discovery, &never)
            .context("opening board")?;
        Box::new(port)
    };
    let mut device = ODrive::new(link, args.checksum);

    let serial = device.serial_number()?;
    println!("Serial number: {}", format_serial(serial));
    println!("Firmware version: {}", device.firmware_version()?);
    println!("Bus voltage: {:.2} V", device.vbus_voltage()?);
    println!("Axis {} state: {:?}", args.axis, device.current_state(args.axis)?);
    println!("{}", device.dump_errors(args.axis)?);
    Ok(())
}

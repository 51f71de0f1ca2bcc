// crestbus test application -- CLI tool for running a bus master or an
// emulated slave against real hardware or a mock bus.
//
// Usage:
//   crestbus-test-app master --port /dev/ttyUSB0 --slave 0x0B=dim8 --slave 0x11=io48 --polling
//   crestbus-test-app master --mock --slave 0x0B=dim8 --polling --configure 0x0B --dim 0x0B:1:255:500
//   crestbus-test-app slave --port /dev/ttyUSB1 --address 0x22
//   crestbus-test-app loopback --duration 2
//   crestbus-test-app encode dim --address 0x0B --channel 1 --level 255 --ramp 500
//   crestbus-test-app encode config --device dim8 --address 0x0B

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crestbus::master::templates::{step_frame, template_for};
use crestbus::master::{BusMaster, DimCommand, MasterBuilder};
use crestbus::slave::{BusSlave, SlaveBuilder};
use crestbus::{BusEvent, DeviceEvent, DeviceType, protocol};
use crestbus_test_harness::MockBus;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// crestbus test application -- exercises the bus master and slave from the
/// command line.
#[derive(Parser)]
#[command(name = "crestbus-test-app", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PortArgs {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    #[arg(long, conflicts_with = "mock")]
    port: Option<String>,

    /// Use an in-memory mock bus instead of a serial port.
    #[arg(long)]
    mock: bool,

    /// Override the line rate.
    #[arg(long)]
    baud: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a bus master.
    Master {
        #[command(flatten)]
        port: PortArgs,

        /// Register a slave as ADDRESS=TYPE (e.g. 0x0B=dim8). Repeatable.
        #[arg(long = "slave", value_parser = parse_slave)]
        slaves: Vec<(u8, DeviceType)>,

        /// Start round-robin polling.
        #[arg(long)]
        polling: bool,

        /// Request configuration of ADDRESS once it is online. Repeatable.
        #[arg(long = "configure", value_parser = parse_address)]
        configure: Vec<u8>,

        /// Send a dim command ADDRESS:CHANNEL:LEVEL[:RAMP_MS]. Repeatable.
        #[arg(long = "dim", value_parser = parse_dim)]
        dims: Vec<DimCommand>,

        /// How long to run, in seconds.
        #[arg(long, default_value_t = 5)]
        duration: u64,
    },

    /// Run an emulated slave device.
    Slave {
        #[command(flatten)]
        port: PortArgs,

        /// Bus address of the device.
        #[arg(long, default_value = "0x22", value_parser = parse_address)]
        address: u8,

        /// How long to run, in seconds.
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },

    /// Run a master and a slave against each other over a mock bus.
    Loopback {
        /// Address of the emulated slave.
        #[arg(long, default_value = "0x22", value_parser = parse_address)]
        address: u8,

        /// How long to run, in seconds.
        #[arg(long, default_value_t = 2)]
        duration: u64,
    },

    /// Print frames without touching the bus.
    Encode {
        #[command(subcommand)]
        frame: EncodeCommand,
    },
}

#[derive(Subcommand)]
enum EncodeCommand {
    /// A dim command.
    Dim {
        #[arg(long, value_parser = parse_address)]
        address: u8,
        #[arg(long)]
        channel: u8,
        #[arg(long)]
        level: u8,
        #[arg(long, default_value_t = 0)]
        ramp: u16,
        /// Use the universal-dimmer frame layout.
        #[arg(long)]
        long: bool,
    },

    /// The configuration sequence for a device.
    Config {
        #[arg(long)]
        device: DeviceType,
        #[arg(long, value_parser = parse_address)]
        address: Option<u8>,
    },

    /// Ping and switch frames.
    Ping {
        #[arg(long, value_parser = parse_address)]
        address: u8,
    },
}

// ---------------------------------------------------------------------------
// Argument parsers
// ---------------------------------------------------------------------------

fn parse_address(s: &str) -> std::result::Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

fn parse_slave(s: &str) -> std::result::Result<(u8, DeviceType), String> {
    let (address, device) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ADDRESS=TYPE, got '{s}'"))?;
    let device: DeviceType = device.parse().map_err(|e| format!("{e}"))?;
    Ok((parse_address(address)?, device))
}

fn parse_dim(s: &str) -> std::result::Result<DimCommand, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if !(3..=4).contains(&parts.len()) {
        return Err(format!("expected ADDRESS:CHANNEL:LEVEL[:RAMP_MS], got '{s}'"));
    }
    let address = parse_address(parts[0])?;
    let channel = parts[1]
        .parse()
        .map_err(|e| format!("invalid channel '{}': {e}", parts[1]))?;
    let level = parts[2]
        .parse()
        .map_err(|e| format!("invalid level '{}': {e}", parts[2]))?;
    let ramp_ms = match parts.get(3) {
        Some(ramp) => ramp
            .parse()
            .map_err(|e| format!("invalid ramp '{ramp}': {e}"))?,
        None => 0,
    };
    Ok(DimCommand::short(address, channel, level, ramp_ms))
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

// ---------------------------------------------------------------------------
// Master
// ---------------------------------------------------------------------------

async fn create_master(port: &PortArgs, slaves: &[(u8, DeviceType)], polling: bool) -> Result<BusMaster> {
    let mut builder = MasterBuilder::new().polling(polling);
    for &(address, device_type) in slaves {
        builder = builder.slave(address, device_type);
    }
    if let Some(baud) = port.baud {
        builder = builder.baud_rate(baud);
    }

    if port.mock {
        // Every registered slave answers its pings.
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        for &(address, _) in slaves {
            handle.expect_always(&protocol::ping_frame(address), &protocol::ping_response());
        }
        return builder
            .build_with_port(Box::new(bus))
            .await
            .context("failed to start master on mock bus");
    }

    let Some(path) = &port.port else {
        bail!("either --port or --mock is required");
    };
    builder
        .serial_port(path)
        .build()
        .await
        .with_context(|| format!("failed to start master on {path}"))
}

async fn print_status(master: &BusMaster) {
    let stats = master.stats().await;
    let transport = master.transport_stats();
    println!(
        "pings {}/{}  timeouts {}  unmatched {}  configured {}  unknown {}",
        stats.successful_pings,
        stats.total_pings,
        stats.timeouts,
        stats.unmatched_responses,
        stats.configurations,
        stats.unknown_frames,
    );
    println!(
        "tx {}  rx {}  errors {}  breaks {}",
        transport.transmitted, transport.received, transport.errors, transport.breaks
    );
    println!("online:  {}", hex(&master.get_online_slaves().await));
    println!("offline: {}", hex(&master.get_offline_slaves().await));
}

async fn cmd_master(
    port: &PortArgs,
    slaves: &[(u8, DeviceType)],
    polling: bool,
    configure: &[u8],
    dims: &[DimCommand],
    duration: u64,
) -> Result<()> {
    let master = create_master(port, slaves, polling).await?;
    tracing::info!(port = %master.port_name(), slaves = slaves.len(), polling, "master running");
    let mut events = master.subscribe();
    let mut pending: Vec<u8> = configure.to_vec();

    for dim in dims {
        master
            .send_dim_command(dim.address, dim.channel, dim.level, dim.ramp_ms)
            .await
            .with_context(|| format!("dim command to 0x{:02X} rejected", dim.address))?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    let mut status = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = status.tick() => print_status(&master).await,
            event = events.recv() => match event {
                Ok(BusEvent::SlaveStateChanged { address, from, to }) => {
                    println!("0x{address:02X}: {from} -> {to}");
                    if to.is_online() && pending.contains(&address) {
                        pending.retain(|a| *a != address);
                        if let Err(e) = master.request_configuration(address).await {
                            eprintln!("configuration of 0x{address:02X} not started: {e}");
                        }
                    }
                }
                Ok(event) => println!("{event:?}"),
                Err(e) => eprintln!("event stream: {e}"),
            },
        }
    }

    print_status(&master).await;
    master.deinitialize().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Slave
// ---------------------------------------------------------------------------

async fn run_slave(slave: &BusSlave, duration: u64) -> Result<()> {
    tracing::info!(
        port = %slave.handler().port_name(),
        address = format_args!("0x{:02X}", slave.address()),
        "slave running"
    );
    let mut events = slave.handler().subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(duration);
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            event = events.recv() => match event {
                Ok(DeviceEvent::PingAnswered) => {}
                Ok(event) => println!("{event:?}"),
                Err(e) => eprintln!("event stream: {e}"),
            },
        }
    }

    let stats = slave.handler().stats().await;
    println!(
        "pings {}  commands {}  errors {}  switch {}",
        stats.pings,
        stats.commands,
        stats.errors,
        if slave.handler().switch_state().await { "ON" } else { "OFF" }
    );
    slave.shutdown().await;
    Ok(())
}

async fn cmd_slave(port: &PortArgs, address: u8, duration: u64) -> Result<()> {
    let mut builder = SlaveBuilder::new().address(address);
    if let Some(baud) = port.baud {
        builder = builder.baud_rate(baud);
    }

    let slave = if port.mock {
        let bus = MockBus::new("mock");
        let handle = bus.handle();
        let slave = builder.build_with_port(Box::new(bus)).await?;
        // Feed the slave a ping and a switch command.
        handle.inject(&protocol::ping_frame(address));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.inject(&protocol::switch_command(address, true));
        slave
    } else {
        let Some(path) = &port.port else {
            bail!("either --port or --mock is required");
        };
        builder
            .serial_port(path)
            .build()
            .await
            .with_context(|| format!("failed to start slave on {path}"))?
    };

    run_slave(&slave, duration).await
}

// ---------------------------------------------------------------------------
// Loopback
// ---------------------------------------------------------------------------

async fn cmd_loopback(address: u8, duration: u64) -> Result<()> {
    let (master_end, slave_end) = MockBus::pair();

    let slave = SlaveBuilder::new()
        .address(address)
        .build_with_port(Box::new(slave_end))
        .await?;
    let master = MasterBuilder::new()
        .slave(address, DeviceType::Io48)
        .polling(true)
        .build_with_port(Box::new(master_end))
        .await?;

    tokio::time::sleep(Duration::from_secs(duration)).await;

    print_status(&master).await;
    println!("slave pings answered: {}", slave.handler().stats().await.pings);
    master.deinitialize().await;
    slave.shutdown().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

fn cmd_encode(frame: &EncodeCommand) {
    match frame {
        EncodeCommand::Dim {
            address,
            channel,
            level,
            ramp,
            long,
        } => {
            let dim = if *long {
                DimCommand::long(*address, *channel, *level, *ramp)
            } else {
                DimCommand::short(*address, *channel, *level, *ramp)
            };
            println!("{}", hex(&dim.encode()));
        }
        EncodeCommand::Config { device, address } => {
            let address = address.unwrap_or_else(|| device.default_address());
            for step in template_for(*device) {
                println!("{:<16} {}", step.step.to_string(), hex(&step_frame(address, step)));
            }
        }
        EncodeCommand::Ping { address } => {
            println!("ping          {}", hex(&protocol::ping_frame(*address)));
            println!("ping reply    {}", hex(&protocol::ping_response()));
            println!("switch on     {}", hex(&protocol::switch_command(*address, true)));
            println!("switch off    {}", hex(&protocol::switch_command(*address, false)));
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Command::Master {
            port,
            slaves,
            polling,
            configure,
            dims,
            duration,
        } => cmd_master(port, slaves, *polling, configure, dims, *duration).await,
        Command::Slave {
            port,
            address,
            duration,
        } => cmd_slave(port, *address, *duration).await,
        Command::Loopback { address, duration } => cmd_loopback(*address, *duration).await,
        Command::Encode { frame } => {
            cmd_encode(frame);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_address_hex_and_decimal() {
        assert_eq!(parse_address("0x0B"), Ok(0x0B));
        assert_eq!(parse_address("17"), Ok(17));
        assert!(parse_address("0x100").is_err());
    }

    #[test]
    fn parse_slave_arg() {
        assert_eq!(parse_slave("0x11=io48"), Ok((0x11, DeviceType::Io48)));
        assert!(parse_slave("0x11").is_err());
        assert!(parse_slave("0x11=dmx").is_err());
    }

    #[test]
    fn parse_dim_arg() {
        let dim = parse_dim("0x0B:1:255:500").unwrap();
        assert_eq!(dim, DimCommand::short(0x0B, 1, 255, 500));
        assert_eq!(parse_dim("0x0B:2:10").unwrap().ramp_ms, 0);
        assert!(parse_dim("0x0B:2").is_err());
    }

    #[test]
    fn cli_parses_master_command() {
        let cli = Cli::try_parse_from([
            "crestbus-test-app",
            "master",
            "--mock",
            "--slave",
            "0x0B=dim8",
            "--polling",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Master { polling: true, .. }));
    }
}

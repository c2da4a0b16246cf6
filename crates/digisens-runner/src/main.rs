//! `digisens` command-line front end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use digisens_bus::{SerialTransport, SessionConfig};
use digisens_protocol::{Baudrate, DeviceAddress, DEFAULT_BAUD_RATE};
use digisens_runner::app::{self, RunnerResult};
use digisens_runner::config::{DEFAULT_SETTLE_MS, DEFAULT_TIMEOUT_MS};
use digisens_runner::PollConfig;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Poll and configure DIGIsens load-cell controllers on RS485 buses.
#[derive(Parser, Debug)]
#[command(name = "digisens", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Line settings shared by the single-device commands.
#[derive(clap::Args, Debug)]
struct PortArgs {
    /// Serial port path
    #[arg(short, long)]
    port: String,

    /// Line rate
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Per-exchange timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Verify reply checksums
    #[arg(long)]
    strict: bool,
}

impl PortArgs {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            strict_checksum: self.strict,
        }
    }

    fn open(&self) -> RunnerResult<digisens_bus::Bus<SerialTransport>> {
        let transport = SerialTransport::open(&self.port, self.baud)?;
        Ok(app::single_device_bus(
            transport,
            Duration::from_millis(DEFAULT_SETTLE_MS),
        ))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Poll every device in a YAML configuration
    Poll {
        /// Path to the poll configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Stop after this many cycles (overrides the configuration)
        #[arg(long)]
        cycles: Option<u64>,

        /// Pause between cycles in milliseconds (overrides the configuration)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Poll simulated devices instead of opening serial ports
        #[arg(long)]
        simulate: bool,
    },

    /// Read model and firmware revision of one device
    Info {
        #[command(flatten)]
        port: PortArgs,

        /// Device id (3 characters standard, 16 extended)
        #[arg(short, long)]
        address: DeviceAddress,
    },

    /// Ask for the address of the device on the port.
    ///
    /// Every device answers this broadcast, so only use it with exactly one
    /// device connected.
    Discover {
        #[command(flatten)]
        port: PortArgs,

        /// Query the 16-character address space
        #[arg(long)]
        extended: bool,

        /// Try every supported line rate until the device answers
        #[arg(long)]
        scan: bool,
    },

    /// Store the current load of a channel as its zero reference
    Zero {
        #[command(flatten)]
        port: PortArgs,

        #[arg(short, long)]
        address: DeviceAddress,

        #[arg(long)]
        channel: u8,

        /// Confirm the sensor is unloaded (the write costs an EEPROM cycle)
        #[arg(long)]
        unloaded: bool,
    },

    /// Switch a device to a new line rate
    SetBaud {
        #[command(flatten)]
        port: PortArgs,

        #[arg(short, long)]
        address: DeviceAddress,

        /// New rate: 9600, 19200, 38400, 57600 or 115200
        #[arg(long)]
        to: u32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> RunnerResult<()> {
    match cli.command {
        Commands::Poll {
            config,
            cycles,
            interval_ms,
            simulate,
        } => {
            let config = PollConfig::from_file(&config)?;
            digisens_metrics::describe_metrics();

            let stop = Arc::new(AtomicBool::new(false));
            let handler_stop = stop.clone();
            ctrlc::set_handler(move || {
                info!("interrupt received; finishing the current cycle");
                handler_stop.store(true, Ordering::SeqCst);
            })?;

            let ran = app::poll(
                &config,
                simulate,
                cycles,
                interval_ms.map(Duration::from_millis),
                &stop,
            )?;
            info!("{} cycle(s) completed", ran);
        }
        Commands::Info { port, address } => {
            let mut bus = port.open()?;
            let info = app::device_info(&mut bus, address.clone(), port.session_config())?;
            info!("{}: model {:?}, revision {:?}", address, info.model, info.revision);
        }
        Commands::Discover {
            port,
            extended,
            scan,
        } => {
            let mut bus = port.open()?;
            if scan {
                let (baud, address) = app::scan(&mut bus, extended, port.session_config())?;
                info!("{}: device {} at {} baud", port.port, address, baud);
            } else {
                let address = app::discover(&mut bus, extended, port.session_config())?;
                info!("{}: device {}", port.port, address);
            }
        }
        Commands::Zero {
            port,
            address,
            channel,
            unloaded,
        } => {
            let mut bus = port.open()?;
            app::zero(&mut bus, address.clone(), channel, unloaded, port.session_config())?;
            info!("{}: channel {} zeroed", address, channel);
        }
        Commands::SetBaud { port, address, to } => {
            let baud = Baudrate::try_from(to)?;
            let mut bus = port.open()?;
            let info = app::set_baud(&mut bus, address.clone(), baud, port.session_config())?;
            info!("{} now at {} baud ({})", address, baud, info.model);
        }
    }
    Ok(())
}

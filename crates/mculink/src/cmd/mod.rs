use std::time::Duration;

use clap::{Args, Subcommand};
use mculink_mcu::{Endpoint, Mcu, McuConfig};

use crate::exit::{mcu_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod info;
pub mod listen;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Identify an MCU and print its dictionary summary.
    Info(InfoArgs),
    /// Send one command, optionally waiting for a response.
    Send(SendArgs),
    /// Print decoded messages from an MCU.
    Listen(ListenArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Info(args) => info::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Serial device path, or `unix:<path>` for a socket.
    pub device: String,
    /// Serial baud rate.
    #[arg(long, default_value_t = 250_000)]
    pub baud: u32,
    /// Name used for this MCU in logs and errors.
    #[arg(long, default_value = "mcu")]
    pub name: String,
    /// Response timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

impl DeviceArgs {
    /// Open the device and run the identify handshake.
    pub fn connect(&self) -> CliResult<Mcu> {
        let config = McuConfig {
            baud: self.baud,
            response_timeout: parse_duration(&self.timeout)?,
            ..McuConfig::named(&self.name)
        };
        let endpoint = Endpoint::parse(&self.device, self.baud);
        Mcu::connect(&endpoint, config).map_err(|err| mcu_error("connect failed", err))
    }
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Command text, e.g. `get_clock` or `set_pin oid=3 value=1`.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    pub command: Vec<String>,
    /// Wait for this response message and print it.
    #[arg(long, value_name = "NAME")]
    pub response: Option<String>,
}

impl SendArgs {
    pub fn command_text(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

/// Overrides `--log-level` with a full filter, e.g. `mculink_queue=trace`.
pub const LOG_ENV: &str = "MCULINK_LOG";

/// Crates that follow `--log-level`; everything else stays at warn.
const LINK_TARGETS: &[&str] = &[
    "mculink",
    "mculink_mcu",
    "mculink_queue",
    "mculink_dict",
    "mculink_frame",
    "mculink_transport",
];

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn default_directives(level: LogLevel) -> String {
    let mut directives = String::from("warn");
    for target in LINK_TARGETS {
        directives.push_str(&format!(",{target}={}", level.directive()));
    }
    directives
}

/// Log to stderr; stdout carries command output only.
///
/// Events carry the emitting thread so the serial I/O thread of each MCU
/// (`<name>-serialqueue`) can be told apart.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true)
        .with_target(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}

/*!
 * Wheelwright CLI - build worker entry point
 *
 * Version: 0.3.0
 */

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use wheelwright::{
    config::{parse_duration, LogLevel, WorkerConfig},
    error::{Result, EXIT_PRIVILEGED, EXIT_SUCCESS},
    logging, process, BuildTarget, Slave, SystemdNotifier, VERSION,
};

#[derive(Parser)]
#[command(name = "wheelwright")]
#[command(version, about = "Build worker: builds Python wheels on behalf of a build coordinator", long_about = None)]
struct Cli {
    /// Hostname or address of the build coordinator
    #[arg(short = 'm', long, value_name = "HOST", env = "WHEELWRIGHT_MASTER")]
    master: Option<String>,

    /// Time to wait before assuming a build has failed (e.g. 3h, 90m, 1h30m, 3600)
    #[arg(
        short = 't',
        long,
        value_name = "DURATION",
        value_parser = parse_duration,
        env = "WHEELWRIGHT_TIMEOUT"
    )]
    timeout: Option<Duration>,

    /// Path to config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Executable used to build wheels
    #[arg(long, value_name = "PATH")]
    build_tool: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, value_enum)]
    log_level: Option<LogLevelArg>,

    /// Path to log file (default: stderr)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Enable verbose logging (equivalent to --log-level=debug)
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevelArg {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevelArg> for LogLevel {
    fn from(arg: LogLevelArg) -> Self {
        match arg {
            LogLevelArg::Error => LogLevel::Error,
            LogLevelArg::Warn => LogLevel::Warn,
            LogLevelArg::Info => LogLevel::Info,
            LogLevelArg::Debug => LogLevel::Debug,
            LogLevelArg::Trace => LogLevel::Trace,
        }
    }
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = build_config(cli)?;

    if let Err(e) = logging::init_logging(&config) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    tracing::info!("Wheelwright build worker version {}", VERSION);
    if process::is_privileged() {
        tracing::error!("Worker must not be run as root");
        return Ok(EXIT_PRIVILEGED);
    }

    if let Err(e) = process::install_interrupt_handler() {
        tracing::warn!(error = %e, "Unable to install interrupt handler");
    }

    let target = BuildTarget::resolve(&config)?;
    tracing::info!(
        impl_tag = %target.impl_tag,
        abi_tag = %target.abi_tag,
        platform_tag = %target.platform_tag,
        master = %config.master,
        "Serving build target"
    );

    let mut slave = Slave::new(config, target, Box::new(SystemdNotifier::from_env()));
    match slave.run() {
        Ok(()) => Ok(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(e.exit_code())
        }
    }
}

/// Config file (if any) with command-line overrides applied
fn build_config(cli: Cli) -> Result<WorkerConfig> {
    let mut config = match cli.config {
        Some(ref path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };

    if let Some(master) = cli.master {
        config.master = master;
    }
    if let Some(timeout) = cli.timeout {
        config.build_timeout_secs = timeout.as_secs();
    }
    if let Some(build_tool) = cli.build_tool {
        config.build_tool = build_tool;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level.into();
    }
    if cli.log_file.is_some() {
        config.log_file = cli.log_file;
    }
    config.verbose |= cli.verbose;
    Ok(config)
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::LevelFilter;

use osmux::config::{Config, DEFAULT_BACKING_STORE_PATH, DEFAULT_CONFIG_PATH};
use osmux::shell;

#[derive(Parser, Debug)]
#[command(
    name = "osmux",
    about = "Educational multi-core process multiplexer with demand-paged virtual memory"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Path of the backing store file
    #[arg(short, long, default_value = DEFAULT_BACKING_STORE_PATH)]
    backing_store: PathBuf,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(short, long, default_value = "warn", value_parser = parse_log_level)]
    log_level: LevelFilter,
}

fn parse_log_level(s: &str) -> Result<LevelFilter, String> {
    s.parse::<LevelFilter>()
        .map_err(|e| format!("invalid log level '{s}': {e}"))
}

/// Minimal stderr logger behind the `log` facade.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn main() -> ExitCode {
    let args = Args::parse();

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(args.log_level);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("osmux: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> osmux::Result<()> {
    let mut config = Config::load(&args.config)?;
    config.backing_store = args.backing_store.clone();
    shell::run(config)
}

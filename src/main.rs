use std::ffi::OsStr;
use std::path::Path;

use clap::Parser;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use uplink::config::{AppConfig, LogConfig};
use uplink::program::{Cli, Program};

/// Terminal logging always; an extra non-blocking file layer when the config
/// names a log file. The guard must outlive the run so the file is flushed.
fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    if config.file.is_empty() {
        registry.init();
        return None;
    }
    let path = Path::new(&config.file);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path.file_name().unwrap_or_else(|| OsStr::new("uplink.log"));
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Some(guard)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match AppConfig::load(&cli.config, &cli.overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("uplink: {e}");
            std::process::exit(1);
        }
    };
    let guard = init_logging(&config.log);

    let code = match Program::run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    drop(guard);
    std::process::exit(code);
}

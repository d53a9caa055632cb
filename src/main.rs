use anyhow::Context;
use tracing_subscriber::EnvFilter;

mod cli;
use cli::{USAGE, parse_cli_mode};

use gcal_mirror::storage::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let cli_mode = match parse_cli_mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("Error: {}", err);
            println!("{}", USAGE);
            return Ok(());
        }
    };

    let config = Config::load_or_create().context("Failed to load configuration")?;
    for problem in config.validate() {
        eprintln!("Configuration: {}", problem);
        tracing::warn!("Configuration problem: {}", problem);
    }

    if let Err(e) = cli::run(cli_mode, config).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }

    Ok(())
}

fn setup_logging() {
    let log_dir = Config::config_dir();

    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "gcal-mirror.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .init();

    std::mem::forget(_guard);

    tracing::info!("gcal-mirror started");
}

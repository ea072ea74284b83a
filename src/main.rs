mod config;
mod custom_command;
mod errors;
mod ffmpeg;
mod health;
mod monitor;
mod switcher;
mod watchdog_manager;

use std::sync::Arc;

use clap::Parser;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, SimpleLogger, TermLogger, TerminalMode};
use stream_backend::create_backend;

use crate::config::{Args, Config};
use crate::custom_command::CustomCommand;
use crate::errors::WatchdogError;
use crate::switcher::Switcher;
use crate::watchdog_manager::WatchdogManager;

fn setup_logging(level: &str) -> Result<(), WatchdogError> {
    let level: LevelFilter = level
        .parse()
        .map_err(|_| WatchdogError::Config(format!("unknown log level '{level}'")))?;
    let log_config = ConfigBuilder::new()
        .set_target_level(LevelFilter::Error)
        .set_thread_level(LevelFilter::Off)
        .add_filter_ignore_str("reqwest")
        .add_filter_ignore_str("hyper")
        .build();

    // no terminal attached (e.g. inside a container), fall back to plain output
    if TermLogger::init(
        level,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .is_err()
    {
        SimpleLogger::init(level, log_config)?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => log::info!("Received Ctrl-C, shutting down"),
                    _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                log::warn!("Failed to register SIGTERM handler: {}", e);
                let _ = ctrl_c.await;
                log::info!("Received Ctrl-C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        log::info!("Received Ctrl-C, shutting down");
    }
}

#[tokio::main]
async fn main() -> Result<(), WatchdogError> {
    let args = Args::parse();
    let config = Config::from_args(&args)?;
    setup_logging(&config.log_level)?;

    log::info!("Stream watchdog v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using ffmpeg at {}", config.ffmpeg_path.display());

    let backend_type = config.backend_type()?;
    let server_url = config
        .server_url()
        .ok_or_else(|| WatchdogError::Config("SERVER_URL is not defined".to_string()))?;
    log::info!("Watching {} at {}", backend_type, server_url);
    if config.error_detection_enabled() {
        log::info!(
            "Decoder error detection enabled: {} errors within {}s trigger a switch",
            config.error_threshold,
            config.error_reset_time
        );
    } else {
        log::info!("Decoder error detection disabled");
    }

    let custom_command = config
        .custom_command()
        .map(|command| CustomCommand::parse(command, config.custom_command_timeout()))
        .transpose()?;
    if let Some(command) = &custom_command {
        log::info!("Custom command on switch: {}", command.program());
    }

    let backend = create_backend(backend_type, server_url, config.credentials())?;
    let switcher = Arc::new(Switcher::new(Arc::from(backend), custom_command));
    let mut manager = WatchdogManager::new(&config, switcher);

    manager.run(shutdown_signal()).await;
    log::info!("Stream watchdog stopped");
    Ok(())
}

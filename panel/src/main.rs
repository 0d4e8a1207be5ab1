//! dockpanel - Entry Point
//!
//! Serves the panel API for the container runtime of this host.

use std::collections::HashMap;
use std::env;

use dockpanel::app::options::AppOptions;
use dockpanel::app::run::run;
use dockpanel::logs::{init_logging, LogOptions};
use dockpanel::storage::layout::StorageLayout;
use dockpanel::storage::settings::Settings;
use dockpanel::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to print version: {e}"),
        }
        return;
    }

    let layout = match cli_args.get("data-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, defaults when there is none
    let settings_file = layout.settings_file();
    let (mut settings, settings_error) = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => (settings, None),
            Err(e) => (Settings::default(), Some(e)),
        }
    } else {
        (Settings::default(), None)
    };

    if let Some(port) = cli_args.get("port") {
        match port.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(e) => {
                eprintln!("Invalid --port {}: {e}", port);
                return;
            }
        }
    }

    if cli_args.contains_key("print-settings") {
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to print settings: {e}"),
        }
        return;
    }

    // Initialize logging
    if settings.log_to_file {
        if let Err(e) = layout.logs_dir().create().await {
            eprintln!("Failed to create the logs directory: {e}");
        }
    }
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Some(e) = settings_error {
        warn!("Unable to read settings file, using defaults: {}", e);
    }

    // Run the panel
    let options = AppOptions::from_settings(&settings, layout);
    info!("Running dockpanel {} with options: {:?}", version.version, options);
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run dockpanel: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}

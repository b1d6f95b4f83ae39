//! Lightpanel - Main Entry Point
//!
//! Terminal shell for the toggle-light panel: loads the configuration, runs
//! one MQTT session and maps typed commands onto light commands.

use clap::{Parser, Subcommand};
use lightpanel::config::{AppConfig, ConfigError};
use lightpanel::light::{LightPanel, PanelCommand};
use lightpanel::observability::{init_default_logging, init_logging, LogFormat};
use lightpanel::session::{MqttSession, SessionOptions};
use lightpanel::transport::mqtt::{MqttError, RumqttClient};
use lightpanel::{PanelError, PanelResult};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};
use uuid::Uuid;

/// Toggle-light control panel over MQTT
#[derive(Parser)]
#[command(name = "lightpanel")]
#[command(about = "Toggle a light over MQTT from the terminal")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LIGHTPANEL_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); LOG_LEVEL is used otherwise
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and run the panel
    Run {
        /// Append a random segment to the base topic so the demo is isolated
        #[arg(long)]
        unique_topic: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: &[&str] = &["lightpanel.toml", "config/lightpanel.toml"];

type AppResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::from_env(), false),
        _ => init_logging(Level::TRACE, LogFormat::from_env(), true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!("Starting lightpanel v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { unique_topic } => run_panel(config, unique_topic).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&Path>) -> AppResult<AppConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AppConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = Path::new(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(AppConfig::load_from_file(path)?);
        }
    }

    Err(format!(
        "No configuration file found. Provide one with -c/--config or create {}",
        DEFAULT_CONFIG_PATHS.join(" or ")
    )
    .into())
}

fn handle_config_command(config: &AppConfig, show: bool) -> AppResult<()> {
    // Resolves credentials too, so missing environment variables surface here
    let mqtt = config.mqtt_config()?;

    if show {
        println!("Current configuration:");
        println!(
            "{}",
            toml::to_string_pretty(config).map_err(ConfigError::from)?
        );
        println!("Subscriptions: {}", mqtt.subscribe_topics.join(", "));
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn run_panel(mut config: AppConfig, unique_topic: bool) -> AppResult<()> {
    if unique_topic {
        config.light.base_topic = format!(
            "{}/{}",
            config.light.base_topic.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
    }

    let mqtt = config.mqtt_config()?;
    let panel = Arc::new(LightPanel::from_section(&config.light));
    info!(
        state_topic = %panel.state_topic(),
        command_topic = %panel.command_topic(),
        "Light topics"
    );

    let session = MqttSession::with_options(
        mqtt,
        RumqttClient::new(),
        SessionOptions::from_app_config(&config),
    )
    .with_handler(panel.clone());

    session.start().await;
    if !session.is_running() {
        return Err(PanelError::from(MqttError::NotConnected {
            state: session.state(),
        })
        .into());
    }

    let outcome = session.send(panel.initial_state_message()).await;
    if !outcome.is_queued() {
        warn!(outcome = %outcome, "Initial light state was not published");
    }

    let mut view_rx = panel.subscribe();
    let printer = tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let line = view_rx.borrow_and_update().status_line();
            println!("{line}");
        }
    });

    println!("{}", panel.view().status_line());
    println!("{}", PanelCommand::HELP);

    let result = command_loop(&session, &panel).await;

    printer.abort();
    session.stop().await;
    result.map_err(Into::into)
}

async fn command_loop(session: &MqttSession<RumqttClient>, panel: &LightPanel) -> PanelResult<()> {
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                return Ok(());
            }
            _ = monitor_connection_health(session) => {
                error!(
                    state = %session.state(),
                    "MQTT session is no longer serviced, shutting down..."
                );
                return Ok(());
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Input closed, shutting down...");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match PanelCommand::parse(&line) {
                    Ok(PanelCommand::Quit) => return Ok(()),
                    Ok(command) => execute_command(session, panel, command).await,
                    Err(e) => println!("{e}. {}", PanelCommand::HELP),
                }
            }
        }
    }
}

async fn execute_command(
    session: &MqttSession<RumqttClient>,
    panel: &LightPanel,
    command: PanelCommand,
) {
    let message = match command {
        PanelCommand::Toggle if !panel.view().toggle_enabled => {
            println!("Waiting for status... toggle is disabled until the light reports");
            return;
        }
        PanelCommand::Toggle => panel.toggle_command(),
        PanelCommand::On => panel.set_command(true),
        PanelCommand::Off => panel.set_command(false),
        PanelCommand::Status => {
            println!("{}", panel.view().status_line());
            println!("Connection: {}", session.state());
            return;
        }
        PanelCommand::Help | PanelCommand::Quit => {
            println!("{}", PanelCommand::HELP);
            return;
        }
    };

    let outcome = session.send(message).await;
    if !outcome.is_queued() {
        println!("Command not sent: {outcome}");
    }
}

/// Resolves once the session can no longer recover on its own
async fn monitor_connection_health(session: &MqttSession<RumqttClient>) {
    loop {
        if session.is_permanently_disconnected() || !session.is_ticking().await {
            break;
        }
        sleep(Duration::from_millis(250)).await;
    }
}

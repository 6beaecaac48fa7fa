//! hass-link CLI - terminal client for the Home Assistant WebSocket API
//!
//! # Usage
//!
//! ```bash
//! # One-shot commands
//! hass-link -u http://homeassistant.local:8123 --token <TOKEN> states
//! hass-link call light turn_on --data '{"entity_id": "light.kitchen"}'
//!
//! # Stream events until Ctrl+C
//! RUST_LOG=hass_link=debug hass-link watch --event-type state_changed
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;

use hass_link::{
    auth::ArcAuthProvider, config::default_config_path, Auth, Connection, EventHandlers,
    FileTokenStore, HassLinkError, LinkConfiguration, LongLivedToken, Result,
};

/// Terminal client for the Home Assistant WebSocket API
#[derive(Parser, Debug)]
#[command(name = "hass-link")]
#[command(version)]
#[command(about = "Talk to Home Assistant over its WebSocket API", long_about = None)]
struct Cli {
    /// Home Assistant URL (e.g., http://homeassistant.local:8123)
    #[arg(short = 'u', long = "url", env = "HASS_URL")]
    url: Option<String>,

    /// Long-lived access token
    #[arg(long = "token", env = "HASS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Configuration file
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Retries for the initial connection (-1 = forever)
    #[arg(long = "retry")]
    retry: Option<i32>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip a ping
    Ping,
    /// Print all entity states
    States,
    /// Print the core configuration
    Config,
    /// Print the service registry
    Services,
    /// Call a service
    Call {
        domain: String,
        service: String,
        /// Service data as a JSON object
        #[arg(long = "data")]
        data: Option<String>,
    },
    /// Print bus events until interrupted
    Watch {
        /// Only events of this type
        #[arg(long = "event-type")]
        event_type: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();
}

fn resolve_auth(cli: &Cli, config: &LinkConfiguration) -> Result<ArcAuthProvider> {
    if let Some(token) = cli.token.as_deref().or_else(|| config.access_token()) {
        return Ok(Arc::new(LongLivedToken::new(token)));
    }
    if let Some(path) = config.token_file() {
        if let Some(auth) = Auth::load(Arc::new(FileTokenStore::new(&path)))? {
            return Ok(Arc::new(auth));
        }
        return Err(HassLinkError::ConfigurationError(format!(
            "Token file '{}' holds no tokens",
            path.display()
        )));
    }
    Err(HassLinkError::ConfigurationError(
        "No credentials: pass --token, set HASS_TOKEN, or configure [auth]".to_string(),
    ))
}

fn print_json(value: &JsonValue) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(i32::from(e.code().unwrap_or(1)).max(1));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = LinkConfiguration::load(&config_path)?;

    let mut options = config.to_connection_options();
    if let Some(url) = cli.url.clone() {
        options.url = url;
    }
    if let Some(retry) = cli.retry {
        options.setup_retry = retry;
    }
    let auth = resolve_auth(&cli, &config)?;

    let handlers = EventHandlers::new()
        .on_disconnected(|reason| log::warn!("Disconnected: {}", reason))
        .on_ready(|| log::info!("Reconnected"))
        .on_reconnect_error(|err| eprintln!("Gave up reconnecting: {}", err));

    let connection = Connection::builder()
        .options(options)
        .auth_provider(auth)
        .timeouts(config.to_timeouts())
        .event_handlers(handlers)
        .connect()
        .await?;
    log::info!(
        "Connected to Home Assistant {}",
        connection.ha_version().as_deref().unwrap_or("(unknown version)")
    );

    let outcome = execute(&connection, cli.command).await;
    connection.close().await;
    outcome
}

async fn execute(connection: &Connection, command: Command) -> Result<()> {
    match command {
        Command::Ping => {
            let started = std::time::Instant::now();
            connection.ping().await?;
            println!("pong in {:?}", started.elapsed());
        },
        Command::States => print_json(&connection.get_states().await?)?,
        Command::Config => print_json(&connection.get_config().await?)?,
        Command::Services => print_json(&connection.get_services().await?)?,
        Command::Call {
            domain,
            service,
            data,
        } => {
            let data = data
                .map(|raw| serde_json::from_str::<JsonValue>(&raw))
                .transpose()
                .map_err(|e| HassLinkError::ConfigurationError(format!("Invalid --data JSON: {}", e)))?;
            print_json(&connection.call_service(&domain, &service, data).await?)?;
        },
        Command::Watch { event_type } => {
            let subscription = connection
                .subscribe_events(
                    |event| match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::warn!("Unprintable event: {}", e),
                    },
                    event_type.as_deref(),
                )
                .await?;
            eprintln!("Watching events, press Ctrl+C to stop");
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| HassLinkError::InternalError(format!("Signal handler failed: {}", e)))?;
            subscription.unsubscribe().await?;
        },
    }
    Ok(())
}

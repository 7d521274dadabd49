//! Block Tutor CLI
//!
//! Runs the relay between the Blockly editor and the chat-completion API.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tutor_server::{create_router, AppState, Config, RateLimitBackend};

/// Block Tutor - Blockly programming tutor relay
///
/// Forwards editor requests to a chat-completion API, streams the answers
/// back and rate-limits clients by IP.
#[derive(Parser, Debug)]
#[command(name = "block-tutor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: block-tutor.json in current directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Address to bind (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // A missing .env file is fine; real environment variables take precedence.
    dotenvy::dotenv().ok();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Block Tutor starting");
    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Loads the configuration, binds the listener and serves until Ctrl+C.
async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.apply_env();
    config.validate()?;

    print_config(&config);

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::from_config(config)?;
    let router = create_router(state);

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {addr}: {e}\n\nSuggestion: Try a different port with --port"
        )
    })?;

    println!("Relay running on http://{addr}");
    println!("Press Ctrl+C to stop");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Relay stopped");
    Ok(())
}

/// Resolves once Ctrl+C is received.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    println!();
    println!("Shutting down...");
}

/// Loads configuration from the specified path or default location.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    match config_path {
        Some(path_str) => {
            let path = Path::new(path_str);
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: '{}'\n\nSuggestion: Check the path or remove the --config flag to use defaults",
                    path.display()
                );
            }
            Ok(Config::load_from_file(path)?)
        }
        None => Ok(Config::load()?),
    }
}

/// Prints the loaded configuration.
fn print_config(config: &Config) {
    println!("Configuration loaded:");
    println!("  Chat API: {}", config.openai_base_url);
    println!("  Build model: {}", config.models.build);
    println!("  Insight model: {}", config.models.insight);
    println!("  Typing delay: {}ms", config.typing_delay_ms);
    println!("  Allowed origins: {}", config.allowed_origins.join(", "));
    if config.rate_limit.enabled {
        let backend = match config.rate_limit.backend {
            RateLimitBackend::Memory => "memory",
            RateLimitBackend::Upstash => "upstash",
        };
        println!(
            "  Rate limit: {} requests / {}s per IP ({backend})",
            config.rate_limit.limit, config.rate_limit.window_secs
        );
    } else {
        println!("  Rate limit: disabled");
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use framegate::config::{Config, ConfigError};
use framegate::Framegate;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "framegate")]
#[command(about = "A consistent-hashing proxy for length-prefixed RPC traffic")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/framegate.toml")]
        config: PathBuf,
        /// Override the client-facing port
        #[arg(long)]
        service_port: Option<u16>,
        /// Override the backend list (comma separated host:port)
        #[arg(long, value_delimiter = ',')]
        backends: Option<Vec<String>>,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            service_port,
            backends,
        } => {
            run_framegate(config, service_port, backends).await?;
        }
        Commands::Config { output } => {
            generate_config(output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_framegate(
    config_path: PathBuf,
    service_port: Option<u16>,
    backends: Option<Vec<String>>,
) -> Result<()> {
    let mut config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config
        .apply_overrides(service_port, backends)
        .context("Invalid command line overrides")?;

    init_logging(&config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting framegate");
    info!(config = ?config_path, "Configuration loaded");

    let proxy = Framegate::bind(config)
        .await
        .context("Failed to start framegate")?;

    proxy.run(shutdown_signal()).await?;

    info!("Framegate stopped");
    Ok(())
}

/// Resolves on Ctrl-C. If the handler cannot be installed the proxy runs
/// until killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  framegate run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Listen address: {}", config.listen_addr());
            if let Some(debug_addr) = config.debug_addr() {
                println!("  Debug endpoint: {}", debug_addr);
            }
            println!("  Connections per backend: {}", config.proxy.server_connection);
            println!("  Max frame size: {} bytes", config.proxy.max_frame_size);
            println!("  Backends: {} instances", config.proxy.backends.len());
            for (i, backend) in config.proxy.backends.iter().enumerate() {
                println!("    {}: {}", i + 1, backend);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("framegate v{}", env!("CARGO_PKG_VERSION"));
    println!("A consistent-hashing proxy for length-prefixed RPC traffic");
    println!();
    println!(
        "Built with Rust {}",
        option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
    );
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Routing-key based backend selection on a ketama hash ring");
    println!("  • Bounded per-backend connection pools with eviction on failure");
    println!("  • Strictly ordered request/response per client connection");
    println!("  • Graceful shutdown with session draining");
}

fn init_logging(config: &Config) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
    .context("Failed to initialize logging")?;

    info!(level = %config.logging.level, format = %config.logging.format, "Logging initialized");
    Ok(())
}

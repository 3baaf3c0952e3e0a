use anyhow::Context;
use clap::{Parser, Subcommand};
use siridb_http::config::{Config, ConfigError};
use siridb_http::core::ExitReason;
use siridb_http::Gateway;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "siridb-http")]
#[command(about = "HTTP and WebSocket gateway for SiriDB")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "siridb-http.toml")]
        config: PathBuf,
        /// Log at debug level regardless of the configured level
        #[arg(short, long)]
        verbose: bool,
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
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, verbose } => {
            let reason = run_gateway(config, verbose).await?;
            if let ExitReason::Fatal(msg) = &reason {
                eprintln!("{}", msg);
                std::process::exit(reason.exit_code());
            }
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

async fn run_gateway(config_path: PathBuf, verbose: bool) -> anyhow::Result<ExitReason> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config, verbose)?;

    info!("Starting siridb-http v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);
    info!(
        "Database '{}' on {}",
        config.database.dbname, config.database.servers
    );

    let reason = Gateway::new(config)
        .run()
        .await
        .context("Failed to run siridb-http")?;

    info!("Stopped ({:?})", reason);
    Ok(reason)
}

fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  siridb-http run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Database: {}", config.database.dbname);
            println!("  Listen address: {}", config.server.bind_addr());
            println!("  Authentication required: {}", config.server.require_authentication);
            println!("  Multi-user: {}", config.server.enable_multi_user);
            println!("  Socket transport: {}", config.server.enable_socket);

            let servers = config.database.addresses()?;
            println!("  SiriDB servers: {} instances", servers.len());
            for (i, server) in servers.iter().enumerate() {
                println!("    {}: {}", i + 1, server);
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
    println!("siridb-http v{}", env!("CARGO_PKG_VERSION"));
    println!("HTTP and WebSocket gateway for SiriDB");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.logging.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", level);
    Ok(())
}

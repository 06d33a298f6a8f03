//! CLI entry point for the OTR messenger.
//!
//! Runs a messenger node with its interactive input loop, and offers key,
//! configuration and history management.

use anyhow::Result;
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{error, info};
use otr_messenger::{
    crypto::IdentityKeyPair,
    session::ProtocolType,
    utils::{MessengerConfig, DEFAULT_CONFIG_FILE},
    App,
};
use std::path::PathBuf;
use tokio::signal;

/// OTR Messenger - encrypted peer-to-peer conversations
#[derive(Parser)]
#[command(name = "messenger")]
#[command(about = "A peer-to-peer messenger with OTR-style encrypted sessions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and the message database
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the messenger
    Run {
        /// Port to listen on and dial peers at
        #[arg(short, long)]
        port: Option<u16>,
        /// Address peers reach this node on
        #[arg(short, long)]
        address: Option<String>,
        /// Protocol for sessions this node starts (otr, ratchet)
        #[arg(long)]
        protocol: Option<ProtocolType>,
    },
    /// Manage the identity key
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Print the stored conversation with a peer
    History {
        /// Peer address
        peer: String,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new identity key
    Generate {
        /// Force overwrite of an existing key
        #[arg(short, long)]
        force: bool,
    },
    /// Display the public key and routing id
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = MessengerConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config = config.with_data_dir(data_dir);
    }

    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    match cli.command {
        Commands::Run {
            port,
            address,
            protocol,
        } => handle_run_command(port, address, protocol, config).await,
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::History { peer } => handle_history_command(peer, config).await,
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

async fn handle_run_command(
    port: Option<u16>,
    address: Option<String>,
    protocol: Option<ProtocolType>,
    mut config: MessengerConfig,
) -> Result<()> {
    if let Some(port) = port {
        config.network.listen_port = port;
    }
    if let Some(address) = address {
        config.identity.address = address;
    }
    if let Some(protocol) = protocol {
        config.session.default_protocol = protocol;
    }

    info!("Port: {}", config.network.listen_port);
    info!("Default protocol: {}", config.session.default_protocol);

    let app = App::new(config)?;

    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Cannot listen for CTRL+C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                error!("Application error: {e}");
                return Err(e.into());
            }
        }
        () = shutdown_signal => {
            info!("Shutting down gracefully...");
        }
    }

    Ok(())
}

fn handle_key_commands(action: KeyCommands, config: &MessengerConfig) -> Result<()> {
    let key_path = App::identity_key_path(config);
    match action {
        KeyCommands::Generate { force } => {
            if key_path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "Identity key already exists. Use --force to overwrite."
                ));
            }
            config.ensure_directories()?;

            let keypair = IdentityKeyPair::generate();
            keypair.save_secret_key(&key_path)?;

            println!("✓ Identity key generated");
            println!("  Routing id: {}", keypair.default_routing_id());
            println!("  Saved to: {}", key_path.display());
        }
        KeyCommands::Show { format } => {
            if !key_path.exists() {
                return Err(anyhow::anyhow!(
                    "No identity key at {}. Run `messenger keys generate` first.",
                    key_path.display()
                ));
            }
            let keypair = IdentityKeyPair::from_secret_bytes(&std::fs::read(&key_path)?)?;
            let public_key = keypair.public_key_bytes();

            match format.as_str() {
                "hex" => println!("{}", hex::encode(public_key)),
                "base64" => println!("{}", general_purpose::STANDARD.encode(public_key)),
                _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
            }
            println!("Routing id: {}", keypair.default_routing_id());
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &MessengerConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            MessengerConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                MessengerConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

async fn handle_history_command(peer: String, config: MessengerConfig) -> Result<()> {
    let app = App::new(config)?;
    app.restore().await?;

    let messages = app.router().history(&peer).await?;
    if messages.is_empty() {
        println!("No stored messages with {peer}");
    }
    for message in messages {
        println!(
            "[{}] {:<8} {}",
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            message.direction,
            message.text
        );
    }
    Ok(())
}

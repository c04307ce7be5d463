use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use obfusc::config::load_config;
use obfusc::Relay;

#[derive(Parser)]
#[command(name = "obfusc", version, about = "WireGuard traffic obfuscating relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay (default when no subcommand given)
    Run,
    /// Validate config file syntax and semantics
    Check,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::Run) | None => cmd_run(&cli.config),
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_run(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(&config.log_level);

    info!(listen = %config.listen, forward = %config.forward, "obfusc starting");

    let mut relay = Relay::new(config)?;
    relay.run()?;
    Ok(())
}

fn cmd_check(config_path: &str) -> Result<()> {
    match load_config(config_path) {
        Ok(config) => {
            println!("config '{}' is valid", config_path);
            println!("  listen:  {}", config.listen);
            println!("  forward: {}", config.forward);
            println!("  thread_mode: {:?}", config.thread_mode);
            Ok(())
        }
        Err(e) => {
            eprintln!("config '{}' has errors:", config_path);
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

mod commands;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use nexus_store::config::Config;
use nexus_store::logging;

#[derive(Parser, Debug)]
#[command(name = "nexus-store")]
#[command(about = "Inspect and maintain the encrypted Otakus Nexus local store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nexus-store/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Store database to open, overriding storage.path
  #[arg(short, long)]
  store: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Override store path if specified on command line
  if let Some(store) = args.store {
    config.storage.path = Some(store);
  }

  let _log_guard = logging::init(&config.logging)?;

  let output = commands::run(args.command, &config).await?;
  if !output.is_empty() {
    println!("{}", output);
  }

  Ok(())
}

//! pairlink CLI binary entry point.

use clap::Parser;
use pairlink::cli::{Cli, Commands, LinkCommands};
use pairlink::config::PairlinkConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairlink=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match PairlinkConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    };
    let config = match cli.base_url {
        Some(url) => config.with_base_url(url),
        None => config,
    };

    let result = match cli.command {
        Commands::Link(link) => match link.command {
            LinkCommands::Pair(args) => pairlink::cli::link::handle_pair(&config, &args.account).await,
            LinkCommands::Device(args) => {
                pairlink::cli::link::handle_device(&config, &args.account, args.scopes).await
            }
        },
        Commands::Status => pairlink::cli::link::handle_status(&config).await,
        Commands::Unlink(args) => pairlink::cli::link::handle_unlink(&config, &args.account).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

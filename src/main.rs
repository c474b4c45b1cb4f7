use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "End-to-end encrypted chat through a blind relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the other client connected to a relay
    Chat {
        /// Relay server address
        host: String,
        /// Relay server port
        port: u16,
    },
    /// Run the relay server
    Relay {
        /// Address to bind to
        host: String,
        /// Port to bind to
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Chat { host, port } => {
            ferry::commands::chat::run(&host, port).await?;
        }
        Commands::Relay { host, port } => {
            ferry::commands::relay::run(&host, port).await?;
        }
    }

    Ok(())
}

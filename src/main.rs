use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{Config, LeaseQueryServer, Leases, Result};

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about = "DHCP lease store with a bulk lease-query listener", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve bulk lease queries (default)
    Run,
    /// Print the effective configuration
    ShowConfig,
    /// Print stored leases
    ListLeases,
    /// Remove expired leases from the lease file
    CleanupLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting lease query server with config: {:?}", cli.config);
            let server = LeaseQueryServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(error) = server.stop().await {
                        tracing::error!("Failed to save leases on shutdown: {}", error);
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let store = Leases::new(config.lease_database).await?;
            let leases = store.list_leases().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<40} {:<6} {:<24} {:<24} {:<10}",
                    "Address", "Type", "Client ID", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(108));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    let address = if lease.prefix_len < 128 && lease.is_v6() {
                        format!("{}/{}", lease.address, lease.prefix_len)
                    } else {
                        lease.address.to_string()
                    };

                    println!(
                        "{:<40} {:<6} {:<24} {:<24} {:<10}",
                        address,
                        lease.lease_type,
                        hex::encode(&lease.client_id),
                        lease.expires_at().format("%Y-%m-%d %H:%M:%S UTC"),
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::CleanupLeases => {
            let store = Leases::new(config.lease_database).await?;
            let count = store.cleanup_expired_leases().await;
            store.save().await?;
            println!("Cleaned up {} expired lease(s).", count);
            Ok(())
        }
    }
}

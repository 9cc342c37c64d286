use clap::Parser;
use log::{error, info};
use server::config::{ServerConfig, TokenConfig};
use server::network::Server;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address of the credential service
    #[clap(long, default_value = "0.0.0.0:8076")]
    auth_address: SocketAddr,
    /// Address of the game service
    #[clap(long, default_value = "0.0.0.0:8077")]
    game_address: SocketAddr,
    /// RSA private key used to sign tokens
    #[clap(long, default_value = "/certs/jwt.key")]
    jwt_private_key: PathBuf,
    /// RSA public key used to verify tokens
    #[clap(long, default_value = "/certs/jwt.pub.pem")]
    jwt_public_key: PathBuf,
    /// Token lifetime in seconds
    #[clap(long, default_value = "900")]
    token_expiration: u64,
    /// Seconds between token refreshes, must be below the lifetime
    #[clap(long, default_value = "840")]
    token_refresh: u64,
    /// Seconds `nbf` is backdated by
    #[clap(long, default_value = "60")]
    token_skew: u64,
    /// Simulation tick interval in milliseconds
    #[clap(short, long, default_value = "16")]
    tick_ms: u64,
    /// Maximum concurrently connected players
    #[clap(short, long, default_value = "32")]
    max_players: usize,
    /// Seconds to wait for credential streams to close on shutdown
    #[clap(long, default_value = "5")]
    shutdown_grace: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            auth_address: args.auth_address,
            game_address: args.game_address,
            jwt_private_key: args.jwt_private_key,
            jwt_public_key: args.jwt_public_key,
            token: TokenConfig {
                expiration: Duration::from_secs(args.token_expiration),
                refresh: Duration::from_secs(args.token_refresh),
                not_before_skew: Duration::from_secs(args.token_skew),
            },
            tick_interval: Duration::from_millis(args.tick_ms),
            max_players: args.max_players,
            shutdown_grace: Duration::from_secs(args.shutdown_grace),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::from(Args::parse());
    config.validate()?;

    info!(
        "Starting server: tick {:?}, max players {}, token lifetime {:?} refreshed every {:?}",
        config.tick_interval, config.max_players, config.token.expiration, config.token.refresh
    );

    let server = Server::bind(&config).await?;
    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl-C, shutting down gracefully");
        })
        .await;

    Ok(())
}

//! Headless client for exercising a running server.
//!
//! Logs in on the credential stream, keeps the newest token as they rotate in,
//! joins the game with it, jumps, sends a few jittered position reports and
//! then quits and logs out.

use clap::Parser;
use log::{info, warn};
use rand::Rng;
use shared::frame::{read_frame, write_frame};
use shared::{AuthPacket, Command, GamePacket, PositionUpdate, UpdatePayload};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, sleep};

const SPAWN: (f32, f32) = (140.0, 310.0);

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:8076")]
    auth_address: SocketAddr,
    #[clap(long, default_value = "127.0.0.1:8077")]
    game_address: SocketAddr,
    #[clap(short, long, default_value = "tester")]
    username: String,
    #[clap(short, long, default_value = "")]
    password: String,
    /// Seconds to stay in the game
    #[clap(short, long, default_value = "5")]
    duration: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let auth = TcpStream::connect(args.auth_address).await?;
    let (mut auth_reader, mut auth_writer) = auth.into_split();
    write_frame(
        &mut auth_writer,
        &AuthPacket::Authorize {
            username: args.username.clone(),
            password: args.password.clone(),
        },
    )
    .await?;

    let first_token = match read_frame::<_, AuthPacket>(&mut auth_reader).await? {
        AuthPacket::Token { token } => token,
        AuthPacket::Closed { reason } => return Err(format!("login refused: {}", reason).into()),
        other => return Err(format!("unexpected packet {:?}", other).into()),
    };
    info!("Logged in as {}", args.username);

    let (token_tx, token_rx) = watch::channel(first_token);
    let token_task = tokio::spawn(async move {
        loop {
            match read_frame::<_, AuthPacket>(&mut auth_reader).await {
                Ok(AuthPacket::Token { token }) => {
                    info!("Received a fresh token");
                    token_tx.send_replace(token);
                }
                Ok(AuthPacket::Closed { reason }) => {
                    info!("Credential stream closed: {}", reason);
                    break;
                }
                Ok(other) => warn!("Unexpected packet on credential stream: {:?}", other),
                Err(e) => {
                    if !e.is_closed() {
                        warn!("Credential stream failed: {}", e);
                    }
                    break;
                }
            }
        }
    });

    let game = TcpStream::connect(args.game_address).await?;
    let (mut game_reader, mut game_writer) = game.into_split();
    let token = token_rx.borrow().clone();
    write_frame(&mut game_writer, &GamePacket::connect_with_token(&token)).await?;

    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame::<_, GamePacket>(&mut game_reader).await {
                Ok(GamePacket::Server(update)) => {
                    println!("user {} -> {:?}", update.user_id, update.payload)
                }
                Ok(GamePacket::Disconnected { reason }) => {
                    println!("Disconnected: {}", reason);
                    break;
                }
                Ok(other) => warn!("Unexpected packet on game stream: {:?}", other),
                Err(e) => {
                    if !e.is_closed() {
                        warn!("Game stream failed: {}", e);
                    }
                    break;
                }
            }
        }
    });

    let send = |command| GamePacket::Update(UpdatePayload::Command(command));
    write_frame(&mut game_writer, &send(Command::Jump)).await?;

    let mut rng = rand::thread_rng();
    let mut reports = interval(Duration::from_millis(250));
    let rounds = args.duration * 4;
    for _ in 0..rounds {
        reports.tick().await;
        let report = PositionUpdate::with_velocity(
            SPAWN.0 + rng.gen_range(-5.0..5.0),
            SPAWN.1 + rng.gen_range(-5.0..5.0),
            rng.gen_range(-1.0..1.0),
            0.0,
        );
        write_frame(&mut game_writer, &GamePacket::Update(UpdatePayload::Position(report))).await?;
    }

    write_frame(&mut game_writer, &send(Command::Quit)).await?;
    write_frame(&mut auth_writer, &AuthPacket::Logout).await?;

    sleep(Duration::from_millis(200)).await;
    reader_task.abort();
    let _ = token_task.await;
    Ok(())
}

//! # Platformer Server Library
//!
//! Authoritative server for a real-time multiplayer 2D platformer. It runs two
//! services side by side: a credential service that keeps every player's
//! authorization fresh with short-lived rotating tokens, and a game service
//! that simulates every player's character and fans out what changed.
//!
//! ## Core Responsibilities
//!
//! ### Rotating Credentials
//! A client logs in once on a long-lived credential stream. The server signs a
//! token (RS512, 15 minute lifetime) immediately and a new one every 14
//! minutes, so the client always holds a token with time to spare. The stream
//! ends when the client logs out or disconnects, or when the server stops.
//!
//! ### Gated Game Streams
//! The first packet of a game stream carries the latest token as request
//! metadata. Only tokens signed by the server's key with an RSA algorithm and
//! inside their validity window are accepted.
//!
//! ### Authoritative Simulation
//! Each player's character is ticked on the server at a fixed rate. Clients
//! report their position and velocity; the server adopts the velocity only when
//! the reported position is close to its own, and never adopts the position.
//!
//! ## Architecture Design
//!
//! ### Tasks
//! - one acceptor per service
//! - one issuance task per credential stream
//! - a reader task and a writer task per game stream
//! - a single scheduler task ticking every character each interval
//!
//! ### Shared State
//! The roster lives behind one `RwLock`, each character behind its own
//! `Mutex`. The roster is always locked before a character. Outbound updates
//! go through bounded per-session queues so a slow player never stalls the
//! tick.
//!
//! ## Module Organization
//!
//! - `signer` / `validator`: token signing and verification
//! - `issuer`: the credential stream protocol and service-wide stop signal
//! - `registry`: roster, ids, join/leave announcements and fan-out
//! - `character` / `level`: the per-player simulation and static world
//! - `game`: game stream handling and the tick loop
//! - `network`: listeners and shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(&ServerConfig::default()).await?;
//!
//!     // Runs until Ctrl-C, then stops issuance and waits for open
//!     // credential streams to close
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await;
//!
//!     Ok(())
//! }
//! ```

pub mod authorizer;
pub mod character;
pub mod claims;
pub mod config;
pub mod error;
pub mod game;
pub mod issuer;
pub mod level;
pub mod network;
pub mod registry;
pub mod signer;
pub mod validator;

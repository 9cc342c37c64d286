use shared::frame::FrameError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to produce a signed token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

/// Reasons a bearer token is refused at game stream establishment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("expected metadata wasn't present on request")]
    MissingMetadata,
    #[error("unexpected signing algorithm {0}")]
    UnexpectedAlgorithm(String),
    #[error("token signature is invalid")]
    InvalidSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not valid yet")]
    NotYetValid,
    #[error("failed to parse token: {0}")]
    Malformed(String),
}

/// The external credential lookup refused the user.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("authorization failed for {username}: {reason}")]
pub struct AuthorizationError {
    pub username: String,
    pub reason: String,
}

/// Ways a credential issuance session can end other than a clean logout.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("authorization failed")]
    Authorization(#[from] AuthorizationError),
    #[error("authorization service was stopped")]
    ServiceStopped,
    #[error(transparent)]
    Signing(#[from] TokenError),
    #[error("credential stream failed: {0}")]
    Transport(#[from] FrameError),
    #[error("expected credentials as the first packet")]
    UnexpectedPacket,
    #[error("credentials were not presented in time")]
    TimedOut,
}

/// Fatal startup problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading key file {path}: {source}")]
    ReadKey {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error parsing key file {path}: {source}")]
    ParseKey {
        path: PathBuf,
        source: jsonwebtoken::errors::Error,
    },
    #[error("token refresh interval {refresh:?} must be shorter than expiration {expiration:?}")]
    RefreshNotBeforeExpiry {
        refresh: Duration,
        expiration: Duration,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("max_players must be at least 1")]
    NoCapacity,
    #[error("max_players {max_players} exceeds the supported maximum of {limit}")]
    TooManyPlayers { max_players: usize, limit: usize },
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
}

/// Reasons a game stream is refused or ended before play starts.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("game stream failed during handshake: {0}")]
    Handshake(#[from] FrameError),
    #[error("expected connect as the first packet")]
    UnexpectedPacket,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("server full")]
    ServerFull,
    #[error("handshake timed out")]
    TimedOut,
}

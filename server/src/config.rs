//! Server configuration

use crate::error::ConfigError;
use crate::registry::MAX_PLAYERS;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Token lifetime settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    /// How long an issued token stays valid
    pub expiration: Duration,
    /// How often a fresh token is pushed down the credential stream
    pub refresh: Duration,
    /// How far into the past `nbf` is backdated to absorb clock drift
    pub not_before_skew: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(15 * 60),
            refresh: Duration::from_secs(14 * 60),
            not_before_skew: Duration::from_secs(60),
        }
    }
}

impl TokenConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration.is_zero() {
            return Err(ConfigError::ZeroDuration("token expiration"));
        }
        if self.refresh.is_zero() {
            return Err(ConfigError::ZeroDuration("token refresh"));
        }
        if self.refresh >= self.expiration {
            return Err(ConfigError::RefreshNotBeforeExpiry {
                refresh: self.refresh,
                expiration: self.expiration,
            });
        }
        Ok(())
    }

    /// Validity a client still holds on its previous token when the next arrives
    pub fn overlap(&self) -> Duration {
        self.expiration.saturating_sub(self.refresh)
    }
}

/// Server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the credential issuance service
    pub auth_address: SocketAddr,
    /// Address of the game service
    pub game_address: SocketAddr,
    /// RSA private key (PEM) used to sign tokens
    pub jwt_private_key: PathBuf,
    /// RSA public key (PEM) used to verify tokens
    pub jwt_public_key: PathBuf,
    pub token: TokenConfig,
    /// Interval between simulation ticks
    pub tick_interval: Duration,
    /// Maximum concurrently connected players
    pub max_players: usize,
    /// How long shutdown waits for issuance sessions to wind down
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            auth_address: SocketAddr::from(([0, 0, 0, 0], 8076)),
            game_address: SocketAddr::from(([0, 0, 0, 0], 8077)),
            jwt_private_key: PathBuf::from("/certs/jwt.key"),
            jwt_public_key: PathBuf::from("/certs/jwt.pub.pem"),
            token: TokenConfig::default(),
            tick_interval: Duration::from_millis(16),
            max_players: 32,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token.validate()?;
        if self.tick_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("tick interval"));
        }
        if self.max_players == 0 {
            return Err(ConfigError::NoCapacity);
        }
        if self.max_players > MAX_PLAYERS {
            return Err(ConfigError::TooManyPlayers {
                max_players: self.max_players,
                limit: MAX_PLAYERS,
            });
        }
        Ok(())
    }
}

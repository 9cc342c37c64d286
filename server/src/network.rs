//! Server network layer: TCP listeners for both services, the shared tick
//! task and shutdown coordination.

use crate::authorizer::{Authorizer, StubAuthorizer};
use crate::config::ServerConfig;
use crate::error::ConfigError;
use crate::game::GameAuthority;
use crate::issuer::IssuanceService;
use crate::level::Level;
use crate::signer::TokenSigner;
use crate::validator::TokenValidator;
use log::{debug, error, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// Backoff after a failed accept so a persistent error doesn't spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Both services plus the game loop, ready to run.
pub struct Server {
    auth_listener: TcpListener,
    game_listener: TcpListener,
    issuer: Arc<IssuanceService>,
    authority: Arc<GameAuthority>,
    tick_interval: Duration,
    shutdown_grace: Duration,
}

impl Server {
    /// Loads the key pair named in `config` and binds both listeners.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let signer = TokenSigner::from_pem_file(&config.jwt_private_key, &config.token)?;
        let validator = TokenValidator::from_pem_file(&config.jwt_public_key)?;
        Self::from_parts(config, signer, validator, Arc::new(StubAuthorizer)).await
    }

    /// Like [`Server::bind`] with the key pair supplied in memory.
    pub async fn with_keys(
        config: &ServerConfig,
        private_pem: &[u8],
        public_pem: &[u8],
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let signer = TokenSigner::from_rsa_pem(private_pem, &config.token).map_err(|source| {
            ConfigError::ParseKey {
                path: config.jwt_private_key.clone(),
                source,
            }
        })?;
        let validator = TokenValidator::from_rsa_pem(public_pem).map_err(|source| {
            ConfigError::ParseKey {
                path: config.jwt_public_key.clone(),
                source,
            }
        })?;
        Self::from_parts(config, signer, validator, Arc::new(StubAuthorizer)).await
    }

    pub async fn from_parts(
        config: &ServerConfig,
        signer: TokenSigner,
        validator: TokenValidator,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ConfigError> {
        let auth_listener = bind_listener(config.auth_address).await?;
        let game_listener = bind_listener(config.game_address).await?;

        let issuer = Arc::new(IssuanceService::new(
            Arc::new(signer),
            authorizer,
            config.token.refresh,
        ));
        let authority = Arc::new(GameAuthority::new(
            validator,
            Arc::new(Level::default()),
            config.max_players,
        ));

        Ok(Self {
            auth_listener,
            game_listener,
            issuer,
            authority,
            tick_interval: config.tick_interval,
            shutdown_grace: config.shutdown_grace,
        })
    }

    pub fn auth_addr(&self) -> io::Result<SocketAddr> {
        self.auth_listener.local_addr()
    }

    pub fn game_addr(&self) -> io::Result<SocketAddr> {
        self.game_listener.local_addr()
    }

    pub fn issuer(&self) -> Arc<IssuanceService> {
        Arc::clone(&self.issuer)
    }

    pub fn authority(&self) -> Arc<GameAuthority> {
        Arc::clone(&self.authority)
    }

    /// Serves both streams until `shutdown` resolves.
    ///
    /// On shutdown issuance is stopped first, then the listeners and the game
    /// loop are torn down, and finally in-flight credential streams get up to
    /// the configured grace period to send their closing frames.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Server {
            auth_listener,
            game_listener,
            issuer,
            authority,
            tick_interval,
            shutdown_grace,
        } = self;

        if let (Ok(auth), Ok(game)) = (auth_listener.local_addr(), game_listener.local_addr()) {
            info!("Credential service listening on {}", auth);
            info!("Game service listening on {}", game);
        }

        let tick_task = tokio::spawn(Arc::clone(&authority).run_tick_loop(tick_interval));
        let game_task = tokio::spawn(accept_game_streams(game_listener, authority));
        let mut auth_sessions = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = auth_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Credential stream opened from {}", addr);
                        let _ = stream.set_nodelay(true);
                        let issuer = Arc::clone(&issuer);
                        auth_sessions.spawn(async move {
                            // The issuer logs how each stream ended
                            let _ = issuer.serve(stream).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept credential stream: {}", e);
                        sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(_) = auth_sessions.join_next(), if !auth_sessions.is_empty() => {}
            }
        }

        info!("Shutting down");
        issuer.graceful_stop();
        drop(auth_listener);
        game_task.abort();
        tick_task.abort();

        let drained = timeout(shutdown_grace, async {
            while auth_sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} credential streams still open after {:?}, aborting",
                auth_sessions.len(),
                shutdown_grace
            );
            auth_sessions.abort_all();
        }
        info!("Server stopped");
    }
}

async fn bind_listener(address: SocketAddr) -> Result<TcpListener, ConfigError> {
    TcpListener::bind(address)
        .await
        .map_err(|source| ConfigError::Bind { address, source })
}

/// Accepts game streams until aborted; dropping the join set on abort ends
/// every open game stream with it.
async fn accept_game_streams(listener: TcpListener, authority: Arc<GameAuthority>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Game stream opened from {}", addr);
                    let _ = stream.set_nodelay(true);
                    let authority = Arc::clone(&authority);
                    connections.spawn(async move {
                        match authority.connect(stream).await {
                            Ok(end) => debug!("Game stream from {} finished: {:?}", addr, end),
                            Err(e) => warn!("Game stream from {} refused: {}", addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept game stream: {}", e);
                    sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

//! Credential issuance over a long-lived stream.
//!
//! A client opens the credential stream with its username and password. Once
//! the [`Authorizer`] accepts them the service pushes a freshly signed token
//! straight away and another one every refresh interval, so the client always
//! holds a token with at least `expiration - refresh` of validity left.
//!
//! The loop for one stream ends when
//! - the client sends [`AuthPacket::Logout`] or closes the stream,
//! - the whole service is stopped with [`IssuanceService::graceful_stop`],
//! - or signing a token or writing to the stream fails.
//!
//! Tokens already handed out stay valid until their `exp` regardless of how
//! the loop ended.

use crate::authorizer::Authorizer;
use crate::claims::Identity;
use crate::error::IssueError;
use crate::game::HANDSHAKE_TIMEOUT;
use crate::signer::TokenSigner;
use log::{debug, info, warn};
use shared::frame::{read_frame, write_frame, FrameError};
use shared::AuthPacket;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

const INBOUND_QUEUE_LEN: usize = 8;

/// Phases of a single credential stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceState {
    AwaitingCredentials,
    Issuing,
    Refreshing,
    Stopped,
}

/// How a credential stream finished when it finished cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    LoggedOut,
    ClientClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceSummary {
    pub user: String,
    pub tokens_issued: u64,
    pub end: SessionEnd,
}

pub struct IssuanceService {
    signer: Arc<TokenSigner>,
    authorizer: Arc<dyn Authorizer>,
    refresh: Duration,
    stop_tx: watch::Sender<bool>,
}

impl IssuanceService {
    pub fn new(signer: Arc<TokenSigner>, authorizer: Arc<dyn Authorizer>, refresh: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            signer,
            authorizer,
            refresh,
            stop_tx,
        }
    }

    /// Interrupts every in-flight issuance loop and refuses new ones.
    ///
    /// Calling it more than once has no further effect.
    pub fn graceful_stop(&self) {
        if !self.stop_tx.send_replace(true) {
            info!("Stopping credential issuance");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Runs the issuance protocol on one credential stream until it ends.
    pub async fn serve<S>(&self, stream: S) -> Result<IssuanceSummary, IssueError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut stop_rx = self.stop_tx.subscribe();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut state = IssuanceState::AwaitingCredentials;

        if self.is_stopped() {
            close(&mut writer, "server shutting down").await;
            return Err(IssueError::ServiceStopped);
        }

        let first = tokio::select! {
            packet = timeout(HANDSHAKE_TIMEOUT, read_frame::<_, AuthPacket>(&mut reader)) => match packet {
                Ok(packet) => packet?,
                Err(_) => {
                    close(&mut writer, "handshake timed out").await;
                    return Err(IssueError::TimedOut);
                }
            },
            _ = stopped(&mut stop_rx) => {
                close(&mut writer, "server shutting down").await;
                return Err(IssueError::ServiceStopped);
            }
        };

        let (username, password) = match first {
            AuthPacket::Authorize { username, password } => (username, password),
            other => {
                warn!("Expected credentials, got {:?}", other);
                close(&mut writer, "expected credentials").await;
                return Err(IssueError::UnexpectedPacket);
            }
        };

        let identity = match self.authorizer.authorize(&username, &password) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("{}", e);
                close(&mut writer, &e.reason).await;
                return Err(e.into());
            }
        };
        info!("user={} authorized, starting token rotation", identity.user);

        // Reads are moved to their own task so the select below never drops a
        // half-read frame when the refresh timer fires.
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let reader_task = tokio::spawn(async move {
            loop {
                let result = read_frame::<_, AuthPacket>(&mut reader).await;
                let done = result.is_err();
                if inbound_tx.send(result).await.is_err() || done {
                    break;
                }
            }
        });

        transition(&mut state, IssuanceState::Issuing, &identity);
        let result = self
            .rotate(&identity, &mut writer, inbound_rx, &mut stop_rx, &mut state)
            .await;
        transition(&mut state, IssuanceState::Stopped, &identity);
        reader_task.abort();

        match &result {
            Ok(summary) => info!(
                "user={} credential stream ended ({:?}) after {} tokens",
                summary.user, summary.end, summary.tokens_issued
            ),
            Err(e) => warn!("user={} credential stream ended: {}", identity.user, e),
        }
        result
    }

    async fn rotate<W>(
        &self,
        identity: &Identity,
        writer: &mut W,
        mut inbound: mpsc::Receiver<Result<AuthPacket, FrameError>>,
        stop_rx: &mut watch::Receiver<bool>,
        state: &mut IssuanceState,
    ) -> Result<IssuanceSummary, IssueError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut tokens_issued = 0u64;
        let summary = |tokens_issued: u64, end: SessionEnd| IssuanceSummary {
            user: identity.user.clone(),
            tokens_issued,
            end,
        };

        loop {
            let token = match self.signer.sign(identity) {
                Ok(token) => token,
                Err(e) => {
                    close(writer, "failed to issue token").await;
                    return Err(e.into());
                }
            };
            debug!(
                "user={} issuing token {}...",
                identity.user,
                token.get(..12).unwrap_or("")
            );
            write_frame(writer, &AuthPacket::Token { token }).await?;
            tokens_issued += 1;
            transition(state, IssuanceState::Refreshing, identity);

            let refresh = sleep(self.refresh);
            tokio::pin!(refresh);

            loop {
                tokio::select! {
                    _ = &mut refresh => break,
                    _ = stopped(stop_rx) => {
                        close(writer, "server shutting down").await;
                        return Err(IssueError::ServiceStopped);
                    }
                    inbound = inbound.recv() => match inbound {
                        Some(Ok(AuthPacket::Logout)) => {
                            close(writer, "logged out").await;
                            return Ok(summary(tokens_issued, SessionEnd::LoggedOut));
                        }
                        Some(Ok(other)) => {
                            warn!("user={} sent unexpected packet {:?}", identity.user, other);
                        }
                        Some(Err(FrameError::Closed)) | None => {
                            return Ok(summary(tokens_issued, SessionEnd::ClientClosed));
                        }
                        Some(Err(e)) => return Err(e.into()),
                    }
                }
            }

            transition(state, IssuanceState::Issuing, identity);
        }
    }
}

fn transition(state: &mut IssuanceState, next: IssuanceState, identity: &Identity) {
    debug!("user={} issuance {:?} -> {:?}", identity.user, state, next);
    *state = next;
}

/// Sends a final `Closed` frame and shuts the write side down, ignoring
/// failures since the stream is ending anyway.
async fn close<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) {
    let packet = AuthPacket::Closed {
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(writer, &packet).await {
        debug!("Failed to send close frame: {}", e);
    }
    let _ = writer.shutdown().await;
}

/// Resolves once the stop flag is set.
async fn stopped(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow_and_update() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer::StubAuthorizer;
    use crate::config::TokenConfig;
    use crate::test_keys::{PRIVATE_KEY, PUBLIC_KEY};
    use crate::validator::TokenValidator;
    use jsonwebtoken::EncodingKey;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::Instant;

    fn service() -> Arc<IssuanceService> {
        let config = TokenConfig::default();
        let signer = TokenSigner::from_rsa_pem(PRIVATE_KEY, &config).unwrap();
        Arc::new(IssuanceService::new(
            Arc::new(signer),
            Arc::new(StubAuthorizer),
            config.refresh,
        ))
    }

    fn spawn_serve(
        service: &Arc<IssuanceService>,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<IssuanceSummary, IssueError>>,
    ) {
        let (client, server) = duplex(16 * 1024);
        let service = Arc::clone(service);
        let handle = tokio::spawn(async move { service.serve(server).await });
        (client, handle)
    }

    async fn login(client: &mut DuplexStream, username: &str) {
        let packet = AuthPacket::Authorize {
            username: username.to_string(),
            password: "hunter2".to_string(),
        };
        write_frame(client, &packet).await.unwrap();
    }

    async fn next_token(client: &mut DuplexStream) -> String {
        match read_frame::<_, AuthPacket>(client).await.unwrap() {
            AuthPacket::Token { token } => token,
            other => panic!("Expected token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_token_is_valid() {
        let service = service();
        let (mut client, _handle) = spawn_serve(&service);
        login(&mut client, "grevian").await;

        let token = next_token(&mut client).await;
        let claims = TokenValidator::from_rsa_pem(PUBLIC_KEY)
            .unwrap()
            .validate_token(&token)
            .unwrap();
        assert_eq!(claims.user, "grevian");
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_rotate_every_refresh_interval() {
        let service = service();
        let (mut client, _handle) = spawn_serve(&service);
        login(&mut client, "grevian").await;

        next_token(&mut client).await;
        let mut last = Instant::now();
        for _ in 0..3 {
            next_token(&mut client).await;
            let now = Instant::now();
            assert_eq!(now - last, Duration::from_secs(14 * 60));
            last = now;
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_issue_nothing() {
        let service = service();
        let (mut client, handle) = spawn_serve(&service);
        login(&mut client, "").await;

        match read_frame::<_, AuthPacket>(&mut client).await.unwrap() {
            AuthPacket::Closed { reason } => assert_eq!(reason, "username must not be empty"),
            other => panic!("Expected close, got {:?}", other),
        }
        assert!(matches!(
            handle.await.unwrap(),
            Err(IssueError::Authorization(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let service = service();
        let (mut client, handle) = spawn_serve(&service);

        assert_eq!(
            read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
            AuthPacket::Closed {
                reason: "handshake timed out".to_string()
            }
        );
        assert!(matches!(handle.await.unwrap(), Err(IssueError::TimedOut)));
    }

    #[tokio::test]
    async fn test_signing_failure_closes_stream() {
        let config = TokenConfig::default();
        let signer = TokenSigner::new(EncodingKey::from_secret(b"shared secret"), &config);
        let service = Arc::new(IssuanceService::new(
            Arc::new(signer),
            Arc::new(StubAuthorizer),
            config.refresh,
        ));
        let (mut client, handle) = spawn_serve(&service);
        login(&mut client, "grevian").await;

        assert_eq!(
            read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
            AuthPacket::Closed {
                reason: "failed to issue token".to_string()
            }
        );
        assert!(matches!(handle.await.unwrap(), Err(IssueError::Signing(_))));
    }

    #[tokio::test]
    async fn test_unexpected_first_packet() {
        let service = service();
        let (mut client, handle) = spawn_serve(&service);
        write_frame(&mut client, &AuthPacket::Logout).await.unwrap();

        assert!(matches!(
            read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
            AuthPacket::Closed { .. }
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(IssueError::UnexpectedPacket)
        ));
    }

    #[tokio::test]
    async fn test_logout_ends_loop() {
        let service = service();
        let (mut client, handle) = spawn_serve(&service);
        login(&mut client, "grevian").await;
        next_token(&mut client).await;

        write_frame(&mut client, &AuthPacket::Logout).await.unwrap();
        assert_eq!(
            read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
            AuthPacket::Closed {
                reason: "logged out".to_string()
            }
        );

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.user, "grevian");
        assert_eq!(summary.tokens_issued, 1);
        assert_eq!(summary.end, SessionEnd::LoggedOut);
    }

    #[tokio::test]
    async fn test_client_close_ends_loop() {
        let service = service();
        let (mut client, handle) = spawn_serve(&service);
        login(&mut client, "grevian").await;
        next_token(&mut client).await;
        drop(client);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::ClientClosed);
    }

    #[tokio::test]
    async fn test_graceful_stop_interrupts_every_loop() {
        let service = service();
        let mut sessions = Vec::new();
        for name in ["alpha", "beta", "gamma"] {
            let (mut client, handle) = spawn_serve(&service);
            login(&mut client, name).await;
            next_token(&mut client).await;
            sessions.push((client, handle));
        }

        service.graceful_stop();
        service.graceful_stop();
        assert!(service.is_stopped());

        for (mut client, handle) in sessions {
            assert!(matches!(
                read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
                AuthPacket::Closed { .. }
            ));
            assert!(matches!(
                handle.await.unwrap(),
                Err(IssueError::ServiceStopped)
            ));
        }
    }

    #[tokio::test]
    async fn test_stopped_service_refuses_new_streams() {
        let service = service();
        service.graceful_stop();

        let (mut client, handle) = spawn_serve(&service);
        assert!(matches!(
            read_frame::<_, AuthPacket>(&mut client).await.unwrap(),
            AuthPacket::Closed { .. }
        ));
        assert!(matches!(
            handle.await.unwrap(),
            Err(IssueError::ServiceStopped)
        ));
    }
}

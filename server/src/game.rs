use crate::character::Character;
use crate::error::ConnectError;
use crate::level::Level;
use crate::registry::{SessionHandle, SessionRegistry, OUTBOUND_QUEUE_LEN};
use crate::validator::TokenValidator;
use log::{debug, info, warn};
use shared::frame::{read_frame, write_frame, FrameError};
use shared::{Command, GamePacket, ServerUpdate, UpdatePayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// How long a new game stream has to present its `Connect` packet.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a departing session's writer may keep flushing queued updates.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const TICKS_PER_STATUS_LOG: u64 = 60;

/// Why a game stream that made it into the roster ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEnd {
    Quit,
    ClientClosed,
    TransportFailed,
    WriterStopped,
    /// The registry gave up on a peer that stopped draining its updates.
    Evicted,
}

/// Authoritative game state: validates joining players, owns the roster and
/// ticks every character.
pub struct GameAuthority {
    validator: TokenValidator,
    registry: SessionRegistry,
    level: Arc<Level>,
}

impl GameAuthority {
    pub fn new(validator: TokenValidator, level: Arc<Level>, max_players: usize) -> Self {
        Self {
            validator,
            registry: SessionRegistry::new(max_players),
            level,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn level(&self) -> &Level {
        &self.level
    }

    /// Runs one game stream from handshake to departure.
    pub async fn connect<S>(&self, stream: S) -> Result<GameEnd, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let metadata = match timeout(HANDSHAKE_TIMEOUT, read_frame::<_, GamePacket>(&mut reader)).await {
            Err(_) => {
                refuse(&mut writer, "handshake timed out").await;
                return Err(ConnectError::TimedOut);
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(GamePacket::Connect { metadata })) => metadata,
            Ok(Ok(other)) => {
                warn!("Expected connect, got {:?}", other);
                refuse(&mut writer, "expected connect").await;
                return Err(ConnectError::UnexpectedPacket);
            }
        };

        let claims = match self.validator.validate(&metadata) {
            Ok(claims) => claims,
            Err(e) => {
                warn!("Invalid token: {}", e);
                refuse(&mut writer, &e.to_string()).await;
                return Err(e.into());
            }
        };
        info!("user={} connected", claims.user);

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_LEN);
        let character = Character::new(claims.user.clone(), self.level.spawn());
        let Some(session) = self.registry.register(&claims, outbound_tx, character).await else {
            refuse(&mut writer, "Server full").await;
            return Err(ConnectError::ServerFull);
        };

        let mut writer_task = tokio::spawn(write_updates(writer, outbound_rx));
        let mut writer_done = false;

        let mut evicted = session.clone();
        let end = tokio::select! {
            end = self.read_updates(&mut reader, &session) => end,
            _ = &mut writer_task => {
                writer_done = true;
                GameEnd::WriterStopped
            }
            _ = evicted.evicted() => GameEnd::Evicted,
        };
        info!("{} (user_id={}) stream ended: {:?}", session.name, session.id, end);

        if end == GameEnd::Evicted {
            // The writer is stuck on a peer that stopped reading; dropping it
            // along with the read half closes the stream.
            writer_task.abort();
            let _ = writer_task.await;
            return Ok(end);
        }

        // Removal drops the last sender, so the writer drains and exits.
        self.registry.unregister(session.id).await;
        if !writer_done && timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            debug!("user_id={} writer did not drain in time", session.id);
            writer_task.abort();
        }

        Ok(end)
    }

    async fn read_updates<R>(&self, reader: &mut R, session: &SessionHandle) -> GameEnd
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let packet = match read_frame::<_, GamePacket>(reader).await {
                Ok(packet) => packet,
                Err(FrameError::Closed) => return GameEnd::ClientClosed,
                Err(e) => {
                    warn!("user_id={} read failed: {}", session.id, e);
                    return GameEnd::TransportFailed;
                }
            };

            match packet {
                GamePacket::Update(UpdatePayload::Command(Command::Quit)) => return GameEnd::Quit,
                GamePacket::Update(payload) => {
                    session.character.lock().await.apply(payload, &self.level);
                }
                other => warn!("user_id={} sent unexpected packet {:?}", session.id, other),
            }
        }
    }

    /// Advances every character one step and distributes what moved.
    ///
    /// Returns the number of position updates produced.
    pub async fn tick(&self) -> usize {
        let mut updates = Vec::new();
        for (id, character) in self.registry.characters().await {
            if let Some(position) = character.lock().await.tick(&self.level) {
                updates.push(ServerUpdate::position(id, position));
            }
        }

        let produced = updates.len();
        self.registry.broadcast_all(updates).await;
        produced
    }

    /// Ticks the world at a fixed interval until the task is dropped.
    pub async fn run_tick_loop(self: Arc<Self>, tick_interval: Duration) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            ticker.tick().await;
            let produced = self.tick().await;
            ticks += 1;

            if ticks % TICKS_PER_STATUS_LOG == 0 {
                debug!(
                    "tick {}: {} players, {} updates",
                    ticks,
                    self.registry.len().await,
                    produced
                );
            }
        }
    }
}

async fn write_updates<W>(mut writer: W, mut outbound: mpsc::Receiver<ServerUpdate>) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(update) = outbound.recv().await {
        write_frame(&mut writer, &GamePacket::Server(update)).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

async fn refuse<W: AsyncWrite + Unpin>(writer: &mut W, reason: &str) {
    let packet = GamePacket::Disconnected {
        reason: reason.to_string(),
    };
    if let Err(e) = write_frame(writer, &packet).await {
        debug!("Failed to send disconnect: {}", e);
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::Identity;
    use crate::config::TokenConfig;
    use crate::signer::TokenSigner;
    use crate::test_keys::{OTHER_PRIVATE_KEY, PRIVATE_KEY, PUBLIC_KEY};
    use shared::{Metadata, PositionUpdate};
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    fn authority(max_players: usize) -> Arc<GameAuthority> {
        Arc::new(GameAuthority::new(
            TokenValidator::from_rsa_pem(PUBLIC_KEY).unwrap(),
            Arc::new(Level::default()),
            max_players,
        ))
    }

    fn token_for(user: &str, key: &[u8]) -> String {
        TokenSigner::from_rsa_pem(key, &TokenConfig::default())
            .unwrap()
            .sign(&Identity::new(user))
            .unwrap()
    }

    fn open(authority: &Arc<GameAuthority>) -> (DuplexStream, JoinHandle<Result<GameEnd, ConnectError>>) {
        let (client, server) = duplex(64 * 1024);
        let authority = Arc::clone(authority);
        let handle = tokio::spawn(async move { authority.connect(server).await });
        (client, handle)
    }

    async fn recv(client: &mut DuplexStream) -> GamePacket {
        read_frame(client).await.unwrap()
    }

    async fn recv_update(client: &mut DuplexStream) -> ServerUpdate {
        match recv(client).await {
            GamePacket::Server(update) => update,
            other => panic!("Expected server update, got {:?}", other),
        }
    }

    async fn join(authority: &Arc<GameAuthority>, user: &str) -> (DuplexStream, JoinHandle<Result<GameEnd, ConnectError>>) {
        let (mut client, handle) = open(authority);
        let token = token_for(user, PRIVATE_KEY);
        write_frame(&mut client, &GamePacket::connect_with_token(&token))
            .await
            .unwrap();
        (client, handle)
    }

    #[tokio::test]
    async fn test_valid_token_joins() {
        let authority = authority(4);
        let (mut client, _handle) = join(&authority, "grevian").await;

        let update = recv_update(&mut client).await;
        assert_eq!(update, ServerUpdate::command(1, Command::Joined));
        assert_eq!(authority.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_missing_token_is_refused() {
        let authority = authority(4);
        let (mut client, handle) = open(&authority);
        write_frame(&mut client, &GamePacket::Connect { metadata: Metadata::new() })
            .await
            .unwrap();

        assert!(matches!(recv(&mut client).await, GamePacket::Disconnected { .. }));
        assert!(matches!(
            handle.await.unwrap(),
            Err(ConnectError::Auth(crate::error::AuthError::MissingMetadata))
        ));
        assert!(authority.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_refusal_on_the_wire() {
        let mut request = Vec::new();
        write_frame(&mut request, &GamePacket::Connect { metadata: Metadata::new() })
            .await
            .unwrap();
        let mut response = Vec::new();
        let reason = crate::error::AuthError::MissingMetadata.to_string();
        write_frame(&mut response, &GamePacket::Disconnected { reason })
            .await
            .unwrap();

        let stream = tokio_test::io::Builder::new()
            .read(&request)
            .write(&response)
            .build();
        assert!(matches!(
            authority(4).connect(stream).await,
            Err(ConnectError::Auth(crate::error::AuthError::MissingMetadata))
        ));
    }

    #[tokio::test]
    async fn test_foreign_token_is_refused() {
        let authority = authority(4);
        let (mut client, handle) = open(&authority);
        let token = token_for("mallory", OTHER_PRIVATE_KEY);
        write_frame(&mut client, &GamePacket::connect_with_token(&token))
            .await
            .unwrap();

        assert!(matches!(recv(&mut client).await, GamePacket::Disconnected { .. }));
        assert!(matches!(
            handle.await.unwrap(),
            Err(ConnectError::Auth(crate::error::AuthError::InvalidSignature))
        ));
    }

    #[tokio::test]
    async fn test_update_before_connect_is_refused() {
        let authority = authority(4);
        let (mut client, handle) = open(&authority);
        write_frame(&mut client, &GamePacket::Update(UpdatePayload::Command(Command::Jump)))
            .await
            .unwrap();

        assert!(matches!(recv(&mut client).await, GamePacket::Disconnected { .. }));
        assert!(matches!(handle.await.unwrap(), Err(ConnectError::UnexpectedPacket)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_stream_times_out() {
        let authority = authority(4);
        let (mut client, handle) = open(&authority);

        assert!(matches!(recv(&mut client).await, GamePacket::Disconnected { .. }));
        assert!(matches!(handle.await.unwrap(), Err(ConnectError::TimedOut)));
    }

    #[tokio::test]
    async fn test_full_server_refuses() {
        let authority = authority(1);
        let (mut first, _first_handle) = join(&authority, "a").await;
        recv_update(&mut first).await;

        let (mut second, handle) = join(&authority, "b").await;
        assert_eq!(
            recv(&mut second).await,
            GamePacket::Disconnected {
                reason: "Server full".to_string()
            }
        );
        assert!(matches!(handle.await.unwrap(), Err(ConnectError::ServerFull)));
    }

    #[tokio::test]
    async fn test_quit_removes_player_and_notifies_others() {
        let authority = authority(4);
        let (mut a, a_handle) = join(&authority, "a").await;
        assert_eq!(recv_update(&mut a).await, ServerUpdate::command(1, Command::Joined));

        let (mut b, _b_handle) = join(&authority, "b").await;
        assert_eq!(recv_update(&mut b).await, ServerUpdate::command(2, Command::Joined));
        assert_eq!(recv_update(&mut a).await, ServerUpdate::command(2, Command::Joined));
        recv_update(&mut a).await;
        recv_update(&mut b).await;
        recv_update(&mut b).await;

        write_frame(&mut a, &GamePacket::Update(UpdatePayload::Command(Command::Quit)))
            .await
            .unwrap();
        assert_eq!(a_handle.await.unwrap().unwrap(), GameEnd::Quit);

        assert_eq!(recv_update(&mut b).await, ServerUpdate::command(1, Command::Quit));
        assert!(!authority.registry().contains(1).await);
    }

    #[tokio::test]
    async fn test_stalled_peer_is_disconnected() {
        let authority = authority(4);
        let (mut client, server) = duplex(256);
        let connecting = Arc::clone(&authority);
        let handle = tokio::spawn(async move { connecting.connect(server).await });
        let token = token_for("stalled", PRIVATE_KEY);
        write_frame(&mut client, &GamePacket::connect_with_token(&token))
            .await
            .unwrap();

        while !authority.registry().contains(1).await {
            tokio::task::yield_now().await;
        }

        // The client never reads, so its socket and then its queue fill up
        for i in 0..2000 {
            if !authority.registry().contains(1).await {
                break;
            }
            let update = ServerUpdate::position(999, PositionUpdate::new(i as f32, 0.0));
            authority.registry().broadcast(update, Some(999)).await;
            tokio::task::yield_now().await;
        }
        assert!(!authority.registry().contains(1).await);

        let end = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("connection torn down after eviction")
            .unwrap()
            .unwrap();
        assert_eq!(end, GameEnd::Evicted);

        // Whatever was buffered is followed by the end of the stream
        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if read_frame::<_, GamePacket>(&mut client).await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_closed_stream_removes_player() {
        let authority = authority(4);
        let (mut a, a_handle) = join(&authority, "a").await;
        recv_update(&mut a).await;
        drop(a);

        assert_eq!(a_handle.await.unwrap().unwrap(), GameEnd::ClientClosed);
        assert!(authority.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_tick_broadcasts_motion_to_others() {
        let authority = authority(4);
        let (mut a, _a_handle) = join(&authority, "a").await;
        recv_update(&mut a).await;
        let (mut b, _b_handle) = join(&authority, "b").await;
        for _ in 0..3 {
            recv_update(&mut b).await;
        }
        for _ in 0..2 {
            recv_update(&mut a).await;
        }

        // Both spawn mid-air, so the first tick moves both of them
        assert_eq!(authority.tick().await, 2);

        let to_a = recv_update(&mut a).await;
        assert_eq!(to_a.user_id, 2);
        assert!(matches!(to_a.payload, UpdatePayload::Position(_)));
        let to_b = recv_update(&mut b).await;
        assert_eq!(to_b.user_id, 1);
    }

    #[tokio::test]
    async fn test_skewed_report_keeps_server_position() {
        let authority = authority(4);
        let (mut a, _a_handle) = join(&authority, "a").await;
        recv_update(&mut a).await;

        let report = PositionUpdate::with_velocity(700.0, 20.0, 6.0, 0.0);
        write_frame(&mut a, &GamePacket::Update(UpdatePayload::Position(report)))
            .await
            .unwrap();
        write_frame(&mut a, &GamePacket::Update(UpdatePayload::Command(Command::Jump)))
            .await
            .unwrap();

        // Let the reader catch up before looking at the character
        tokio::task::yield_now().await;
        let characters = authority.registry().characters().await;
        let (_, character) = &characters[0];
        loop {
            let character = character.lock().await;
            if character.forces()[1] != 0.0 {
                assert_eq!(character.forces()[0], 0.0);
                assert_eq!(character.position(), authority.level().spawn());
                break;
            }
            drop(character);
            tokio::task::yield_now().await;
        }
    }
}

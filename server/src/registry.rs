//! Roster of connected players and update fan-out.
//!
//! Each session owns a bounded outbound queue drained by its writer task.
//! Broadcasts never wait on a slow peer: a full queue drops the update, and a
//! peer whose queue stays full for [`MAX_SEND_FAILURES`] consecutive updates
//! or whose queue is closed is evicted. Every departure, however it happens,
//! is announced to the remaining sessions with a `Quit` command. An evicted
//! session's [`SessionHandle`] is told so its connection can be torn down.
//!
//! Locking order is always roster first, then a character.

use crate::character::Character;
use crate::claims::Claims;
use log::{debug, info, warn};
use shared::{Command, ServerUpdate};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

/// Capacity of every session's outbound queue.
pub const OUTBOUND_QUEUE_LEN: usize = 256;

/// Consecutive full-queue drops after which a peer counts as disconnected.
pub const MAX_SEND_FAILURES: u32 = 32;

/// Largest roster whose introductions all fit in a newcomer's empty queue:
/// its own `Joined` plus a `Joined` and a position for every other player.
pub const MAX_PLAYERS: usize = (OUTBOUND_QUEUE_LEN - 1) / 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped,
    Disconnected,
}

/// A connected player as the registry sees it.
pub struct Session {
    id: u32,
    name: String,
    character: Arc<Mutex<Character>>,
    outbound: mpsc::Sender<ServerUpdate>,
    send_failures: AtomicU32,
    evicted: watch::Sender<bool>,
}

impl Session {
    fn new(
        id: u32,
        name: String,
        character: Arc<Mutex<Character>>,
        outbound: mpsc::Sender<ServerUpdate>,
        evicted: watch::Sender<bool>,
    ) -> Self {
        Self {
            id,
            name,
            character,
            outbound,
            send_failures: AtomicU32::new(0),
            evicted,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `update` for this session without waiting.
    pub fn deliver(&self, update: ServerUpdate) -> Delivery {
        match self.outbound.try_send(update) {
            Ok(()) => {
                self.send_failures.store(0, Ordering::Relaxed);
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                let failures = self.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("user_id={} queue full ({} in a row)", self.id, failures);
                if failures >= MAX_SEND_FAILURES {
                    Delivery::Disconnected
                } else {
                    Delivery::Dropped
                }
            }
            Err(TrySendError::Closed(_)) => Delivery::Disconnected,
        }
    }
}

/// What a freshly registered session needs to run its streams.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u32,
    pub name: String,
    pub character: Arc<Mutex<Character>>,
    evicted: watch::Receiver<bool>,
}

impl SessionHandle {
    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    /// Resolves once the registry has evicted this session.
    ///
    /// Never resolves for a session that leaves through `unregister`.
    pub async fn evicted(&mut self) {
        loop {
            if *self.evicted.borrow_and_update() {
                return;
            }
            if self.evicted.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<u32, Session>>,
    next_id: AtomicU32,
    max_players: usize,
}

impl SessionRegistry {
    pub fn new(max_players: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            max_players,
        }
    }

    /// Adds a session for `claims` and introduces it to everyone else.
    ///
    /// Returns `None` when the server is full; no id is consumed then.
    pub async fn register(
        &self,
        claims: &Claims,
        outbound: mpsc::Sender<ServerUpdate>,
        mut character: Character,
    ) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_players {
            warn!(
                "Refusing user={}: server full ({} players)",
                claims.user,
                sessions.len()
            );
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", claims.user, id);
        character.set_name(name.clone());
        let position = character.position_update();
        let character = Arc::new(Mutex::new(character));
        let (evicted_tx, evicted_rx) = watch::channel(false);
        let session = Session::new(id, name.clone(), Arc::clone(&character), outbound, evicted_tx);

        // Introductions to the newcomer fit its empty queue as long as the
        // roster stays within MAX_PLAYERS.
        session.deliver(ServerUpdate::command(id, Command::Joined));

        let mut evicted = Vec::new();
        for (other_id, other) in sessions.iter() {
            for update in [
                ServerUpdate::command(id, Command::Joined),
                ServerUpdate::position(id, position),
            ] {
                if other.deliver(update) == Delivery::Disconnected {
                    evicted.push(*other_id);
                }
            }

            let other_position = other.character.lock().await.position_update();
            session.deliver(ServerUpdate::command(*other_id, Command::Joined));
            session.deliver(ServerUpdate::position(*other_id, other_position));
        }

        sessions.insert(id, session);
        info!("{} registered as user_id={} ({} online)", name, id, sessions.len());
        drop(sessions);

        evicted.dedup();
        self.evict(evicted).await;

        Some(SessionHandle {
            id,
            name,
            character,
            evicted: evicted_rx,
        })
    }

    /// Removes a session and announces its departure.
    ///
    /// Returns false if the session was already gone.
    pub async fn unregister(&self, id: u32) -> bool {
        let removed = self.sessions.write().await.remove(&id);
        match removed {
            Some(session) => {
                info!("{} (user_id={}) left", session.name, id);
                self.announce_departure(id).await;
                true
            }
            None => false,
        }
    }

    /// Delivers `update` to every session except `exclude`.
    pub async fn broadcast(&self, update: ServerUpdate, exclude: Option<u32>) {
        let evicted = {
            let sessions = self.sessions.read().await;
            fan_out(&sessions, update, exclude)
        };
        self.evict(evicted).await;
    }

    /// Delivers a batch of updates, each to everyone but its originating user.
    ///
    /// Updates whose origin has left in the meantime are discarded.
    pub async fn broadcast_all(&self, updates: Vec<ServerUpdate>) {
        if updates.is_empty() {
            return;
        }
        let mut evicted = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for update in updates {
                if !sessions.contains_key(&update.user_id) {
                    continue;
                }
                evicted.extend(fan_out(&sessions, update, Some(update.user_id)));
            }
        }
        evicted.sort_unstable();
        evicted.dedup();
        self.evict(evicted).await;
    }

    /// Snapshot of every live character, for the scheduler.
    pub async fn characters(&self) -> Vec<(u32, Arc<Mutex<Character>>)> {
        self.sessions
            .read()
            .await
            .values()
            .map(|session| (session.id, Arc::clone(&session.character)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    async fn announce_departure(&self, id: u32) {
        let quit = ServerUpdate::command(id, Command::Quit);
        let evicted = {
            let sessions = self.sessions.read().await;
            fan_out(&sessions, quit, Some(id))
        };
        self.evict(evicted).await;
    }

    /// Removes unreachable sessions, announcing each departure in turn.
    ///
    /// Announcements can uncover further unreachable peers, so this works
    /// through a queue rather than recursing.
    async fn evict(&self, mut pending: Vec<u32>) {
        while let Some(id) = pending.pop() {
            let removed = self.sessions.write().await.remove(&id);
            let Some(session) = removed else {
                continue;
            };
            warn!("Evicting {} (user_id={}): peer unreachable", session.name, id);
            session.evicted.send_replace(true);

            let quit = ServerUpdate::command(id, Command::Quit);
            let sessions = self.sessions.read().await;
            for next in fan_out(&sessions, quit, Some(id)) {
                if !pending.contains(&next) {
                    pending.push(next);
                }
            }
        }
    }
}

fn fan_out(sessions: &HashMap<u32, Session>, update: ServerUpdate, exclude: Option<u32>) -> Vec<u32> {
    sessions
        .values()
        .filter(|session| Some(session.id) != exclude)
        .filter(|session| session.deliver(update) == Delivery::Disconnected)
        .map(|session| session.id)
        .collect()
}

//! Wire contract shared by the platformer servers and their clients.
//!
//! Two logical streams exist per player: the credential stream carrying
//! [`AuthPacket`]s and the game stream carrying [`GamePacket`]s. Every packet
//! travels as a single length-prefixed frame, see [`frame`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod frame;

/// Metadata key under which the bearer token travels on the game stream.
pub const AUTHORIZATION_KEY: &str = "authorization";

/// Request metadata attached to a game stream when it is established.
pub type Metadata = HashMap<String, String>;

/// Packets on the credential stream.
///
/// The client sends `Authorize` once and may later send `Logout`; the server
/// answers with a `Token` every refresh interval until the stream ends.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum AuthPacket {
    Authorize { username: String, password: String },
    Logout,

    Token { token: String },
    Closed { reason: String },
}

/// Packets on the game stream.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum GamePacket {
    Connect { metadata: Metadata },
    Update(UpdatePayload),

    Server(ServerUpdate),
    Disconnected { reason: String },
}

impl GamePacket {
    /// Builds the opening packet of a game stream carrying `token`.
    pub fn connect_with_token(token: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(AUTHORIZATION_KEY.to_string(), token.to_string());
        GamePacket::Connect { metadata }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Quit,
    Joined,
    Jump,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PositionUpdate {
    pub x: f32,
    pub y: f32,
    pub velocity: Option<Velocity>,
}

impl PositionUpdate {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            velocity: None,
        }
    }

    pub fn with_velocity(x: f32, y: f32, vel_x: f32, vel_y: f32) -> Self {
        Self {
            x,
            y,
            velocity: Some(Velocity { x: vel_x, y: vel_y }),
        }
    }
}

/// Body of an update, either a discrete command or a position sample.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub enum UpdatePayload {
    Command(Command),
    Position(PositionUpdate),
}

/// Envelope the server fans out, tagged with the user it describes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct ServerUpdate {
    pub user_id: u32,
    pub payload: UpdatePayload,
}

impl ServerUpdate {
    pub fn command(user_id: u32, command: Command) -> Self {
        Self {
            user_id,
            payload: UpdatePayload::Command(command),
        }
    }

    pub fn position(user_id: u32, position: PositionUpdate) -> Self {
        Self {
            user_id,
            payload: UpdatePayload::Position(position),
        }
    }

    pub fn is_command(&self, command: Command) -> bool {
        self.payload == UpdatePayload::Command(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_with_token_sets_authorization() {
        match GamePacket::connect_with_token("abc.def.ghi") {
            GamePacket::Connect { metadata } => {
                assert_eq!(
                    metadata.get(AUTHORIZATION_KEY).map(String::as_str),
                    Some("abc.def.ghi")
                );
                assert_eq!(metadata.len(), 1);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_server_update_constructors() {
        let joined = ServerUpdate::command(7, Command::Joined);
        assert_eq!(joined.user_id, 7);
        assert!(joined.is_command(Command::Joined));
        assert!(!joined.is_command(Command::Quit));

        let moved = ServerUpdate::position(3, PositionUpdate::new(140.0, 310.0));
        assert_eq!(moved.user_id, 3);
        match moved.payload {
            UpdatePayload::Position(p) => {
                assert_eq!(p.x, 140.0);
                assert_eq!(p.y, 310.0);
                assert!(p.velocity.is_none());
            }
            _ => panic!("Wrong payload type"),
        }
    }

    #[test]
    fn test_game_state_packet_serialization() {
        let packet = GamePacket::Server(ServerUpdate::position(
            2,
            PositionUpdate::with_velocity(10.5, 20.25, -1.5, 4.6),
        ));

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: GamePacket = bincode::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, packet);
    }

    #[test]
    fn test_auth_packet_serialization() {
        let packet = AuthPacket::Authorize {
            username: "grevian".to_string(),
            password: "hunter2".to_string(),
        };

        let serialized = bincode::serialize(&packet).unwrap();
        let deserialized: AuthPacket = bincode::deserialize(&serialized).unwrap();

        match deserialized {
            AuthPacket::Authorize { username, password } => {
                assert_eq!(username, "grevian");
                assert_eq!(password, "hunter2");
            }
            _ => panic!("Wrong packet type after deserialization"),
        }
    }
}

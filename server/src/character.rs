//! Authoritative per-player simulation.
//!
//! A [`Character`] owns one player's position and physics state. The game
//! loop advances it with [`Character::tick`] once per interval, and the
//! player's inbound stream feeds it commands and position reports through
//! [`Character::apply`]. Both paths run under the same per-character lock so
//! they never interleave.

use crate::level::Level;
use log::{debug, warn};
use shared::{Command, PositionUpdate, UpdatePayload};

pub const GRAVITY_ACCELERATION: f64 = 0.08;
pub const GRAVITY_MAX_FORCE: f64 = 9.2;
pub const HORIZONTAL_ACCELERATION: f64 = 0.7;
pub const HORIZONTAL_MAX_FORCE: f64 = 6.0;

/// Forces at or below these magnitudes snap to exactly zero.
pub const HORIZONTAL_REST_EPSILON: f64 = 0.2;
pub const VERTICAL_REST_EPSILON: f64 = 0.02;

/// Largest per-axis disagreement tolerated between server and client positions.
pub const ACCEPTABLE_SKEW: f64 = 150.0;

pub const CHARACTER_WIDTH: f64 = 20.0;
pub const CHARACTER_HEIGHT: f64 = 20.0;

pub const JUMP_FORCE: f64 = -(GRAVITY_MAX_FORCE / 2.0);
pub const DOUBLE_JUMP_FORCE: f64 = -GRAVITY_MAX_FORCE / 3.0;

///Top-left corner of a character's bounding box, y grows downwards.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physics {
    pub grounded: bool,
    ///Horizontal and vertical force applied to the position every tick.
    pub forces: [f64; 2],
    pub width: f64,
    pub height: f64,
    pub double_jumping: bool,
}

impl Default for Physics {
    fn default() -> Self {
        Physics {
            grounded: false,
            forces: [0.0, 0.0],
            width: CHARACTER_WIDTH,
            height: CHARACTER_HEIGHT,
            double_jumping: false,
        }
    }
}

/// What happened to a client position report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReportOutcome {
    /// The reported velocity now drives the character.
    Accepted,
    /// The report disagreed with the server position by too much and was dropped.
    Skewed { skew_x: f64, skew_y: f64 },
    /// The report contained NaN or infinite components and was dropped.
    NonFinite,
}

#[derive(Debug, Clone)]
pub struct Character {
    name: String,
    position: Position,
    physics: Physics,
}

impl Character {
    pub fn new(name: impl Into<String>, position: Position) -> Self {
        Self {
            name: name.into(),
            position,
            physics: Physics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn physics(&self) -> &Physics {
        &self.physics
    }

    pub fn is_grounded(&self) -> bool {
        self.physics.grounded
    }

    pub fn forces(&self) -> [f64; 2] {
        self.physics.forces
    }

    /// Current state as it travels over the wire.
    pub fn position_update(&self) -> PositionUpdate {
        PositionUpdate::with_velocity(
            self.position.x as f32,
            self.position.y as f32,
            self.physics.forces[0] as f32,
            self.physics.forces[1] as f32,
        )
    }

    /// Advances the simulation by one fixed step.
    ///
    /// Returns the new position when the character moved, `None` otherwise.
    pub fn tick(&mut self, level: &Level) -> Option<PositionUpdate> {
        let previous = self.position;

        // Only land when falling or at rest, so jumping off a platform
        // is not immediately cancelled by the platform itself.
        if !self.physics.grounded
            && self.physics.forces[1] >= 0.0
            && level
                .supporting_platform(self.position, self.physics.height)
                .is_some()
        {
            self.physics.grounded = true;
            self.physics.double_jumping = false;
            self.physics.forces[1] = 0.0;
        }

        if !self.physics.grounded {
            self.physics.forces[1] =
                (self.physics.forces[1] + GRAVITY_ACCELERATION).min(GRAVITY_MAX_FORCE);
            self.physics.forces[0] =
                towards_zero(self.physics.forces[0], HORIZONTAL_ACCELERATION / 6.0);
        } else {
            self.physics.forces[0] =
                towards_zero(self.physics.forces[0], HORIZONTAL_ACCELERATION / 2.0);
        }

        self.physics.forces[0] = clamp_to_zero(self.physics.forces[0], HORIZONTAL_REST_EPSILON);
        self.physics.forces[1] = clamp_to_zero(self.physics.forces[1], VERTICAL_REST_EPSILON);

        if self.physics.forces[0] != 0.0 {
            self.physics.grounded = false;
            self.position.x = level.clamp_x(
                self.position.x + self.physics.forces[0],
                self.physics.width,
            );
        }

        if self.physics.forces[1] != 0.0 {
            self.physics.grounded = false;
            self.position.y = level.clamp_y(
                self.position.y + self.physics.forces[1],
                self.physics.height,
            );
        }

        if self.position != previous {
            Some(self.position_update())
        } else {
            None
        }
    }

    /// Applies one inbound client payload.
    pub fn apply(&mut self, payload: UpdatePayload, level: &Level) {
        match payload {
            UpdatePayload::Command(command) => self.apply_command(command, level),
            UpdatePayload::Position(report) => {
                self.apply_position_report(&report);
            }
        }
    }

    pub fn apply_command(&mut self, command: Command, level: &Level) {
        debug!("user={} command={:?}", self.name, command);
        match command {
            // Roster removal is handled by the registry.
            Command::Quit => {}
            Command::Joined => {
                self.position = level.spawn();
                self.physics.forces = [0.0, 0.0];
                self.physics.grounded = false;
            }
            Command::Jump => {
                if self.physics.grounded {
                    self.physics.forces[1] = JUMP_FORCE;
                    self.physics.grounded = false;
                } else if !self.physics.double_jumping {
                    self.physics.double_jumping = true;
                    self.physics.forces[1] = DOUBLE_JUMP_FORCE;
                }
            }
        }
    }

    /// Checks a client-reported position against the server's and, when they
    /// agree closely enough, adopts the reported velocity.
    ///
    /// The client's position itself is never adopted.
    pub fn apply_position_report(&mut self, report: &PositionUpdate) -> ReportOutcome {
        let (vel_x, vel_y) = report
            .velocity
            .map(|v| (v.x as f64, v.y as f64))
            .unwrap_or((0.0, 0.0));
        let reported_x = report.x as f64;
        let reported_y = report.y as f64;

        if ![reported_x, reported_y, vel_x, vel_y]
            .iter()
            .all(|v| v.is_finite())
        {
            warn!("user={} sent a non-finite position report, dropping it", self.name);
            return ReportOutcome::NonFinite;
        }

        let skew_x = (self.position.x - reported_x).abs();
        let skew_y = (self.position.y - reported_y).abs();
        if skew_x > ACCEPTABLE_SKEW || skew_y > ACCEPTABLE_SKEW {
            warn!(
                "user={} position update skewed too far (x={:.1}, y={:.1}, allowed={}), rejecting",
                self.name, skew_x, skew_y, ACCEPTABLE_SKEW
            );
            return ReportOutcome::Skewed { skew_x, skew_y };
        }

        if report.velocity.is_some() {
            self.physics.forces[0] = vel_x.clamp(-HORIZONTAL_MAX_FORCE, HORIZONTAL_MAX_FORCE);
            self.physics.forces[1] = vel_y.clamp(-GRAVITY_MAX_FORCE, GRAVITY_MAX_FORCE);
        }
        ReportOutcome::Accepted
    }
}

/// Moves `value` towards zero by `step` without crossing it.
fn towards_zero(value: f64, step: f64) -> f64 {
    if value > 0.0 {
        (value - step).max(0.0)
    } else if value < 0.0 {
        (value + step).min(0.0)
    } else {
        value
    }
}

/// Returns `value` unless its magnitude is within `range`, in which case 0.
fn clamp_to_zero(value: f64, range: f64) -> f64 {
    if value.abs() <= range {
        0.0
    } else {
        value
    }
}

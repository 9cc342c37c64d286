use crate::character::Position;

pub const PLATFORM_WIDTH: f64 = 100.0;
pub const PLATFORM_HEIGHT: f64 = 10.0;
pub const DEFAULT_FRICTION: u32 = 2;

pub const LEVEL_WIDTH: f64 = 800.0;
pub const LEVEL_HEIGHT: f64 = 600.0;
pub const SPAWN_X: f64 = 140.0;
pub const SPAWN_Y: f64 = 310.0;

/// A static ledge characters can stand on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Platform {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub friction: u32,
}

impl Platform {
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            width: PLATFORM_WIDTH,
            height: PLATFORM_HEIGHT,
            friction: DEFAULT_FRICTION,
        }
    }

    /// Whether a box `height` tall at `position` rests on this platform.
    ///
    /// The box's bottom edge has to sit inside the platform's vertical band and
    /// its left edge has to lie within the platform's horizontal span.
    pub fn supports(&self, position: Position, height: f64) -> bool {
        let bottom_in_band = position.y + height >= self.y && position.y <= self.y + self.height;
        let over_platform = position.x >= self.x && position.x <= self.x + self.width;
        bottom_in_band && over_platform
    }
}

/// Immutable world geometry shared by every character.
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    platforms: Vec<Platform>,
    width: f64,
    height: f64,
    spawn: Position,
}

impl Level {
    pub fn new(platforms: Vec<Platform>, width: f64, height: f64, spawn: Position) -> Self {
        Self {
            platforms,
            width,
            height,
            spawn,
        }
    }

    pub fn platforms(&self) -> &[Platform] {
        &self.platforms
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn spawn(&self) -> Position {
        self.spawn
    }

    /// First platform, in level order, that supports the given box.
    pub fn supporting_platform(&self, position: Position, height: f64) -> Option<&Platform> {
        self.platforms
            .iter()
            .find(|platform| platform.supports(position, height))
    }

    pub fn clamp_x(&self, x: f64, width: f64) -> f64 {
        x.max(0.0).min(self.width - width)
    }

    pub fn clamp_y(&self, y: f64, height: f64) -> f64 {
        y.max(0.0).min(self.height - height)
    }
}

impl Default for Level {
    fn default() -> Self {
        Self::new(
            vec![
                Platform::new(20.0, 150.0),
                Platform::new(390.0, 250.0),
                Platform::new(45.0, 500.0),
                Platform::new(120.0, 360.0),
            ],
            LEVEL_WIDTH,
            LEVEL_HEIGHT,
            Position::new(SPAWN_X, SPAWN_Y),
        )
    }
}

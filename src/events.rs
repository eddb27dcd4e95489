//! # Events: Typed Domain Events Harvested from Server Logs
//!
//! Every recognised log line becomes exactly one [`DomainEvent`]. The set of
//! variants is closed: the dispatcher matches on it exhaustively, so adding a
//! variant is a compile error everywhere an effect decision is made.
//!
//! ## Event Types
//!
//! | Variant | Emitted When |
//! |---------|-------------|
//! | `Connection` | A player joins and the line carries an IP address |
//! | `Kill` | A player is killed by another player |
//! | `Death` | A player dies to an animal or the environment |
//! | `Placement` | A player places or builds a structure |
//! | `ZombieKill` | A player kills an infected |
//! | `FishCaught` | A player lands a fish |
//!
//! ## Geolocation
//!
//! Position-bearing variants carry a `location` label derived from a fixed
//! table of map landmarks. The label is computed once at classification time
//! and stored with the event payload.

use serde::{Deserialize, Serialize};

/// Horizontal distance under which an event is reported as being *in* a landmark.
const IN_LANDMARK_RADIUS: f64 = 600.0;
/// Horizontal distance under which an event is reported as being *near* a landmark.
const NEAR_LANDMARK_RADIUS: f64 = 2000.0;
/// Label used when no landmark is within [`NEAR_LANDMARK_RADIUS`].
pub const WILDERNESS: &str = "wilderness";

/// Landmark coordinates (x, z) on the Chernarus map.
const LANDMARKS: [(&str, f64, f64); 20] = [
    ("NWAF", 4600.0, 10000.0),
    ("Berezino", 12000.0, 9000.0),
    ("Chernogorsk", 6500.0, 2500.0),
    ("Elektrozavodsk", 10500.0, 2300.0),
    ("Krasnostav", 11000.0, 12300.0),
    ("Stary Sobor", 6000.0, 7700.0),
    ("Vybor", 3800.0, 8900.0),
    ("Zelenogorsk", 2700.0, 5300.0),
    ("Tisy Military", 1700.0, 14000.0),
    ("Balota AF", 4500.0, 2500.0),
    ("Svetlojarsk", 13900.0, 13300.0),
    ("Novodmitrovsk", 11500.0, 14500.0),
    ("Severograd", 8400.0, 13700.0),
    ("Gorka", 9500.0, 8800.0),
    ("Kabanino", 5300.0, 8600.0),
    ("Grishino", 7200.0, 9700.0),
    ("Pavlovo", 1700.0, 3800.0),
    ("Kamenka", 1800.0, 2200.0),
    ("Myshkino", 2000.0, 7300.0),
    ("VMC", 4500.0, 8300.0),
];

/// A world position. `y` is altitude; proximity checks only use `x` and `z`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    /// Euclidean distance in 3D, used for shot distance between two vectors.
    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2) + (self.z - other.z).powi(2))
            .sqrt()
    }
}

/// Planar distance on the map (x/z plane).
pub fn planar_distance(ax: f64, az: f64, bx: f64, bz: f64) -> f64 {
    ((ax - bx).powi(2) + (az - bz).powi(2)).sqrt()
}

/// Human-readable label for the landmark nearest to `(x, z)`.
pub fn nearest_location(x: f64, z: f64) -> String {
    let (name, dist) = LANDMARKS
        .iter()
        .map(|(name, lx, lz)| (*name, planar_distance(x, z, *lx, *lz)))
        .fold(("", f64::INFINITY), |best, cur| if cur.1 < best.1 { cur } else { best });

    if dist < IN_LANDMARK_RADIUS {
        name.to_string()
    } else if dist < NEAR_LANDMARK_RADIUS {
        format!("near {}", name)
    } else {
        WILDERNESS.to_string()
    }
}

/// What killed a player in a non-PvP death.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathCauseKind {
    Animal,
    Environment,
}

/// Closed set of events derived from log lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Connection {
        gamertag: String,
        ip: String,
        identity: Option<String>,
    },
    Kill {
        killer: String,
        victim: String,
        weapon: String,
        distance: f64,
        position: Option<Position>,
        location: Option<String>,
    },
    Death {
        victim: String,
        cause: String,
        cause_kind: DeathCauseKind,
        position: Position,
        location: String,
    },
    Placement {
        gamertag: String,
        structure: String,
        position: Position,
        location: String,
    },
    ZombieKill {
        gamertag: String,
    },
    FishCaught {
        gamertag: String,
        species: String,
    },
}

/// Event kind tag, also the `kind` column in storage and the achievement trigger key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connection,
    Kill,
    Death,
    Placement,
    ZombieKill,
    FishCaught,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connection => "connection",
            EventKind::Kill => "kill",
            EventKind::Death => "death",
            EventKind::Placement => "placement",
            EventKind::ZombieKill => "zombie_kill",
            EventKind::FishCaught => "fish_caught",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::Connection { .. } => EventKind::Connection,
            DomainEvent::Kill { .. } => EventKind::Kill,
            DomainEvent::Death { .. } => EventKind::Death,
            DomainEvent::Placement { .. } => EventKind::Placement,
            DomainEvent::ZombieKill { .. } => EventKind::ZombieKill,
            DomainEvent::FishCaught { .. } => EventKind::FishCaught,
        }
    }

    /// The player credited with the event: the killer for PvP, the victim for
    /// deaths, the acting player otherwise.
    pub fn actor(&self) -> &str {
        match self {
            DomainEvent::Connection { gamertag, .. }
            | DomainEvent::Placement { gamertag, .. }
            | DomainEvent::ZombieKill { gamertag }
            | DomainEvent::FishCaught { gamertag, .. } => gamertag,
            DomainEvent::Kill { killer, .. } => killer,
            DomainEvent::Death { victim, .. } => victim,
        }
    }

    pub fn position(&self) -> Option<Position> {
        match self {
            DomainEvent::Kill { position, .. } => *position,
            DomainEvent::Death { position, .. } | DomainEvent::Placement { position, .. } => {
                Some(*position)
            }
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&str> {
        match self {
            DomainEvent::Kill { location, .. } => location.as_deref(),
            DomainEvent::Death { location, .. } | DomainEvent::Placement { location, .. } => {
                Some(location)
            }
            _ => None,
        }
    }

    /// One-line description used in notifications and the `classify` command.
    pub fn summary(&self) -> String {
        match self {
            DomainEvent::Connection { gamertag, .. } => format!("{} connected", gamertag),
            DomainEvent::Kill {
                killer,
                victim,
                weapon,
                distance,
                ..
            } => {
                if *distance > 0.0 {
                    format!("{} killed {} with {} ({:.0}m)", killer, victim, weapon, distance)
                } else {
                    format!("{} killed {} with {}", killer, victim, weapon)
                }
            }
            DomainEvent::Death { victim, cause, .. } => format!("{} killed by {}", victim, cause),
            DomainEvent::Placement {
                gamertag, structure, ..
            } => format!("{} placed {}", gamertag, structure),
            DomainEvent::ZombieKill { gamertag } => format!("{} killed an infected", gamertag),
            DomainEvent::FishCaught { gamertag, species } => {
                format!("{} caught {}", gamertag, species)
            }
        }
    }
}

//! # Territory: Base Proximity Index
//!
//! Holds the registered bases in memory and answers "which base is nearest to
//! this point, and how close". The index is rebuilt from the store once per
//! dispatch cycle; a base added mid-cycle is seen on the next one.
//!
//! ## Tiers
//!
//! | Tier | Condition |
//! |------|-----------|
//! | `Violation` | `distance <= radius` |
//! | `Alert` | `radius < distance <= radius + alert_margin` |
//! | `Safe` | farther, or the actor is the owner / a clanmate |

use crate::events::planar_distance;
use crate::store::Base;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProximityTier {
    Violation,
    Alert,
    Safe,
}

/// Tier for a point `distance` away from a base of `radius`.
pub fn tier_for(distance: f64, radius: f64, alert_margin: f64) -> ProximityTier {
    if distance <= radius {
        ProximityTier::Violation
    } else if distance <= radius + alert_margin {
        ProximityTier::Alert
    } else {
        ProximityTier::Safe
    }
}

/// Who caused a location-bearing event.
#[derive(Debug, Clone, Default)]
pub struct Actor<'a> {
    pub identity: Option<&'a str>,
    pub clan: Option<&'a str>,
}

/// Nearest base and the resulting tier for one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Proximity {
    pub base: Base,
    pub distance: f64,
    pub tier: ProximityTier,
}

#[derive(Debug, Clone, Default)]
pub struct TerritoryIndex {
    bases: Vec<Base>,
    alert_margin: f64,
}

impl TerritoryIndex {
    pub fn new(bases: Vec<Base>, alert_margin: f64) -> Self {
        TerritoryIndex {
            bases,
            alert_margin,
        }
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Closest base to `(x, z)` on the map plane.
    pub fn nearest(&self, x: f64, z: f64) -> Option<(&Base, f64)> {
        self.bases
            .iter()
            .map(|b| (b, planar_distance(x, z, b.x, b.z)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Tiered proximity of an event at `(x, z)`, with friendly suppression:
    /// the base owner and members of the owner's clan are always `Safe`.
    pub fn classify(&self, x: f64, z: f64, actor: &Actor<'_>) -> Option<Proximity> {
        let (base, distance) = self.nearest(x, z)?;
        let friendly = actor.identity.is_some_and(|id| id == base.owner_id)
            || matches!(
                (actor.clan, base.clan_tag.as_deref()),
                (Some(a), Some(b)) if a == b
            );
        let tier = if friendly {
            ProximityTier::Safe
        } else {
            tier_for(distance, base.radius, self.alert_margin)
        };
        Some(Proximity {
            base: base.clone(),
            distance,
            tier,
        })
    }
}

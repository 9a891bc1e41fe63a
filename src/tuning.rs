//! Game balance tuning
//!
//! Radii, timers and prices that designers adjust per build. Loaded from JSON;
//! missing fields fall back to the defaults below.

use serde::{Deserialize, Serialize};

/// Coin prices of paid editing actions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prices {
    /// Relocate a system within `move_radius`
    pub move_system: u32,
    /// Place a recenter trigger on a wire
    pub recenter: u32,
    /// Place a zero-acceleration trigger on a wire
    pub zero_accel: u32,
}

impl Default for Prices {
    fn default() -> Self {
        Self {
            move_system: 15,
            recenter: 10,
            zero_accel: 20,
        }
    }
}

/// Simulation balance knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Wires must stay at least this far from every system centre
    pub safe_radius: f32,
    /// Distance at which a travelling packet fires a timed trigger
    pub effect_radius: f32,
    /// Lifetime of a timed trigger on a wire (seconds)
    pub effect_lifetime: f32,
    /// How long a zero-accel trigger holds a packet's acceleration at zero
    pub suppression_window: f32,
    /// Pick tolerance for hitting a wire with a point
    pub wire_hit_tolerance: f32,
    /// Chance a corruptor marks a packet compromised
    pub corrupt_probability: f32,
    /// Cloak cleanup reach around the system centre
    pub cloak_radius: f32,
    /// Seconds between cloak cleanups
    pub cloak_cooldown: f32,
    /// Giant-packet arrivals a system survives before it is destroyed
    pub giant_limit: u32,
    /// How far a system may be moved from its original centre
    pub move_radius: f32,
    /// Paid action prices
    pub prices: Prices,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            safe_radius: 35.0,
            effect_radius: 10.0,
            effect_lifetime: 20.0,
            suppression_window: 20.0,
            wire_hit_tolerance: 5.0,
            corrupt_probability: 0.1,
            cloak_radius: 50.0,
            cloak_cooldown: 2.0,
            giant_limit: 3,
            move_radius: 120.0,
            prices: Prices::default(),
        }
    }
}

impl Tuning {
    /// Parse tuning from JSON, defaulting any omitted field
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let tuning: Tuning = serde_json::from_str(json)?;
        log::info!("Loaded tuning overrides");
        Ok(tuning)
    }
}

//! Wirenet - packet routing puzzle simulation core
//!
//! Core modules:
//! - `sim`: Simulation (wire geometry, packets, systems, collisions, world tick)
//! - `level`: Level description consumed when building a world
//! - `profile`: Player profile persistence (wallet, per-level progress)
//! - `tuning`: Data-driven game balance
//! - `error`: Error types for rejected edits and I/O

pub mod error;
pub mod level;
pub mod profile;
pub mod sim;
pub mod tuning;

pub use error::{BendError, LevelError, ProfileError, WorldError};
pub use level::LevelConfig;
pub use profile::{PlayerProfile, ProgressStore};
pub use tuning::Tuning;

use glam::Vec2;

/// Simulation configuration constants
pub mod consts {
    /// Fixed simulation timestep (60 Hz, the driver's cadence)
    pub const SIM_DT: f32 = 1.0 / 60.0;
    /// Maximum substeps per frame to prevent spiral of death
    pub const MAX_SUBSTEPS: u32 = 8;

    /// System box dimensions (top-left anchored)
    pub const SYSTEM_WIDTH: f32 = 90.0;
    pub const SYSTEM_HEIGHT: f32 = 70.0;

    /// Curve samples per bend when a path is walked or checked for clearance
    pub const PATH_SMOOTHNESS: usize = 6;
    /// Maximum bends on a single wire
    pub const MAX_BENDS: usize = 3;

    /// Packet footprint radius used for collisions
    pub const PACKET_RADIUS: f32 = 8.0;
    /// Broad-phase grid cell size
    pub const GRID_CELL: f32 = 32.0;
    /// Lateral kick applied on impact (px/s)
    pub const IMPACT_KICK: f32 = 60.0;
    /// Exponential damping rate of the lateral kick (1/s)
    pub const IMPACT_DRAG: f32 = 4.0;
}

/// Distance from `p` to the segment `a`-`b`
#[inline]
pub fn point_segment_distance(p: Vec2, a: Vec2, b: Vec2) -> f32 {
    p.distance(closest_point_on_segment(p, a, b))
}

/// Closest point to `p` on the segment `a`-`b`
#[inline]
pub fn closest_point_on_segment(p: Vec2, a: Vec2, b: Vec2) -> Vec2 {
    let ab = b - a;
    let len_sq = ab.length_squared();
    if len_sq < 1e-6 {
        return a;
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    a + ab * t
}

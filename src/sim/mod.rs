//! Simulation module
//!
//! All gameplay logic lives here. This module stays free of rendering and
//! platform code:
//! - Fixed timestep only
//! - Seeded RNG only
//! - Stable iteration order (by entity id)

pub mod collision;
pub mod packet;
pub mod path;
pub mod state;
pub mod system;
pub mod tick;

pub use collision::{Body, Contact, SpatialGrid, find_contacts, octagon};
pub use packet::{AggregateMotion, Arrival, Location, Packet, PacketId, PacketKind, Traversal};
pub use path::{BendPoint, WirePath};
pub use state::{GameEvent, Line, LineId, Outcome, TimedMark, WireEffect, World};
pub use system::{Port, PortRef, PortRole, Shape, System, SystemId, SystemKind, SystemType};
pub use tick::tick;

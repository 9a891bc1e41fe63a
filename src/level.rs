//! Level descriptions
//!
//! A level is a JSON document naming the systems, their box positions, port
//! shapes and the packets waiting in them at load. Wires are left to the player.

use std::path::Path;

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::error::LevelError;
use crate::sim::{AggregateMotion, Packet, Shape, System, SystemId, SystemType, World};
use crate::tuning::Tuning;

/// Packet kinds a level may place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnKind {
    Simple,
    Accelerating,
    Reversible,
    Aggregate,
}

fn one() -> u32 {
    1
}

/// Packets waiting in a system at load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub kind: SpawnKind,
    #[serde(default = "one")]
    pub count: u32,
    /// Aggregate size (number of fragments)
    #[serde(default)]
    pub size: u32,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub motion: AggregateMotion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub id: u32,
    pub kind: SystemType,
    /// Top-left of the system box
    pub position: Vec2,
    #[serde(default)]
    pub inputs: Vec<Shape>,
    #[serde(default)]
    pub outputs: Vec<Shape>,
    #[serde(default)]
    pub packets: Vec<SpawnConfig>,
}

/// A whole level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    pub name: String,
    pub systems: Vec<SystemConfig>,
}

impl LevelConfig {
    pub fn from_json(json: &str) -> Result<Self, LevelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, LevelError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl World {
    /// Build the initial world for a level: systems with laid-out ports and
    /// their starting packets
    pub fn from_level(level: &LevelConfig, seed: u64, tuning: Tuning) -> Result<Self, LevelError> {
        let mut world = World::new(level.name.clone(), seed, tuning);

        for cfg in &level.systems {
            let id = SystemId(cfg.id);
            world.add_system(System::new(
                id,
                cfg.kind.into(),
                cfg.position,
                &cfg.inputs,
                &cfg.outputs,
            ))?;

            for spawn in &cfg.packets {
                for _ in 0..spawn.count {
                    let packet_id = world.next_packet_id();
                    let packet = match spawn.kind {
                        SpawnKind::Simple => Packet::simple(packet_id),
                        SpawnKind::Accelerating => Packet::accelerating(packet_id),
                        SpawnKind::Reversible => Packet::reversible(packet_id),
                        SpawnKind::Aggregate => {
                            Packet::aggregate(packet_id, spawn.size, spawn.color, spawn.motion)
                        }
                    };
                    world.spawn_packet(id, packet)?;
                }
            }
        }

        log::info!(
            "Built level '{}': {} systems, {} packets",
            level.name,
            world.systems.len(),
            world.spawned
        );
        Ok(world)
    }
}

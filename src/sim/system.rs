//! Systems, ports and per-kind routing preferences
//!
//! Port centres are laid out from the system box at construction and whenever
//! the system moves.

use std::collections::{BTreeMap, VecDeque};

use glam::Vec2;
use serde::{Deserialize, Serialize};

use super::packet::{Packet, PacketId};
use super::state::LineId;
use crate::consts::{SYSTEM_HEIGHT, SYSTEM_WIDTH};

/// System identifier, assigned by the level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SystemId(pub u32);

/// Packet type a port accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Square,
    Triangle,
    Infinity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PortRole {
    Input,
    Output,
}

/// Handle to one port on one system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub system: SystemId,
    pub role: PortRole,
    pub index: usize,
}

impl PortRef {
    pub fn input(system: SystemId, index: usize) -> Self {
        Self {
            system,
            role: PortRole::Input,
            index,
        }
    }

    pub fn output(system: SystemId, index: usize) -> Self {
        Self {
            system,
            role: PortRole::Output,
            index,
        }
    }
}

/// Typed anchor on a system boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub shape: Shape,
    pub center: Vec2,
    /// At most one wire
    pub line: Option<LineId>,
}

/// Config-level system type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemType {
    Terminal,
    Relay,
    Corruptor,
    Cloak,
    Encryptor,
    Merger,
    Spy,
}

/// System behaviour, carrying only the state its kind needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemKind {
    /// Entry/exit point: arriving packets are delivered
    Terminal,
    Relay,
    /// Shrinks and may compromise packets; sends incompatible-first
    Corruptor,
    /// Periodically clears the compromised flag of one nearby held packet
    Cloak { cooldown: f32 },
    /// Wraps messengers, double-wraps wrapped packets
    Encryptor,
    /// Buckets fragments by parent until a whole aggregate can be rebuilt
    Merger {
        buckets: BTreeMap<PacketId, Vec<PacketId>>,
    },
    /// Swallows secrets; hands typed messengers to another spy
    Spy,
}

impl From<SystemType> for SystemKind {
    fn from(ty: SystemType) -> Self {
        match ty {
            SystemType::Terminal => SystemKind::Terminal,
            SystemType::Relay => SystemKind::Relay,
            SystemType::Corruptor => SystemKind::Corruptor,
            SystemType::Cloak => SystemKind::Cloak { cooldown: 0.0 },
            SystemType::Encryptor => SystemKind::Encryptor,
            SystemType::Merger => SystemKind::Merger {
                buckets: BTreeMap::new(),
            },
            SystemType::Spy => SystemKind::Spy,
        }
    }
}

/// A system entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct System {
    pub id: SystemId,
    pub kind: SystemKind,
    /// Top-left of the system box
    location: Vec2,
    /// Centre at level load; moves are limited around it
    home: Vec2,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    /// Held packets, FIFO
    pub queue: VecDeque<PacketId>,
    pub giant_arrivals: u32,
}

fn layout_ports(location: Vec2, shapes: &[Shape], x: f32) -> Vec<Port> {
    let n = shapes.len() as f32;
    shapes
        .iter()
        .enumerate()
        .map(|(i, &shape)| Port {
            shape,
            center: Vec2::new(x, location.y + (i as f32 + 1.0) * SYSTEM_HEIGHT / (n + 1.0)),
            line: None,
        })
        .collect()
}

impl System {
    pub fn new(
        id: SystemId,
        kind: SystemKind,
        location: Vec2,
        input_shapes: &[Shape],
        output_shapes: &[Shape],
    ) -> Self {
        let inputs = layout_ports(location, input_shapes, location.x);
        let outputs = layout_ports(location, output_shapes, location.x + SYSTEM_WIDTH);
        Self {
            id,
            kind,
            location,
            home: location + Self::half_extent(),
            inputs,
            outputs,
            queue: VecDeque::new(),
            giant_arrivals: 0,
        }
    }

    fn half_extent() -> Vec2 {
        Vec2::new(SYSTEM_WIDTH, SYSTEM_HEIGHT) * 0.5
    }

    pub fn location(&self) -> Vec2 {
        self.location
    }

    pub fn center(&self) -> Vec2 {
        self.location + Self::half_extent()
    }

    /// Centre at level load
    pub fn home(&self) -> Vec2 {
        self.home
    }

    /// Move the box so its centre is `center`; ports follow
    pub fn relocate(&mut self, center: Vec2) {
        let delta = center - self.center();
        self.location += delta;
        for port in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            port.center += delta;
        }
    }

    pub fn ports(&self, role: PortRole) -> &[Port] {
        match role {
            PortRole::Input => &self.inputs,
            PortRole::Output => &self.outputs,
        }
    }

    pub fn port(&self, role: PortRole, index: usize) -> Option<&Port> {
        self.ports(role).get(index)
    }

    pub fn port_mut(&mut self, role: PortRole, index: usize) -> Option<&mut Port> {
        match role {
            PortRole::Input => self.inputs.get_mut(index),
            PortRole::Output => self.outputs.get_mut(index),
        }
    }

    /// Every wire touching this system
    pub fn lines(&self) -> Vec<LineId> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .filter_map(|p| p.line)
            .collect()
    }

    pub fn all_ports_wired(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .all(|p| p.line.is_some())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, SystemKind::Terminal)
    }

    /// Corruptors and cloaks try wrong-shape ports first
    pub fn prefers_incompatible(&self) -> bool {
        matches!(self.kind, SystemKind::Corruptor | SystemKind::Cloak { .. })
    }

    /// Pick an output for `packet`: the first free port of the preferred
    /// partition, then of the other one. Returns the port index and whether it
    /// matches the packet.
    pub fn choose_output(
        &self,
        packet: &Packet,
        is_free: impl Fn(LineId) -> bool,
    ) -> Option<(usize, bool)> {
        let preferred = !self.prefers_incompatible();
        [preferred, !preferred].into_iter().find_map(|want_compatible| {
            self.outputs.iter().enumerate().find_map(|(i, port)| {
                let compatible = packet.is_compatible(port.shape);
                let free = port.line.is_some_and(&is_free);
                (compatible == want_compatible && free).then_some((i, compatible))
            })
        })
    }

    /// Packets held in merger buckets
    pub fn bucketed(&self) -> Vec<PacketId> {
        match &self.kind {
            SystemKind::Merger { buckets } => buckets.values().flatten().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the packet is queued or bucketed here
    pub fn holds(&self, packet: PacketId) -> bool {
        self.queue.contains(&packet) || self.bucketed().contains(&packet)
    }

    /// Forget a packet held here; true if it was found
    pub fn release(&mut self, packet: PacketId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|&p| p != packet);
        let mut found = self.queue.len() != before;
        if let SystemKind::Merger { buckets } = &mut self.kind {
            for bucket in buckets.values_mut() {
                let len = bucket.len();
                bucket.retain(|&p| p != packet);
                found |= bucket.len() != len;
            }
            buckets.retain(|_, b| !b.is_empty());
        }
        found
    }
}

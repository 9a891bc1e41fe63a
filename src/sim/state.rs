//! World state: entity arenas, wiring and destruction rules
//!
//! Systems, lines and packets live in id-keyed maps and refer to each other
//! only by handle. Anything that removes entities while walking a collection
//! snapshots the ids first.

use std::collections::BTreeMap;

use glam::Vec2;
use rand::SeedableRng;
use rand_pcg::Pcg32;
use serde::{Deserialize, Serialize};

use super::packet::{Location, Packet, PacketId};
use super::path::{BendPoint, WirePath};
use super::system::{Port, PortRef, PortRole, System, SystemId, SystemKind};
use crate::consts::PATH_SMOOTHNESS;
use crate::error::WorldError;
use crate::profile::ProgressStore;
use crate::tuning::Tuning;

/// Line identifier, allocated monotonically
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineId(pub u32);

/// Trigger point of a timed wire effect
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedMark {
    pub point: Vec2,
    /// World time (seconds) at which the mark disappears
    pub expires: f64,
}

/// A wire from an output port to an input port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub from: PortRef,
    pub to: PortRef,
    pub path: WirePath,
    /// The one packet travelling this wire, if any
    pub moving: Option<PacketId>,
    pub zero_accel: Vec<TimedMark>,
    pub recenter: Vec<TimedMark>,
}

impl Line {
    pub fn is_occupied(&self) -> bool {
        self.moving.is_some()
    }

    /// Drop marks whose lifetime has run out
    pub fn expire_effects(&mut self, now: f64) {
        self.zero_accel.retain(|m| m.expires > now);
        self.recenter.retain(|m| m.expires > now);
    }
}

/// Things the host may want to react to (sound, flashes, counters)
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    Delivered { packet: PacketId, coins: u32 },
    PacketLost { packet: PacketId },
    SystemDestroyed { system: SystemId },
    Merged { packet: PacketId, size: u32 },
    Won { coins: u32 },
    Lost,
}

/// How a finished level ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Won,
    Lost,
}

/// Timed wire effects a player can buy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEffect {
    ZeroAccel,
    Recenter,
}

/// Complete simulation state of one level run
#[derive(Debug, Clone)]
pub struct World {
    /// Level identity, used as the progress key
    pub level: String,
    pub tuning: Tuning,
    pub systems: BTreeMap<SystemId, System>,
    pub lines: BTreeMap<LineId, Line>,
    pub packets: BTreeMap<PacketId, Packet>,
    /// Coins earned this run
    pub coins: u32,
    pub delivered: u32,
    /// Packets queued at level load (fragments counted individually)
    pub spawned: u32,
    /// Sticky once half the spawned packets were delivered
    pub level_passed: bool,
    /// Simulation clock (seconds)
    pub time: f64,
    pub(crate) win_committed: bool,
    pub(crate) loss_reported: bool,
    pub(crate) launched: bool,
    pub(crate) ready: bool,
    pub(crate) rng: Pcg32,
    pub(crate) events: Vec<GameEvent>,
    next_packet_id: u32,
    next_line_id: u32,
}

impl World {
    pub fn new(level: impl Into<String>, seed: u64, tuning: Tuning) -> Self {
        Self {
            level: level.into(),
            tuning,
            systems: BTreeMap::new(),
            lines: BTreeMap::new(),
            packets: BTreeMap::new(),
            coins: 0,
            delivered: 0,
            spawned: 0,
            level_passed: false,
            time: 0.0,
            win_committed: false,
            loss_reported: false,
            launched: false,
            ready: false,
            rng: Pcg32::seed_from_u64(seed),
            events: Vec::new(),
            next_packet_id: 1,
            next_line_id: 1,
        }
    }

    /// Allocate a packet id; ids are never reused
    pub fn next_packet_id(&mut self) -> PacketId {
        let id = PacketId(self.next_packet_id);
        self.next_packet_id += 1;
        id
    }

    fn next_line_id(&mut self) -> LineId {
        let id = LineId(self.next_line_id);
        self.next_line_id += 1;
        id
    }

    pub fn add_system(&mut self, system: System) -> Result<(), WorldError> {
        if self.systems.contains_key(&system.id) {
            return Err(WorldError::DuplicateSystem(system.id));
        }
        self.systems.insert(system.id, system);
        Ok(())
    }

    /// Queue a level-load packet in `system`
    ///
    /// Aggregates never travel whole from a spawn point: they are split into
    /// unit fragments, each queued and counted on its own.
    pub fn spawn_packet(
        &mut self,
        system: SystemId,
        packet: Packet,
    ) -> Result<Vec<PacketId>, WorldError> {
        if !self.systems.contains_key(&system) {
            return Err(WorldError::UnknownSystem(system));
        }
        let packets = if packet.is_aggregate() {
            packet.split(|| self.next_packet_id())
        } else {
            vec![packet]
        };
        let ids: Vec<_> = packets.iter().map(|p| p.id).collect();
        for p in packets {
            self.queue_packet(system, p);
            self.spawned += 1;
        }
        Ok(ids)
    }

    /// Park a packet at the back of a system queue and register it
    pub(crate) fn queue_packet(&mut self, system: SystemId, mut packet: Packet) {
        if let Some(sys) = self.systems.get_mut(&system) {
            packet.park(system, sys.center());
            sys.queue.push_back(packet.id);
        }
        self.packets.insert(packet.id, packet);
    }

    pub fn port(&self, port: PortRef) -> Result<&Port, WorldError> {
        let system = self
            .systems
            .get(&port.system)
            .ok_or(WorldError::UnknownSystem(port.system))?;
        system
            .port(port.role, port.index)
            .ok_or(WorldError::UnknownPort(port))
    }

    fn port_mut(&mut self, port: PortRef) -> Option<&mut Port> {
        self.systems
            .get_mut(&port.system)?
            .port_mut(port.role, port.index)
    }

    /// Wire an output port to an input port
    pub fn add_line(&mut self, from: PortRef, to: PortRef) -> Result<LineId, WorldError> {
        if from.role != PortRole::Output {
            return Err(WorldError::PortRole(from));
        }
        if to.role != PortRole::Input {
            return Err(WorldError::PortRole(to));
        }
        if from.system == to.system {
            return Err(WorldError::SelfLoop);
        }
        let start = self.port(from)?;
        if start.line.is_some() {
            return Err(WorldError::PortOccupied(from));
        }
        let start = start.center;
        let end = self.port(to)?;
        if end.line.is_some() {
            return Err(WorldError::PortOccupied(to));
        }
        let end = end.center;

        let id = self.next_line_id();
        for port in [from, to] {
            if let Some(p) = self.port_mut(port) {
                p.line = Some(id);
            }
        }
        self.lines.insert(
            id,
            Line {
                id,
                from,
                to,
                path: WirePath::new(start, end),
                moving: None,
                zero_accel: Vec::new(),
                recenter: Vec::new(),
            },
        );
        log::debug!("Wired {from:?} -> {to:?} as {id:?}");
        Ok(id)
    }

    /// Unwire a line; its in-flight packet is lost with it
    pub fn remove_line(&mut self, id: LineId) -> Result<(), WorldError> {
        let line = self.lines.remove(&id).ok_or(WorldError::UnknownLine(id))?;
        for port in [line.from, line.to] {
            if let Some(p) = self.port_mut(port)
                && p.line == Some(id)
            {
                p.line = None;
            }
        }
        if let Some(packet) = line.moving {
            self.destroy_packet(packet);
        }
        Ok(())
    }

    pub fn add_bend(
        &mut self,
        line: LineId,
        foot_a: Vec2,
        middle: Vec2,
        foot_b: Vec2,
    ) -> Result<usize, WorldError> {
        let wire = self.lines.get_mut(&line).ok_or(WorldError::UnknownLine(line))?;
        wire.path.add_bend(foot_a, middle, foot_b).map_err(|e| {
            log::warn!("Bend on {line:?} rejected: {e}");
            WorldError::from(e)
        })
    }

    pub fn remove_bend(&mut self, line: LineId, index: usize) -> Result<Option<BendPoint>, WorldError> {
        let wire = self.lines.get_mut(&line).ok_or(WorldError::UnknownLine(line))?;
        Ok(wire.path.remove_bend(index))
    }

    /// Line under a canvas point, within the pick tolerance
    pub fn line_at(&self, point: Vec2) -> Option<LineId> {
        let tolerance = self.tuning.wire_hit_tolerance;
        self.lines
            .values()
            .find(|l| l.path.hit(point, tolerance))
            .map(|l| l.id)
    }

    /// Buy a timed effect on a wire; the trigger snaps to the nearest path point
    ///
    /// `Ok(false)` when the wallet can't cover the price.
    pub fn place_effect(
        &mut self,
        store: &mut impl ProgressStore,
        effect: WireEffect,
        line: LineId,
        point: Vec2,
    ) -> Result<bool, WorldError> {
        if !self.lines.contains_key(&line) {
            return Err(WorldError::UnknownLine(line));
        }
        let price = match effect {
            WireEffect::ZeroAccel => self.tuning.prices.zero_accel,
            WireEffect::Recenter => self.tuning.prices.recenter,
        };
        if !store.try_spend(price) {
            log::warn!("Not enough coins for {effect:?} ({price})");
            return Ok(false);
        }
        let expires = self.time + self.tuning.effect_lifetime as f64;
        let Some(wire) = self.lines.get_mut(&line) else {
            return Err(WorldError::UnknownLine(line));
        };
        let mark = TimedMark {
            point: wire.path.closest_point(point),
            expires,
        };
        match effect {
            WireEffect::ZeroAccel => wire.zero_accel.push(mark),
            WireEffect::Recenter => wire.recenter.push(mark),
        }
        Ok(true)
    }

    pub fn place_zero_accel(
        &mut self,
        store: &mut impl ProgressStore,
        line: LineId,
        point: Vec2,
    ) -> Result<bool, WorldError> {
        self.place_effect(store, WireEffect::ZeroAccel, line, point)
    }

    pub fn place_recenter(
        &mut self,
        store: &mut impl ProgressStore,
        line: LineId,
        point: Vec2,
    ) -> Result<bool, WorldError> {
        self.place_effect(store, WireEffect::Recenter, line, point)
    }

    /// Buy a move of a system's centre; wires follow their ports
    pub fn move_system(
        &mut self,
        store: &mut impl ProgressStore,
        id: SystemId,
        center: Vec2,
    ) -> Result<bool, WorldError> {
        let system = self.systems.get(&id).ok_or(WorldError::UnknownSystem(id))?;
        if system.home().distance(center) > self.tuning.move_radius {
            return Err(WorldError::MoveOutOfRange(id));
        }
        if !store.try_spend(self.tuning.prices.move_system) {
            log::warn!("Not enough coins to move {id:?}");
            return Ok(false);
        }

        let Some(system) = self.systems.get_mut(&id) else {
            return Err(WorldError::UnknownSystem(id));
        };
        system.relocate(center);
        let mut held: Vec<PacketId> = system.queue.iter().copied().collect();
        held.extend(system.bucketed());
        for packet in &held {
            if let Some(packet) = self.packets.get_mut(packet) {
                packet.park(id, center);
            }
        }
        for line_id in system.lines() {
            let Some(line) = self.lines.get(&line_id) else {
                continue;
            };
            let (from, to) = (line.from, line.to);
            let (Ok(start), Ok(end)) = (self.port(from), self.port(to)) else {
                continue;
            };
            let (start, end) = (start.center, end.center);
            if let Some(line) = self.lines.get_mut(&line_id) {
                line.path.set_endpoints(start, end);
            }
        }
        Ok(true)
    }

    /// Detach a packet from every container and drop it from the arena
    pub(crate) fn take_packet(&mut self, id: PacketId) -> Option<Packet> {
        let packet = self.packets.remove(&id)?;
        match &packet.location {
            Location::Travelling(trav) => {
                if let Some(line) = self.lines.get_mut(&trav.line)
                    && line.moving == Some(id)
                {
                    line.moving = None;
                }
            }
            Location::Queued(system) => {
                if let Some(sys) = self.systems.get_mut(system) {
                    sys.release(id);
                }
            }
        }
        Some(packet)
    }

    /// Destroy a packet by rule (noise, corruption, cascade)
    pub fn destroy_packet(&mut self, id: PacketId) {
        if self.take_packet(id).is_some() {
            log::debug!("Packet {id:?} lost");
            self.events.push(GameEvent::PacketLost { packet: id });
        }
    }

    /// Remove a system with its wires, in-flight packets on those wires and
    /// everything it holds. Destroying an encryptor unwraps its envelopes.
    pub fn destroy_system(&mut self, id: SystemId) {
        let Some(system) = self.systems.get(&id) else {
            return;
        };
        let lines = system.lines();
        let mut held: Vec<PacketId> = system.queue.iter().copied().collect();
        held.extend(system.bucketed());
        let was_encryptor = matches!(system.kind, SystemKind::Encryptor);

        for line in lines {
            // Already gone if both ends were on this system
            let _ = self.remove_line(line);
        }
        for packet in held {
            self.destroy_packet(packet);
        }
        self.systems.remove(&id);

        if was_encryptor {
            self.unwrap_all(id);
        }
        log::info!("System {id:?} destroyed");
        self.events.push(GameEvent::SystemDestroyed { system: id });
    }

    /// Replace every envelope made by `wrapper` with its contents, in place
    pub fn unwrap_all(&mut self, wrapper: SystemId) {
        let wrapped: Vec<PacketId> = self
            .packets
            .values()
            .filter(|p| p.wrapper() == Some(wrapper))
            .map(|p| p.id)
            .collect();

        for outer_id in wrapped {
            let Some(mut packet) = self.packets.remove(&outer_id) else {
                continue;
            };
            loop {
                match packet.unwrap_if_wrapped_by(wrapper) {
                    Ok(inner) => packet = inner,
                    Err(done) => {
                        packet = done;
                        break;
                    }
                }
            }
            let inner_id = packet.id;
            match &packet.location {
                Location::Queued(system) => {
                    if let Some(sys) = self.systems.get_mut(system) {
                        for slot in sys.queue.iter_mut().filter(|s| **s == outer_id) {
                            *slot = inner_id;
                        }
                    }
                }
                Location::Travelling(trav) => {
                    if let Some(line) = self.lines.get_mut(&trav.line) {
                        line.moving = Some(inner_id);
                    }
                }
            }
            log::debug!("Unwrapped {outer_id:?} into {inner_id:?}");
            self.packets.insert(inner_id, packet);
        }
    }

    /// Every port wired and no wire grazes a system
    pub fn compute_ready(&self) -> bool {
        if !self.systems.values().all(System::all_ports_wired) {
            return false;
        }
        let safe = self.tuning.safe_radius;
        self.lines.values().all(|line| {
            self.systems
                .values()
                .all(|s| line.path.distance_to(s.center(), PATH_SMOOTHNESS) >= safe)
        })
    }

    /// Readiness as of the last tick
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Start sending; cannot be undone
    pub fn launch(&mut self) {
        if !self.launched {
            log::info!("Level '{}' launched", self.level);
        }
        self.launched = true;
    }

    pub fn is_launched(&self) -> bool {
        self.launched
    }

    pub fn outcome(&self) -> Option<Outcome> {
        if self.win_committed {
            Some(Outcome::Won)
        } else if self.loss_reported {
            Some(Outcome::Lost)
        } else {
            None
        }
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<GameEvent> {
        std::mem::take(&mut self.events)
    }

    /// Packets currently queued in a system, front first
    pub fn queued(&self, system: SystemId) -> Vec<&Packet> {
        self.systems
            .get(&system)
            .map(|s| s.queue.iter().filter_map(|id| self.packets.get(id)).collect())
            .unwrap_or_default()
    }

    /// Cross-reference check: each packet is held by exactly the container its
    /// location names, and every container reference resolves
    pub fn is_consistent(&self) -> bool {
        let located = self.packets.values().all(|p| match &p.location {
            Location::Queued(s) => self.systems.get(s).is_some_and(|sys| sys.holds(p.id)),
            Location::Travelling(t) => self
                .lines
                .get(&t.line)
                .is_some_and(|l| l.moving == Some(p.id)),
        });
        let queues = self.systems.values().all(|s| {
            s.queue
                .iter()
                .copied()
                .chain(s.bucketed())
                .all(|id| self.packets.get(&id).is_some_and(|p| p.system() == Some(s.id)))
        });
        let wires = self.lines.values().all(|l| {
            l.moving
                .is_none_or(|id| self.packets.get(&id).is_some_and(|p| p.line() == Some(l.id)))
        });
        located && queues && wires
    }
}

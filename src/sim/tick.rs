//! Fixed timestep simulation tick
//!
//! One call advances the world by `dt`: effects and movement per wire,
//! suppression expiry, collisions, readiness, sending, then the level outcome.

use std::collections::BTreeSet;

use rand::Rng;

use super::collision::{Body, find_contacts};
use super::packet::{AggregateMotion, Arrival, Packet, PacketId, PacketKind};
use super::state::{GameEvent, LineId, World};
use super::system::{System, SystemId, SystemKind};
use crate::consts::{GRID_CELL, PATH_SMOOTHNESS};
use crate::profile::ProgressStore;

/// Advance the world by one fixed timestep
pub fn tick(world: &mut World, store: &mut impl ProgressStore, dt: f32) {
    world.time += dt as f64;
    let now = world.time;

    latch_pass(world);

    // Wires: effects, then movement. Arrivals may destroy systems and their
    // wires, so walk a snapshot of ids.
    let line_ids: Vec<LineId> = world.lines.keys().copied().collect();
    for line_id in line_ids {
        if let Some(arrival) = step_line(world, line_id, now, dt) {
            handle_arrival(world, line_id, arrival);
        }
    }

    for packet in world.packets.values_mut() {
        packet.expire_suppression(now);
    }

    resolve_collisions(world, dt);

    // Losses anywhere may leave a bucket holding every surviving piece
    let mergers: Vec<SystemId> = world
        .systems
        .values()
        .filter(|s| matches!(s.kind, SystemKind::Merger { .. }))
        .map(|s| s.id)
        .collect();
    for merger in mergers {
        release_buckets(world, merger);
    }

    // Never cached: wires or systems may have moved since the last tick
    world.ready = world.compute_ready();

    if world.launched && world.ready {
        let senders: Vec<SystemId> = world
            .systems
            .values()
            .filter(|s| !s.queue.is_empty())
            .map(|s| s.id)
            .collect();
        for system in senders {
            send(world, system);
        }
        cloak_sweep(world, dt);
    }

    settle_outcome(world, store);
}

/// Sticky once at least half of the spawned packets were delivered
fn latch_pass(world: &mut World) {
    if !world.level_passed && world.spawned > 0 && world.delivered * 2 >= world.spawned {
        world.level_passed = true;
        log::info!(
            "Level '{}' passed ({}/{} delivered)",
            world.level,
            world.delivered,
            world.spawned
        );
    }
}

/// Effects and movement for the packet on one wire
fn step_line(world: &mut World, line_id: LineId, now: f64, dt: f32) -> Option<(PacketId, Arrival)> {
    let radius = world.tuning.effect_radius;
    let window = world.tuning.suppression_window;

    let line = world.lines.get_mut(&line_id)?;
    line.expire_effects(now);
    let packet_id = line.moving?;
    let packet = world.packets.get_mut(&packet_id)?;

    let center = packet.collision_center();
    if line.zero_accel.iter().any(|m| m.point.distance(center) <= radius) {
        packet.suppress_acceleration(now, window);
    }
    if line.recenter.iter().any(|m| m.point.distance(center) <= radius) {
        packet.recenter();
    }

    packet.advance(dt).map(|arrival| (packet_id, arrival))
}

fn handle_arrival(world: &mut World, line_id: LineId, (packet_id, arrival): (PacketId, Arrival)) {
    let Some(line) = world.lines.get(&line_id) else {
        return;
    };
    let target = match arrival {
        Arrival::Forward => line.to.system,
        Arrival::Backward => line.from.system,
    };
    if let Some(packet) = world.take_packet(packet_id) {
        receive(world, target, packet);
    }
}

fn lose(world: &mut World, packet: PacketId) {
    log::debug!("Packet {packet:?} lost");
    world.events.push(GameEvent::PacketLost { packet });
}

/// Receive rule resolved from the system kind
#[derive(Debug, Clone, Copy)]
enum Reception {
    Deliver,
    Hold,
    Corrupt,
    Encrypt,
    Merge,
    Intercept,
}

/// Hand an arriving packet to a system
pub(crate) fn receive(world: &mut World, system_id: SystemId, mut packet: Packet) {
    let Some(system) = world.systems.get(&system_id) else {
        lose(world, packet.id);
        return;
    };

    if packet.is_aggregate() && !system.is_terminal() {
        giant_arrival(world, system_id, packet);
        return;
    }

    let reception = match system.kind {
        SystemKind::Terminal => Reception::Deliver,
        SystemKind::Relay | SystemKind::Cloak { .. } => Reception::Hold,
        SystemKind::Corruptor => Reception::Corrupt,
        SystemKind::Encryptor => Reception::Encrypt,
        SystemKind::Merger { .. } => Reception::Merge,
        SystemKind::Spy => Reception::Intercept,
    };

    match reception {
        Reception::Deliver => {
            let coins = packet.coin_value();
            world.coins += coins;
            // Units, so a re-merged aggregate balances its spawned fragments
            world.delivered += match packet.kind {
                PacketKind::Aggregate { .. } => packet.size,
                _ => 1,
            };
            log::debug!("Delivered {:?} at {system_id:?} (+{coins})", packet.id);
            world.events.push(GameEvent::Delivered {
                packet: packet.id,
                coins,
            });
        }
        Reception::Hold => world.queue_packet(system_id, packet),
        Reception::Corrupt => {
            if packet.shrink() {
                lose(world, packet.id);
                return;
            }
            let chance = world.tuning.corrupt_probability.clamp(0.0, 1.0) as f64;
            if world.rng.random_bool(chance) {
                packet.compromised = true;
            }
            world.queue_packet(system_id, packet);
        }
        Reception::Encrypt => {
            let packet = if matches!(packet.kind, PacketKind::Wrapped { .. }) {
                let id = world.next_packet_id();
                Packet::seal(id, packet, system_id)
            } else if packet.is_messenger() {
                let id = world.next_packet_id();
                Packet::wrap(id, packet, system_id, &mut world.rng)
            } else {
                packet
            };
            log::debug!("{system_id:?} emits {:?} ({:?})", packet.id, packet.wrapper());
            world.queue_packet(system_id, packet);
        }
        Reception::Merge => merge_fragment(world, system_id, packet),
        Reception::Intercept => {
            if !matches!(packet.kind, PacketKind::Secret { .. }) {
                world.queue_packet(system_id, packet);
                return;
            }
            // Secrets die here but still pay out
            let coins = packet.coin_value();
            world.coins += coins;
            log::debug!("{system_id:?} intercepted {:?} (+{coins})", packet.id);
            lose(world, packet.id);
        }
    }
}

/// Bucket a fragment, then rebuild whatever the merger now can
fn merge_fragment(world: &mut World, system_id: SystemId, mut packet: Packet) {
    let PacketKind::Fragment { parent, .. } = packet.kind else {
        world.queue_packet(system_id, packet);
        return;
    };

    let Some(system) = world.systems.get_mut(&system_id) else {
        return;
    };
    packet.park(system_id, system.center());
    let SystemKind::Merger { buckets } = &mut system.kind else {
        return;
    };
    buckets.entry(parent).or_default().push(packet.id);
    world.packets.insert(packet.id, packet);

    release_buckets(world, system_id);
}

/// Turn every bucket of `system_id` whose parent has no surviving piece
/// outside a merger into a new aggregate of the pieces it holds
fn release_buckets(world: &mut World, system_id: SystemId) {
    let bucketed: BTreeSet<PacketId> = world.systems.values().flat_map(System::bucketed).collect();
    let Some(SystemKind::Merger { buckets }) = world.systems.get(&system_id).map(|s| &s.kind) else {
        return;
    };
    let complete: Vec<PacketId> = buckets
        .keys()
        .copied()
        .filter(|&parent| {
            !world
                .packets
                .values()
                .any(|p| p.fragment_of() == Some(parent) && !bucketed.contains(&p.id))
        })
        .collect();

    for parent in complete {
        let fragments = match world.systems.get_mut(&system_id).map(|s| &mut s.kind) {
            Some(SystemKind::Merger { buckets }) => buckets.remove(&parent),
            _ => None,
        };
        let Some(fragments) = fragments else {
            continue;
        };
        let (color, motion) = fragments
            .first()
            .and_then(|id| world.packets.get(id))
            .and_then(|p| match p.kind {
                PacketKind::Fragment { color, motion, .. } => Some((color, motion)),
                _ => None,
            })
            .unwrap_or((0, AggregateMotion::Steady));
        for fragment in &fragments {
            world.packets.remove(fragment);
        }

        let size = fragments.len() as u32;
        let id = world.next_packet_id();
        log::debug!("{system_id:?} merged {size} fragments of {parent:?} into {id:?}");
        world.events.push(GameEvent::Merged { packet: id, size });
        world.queue_packet(system_id, Packet::aggregate(id, size, color, motion));
    }
}

/// A whole aggregate arrived somewhere other than a terminal: it flattens the
/// queue, and enough of them wreck the system
fn giant_arrival(world: &mut World, system_id: SystemId, packet: Packet) {
    let Some(system) = world.systems.get_mut(&system_id) else {
        return;
    };
    let flushed: Vec<PacketId> = system.queue.iter().copied().collect();
    system.giant_arrivals += 1;
    let arrivals = system.giant_arrivals;

    for id in flushed {
        world.destroy_packet(id);
    }
    world.queue_packet(system_id, packet);

    if arrivals >= world.tuning.giant_limit {
        log::info!("{system_id:?} overwhelmed after {arrivals} giant packets");
        world.destroy_system(system_id);
    }
}

/// Send the head of a system's queue. A spy passes typed messengers to a
/// random other spy, which tries to send them straight away.
fn send(world: &mut World, system_id: SystemId) {
    let Some(system) = world.systems.get(&system_id) else {
        return;
    };
    let Some(&head) = system.queue.front() else {
        return;
    };

    if matches!(system.kind, SystemKind::Spy)
        && world.packets.get(&head).is_some_and(|p| p.shape().is_some())
    {
        let peers: Vec<SystemId> = world
            .systems
            .values()
            .filter(|s| matches!(s.kind, SystemKind::Spy) && s.id != system_id)
            .map(|s| s.id)
            .collect();
        if !peers.is_empty() {
            let peer = peers[world.rng.random_range(0..peers.len())];
            if let Some(packet) = world.take_packet(head) {
                log::debug!("{system_id:?} hands {head:?} to {peer:?}");
                world.queue_packet(peer, packet);
                dispatch(world, peer, head);
            }
            return;
        }
    }

    dispatch(world, system_id, head);
}

/// Put a held packet onto a free output wire, if there is one
fn dispatch(world: &mut World, system_id: SystemId, packet_id: PacketId) {
    let Some(system) = world.systems.get(&system_id) else {
        return;
    };
    let Some(packet) = world.packets.get(&packet_id) else {
        return;
    };
    let lines = &world.lines;
    let Some((index, compatible)) =
        system.choose_output(packet, |l| lines.get(&l).is_some_and(|line| !line.is_occupied()))
    else {
        return;
    };
    let Some(line_id) = system.outputs[index].line else {
        return;
    };
    let Some(points) = lines.get(&line_id).map(|l| l.path.points(PATH_SMOOTHNESS)) else {
        return;
    };

    if let Some(system) = world.systems.get_mut(&system_id) {
        system.release(packet_id);
    }
    if let Some(packet) = world.packets.get_mut(&packet_id) {
        if !compatible {
            packet.wrong_port();
        }
        packet.begin_traversal(line_id, points);
    }
    if let Some(line) = world.lines.get_mut(&line_id) {
        line.moving = Some(packet_id);
    }
}

/// Each cloak, off cooldown, clears one compromised packet it holds
fn cloak_sweep(world: &mut World, dt: f32) {
    let radius = world.tuning.cloak_radius;
    let cooldown_reset = world.tuning.cloak_cooldown;

    for system in world.systems.values_mut() {
        let center = system.center();
        let SystemKind::Cloak { cooldown } = &mut system.kind else {
            continue;
        };
        *cooldown -= dt;
        if *cooldown > 0.0 {
            continue;
        }
        let target = system.queue.iter().copied().find(|id| {
            world
                .packets
                .get(id)
                .is_some_and(|p| p.compromised && p.collision_center().distance(center) <= radius)
        });
        match target.and_then(|id| world.packets.get_mut(&id)) {
            Some(packet) => {
                packet.compromised = false;
                *cooldown = cooldown_reset;
                log::debug!("{:?} cleaned {:?}", system.id, packet.id);
            }
            None => *cooldown = 0.0,
        }
    }
}

/// Noise, impulse and destruction for every overlapping pair
pub(crate) fn resolve_collisions(world: &mut World, dt: f32) {
    let bodies: Vec<Body> = world
        .packets
        .values()
        .filter(|p| p.is_moving())
        .map(|p| Body {
            id: p.id,
            center: p.collision_center(),
            radius: p.collision_radius(),
        })
        .collect();

    let mut doomed = BTreeSet::new();
    for contact in find_contacts(&bodies, GRID_CELL) {
        for id in [contact.a, contact.b] {
            let Some(packet) = world.packets.get_mut(&id) else {
                continue;
            };
            if packet.add_noise() {
                doomed.insert(id);
            }
            packet.apply_impulse(contact.point);
            packet.impact_step(dt);
        }
    }

    for id in doomed {
        world.destroy_packet(id);
    }
}

/// Win or loss once the last packet is gone
fn settle_outcome(world: &mut World, store: &mut impl ProgressStore) {
    if !world.launched || !world.packets.is_empty() {
        return;
    }
    // The last delivery may have landed this tick
    latch_pass(world);
    if world.level_passed {
        if !world.win_committed {
            world.win_committed = true;
            store.commit_win(&world.level, world.coins);
            log::info!("Level '{}' won with {} coins", world.level, world.coins);
            world.events.push(GameEvent::Won { coins: world.coins });
        }
    } else if !world.loss_reported {
        world.loss_reported = true;
        log::info!(
            "Level '{}' lost ({}/{} delivered)",
            world.level,
            world.delivered,
            world.spawned
        );
        world.events.push(GameEvent::Lost);
    }
}

impl World {
    /// Advance by one fixed step; see [`tick`]
    pub fn update(&mut self, store: &mut impl ProgressStore, dt: f32) {
        tick(self, store, dt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::SIM_DT;
    use crate::sim::packet::SIMPLE_SPEED;
    use crate::sim::state::Outcome;
    use crate::sim::system::{PortRef, Shape, System};
    use crate::tuning::Tuning;
    use glam::Vec2;
    use proptest::prelude::*;

    /// Progress store that records what the simulation asked of it
    #[derive(Default)]
    struct Recorder {
        coins: u32,
        commits: Vec<(String, u32)>,
    }

    impl ProgressStore for Recorder {
        fn is_level_passed(&self, level: &str) -> bool {
            self.commits.iter().any(|(l, _)| l == level)
        }

        fn level_coins(&self, level: &str) -> u32 {
            self.commits
                .iter()
                .filter(|(l, _)| l == level)
                .map(|(_, c)| *c)
                .max()
                .unwrap_or(0)
        }

        fn total_coins(&self) -> u32 {
            self.coins
        }

        fn try_spend(&mut self, price: u32) -> bool {
            if self.coins < price {
                return false;
            }
            self.coins -= price;
            true
        }

        fn commit_win(&mut self, level: &str, coins: u32) {
            self.commits.push((level.to_string(), coins));
        }
    }

    fn system(id: u32, kind: SystemKind, at: (f32, f32), inputs: &[Shape], outputs: &[Shape]) -> System {
        System::new(SystemId(id), kind, Vec2::new(at.0, at.1), inputs, outputs)
    }

    fn wire(world: &mut World, from: (u32, usize), to: (u32, usize)) -> LineId {
        world
            .add_line(
                PortRef::output(SystemId(from.0), from.1),
                PortRef::input(SystemId(to.0), to.1),
            )
            .unwrap()
    }

    fn run_until(world: &mut World, store: &mut Recorder, max_ticks: u32, done: impl Fn(&World) -> bool) {
        for _ in 0..max_ticks {
            if done(world) {
                return;
            }
            tick(world, store, SIM_DT);
        }
    }

    /// Put a queued packet on a wire without going through `send`
    fn place_on(world: &mut World, packet: PacketId, line: LineId) {
        let mut p = world.take_packet(packet).unwrap();
        p.begin_traversal(line, world.lines[&line].path.points(PATH_SMOOTHNESS));
        world.packets.insert(packet, p);
        world.lines.get_mut(&line).unwrap().moving = Some(packet);
    }

    /// Source -> relay with the given outputs, each wired to its own terminal
    fn relay_world(outputs: &[Shape]) -> (World, Vec<LineId>) {
        let mut world = World::new("relay", 3, Tuning::default());
        world
            .add_system(system(1, SystemKind::Terminal, (0.0, 100.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(2, SystemKind::Relay, (200.0, 100.0), &[Shape::Square], outputs))
            .unwrap();
        wire(&mut world, (1, 0), (2, 0));
        let mut out_lines = Vec::new();
        for (i, &shape) in outputs.iter().enumerate() {
            let id = 10 + i as u32;
            let y = if i == 0 { 0.0 } else { 200.0 };
            world
                .add_system(system(id, SystemKind::Terminal, (400.0, y), &[shape], &[]))
                .unwrap();
            out_lines.push(wire(&mut world, (2, i), (id, 0)));
        }
        (world, out_lines)
    }

    #[test]
    fn test_relay_prefers_compatible_port() {
        let (mut world, out_lines) = relay_world(&[Shape::Triangle, Shape::Square]);
        let id = world.next_packet_id();
        world.spawn_packet(SystemId(2), Packet::simple(id)).unwrap();
        let mut store = Recorder::default();

        // Not launched: nothing moves
        tick(&mut world, &mut store, SIM_DT);
        assert!(world.is_ready());
        assert_eq!(world.packets[&id].system(), Some(SystemId(2)));

        world.launch();
        tick(&mut world, &mut store, SIM_DT);
        let packet = &world.packets[&id];
        assert_eq!(packet.line(), Some(out_lines[1]));
        assert_eq!(packet.speed, SIMPLE_SPEED);
        assert!(world.is_consistent());
    }

    #[test]
    fn test_relay_falls_back_to_incompatible_port() {
        let (mut world, out_lines) = relay_world(&[Shape::Triangle]);
        let id = world.next_packet_id();
        world.spawn_packet(SystemId(2), Packet::simple(id)).unwrap();
        let mut store = Recorder::default();

        world.launch();
        tick(&mut world, &mut store, SIM_DT);
        assert_eq!(world.packets[&id].line(), Some(out_lines[0]));
        assert_eq!(world.packets[&id].speed, SIMPLE_SPEED / 2.0);

        // Halved for good, all the way to delivery
        run_until(&mut world, &mut store, 2000, |w| {
            w.packets.get(&id).is_none_or(|p| p.speed != SIMPLE_SPEED / 2.0)
        });
        assert!(!world.packets.contains_key(&id));
        assert_eq!(world.delivered, 1);
        assert_eq!(world.coins, 2);
    }

    #[test]
    fn test_readiness_follows_wire_geometry() {
        let (mut world, out_lines) = relay_world(&[Shape::Square]);
        let line = out_lines[0];
        let start = world.lines[&line].path.start();
        let end = world.lines[&line].path.end();
        let axis = (end - start).normalize();
        let normal = axis.perp();

        // Obstacle well clear of the straight wire, beside its middle
        let obstacle = start + axis * 60.0 + normal * 150.0;
        world
            .add_system(system(
                20,
                SystemKind::Relay,
                (obstacle.x - 45.0, obstacle.y - 35.0),
                &[],
                &[],
            ))
            .unwrap();
        let mut store = Recorder::default();
        tick(&mut world, &mut store, SIM_DT);
        assert!(world.is_ready());

        // Bend whose curve apex lands on the obstacle centre
        let foot_a = start + axis * 20.0;
        let foot_b = start + axis * 100.0;
        let middle = start + axis * 60.0 + normal * 300.0;
        world.add_bend(line, foot_a, middle, foot_b).unwrap();
        tick(&mut world, &mut store, SIM_DT);
        assert!(!world.is_ready());

        world.remove_bend(line, 0).unwrap();
        tick(&mut world, &mut store, SIM_DT);
        assert!(world.is_ready());
    }

    /// Entry -> exit terminals with `count` simple packets at the entry
    fn delivery_world(count: u32) -> (World, LineId) {
        let mut world = World::new("delivery", 5, Tuning::default());
        world
            .add_system(system(1, SystemKind::Terminal, (0.0, 100.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(2, SystemKind::Terminal, (200.0, 100.0), &[Shape::Square], &[]))
            .unwrap();
        let line = wire(&mut world, (1, 0), (2, 0));
        for _ in 0..count {
            let id = world.next_packet_id();
            world.spawn_packet(SystemId(1), Packet::simple(id)).unwrap();
        }
        (world, line)
    }

    #[test]
    fn test_win_committed_exactly_once() {
        let (mut world, _) = delivery_world(4);
        let mut store = Recorder::default();
        world.launch();
        run_until(&mut world, &mut store, 5000, |w| w.packets.is_empty());
        for _ in 0..10 {
            tick(&mut world, &mut store, SIM_DT);
        }

        assert_eq!(world.delivered, 4);
        assert!(world.level_passed);
        assert_eq!(world.outcome(), Some(Outcome::Won));
        assert_eq!(store.commits, vec![("delivery".to_string(), 8)]);
        let events = world.drain_events();
        assert_eq!(
            events.iter().filter(|e| matches!(e, GameEvent::Won { coins: 8 })).count(),
            1
        );
    }

    #[test]
    fn test_loss_reported_without_persistence() {
        let (mut world, _) = delivery_world(4);
        let mut store = Recorder::default();
        world.launch();
        run_until(&mut world, &mut store, 5000, |w| w.delivered == 1);
        assert_eq!(world.delivered, 1);

        // Entry goes down with its queue and the packet on its wire
        world.destroy_system(SystemId(1));
        assert!(world.packets.is_empty());
        tick(&mut world, &mut store, SIM_DT);
        tick(&mut world, &mut store, SIM_DT);

        assert!(!world.level_passed);
        assert_eq!(world.outcome(), Some(Outcome::Lost));
        assert!(store.commits.is_empty());
        assert_eq!(
            world.drain_events().iter().filter(|e| **e == GameEvent::Lost).count(),
            1
        );
    }

    #[test]
    fn test_fragments_merge_and_deliver() {
        let (mut world, fragments) = merger_world(3);
        assert_eq!(fragments, [PacketId(2), PacketId(3), PacketId(4)]);
        assert_eq!(world.spawned, 3);

        let mut store = Recorder::default();
        world.launch();
        run_until(&mut world, &mut store, 6000, |w| w.packets.is_empty());

        let events = world.drain_events();
        assert!(events.contains(&GameEvent::Merged {
            packet: PacketId(5),
            size: 3
        }));
        assert_eq!(world.delivered, 3);
        assert_eq!(world.coins, 3);
        assert_eq!(store.commits, vec![("merge".to_string(), 3)]);
    }

    #[test]
    fn test_merge_rebuilds_size_and_color() {
        let mut world = World::new("merge", 9, Tuning::default());
        world
            .add_system(system(
                1,
                SystemKind::Merger {
                    buckets: Default::default(),
                },
                (0.0, 0.0),
                &[],
                &[],
            ))
            .unwrap();
        world
            .add_system(system(2, SystemKind::Relay, (0.0, 300.0), &[], &[]))
            .unwrap();
        let parent = Packet::aggregate(world.next_packet_id(), 4, 11, AggregateMotion::Decorated);
        let fragments = world.spawn_packet(SystemId(2), parent).unwrap();

        for (i, id) in fragments.into_iter().enumerate() {
            let fragment = world.take_packet(id).unwrap();
            receive(&mut world, SystemId(1), fragment);
            let held = world.systems[&SystemId(1)].bucketed().len();
            assert_eq!(held, if i < 3 { i + 1 } else { 0 });
        }
        let queued = world.queued(SystemId(1));
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].size, 4);
        assert!(matches!(
            queued[0].kind,
            PacketKind::Aggregate {
                color: 11,
                motion: AggregateMotion::Decorated
            }
        ));
        assert_eq!(world.packets.len(), 1);
        assert!(world.systems[&SystemId(1)].bucketed().is_empty());
        assert!(world.is_consistent());
    }

    #[test]
    fn test_corruptor_shrinks_and_compromises() {
        let tuning = Tuning {
            corrupt_probability: 1.0,
            ..Tuning::default()
        };
        let mut world = World::new("corrupt", 1, tuning);
        world
            .add_system(system(1, SystemKind::Corruptor, (0.0, 0.0), &[], &[]))
            .unwrap();

        let simple = Packet::simple(world.next_packet_id());
        let id = simple.id;
        receive(&mut world, SystemId(1), simple);
        assert_eq!(world.packets[&id].size, 1);
        assert!(world.packets[&id].compromised);

        let reversible = Packet::reversible(world.next_packet_id());
        let gone = reversible.id;
        receive(&mut world, SystemId(1), reversible);
        assert!(!world.packets.contains_key(&gone));
        assert_eq!(world.drain_events(), vec![GameEvent::PacketLost { packet: gone }]);
        assert!(world.is_consistent());
    }

    #[test]
    fn test_encryptor_wraps_then_seals() {
        let mut world = World::new("crypt", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Encryptor, (0.0, 0.0), &[], &[]))
            .unwrap();

        let simple = Packet::simple(world.next_packet_id());
        receive(&mut world, SystemId(1), simple);
        let wrapped_id = world.systems[&SystemId(1)].queue[0];
        let wrapped = world.take_packet(wrapped_id).unwrap();
        assert!(matches!(wrapped.kind, PacketKind::Wrapped { .. }));
        assert_eq!(wrapped.wrapper(), Some(SystemId(1)));

        receive(&mut world, SystemId(1), wrapped);
        let secret_id = world.systems[&SystemId(1)].queue[0];
        let secret = world.take_packet(secret_id).unwrap();
        assert!(matches!(secret.kind, PacketKind::Secret { .. }));

        // Nothing left to add
        receive(&mut world, SystemId(1), secret);
        assert_eq!(world.systems[&SystemId(1)].queue[0], secret_id);
    }

    #[test]
    fn test_giant_arrivals_flush_then_destroy() {
        let mut world = World::new("giant", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Relay, (0.0, 0.0), &[], &[]))
            .unwrap();
        for _ in 0..2 {
            let id = world.next_packet_id();
            world.spawn_packet(SystemId(1), Packet::simple(id)).unwrap();
        }

        let giant = Packet::aggregate(world.next_packet_id(), 8, 0, AggregateMotion::Steady);
        let giant_id = giant.id;
        receive(&mut world, SystemId(1), giant);
        assert_eq!(world.systems[&SystemId(1)].queue, [giant_id]);
        assert_eq!(world.systems[&SystemId(1)].giant_arrivals, 1);
        assert_eq!(world.packets.len(), 1);

        for _ in 0..2 {
            let g = Packet::aggregate(world.next_packet_id(), 8, 0, AggregateMotion::Steady);
            receive(&mut world, SystemId(1), g);
        }
        assert!(!world.systems.contains_key(&SystemId(1)));
        assert!(world.packets.is_empty());
        assert!(
            world
                .drain_events()
                .contains(&GameEvent::SystemDestroyed { system: SystemId(1) })
        );
    }

    #[test]
    fn test_reversible_returns_to_origin() {
        let mut world = World::new("reverse", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Relay, (0.0, 100.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(2, SystemKind::Terminal, (200.0, 100.0), &[Shape::Square], &[]))
            .unwrap();
        let line = wire(&mut world, (1, 0), (2, 0));
        let id = world.next_packet_id();
        let mut packet = Packet::reversible(id);
        packet.wrong_port();
        world.spawn_packet(SystemId(1), packet).unwrap();
        place_on(&mut world, id, line);

        let mut store = Recorder::default();
        run_until(&mut world, &mut store, 5000, |w| w.packets[&id].system().is_some());
        assert_eq!(world.packets[&id].system(), Some(SystemId(1)));
        assert!(world.lines[&line].moving.is_none());
        assert_eq!(world.delivered, 0);
        assert!(world.is_consistent());
    }

    #[test]
    fn test_zero_accel_mark_suppresses_passing_packet() {
        let (mut world, line) = delivery_world(0);
        let mut store = Recorder {
            coins: 50,
            ..Default::default()
        };
        let mark = world.lines[&line].path.start() + Vec2::new(40.0, 0.0);
        assert_eq!(world.place_zero_accel(&mut store, line, mark), Ok(true));
        assert_eq!(store.coins, 30);

        let id = world.next_packet_id();
        world.spawn_packet(SystemId(1), Packet::accelerating(id)).unwrap();
        place_on(&mut world, id, line);

        run_until(&mut world, &mut store, 600, |w| w.packets[&id].is_suppressed());
        let packet = &world.packets[&id];
        assert!(packet.is_suppressed());
        assert_eq!(packet.acceleration(), 0.0);
        let speed = packet.speed;
        tick(&mut world, &mut store, SIM_DT);
        assert_eq!(world.packets[&id].speed, speed);
    }

    /// Terminal -> merger -> terminal carrying one aggregate of `size`
    fn merger_world(size: u32) -> (World, Vec<PacketId>) {
        let mut world = World::new("merge", 9, Tuning::default());
        world
            .add_system(system(1, SystemKind::Terminal, (0.0, 100.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(
                2,
                SystemKind::Merger {
                    buckets: Default::default(),
                },
                (200.0, 100.0),
                &[Shape::Square],
                &[Shape::Triangle],
            ))
            .unwrap();
        world
            .add_system(system(3, SystemKind::Terminal, (400.0, 100.0), &[Shape::Triangle], &[]))
            .unwrap();
        wire(&mut world, (1, 0), (2, 0));
        wire(&mut world, (2, 0), (3, 0));
        let parent = world.next_packet_id();
        let fragments = world
            .spawn_packet(SystemId(1), Packet::aggregate(parent, size, 5, AggregateMotion::Steady))
            .unwrap();
        (world, fragments)
    }

    #[test]
    fn test_merger_rebuilds_from_surviving_fragments() {
        let (mut world, fragments) = merger_world(3);
        world.destroy_packet(fragments[1]);
        let mut store = Recorder::default();
        world.launch();
        run_until(&mut world, &mut store, 6000, |w| w.outcome().is_some());

        assert!(world.packets.is_empty());
        assert!(
            world
                .drain_events()
                .iter()
                .any(|e| matches!(e, GameEvent::Merged { size: 2, .. }))
        );
        assert_eq!(world.delivered, 2);
        assert_eq!(world.outcome(), Some(Outcome::Won));
        assert_eq!(store.commits, vec![("merge".to_string(), 2)]);
    }

    #[test]
    fn test_losing_last_outside_fragment_releases_bucket() {
        let (mut world, fragments) = merger_world(3);
        for &id in &fragments[..2] {
            let fragment = world.take_packet(id).unwrap();
            receive(&mut world, SystemId(2), fragment);
        }
        assert_eq!(world.systems[&SystemId(2)].bucketed().len(), 2);
        assert!(world.systems[&SystemId(2)].queue.is_empty());

        world.destroy_packet(fragments[2]);
        let mut store = Recorder::default();
        tick(&mut world, &mut store, SIM_DT);

        let queued = world.queued(SystemId(2));
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_aggregate());
        assert_eq!(queued[0].size, 2);
        assert!(world.systems[&SystemId(2)].bucketed().is_empty());
        assert!(world.is_consistent());
    }

    #[test]
    fn test_spy_swallows_secrets_but_pays() {
        let mut world = World::new("spy", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Spy, (0.0, 0.0), &[], &[]))
            .unwrap();

        let inner = Packet::simple(world.next_packet_id());
        let wrapped = Packet::wrap(world.next_packet_id(), inner, SystemId(9), &mut world.rng.clone());
        let secret = Packet::seal(world.next_packet_id(), wrapped, SystemId(9));
        let secret_id = secret.id;
        receive(&mut world, SystemId(1), secret);
        assert!(world.packets.is_empty());
        assert_eq!(world.coins, 4);
        assert_eq!(world.delivered, 0);
        assert_eq!(world.drain_events(), vec![GameEvent::PacketLost { packet: secret_id }]);

        let simple = Packet::simple(world.next_packet_id());
        let simple_id = simple.id;
        receive(&mut world, SystemId(1), simple);
        assert_eq!(world.systems[&SystemId(1)].queue, [simple_id]);
    }

    #[test]
    fn test_spy_hands_typed_packets_to_peer() {
        let mut world = World::new("spy", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Spy, (0.0, 300.0), &[], &[]))
            .unwrap();
        world
            .add_system(system(2, SystemKind::Spy, (200.0, 100.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(3, SystemKind::Terminal, (400.0, 100.0), &[Shape::Square], &[]))
            .unwrap();
        let line = wire(&mut world, (2, 0), (3, 0));

        let simple = world.next_packet_id();
        world.spawn_packet(SystemId(1), Packet::simple(simple)).unwrap();
        let inner = Packet::accelerating(world.next_packet_id());
        let wrapped = Packet::wrap(world.next_packet_id(), inner, SystemId(9), &mut world.rng.clone());
        let wrapped_id = wrapped.id;
        world.spawn_packet(SystemId(1), wrapped).unwrap();

        let mut store = Recorder::default();
        world.launch();
        tick(&mut world, &mut store, SIM_DT);
        assert!(world.is_ready());
        // Handed over and sent out of the peer in the same tick
        assert_eq!(world.packets[&simple].line(), Some(line));

        // Envelopes go out the spy's own ports, and this one has none
        for _ in 0..5 {
            tick(&mut world, &mut store, SIM_DT);
        }
        assert_eq!(world.systems[&SystemId(1)].queue, [wrapped_id]);
        assert!(world.is_consistent());
    }

    #[test]
    fn test_recenter_mark_drops_decoration_drift() {
        let (mut world, line) = delivery_world(0);
        let mut store = Recorder {
            coins: 50,
            ..Default::default()
        };
        let start = world.lines[&line].path.start();
        let mark = start + Vec2::new(90.0, 0.0);
        assert_eq!(world.place_recenter(&mut store, line, mark), Ok(true));
        assert_eq!(store.coins, 40);

        // Whole aggregates only travel once rebuilt, so skip the spawn split
        let id = world.next_packet_id();
        world.queue_packet(SystemId(1), Packet::aggregate(id, 2, 0, AggregateMotion::Decorated));
        place_on(&mut world, id, line);

        // Walk up to the tick where the trigger fires
        let radius = world.tuning.effect_radius;
        let mut drift = Vec2::ZERO;
        for _ in 0..600 {
            let p = &world.packets[&id];
            if p.collision_center().distance(mark) <= radius {
                break;
            }
            drift = p.screen_point() - p.collision_center();
            tick(&mut world, &mut store, SIM_DT);
        }
        // Past the first rise step, so the drawn point sits off the wire
        assert!(drift.length() > 0.9);

        tick(&mut world, &mut store, SIM_DT);
        let p = &world.packets[&id];
        assert!((p.screen_point() - p.collision_center()).length() < 0.5);
        assert_eq!(p.line(), Some(line));
    }

    /// Two simple packets on separate wires with footprints 4px apart
    fn colliding_pair() -> (World, PacketId, PacketId) {
        let (mut world, line) = delivery_world(0);
        world
            .add_system(system(5, SystemKind::Terminal, (0.0, 300.0), &[], &[Shape::Square]))
            .unwrap();
        world
            .add_system(system(6, SystemKind::Terminal, (200.0, 300.0), &[Shape::Square], &[]))
            .unwrap();
        let other = wire(&mut world, (5, 0), (6, 0));

        let a = Packet::simple(world.next_packet_id());
        let b = Packet::simple(world.next_packet_id());
        let (ida, idb) = (a.id, b.id);
        world.spawn_packet(SystemId(1), a).unwrap();
        world.spawn_packet(SystemId(5), b).unwrap();
        for (id, line, x) in [(ida, line, 100.0), (idb, other, 104.0)] {
            let mut p = world.take_packet(id).unwrap();
            p.begin_traversal(line, vec![Vec2::new(x, 100.0), Vec2::new(x + 100.0, 100.0)]);
            world.packets.insert(id, p);
            world.lines.get_mut(&line).unwrap().moving = Some(id);
        }
        (world, ida, idb)
    }

    #[test]
    fn test_collision_noise_destroys_both() {
        let (mut world, ida, idb) = colliding_pair();

        resolve_collisions(&mut world, SIM_DT);
        assert_eq!(world.packets[&ida].noise, 1);
        assert_eq!(world.packets[&idb].noise, 1);
        assert!(world.packets[&ida].collision_center().x < 100.0);
        assert!(world.packets[&idb].collision_center().x > 104.0);

        resolve_collisions(&mut world, SIM_DT);
        assert!(world.packets.is_empty());
        assert!(world.lines.values().all(|l| l.moving.is_none()));
        assert!(world.is_consistent());
    }

    #[test]
    fn test_collision_separation_uses_tick_length() {
        let (mut still, ida, _) = colliding_pair();
        resolve_collisions(&mut still, 0.0);
        assert_eq!(still.packets[&ida].noise, 1);
        assert_eq!(still.packets[&ida].collision_center(), Vec2::new(100.0, 100.0));

        let (mut short, ida, _) = colliding_pair();
        resolve_collisions(&mut short, SIM_DT);
        let (mut long, idb_long, _) = colliding_pair();
        resolve_collisions(&mut long, 4.0 * SIM_DT);
        let pushed = |w: &World, id: PacketId| 100.0 - w.packets[&id].collision_center().x;
        assert!(pushed(&long, idb_long) > pushed(&short, ida) * 3.0);
    }

    #[test]
    fn test_cloak_clears_one_packet_per_cooldown() {
        let mut world = World::new("cloak", 1, Tuning::default());
        world
            .add_system(system(1, SystemKind::Cloak { cooldown: 0.0 }, (0.0, 0.0), &[], &[]))
            .unwrap();
        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut p = Packet::simple(world.next_packet_id());
            p.compromised = true;
            ids.push(p.id);
            world.spawn_packet(SystemId(1), p).unwrap();
        }

        cloak_sweep(&mut world, SIM_DT);
        assert!(!world.packets[&ids[0]].compromised);
        assert!(world.packets[&ids[1]].compromised);

        cloak_sweep(&mut world, 1.0);
        assert!(world.packets[&ids[1]].compromised);
        cloak_sweep(&mut world, 1.0);
        assert!(!world.packets[&ids[1]].compromised);
    }

    #[test]
    fn test_determinism() {
        let build = || {
            let mut world = World::new("det", 42, Tuning::default());
            world
                .add_system(system(1, SystemKind::Terminal, (0.0, 100.0), &[], &[Shape::Square]))
                .unwrap();
            world
                .add_system(system(2, SystemKind::Encryptor, (200.0, 100.0), &[Shape::Square], &[Shape::Square]))
                .unwrap();
            world
                .add_system(system(3, SystemKind::Terminal, (400.0, 100.0), &[Shape::Square], &[]))
                .unwrap();
            wire(&mut world, (1, 0), (2, 0));
            wire(&mut world, (2, 0), (3, 0));
            for _ in 0..3 {
                let id = world.next_packet_id();
                world.spawn_packet(SystemId(1), Packet::accelerating(id)).unwrap();
            }
            world.launch();
            world
        };
        let (mut w1, mut w2) = (build(), build());
        let (mut s1, mut s2) = (Recorder::default(), Recorder::default());
        for _ in 0..900 {
            tick(&mut w1, &mut s1, SIM_DT);
            tick(&mut w2, &mut s2, SIM_DT);
        }
        assert_eq!(w1.delivered, w2.delivered);
        assert_eq!(w1.coins, w2.coins);
        let speeds = |w: &World| w.packets.values().map(|p| (p.id, p.speed)).collect::<Vec<_>>();
        assert_eq!(speeds(&w1), speeds(&w2));
    }

    proptest! {
        #[test]
        fn prop_packets_stay_located(
            ticks in 1u32..400,
            cut in proptest::option::of(0usize..2),
            destroy in proptest::option::of(1u32..4),
        ) {
            let mut world = World::new("prop", 7, Tuning::default());
            world.add_system(system(1, SystemKind::Terminal, (0.0, 100.0), &[], &[Shape::Square])).unwrap();
            world.add_system(system(2, SystemKind::Corruptor, (200.0, 100.0), &[Shape::Square], &[Shape::Square])).unwrap();
            world.add_system(system(3, SystemKind::Terminal, (400.0, 100.0), &[Shape::Square], &[])).unwrap();
            let lines = [wire(&mut world, (1, 0), (2, 0)), wire(&mut world, (2, 0), (3, 0))];
            for _ in 0..4 {
                let id = world.next_packet_id();
                world.spawn_packet(SystemId(1), Packet::simple(id)).unwrap();
            }
            world.launch();
            let mut store = Recorder::default();

            for t in 0..ticks {
                tick(&mut world, &mut store, SIM_DT);
                if t == ticks / 2 {
                    if let Some(i) = cut {
                        let _ = world.remove_line(lines[i]);
                    }
                    if let Some(s) = destroy {
                        world.destroy_system(SystemId(s));
                    }
                }
                prop_assert!(world.is_consistent());
            }
        }
    }
}

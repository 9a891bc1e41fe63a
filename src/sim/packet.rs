//! Packets and their per-kind movement rules
//!
//! Every packet is either parked in a system queue or travelling along a wire,
//! never both; `Location` makes that exclusive by construction. Kind-specific
//! behaviour (speed rule, wrong-port reaction, decoration, coin value) is one
//! `match` per behaviour over `PacketKind`.

use glam::Vec2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::state::LineId;
use super::system::{Shape, SystemId};
use crate::consts::{IMPACT_DRAG, IMPACT_KICK, PACKET_RADIUS};

/// Simple packet cruise speed (px/s)
pub const SIMPLE_SPEED: f32 = 36.0;
pub const SIMPLE_SIZE: u32 = 2;

/// Accelerating packet: starting speed, default acceleration and speed cap
pub const ACCELERATING_SPEED: f32 = 30.0;
pub const ACCELERATING_ACCEL: f32 = 18.0;
pub const ACCELERATING_MAX: f32 = 84.0;
pub const ACCELERATING_SIZE: u32 = 3;

/// Reversible packet (and fragments, which share its integrator)
pub const REVERSIBLE_SPEED: f32 = 36.0;
pub const REVERSIBLE_ACCEL: f32 = 6.0;
pub const REVERSIBLE_MAX: f32 = 60.0;
pub const REVERSIBLE_SIZE: u32 = 1;

/// Aggregates travel whole only after a merge
pub const AGGREGATE_SPEED: f32 = 24.0;
pub const AGGREGATE_MAX: f32 = 60.0;
/// Extra acceleration while the path ahead turns
pub const BEND_BOOST: f32 = 14.4;
/// cos(10°): sharper turns than this count as a bend
pub const BEND_COS: f32 = 0.984_807_8;

/// Decorated aggregate speed, wiggle and staircase
pub const DECORATED_SPEED: f32 = 36.0;
pub const WIGGLE_AMPLITUDE: f32 = 3.0;
pub const WIGGLE_FREQUENCY: f32 = 6.0;
pub const RISE_INTERVAL: f32 = 50.0;
pub const RISE_STEP: f32 = 4.0;

/// Wrapped packet (speed, acceleration) presets, one picked at wrap time
pub const WRAP_PRESETS: [(f32, f32); 3] = [(48.0, 0.0), (30.0, 0.0), (12.0, 3.6)];
pub const WRAPPED_MAX: f32 = 60.0;

/// Secret packets crawl at a fixed speed
pub const SECRET_SPEED: f32 = 12.0;
pub const SECRET_SIZE: u32 = 6;

/// Packet identifier, allocated monotonically by the world and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PacketId(pub u32);

/// How a whole aggregate moves once it travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMotion {
    /// Constant speed
    #[default]
    Steady,
    /// Boosted while the path ahead turns more than ~10°
    BendBoosted,
    /// Wiggles sideways and steps upward as it travels (visual only)
    Decorated,
}

/// Packet kinds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PacketKind {
    Simple,
    Accelerating,
    Reversible,
    /// Multi-unit packet; split into fragments when spawned
    Aggregate { color: u32, motion: AggregateMotion },
    /// Unit piece of an aggregate, re-mergeable by parent id
    Fragment {
        parent: PacketId,
        index: u32,
        color: u32,
        parent_size: u32,
        motion: AggregateMotion,
    },
    /// Envelope produced by an encryptor around a messenger packet
    Wrapped { inner: Box<Packet>, wrapper: SystemId },
    /// Envelope around a wrapped packet
    Secret { inner: Box<Packet>, wrapper: SystemId },
}

/// Which end of a wire a travelling packet reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Reached the input port (destination system)
    Forward,
    /// Walked back past the start (origin system)
    Backward,
}

/// Arc-length cursor over a path captured when the traversal began
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traversal {
    pub line: LineId,
    points: Vec<Vec2>,
    /// Cumulative arc length at each point
    stations: Vec<f32>,
    cursor: f32,
}

impl Traversal {
    pub fn new(line: LineId, points: Vec<Vec2>) -> Self {
        let mut stations = Vec::with_capacity(points.len());
        let mut run = 0.0;
        stations.push(0.0);
        for seg in points.windows(2) {
            run += seg[0].distance(seg[1]);
            stations.push(run);
        }
        Self {
            line,
            points,
            stations,
            cursor: 0.0,
        }
    }

    pub fn length(&self) -> f32 {
        self.stations.last().copied().unwrap_or(0.0)
    }

    /// Arc length travelled from the start
    pub fn cursor(&self) -> f32 {
        self.cursor
    }

    /// Fraction of the wire covered, 0..=1
    pub fn progress(&self) -> f32 {
        let len = self.length();
        if len <= 0.0 {
            return 1.0;
        }
        (self.cursor / len).clamp(0.0, 1.0)
    }

    /// Move the cursor by a signed distance; reports arrival at either end
    pub fn walk(&mut self, distance: f32) -> Option<Arrival> {
        self.cursor += distance;
        let len = self.length();
        if self.cursor >= len {
            self.cursor = len;
            Some(Arrival::Forward)
        } else if self.cursor < 0.0 {
            self.cursor = 0.0;
            Some(Arrival::Backward)
        } else {
            None
        }
    }

    fn segment(&self) -> usize {
        let last_seg = self.points.len().saturating_sub(2);
        self.stations
            .partition_point(|&s| s <= self.cursor)
            .saturating_sub(1)
            .min(last_seg)
    }

    /// Point on the path at the cursor
    pub fn point(&self) -> Vec2 {
        if self.points.len() < 2 {
            return self.points.first().copied().unwrap_or(Vec2::ZERO);
        }
        let i = self.segment();
        let seg_len = self.stations[i + 1] - self.stations[i];
        let t = if seg_len > 0.0 {
            ((self.cursor - self.stations[i]) / seg_len).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.points[i].lerp(self.points[i + 1], t)
    }

    /// Unit direction of the current segment
    pub fn tangent(&self) -> Vec2 {
        if self.points.len() < 2 {
            return Vec2::ZERO;
        }
        let i = self.segment();
        (self.points[i + 1] - self.points[i]).normalize_or_zero()
    }

    /// Cosine of the turn at the end of the current segment, if there is one
    pub fn turn_ahead_cos(&self) -> Option<f32> {
        let i = self.segment();
        if i + 2 >= self.points.len() {
            return None;
        }
        let u = self.points[i + 1] - self.points[i];
        let v = self.points[i + 2] - self.points[i + 1];
        if u.length_squared() < 1e-6 || v.length_squared() < 1e-6 {
            return None;
        }
        Some(u.normalize().dot(v.normalize()))
    }
}

/// Where a packet is
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Location {
    Queued(SystemId),
    Travelling(Traversal),
}

/// Transient lateral kick from collisions
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Impact {
    pub vel: Vec2,
    pub offset: Vec2,
}

/// Visual-only drift of decorated aggregates
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Decoration {
    phase: f32,
    travelled: f32,
    next_rise: f32,
    rise: f32,
    sway: Vec2,
}

impl Decoration {
    fn new() -> Self {
        Self {
            phase: 0.0,
            travelled: 0.0,
            next_rise: RISE_INTERVAL,
            rise: 0.0,
            sway: Vec2::ZERO,
        }
    }

    fn step(&mut self, distance: f32, dt: f32, tangent: Vec2) {
        self.travelled += distance;
        while self.travelled >= self.next_rise {
            // Up is negative screen y
            self.rise -= RISE_STEP;
            self.next_rise += RISE_INTERVAL;
        }
        self.phase += WIGGLE_FREQUENCY * dt;
        let normal = Vec2::new(-tangent.y, tangent.x);
        self.sway = normal * WIGGLE_AMPLITUDE * self.phase.sin();
    }

    fn offset(&self) -> Vec2 {
        self.sway + Vec2::new(0.0, self.rise)
    }
}

/// Timed zero-acceleration window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Suppression {
    until: f64,
    /// Latest acceleration requested while suppressed
    resume: f32,
}

/// Speed integration rule, resolved from the kind each tick
#[derive(Debug, Clone, Copy)]
enum SpeedRule {
    Constant,
    Capped(f32),
    Bidirectional(f32),
    BendBoosted,
}

/// A packet entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: PacketId,
    pub kind: PacketKind,
    /// Noise capacity; shrinkable by corruptors
    pub size: u32,
    pub noise: u32,
    /// Signed speed along the wire (px/s)
    pub speed: f32,
    acceleration: f32,
    pub compromised: bool,
    pub location: Location,
    /// On-wire point before impact offset and decoration
    base: Vec2,
    pub impact: Impact,
    decoration: Decoration,
    suppression: Option<Suppression>,
}

impl Packet {
    fn with_motion(id: PacketId, kind: PacketKind, size: u32, speed: f32, acceleration: f32) -> Self {
        Self {
            id,
            kind,
            size,
            noise: 0,
            speed,
            acceleration,
            compromised: false,
            location: Location::Queued(SystemId(0)),
            base: Vec2::ZERO,
            impact: Impact::default(),
            decoration: Decoration::new(),
            suppression: None,
        }
    }

    pub fn simple(id: PacketId) -> Self {
        Self::with_motion(id, PacketKind::Simple, SIMPLE_SIZE, SIMPLE_SPEED, 0.0)
    }

    pub fn accelerating(id: PacketId) -> Self {
        Self::with_motion(
            id,
            PacketKind::Accelerating,
            ACCELERATING_SIZE,
            ACCELERATING_SPEED,
            ACCELERATING_ACCEL,
        )
    }

    pub fn reversible(id: PacketId) -> Self {
        Self::with_motion(
            id,
            PacketKind::Reversible,
            REVERSIBLE_SIZE,
            REVERSIBLE_SPEED,
            REVERSIBLE_ACCEL,
        )
    }

    pub fn aggregate(id: PacketId, size: u32, color: u32, motion: AggregateMotion) -> Self {
        let speed = match motion {
            AggregateMotion::Decorated => DECORATED_SPEED,
            AggregateMotion::Steady | AggregateMotion::BendBoosted => AGGREGATE_SPEED,
        };
        Self::with_motion(
            id,
            PacketKind::Aggregate { color, motion },
            size.max(1),
            speed,
            0.0,
        )
    }

    /// Unit fragment `index` of the aggregate `parent`
    pub fn fragment(id: PacketId, parent: &Packet, index: u32) -> Self {
        let (color, motion) = match parent.kind {
            PacketKind::Aggregate { color, motion } => (color, motion),
            _ => (0, AggregateMotion::Steady),
        };
        Self::with_motion(
            id,
            PacketKind::Fragment {
                parent: parent.id,
                index,
                color,
                parent_size: parent.size,
                motion,
            },
            1,
            REVERSIBLE_SPEED,
            REVERSIBLE_ACCEL * 0.6,
        )
    }

    /// Unit fragments of an aggregate, ids taken from `next_id`
    pub fn split(&self, mut next_id: impl FnMut() -> PacketId) -> Vec<Packet> {
        (0..self.size)
            .map(|i| Packet::fragment(next_id(), self, i))
            .collect()
    }

    /// Wrap a messenger packet; speed preset is picked at random
    pub fn wrap(id: PacketId, inner: Packet, wrapper: SystemId, rng: &mut impl Rng) -> Self {
        let (speed, acceleration) = WRAP_PRESETS[rng.random_range(0..WRAP_PRESETS.len())];
        let size = inner.size * 2;
        let location = inner.location.clone();
        let base = inner.base;
        let mut packet = Self::with_motion(
            id,
            PacketKind::Wrapped {
                inner: Box::new(inner),
                wrapper,
            },
            size,
            speed,
            acceleration,
        );
        packet.location = location;
        packet.base = base;
        packet
    }

    /// Wrap an already wrapped packet a second time
    pub fn seal(id: PacketId, wrapped: Packet, wrapper: SystemId) -> Self {
        let location = wrapped.location.clone();
        let base = wrapped.base;
        let mut packet = Self::with_motion(
            id,
            PacketKind::Secret {
                inner: Box::new(wrapped),
                wrapper,
            },
            SECRET_SIZE,
            SECRET_SPEED,
            0.0,
        );
        packet.location = location;
        packet.base = base;
        packet
    }

    /// Peel one envelope if it was made by `system`; otherwise hand the packet back
    ///
    /// The inner packet takes over the envelope's place: location, traversal
    /// progress, screen point and impact state.
    pub fn unwrap_if_wrapped_by(self, system: SystemId) -> Result<Packet, Packet> {
        match self.kind {
            PacketKind::Wrapped { inner, wrapper } | PacketKind::Secret { inner, wrapper }
                if wrapper == system =>
            {
                let mut inner = *inner;
                inner.location = self.location;
                inner.base = self.base;
                inner.impact = self.impact;
                Ok(inner)
            }
            kind => Err(Packet { kind, ..self }),
        }
    }

    /// System whose envelope this is
    pub fn wrapper(&self) -> Option<SystemId> {
        match self.kind {
            PacketKind::Wrapped { wrapper, .. } | PacketKind::Secret { wrapper, .. } => Some(wrapper),
            _ => None,
        }
    }

    /// Packets an encryptor may wrap
    pub fn is_messenger(&self) -> bool {
        matches!(
            self.kind,
            PacketKind::Simple
                | PacketKind::Accelerating
                | PacketKind::Reversible
                | PacketKind::Fragment { .. }
        )
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, PacketKind::Aggregate { .. })
    }

    /// Aggregate this is a piece of, looking through envelopes
    pub fn fragment_of(&self) -> Option<PacketId> {
        match &self.kind {
            PacketKind::Fragment { parent, .. } => Some(*parent),
            PacketKind::Wrapped { inner, .. } | PacketKind::Secret { inner, .. } => inner.fragment_of(),
            _ => None,
        }
    }

    /// Port shape this packet matches; `None` fits every port
    pub fn shape(&self) -> Option<Shape> {
        match self.kind {
            PacketKind::Simple => Some(Shape::Square),
            PacketKind::Accelerating => Some(Shape::Triangle),
            PacketKind::Reversible => Some(Shape::Infinity),
            PacketKind::Aggregate { .. }
            | PacketKind::Fragment { .. }
            | PacketKind::Wrapped { .. }
            | PacketKind::Secret { .. } => None,
        }
    }

    pub fn is_compatible(&self, shape: Shape) -> bool {
        self.shape().is_none_or(|s| s == shape)
    }

    /// Penalty for leaving through a port of the wrong shape
    pub fn wrong_port(&mut self) {
        match self.kind {
            PacketKind::Simple => self.speed /= 2.0,
            PacketKind::Accelerating => {
                let raised = self.requested_acceleration() + ACCELERATING_ACCEL;
                self.set_acceleration(raised);
            }
            PacketKind::Reversible => {
                let flipped = -self.requested_acceleration().abs().max(REVERSIBLE_ACCEL);
                self.set_acceleration(flipped);
            }
            PacketKind::Aggregate { .. }
            | PacketKind::Fragment { .. }
            | PacketKind::Wrapped { .. }
            | PacketKind::Secret { .. } => {}
        }
    }

    /// Coins credited when delivered
    pub fn coin_value(&self) -> u32 {
        match self.kind {
            PacketKind::Simple => 2,
            PacketKind::Accelerating => 3,
            PacketKind::Reversible => 1,
            PacketKind::Secret { .. } => 4,
            PacketKind::Wrapped { .. } => 5,
            PacketKind::Aggregate { .. } => self.size,
            PacketKind::Fragment { .. } => 1,
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self.location, Location::Travelling(_))
    }

    pub fn line(&self) -> Option<LineId> {
        match &self.location {
            Location::Travelling(t) => Some(t.line),
            Location::Queued(_) => None,
        }
    }

    pub fn system(&self) -> Option<SystemId> {
        match self.location {
            Location::Queued(s) => Some(s),
            Location::Travelling(_) => None,
        }
    }

    /// Progress along the current wire (travelling only)
    pub fn progress(&self) -> Option<f32> {
        match &self.location {
            Location::Travelling(t) => Some(t.progress()),
            Location::Queued(_) => None,
        }
    }

    /// Point to draw the packet at
    pub fn screen_point(&self) -> Vec2 {
        self.base + self.impact.offset + self.decoration.offset()
    }

    /// Footprint centre for collisions and triggers (decoration excluded)
    pub fn collision_center(&self) -> Vec2 {
        self.base + self.impact.offset
    }

    pub fn collision_radius(&self) -> f32 {
        PACKET_RADIUS
    }

    /// Current effective acceleration (zero while suppressed)
    pub fn acceleration(&self) -> f32 {
        self.acceleration
    }

    /// Acceleration to restore once suppression ends
    fn requested_acceleration(&self) -> f32 {
        self.suppression
            .map(|s| s.resume)
            .unwrap_or(self.acceleration)
    }

    /// Request an acceleration; deferred while suppressed
    pub fn set_acceleration(&mut self, acceleration: f32) {
        match &mut self.suppression {
            Some(s) => s.resume = acceleration,
            None => self.acceleration = acceleration,
        }
    }

    /// Zero acceleration until `now + lifetime`; a repeat trigger extends the window
    pub fn suppress_acceleration(&mut self, now: f64, lifetime: f32) {
        let until = now + lifetime as f64;
        match &mut self.suppression {
            Some(s) => s.until = s.until.max(until),
            None => {
                self.suppression = Some(Suppression {
                    until,
                    resume: self.acceleration,
                })
            }
        }
        self.acceleration = 0.0;
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppression.is_some()
    }

    /// Restore acceleration once the suppression window has passed
    pub fn expire_suppression(&mut self, now: f64) {
        if let Some(s) = self.suppression
            && now >= s.until
        {
            self.acceleration = s.resume;
            self.suppression = None;
        }
    }

    /// Put the packet on a wire; `points` is the path to walk, cached for this trip
    pub fn begin_traversal(&mut self, line: LineId, points: Vec<Vec2>) {
        let trav = Traversal::new(line, points);
        self.base = trav.point();
        self.location = Location::Travelling(trav);
        self.decoration = Decoration::new();
        // Direction is relative to the wire, so a reversed packet starts forward again
        if matches!(
            self.kind,
            PacketKind::Reversible | PacketKind::Fragment { .. }
        ) {
            self.speed = self.speed.abs();
        }
    }

    /// Park in a system queue, drawn at `at`
    pub fn park(&mut self, system: SystemId, at: Vec2) {
        self.location = Location::Queued(system);
        self.base = at;
        self.impact = Impact::default();
    }

    fn speed_rule(&self) -> SpeedRule {
        match self.kind {
            PacketKind::Simple | PacketKind::Secret { .. } => SpeedRule::Constant,
            PacketKind::Accelerating => SpeedRule::Capped(ACCELERATING_MAX),
            PacketKind::Reversible | PacketKind::Fragment { .. } => {
                SpeedRule::Bidirectional(REVERSIBLE_MAX)
            }
            PacketKind::Aggregate { motion, .. } => match motion {
                AggregateMotion::BendBoosted => SpeedRule::BendBoosted,
                AggregateMotion::Steady | AggregateMotion::Decorated => SpeedRule::Constant,
            },
            PacketKind::Wrapped { .. } => SpeedRule::Capped(WRAPPED_MAX),
        }
    }

    fn integrate_speed(&mut self, dt: f32, turn_cos: Option<f32>) {
        match self.speed_rule() {
            SpeedRule::Constant => {}
            SpeedRule::Capped(max) => {
                self.speed = (self.speed + self.acceleration * dt).min(max);
            }
            SpeedRule::Bidirectional(max) => {
                self.speed = (self.speed + self.acceleration * dt).clamp(-max, max);
            }
            SpeedRule::BendBoosted => {
                let boost = if turn_cos.is_some_and(|c| c < BEND_COS) {
                    BEND_BOOST
                } else {
                    0.0
                };
                self.set_acceleration(boost);
                self.speed = (self.speed + self.acceleration * dt).min(AGGREGATE_MAX);
            }
        }
    }

    /// Advance along the current wire; no-op when not travelling
    pub fn advance(&mut self, dt: f32) -> Option<Arrival> {
        let turn_cos = match &self.location {
            Location::Travelling(t) => t.turn_ahead_cos(),
            Location::Queued(_) => return None,
        };
        self.integrate_speed(dt, turn_cos);

        let decorated = matches!(
            self.kind,
            PacketKind::Aggregate {
                motion: AggregateMotion::Decorated,
                ..
            }
        );
        let distance = self.speed * dt;
        let Location::Travelling(trav) = &mut self.location else {
            return None;
        };
        let arrival = trav.walk(distance);
        self.base = trav.point();
        let tangent = trav.tangent();

        if decorated {
            self.decoration.step(distance.abs(), dt, tangent);
        }
        self.compose_impact(dt);
        arrival
    }

    /// Drop decoration drift and impact offset (recenter trigger)
    pub fn recenter(&mut self) {
        self.decoration = Decoration::new();
        self.impact = Impact::default();
    }

    /// Count one collision; true once noise reaches the packet's size
    pub fn add_noise(&mut self) -> bool {
        self.noise = (self.noise + 1).min(self.size);
        self.noise >= self.size
    }

    /// Lose one unit of size; true when nothing is left
    pub fn shrink(&mut self) -> bool {
        self.size = self.size.saturating_sub(1);
        self.noise = self.noise.min(self.size);
        self.size == 0
    }

    /// Kick the packet away from `point`
    pub fn apply_impulse(&mut self, point: Vec2) {
        let away = self.collision_center() - point;
        let dir = if away.length_squared() < 1e-6 {
            Vec2::X
        } else {
            away.normalize()
        };
        self.impact.vel += dir * IMPACT_KICK;
    }

    /// One integration step of the impact state, for same-frame separation
    pub fn impact_step(&mut self, dt: f32) {
        self.compose_impact(dt);
    }

    fn compose_impact(&mut self, dt: f32) {
        self.impact.offset += self.impact.vel * dt;
        let max_offset = (2.0 * self.collision_radius()).max(24.0);
        if self.impact.offset.length() > max_offset {
            self.impact.offset = self.impact.offset.normalize() * max_offset;
        }
        self.impact.vel *= (-IMPACT_DRAG * dt).exp();
    }
}

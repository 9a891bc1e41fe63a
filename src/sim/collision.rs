//! Packet-packet collision detection
//!
//! Broad phase is a uniform grid rebuilt from scratch each tick; a packet whose
//! footprint straddles cell boundaries is filed in every cell it touches.
//! Narrow phase approximates each circular footprint with a regular octagon.

use std::collections::{BTreeMap, BTreeSet};

use glam::Vec2;

use super::packet::PacketId;

/// Collision footprint of one travelling packet
#[derive(Debug, Clone, Copy)]
pub struct Body {
    pub id: PacketId,
    pub center: Vec2,
    pub radius: f32,
}

/// Confirmed overlap; `a < b` by id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Contact {
    pub a: PacketId,
    pub b: PacketId,
    /// Midpoint of the two centres
    pub point: Vec2,
}

/// Uniform grid of body indices
#[derive(Debug, Default)]
pub struct SpatialGrid {
    cell: f32,
    cells: BTreeMap<(i32, i32), Vec<usize>>,
}

impl SpatialGrid {
    pub fn build(bodies: &[Body], cell: f32) -> Self {
        let mut grid = Self {
            cell,
            cells: BTreeMap::new(),
        };
        for (i, body) in bodies.iter().enumerate() {
            let (x0, y0) = grid.cell_of(body.center - Vec2::splat(body.radius));
            let (x1, y1) = grid.cell_of(body.center + Vec2::splat(body.radius));
            for cx in x0..=x1 {
                for cy in y0..=y1 {
                    grid.cells.entry((cx, cy)).or_default().push(i);
                }
            }
        }
        grid
    }

    pub fn cell_of(&self, p: Vec2) -> (i32, i32) {
        ((p.x / self.cell).floor() as i32, (p.y / self.cell).floor() as i32)
    }

    /// Bodies filed under a cell
    pub fn bodies_in(&self, cell: (i32, i32)) -> &[usize] {
        self.cells.get(&cell).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn occupied(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.cells.keys().copied()
    }
}

/// Regular octagon with its vertices on the circle
pub fn octagon(center: Vec2, radius: f32) -> [Vec2; 8] {
    std::array::from_fn(|i| {
        let angle = i as f32 * std::f32::consts::FRAC_PI_4;
        center + Vec2::from_angle(angle) * radius
    })
}

fn orientation(a: Vec2, b: Vec2, c: Vec2) -> f32 {
    (b - a).perp_dot(c - a)
}

fn on_segment(a: Vec2, b: Vec2, p: Vec2) -> bool {
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

/// Closed segment intersection, collinear overlaps included
pub fn segments_intersect(a1: Vec2, a2: Vec2, b1: Vec2, b2: Vec2) -> bool {
    let d1 = orientation(b1, b2, a1);
    let d2 = orientation(b1, b2, a2);
    let d3 = orientation(a1, a2, b1);
    let d4 = orientation(a1, a2, b2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    (d1 == 0.0 && on_segment(b1, b2, a1))
        || (d2 == 0.0 && on_segment(b1, b2, a2))
        || (d3 == 0.0 && on_segment(a1, a2, b1))
        || (d4 == 0.0 && on_segment(a1, a2, b2))
}

/// Even-odd ray casting
pub fn point_in_polygon(p: Vec2, polygon: &[Vec2]) -> bool {
    let mut inside = false;
    let mut j = polygon.len().wrapping_sub(1);
    for i in 0..polygon.len() {
        let (a, b) = (polygon[i], polygon[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn edges(polygon: &[Vec2]) -> impl Iterator<Item = (Vec2, Vec2)> + '_ {
    polygon
        .iter()
        .zip(polygon.iter().cycle().skip(1))
        .map(|(&a, &b)| (a, b))
}

/// Edge crossing, or one polygon wholly inside the other
pub fn polygons_overlap(a: &[Vec2], b: &[Vec2]) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let crossing = edges(a).any(|(a1, a2)| edges(b).any(|(b1, b2)| segments_intersect(a1, a2, b1, b2)));
    crossing || point_in_polygon(a[0], b) || point_in_polygon(b[0], a)
}

/// Every overlapping pair, each reported exactly once
pub fn find_contacts(bodies: &[Body], cell: f32) -> Vec<Contact> {
    let grid = SpatialGrid::build(bodies, cell);
    let mut tested = BTreeSet::new();
    let mut contacts = Vec::new();

    for (cx, cy) in grid.occupied() {
        for &i in grid.bodies_in((cx, cy)) {
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for &j in grid.bodies_in((cx + dx, cy + dy)) {
                        let (a, b) = (&bodies[i], &bodies[j]);
                        if a.id >= b.id || !tested.insert((a.id, b.id)) {
                            continue;
                        }
                        let reach = a.radius + b.radius;
                        if a.center.distance_squared(b.center) > reach * reach {
                            continue;
                        }
                        if polygons_overlap(&octagon(a.center, a.radius), &octagon(b.center, b.radius)) {
                            contacts.push(Contact {
                                a: a.id,
                                b: b.id,
                                point: (a.center + b.center) * 0.5,
                            });
                        }
                    }
                }
            }
        }
    }

    contacts
}

//! Wire path geometry
//!
//! A wire runs between two fixed port centres. The player may add up to
//! `MAX_BENDS` curved detours; each bend is two feet on the wire plus a
//! control point ("middle") that pulls a quadratic curve away from the axis.
//!
//! All ordering and validation uses the scalar projection onto the straight
//! start->end axis, even though the drawn path leaves that axis.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::consts::{MAX_BENDS, PATH_SMOOTHNESS};
use crate::error::BendError;
use crate::{closest_point_on_segment, point_segment_distance};

/// A curved detour on a wire
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BendPoint {
    pub foot_a: Vec2,
    pub middle: Vec2,
    pub foot_b: Vec2,
}

impl BendPoint {
    pub fn new(foot_a: Vec2, middle: Vec2, foot_b: Vec2) -> Self {
        Self {
            foot_a,
            middle,
            foot_b,
        }
    }

    /// Interior samples of the quadratic curve foot_a -> middle -> foot_b
    ///
    /// The feet themselves are not included.
    pub fn sample_curve(&self, samples: usize) -> Vec<Vec2> {
        (1..=samples)
            .map(|i| {
                let t = i as f32 / (samples + 1) as f32;
                let u = 1.0 - t;
                self.foot_a * (u * u) + self.middle * (2.0 * u * t) + self.foot_b * (t * t)
            })
            .collect()
    }
}

/// Poly-line geometry of one wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePath {
    start: Vec2,
    end: Vec2,
    /// Sorted by the projection of each bend's middle
    bends: Vec<BendPoint>,
    /// Arc length of the `PATH_SMOOTHNESS` path, refreshed on every edit
    length: f32,
}

impl WirePath {
    pub fn new(start: Vec2, end: Vec2) -> Self {
        let mut path = Self {
            start,
            end,
            bends: Vec::with_capacity(MAX_BENDS),
            length: 0.0,
        };
        path.refresh_length();
        path
    }

    pub fn start(&self) -> Vec2 {
        self.start
    }

    pub fn end(&self) -> Vec2 {
        self.end
    }

    pub fn bends(&self) -> &[BendPoint] {
        &self.bends
    }

    /// Cached arc length of the walked (smoothed) path
    pub fn length(&self) -> f32 {
        self.length
    }

    /// Move the endpoints (a port moved with its system)
    pub fn set_endpoints(&mut self, start: Vec2, end: Vec2) {
        self.start = start;
        self.end = end;
        self.refresh_length();
    }

    /// Scalar distance of `p` from the start, projected onto the start->end axis
    pub fn projection(&self, p: Vec2) -> f32 {
        let axis = self.end - self.start;
        let len = axis.length();
        if len < 1e-6 {
            return 0.0;
        }
        axis.dot(p - self.start) / len
    }

    /// Add a bend; returns its index in the sorted bend list
    ///
    /// Feet given in reverse axis order are swapped. The middle must project
    /// inside the feet, and the new span must sit wholly before the first or
    /// after the last existing bend.
    pub fn add_bend(
        &mut self,
        foot_a: Vec2,
        middle: Vec2,
        foot_b: Vec2,
    ) -> Result<usize, BendError> {
        if self.bends.len() >= MAX_BENDS {
            return Err(BendError::TooManyBends { max: MAX_BENDS });
        }

        let (foot_a, foot_b) = if self.projection(foot_a) > self.projection(foot_b) {
            (foot_b, foot_a)
        } else {
            (foot_a, foot_b)
        };
        let lo = self.projection(foot_a);
        let hi = self.projection(foot_b);
        let mid = self.projection(middle);
        if mid < lo || mid > hi {
            return Err(BendError::MiddleOutsideSpan);
        }

        if let (Some(first), Some(last)) = (self.bends.first(), self.bends.last()) {
            let before_first = hi <= self.projection(first.foot_a);
            let after_last = lo >= self.projection(last.foot_b);
            if !before_first && !after_last {
                return Err(BendError::OverlapsExisting);
            }
        }

        let bend = BendPoint::new(foot_a, middle, foot_b);
        let mut bends = std::mem::take(&mut self.bends);
        bends.push(bend);
        bends.sort_by(|a, b| {
            self.projection(a.middle)
                .total_cmp(&self.projection(b.middle))
        });
        self.bends = bends;
        self.refresh_length();

        Ok(self
            .bends
            .iter()
            .position(|b| *b == bend)
            .unwrap_or(self.bends.len() - 1))
    }

    /// Remove the bend at `index` (sorted order)
    pub fn remove_bend(&mut self, index: usize) -> Option<BendPoint> {
        if index >= self.bends.len() {
            return None;
        }
        let bend = self.bends.remove(index);
        self.refresh_length();
        Some(bend)
    }

    /// Poly-line: start, then per bend its first foot, `smoothness` curve
    /// samples and its second foot, then the end
    pub fn points(&self, smoothness: usize) -> Vec<Vec2> {
        let mut pts = Vec::with_capacity(2 + self.bends.len() * (2 + smoothness));
        pts.push(self.start);
        for bend in &self.bends {
            pts.push(bend.foot_a);
            if smoothness > 0 {
                pts.extend(bend.sample_curve(smoothness));
            }
            pts.push(bend.foot_b);
        }
        pts.push(self.end);
        pts
    }

    /// Whether `p` lies within `tolerance` of the unsmoothed path
    pub fn hit(&self, p: Vec2, tolerance: f32) -> bool {
        self.points(0)
            .windows(2)
            .any(|seg| point_segment_distance(p, seg[0], seg[1]) <= tolerance)
    }

    /// Nearest location on the smoothed path (used to snap trigger points)
    pub fn closest_point(&self, p: Vec2) -> Vec2 {
        let pts = self.points(PATH_SMOOTHNESS);
        let mut best = pts[0];
        let mut best_dist = f32::INFINITY;
        for seg in pts.windows(2) {
            let candidate = closest_point_on_segment(p, seg[0], seg[1]);
            let d = p.distance(candidate);
            if d < best_dist {
                best_dist = d;
                best = candidate;
            }
        }
        best
    }

    /// Smallest distance from `p` to the path sampled at `smoothness`
    pub fn distance_to(&self, p: Vec2, smoothness: usize) -> f32 {
        self.points(smoothness)
            .windows(2)
            .map(|seg| point_segment_distance(p, seg[0], seg[1]))
            .fold(f32::INFINITY, f32::min)
    }

    fn refresh_length(&mut self) {
        self.length = self
            .points(PATH_SMOOTHNESS)
            .windows(2)
            .map(|seg| seg[0].distance(seg[1]))
            .sum();
    }
}

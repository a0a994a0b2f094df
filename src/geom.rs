//!
//! # Geometric Services
//!
//! The small set of geometric algorithms the I/O core calls out to:
//! curve discretization for OASIS circles, path flattening for paths that
//! cannot be serialized as native path records, and polygon fracturing for
//! the GDSII writer's `max_points` limit. These are services *to* the
//! codecs, not part of them; the implementations here favor clarity over
//! geometric generality.
//!

use crate::data::{EndType, Polygon, Vec2};

/// Discretize an axis-aligned ellipse into a polygon.
/// `tolerance` bounds the chord-to-arc error in user coordinates.
pub fn ellipse(
    center: Vec2,
    radius_x: f64,
    radius_y: f64,
    tolerance: f64,
    layer: u32,
    datatype: u32,
) -> Polygon {
    let num_points = arc_point_count(radius_x.max(radius_y), tolerance);
    let mut points = Vec::with_capacity(num_points);
    for i in 0..num_points {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / num_points as f64;
        points.push(Vec2::new(
            center.x + radius_x * angle.cos(),
            center.y + radius_y * angle.sin(),
        ));
    }
    Polygon {
        layer,
        datatype,
        points,
        ..Default::default()
    }
}

/// Number of chords needed to keep a full turn of radius `radius` within
/// `tolerance` of the true arc. Never fewer than eight.
fn arc_point_count(radius: f64, tolerance: f64) -> usize {
    if !(tolerance > 0.0) || tolerance >= radius {
        return 8;
    }
    let step = 2.0 * (1.0 - tolerance / radius).acos();
    ((2.0 * std::f64::consts::PI / step).ceil() as usize).max(8)
}

/// Flatten one strand of a path into its outline polygon.
///
/// `half_widths` carries a (half-width, centerline offset) pair per spine
/// point. Joins are mitered; caps follow `end_type`, with `extensions`
/// supplying the begin/end amounts for [EndType::Extended] and `tolerance`
/// bounding the cap discretization for [EndType::Round].
pub fn flatten_path(
    spine: &[Vec2],
    half_widths: &[Vec2],
    end_type: EndType,
    extensions: Vec2,
    tolerance: f64,
) -> Vec<Vec2> {
    if spine.len() < 2 || half_widths.len() < spine.len() {
        return Vec::new();
    }
    // Centerline with offsets applied, then per-vertex miter normals.
    let centers: Vec<Vec2> = (0..spine.len())
        .map(|i| spine[i] + miter_normal(spine, i) * half_widths[i].y)
        .collect();
    let mut left = Vec::with_capacity(centers.len());
    let mut right = Vec::with_capacity(centers.len());
    for (i, &c) in centers.iter().enumerate() {
        let n = miter_normal(&centers, i);
        let hw = half_widths[i].x;
        left.push(c + n * hw);
        right.push(c - n * hw);
    }
    // Cap extensions along the end tangents
    let hw0 = half_widths[0].x;
    let hw1 = half_widths[half_widths.len() - 1].x;
    let t0 = direction(centers[1], centers[0]);
    let t1 = direction(centers[centers.len() - 2], centers[centers.len() - 1]);
    let (ext0, ext1) = match end_type {
        EndType::Flush | EndType::Round => (0.0, 0.0),
        EndType::HalfWidth => (hw0, hw1),
        EndType::Extended => (extensions.x, extensions.y),
    };
    if ext0 != 0.0 {
        left[0] += t0 * ext0;
        right[0] += t0 * ext0;
    }
    if ext1 != 0.0 {
        let last = left.len() - 1;
        left[last] += t1 * ext1;
        right[last] += t1 * ext1;
    }

    let mut outline = left;
    if let EndType::Round = end_type {
        outline.extend(cap_arc(
            centers[centers.len() - 1],
            outline[outline.len() - 1],
            hw1,
            tolerance,
        ));
    }
    outline.extend(right.into_iter().rev());
    if let EndType::Round = end_type {
        outline.extend(cap_arc(centers[0], outline[outline.len() - 1], hw0, tolerance));
    }
    outline
}

/// Interior points of a semi-circular cap from `from` around `center`
fn cap_arc(center: Vec2, from: Vec2, radius: f64, tolerance: f64) -> Vec<Vec2> {
    let count = arc_point_count(radius, tolerance) / 2;
    let start = (from.y - center.y).atan2(from.x - center.x);
    (1..count)
        .map(|i| {
            let angle = start - std::f64::consts::PI * i as f64 / count as f64;
            Vec2::new(
                center.x + radius * angle.cos(),
                center.y + radius * angle.sin(),
            )
        })
        .collect()
}

/// Unit vector from `a` toward `b`
fn direction(a: Vec2, b: Vec2) -> Vec2 {
    let d = b - a;
    let len = (d.x * d.x + d.y * d.y).sqrt();
    if len == 0.0 {
        Vec2::new(1.0, 0.0)
    } else {
        d * (1.0 / len)
    }
}

/// Left-hand normal at vertex `i`, mitered at interior joins
fn miter_normal(points: &[Vec2], i: usize) -> Vec2 {
    let n_of = |a: Vec2, b: Vec2| {
        let t = direction(a, b);
        Vec2::new(-t.y, t.x)
    };
    let last = points.len() - 1;
    if i == 0 {
        return n_of(points[0], points[1]);
    }
    if i == last {
        return n_of(points[last - 1], points[last]);
    }
    let n1 = n_of(points[i - 1], points[i]);
    let n2 = n_of(points[i], points[i + 1]);
    let sum = n1 + n2;
    let len2 = sum.x * sum.x + sum.y * sum.y;
    if len2 < 1e-12 {
        // U-turn; fall back to the incoming normal
        return n1;
    }
    // Scale so the projection on either segment normal stays unity
    sum * (2.0 / len2)
}

/// Fracture `points` into pieces of at most `max_points` vertices by
/// recursive bisection along the bounding-box midline. `max_points`
/// below five disables fracturing.
pub fn fracture(points: Vec<Vec2>, max_points: u64) -> Vec<Vec<Vec2>> {
    if max_points < 5 || points.len() as u64 <= max_points {
        return vec![points];
    }
    let (min, max) = bounds(&points);
    let vertical = (max.x - min.x) >= (max.y - min.y);
    let mid = if vertical {
        0.5 * (min.x + max.x)
    } else {
        0.5 * (min.y + max.y)
    };
    let lo = clip(&points, vertical, mid, false);
    let hi = clip(&points, vertical, mid, true);
    if lo.len() >= points.len() || hi.len() >= points.len() {
        // No progress; emit as-is rather than recurse forever
        return vec![points];
    }
    let mut out = fracture(lo, max_points);
    out.extend(fracture(hi, max_points));
    out.retain(|piece| piece.len() >= 3);
    out
}

fn bounds(points: &[Vec2]) -> (Vec2, Vec2) {
    let mut min = points[0];
    let mut max = points[0];
    for p in points.iter() {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    (min, max)
}

/// Sutherland-Hodgman clip of a closed ring against a half-plane:
/// keeps coordinates `>= mid` when `upper`, else `<= mid`.
fn clip(points: &[Vec2], vertical: bool, mid: f64, upper: bool) -> Vec<Vec2> {
    let coord = |p: &Vec2| if vertical { p.x } else { p.y };
    let inside = |p: &Vec2| {
        if upper {
            coord(p) >= mid
        } else {
            coord(p) <= mid
        }
    };
    let cross = |a: &Vec2, b: &Vec2| {
        let t = (mid - coord(a)) / (coord(b) - coord(a));
        *a + (*b - *a) * t
    };
    let mut out = Vec::with_capacity(points.len() + 2);
    for i in 0..points.len() {
        let a = &points[i];
        let b = &points[(i + 1) % points.len()];
        if inside(a) {
            out.push(*a);
            if !inside(b) {
                out.push(cross(a, b));
            }
        } else if inside(b) {
            out.push(cross(a, b));
        }
    }
    out.dedup_by(|a, b| *a == *b);
    if out.len() > 1 && out.first() == out.last() {
        out.pop();
    }
    out
}

//! Planar geometry helpers: affine fitting, polygon area, convexity.

use crate::types::Point;

/// An affine map `p -> (a*x + b*y + c, d*x + e*y + f)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
}

impl Affine {
    /// Axis-aligned scaling.
    #[must_use]
    pub const fn scale(sx: f64, sy: f64) -> Self {
        Self {
            a: sx,
            b: 0.0,
            c: 0.0,
            d: 0.0,
            e: sy,
            f: 0.0,
        }
    }

    /// Apply the map to a point.
    #[must_use]
    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a.mul_add(p.x, self.b.mul_add(p.y, self.c)),
            self.d.mul_add(p.x, self.e.mul_add(p.y, self.f)),
        )
    }

    /// Compose with a subsequent axis-aligned scaling.
    #[must_use]
    pub fn then_scale(&self, sx: f64, sy: f64) -> Self {
        Self {
            a: self.a * sx,
            b: self.b * sx,
            c: self.c * sx,
            d: self.d * sy,
            e: self.e * sy,
            f: self.f * sy,
        }
    }

    /// Area scale factor of the linear part.
    #[must_use]
    pub fn determinant(&self) -> f64 {
        self.a.mul_add(self.e, -(self.b * self.d))
    }

    /// Least-squares fit mapping each `from[i]` to `to[i]`.
    ///
    /// Returns `None` with fewer than three pairs, mismatched slices, or
    /// when the source points are (nearly) collinear.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(from: &[Point], to: &[Point]) -> Option<Self> {
        if from.len() != to.len() || from.len() < 3 {
            return None;
        }
        let n = from.len() as f64;
        let mean = |pts: &[Point]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            Point::new(sx / n, sy / n)
        };
        let mu = mean(from);
        let mx = mean(to);

        // Centering decouples the translation, leaving a 2x2 system per
        // output axis.
        let (mut suu, mut suv, mut svv) = (0.0, 0.0, 0.0);
        let (mut sux, mut svx, mut suy, mut svy) = (0.0, 0.0, 0.0, 0.0);
        for (p, q) in from.iter().zip(to) {
            let (u, v) = (p.x - mu.x, p.y - mu.y);
            let (x, y) = (q.x - mx.x, q.y - mx.y);
            suu += u * u;
            suv += u * v;
            svv += v * v;
            sux += u * x;
            svx += v * x;
            suy += u * y;
            svy += v * y;
        }

        let det = suu.mul_add(svv, -(suv * suv));
        if !(det > 1e-9 * suu * svv) {
            return None;
        }

        let a = svv.mul_add(sux, -(suv * svx)) / det;
        let b = suu.mul_add(svx, -(suv * sux)) / det;
        let d = svv.mul_add(suy, -(suv * svy)) / det;
        let e = suu.mul_add(svy, -(suv * suy)) / det;
        Some(Self {
            a,
            b,
            c: mx.x - a.mul_add(mu.x, b * mu.y),
            d,
            e,
            f: mx.y - d.mul_add(mu.x, e * mu.y),
        })
    }
}

/// Signed area of a polygon (shoelace formula). Positive for clockwise
/// vertices in image coordinates (y down).
#[must_use]
pub fn signed_area(points: &[Point]) -> f64 {
    let n = points.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let p = points[i];
            let q = points[(i + 1) % n];
            p.x.mul_add(q.y, -(q.x * p.y))
        })
        .sum();
    twice / 2.0
}

/// Absolute polygon area.
#[must_use]
pub fn area(points: &[Point]) -> f64 {
    signed_area(points).abs()
}

/// Whether the polygon is strictly convex (all turns in one direction,
/// no zero-length or collinear edges).
#[must_use]
pub fn is_convex(points: &[Point]) -> bool {
    let n = points.len();
    if n < 3 {
        return false;
    }
    let mut turn: Option<bool> = None;
    for i in 0..n {
        let p = points[i];
        let q = points[(i + 1) % n];
        let r = points[(i + 2) % n];
        let cross = (q.x - p.x).mul_add(r.y - q.y, -((q.y - p.y) * (r.x - q.x)));
        if !(cross.is_finite() && cross.abs() > f64::EPSILON) {
            return false;
        }
        let positive = cross > 0.0;
        match turn {
            None => turn = Some(positive),
            Some(t) if t != positive => return false,
            Some(_) => {}
        }
    }
    true
}

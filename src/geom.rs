//! Sphere and tangent-plane geometry shared by the index, solver and verifier.
//!
//! Sky positions are unit vectors `[x, y, z]` with
//! `x = cos(dec)cos(ra)`, `y = cos(dec)sin(ra)`, `z = sin(dec)`.
//! Tangent-plane coordinates `(ξ, η)` are gnomonic, in radians, with ξ toward
//! increasing RA (East) and η toward North.

use std::f64::consts::PI;

/// Arcseconds per radian.
pub const ARCSEC_PER_RAD: f64 = 180.0 * 3600.0 / PI;

#[inline]
pub fn arcsec_to_rad(arcsec: f64) -> f64 {
    arcsec / ARCSEC_PER_RAD
}

#[inline]
pub fn rad_to_arcsec(rad: f64) -> f64 {
    rad * ARCSEC_PER_RAD
}

/// Chord length² on the unit sphere for a given central angle.
#[inline]
pub fn dist2_from_angle(angle_rad: f64) -> f64 {
    let d = 2.0 * (0.5 * angle_rad).sin();
    d * d
}

/// Central angle for a given chord length² on the unit sphere.
#[inline]
pub fn angle_from_dist2(dist2: f64) -> f64 {
    2.0 * (0.5 * dist2.max(0.0).sqrt()).clamp(-1.0, 1.0).asin()
}

/// Convert right ascension / declination (radians) to a unit vector.
#[inline]
pub fn radec_to_xyz(ra: f64, dec: f64) -> [f64; 3] {
    let (sin_ra, cos_ra) = ra.sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    [cos_dec * cos_ra, cos_dec * sin_ra, sin_dec]
}

/// Convert a (possibly non-unit) vector to `(ra, dec)` in radians, `ra ∈ [0, 2π)`.
#[inline]
pub fn xyz_to_radec(v: [f64; 3]) -> (f64, f64) {
    let n = norm3(v);
    if n <= 0.0 {
        return (0.0, 0.0);
    }
    let ra = v[1].atan2(v[0]).rem_euclid(2.0 * PI);
    let dec = (v[2] / n).clamp(-1.0, 1.0).asin();
    (ra, dec)
}

#[inline]
pub fn dot3(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline]
pub fn norm3(a: [f64; 3]) -> f64 {
    dot3(a, a).sqrt()
}

#[inline]
pub fn dist2_3(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

/// Normalize a vector; `None` for the zero vector.
#[inline]
pub fn normalize3(v: [f64; 3]) -> Option<[f64; 3]> {
    let n = norm3(v);
    if n > 0.0 && n.is_finite() {
        Some([v[0] / n, v[1] / n, v[2] / n])
    } else {
        None
    }
}

/// Normalized midpoint of two unit vectors; `None` if they are antipodal.
pub fn star_midpoint(a: [f64; 3], b: [f64; 3]) -> Option<[f64; 3]> {
    normalize3([a[0] + b[0], a[1] + b[1], a[2] + b[2]])
}

/// East and North unit vectors of the tangent plane at `r`.
///
/// At the poles the East direction is taken along +y (RA = 0 convention).
pub fn tangent_basis(r: [f64; 3]) -> ([f64; 3], [f64; 3]) {
    let (ra, dec) = xyz_to_radec(r);
    let (sin_ra, cos_ra) = ra.sin_cos();
    let (sin_dec, cos_dec) = dec.sin_cos();
    let east = [-sin_ra, cos_ra, 0.0];
    let north = [-sin_dec * cos_ra, -sin_dec * sin_ra, cos_dec];
    (east, north)
}

/// Gnomonic projection of `s` onto the tangent plane at `r`.
///
/// Returns `None` when `s` is on or behind the tangent plane (opposite hemisphere).
pub fn star_coords(s: [f64; 3], r: [f64; 3]) -> Option<(f64, f64)> {
    let sdotr = dot3(s, r);
    if sdotr <= 1e-12 {
        return None;
    }
    let (east, north) = tangent_basis(r);
    Some((dot3(s, east) / sdotr, dot3(s, north) / sdotr))
}

/// Inverse gnomonic projection: tangent-plane `(ξ, η)` at `r` back to a unit vector.
pub fn tangent_to_xyz(xi: f64, eta: f64, r: [f64; 3]) -> [f64; 3] {
    let (east, north) = tangent_basis(r);
    let v = [
        r[0] + xi * east[0] + eta * north[0],
        r[1] + xi * east[1] + eta * north[1],
        r[2] + xi * east[2] + eta * north[2],
    ];
    normalize3(v).unwrap_or(r)
}

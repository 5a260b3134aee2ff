//! Gnomonic (TAN) tangent-plane projection between pixels and the sky.
//!
//! The linear part is a 2×2 CD matrix mapping pixel offsets from CRPIX to
//! tangent-plane radians at CRVAL:
//!
//! ```text
//! [ξ]   [CD11 CD12] [x − CRPIX1]
//! [η] = [CD21 CD22] [y − CRPIX2]
//! ```
//!
//! For the similarity transforms fitted by the solver the CD matrix is a
//! scaled rotation, possibly with a reflection (negative determinant).

use crate::geom::{self, rad_to_arcsec};

/// Invert a 2×2 matrix. Returns `None` if singular (|det| < 1e-30).
#[inline]
pub fn cd_inverse(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det.abs() < 1e-30 || !det.is_finite() {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [cd[1][1] * inv_det, -cd[0][1] * inv_det],
        [-cd[1][0] * inv_det, cd[0][0] * inv_det],
    ])
}

/// TAN projection with a linear pixel mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    /// Tangent point `[RA, Dec]` in radians.
    pub crval: [f64; 2],
    /// Reference pixel `[x, y]`.
    pub crpix: [f64; 2],
    /// CD matrix in tangent-plane radians per pixel.
    pub cd: [[f64; 2]; 2],
    /// Image `[width, height]` in pixels.
    pub image_size: [f64; 2],
}

impl TanWcs {
    /// Tangent point as a unit vector.
    pub fn tangent_xyz(&self) -> [f64; 3] {
        geom::radec_to_xyz(self.crval[0], self.crval[1])
    }

    pub fn det(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    /// `true` when the pixel axes are mirrored relative to (ξ, η).
    pub fn is_flipped(&self) -> bool {
        self.det() < 0.0
    }

    /// Pixel scale in arcseconds per pixel.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        rad_to_arcsec(self.det().abs().sqrt())
    }

    /// Rotation of the pixel +x axis from the ξ axis, degrees.
    pub fn rotation_deg(&self) -> f64 {
        self.cd[1][0].atan2(self.cd[0][0]).to_degrees()
    }

    /// Pixel to tangent-plane coordinates (radians).
    #[inline]
    pub fn pixel_to_tangent(&self, x: f64, y: f64) -> (f64, f64) {
        let u = x - self.crpix[0];
        let v = y - self.crpix[1];
        (
            self.cd[0][0] * u + self.cd[0][1] * v,
            self.cd[1][0] * u + self.cd[1][1] * v,
        )
    }

    /// Tangent-plane coordinates to pixel; `None` if the CD matrix is singular.
    #[inline]
    pub fn tangent_to_pixel(&self, xi: f64, eta: f64) -> Option<(f64, f64)> {
        let inv = cd_inverse(&self.cd)?;
        Some((
            inv[0][0] * xi + inv[0][1] * eta + self.crpix[0],
            inv[1][0] * xi + inv[1][1] * eta + self.crpix[1],
        ))
    }

    pub fn pixel_to_xyz(&self, x: f64, y: f64) -> [f64; 3] {
        let (xi, eta) = self.pixel_to_tangent(x, y);
        geom::tangent_to_xyz(xi, eta, self.tangent_xyz())
    }

    /// Pixel to `(RA, Dec)` in radians.
    pub fn pixel_to_radec(&self, x: f64, y: f64) -> (f64, f64) {
        geom::xyz_to_radec(self.pixel_to_xyz(x, y))
    }

    /// Sky position to pixel. `None` for points in the opposite hemisphere.
    pub fn xyz_to_pixel(&self, xyz: [f64; 3]) -> Option<(f64, f64)> {
        let (xi, eta) = geom::star_coords(xyz, self.tangent_xyz())?;
        self.tangent_to_pixel(xi, eta)
    }

    pub fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.xyz_to_pixel(geom::radec_to_xyz(ra, dec))
    }

    /// Sky position of the image center.
    pub fn field_center_xyz(&self) -> [f64; 3] {
        self.pixel_to_xyz(0.5 * self.image_size[0], 0.5 * self.image_size[1])
    }

    /// Angular radius of the image (center to corner), radians.
    pub fn field_radius_rad(&self) -> f64 {
        let center = self.field_center_xyz();
        let corner = self.pixel_to_xyz(0.0, 0.0);
        geom::angle_from_dist2(geom::dist2_3(center, corner))
    }

    /// Is the pixel inside the image, allowing `margin` pixels outside?
    pub fn contains_pixel(&self, x: f64, y: f64, margin: f64) -> bool {
        x >= -margin
            && x <= self.image_size[0] + margin
            && y >= -margin
            && y <= self.image_size[1] + margin
    }
}

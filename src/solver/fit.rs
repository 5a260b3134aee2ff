//! Least-squares similarity fit (orthogonal Procrustes) from pixel positions
//! to sky positions, producing a TAN projection.

use nalgebra::{Matrix2, Vector2};

use crate::error::FitError;
use crate::geom;
use crate::wcs::{cd_inverse, TanWcs};

/// Point sets whose summed squared spread is below this are degenerate.
const MIN_VARIANCE: f64 = 1e-30;

/// Fit a similarity transform mapping `field_xy` (pixels) onto `ref_xyz`
/// (unit vectors), allowing a reflection.
///
/// The tangent point is the normalized centroid of the reference vectors.
/// With `H = Σ p̃ ξ̃ᵀ = U S Vᵀ`, the rotation is `R = V Uᵀ` and the scale is
/// the square root of the ratio of the two spreads. CRPIX is placed so that
/// the pixel centroid maps onto the tangent-plane centroid.
pub fn fit_tan_wcs(
    ref_xyz: &[[f64; 3]],
    field_xy: &[[f64; 2]],
    image_size: [f64; 2],
) -> Result<TanWcs, FitError> {
    let n = ref_xyz.len().min(field_xy.len());
    if n < 2 || ref_xyz.len() != field_xy.len() {
        return Err(FitError::TooFewCorrespondences {
            found: n,
            required: 2,
        });
    }

    let mut sum = [0.0; 3];
    for v in ref_xyz {
        for k in 0..3 {
            sum[k] += v[k];
        }
    }
    let tangent = geom::normalize3(sum).ok_or(FitError::ProjectionFailed)?;

    let mut plane = Vec::with_capacity(n);
    for &v in ref_xyz {
        let (xi, eta) = geom::star_coords(v, tangent).ok_or(FitError::ProjectionFailed)?;
        plane.push(Vector2::new(xi, eta));
    }
    let pix: Vec<Vector2<f64>> = field_xy.iter().map(|p| Vector2::new(p[0], p[1])).collect();

    let inv_n = 1.0 / n as f64;
    let plane_mean = plane.iter().fold(Vector2::<f64>::zeros(), |acc, v| acc + v) * inv_n;
    let pix_mean = pix.iter().fold(Vector2::<f64>::zeros(), |acc, v| acc + v) * inv_n;

    let mut h = Matrix2::<f64>::zeros();
    let mut pix_var = 0.0;
    let mut plane_var = 0.0;
    for (p, s) in pix.iter().zip(plane.iter()) {
        let dp = p - pix_mean;
        let ds = s - plane_mean;
        h += dp * ds.transpose();
        pix_var += dp.norm_squared();
        plane_var += ds.norm_squared();
    }
    if !(pix_var > MIN_VARIANCE && plane_var > MIN_VARIANCE) {
        return Err(FitError::ZeroVariance);
    }

    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(FitError::SvdFailed),
    };
    let rot = v_t.transpose() * u.transpose();
    let scale = (plane_var / pix_var).sqrt();
    let cd_m = rot * scale;
    if !cd_m.iter().all(|c| c.is_finite()) {
        return Err(FitError::SvdFailed);
    }

    let cd = [[cd_m[(0, 0)], cd_m[(0, 1)]], [cd_m[(1, 0)], cd_m[(1, 1)]]];
    let inv = cd_inverse(&cd).ok_or(FitError::ZeroVariance)?;
    let crpix = [
        pix_mean.x - (inv[0][0] * plane_mean.x + inv[0][1] * plane_mean.y),
        pix_mean.y - (inv[1][0] * plane_mean.x + inv[1][1] * plane_mean.y),
    ];
    let (ra, dec) = geom::xyz_to_radec(tangent);

    Ok(TanWcs {
        crval: [ra, dec],
        crpix,
        cd,
        image_size,
    })
}

/// Largest pixel distance between each field point and its reprojected
/// reference star. Infinite if a star cannot be projected.
pub fn max_residual_px(wcs: &TanWcs, ref_xyz: &[[f64; 3]], field_xy: &[[f64; 2]]) -> f64 {
    ref_xyz
        .iter()
        .zip(field_xy.iter())
        .map(|(&v, p)| match wcs.xyz_to_pixel(v) {
            Some((x, y)) => (x - p[0]).hypot(y - p[1]),
            None => f64::INFINITY,
        })
        .fold(0.0, f64::max)
}

//! Bayesian verification of a candidate transform against the whole field.
//!
//! Each field point is either a foreground point, matching a reference star
//! with Gaussian positional error, or a distractor, uniformly distributed
//! over the image. The score is the log-odds of the foreground hypothesis
//! against "every point is uniform background", accumulated over field
//! points in priority order.
//!
//! Positional variance grows away from the quad that produced the
//! transform: `σ²(R) = σ₀²·(γ² + R²/r_quad²)`, where `R` is the distance
//! from the quad center and `r_quad` is half the quad's AB length.

use std::collections::HashMap;
use std::f64::consts::PI;

use tracing::trace;

use super::{MatchCandidate, VerifyConfig};
use crate::field::Field;
use crate::geom::dist2_from_angle;
use crate::index::IndexAccess;
use crate::kdtree::{KdTree, Neighbor};

/// Outcome of verifying one candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyResult {
    /// Maximum running log-odds over qualifying prefixes.
    pub log_odds: f64,
    /// Field points matched to a reference star (quad stars excluded).
    pub n_match: usize,
    /// Field points that lost a contested reference star, whether they
    /// claimed it first or came later and were farther.
    pub n_conflict: usize,
    /// Field points with no acceptable reference star.
    pub n_distractor: usize,
    /// Field points scored.
    pub n_field: usize,
    /// Reference stars projected inside the image.
    pub n_ref: usize,
    /// Scoring stopped at the bail threshold.
    pub bailed: bool,
    /// Final `(field point, reference star)` matches, quad stars included,
    /// sorted by field point.
    pub matches: Vec<(usize, usize)>,
}

impl VerifyResult {
    /// Fraction of scored field points that found a reference star.
    pub fn overlap(&self) -> f64 {
        let total = self.n_match + self.n_conflict + self.n_distractor;
        if total == 0 {
            0.0
        } else {
            self.n_match as f64 / total as f64
        }
    }
}

/// A claimed reference star: which field point holds it and what it contributed.
#[derive(Debug, Clone, Copy)]
struct Claim {
    field: usize,
    dist2: f64,
    gain: f64,
}

/// Score `cand` against `field` using the reference stars of `index`.
///
/// `n_points` limits how many field points (in order) are considered.
pub fn verify_candidate<I: IndexAccess + ?Sized>(
    index: &I,
    field: &Field,
    n_points: usize,
    cand: &MatchCandidate,
    config: &VerifyConfig,
) -> VerifyResult {
    let wcs = &cand.wcs;
    let sigma0_2 = config.verify_pix * config.verify_pix;
    let margin_px = config.verify_pix;

    // Reference stars within the footprint, projected into the image. The
    // quad's own stars count toward `n_ref` but are never searchable.
    let anchor_stars = cand.stars;
    let scale_rad = wcs.det().abs().sqrt();
    let radius = cand.radius_rad + scale_rad * margin_px * 2.0;
    let mut near: Vec<Neighbor> = Vec::new();
    index.stars_within(cand.center, dist2_from_angle(radius), &mut near);
    let mut n_ref = 0;
    let mut ref_ids = Vec::with_capacity(near.len());
    let mut ref_px = Vec::with_capacity(near.len());
    for &(star, _) in &near {
        if let Some((x, y)) = wcs.xyz_to_pixel(index.star_position(star)) {
            if wcs.contains_pixel(x, y, margin_px) {
                n_ref += 1;
                if !anchor_stars.contains(&star) {
                    ref_ids.push(star);
                    ref_px.push([x, y]);
                }
            }
        }
    }
    let tree = KdTree::build(ref_px, 4);

    // Quad center and size in pixels, from the AB field points.
    let pa = field.points[cand.field[0]];
    let pb = field.points[cand.field[1]];
    let qc = [0.5 * (pa.x + pb.x), 0.5 * (pa.y + pb.y)];
    let rq2 = (0.25 * ((pa.x - pb.x).powi(2) + (pa.y - pb.y).powi(2))).max(f64::MIN_POSITIVE);

    let area = field.area();
    let d = config.distractor_fraction;
    let log_bg = (d / area).ln();
    let baseline = (1.0 / area).ln();
    let bg_gain = log_bg - baseline;
    let log_fg_norm = ((1.0 - d) / (2.0 * PI * n_ref.max(1) as f64)).ln();

    let mut claims: HashMap<usize, Claim> = HashMap::new();

    let mut running = 0.0;
    let mut best = f64::NEG_INFINITY;
    let mut n_match = 0;
    let mut n_conflict = 0;
    let mut n_distractor = 0;
    let mut n_field = 0;
    let mut bailed = false;

    let n_points = n_points.min(field.len());
    for i in 0..n_points {
        if !cand.field.contains(&i) {
            n_field += 1;
            let p = field.points[i];
            let r2 = (p.x - qc[0]).powi(2) + (p.y - qc[1]).powi(2);
            let sigma2 = sigma0_2 * (config.gamma2 + r2 / rq2);
            let cutoff2 = config.cutoff_sigma * config.cutoff_sigma * sigma2;

            let mut gain = bg_gain;
            let mut outcome = Outcome::Distractor;
            if let Some((slot, dist2)) = tree.nearest_within(&[p.x, p.y], cutoff2) {
                let star = ref_ids[slot];
                let log_fg = log_fg_norm - sigma2.ln() - dist2 / (2.0 * sigma2);
                if log_fg > log_bg {
                    let fg_gain = log_fg - baseline;
                    match claims.get(&star).copied() {
                        None => {
                            claims.insert(star, Claim { field: i, dist2, gain: fg_gain });
                            gain = fg_gain;
                            outcome = Outcome::Match;
                        }
                        Some(prev) if dist2 < prev.dist2 => {
                            // The earlier claimant becomes background.
                            running += bg_gain - prev.gain;
                            claims.insert(star, Claim { field: i, dist2, gain: fg_gain });
                            gain = fg_gain;
                            outcome = Outcome::Stole;
                        }
                        Some(_) => outcome = Outcome::Conflict,
                    }
                }
            }
            match outcome {
                Outcome::Match => n_match += 1,
                // A steal moves the match here and makes the displaced
                // claimant the conflict, so the totals move as for a conflict.
                Outcome::Stole | Outcome::Conflict => n_conflict += 1,
                Outcome::Distractor => n_distractor += 1,
            }
            running += gain;
        }

        if i + 1 >= config.min_field_count && running > best {
            best = running;
        }
        if running < config.bail_threshold {
            trace!("Verification bailed at field point {} (log-odds {:.2})", i, running);
            bailed = true;
            break;
        }
    }
    if best == f64::NEG_INFINITY {
        best = running;
    }

    let mut matches: Vec<(usize, usize)> = claims
        .iter()
        .map(|(&star, claim)| (claim.field, star))
        .collect();
    for k in 0..cand.field.len() {
        matches.push((cand.field[k], cand.stars[k]));
    }
    matches.sort_unstable();

    VerifyResult {
        log_odds: best,
        n_match,
        n_conflict,
        n_distractor,
        n_field,
        n_ref,
        bailed,
        matches,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Match,
    /// Took a reference star from an earlier, worse claimant.
    Stole,
    Conflict,
    Distractor,
}

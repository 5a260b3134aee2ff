//! Blind quad-matching solver.
//!
//! Field points are admitted one at a time in priority order. Every admitted
//! point may close new quads: as the B end of a new diagonal pair, or as an
//! interior star of an existing pair. Each new quad's code is looked up in
//! the code trees of all loaded indexes, and every hit goes through:
//!
//! 1. **Fit**: a similarity TAN projection from the 4 correspondences
//!    ([`fit`]), rejected if its pixel scale or quad residual is off.
//! 2. **Verify**: Bayesian log-odds against the whole field ([`verify`]).
//! 3. **Agree**: kept candidates are clustered by sky footprint
//!    ([`agreement`]); once a cluster is large enough its members are
//!    checked against the solve criteria.
//!
//! The first candidate that passes stops the search.

pub mod agreement;
pub mod code;
pub mod combinations;
pub mod fit;
pub mod search;
pub mod session;
pub mod verify;

use crate::error::ConfigError;
use crate::geom::{self, rad_to_arcsec};
use crate::wcs::TanWcs;

use code::{InBoxShape, DIMQUADS};

// ── Status codes ────────────────────────────────────────────────────────────

/// Outcome of a solve attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// A candidate passed the solve criteria.
    Solved,
    /// All quads were exhausted (or a quad/match limit was hit) without a solution.
    NoMatch,
    /// The time budget ran out first.
    Timeout,
    /// The cancel token was set.
    Cancelled,
    /// Fewer field points than stars per quad.
    TooFew,
    /// The field could not be read or is malformed.
    Skipped,
}

/// Which mirror parities to search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// Pixel axes have the same handedness as (ξ, η).
    Normal,
    /// Pixel axes are mirrored relative to (ξ, η).
    Flipped,
    /// Try both.
    #[default]
    Both,
}

impl Parity {
    /// Flags to probe, normal first.
    pub fn flips(self) -> &'static [bool] {
        match self {
            Parity::Normal => &[false],
            Parity::Flipped => &[true],
            Parity::Both => &[false, true],
        }
    }

    pub fn allows(self, flipped: bool) -> bool {
        match self {
            Parity::Normal => !flipped,
            Parity::Flipped => flipped,
            Parity::Both => true,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Noise-growth factor in the verifier's positional variance
/// `σ²(R) = σ₀²·(γ² + R²/r_quad²)`.
///
/// Empirical; recalibrate against simulated fields before relying on it.
pub const DEFAULT_VERIFY_GAMMA2: f64 = 1.0;

/// Scale of the positional-noise term in the adaptive code tolerance.
pub const CODE_NOISE_GAIN: f64 = 6.0;

/// Parameters of the Bayesian verifier.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Positional noise σ₀ of field points at the quad center, pixels. Default 1.0.
    pub verify_pix: f64,
    /// Fraction of field points assumed to have no reference counterpart. Default 0.25.
    pub distractor_fraction: f64,
    /// Noise-growth factor γ². Default [`DEFAULT_VERIFY_GAMMA2`].
    pub gamma2: f64,
    /// Search cutoff for a reference match, in units of σ. Default 5.0.
    pub cutoff_sigma: f64,
    /// Stop scoring once the running log-odds falls below this. Default ln(1e-100).
    pub bail_threshold: f64,
    /// Only prefixes of at least this many field points count toward the
    /// reported maximum. Default 4.
    pub min_field_count: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            verify_pix: 1.0,
            distractor_fraction: 0.25,
            gamma2: DEFAULT_VERIFY_GAMMA2,
            cutoff_sigma: 5.0,
            bail_threshold: 1e-100_f64.ln(),
            min_field_count: 4,
        }
    }
}

/// Criteria for keeping a verified candidate and for declaring the field solved.
///
/// Every enabled criterion must pass.
#[derive(Debug, Clone)]
pub struct AcceptConfig {
    /// Judge candidates by log-odds. Default true.
    pub use_log_odds: bool,
    /// Judge candidates by overlap fraction. Default false.
    pub use_overlap: bool,
    /// Log-odds needed to keep a candidate. Default ln(1e9).
    pub log_odds_to_keep: f64,
    /// Log-odds needed to solve. Default ln(1e9).
    pub log_odds_to_solve: f64,
    /// Overlap fraction needed to keep a candidate. Default 0.0.
    pub overlap_to_keep: f64,
    /// Overlap fraction needed to solve. Default 0.25.
    pub overlap_to_solve: f64,
    /// Minimum number of reference stars inside the image. Default 0.
    pub min_ref_in_field: usize,
}

impl Default for AcceptConfig {
    fn default() -> Self {
        Self {
            use_log_odds: true,
            use_overlap: false,
            log_odds_to_keep: 1e9_f64.ln(),
            log_odds_to_solve: 1e9_f64.ln(),
            overlap_to_keep: 0.0,
            overlap_to_solve: 0.25,
            min_ref_in_field: 0,
        }
    }
}

impl AcceptConfig {
    pub fn keeps(&self, c: &MatchCandidate) -> bool {
        c.n_ref >= self.min_ref_in_field
            && (!self.use_log_odds || c.log_odds >= self.log_odds_to_keep)
            && (!self.use_overlap || c.overlap >= self.overlap_to_keep)
    }

    pub fn solves(&self, c: &MatchCandidate) -> bool {
        c.n_ref >= self.min_ref_in_field
            && (!self.use_log_odds || c.log_odds >= self.log_odds_to_solve)
            && (!self.use_overlap || c.overlap >= self.overlap_to_solve)
    }
}

/// Parameters of the agreement clusterer.
#[derive(Debug, Clone)]
pub struct AgreementConfig {
    /// Maximum summed corner distance for two candidates to agree, arcseconds.
    /// Default 10.0.
    pub tolerance_arcsec: f64,
    /// Cluster size at which members are verified and checked against the
    /// solve criteria. Above 1, fitted candidates are clustered before any
    /// verification. Default 1 (each candidate is verified on its own).
    pub agree_to_verify: usize,
}

impl Default for AgreementConfig {
    fn default() -> Self {
        Self {
            tolerance_arcsec: 10.0,
            agree_to_verify: 1,
        }
    }
}

/// Parameters controlling a field solve.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Lower bound on the image pixel scale, arcsec/pixel.
    pub pixel_scale_lower_arcsec: f64,
    /// Upper bound on the image pixel scale, arcsec/pixel.
    pub pixel_scale_upper_arcsec: f64,
    /// Code-space match radius. Default 0.01.
    pub code_tol: f64,
    /// Grow the code radius with propagated positional noise. Default true.
    pub adaptive_tolerance: bool,
    /// Centroiding noise of field points, pixels. Default 1.0.
    pub field_jitter_px: f64,
    /// Mirror parities to search. Default both.
    pub parity: Parity,
    /// Acceptance region for interior stars. Default square.
    pub in_box: InBoxShape,
    /// Use only the first N field points. None = all.
    pub max_field_points: Option<usize>,
    /// Smallest AB separation considered, pixels. Default 10.0.
    pub min_quad_size_px: f64,
    /// Largest allowed reprojection error of a quad star after the fit,
    /// pixels. None = no check. Default Some(10.0).
    pub quad_residual_px: Option<f64>,
    /// Stop after trying this many field quads. None = no limit.
    pub max_quads: Option<u64>,
    /// Stop after this many code matches. None = no limit.
    pub max_matches: Option<u64>,
    /// Wall-clock budget per field in milliseconds. None = no limit.
    pub field_timeout_ms: Option<u64>,
    pub verify: VerifyConfig,
    pub accept: AcceptConfig,
    pub agreement: AgreementConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            pixel_scale_lower_arcsec: 0.1,
            pixel_scale_upper_arcsec: 100.0,
            code_tol: 0.01,
            adaptive_tolerance: true,
            field_jitter_px: 1.0,
            parity: Parity::Both,
            in_box: InBoxShape::Square,
            max_field_points: None,
            min_quad_size_px: 10.0,
            quad_residual_px: Some(10.0),
            max_quads: None,
            max_matches: None,
            field_timeout_ms: None,
            verify: VerifyConfig::default(),
            accept: AcceptConfig::default(),
            agreement: AgreementConfig::default(),
        }
    }
}

fn require(name: &'static str, requirement: &'static str, value: f64, ok: bool) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            requirement,
            value,
        })
    }
}

impl SolverConfig {
    /// Configuration with the given pixel-scale bounds (arcsec/pixel).
    pub fn new(pixel_scale_lower_arcsec: f64, pixel_scale_upper_arcsec: f64) -> Self {
        Self {
            pixel_scale_lower_arcsec,
            pixel_scale_upper_arcsec,
            ..Default::default()
        }
    }

    /// Check every parameter; called once before any field is solved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const POSITIVE: &str = "positive and finite";
        const NON_NEGATIVE: &str = "non-negative and finite";

        let lo = self.pixel_scale_lower_arcsec;
        let hi = self.pixel_scale_upper_arcsec;
        require("pixel_scale_lower_arcsec", POSITIVE, lo, lo > 0.0 && lo.is_finite())?;
        require("pixel_scale_upper_arcsec", POSITIVE, hi, hi > 0.0 && hi.is_finite())?;
        if lo > hi {
            return Err(ConfigError::ScaleBoundsInverted { lower: lo, upper: hi });
        }
        let t = self.code_tol;
        require("code_tol", NON_NEGATIVE, t, t >= 0.0 && t.is_finite())?;
        let j = self.field_jitter_px;
        require("field_jitter_px", NON_NEGATIVE, j, j >= 0.0 && j.is_finite())?;
        let q = self.min_quad_size_px;
        require("min_quad_size_px", NON_NEGATIVE, q, q >= 0.0 && q.is_finite())?;
        if let Some(r) = self.quad_residual_px {
            require("quad_residual_px", POSITIVE, r, r > 0.0 && r.is_finite())?;
        }
        if let Some(n) = self.max_field_points {
            require("max_field_points", "at least 4", n as f64, n >= DIMQUADS)?;
        }

        let v = &self.verify;
        require("verify_pix", POSITIVE, v.verify_pix, v.verify_pix > 0.0 && v.verify_pix.is_finite())?;
        let d = v.distractor_fraction;
        require("distractor_fraction", "strictly between 0 and 1", d, d > 0.0 && d < 1.0)?;
        require("gamma2", NON_NEGATIVE, v.gamma2, v.gamma2 >= 0.0 && v.gamma2.is_finite())?;
        require("cutoff_sigma", POSITIVE, v.cutoff_sigma, v.cutoff_sigma > 0.0 && v.cutoff_sigma.is_finite())?;
        require("bail_threshold", "not NaN", v.bail_threshold, !v.bail_threshold.is_nan())?;

        let a = &self.accept;
        if !a.use_log_odds && !a.use_overlap {
            return Err(ConfigError::NoVerificationMode);
        }
        if a.use_log_odds {
            require("log_odds_to_solve", "finite", a.log_odds_to_solve, a.log_odds_to_solve.is_finite())?;
            require("log_odds_to_keep", "finite", a.log_odds_to_keep, a.log_odds_to_keep.is_finite())?;
            if a.log_odds_to_keep > a.log_odds_to_solve {
                return Err(ConfigError::KeepAboveSolve {
                    keep: a.log_odds_to_keep,
                    solve: a.log_odds_to_solve,
                });
            }
        }
        if a.use_overlap {
            for (name, value) in [("overlap_to_keep", a.overlap_to_keep), ("overlap_to_solve", a.overlap_to_solve)] {
                require(name, "between 0 and 1", value, (0.0..=1.0).contains(&value))?;
            }
            if a.overlap_to_keep > a.overlap_to_solve {
                return Err(ConfigError::KeepAboveSolve {
                    keep: a.overlap_to_keep,
                    solve: a.overlap_to_solve,
                });
            }
        }

        let g = &self.agreement;
        require(
            "agreement tolerance_arcsec",
            POSITIVE,
            g.tolerance_arcsec,
            g.tolerance_arcsec > 0.0 && g.tolerance_arcsec.is_finite(),
        )?;
        require("agree_to_verify", "at least 1", g.agree_to_verify as f64, g.agree_to_verify >= 1)?;
        Ok(())
    }

    /// Number of field points the solver will look at.
    pub fn field_points_limit(&self, available: usize) -> usize {
        self.max_field_points.map_or(available, |m| m.min(available))
    }
}

// ── Candidates and results ──────────────────────────────────────────────────

/// A correspondence between a field quad and a reference quad, with its
/// fitted transform and, once verified, its score.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    /// Index the reference quad belongs to.
    pub index_id: u32,
    /// Reference quad id within that index.
    pub quad_id: usize,
    /// Field point indices, in the reference quad's label order.
    pub field: [usize; DIMQUADS],
    /// Reference star ids (index-local), in label order.
    pub stars: [usize; DIMQUADS],
    /// Squared code-space distance of the match.
    pub code_dist2: f64,
    pub wcs: TanWcs,
    /// Fitted pixel scale, arcsec/pixel.
    pub pixel_scale_arcsec: f64,
    /// The fit contains a reflection.
    pub flipped: bool,
    /// Sky position of the image center.
    pub center: [f64; 3],
    /// Sky position of pixel (0, 0).
    pub corner_min: [f64; 3],
    /// Sky position of pixel (width, height).
    pub corner_max: [f64; 3],
    /// Angular radius of the image, radians.
    pub radius_rad: f64,
    /// Best prefix log-odds from verification.
    pub log_odds: f64,
    pub n_match: usize,
    pub n_conflict: usize,
    pub n_distractor: usize,
    /// Field points scored.
    pub n_field: usize,
    /// Reference stars inside the image.
    pub n_ref: usize,
    /// `n_match / (n_match + n_conflict + n_distractor)`.
    pub overlap: f64,
    /// Verification stopped at the bail threshold.
    pub bailed: bool,
    /// Matched `(field point, reference star)` pairs, quad stars included.
    pub matches: Vec<(usize, usize)>,
}

impl MatchCandidate {
    /// An unverified candidate for a fitted transform.
    pub fn new(
        index_id: u32,
        quad_id: usize,
        field: [usize; DIMQUADS],
        stars: [usize; DIMQUADS],
        code_dist2: f64,
        wcs: TanWcs,
    ) -> Self {
        let [w, h] = wcs.image_size;
        let center = wcs.field_center_xyz();
        let corner_min = wcs.pixel_to_xyz(0.0, 0.0);
        let corner_max = wcs.pixel_to_xyz(w, h);
        let radius_rad = geom::angle_from_dist2(geom::dist2_3(center, corner_min))
            .max(geom::angle_from_dist2(geom::dist2_3(center, corner_max)));
        Self {
            index_id,
            quad_id,
            field,
            stars,
            code_dist2,
            pixel_scale_arcsec: wcs.pixel_scale_arcsec(),
            flipped: wcs.is_flipped(),
            wcs,
            center,
            corner_min,
            corner_max,
            radius_rad,
            log_odds: f64::NEG_INFINITY,
            n_match: 0,
            n_conflict: 0,
            n_distractor: 0,
            n_field: 0,
            n_ref: 0,
            overlap: 0.0,
            bailed: false,
            matches: Vec::new(),
        }
    }

    /// Copy verification results into the candidate.
    pub fn apply_verification(&mut self, v: verify::VerifyResult) {
        self.log_odds = v.log_odds;
        self.n_match = v.n_match;
        self.n_conflict = v.n_conflict;
        self.n_distractor = v.n_distractor;
        self.n_field = v.n_field;
        self.n_ref = v.n_ref;
        self.overlap = v.overlap();
        self.bailed = v.bailed;
        self.matches = v.matches;
    }
}

/// Per-field work counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolveCounters {
    /// Field points admitted.
    pub field_points_used: usize,
    /// Field quads whose codes were looked up.
    pub quads_tried: u64,
    /// Code-tree hits.
    pub quads_matched: u64,
    /// Hits whose fitted pixel scale was within bounds.
    pub quads_scaled_ok: u64,
    /// Candidates verified.
    pub num_verified: u64,
    /// Candidates that cleared the keep threshold.
    pub num_kept: u64,
}

/// Result of solving one field.
#[derive(Debug, Clone)]
pub struct SolveResult {
    pub status: SolveStatus,
    /// Winning candidate when solved, otherwise the best kept candidate, if any.
    pub best: Option<MatchCandidate>,
    /// `(index_id, quad_id)` of the candidates agreeing with `best`.
    pub agreeing: Vec<(u32, usize)>,
    pub counters: SolveCounters,
    /// Wall-clock time spent, milliseconds.
    pub solve_time_ms: f32,
}

impl SolveResult {
    pub(crate) fn failure(status: SolveStatus, solve_time_ms: f32) -> Self {
        Self {
            status,
            best: None,
            agreeing: Vec::new(),
            counters: SolveCounters::default(),
            solve_time_ms,
        }
    }

    pub fn is_solved(&self) -> bool {
        self.status == SolveStatus::Solved
    }

    /// Fitted projection of the solution. Only populated when solved.
    pub fn wcs(&self) -> Option<&TanWcs> {
        if self.is_solved() {
            self.best.as_ref().map(|c| &c.wcs)
        } else {
            None
        }
    }

    /// Pixel scale of the solution, arcsec/pixel.
    pub fn pixel_scale_arcsec(&self) -> Option<f64> {
        self.wcs().map(TanWcs::pixel_scale_arcsec)
    }

    /// Convert pixel coordinates to (RA, Dec) in degrees.
    ///
    /// Returns `None` if the solve was unsuccessful.
    pub fn pixel_to_world(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let (ra, dec) = self.wcs()?.pixel_to_radec(x, y);
        Some((ra.to_degrees().rem_euclid(360.0), dec.to_degrees()))
    }

    /// Convert (RA, Dec) in degrees to pixel coordinates.
    ///
    /// Returns `None` if unsolved or the point is in the opposite hemisphere.
    pub fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        self.wcs()?
            .radec_to_pixel(ra_deg.to_radians(), dec_deg.to_radians())
    }

    /// Field center, `(RA, Dec)` degrees, and radius in arcseconds.
    pub fn field_center(&self) -> Option<(f64, f64, f64)> {
        let wcs = self.wcs()?;
        let (ra, dec) = geom::xyz_to_radec(wcs.field_center_xyz());
        Some((
            ra.to_degrees(),
            dec.to_degrees(),
            rad_to_arcsec(wcs.field_radius_rad()),
        ))
    }
}

//! Solving a single field: drives the quad search and turns code hits into
//! fitted, verified and clustered candidates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use super::agreement::{AgreementClusterer, Footprint};
use super::code::DIMQUADS;
use super::fit::{fit_tan_wcs, max_residual_px};
use super::search::{Flow, QuadHit, QuadSearch, QuadVisitor};
use super::verify::verify_candidate;
use super::{MatchCandidate, SolveCounters, SolveResult, SolveStatus, SolverConfig};
use crate::field::Field;
use crate::index::IndexAccess;

/// Shared flag that asks running solves to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One field against a set of indexes.
///
/// The configuration is assumed to have passed [`SolverConfig::validate`].
pub struct SolveSession<'a, I: IndexAccess> {
    config: &'a SolverConfig,
    indexes: &'a [I],
    field: &'a Field,
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl<'a, I: IndexAccess> SolveSession<'a, I> {
    pub fn new(config: &'a SolverConfig, indexes: &'a [I], field: &'a Field) -> Self {
        Self {
            config,
            indexes,
            field,
            cancel: None,
            deadline: None,
        }
    }

    /// Stop with [`SolveStatus::Cancelled`] once `token` is set.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Stop with [`SolveStatus::Timeout`] at `deadline`, in addition to the
    /// per-field timeout of the configuration.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn run(self) -> SolveResult {
        let t0 = Instant::now();
        let config = self.config;
        let field = self.field;

        if let Err(e) = field.check() {
            warn!("Field {} skipped: {}", field.id, e);
            return SolveResult::failure(SolveStatus::Skipped, elapsed_ms(t0));
        }
        let n_points = config.field_points_limit(field.len());
        if n_points < DIMQUADS {
            debug!("Field {}: only {} points", field.id, n_points);
            return SolveResult::failure(SolveStatus::TooFew, elapsed_ms(t0));
        }

        let field_deadline = config
            .field_timeout_ms
            .map(|ms| t0 + Duration::from_millis(ms));
        let deadline = match (self.deadline, field_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut state = SearchState::new(
            config,
            self.indexes,
            field,
            n_points,
            self.cancel.as_ref(),
            deadline,
        );

        let mut search = QuadSearch::new(config, self.indexes, &field.points[..n_points]);
        while search.has_next() {
            if !state.keep_going() {
                break;
            }
            let flow = search.admit_next(&mut state);
            state.counters.field_points_used = search.admitted();
            if flow == Flow::Stop {
                break;
            }
        }

        let status = if state.solved.is_some() {
            SolveStatus::Solved
        } else {
            state.stop.unwrap_or(SolveStatus::NoMatch)
        };
        let result = state.finish(status, elapsed_ms(t0));

        match &result.best {
            Some(best) if result.is_solved() => info!(
                "Field {} solved: index {} quad {}, {:.3}\"/px, log-odds {:.1}, {} matches, {} agreeing, {:.1}ms",
                field.id,
                best.index_id,
                best.quad_id,
                best.pixel_scale_arcsec,
                best.log_odds,
                best.n_match,
                result.agreeing.len(),
                result.solve_time_ms
            ),
            _ => info!(
                "Field {}: {:?} after {} quads, {} matches, {} verified ({:.1}ms)",
                field.id,
                result.status,
                result.counters.quads_tried,
                result.counters.quads_matched,
                result.counters.num_verified,
                result.solve_time_ms
            ),
        }
        result
    }
}

/// A clustered candidate.
struct Entry {
    cand: MatchCandidate,
    /// Position of its index in the searched slice.
    index: usize,
    verified: bool,
}

/// Mutable per-field state; receives the quad search's events.
struct SearchState<'a, I: IndexAccess> {
    config: &'a SolverConfig,
    indexes: &'a [I],
    field: &'a Field,
    n_points: usize,
    cancel: Option<&'a CancelToken>,
    deadline: Option<Instant>,
    counters: SolveCounters,
    clusterer: AgreementClusterer,
    /// Clustered candidates, by clusterer id.
    entries: Vec<Entry>,
    best_kept: Option<usize>,
    solved: Option<usize>,
    stop: Option<SolveStatus>,
}

impl<'a, I: IndexAccess> SearchState<'a, I> {
    fn new(
        config: &'a SolverConfig,
        indexes: &'a [I],
        field: &'a Field,
        n_points: usize,
        cancel: Option<&'a CancelToken>,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            config,
            indexes,
            field,
            n_points,
            cancel,
            deadline,
            counters: SolveCounters::default(),
            clusterer: AgreementClusterer::new(config.agreement.tolerance_arcsec),
            entries: Vec::new(),
            best_kept: None,
            solved: None,
            stop: None,
        }
    }
}

impl<I: IndexAccess> SearchState<'_, I> {
    fn halt(&mut self, status: SolveStatus) -> Flow {
        self.stop.get_or_insert(status);
        Flow::Stop
    }

    /// Fit and check one hit, then cluster it.
    ///
    /// With `agree_to_verify == 1` a candidate is verified first and only
    /// kept candidates are clustered. Otherwise every fitted candidate is
    /// clustered, and verification waits until its group is large enough.
    fn consider(&mut self, hit: &QuadHit) -> Flow {
        let config = self.config;
        let indexes = self.indexes;
        let index = &indexes[hit.index];
        let index_id = index.properties().index_id;

        let ref_xyz = hit.stars.map(|s| index.star_position(s));
        let field_xy = hit.field.map(|f| self.field.points[f].xy());
        let wcs = match fit_tan_wcs(&ref_xyz, &field_xy, [self.field.width, self.field.height]) {
            Ok(wcs) => wcs,
            Err(e) => {
                trace!("Fit failed for index {} quad {}: {}", index_id, hit.quad_id, e);
                return Flow::Continue;
            }
        };

        let flipped = wcs.is_flipped();
        if flipped != hit.flipped || !config.parity.allows(flipped) {
            return Flow::Continue;
        }
        let scale = wcs.pixel_scale_arcsec();
        if scale < config.pixel_scale_lower_arcsec || scale > config.pixel_scale_upper_arcsec {
            trace!("Quad {}: pixel scale {:.3} out of bounds", hit.quad_id, scale);
            return Flow::Continue;
        }
        self.counters.quads_scaled_ok += 1;
        if let Some(max) = config.quad_residual_px {
            let residual = max_residual_px(&wcs, &ref_xyz, &field_xy);
            if !(residual <= max) {
                trace!("Quad {}: residual {:.2}px", hit.quad_id, residual);
                return Flow::Continue;
            }
        }

        let cand = MatchCandidate::new(index_id, hit.quad_id, hit.field, hit.stars, hit.code_dist2, wcs);
        self.entries.push(Entry {
            cand,
            index: hit.index,
            verified: false,
        });
        let m = self.entries.len() - 1;
        let threshold = config.agreement.agree_to_verify;
        if threshold <= 1 && !self.verify(m) {
            self.entries.pop();
            return Flow::Continue;
        }

        let (id, group_size) = self.clusterer.insert(Footprint::of(&self.entries[m].cand));
        if group_size < threshold {
            return Flow::Continue;
        }
        let members = self.clusterer.group_members(id);
        if threshold > 1 {
            trace!("Group of {} agrees; verifying its members", group_size);
        }
        for &k in &members {
            if !self.entries[k].verified {
                self.verify(k);
            }
        }
        let winner = members.into_iter().find(|&k| {
            let entry = &self.entries[k];
            entry.verified && config.accept.solves(&entry.cand)
        });
        if let Some(k) = winner {
            debug!("Group of {} agrees; candidate {} solves", group_size, k);
            self.solved = Some(k);
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Verify entry `m`. Returns whether it is kept.
    fn verify(&mut self, m: usize) -> bool {
        let config = self.config;
        let indexes = self.indexes;
        let entry = &mut self.entries[m];
        let index = &indexes[entry.index];
        let v = verify_candidate(index, self.field, self.n_points, &entry.cand, &config.verify);
        entry.cand.apply_verification(v);
        entry.verified = true;
        self.counters.num_verified += 1;

        let cand = &self.entries[m].cand;
        if !config.accept.keeps(cand) {
            trace!(
                "Index {} quad {}: log-odds {:.1}, overlap {:.2}, dropped",
                cand.index_id,
                cand.quad_id,
                cand.log_odds,
                cand.overlap
            );
            return false;
        }
        self.counters.num_kept += 1;
        debug!(
            "Kept index {} quad {} (field {:?}): scale {:.3}\"/px, log-odds {:.1}, {} match / {} conflict / {} distractor",
            cand.index_id,
            cand.quad_id,
            cand.field,
            cand.pixel_scale_arcsec,
            cand.log_odds,
            cand.n_match,
            cand.n_conflict,
            cand.n_distractor
        );
        let better = self
            .best_kept
            .map_or(true, |b| cand.log_odds > self.entries[b].cand.log_odds);
        if better {
            self.best_kept = Some(m);
        }
        true
    }

    fn finish(mut self, status: SolveStatus, solve_time_ms: f32) -> SolveResult {
        let chosen = self.solved.or(self.best_kept);
        let agreeing = chosen.map_or_else(Vec::new, |c| {
            self.clusterer
                .group_members(c)
                .into_iter()
                .filter(|&m| m != c)
                .map(|m| {
                    let fp = self.clusterer.footprint(m);
                    (fp.index_id, fp.quad_id)
                })
                .collect()
        });
        let best = chosen.map(|c| self.entries.swap_remove(c).cand);
        SolveResult {
            status,
            best,
            agreeing,
            counters: self.counters,
            solve_time_ms,
        }
    }
}

impl<I: IndexAccess> QuadVisitor for SearchState<'_, I> {
    fn keep_going(&mut self) -> bool {
        if self.stop.is_some() {
            return false;
        }
        if self.cancel.is_some_and(CancelToken::is_cancelled) {
            self.halt(SolveStatus::Cancelled);
            return false;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            self.halt(SolveStatus::Timeout);
            return false;
        }
        true
    }

    fn visit_quad(&mut self) -> Flow {
        if let Some(max) = self.config.max_quads {
            if self.counters.quads_tried >= max {
                debug!("Quad limit {} reached", max);
                return self.halt(SolveStatus::NoMatch);
            }
        }
        self.counters.quads_tried += 1;
        Flow::Continue
    }

    fn visit_hit(&mut self, hit: &QuadHit) -> Flow {
        if let Some(max) = self.config.max_matches {
            if self.counters.quads_matched >= max {
                debug!("Match limit {} reached", max);
                return self.halt(SolveStatus::NoMatch);
            }
        }
        self.counters.quads_matched += 1;
        self.consider(hit)
    }
}

fn elapsed_ms(t0: Instant) -> f32 {
    t0.elapsed().as_secs_f32() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldPoint;
    use crate::index::builder::BuildIndexConfig;
    use crate::index::ReferenceIndex;
    use crate::wcs::TanWcs;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn truth() -> TanWcs {
        let s = (3.0f64 / 3600.0).to_radians();
        let (sn, cs) = 0.5f64.sin_cos();
        TanWcs {
            crval: [1.2, 0.4],
            crpix: [400.0, 300.0],
            cd: [[s * cs, -s * sn], [s * sn, s * cs]],
            image_size: [800.0, 600.0],
        }
    }

    fn random_pixels(n: usize, seed: u64) -> Vec<FieldPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| FieldPoint::new(rng.gen_range(0.0..800.0), rng.gen_range(0.0..600.0)))
            .collect()
    }

    fn index_for(points: &[FieldPoint]) -> ReferenceIndex {
        let wcs = truth();
        let stars: Vec<[f64; 3]> = points.iter().map(|p| wcs.pixel_to_xyz(p.x, p.y)).collect();
        let ids = (0..stars.len() as u64).collect();
        let config = BuildIndexConfig {
            index_id: 7,
            scale_lower_arcsec: 150.0,
            scale_upper_arcsec: 1500.0,
            ..Default::default()
        };
        ReferenceIndex::generate(&config, stars, ids).unwrap()
    }

    fn solve(config: &SolverConfig, index: &ReferenceIndex, points: Vec<FieldPoint>) -> SolveResult {
        let field = Field::new(1, points, 800.0, 600.0);
        SolveSession::new(config, std::slice::from_ref(index), &field).run()
    }

    #[test]
    fn solves_exact_field() {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let result = solve(&SolverConfig::new(2.0, 4.0), &index, points);
        assert_eq!(result.status, SolveStatus::Solved);
        let best = result.best.as_ref().unwrap();
        assert!((best.pixel_scale_arcsec - 3.0).abs() < 1e-3);
        assert!(!best.flipped);
        assert!(best.n_match >= 10, "{} matches", best.n_match);
        // Every correspondence is the identity.
        assert!(best.matches.iter().all(|&(f, s)| f == s));
        let c = result.counters;
        assert!(c.quads_tried >= 1 && c.quads_matched >= 1 && c.num_verified >= 1 && c.num_kept >= 1);
        assert!(c.field_points_used >= 4 && c.field_points_used <= 40);
    }

    #[test]
    fn too_few_points() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let result = solve(&SolverConfig::new(2.0, 4.0), &index, points[..3].to_vec());
        assert_eq!(result.status, SolveStatus::TooFew);
        assert!(result.best.is_none());
    }

    #[test]
    fn unrelated_field_does_not_solve() {
        let index = index_for(&random_pixels(40, 11));
        let result = solve(&SolverConfig::new(2.0, 4.0), &index, random_pixels(40, 99));
        assert_eq!(result.status, SolveStatus::NoMatch);
        assert!(result.wcs().is_none());
        assert!(result.counters.quads_tried > 0);
    }

    #[test]
    fn cancelled_before_start() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let field = Field::new(1, points, 800.0, 600.0);
        let token = CancelToken::new();
        token.cancel();
        let config = SolverConfig::new(2.0, 4.0);
        let result = SolveSession::new(&config, std::slice::from_ref(&index), &field)
            .with_cancel(token)
            .run();
        assert_eq!(result.status, SolveStatus::Cancelled);
        assert_eq!(result.counters.quads_tried, 0);
    }

    #[test]
    fn past_deadline_times_out() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let field = Field::new(1, points, 800.0, 600.0);
        let config = SolverConfig::new(2.0, 4.0);
        let result = SolveSession::new(&config, std::slice::from_ref(&index), &field)
            .with_deadline(Instant::now())
            .run();
        assert_eq!(result.status, SolveStatus::Timeout);
    }

    #[test]
    fn quad_limit_stops_search() {
        let index = index_for(&random_pixels(40, 11));
        let config = SolverConfig {
            max_quads: Some(25),
            ..SolverConfig::new(2.0, 4.0)
        };
        let result = solve(&config, &index, random_pixels(40, 99));
        assert_eq!(result.status, SolveStatus::NoMatch);
        assert_eq!(result.counters.quads_tried, 25);
    }

    #[test]
    fn corroboration_reports_agreeing_quads() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let mut config = SolverConfig::new(2.0, 4.0);
        config.agreement.agree_to_verify = 2;
        let result = solve(&config, &index, points);
        assert_eq!(result.status, SolveStatus::Solved);
        assert!(!result.agreeing.is_empty());
        assert!(result.agreeing.iter().all(|&(i, _)| i == 7));
        assert!(result.counters.num_kept >= 2);
    }

    #[test]
    fn stopped_search_reports_best_so_far() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let mut config = SolverConfig::new(2.0, 4.0);
        // Kept candidates can never solve, so the match limit ends the search.
        config.accept.log_odds_to_solve = 1e6;
        config.max_matches = Some(10);
        let result = solve(&config, &index, points);
        assert_eq!(result.status, SolveStatus::NoMatch);
        assert_eq!(result.counters.quads_matched, 10);
        assert!(result.counters.num_kept >= 1);
        let best = result.best.as_ref().unwrap();
        assert!(best.log_odds >= config.accept.log_odds_to_keep);
        assert!((best.pixel_scale_arcsec - 3.0).abs() < 1e-3);
        assert!(result.wcs().is_none());
    }

    #[test]
    fn agreement_gates_verification() {
        let index = index_for(&random_pixels(40, 11));
        let mut config = SolverConfig::new(2.0, 4.0);
        let eager = solve(&config, &index, random_pixels(40, 99));
        config.agreement.agree_to_verify = 2;
        let gated = solve(&config, &index, random_pixels(40, 99));
        assert_eq!(gated.status, SolveStatus::NoMatch);
        assert_eq!(gated.counters.num_verified, 0);
        assert_eq!(gated.counters.quads_scaled_ok, eager.counters.quads_scaled_ok);
    }

    #[test]
    fn weak_member_still_corroborates() {
        let points = random_pixels(40, 11);
        let index = index_for(&points);
        let ab = |q: usize| {
            let s = index.quad_stars(q);
            (points[s[0]].x - points[s[1]].x).hypot(points[s[0]].y - points[s[1]].y)
        };
        let mut quads: Vec<usize> = (0..index.num_quads()).collect();
        quads.sort_by(|&a, &b| ab(b).total_cmp(&ab(a)));
        let strong = quads[0];
        let strong_stars = index.quad_stars(strong);
        let weak = *quads[1..]
            .iter()
            .find(|&&q| index.quad_stars(q).iter().all(|s| !strong_stars.contains(s)))
            .unwrap();
        assert!(ab(weak) > 200.0, "weak AB {}", ab(weak));

        // Shift the weak quad's points so its own fit misplaces the rest of the field.
        let mut moved = points.clone();
        let weak_stars = index.quad_stars(weak);
        let cx = weak_stars.iter().map(|&s| points[s].x).sum::<f64>() / 4.0;
        let dx = if cx < 400.0 { 80.0 } else { -80.0 };
        for &s in &weak_stars {
            moved[s].x += dx;
        }
        let field = Field::new(1, moved, 800.0, 600.0);

        let mut config = SolverConfig::new(2.0, 4.0);
        config.agreement.agree_to_verify = 2;
        config.agreement.tolerance_arcsec = 600.0;
        let indexes = std::slice::from_ref(&index);
        let mut state = SearchState::new(&config, indexes, &field, field.len(), None, None);
        let hit = |q: usize| {
            let stars = index.quad_stars(q);
            QuadHit {
                index: 0,
                quad_id: q,
                field: stars,
                stars,
                code_dist2: 0.0,
                flipped: false,
            }
        };

        assert_eq!(state.consider(&hit(weak)), Flow::Continue);
        assert_eq!(state.counters.num_verified, 0);
        assert_eq!(state.consider(&hit(strong)), Flow::Stop);
        assert_eq!(state.counters.num_verified, 2);
        assert_eq!(state.counters.num_kept, 1);
        let weak_cand = &state.entries[0].cand;
        assert!(!config.accept.keeps(weak_cand), "weak log-odds {}", weak_cand.log_odds);

        let result = state.finish(SolveStatus::Solved, 0.0);
        assert_eq!(result.best.as_ref().unwrap().quad_id, strong);
        assert_eq!(result.agreeing, vec![(7, weak)]);
    }
}

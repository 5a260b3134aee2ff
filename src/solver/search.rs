//! Incremental enumeration of field quads and code-tree lookup.
//!
//! Field points are admitted one at a time. When point N arrives:
//!
//! 1. N becomes the B end of a new pair with every earlier point A whose
//!    separation is within the scale bounds. The pair's eligible set is
//!    seeded with every earlier point inside its box, and all interior
//!    combinations of that set are tried.
//! 2. N is offered to every older pair as an interior point. A pair that
//!    accepts it tries only the interior combinations containing N.
//!
//! So every combination is tried exactly once. Each quad's code is probed
//! under every relabeling (and mirror parity, if enabled) that the target
//! index's canonical form allows.

use tracing::trace;

use super::code::{
    code_from_interior, mirror, Code, PairFrame, RELABELINGS, DIMQUADS, NUM_INTERIOR,
};
use super::combinations::InteriorCombinations;
use super::{SolverConfig, CODE_NOISE_GAIN};
use crate::field::FieldPoint;
use crate::index::IndexAccess;
use crate::kdtree::Neighbor;

/// Whether the search should continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// A code-tree hit, with labels aligned to the reference quad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadHit {
    /// Position of the index in the searched slice.
    pub index: usize,
    pub quad_id: usize,
    /// Field point indices in reference label order.
    pub field: [usize; DIMQUADS],
    /// Reference star ids in label order.
    pub stars: [usize; DIMQUADS],
    pub code_dist2: f64,
    /// The hit was found with the mirrored code.
    pub flipped: bool,
}

/// Receives the search's events and decides when it stops.
pub trait QuadVisitor {
    /// Polled at the entry of every pair enumeration.
    fn keep_going(&mut self) -> bool;

    /// Called once for each field quad before its codes are looked up.
    fn visit_quad(&mut self) -> Flow;

    /// Called for every code-tree hit.
    fn visit_hit(&mut self, hit: &QuadHit) -> Flow;
}

/// Squared pixel bounds on AB for one index.
#[derive(Debug, Clone, Copy)]
struct IndexBounds {
    min_ab2: f64,
    max_ab2: f64,
    /// `(index_jitter / index_scale_lower)²`.
    index_noise2: f64,
}

#[derive(Debug, Clone)]
struct Pair {
    a: usize,
    b: usize,
    frame: PairFrame,
    /// Interior candidates, ascending.
    eligible: Vec<usize>,
}

/// Per-field search state.
pub struct QuadSearch<'a, I: IndexAccess> {
    config: &'a SolverConfig,
    indexes: &'a [I],
    points: &'a [FieldPoint],
    bounds: Vec<IndexBounds>,
    min_ab2: f64,
    max_ab2: f64,
    pairs: Vec<Pair>,
    admitted: usize,
    combo_buf: Vec<usize>,
    hits: Vec<Neighbor>,
}

impl<'a, I: IndexAccess> QuadSearch<'a, I> {
    /// `points` should already be truncated to the points the solver may use.
    pub fn new(config: &'a SolverConfig, indexes: &'a [I], points: &'a [FieldPoint]) -> Self {
        let lo = config.pixel_scale_lower_arcsec;
        let hi = config.pixel_scale_upper_arcsec;
        let floor2 = config.min_quad_size_px * config.min_quad_size_px;
        let bounds: Vec<IndexBounds> = indexes
            .iter()
            .map(|index| {
                let p = index.properties();
                let min_ab = p.scale_lower_arcsec / hi * (1.0 - config.code_tol).max(0.0);
                let max_ab = p.scale_upper_arcsec / lo * (1.0 + config.code_tol);
                let noise = p.jitter_arcsec / p.scale_lower_arcsec;
                IndexBounds {
                    min_ab2: (min_ab * min_ab).max(floor2),
                    max_ab2: max_ab * max_ab,
                    index_noise2: noise * noise,
                }
            })
            .collect();
        let min_ab2 = bounds.iter().map(|b| b.min_ab2).fold(f64::INFINITY, f64::min);
        let max_ab2 = bounds.iter().map(|b| b.max_ab2).fold(0.0, f64::max);
        trace!(
            "Quad search over {} points, AB in [{:.1}, {:.1}] px",
            points.len(),
            min_ab2.sqrt(),
            max_ab2.sqrt()
        );
        Self {
            config,
            indexes,
            points,
            bounds,
            min_ab2,
            max_ab2,
            pairs: Vec::new(),
            admitted: 0,
            combo_buf: Vec::with_capacity(points.len()),
            hits: Vec::new(),
        }
    }

    /// Points admitted so far.
    pub fn admitted(&self) -> usize {
        self.admitted
    }

    /// Field points still to be admitted?
    pub fn has_next(&self) -> bool {
        self.admitted < self.points.len()
    }

    /// Admit the next field point and try every quad it completes.
    pub fn admit_next<V: QuadVisitor>(&mut self, visitor: &mut V) -> Flow {
        let n = self.admitted;
        if n >= self.points.len() {
            return Flow::Stop;
        }
        self.admitted += 1;
        let margin = self.config.code_tol;
        let shape = self.config.in_box;
        let old_pairs = self.pairs.len();

        // N as B of new pairs.
        let pn = self.points[n].xy();
        for a in 0..n {
            let Some(frame) = PairFrame::new(self.points[a].xy(), pn) else {
                continue;
            };
            let ab2 = frame.scale();
            if ab2 < self.min_ab2 || ab2 > self.max_ab2 {
                continue;
            }
            let eligible: Vec<usize> = (0..n)
                .filter(|&c| c != a && shape.contains(frame.project(self.points[c].xy()), margin))
                .collect();
            self.pairs.push(Pair {
                a,
                b: n,
                frame,
                eligible,
            });
            if self.enumerate(self.pairs.len() - 1, false, visitor) == Flow::Stop {
                return Flow::Stop;
            }
        }

        // N as an interior point of older pairs.
        for pi in 0..old_pairs {
            let pair = &mut self.pairs[pi];
            if !shape.contains(pair.frame.project(pn), margin) {
                continue;
            }
            pair.eligible.push(n);
            if self.enumerate(pi, true, visitor) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Try the interior combinations of pair `pi`; with `newest_only`, only
    /// those containing the pair's last eligible point.
    fn enumerate<V: QuadVisitor>(&mut self, pi: usize, newest_only: bool, visitor: &mut V) -> Flow {
        if !visitor.keep_going() {
            return Flow::Stop;
        }
        if self.pairs[pi].eligible.len() < NUM_INTERIOR {
            return Flow::Continue;
        }
        let mut buf = std::mem::take(&mut self.combo_buf);
        buf.clear();
        buf.extend_from_slice(&self.pairs[pi].eligible);
        let combos = if newest_only {
            InteriorCombinations::<NUM_INTERIOR>::with_last(&buf)
        } else {
            InteriorCombinations::<NUM_INTERIOR>::all(&buf)
        };
        let mut flow = Flow::Continue;
        for interior in combos {
            if self.try_quad(pi, interior, visitor) == Flow::Stop {
                flow = Flow::Stop;
                break;
            }
        }
        self.combo_buf = buf;
        flow
    }

    fn try_quad<V: QuadVisitor>(
        &mut self,
        pi: usize,
        interior: [usize; NUM_INTERIOR],
        visitor: &mut V,
    ) -> Flow {
        if visitor.visit_quad() == Flow::Stop {
            return Flow::Stop;
        }
        let Pair { a, b, frame, .. } = self.pairs[pi];
        let [c, d] = interior;
        let code = code_from_interior(
            frame.project(self.points[c].xy()),
            frame.project(self.points[d].xy()),
        );
        let field = [a, b, c, d];
        let ab2 = frame.scale();

        for &flipped in self.config.parity.flips() {
            let base = if flipped { mirror(&code) } else { code };
            for (ii, index) in self.indexes.iter().enumerate() {
                let bounds = self.bounds[ii];
                if ab2 < bounds.min_ab2 || ab2 > bounds.max_ab2 {
                    continue;
                }
                let tol2 = self.tolerance2(ab2, &bounds);
                let slack = tol2.sqrt();
                let canonical = index.properties().canonical();
                for relabel in &RELABELINGS {
                    let probe: Code = relabel.apply_code(&base);
                    if !canonical.admits(&probe, slack) {
                        continue;
                    }
                    index.search_codes(&probe, tol2, &mut self.hits);
                    let labels = relabel.apply_stars(&field);
                    for &(quad_id, code_dist2) in &self.hits {
                        let hit = QuadHit {
                            index: ii,
                            quad_id,
                            field: labels,
                            stars: index.quad_stars(quad_id),
                            code_dist2,
                            flipped,
                        };
                        if visitor.visit_hit(&hit) == Flow::Stop {
                            return Flow::Stop;
                        }
                    }
                }
            }
        }
        Flow::Continue
    }

    /// Squared code-space radius for a pair with squared length `ab2` pixels.
    fn tolerance2(&self, ab2: f64, bounds: &IndexBounds) -> f64 {
        let t = self.config.code_tol;
        if !self.config.adaptive_tolerance {
            return t * t;
        }
        let j = self.config.field_jitter_px;
        t * t + CODE_NOISE_GAIN * (j * j / ab2 + bounds.index_noise2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::arcsec_to_rad;
    use crate::index::builder::BuildIndexConfig;
    use crate::index::ReferenceIndex;
    use crate::solver::code::InBoxShape;
    use crate::solver::Parity;
    use crate::wcs::TanWcs;

    /// Counts quads and records hits.
    #[derive(Default)]
    struct Recorder {
        quads: usize,
        hits: Vec<QuadHit>,
        stop_after_hits: Option<usize>,
    }

    impl QuadVisitor for Recorder {
        fn keep_going(&mut self) -> bool {
            true
        }

        fn visit_quad(&mut self) -> Flow {
            self.quads += 1;
            Flow::Continue
        }

        fn visit_hit(&mut self, hit: &QuadHit) -> Flow {
            self.hits.push(*hit);
            match self.stop_after_hits {
                Some(n) if self.hits.len() >= n => Flow::Stop,
                _ => Flow::Continue,
            }
        }
    }

    fn run<I: IndexAccess>(config: &SolverConfig, indexes: &[I], points: &[FieldPoint], rec: &mut Recorder) {
        let mut search = QuadSearch::new(config, indexes, points);
        while search.has_next() {
            if search.admit_next(rec) == Flow::Stop {
                break;
            }
        }
    }

    fn grid_points(n: usize) -> Vec<FieldPoint> {
        (0..n)
            .map(|i| FieldPoint::new(37.0 * i as f64 % 200.0, 53.0 * (i * i) as f64 % 170.0))
            .collect()
    }

    fn one_quad_index(points: &[FieldPoint], quad: [u32; 4], flip: bool) -> ReferenceIndex {
        let s = arcsec_to_rad(2.0);
        let p = if flip { -1.0 } else { 1.0 };
        let wcs = TanWcs {
            crval: [0.7, 0.3],
            crpix: [100.0, 100.0],
            cd: [[s * p, 0.0], [0.0, s]],
            image_size: [200.0, 200.0],
        };
        let stars: Vec<[f64; 3]> = points.iter().map(|q| wcs.pixel_to_xyz(q.x, q.y)).collect();
        let ids = (0..stars.len() as u64).collect();
        let config = BuildIndexConfig {
            scale_lower_arcsec: 20.0,
            scale_upper_arcsec: 800.0,
            ..Default::default()
        };
        ReferenceIndex::from_quads(&config, stars, ids, vec![quad]).unwrap()
    }

    fn search_config() -> SolverConfig {
        SolverConfig {
            min_quad_size_px: 1.0,
            adaptive_tolerance: false,
            ..SolverConfig::new(1.0, 4.0)
        }
    }

    #[test]
    fn every_combination_is_tried_once() {
        // The margin makes every box cover the whole field.
        let config = SolverConfig {
            in_box: InBoxShape::Square,
            code_tol: 10.0,
            ..search_config()
        };
        let points = grid_points(7);
        let index = one_quad_index(&points, [0, 1, 2, 3], false);
        let mut rec = Recorder::default();
        run(&config, &[index], &points, &mut rec);
        // Every pair, times C(n-2, 2) interiors.
        let n = points.len();
        let pairs = n * (n - 1) / 2;
        let interiors = (n - 2) * (n - 3) / 2;
        assert_eq!(rec.quads, pairs * interiors);
    }

    #[test]
    fn finds_the_indexed_quad() {
        let points = grid_points(9);
        let quad = [0, 4, 2, 7];
        let index = one_quad_index(&points, quad, false);
        let mut rec = Recorder::default();
        run(&search_config(), &[index], &points, &mut rec);
        let stored = rec.hits.first().map(|h| h.stars).unwrap_or_default();
        assert!(rec
            .hits
            .iter()
            .any(|h| h.quad_id == 0 && h.field == h.stars && !h.flipped));
        assert!(stored.iter().all(|s| quad.contains(&(*s as u32))));
    }

    #[test]
    fn mirrored_field_needs_flipped_parity() {
        let points = grid_points(9);
        let index = one_quad_index(&points, [0, 4, 2, 7], true);

        let normal = SolverConfig {
            parity: Parity::Normal,
            ..search_config()
        };
        let mut rec = Recorder::default();
        run(&normal, std::slice::from_ref(&index), &points, &mut rec);
        assert!(!rec.hits.iter().any(|h| h.field == h.stars));

        let both = SolverConfig {
            parity: Parity::Both,
            ..search_config()
        };
        let mut rec = Recorder::default();
        run(&both, &[index], &points, &mut rec);
        assert!(rec.hits.iter().any(|h| h.field == h.stars && h.flipped));
    }

    #[test]
    fn visitor_can_stop_the_search() {
        let points = grid_points(9);
        let index = one_quad_index(&points, [0, 4, 2, 7], false);
        let config = SolverConfig {
            code_tol: 10.0,
            ..search_config()
        };
        let mut rec = Recorder {
            stop_after_hits: Some(3),
            ..Default::default()
        };
        run(&config, &[index], &points, &mut rec);
        assert_eq!(rec.hits.len(), 3);
    }
}

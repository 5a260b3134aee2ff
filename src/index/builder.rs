//! Index construction from an already-curated star list.
//!
//! Stars are expected in priority order (brightest first). Quads are either
//! supplied explicitly or generated brightest-first: for each star A, each
//! partner B within the scale bounds contributes one quad from the two
//! brightest stars inside the AB box. There is no deduplication of close
//! stars and no sky partitioning.

use std::collections::HashSet;

use tracing::{debug, info};

use super::{IndexProperties, ReferenceIndex};
use crate::error::IndexError;
use crate::geom::{self, dist2_from_angle};
use crate::kdtree::{KdTree, Neighbor};
use crate::solver::code::{sky_code, Canonical, InBoxShape, PairFrame, DIMQUADS, NUM_INTERIOR};

/// Parameters controlling index construction.
#[derive(Debug, Clone)]
pub struct BuildIndexConfig {
    /// Identifier stored in the index properties.
    pub index_id: u32,
    /// Smallest AB separation, arcseconds.
    pub scale_lower_arcsec: f64,
    /// Largest AB separation, arcseconds.
    pub scale_upper_arcsec: f64,
    /// Catalog positional noise, arcseconds. Default 1.0.
    pub jitter_arcsec: f64,
    /// Store codes with `Cx <= Dx`. Default true.
    pub cx_le_dx: bool,
    /// Store codes with mean interior x at most 1/2. Default true.
    pub meanx_le_half: bool,
    /// Maximum number of quads any one star may belong to. Default 8.
    pub quads_per_star: u32,
    /// Stop after this many quads. None = no limit.
    pub max_quads: Option<usize>,
}

impl Default for BuildIndexConfig {
    fn default() -> Self {
        Self {
            index_id: 0,
            scale_lower_arcsec: 60.0,
            scale_upper_arcsec: 600.0,
            jitter_arcsec: 1.0,
            cx_le_dx: true,
            meanx_le_half: true,
            quads_per_star: 8,
            max_quads: None,
        }
    }
}

impl ReferenceIndex {
    /// Build an index from stars and explicit quads.
    ///
    /// Codes are computed in the tangent plane at each quad's AB midpoint
    /// and the quad's labels are reordered into the configured canonical
    /// form. The scale-bound fields of `config` are taken as given.
    pub fn from_quads(
        config: &BuildIndexConfig,
        stars: Vec<[f64; 3]>,
        star_ids: Vec<u64>,
        quads: Vec<[u32; DIMQUADS]>,
    ) -> Result<Self, IndexError> {
        let canonical = Canonical {
            cx_le_dx: config.cx_le_dx,
            meanx_le_half: config.meanx_le_half,
        };
        let mut stored = Vec::with_capacity(quads.len());
        let mut codes = Vec::with_capacity(quads.len());
        for (qi, quad) in quads.into_iter().enumerate() {
            if let Some(&star) = quad.iter().find(|&&s| s as usize >= stars.len()) {
                return Err(IndexError::StarOutOfRange {
                    index_id: config.index_id,
                    quad: qi,
                    star,
                    num_stars: stars.len(),
                });
            }
            let xyz = quad.map(|s| stars[s as usize]);
            let mut code = sky_code(&xyz).ok_or(IndexError::DegenerateQuad {
                index_id: config.index_id,
                quad: qi,
            })?;
            let mut labels = quad;
            canonical.enforce(&mut code, &mut labels);
            stored.push(labels);
            codes.push(code);
        }

        let props = IndexProperties {
            index_id: config.index_id,
            num_stars: stars.len() as u32,
            num_quads: stored.len() as u32,
            quad_size: DIMQUADS as u32,
            scale_lower_arcsec: config.scale_lower_arcsec,
            scale_upper_arcsec: config.scale_upper_arcsec,
            jitter_arcsec: config.jitter_arcsec,
            cx_le_dx: config.cx_le_dx,
            meanx_le_half: config.meanx_le_half,
        };
        ReferenceIndex::new(props, stars, star_ids, stored, codes)
    }

    /// Generate quads brightest-first and build an index from them.
    pub fn generate(
        config: &BuildIndexConfig,
        stars: Vec<[f64; 3]>,
        star_ids: Vec<u64>,
    ) -> Result<Self, IndexError> {
        info!(
            "Generating quads for index {} from {} stars, scale {:.1}-{:.1} arcsec",
            config.index_id,
            stars.len(),
            config.scale_lower_arcsec,
            config.scale_upper_arcsec
        );
        let quads = generate_quads(&stars, config);
        info!("Generated {} quads", quads.len());
        Self::from_quads(config, stars, star_ids, quads)
    }
}

/// Brightest-first quad generation.
///
/// Pairs (A, B) are visited in star order with B after A; each pair whose
/// separation lies within the scale bounds takes the two brightest stars
/// strictly inside its unit box as C and D.
pub fn generate_quads(stars: &[[f64; 3]], config: &BuildIndexConfig) -> Vec<[u32; DIMQUADS]> {
    let tree = KdTree::build(stars.to_vec(), super::INDEX_TREE_LEAF_SIZE);
    let lower2 = dist2_from_angle(geom::arcsec_to_rad(config.scale_lower_arcsec));
    let upper2 = dist2_from_angle(geom::arcsec_to_rad(config.scale_upper_arcsec));
    let cap = config.quads_per_star.max(1);
    let max_quads = config.max_quads.unwrap_or(usize::MAX);

    let mut uses = vec![0u32; stars.len()];
    let mut seen: HashSet<[u32; DIMQUADS]> = HashSet::new();
    let mut quads = Vec::new();
    let mut partners: Vec<Neighbor> = Vec::new();
    let mut inside: Vec<Neighbor> = Vec::new();
    let mut candidates: Vec<usize> = Vec::new();

    for a in 0..stars.len() {
        if quads.len() >= max_quads {
            break;
        }
        tree.range_search(&stars[a], upper2, &mut partners);
        partners.sort_unstable_by_key(|n| n.0);
        for &(b, d2) in partners.iter() {
            if uses[a] >= cap || quads.len() >= max_quads {
                break;
            }
            if b <= a || d2 < lower2 || uses[b] >= cap {
                continue;
            }
            let Some(mid) = geom::star_midpoint(stars[a], stars[b]) else {
                continue;
            };
            // The box lies within the circle on AB.
            tree.range_search(&mid, 0.25 * d2 * 1.0001, &mut inside);
            let (Some(pa), Some(pb)) = (
                geom::star_coords(stars[a], mid),
                geom::star_coords(stars[b], mid),
            ) else {
                continue;
            };
            let Some(frame) = PairFrame::new([pa.0, pa.1], [pb.0, pb.1]) else {
                continue;
            };
            candidates.clear();
            for &(c, _) in inside.iter() {
                if c == a || c == b || uses[c] >= cap {
                    continue;
                }
                if let Some((x, y)) = geom::star_coords(stars[c], mid) {
                    if InBoxShape::Square.contains(frame.project([x, y]), 0.0) {
                        candidates.push(c);
                    }
                }
            }
            candidates.sort_unstable();

            // Star ids are in brightness order, so the first two are the brightest.
            if candidates.len() >= NUM_INTERIOR {
                let quad = [a as u32, b as u32, candidates[0] as u32, candidates[1] as u32];
                let mut key = quad;
                key.sort_unstable();
                if seen.insert(key) {
                    for &s in &quad {
                        uses[s as usize] += 1;
                    }
                    quads.push(quad);
                }
            }
        }
    }
    debug!("Quad generation: {} stars saturated", uses.iter().filter(|&&u| u >= cap).count());
    quads
}

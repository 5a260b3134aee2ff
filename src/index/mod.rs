//! Reference index: catalog star positions, quads, their codes, and the two
//! k-d trees built over them.
//!
//! An index is loaded once and then shared read-only by every solve. The
//! solver and verifier reach it only through the [`IndexAccess`] trait.

pub mod builder;
pub mod store;

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::IndexError;
use crate::geom::arcsec_to_rad;
use crate::kdtree::{KdTree, Neighbor};
use crate::solver::code::{Canonical, Code, DIMQUADS};

/// Leaf size used for both index trees.
pub const INDEX_TREE_LEAF_SIZE: usize = 8;

/// Descriptive metadata for one reference index.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct IndexProperties {
    /// Identifier unique among the indexes loaded in one session.
    pub index_id: u32,
    /// Number of stars.
    pub num_stars: u32,
    /// Number of quads.
    pub num_quads: u32,
    /// Stars per quad. Only 4 is supported.
    pub quad_size: u32,
    /// Smallest AB separation of any quad, arcseconds.
    pub scale_lower_arcsec: f64,
    /// Largest AB separation of any quad, arcseconds.
    pub scale_upper_arcsec: f64,
    /// Assumed positional noise of the catalog, arcseconds.
    pub jitter_arcsec: f64,
    /// Stored codes satisfy `Cx <= Dx`.
    pub cx_le_dx: bool,
    /// Stored codes satisfy `(Cx + Dx) / 2 <= 1/2`.
    pub meanx_le_half: bool,
}

impl IndexProperties {
    pub fn scale_lower_rad(&self) -> f64 {
        arcsec_to_rad(self.scale_lower_arcsec)
    }

    pub fn scale_upper_rad(&self) -> f64 {
        arcsec_to_rad(self.scale_upper_arcsec)
    }

    pub fn jitter_rad(&self) -> f64 {
        arcsec_to_rad(self.jitter_arcsec)
    }

    /// Canonicalization rules the stored codes obey.
    pub fn canonical(&self) -> Canonical {
        Canonical {
            cx_le_dx: self.cx_le_dx,
            meanx_le_half: self.meanx_le_half,
        }
    }
}

/// Read-only capabilities the solver and verifier need from an index.
pub trait IndexAccess: Sync {
    fn properties(&self) -> &IndexProperties;

    fn num_stars(&self) -> usize;

    fn num_quads(&self) -> usize;

    /// Unit vector of star `id`.
    fn star_position(&self, id: usize) -> [f64; 3];

    /// External catalog identifier of star `id`.
    fn star_id(&self, id: usize) -> u64;

    /// Star ids of quad `quad`, in code order `(A, B, C, D)`.
    fn quad_stars(&self, quad: usize) -> [usize; DIMQUADS];

    /// Quads whose code lies within `tol2` (squared) of `code`.
    fn search_codes(&self, code: &Code, tol2: f64, out: &mut Vec<Neighbor>);

    /// Stars within chord distance² `radius2` of `center`.
    fn stars_within(&self, center: [f64; 3], radius2: f64, out: &mut Vec<Neighbor>);
}

/// An in-memory reference index.
#[derive(Debug, Clone)]
pub struct ReferenceIndex {
    props: IndexProperties,
    stars: Vec<[f64; 3]>,
    star_ids: Vec<u64>,
    quads: Vec<[u32; DIMQUADS]>,
    codes: Vec<Code>,
    star_tree: KdTree<3>,
    code_tree: KdTree<4>,
}

impl ReferenceIndex {
    /// Validate the flat arrays and build both trees.
    pub fn new(
        props: IndexProperties,
        stars: Vec<[f64; 3]>,
        star_ids: Vec<u64>,
        quads: Vec<[u32; DIMQUADS]>,
        codes: Vec<Code>,
    ) -> Result<Self, IndexError> {
        let id = props.index_id;
        if props.quad_size as usize != DIMQUADS {
            return Err(IndexError::QuadSize {
                index_id: id,
                found: props.quad_size,
                expected: DIMQUADS as u32,
            });
        }
        let counts = [
            ("star", stars.len(), props.num_stars as usize),
            ("star id", star_ids.len(), stars.len()),
            ("quad", quads.len(), props.num_quads as usize),
            ("code", codes.len(), quads.len()),
        ];
        for (what, found, expected) in counts {
            if found != expected {
                return Err(IndexError::CountMismatch {
                    index_id: id,
                    what,
                    found,
                    expected,
                });
            }
        }
        let lower = props.scale_lower_arcsec;
        let upper = props.scale_upper_arcsec;
        if !(lower > 0.0 && lower <= upper && upper.is_finite()) {
            return Err(IndexError::ScaleBounds {
                index_id: id,
                lower,
                upper,
            });
        }
        if !(props.jitter_arcsec >= 0.0 && props.jitter_arcsec.is_finite()) {
            return Err(IndexError::NonFinite {
                index_id: id,
                what: "jitter",
                item: 0,
            });
        }
        if let Some(i) = stars.iter().position(|s| !s.iter().all(|c| c.is_finite())) {
            return Err(IndexError::NonFinite {
                index_id: id,
                what: "star",
                item: i,
            });
        }
        if let Some(i) = codes.iter().position(|c| !c.iter().all(|v| v.is_finite())) {
            return Err(IndexError::NonFinite {
                index_id: id,
                what: "code",
                item: i,
            });
        }
        for (qi, quad) in quads.iter().enumerate() {
            if let Some(&star) = quad.iter().find(|&&s| s as usize >= stars.len()) {
                return Err(IndexError::StarOutOfRange {
                    index_id: id,
                    quad: qi,
                    star,
                    num_stars: stars.len(),
                });
            }
            for i in 0..DIMQUADS {
                if quad[i + 1..].contains(&quad[i]) {
                    return Err(IndexError::DegenerateQuad {
                        index_id: id,
                        quad: qi,
                    });
                }
            }
        }

        let star_tree = KdTree::build(stars.clone(), INDEX_TREE_LEAF_SIZE);
        let code_tree = KdTree::build(codes.clone(), INDEX_TREE_LEAF_SIZE);
        Ok(Self {
            props,
            stars,
            star_ids,
            quads,
            codes,
            star_tree,
            code_tree,
        })
    }

    pub fn stars(&self) -> &[[f64; 3]] {
        &self.stars
    }

    pub fn star_ids(&self) -> &[u64] {
        &self.star_ids
    }

    pub fn quads(&self) -> &[[u32; DIMQUADS]] {
        &self.quads
    }

    pub fn codes(&self) -> &[Code] {
        &self.codes
    }
}

impl IndexAccess for ReferenceIndex {
    fn properties(&self) -> &IndexProperties {
        &self.props
    }

    fn num_stars(&self) -> usize {
        self.stars.len()
    }

    fn num_quads(&self) -> usize {
        self.quads.len()
    }

    #[inline]
    fn star_position(&self, id: usize) -> [f64; 3] {
        self.stars[id]
    }

    #[inline]
    fn star_id(&self, id: usize) -> u64 {
        self.star_ids[id]
    }

    #[inline]
    fn quad_stars(&self, quad: usize) -> [usize; DIMQUADS] {
        self.quads[quad].map(|s| s as usize)
    }

    fn search_codes(&self, code: &Code, tol2: f64, out: &mut Vec<Neighbor>) {
        self.code_tree.range_search(code, tol2, out);
    }

    fn stars_within(&self, center: [f64; 3], radius2: f64, out: &mut Vec<Neighbor>) {
        self.star_tree.range_search(&center, radius2, out);
    }
}

/// Check that a set of indexes can be searched together.
pub fn check_index_set<I: IndexAccess>(indexes: &[I]) -> Result<(), IndexError> {
    if indexes.is_empty() {
        return Err(IndexError::NoIndexes);
    }
    for (i, a) in indexes.iter().enumerate() {
        let id = a.properties().index_id;
        if indexes[..i].iter().any(|b| b.properties().index_id == id) {
            return Err(IndexError::DuplicateId(id));
        }
    }
    Ok(())
}

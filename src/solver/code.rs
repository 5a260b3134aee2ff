//! Quad codes: the similarity-invariant descriptor of a 4-star quad.
//!
//! Two of the four stars, A and B, define a local frame in which A sits at
//! the origin and B at (1, 1). The other two stars, C and D, must fall
//! inside the acceptance region of that frame; their frame coordinates
//! `[Cx, Cy, Dx, Dy]` form the code.
//!
//! Labeling ambiguity is resolved with a small table of relabelings (AB
//! order × interior order). Mirror parity is a separate transform that
//! swaps the x/y channel of each interior point.

/// Stars per quad.
pub const DIMQUADS: usize = 4;

/// Length of a quad code.
pub const DIMCODES: usize = 2 * (DIMQUADS - 2);

/// Interior stars per quad.
pub const NUM_INTERIOR: usize = DIMQUADS - 2;

/// Squared AB baselines at or below this are treated as degenerate.
pub const MIN_QUAD_SCALE2: f64 = 1e-24;

pub type Code = [f64; DIMCODES];

// ── Acceptance region ───────────────────────────────────────────────────────

/// Shape of the region interior stars must fall into, in the AB frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InBoxShape {
    /// The unit square with A and B on opposite corners.
    #[default]
    Square,
    /// The circle with AB as its diameter.
    Circle,
}

impl InBoxShape {
    /// Is the frame position `p` inside the region expanded by `margin`?
    #[inline]
    pub fn contains(self, p: [f64; 2], margin: f64) -> bool {
        match self {
            InBoxShape::Square => {
                p[0] >= -margin && p[0] <= 1.0 + margin && p[1] >= -margin && p[1] <= 1.0 + margin
            }
            InBoxShape::Circle => {
                let dx = p[0] - 0.5;
                let dy = p[1] - 0.5;
                let r = std::f64::consts::FRAC_1_SQRT_2 + margin;
                dx * dx + dy * dy <= r * r
            }
        }
    }
}

// ── Pair frame ──────────────────────────────────────────────────────────────

/// Local frame of a diagonal pair (A, B).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairFrame {
    origin: [f64; 2],
    cos_t: f64,
    sin_t: f64,
    scale: f64,
}

impl PairFrame {
    /// Frame with `a` at (0, 0) and `b` at (1, 1). `None` for a degenerate pair.
    #[inline]
    pub fn new(a: [f64; 2], b: [f64; 2]) -> Option<Self> {
        let abx = b[0] - a[0];
        let aby = b[1] - a[1];
        let scale = abx * abx + aby * aby;
        if !(scale > MIN_QUAD_SCALE2) || !scale.is_finite() {
            return None;
        }
        Some(Self {
            origin: a,
            cos_t: (aby + abx) / scale,
            sin_t: (aby - abx) / scale,
            scale,
        })
    }

    /// Squared AB distance in the input units.
    #[inline]
    pub fn scale(&self) -> f64 {
        self.scale
    }

    #[inline]
    pub fn project(&self, p: [f64; 2]) -> [f64; 2] {
        let dx = p[0] - self.origin[0];
        let dy = p[1] - self.origin[1];
        [
            dx * self.cos_t + dy * self.sin_t,
            -dx * self.sin_t + dy * self.cos_t,
        ]
    }
}

// ── Code transforms ─────────────────────────────────────────────────────────

/// Code of the same quad with A and B exchanged.
#[inline]
pub fn swap_ab(code: &Code) -> Code {
    code.map(|v| 1.0 - v)
}

/// Code of the same quad with the interior stars exchanged.
#[inline]
pub fn swap_interior(code: &Code) -> Code {
    [code[2], code[3], code[0], code[1]]
}

/// Code of the mirror image of the quad.
#[inline]
pub fn mirror(code: &Code) -> Code {
    [code[1], code[0], code[3], code[2]]
}

#[inline]
pub fn code_dist2(a: &Code, b: &Code) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Code from frame positions of the interior stars.
#[inline]
pub fn code_from_interior(c: [f64; 2], d: [f64; 2]) -> Code {
    [c[0], c[1], d[0], d[1]]
}

/// Code of a planar quad `[A, B, C, D]`, or `None` if AB is degenerate.
pub fn compute_code(points: &[[f64; 2]; DIMQUADS]) -> Option<Code> {
    let frame = PairFrame::new(points[0], points[1])?;
    Some(code_from_interior(
        frame.project(points[2]),
        frame.project(points[3]),
    ))
}

// ── Labeling symmetry ───────────────────────────────────────────────────────

/// One relabeling of a quad: a permutation of the four labels that keeps
/// the AB pair on the diagonal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relabeling {
    /// New position `i` takes the star from old position `perm[i]`.
    pub perm: [usize; DIMQUADS],
    pub swaps_ab: bool,
    pub swaps_interior: bool,
}

impl Relabeling {
    #[inline]
    pub fn apply_code(&self, code: &Code) -> Code {
        let mut out = *code;
        if self.swaps_ab {
            out = swap_ab(&out);
        }
        if self.swaps_interior {
            out = swap_interior(&out);
        }
        out
    }

    #[inline]
    pub fn apply_stars<T: Copy>(&self, stars: &[T; DIMQUADS]) -> [T; DIMQUADS] {
        self.perm.map(|i| stars[i])
    }
}

/// The labeling symmetry group of a 4-star quad.
pub const RELABELINGS: [Relabeling; 4] = [
    Relabeling {
        perm: [0, 1, 2, 3],
        swaps_ab: false,
        swaps_interior: false,
    },
    Relabeling {
        perm: [0, 1, 3, 2],
        swaps_ab: false,
        swaps_interior: true,
    },
    Relabeling {
        perm: [1, 0, 2, 3],
        swaps_ab: true,
        swaps_interior: false,
    },
    Relabeling {
        perm: [1, 0, 3, 2],
        swaps_ab: true,
        swaps_interior: true,
    },
];

/// Canonicalization rules an index may guarantee for its stored codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Canonical {
    /// First interior x is no larger than the second.
    pub cx_le_dx: bool,
    /// Mean interior x is at most one half.
    pub meanx_le_half: bool,
}

impl Canonical {
    /// Could `code` match a canonical code within `slack`?
    #[inline]
    pub fn admits(&self, code: &Code, slack: f64) -> bool {
        if self.cx_le_dx && code[0] > code[2] + slack {
            return false;
        }
        if self.meanx_le_half && 0.5 * (code[0] + code[2]) > 0.5 + slack {
            return false;
        }
        true
    }

    /// Bring `code` and its star labels into canonical form.
    pub fn enforce<T: Copy>(&self, code: &mut Code, stars: &mut [T; DIMQUADS]) {
        if self.meanx_le_half && 0.5 * (code[0] + code[2]) > 0.5 {
            *code = swap_ab(code);
            stars.swap(0, 1);
        }
        if self.cx_le_dx && code[0] > code[2] {
            *code = swap_interior(code);
            stars.swap(2, 3);
        }
    }
}

/// Code of a sky quad, computed in the tangent plane at the AB midpoint.
///
/// `None` if the quad is degenerate or a star cannot be projected.
pub fn sky_code(stars: &[[f64; 3]; DIMQUADS]) -> Option<Code> {
    let mid = crate::geom::star_midpoint(stars[0], stars[1])?;
    let mut plane = [[0.0; 2]; DIMQUADS];
    for (p, s) in plane.iter_mut().zip(stars.iter()) {
        let (xi, eta) = crate::geom::star_coords(*s, mid)?;
        *p = [xi, eta];
    }
    compute_code(&plane)
}

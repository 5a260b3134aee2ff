//! Bulk-built k-d tree over fixed-dimension points.
//!
//! Used for three spatial indexes: reference-star unit vectors (D = 3),
//! reference-quad codes (D = 4) and, inside verification, reference stars
//! projected to pixel space (D = 2). The tree is read-only after `build`.
//!
//! Each node stores the bounding box of its points; leaves hold up to
//! `leaf_size` points. Splits are on the widest box dimension at the median.

/// A point id returned by a query together with its squared distance.
pub type Neighbor = (usize, f64);

#[derive(Debug, Clone)]
struct Node<const D: usize> {
    lo: [f64; D],
    hi: [f64; D],
    start: usize,
    end: usize,
    /// Indices of the left and right children, `None` for leaves.
    children: Option<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct KdTree<const D: usize> {
    points: Vec<[f64; D]>,
    perm: Vec<usize>,
    nodes: Vec<Node<D>>,
}

impl<const D: usize> KdTree<D> {
    /// Build a tree over `points`. Point ids are their positions in `points`.
    ///
    /// `leaf_size` is clamped to at least 1.
    pub fn build(points: Vec<[f64; D]>, leaf_size: usize) -> Self {
        let leaf_size = leaf_size.max(1);
        let mut perm: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::new();
        if !points.is_empty() {
            let n = points.len();
            Self::build_recursive(&points, &mut perm, 0, n, leaf_size, &mut nodes);
        }
        Self { points, perm, nodes }
    }

    fn build_recursive(
        points: &[[f64; D]],
        perm: &mut [usize],
        start: usize,
        end: usize,
        leaf_size: usize,
        nodes: &mut Vec<Node<D>>,
    ) -> usize {
        let mut lo = [f64::INFINITY; D];
        let mut hi = [f64::NEG_INFINITY; D];
        for &id in &perm[start..end] {
            let p = &points[id];
            for d in 0..D {
                lo[d] = lo[d].min(p[d]);
                hi[d] = hi[d].max(p[d]);
            }
        }

        let node_idx = nodes.len();
        nodes.push(Node {
            lo,
            hi,
            start,
            end,
            children: None,
        });

        if end - start <= leaf_size {
            return node_idx;
        }

        let split_dim = (0..D)
            .max_by(|&a, &b| (hi[a] - lo[a]).total_cmp(&(hi[b] - lo[b])))
            .unwrap_or(0);
        let mid = start + (end - start) / 2;
        perm[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a][split_dim]
                .total_cmp(&points[b][split_dim])
                .then(a.cmp(&b))
        });

        let left = Self::build_recursive(points, perm, start, mid, leaf_size, nodes);
        let right = Self::build_recursive(points, perm, mid, end, leaf_size, nodes);
        nodes[node_idx].children = Some((left, right));
        node_idx
    }

    /// Number of points in the tree.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Position of the point with the given id.
    pub fn point(&self, id: usize) -> &[f64; D] {
        &self.points[id]
    }

    /// All points within `radius2` (squared distance, inclusive) of `center`.
    ///
    /// `out` is cleared and refilled so callers can reuse the allocation across
    /// queries. Results are sorted by distance, ties by id.
    pub fn range_search(&self, center: &[f64; D], radius2: f64, out: &mut Vec<Neighbor>) {
        out.clear();
        if self.nodes.is_empty() || !(radius2 >= 0.0) {
            return;
        }
        self.range_recursive(0, center, radius2, out);
        out.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    }

    fn range_recursive(&self, node_idx: usize, center: &[f64; D], radius2: f64, out: &mut Vec<Neighbor>) {
        let node = &self.nodes[node_idx];
        if bbox_dist2(&node.lo, &node.hi, center) > radius2 {
            return;
        }
        match node.children {
            Some((left, right)) => {
                self.range_recursive(left, center, radius2, out);
                self.range_recursive(right, center, radius2, out);
            }
            None => {
                for &id in &self.perm[node.start..node.end] {
                    let d2 = point_dist2(&self.points[id], center);
                    if d2 <= radius2 {
                        out.push((id, d2));
                    }
                }
            }
        }
    }

    /// The nearest point within `radius2` of `point`, if any.
    ///
    /// Ties are broken toward the lower id so results are deterministic.
    pub fn nearest_within(&self, point: &[f64; D], radius2: f64) -> Option<Neighbor> {
        if self.nodes.is_empty() || !(radius2 >= 0.0) {
            return None;
        }
        let mut best: Option<Neighbor> = None;
        self.nearest_recursive(0, point, radius2, &mut best);
        best
    }

    fn nearest_recursive(
        &self,
        node_idx: usize,
        point: &[f64; D],
        radius2: f64,
        best: &mut Option<Neighbor>,
    ) {
        let node = &self.nodes[node_idx];
        let bound = best.map_or(radius2, |(_, d2)| d2);
        if bbox_dist2(&node.lo, &node.hi, point) > bound {
            return;
        }
        match node.children {
            Some((left, right)) => {
                let dl = bbox_dist2(&self.nodes[left].lo, &self.nodes[left].hi, point);
                let dr = bbox_dist2(&self.nodes[right].lo, &self.nodes[right].hi, point);
                let (first, second) = if dl <= dr { (left, right) } else { (right, left) };
                self.nearest_recursive(first, point, radius2, best);
                self.nearest_recursive(second, point, radius2, best);
            }
            None => {
                for &id in &self.perm[node.start..node.end] {
                    let d2 = point_dist2(&self.points[id], point);
                    if d2 > radius2 {
                        continue;
                    }
                    let better = match *best {
                        None => true,
                        Some((bid, bd2)) => d2 < bd2 || (d2 == bd2 && id < bid),
                    };
                    if better {
                        *best = Some((id, d2));
                    }
                }
            }
        }
    }
}

#[inline]
fn point_dist2<const D: usize>(a: &[f64; D], b: &[f64; D]) -> f64 {
    let mut s = 0.0;
    for d in 0..D {
        let t = a[d] - b[d];
        s += t * t;
    }
    s
}

/// Squared distance from `p` to the axis-aligned box `[lo, hi]` (zero inside).
#[inline]
fn bbox_dist2<const D: usize>(lo: &[f64; D], hi: &[f64; D], p: &[f64; D]) -> f64 {
    let mut s = 0.0;
    for d in 0..D {
        let t = if p[d] < lo[d] {
            lo[d] - p[d]
        } else if p[d] > hi[d] {
            p[d] - hi[d]
        } else {
            0.0
        };
        s += t * t;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_points() -> Vec<[f64; 2]> {
        let mut pts = Vec::new();
        for i in 0..20 {
            for j in 0..15 {
                pts.push([i as f64 * 1.5, j as f64 * 0.7 + (i % 3) as f64 * 0.1]);
            }
        }
        pts
    }

    fn brute_range(points: &[[f64; 2]], c: &[f64; 2], r2: f64) -> Vec<usize> {
        let mut v: Vec<usize> = points
            .iter()
            .enumerate()
            .filter(|(_, p)| point_dist2(p, c) <= r2)
            .map(|(i, _)| i)
            .collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn range_search_matches_brute_force() {
        let pts = grid_points();
        let tree = KdTree::build(pts.clone(), 4);
        let mut out = Vec::new();
        for &(c, r2) in &[([3.0, 2.0], 4.0), ([0.0, 0.0], 0.5), ([15.0, 5.0], 30.0)] {
            tree.range_search(&c, r2, &mut out);
            let mut got: Vec<usize> = out.iter().map(|n| n.0).collect();
            got.sort_unstable();
            assert_eq!(got, brute_range(&pts, &c, r2));
            for w in out.windows(2) {
                assert!(w[0].1 <= w[1].1);
            }
        }
    }

    #[test]
    fn nearest_within_matches_brute_force() {
        let pts = grid_points();
        let tree = KdTree::build(pts.clone(), 3);
        for q in [[2.2, 1.1], [28.0, 9.0], [-1.0, -1.0], [10.3, 4.4]] {
            let expected = pts
                .iter()
                .enumerate()
                .map(|(i, p)| (i, point_dist2(p, &q)))
                .filter(|&(_, d2)| d2 <= 2.0)
                .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            assert_eq!(tree.nearest_within(&q, 2.0), expected);
        }
    }

    #[test]
    fn empty_tree_queries() {
        let tree = KdTree::<3>::build(Vec::new(), 8);
        let mut out = vec![(1, 1.0)];
        tree.range_search(&[0.0, 0.0, 0.0], 1.0, &mut out);
        assert!(out.is_empty());
        assert!(tree.nearest_within(&[0.0, 0.0, 0.0], 1.0).is_none());
        assert!(tree.is_empty());
    }

    #[test]
    fn zero_radius_finds_exact_point() {
        let pts = vec![[0.1, 0.2, 0.3, 0.4], [0.5, 0.5, 0.5, 0.5], [0.1, 0.2, 0.3, 0.41]];
        let tree = KdTree::build(pts, 1);
        let mut out = Vec::new();
        tree.range_search(&[0.1, 0.2, 0.3, 0.4], 0.0, &mut out);
        assert_eq!(out, vec![(0, 0.0)]);
    }

    #[test]
    fn range_results_grow_with_radius() {
        let pts = grid_points();
        let tree = KdTree::build(pts, 5);
        let mut small = Vec::new();
        let mut large = Vec::new();
        tree.range_search(&[7.0, 3.0], 2.0, &mut small);
        tree.range_search(&[7.0, 3.0], 6.0, &mut large);
        for n in &small {
            assert!(large.iter().any(|m| m.0 == n.0));
        }
        assert!(large.len() > small.len());
    }
}

//! Combination enumerator for the incremental quad search.
//!
//! [`InteriorCombinations`] yields index-ordered `K`-combinations of a
//! pair's eligible interior points, either all of them or only those
//! containing the most recently admitted point, so a combination is never
//! produced twice across the incremental search.

/// Lazy, finite iterator over `K`-combinations of a sorted pool.
///
/// Positions are tracked in a fixed-size array; the pool is borrowed, so
/// the caller controls the one allocation behind it.
pub struct InteriorCombinations<'a, const K: usize> {
    pool: &'a [usize],
    /// Number of pool entries the free positions choose from.
    span: usize,
    /// Free positions; when `pin_last` the last slot is fixed to the pool's last entry.
    cursor: [usize; K],
    free: usize,
    pin_last: bool,
    done: bool,
}

impl<'a, const K: usize> InteriorCombinations<'a, K> {
    /// All `K`-combinations of `pool`.
    pub fn all(pool: &'a [usize]) -> Self {
        Self::make(pool, false)
    }

    /// The `K`-combinations of `pool` that contain its last entry.
    pub fn with_last(pool: &'a [usize]) -> Self {
        Self::make(pool, true)
    }

    fn make(pool: &'a [usize], pin_last: bool) -> Self {
        let (span, free) = if pin_last {
            (pool.len().saturating_sub(1), K.saturating_sub(1))
        } else {
            (pool.len(), K)
        };
        let mut cursor = [0usize; K];
        for (i, c) in cursor.iter_mut().enumerate().take(free) {
            *c = i;
        }
        let done = K == 0 || pool.is_empty() || free > span;
        Self {
            pool,
            span,
            cursor,
            free,
            pin_last,
            done,
        }
    }

    fn advance(&mut self) {
        // Rightmost position that can still move.
        let mut i = self.free;
        while i > 0 {
            i -= 1;
            if self.cursor[i] < self.span - self.free + i {
                self.cursor[i] += 1;
                for j in i + 1..self.free {
                    self.cursor[j] = self.cursor[j - 1] + 1;
                }
                return;
            }
        }
        self.done = true;
    }
}

impl<const K: usize> Iterator for InteriorCombinations<'_, K> {
    type Item = [usize; K];

    fn next(&mut self) -> Option<[usize; K]> {
        if self.done {
            return None;
        }
        let mut out = [0usize; K];
        for i in 0..self.free {
            out[i] = self.pool[self.cursor[i]];
        }
        if self.pin_last {
            out[K - 1] = self.pool[self.pool.len() - 1];
        }
        if self.free == 0 {
            self.done = true;
        } else {
            self.advance();
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_pairs_in_index_order() {
        let pool = [2, 5, 7, 9];
        let got: Vec<[usize; 2]> = InteriorCombinations::<2>::all(&pool).collect();
        assert_eq!(
            got,
            vec![[2, 5], [2, 7], [2, 9], [5, 7], [5, 9], [7, 9]]
        );
    }

    #[test]
    fn pinned_last_only_yields_new_combinations() {
        let pool = [1, 4, 6, 8];
        let got: Vec<[usize; 2]> = InteriorCombinations::<2>::with_last(&pool).collect();
        assert_eq!(got, vec![[1, 8], [4, 8], [6, 8]]);

        // Union of "all of the prefix" and "with last" is "all of the pool", without repeats.
        let mut union: Vec<[usize; 2]> = InteriorCombinations::<2>::all(&pool[..3]).collect();
        union.extend(got);
        let mut all: Vec<[usize; 2]> = InteriorCombinations::<2>::all(&pool).collect();
        union.sort_unstable();
        all.sort_unstable();
        assert_eq!(union, all);
    }

    #[test]
    fn triples_are_complete() {
        let pool: Vec<usize> = (0..6).collect();
        assert_eq!(InteriorCombinations::<3>::all(&pool).count(), 20);
        assert_eq!(InteriorCombinations::<3>::with_last(&pool).count(), 10);
    }

    #[test]
    fn too_small_pools_yield_nothing() {
        assert_eq!(InteriorCombinations::<2>::all(&[3]).count(), 0);
        assert_eq!(InteriorCombinations::<2>::with_last(&[3]).count(), 0);
        assert_eq!(InteriorCombinations::<2>::all(&[]).count(), 0);
        assert_eq!(InteriorCombinations::<1>::with_last(&[3]).collect::<Vec<_>>(), vec![[3]]);
    }
}

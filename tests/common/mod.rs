//! Synthetic skies and fields shared by the integration tests.

#![allow(dead_code)]

use quadsolve::{BuildIndexConfig, Field, FieldPoint, ReferenceIndex, TanWcs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub const WIDTH: f64 = 1024.0;
pub const HEIGHT: f64 = 768.0;
/// True pixel scale of every synthetic image, arcsec/pixel.
pub const SCALE_ARCSEC: f64 = 2.0;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
}

/// The projection used to place stars: rotation `theta` (radians), optional
/// mirror, image center at `(ra, dec)` radians.
pub fn truth_wcs(ra: f64, dec: f64, theta: f64, flipped: bool) -> TanWcs {
    let s = (SCALE_ARCSEC / 3600.0).to_radians();
    let (sn, cs) = theta.sin_cos();
    let m = if flipped { -1.0 } else { 1.0 };
    TanWcs {
        crval: [ra, dec],
        crpix: [WIDTH / 2.0, HEIGHT / 2.0],
        cd: [[m * s * cs, -s * sn], [m * s * sn, s * cs]],
        image_size: [WIDTH, HEIGHT],
    }
}

/// A patch of sky larger than the image, in catalog (brightness) order.
pub struct Sky {
    pub truth: TanWcs,
    pub stars: Vec<[f64; 3]>,
}

impl Sky {
    pub fn new(truth: TanWcs, n_stars: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let pad = 300.0;
        let stars = (0..n_stars)
            .map(|_| {
                let x = rng.gen_range(-pad..WIDTH + pad);
                let y = rng.gen_range(-pad..HEIGHT + pad);
                truth.pixel_to_xyz(x, y)
            })
            .collect();
        Self { truth, stars }
    }

    pub fn index(&self, index_id: u32) -> ReferenceIndex {
        let config = BuildIndexConfig {
            index_id,
            scale_lower_arcsec: 200.0,
            scale_upper_arcsec: 1200.0,
            ..Default::default()
        };
        let ids = (0..self.stars.len() as u64).map(|i| 10_000 + i).collect();
        ReferenceIndex::generate(&config, self.stars.clone(), ids).unwrap()
    }

    /// Pixel positions of the stars that land in the image, with the star ids.
    pub fn visible(&self) -> Vec<(usize, [f64; 2])> {
        self.stars
            .iter()
            .enumerate()
            .filter_map(|(i, &v)| {
                let (x, y) = self.truth.xyz_to_pixel(v)?;
                self.truth.contains_pixel(x, y, 0.0).then_some((i, [x, y]))
            })
            .collect()
    }

    /// A field with the first `k` visible stars (Gaussian noise of `noise_px`)
    /// and `n_distractors` uniform points, interleaved in random order.
    pub fn field(&self, k: usize, n_distractors: usize, noise_px: f64, seed: u64) -> Field {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut stars: Vec<FieldPoint> = self
            .visible()
            .into_iter()
            .take(k)
            .map(|(_, [x, y])| jitter(&mut rng, x, y, noise_px))
            .collect();
        stars.reverse();
        let mut points = Vec::with_capacity(stars.len() + n_distractors);
        let mut left = n_distractors;
        while !stars.is_empty() || left > 0 {
            let take_star = left == 0 || (!stars.is_empty() && rng.gen_bool(0.75));
            if take_star {
                if let Some(p) = stars.pop() {
                    points.push(p);
                }
            } else {
                points.push(FieldPoint::new(rng.gen_range(0.0..WIDTH), rng.gen_range(0.0..HEIGHT)));
                left -= 1;
            }
        }
        Field::new(seed, points, WIDTH, HEIGHT)
    }
}

fn jitter(rng: &mut StdRng, x: f64, y: f64, noise_px: f64) -> FieldPoint {
    if noise_px == 0.0 {
        return FieldPoint::new(x, y);
    }
    let normal = Normal::new(0.0, noise_px).unwrap();
    FieldPoint::new(x + normal.sample(rng), y + normal.sample(rng))
}

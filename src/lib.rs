//! # quadsolve
//!
//! Blind astrometric calibration by geometric hashing of 4-star quads.
//!
//! Given the pixel positions of sources detected in an image, ordered
//! brightest first, `quadsolve` finds where on the sky the image points and
//! returns a gnomonic (TAN) projection mapping pixels to (RA, Dec). No prior
//! pointing estimate is needed; only bounds on the pixel scale.
//!
//! ## Example
//!
//! ```no_run
//! use quadsolve::{Engine, EngineConfig, Field, FieldRecord, ReferenceIndex, SolverConfig};
//!
//! let index = ReferenceIndex::load_from_file("data/index-4107.rkyv").unwrap();
//! let config = SolverConfig::new(1.0, 3.0);
//! let engine = Engine::new(EngineConfig::default(), config, vec![index]).unwrap();
//!
//! let fields: Vec<Field> = vec![/* detected sources, brightest first */];
//! let mut records: Vec<FieldRecord> = Vec::new();
//! engine.run(&fields, &mut records).unwrap();
//! for record in &records {
//!     if let Some((ra, dec, radius)) = record.result.field_center() {
//!         println!("field {}: ({ra:.4}, {dec:.4}), radius {radius:.1}\"", record.field_num);
//!     }
//! }
//! ```
//!
//! ## Algorithm overview
//!
//! 1. **Quads**: four sources, two of which (A, B) span a frame holding the
//!    other two inside; the frame coordinates of C and D are a code
//!    invariant to translation, rotation and scale.
//! 2. **Lookup**: field quads are formed incrementally as sources are
//!    admitted, and their codes are looked up in each index's code tree.
//! 3. **Fit**: each hit gives four correspondences and a similarity TAN
//!    projection.
//! 4. **Verify**: the projection is scored against the whole field with a
//!    Bayesian foreground/background model.
//! 5. **Agree**: candidates whose footprints coincide corroborate each
//!    other; a corroborated candidate above the solve threshold ends the
//!    search.

pub mod engine;
pub mod error;
pub mod field;
pub mod geom;
pub mod index;
pub mod kdtree;
pub mod solver;
pub mod wcs;

pub use engine::{Engine, EngineConfig, FieldRecord, RunSummary, SolutionSink};
pub use error::{ConfigError, EngineError, FieldError, FitError, IndexError};
pub use field::{Field, FieldPoint, FieldSource};
pub use index::builder::BuildIndexConfig;
pub use index::{IndexAccess, IndexProperties, ReferenceIndex};
pub use solver::session::{CancelToken, SolveSession};
pub use solver::{
    AcceptConfig, AgreementConfig, MatchCandidate, Parity, SolveCounters, SolveResult,
    SolveStatus, SolverConfig, VerifyConfig,
};
pub use wcs::TanWcs;

//! Error types.
//!
//! Index and configuration errors are fatal at session start. Field and fit
//! errors are recoverable: the affected field or candidate is skipped.

use thiserror::Error;

/// Problems with a reference index: missing/corrupt data or inconsistent arrays.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index {index_id}: quad size {found} is not supported (expected {expected})")]
    QuadSize {
        index_id: u32,
        found: u32,
        expected: u32,
    },
    #[error("index {index_id}: {what} count mismatch ({found} found, {expected} expected)")]
    CountMismatch {
        index_id: u32,
        what: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("index {index_id}: quad {quad} references star {star} but only {num_stars} stars exist")]
    StarOutOfRange {
        index_id: u32,
        quad: usize,
        star: u32,
        num_stars: usize,
    },
    #[error("index {index_id}: invalid scale bounds [{lower}, {upper}] arcsec")]
    ScaleBounds { index_id: u32, lower: f64, upper: f64 },
    #[error("index {index_id}: non-finite value in {what} {item}")]
    NonFinite {
        index_id: u32,
        what: &'static str,
        item: usize,
    },
    #[error("index {index_id}: quad {quad} is degenerate")]
    DegenerateQuad { index_id: u32, quad: usize },
    #[error("duplicate index id {0}")]
    DuplicateId(u32),
    #[error("no reference index loaded")]
    NoIndexes,
}

/// Malformed session configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {requirement} (got {value})")]
    OutOfRange {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },
    #[error("pixel scale bounds are inverted: lower {lower} > upper {upper}")]
    ScaleBoundsInverted { lower: f64, upper: f64 },
    #[error("no verification criterion selected: enable log-odds and/or overlap acceptance")]
    NoVerificationMode,
    #[error("keep threshold {keep} exceeds solve threshold {solve}")]
    KeepAboveSolve { keep: f64, solve: f64 },
    #[error("worker thread count must be at least 1")]
    NoThreads,
}

/// A field that cannot be solved.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FieldError {
    #[error("field {0} is not present in the input")]
    Missing(usize),
    #[error("field could not be read: {0}")]
    Unreadable(String),
    #[error("field has invalid dimensions {width}x{height}")]
    BadDimensions { width: f64, height: f64 },
    #[error("field point {0} is not finite")]
    NonFinitePoint(usize),
}

/// Transform fit failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("at least {required} correspondences are required, got {found}")]
    TooFewCorrespondences { found: usize, required: usize },
    #[error("point set has zero variance")]
    ZeroVariance,
    #[error("reference point lies in the opposite hemisphere of the tangent point")]
    ProjectionFailed,
    #[error("singular value decomposition failed")]
    SvdFailed,
}

/// Anything that stops an engine from being created.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

//! Field input: the detected point positions of one image.
//!
//! Points are supplied by an external source extractor already ordered by
//! priority (brightest first). The solver admits them in exactly that order.

use crate::error::FieldError;

/// A detected source position in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldPoint {
    /// Position along image columns, pixels.
    pub x: f64,
    /// Position along image rows, pixels.
    pub y: f64,
}

impl FieldPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn xy(&self) -> [f64; 2] {
        [self.x, self.y]
    }
}

impl From<(f64, f64)> for FieldPoint {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// One field to be solved.
#[derive(Debug, Clone)]
pub struct Field {
    /// Caller-assigned identifier, carried through to the output record.
    pub id: u64,
    /// Detected positions, in solve order.
    pub points: Vec<FieldPoint>,
    /// Image width in pixels.
    pub width: f64,
    /// Image height in pixels.
    pub height: f64,
}

impl Field {
    pub fn new(id: u64, points: Vec<FieldPoint>, width: f64, height: f64) -> Self {
        Self {
            id,
            points,
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Image area in square pixels.
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Pixel coordinates of the image center.
    pub fn center(&self) -> (f64, f64) {
        (0.5 * self.width, 0.5 * self.height)
    }

    /// Half the image diagonal, in pixels.
    pub fn radius_px(&self) -> f64 {
        0.5 * self.width.hypot(self.height)
    }

    /// A field is usable when its dimensions are positive and finite and all
    /// points are finite.
    pub fn check(&self) -> Result<(), FieldError> {
        if !(self.width > 0.0 && self.height > 0.0 && self.area().is_finite()) {
            return Err(FieldError::BadDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if let Some(i) = self
            .points
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite()))
        {
            return Err(FieldError::NonFinitePoint(i));
        }
        Ok(())
    }
}

/// Supplier of fields to the batch engine.
///
/// Implementations are shared across worker threads, hence `Sync`.
/// `field` may fail for individual fields (absent or unreadable), which
/// skips that field without stopping the batch.
pub trait FieldSource: Sync {
    /// Number of fields available.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch field number `n` (0-based).
    fn field(&self, n: usize) -> Result<Field, FieldError>;
}

impl FieldSource for Vec<Field> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn field(&self, n: usize) -> Result<Field, FieldError> {
        self.get(n).cloned().ok_or(FieldError::Missing(n))
    }
}

impl FieldSource for [Field] {
    fn len(&self) -> usize {
        <[Field]>::len(self)
    }

    fn field(&self, n: usize) -> Result<Field, FieldError> {
        self.get(n).cloned().ok_or(FieldError::Missing(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_geometry() {
        let f = Field::new(7, vec![FieldPoint::new(1.0, 2.0)], 300.0, 400.0);
        assert_eq!(f.area(), 120_000.0);
        assert_eq!(f.center(), (150.0, 200.0));
        assert!((f.radius_px() - 250.0).abs() < 1e-12);
        assert!(f.check().is_ok());
    }

    #[test]
    fn bad_fields_are_reported() {
        let f = Field::new(0, vec![], 0.0, 10.0);
        assert!(matches!(f.check(), Err(FieldError::BadDimensions { .. })));

        let f = Field::new(0, vec![FieldPoint::new(f64::NAN, 0.0)], 10.0, 10.0);
        assert!(matches!(f.check(), Err(FieldError::NonFinitePoint(0))));
    }

    #[test]
    fn vec_source_reports_missing_fields() {
        let fields = vec![Field::new(3, vec![], 10.0, 10.0)];
        assert_eq!(FieldSource::len(&fields), 1);
        assert_eq!(fields.field(0).unwrap().id, 3);
        assert!(matches!(fields.field(1), Err(FieldError::Missing(1))));
    }
}

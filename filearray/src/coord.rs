//! Coordinate values.
//!
//! A [`Coord`] is an ordered sequence of values identifying positions along one
//! dimension of a dataset. Values are either numeric ([`Value::Float`]) or
//! strings ([`Value::Str`], used by the variable dimension). Numeric
//! coordinates are strictly ascending and compared with a per-coordinate
//! floating point tolerance; the variable dimension keeps discovery order.

use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Default tolerance for floating point value comparison.
pub const DEFAULT_TOLERANCE: f64 = 1e-5;

/// One coordinate value: a number or a string.
#[derive(Clone, Debug, PartialEq, PartialOrd, derive_more::From)]
pub enum Value {
    /// A numeric value (time as a timestamp, latitude in degrees, ...).
    Float(f64),
    /// A string value (a variable name).
    Str(String),
}

impl Value {
    /// Returns the numeric value, if this is a [`Value::Float`].
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Returns the string value, if this is a [`Value::Str`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Float(_) => None,
            Self::Str(s) => Some(s),
        }
    }

    /// Whether two values are equal within `tolerance`.
    ///
    /// Strings compare exactly; the tolerance only applies to floats.
    #[must_use]
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => (a - b).abs() <= tolerance,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Float(_), Self::Str(_)) | (Self::Str(_), Self::Float(_)) => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(v) => v.fmt(f),
            Self::Str(s) => s.fmt(f),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// A value not found in a coordinate.
#[derive(Clone, Debug, Error)]
#[error("value {value} not found in coordinate '{coord}' (tolerance {tolerance})")]
pub struct ValueNotFoundError {
    /// Coordinate name.
    pub coord: String,
    /// The value looked up.
    pub value: Value,
    /// Tolerance used for the lookup.
    pub tolerance: f64,
}

/// An ordered sequence of values along one dimension.
///
/// Owns the dimension name, unit, alternate in-file names, and the floating
/// point tolerance used when comparing its values.
#[derive(Clone, Debug)]
pub struct Coord {
    name: String,
    units: String,
    alternate_names: Vec<String>,
    tolerance: f64,
    values: Vec<Value>,
}

impl Coord {
    /// Create a new coordinate with no values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: String::new(),
            alternate_names: Vec::new(),
            tolerance: DEFAULT_TOLERANCE,
            values: Vec::new(),
        }
    }

    /// Set the unit of the coordinate values.
    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Add an alternate name used inside files.
    #[must_use]
    pub fn with_alternate_name(mut self, name: impl Into<String>) -> Self {
        self.alternate_names.push(name.into());
        self
    }

    /// Set the floating point comparison tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// The coordinate name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The unit of the coordinate values.
    #[must_use]
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Alternate names recognised for this coordinate.
    #[must_use]
    pub fn alternate_names(&self) -> &[String] {
        &self.alternate_names
    }

    /// The floating point comparison tolerance.
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// The coordinate values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// The number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the coordinate has no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Replace the coordinate values.
    pub fn set_values(&mut self, values: Vec<Value>) {
        self.values = values;
    }

    /// Index of `value` within the coordinate's own tolerance.
    ///
    /// # Errors
    /// Returns [`ValueNotFoundError`] if no value matches.
    pub fn index_of(&self, value: &Value) -> Result<usize, ValueNotFoundError> {
        self.index_of_with(value, self.tolerance)
    }

    /// Index of `value` within an explicit `tolerance`.
    ///
    /// # Errors
    /// Returns [`ValueNotFoundError`] if no value matches.
    pub fn index_of_with(
        &self,
        value: &Value,
        tolerance: f64,
    ) -> Result<usize, ValueNotFoundError> {
        self.values
            .iter()
            .position(|v| v.approx_eq(value, tolerance))
            .ok_or_else(|| ValueNotFoundError {
                coord: self.name.clone(),
                value: value.clone(),
                tolerance,
            })
    }

    /// Indices of all values falling in `[min, max]` (inclusive).
    #[must_use]
    pub fn subset_by_range(&self, min: f64, max: f64) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| match v.as_float() {
                Some(f) if f >= min - self.tolerance && f <= max + self.tolerance => Some(i),
                _ => None,
            })
            .collect()
    }

    /// A short `first..last (n)` description of the value extent.
    #[must_use]
    pub fn extent(&self) -> String {
        match (self.values.first(), self.values.last()) {
            (Some(first), Some(last)) => format!("{first}..{last} ({})", self.len()),
            _ => "empty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coord() -> Coord {
        let mut c = Coord::new("time").with_units("days").with_tolerance(1e-6);
        c.set_values(vec![1.0.into(), 2.0.into(), 3.5.into()]);
        c
    }

    #[test]
    fn value_approx_eq() {
        assert!(Value::Float(1.0).approx_eq(&Value::Float(1.0 + 1e-7), 1e-6));
        assert!(!Value::Float(1.0).approx_eq(&Value::Float(1.1), 1e-6));
        assert!(Value::Str("sst".into()).approx_eq(&Value::Str("sst".into()), 0.0));
        assert!(!Value::Float(1.0).approx_eq(&Value::Str("1".into()), 1.0));
    }

    #[test]
    fn index_lookup() {
        let c = coord();
        assert_eq!(c.index_of(&Value::Float(2.0)).unwrap(), 1);
        assert_eq!(c.index_of_with(&Value::Float(3.4), 0.2).unwrap(), 2);
        assert!(c.index_of(&Value::Float(9.0)).is_err());
    }

    #[test]
    fn range_subset() {
        let c = coord();
        assert_eq!(c.subset_by_range(1.5, 4.0), vec![1, 2]);
        assert!(c.subset_by_range(10.0, 20.0).is_empty());
    }

    #[test]
    fn extent_description() {
        assert_eq!(coord().extent(), "1..3.5 (3)");
        assert_eq!(Coord::new("depth").extent(), "empty");
    }
}

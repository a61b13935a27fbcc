//! Selection keys.
//!
//! A [`Key`] is the selection primitive for one dimension of an array: a
//! scalar index, a list of indices, a slice, the whole axis, or (for string
//! coordinates) one or more value names. A [`Keyring`](keyring::Keyring)
//! groups one key per dimension.
//!
//! Slices follow open/negative index semantics: `start`/`stop` may be
//! negative (counted from the end) or absent, and are resolved against a
//! parent size. A key optionally carries the size of the sequence it will be
//! applied to, which is required to resolve such slices exactly.

pub mod keyring;

use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::coord::Coord;

/// Errors from key construction or application.
#[derive(Clone, Debug, Error)]
pub enum KeyError {
    /// A slice with a zero step.
    #[error("slice step cannot be zero")]
    ZeroStep,
    /// A slice whose extent cannot be determined without a parent size.
    #[error("cannot resolve slice {0} without a parent size")]
    UndecidableSlice(SliceKey),
    /// An index beyond the sequence the key is applied to.
    #[error("index {index} out of bounds for length {len}")]
    OutOfBounds {
        /// The offending index.
        index: usize,
        /// Length of the indexed sequence.
        len: usize,
    },
    /// A full-axis key used without a known parent size.
    #[error("cannot enumerate a full-axis key without a parent size")]
    MissingParentSize,
    /// A name key used where integer indices are required.
    #[error("key holds names; resolve against a string coordinate first")]
    UnresolvedNames,
    /// A name absent from the backing string coordinate.
    #[error("name '{0}' not found in coordinate")]
    NameNotFound(String),
    /// A key selecting nothing where at least one element is required.
    #[error("key {0} selects no element")]
    EmptySelection(Key),
}

/// A slice over one dimension: `start`, `stop` (exclusive) and `step`.
///
/// `start` and `stop` may be negative (counted from the end of the parent
/// sequence) or `None` (open). `step` may be negative but not zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceKey {
    start: Option<isize>,
    stop: Option<isize>,
    step: isize,
}

impl Display for SliceKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.start {
            Some(start) => write!(f, "{start}:")?,
            None => write!(f, ":")?,
        }
        if let Some(stop) = self.stop {
            write!(f, "{stop}")?;
        }
        if self.step != 1 {
            write!(f, ":{}", self.step)?;
        }
        Ok(())
    }
}

impl SliceKey {
    /// Create a new slice.
    ///
    /// # Errors
    /// Returns [`KeyError::ZeroStep`] if `step` is zero.
    pub fn new(start: Option<isize>, stop: Option<isize>, step: isize) -> Result<Self, KeyError> {
        if step == 0 {
            return Err(KeyError::ZeroStep);
        }
        Ok(Self { start, stop, step })
    }

    /// The slice selecting a whole axis.
    #[must_use]
    pub fn full() -> Self {
        Self {
            start: None,
            stop: None,
            step: 1,
        }
    }

    /// Whether this slice selects a whole axis in order.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self.start, None | Some(0)) && self.stop.is_none() && self.step == 1
    }

    /// Start bound, if any.
    #[must_use]
    pub fn start(&self) -> Option<isize> {
        self.start
    }

    /// Stop bound (exclusive), if any.
    #[must_use]
    pub fn stop(&self) -> Option<isize> {
        self.stop
    }

    /// Step.
    #[must_use]
    pub fn step(&self) -> isize {
        self.step
    }

    /// Resolve against a sequence of length `len` into explicit indices.
    #[must_use]
    pub fn resolve(&self, len: usize) -> Vec<usize> {
        let len = len as isize;
        let norm = |bound: isize| -> isize {
            if bound < 0 {
                (bound + len).max(if self.step > 0 { 0 } else { -1 })
            } else {
                bound.min(if self.step > 0 { len } else { len - 1 })
            }
        };
        let (start, stop) = if self.step > 0 {
            (norm(self.start.unwrap_or(0)), norm(self.stop.unwrap_or(len)))
        } else {
            (
                norm(self.start.unwrap_or(len - 1)),
                match self.stop {
                    Some(stop) => norm(stop),
                    None => -1,
                },
            )
        };
        let mut indices = Vec::new();
        let mut i = start;
        while (self.step > 0 && i < stop) || (self.step < 0 && i > stop) {
            if (0..len).contains(&i) {
                indices.push(i as usize);
            }
            i += self.step;
        }
        indices
    }

    /// Number of elements selected from a sequence of length `len`.
    #[must_use]
    pub fn resolved_len(&self, len: usize) -> usize {
        self.resolve(len).len()
    }

    /// Best-effort element count without a parent size.
    ///
    /// Returns [`None`] when the count depends on the parent size (for
    /// instance an open slice).
    #[must_use]
    pub fn guess_len(&self) -> Option<usize> {
        self.guess_as_list().map(|l| l.len()).ok()
    }

    /// Best-effort conversion to an index list without a parent size.
    ///
    /// Only possible when both bounds are known and non-negative (or can be
    /// anchored at zero).
    ///
    /// # Errors
    /// Returns [`KeyError::UndecidableSlice`] when the indices depend on the
    /// parent size.
    pub fn guess_as_list(&self) -> Result<Vec<usize>, KeyError> {
        let undecidable = || KeyError::UndecidableSlice(self.clone());
        let (start, stop) = match (self.start, self.stop, self.step > 0) {
            (Some(start), Some(stop), _) if start >= 0 && stop >= 0 => (start, stop),
            (None, Some(stop), true) if stop >= 0 => (0, stop),
            (Some(start), None, false) if start >= 0 => (start, -1),
            _ => return Err(undecidable()),
        };
        let mut indices = Vec::new();
        let mut i = start;
        while (self.step > 0 && i < stop) || (self.step < 0 && i > stop) {
            indices.push(i as usize);
            i += self.step;
        }
        log::debug!("slice {self} resolved to {} indices by guessing", indices.len());
        Ok(indices)
    }

    /// Build a slice from a list of indices with constant stride.
    ///
    /// Returns [`None`] if `indices` has fewer than two elements or a
    /// non-constant stride.
    #[must_use]
    pub fn from_indices(indices: &[usize]) -> Option<Self> {
        if indices.len() < 2 {
            return None;
        }
        let step = indices[1] as isize - indices[0] as isize;
        if step == 0 {
            return None;
        }
        let constant = indices
            .windows(2)
            .all(|w| w[1] as isize - w[0] as isize == step);
        if !constant {
            return None;
        }
        let start = indices[0] as isize;
        let stop = indices[indices.len() - 1] as isize + step.signum();
        let stop = if stop < 0 { None } else { Some(stop) };
        Some(Self {
            start: Some(start),
            stop,
            step,
        })
    }

}

/// The shape of a key's selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyShape {
    /// Scalar key: the dimension is squeezed away.
    Scalar,
    /// The selection has this many elements.
    Len(usize),
    /// The element count cannot be determined without a parent size.
    Undecided,
}

/// One dimension's requested selection.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyValue {
    /// Select the whole axis.
    All,
    /// A single index: produces a scalar, the dimension is squeezed.
    Index(usize),
    /// An explicit list of indices.
    Indices(Vec<usize>),
    /// A slice.
    Slice(SliceKey),
    /// A single value name of a string coordinate.
    Name(String),
    /// A list of value names of a string coordinate.
    Names(Vec<String>),
}

/// A selection for one dimension, with an optional known parent size.
///
/// Keys are value objects: they are copied, never aliased.
#[derive(Clone, Debug, PartialEq)]
pub struct Key {
    value: KeyValue,
    parent_size: Option<usize>,
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            KeyValue::All => write!(f, ":"),
            KeyValue::Index(i) => write!(f, "{i}"),
            KeyValue::Indices(l) => write!(f, "{l:?}"),
            KeyValue::Slice(s) => write!(f, "{s}"),
            KeyValue::Name(n) => write!(f, "'{n}'"),
            KeyValue::Names(l) => write!(f, "{l:?}"),
        }
    }
}

impl From<usize> for Key {
    fn from(i: usize) -> Self {
        Self::index(i)
    }
}

impl From<Vec<usize>> for Key {
    fn from(l: Vec<usize>) -> Self {
        Self::indices(l)
    }
}

impl From<std::ops::Range<usize>> for Key {
    fn from(r: std::ops::Range<usize>) -> Self {
        Self::new(KeyValue::Slice(SliceKey {
            start: Some(r.start as isize),
            stop: Some(r.end as isize),
            step: 1,
        }))
    }
}

impl Key {
    /// Create a key from a raw [`KeyValue`].
    #[must_use]
    pub fn new(value: KeyValue) -> Self {
        Self {
            value,
            parent_size: None,
        }
    }

    /// Key selecting the whole axis.
    #[must_use]
    pub fn all() -> Self {
        Self::new(KeyValue::All)
    }

    /// Scalar index key.
    #[must_use]
    pub fn index(i: usize) -> Self {
        Self::new(KeyValue::Index(i))
    }

    /// Index list key.
    #[must_use]
    pub fn indices(l: Vec<usize>) -> Self {
        Self::new(KeyValue::Indices(l))
    }

    /// Slice key.
    ///
    /// # Errors
    /// Returns [`KeyError::ZeroStep`] if `step` is zero.
    pub fn slice(start: Option<isize>, stop: Option<isize>, step: isize) -> Result<Self, KeyError> {
        Ok(Self::new(KeyValue::Slice(SliceKey::new(start, stop, step)?)))
    }

    /// Scalar name key for a string coordinate.
    #[must_use]
    pub fn name(n: impl Into<String>) -> Self {
        Self::new(KeyValue::Name(n.into()))
    }

    /// Name list key for a string coordinate.
    #[must_use]
    pub fn names(l: Vec<String>) -> Self {
        Self::new(KeyValue::Names(l))
    }

    /// The key value.
    #[must_use]
    pub fn value(&self) -> &KeyValue {
        &self.value
    }

    /// Size of the sequence the key will be applied to, if known.
    #[must_use]
    pub fn parent_size(&self) -> Option<usize> {
        self.parent_size
    }

    /// Record the size of the sequence the key will be applied to.
    pub fn set_parent_size(&mut self, size: usize) {
        self.parent_size = Some(size);
    }

    /// Whether the key produces a scalar (squeezes its dimension).
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        matches!(self.value, KeyValue::Index(_) | KeyValue::Name(_))
    }

    /// Whether the key selects the whole axis in order.
    #[must_use]
    pub fn is_full(&self) -> bool {
        match &self.value {
            KeyValue::All => true,
            KeyValue::Slice(s) => s.is_full(),
            KeyValue::Index(_) | KeyValue::Indices(_) | KeyValue::Name(_) | KeyValue::Names(_) => {
                false
            }
        }
    }

    /// The shape of the selection.
    ///
    /// Scalar keys have shape [`KeyShape::Scalar`]. For slices without a
    /// parent size the length is estimated if possible, otherwise
    /// [`KeyShape::Undecided`].
    #[must_use]
    pub fn shape(&self) -> KeyShape {
        match &self.value {
            KeyValue::Index(_) | KeyValue::Name(_) => KeyShape::Scalar,
            KeyValue::Indices(l) => KeyShape::Len(l.len()),
            KeyValue::Names(l) => KeyShape::Len(l.len()),
            KeyValue::All => match self.parent_size {
                Some(n) => KeyShape::Len(n),
                None => KeyShape::Undecided,
            },
            KeyValue::Slice(s) => match self.parent_size {
                Some(n) => KeyShape::Len(s.resolved_len(n)),
                None => s.guess_len().map_or(KeyShape::Undecided, KeyShape::Len),
            },
        }
    }

    /// The key as an explicit index list.
    ///
    /// # Errors
    /// Returns an error for name keys, or for open slices and full-axis keys
    /// without a parent size.
    pub fn as_list(&self) -> Result<Vec<usize>, KeyError> {
        match &self.value {
            KeyValue::Index(i) => Ok(vec![*i]),
            KeyValue::Indices(l) => Ok(l.clone()),
            KeyValue::All => self
                .parent_size
                .map(|n| (0..n).collect())
                .ok_or(KeyError::MissingParentSize),
            KeyValue::Slice(s) => match self.parent_size {
                Some(n) => Ok(s.resolve(n)),
                None => s.guess_as_list(),
            },
            KeyValue::Name(_) | KeyValue::Names(_) => Err(KeyError::UnresolvedNames),
        }
    }

    /// Apply the key to a sequence, cloning the selected elements.
    ///
    /// Scalar keys return a one-element vector.
    ///
    /// # Errors
    /// Returns [`KeyError::OutOfBounds`] if an index exceeds the sequence.
    pub fn apply<T: Clone>(&self, seq: &[T]) -> Result<Vec<T>, KeyError> {
        let mut sized = self.clone();
        sized.set_parent_size(seq.len());
        let indices = sized.as_list()?;
        indices
            .into_iter()
            .map(|i| {
                seq.get(i).cloned().ok_or(KeyError::OutOfBounds {
                    index: i,
                    len: seq.len(),
                })
            })
            .collect()
    }

    /// Resolve name keys to index keys against a string coordinate.
    ///
    /// Integer keys are left unchanged; the parent size is set from the
    /// coordinate either way.
    ///
    /// # Errors
    /// Returns [`KeyError::NameNotFound`] if a name is absent.
    pub fn resolve_names(&mut self, coord: &Coord) -> Result<(), KeyError> {
        let lookup = |name: &str| -> Result<usize, KeyError> {
            coord
                .values()
                .iter()
                .position(|v| v.as_str() == Some(name))
                .ok_or_else(|| KeyError::NameNotFound(name.to_string()))
        };
        match &self.value {
            KeyValue::Name(n) => self.value = KeyValue::Index(lookup(n)?),
            KeyValue::Names(l) => {
                let indices = l.iter().map(|n| lookup(n)).collect::<Result<_, _>>()?;
                self.value = KeyValue::Indices(indices);
            }
            KeyValue::All
            | KeyValue::Index(_)
            | KeyValue::Indices(_)
            | KeyValue::Slice(_) => {}
        }
        self.parent_size = Some(coord.len());
        Ok(())
    }

    /// Convert index keys to name keys against a string coordinate.
    ///
    /// # Errors
    /// Returns [`KeyError::OutOfBounds`] if an index exceeds the coordinate.
    pub fn to_names(&mut self, coord: &Coord) -> Result<(), KeyError> {
        let lookup = |i: usize| -> Result<String, KeyError> {
            coord
                .values()
                .get(i)
                .and_then(crate::coord::Value::as_str)
                .map(str::to_string)
                .ok_or(KeyError::OutOfBounds {
                    index: i,
                    len: coord.len(),
                })
        };
        match self.value.clone() {
            KeyValue::Index(i) => self.value = KeyValue::Name(lookup(i)?),
            KeyValue::Indices(_) | KeyValue::Slice(_) | KeyValue::All => {
                let mut sized = self.clone();
                sized.set_parent_size(coord.len());
                let names = sized
                    .as_list()?
                    .into_iter()
                    .map(lookup)
                    .collect::<Result<_, _>>()?;
                self.value = KeyValue::Names(names);
            }
            KeyValue::Name(_) | KeyValue::Names(_) => {}
        }
        self.parent_size = Some(coord.len());
        Ok(())
    }

    /// Restrict this key by another expressed in this key's own index space.
    ///
    /// If `B = A[self]` and `C = B[other]` then `C = A[self.compose(other)]`.
    /// The result is scalar if either operand is scalar, a list if either is
    /// a list, otherwise a slice when the composed indices allow it.
    ///
    /// # Errors
    /// Returns an error if either key cannot be enumerated, or indices are
    /// out of bounds.
    pub fn compose(&self, other: &Self) -> Result<Self, KeyError> {
        if self.is_full() && self.parent_size.is_none() {
            return Ok(other.clone());
        }
        if other.is_full() {
            return Ok(self.clone());
        }
        let a = self.as_list()?;
        let out = other.apply(&a)?;
        if out.is_empty() {
            return Err(KeyError::EmptySelection(other.clone()));
        }
        let key = if self.is_scalar() || other.is_scalar() {
            Self::index(out[0])
        } else if matches!(self.value, KeyValue::Indices(_))
            || matches!(other.value(), KeyValue::Indices(_))
        {
            Self::indices(out)
        } else {
            let mut key = Self::indices(out);
            key.simplify();
            key
        };
        Ok(key)
    }

    /// Concatenate this key's selection with another over the same parent.
    ///
    /// If `B = A[self]` and `C = A[other]`, the result selects `B` then `C`.
    /// The result is a slice when either operand was a slice and the
    /// concatenation has constant stride, otherwise a list.
    ///
    /// # Errors
    /// Returns an error if either key cannot be enumerated.
    pub fn expand(&self, other: &Self) -> Result<Self, KeyError> {
        let mut out = self.as_list()?;
        out.extend(other.as_list()?);
        let mut key = Self::indices(out);
        if matches!(self.value, KeyValue::Slice(_) | KeyValue::All)
            || matches!(other.value(), KeyValue::Slice(_) | KeyValue::All)
        {
            key.simplify();
        }
        key.parent_size = self.parent_size.or(other.parent_size);
        Ok(key)
    }

    /// Rewrite an index list as an equivalent slice when the stride is
    /// constant.
    ///
    /// Slices are unambiguous and cheaper, and enable direct array access.
    pub fn simplify(&mut self) {
        if let KeyValue::Indices(l) = &self.value {
            if let Some(slice) = SliceKey::from_indices(l) {
                self.value = KeyValue::Slice(slice);
            }
        }
    }

    /// Mirror indices: `i -> size - 1 - i`.
    ///
    /// Used for empty scan results flagged as index-mirrored.
    ///
    /// # Errors
    /// Returns an error if the key cannot be enumerated against `size`.
    pub fn mirror(&mut self, size: usize) -> Result<(), KeyError> {
        let mirror_one = |i: usize| -> Result<usize, KeyError> {
            if i < size {
                Ok(size - 1 - i)
            } else {
                Err(KeyError::OutOfBounds {
                    index: i,
                    len: size,
                })
            }
        };
        match self.value.clone() {
            KeyValue::Index(i) => self.value = KeyValue::Index(mirror_one(i)?),
            KeyValue::Name(_) | KeyValue::Names(_) => return Err(KeyError::UnresolvedNames),
            KeyValue::Indices(_) | KeyValue::Slice(_) | KeyValue::All => {
                self.parent_size = Some(size);
                let mirrored = self
                    .as_list()?
                    .into_iter()
                    .map(mirror_one)
                    .collect::<Result<Vec<_>, _>>()?;
                self.value = KeyValue::Indices(mirrored);
                self.simplify();
            }
        }
        Ok(())
    }

    /// A copy with scalar keys promoted to one-element lists.
    ///
    /// Load and slice operations never squeeze; they use promoted keys.
    #[must_use]
    pub fn promote(&self) -> Self {
        let mut key = self.clone();
        match &key.value {
            KeyValue::Index(i) => key.value = KeyValue::Indices(vec![*i]),
            KeyValue::Name(n) => key.value = KeyValue::Names(vec![n.clone()]),
            KeyValue::All
            | KeyValue::Indices(_)
            | KeyValue::Slice(_)
            | KeyValue::Names(_) => {}
        }
        key
    }

    /// Squeeze a one-element list into a scalar key.
    ///
    /// Only direct array access requests squeezing.
    pub fn squeeze(&mut self) {
        match &self.value {
            KeyValue::Indices(l) if l.len() == 1 => self.value = KeyValue::Index(l[0]),
            KeyValue::Names(l) if l.len() == 1 => self.value = KeyValue::Name(l[0].clone()),
            KeyValue::All
            | KeyValue::Index(_)
            | KeyValue::Indices(_)
            | KeyValue::Slice(_)
            | KeyValue::Name(_)
            | KeyValue::Names(_) => {}
        }
    }
}

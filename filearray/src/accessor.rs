//! Applying keyrings to in-memory arrays.
//!
//! Two strategies exist for writing a chunk into (or reading a selection out
//! of) an array. The **direct** strategy applies when every key is a scalar
//! or a forward slice: the selection is one strided view, written with a
//! single assignment. An index-list key (or a reversed slice) has no strided
//! view, so the **compound** strategy loops over single-dimension index
//! operations instead. List keys are rewritten as slices wherever possible
//! before this module runs ([`Key::simplify`]), so the compound path is the
//! exception.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis, Slice, SliceInfo, SliceInfoElem};
use thiserror::Error;

use crate::key::keyring::Keyring;
use crate::key::{Key, KeyValue};

/// Errors from applying a keyring to an array.
#[derive(Clone, Debug, Error)]
pub enum AccessError {
    /// Keyring dimension count differs from the array's.
    #[error("keyring has {keys} keys but array has {axes} axes")]
    DimensionMismatch {
        /// Number of keys in the keyring.
        keys: usize,
        /// Number of array axes.
        axes: usize,
    },
    /// An index beyond the array axis it applies to.
    #[error("index {index} out of bounds for axis '{dim}' of length {len}")]
    OutOfBounds {
        /// Dimension name.
        dim: String,
        /// The offending index.
        index: usize,
        /// Axis length.
        len: usize,
    },
    /// Chunk shape differs from the selection shape.
    #[error("chunk shape {chunk:?} does not fit selection shape {selection:?}")]
    IncompatibleShape {
        /// Shape of the chunk being placed.
        chunk: Vec<usize>,
        /// Shape selected by the keyring.
        selection: Vec<usize>,
    },
    /// A name key reached the array layer unresolved.
    #[error("key for '{0}' holds names; resolve them to indices first")]
    UnresolvedNames(String),
}

/// How a keyring is applied to an array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessStrategy {
    /// One strided view, single assignment.
    Direct,
    /// Sequential single-dimension index operations with explicit loops.
    Compound,
}

impl AccessStrategy {
    /// The strategy required by `keyring`.
    #[must_use]
    pub fn decide(keyring: &Keyring) -> Self {
        if keyring.has_list_key() {
            Self::Compound
        } else {
            Self::Direct
        }
    }
}

/// One key resolved against a concrete axis length.
#[derive(Clone, Debug)]
enum ResolvedKey {
    /// Scalar index; the axis is squeezed.
    Scalar(usize),
    /// Forward strided range.
    Range { start: usize, end: usize, step: usize },
    /// Explicit index list (or a reversed slice).
    List(Vec<usize>),
}

impl ResolvedKey {
    fn resolve(dim: &str, key: &Key, len: usize) -> Result<Self, AccessError> {
        let check = |index: usize| -> Result<usize, AccessError> {
            if index < len {
                Ok(index)
            } else {
                Err(AccessError::OutOfBounds {
                    dim: dim.to_string(),
                    index,
                    len,
                })
            }
        };
        match key.value() {
            KeyValue::Index(i) => Ok(Self::Scalar(check(*i)?)),
            KeyValue::All => Ok(Self::Range {
                start: 0,
                end: len,
                step: 1,
            }),
            KeyValue::Indices(l) => {
                let indices = l.iter().map(|&i| check(i)).collect::<Result<_, _>>()?;
                Ok(Self::List(indices))
            }
            KeyValue::Slice(s) => {
                let indices = s.resolve(len);
                if s.step() > 0 {
                    Ok(Self::Range {
                        start: indices.first().copied().unwrap_or(0),
                        end: indices.last().map_or(0, |&i| i + 1),
                        step: s.step().unsigned_abs(),
                    })
                } else {
                    // reversed order has no forward strided view
                    Ok(Self::List(indices))
                }
            }
            KeyValue::Name(_) | KeyValue::Names(_) => {
                Err(AccessError::UnresolvedNames(dim.to_string()))
            }
        }
    }

    /// Selection length along this axis; [`None`] for a squeezed axis.
    fn len(&self) -> Option<usize> {
        match self {
            Self::Scalar(_) => None,
            Self::Range { start, end, step } => Some(end.saturating_sub(*start).div_ceil(*step)),
            Self::List(l) => Some(l.len()),
        }
    }

    fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

fn resolve_all(keyring: &Keyring, shape: &[usize]) -> Result<Vec<ResolvedKey>, AccessError> {
    if keyring.len() != shape.len() {
        return Err(AccessError::DimensionMismatch {
            keys: keyring.len(),
            axes: shape.len(),
        });
    }
    keyring
        .iter()
        .zip(shape)
        .map(|((dim, key), &len)| ResolvedKey::resolve(dim, key, len))
        .collect()
}

fn selection_shape(resolved: &[ResolvedKey]) -> Vec<usize> {
    resolved.iter().filter_map(ResolvedKey::len).collect()
}

fn view_info(resolved: &[ResolvedKey]) -> SliceInfo<Vec<SliceInfoElem>, ndarray::IxDyn, ndarray::IxDyn> {
    let elems = resolved
        .iter()
        .map(|key| match key {
            ResolvedKey::Scalar(i) => SliceInfoElem::Index(*i as isize),
            ResolvedKey::Range { start, end, step } => SliceInfoElem::from(Slice::new(
                *start as isize,
                Some(*end as isize),
                *step as isize,
            )),
            // lists never take the view path
            ResolvedKey::List(_) => SliceInfoElem::from(Slice::new(0, None, 1)),
        })
        .collect::<Vec<_>>();
    // indices are bounds-checked during resolution
    SliceInfo::try_from(elems).unwrap_or_else(|_| unreachable!())
}

fn place_rec(mut dest: ArrayViewMutD<'_, f64>, resolved: &[ResolvedKey], chunk: ArrayViewD<'_, f64>) {
    if !resolved.iter().any(ResolvedKey::is_list) {
        dest.slice_move(view_info(resolved)).assign(&chunk);
        return;
    }
    match &resolved[0] {
        ResolvedKey::Scalar(i) => {
            place_rec(dest.index_axis_move(Axis(0), *i), &resolved[1..], chunk);
        }
        ResolvedKey::Range { start, end, step } => {
            let mut sliced = dest.slice_axis_move(
                Axis(0),
                Slice::new(*start as isize, Some(*end as isize), *step as isize),
            );
            for (sub_dest, sub_chunk) in sliced.axis_iter_mut(Axis(0)).zip(chunk.axis_iter(Axis(0)))
            {
                place_rec(sub_dest, &resolved[1..], sub_chunk);
            }
        }
        ResolvedKey::List(indices) => {
            for (j, &i) in indices.iter().enumerate() {
                let sub_dest = dest.index_axis_mut(Axis(0), i);
                place_rec(sub_dest, &resolved[1..], chunk.index_axis(Axis(0), j));
            }
        }
    }
}

/// Write `chunk` into `dest` at the selection described by `keyring`.
///
/// The keyring must hold one key per axis of `dest`, in axis order. The
/// chunk has one axis per non-scalar key.
///
/// # Errors
/// Returns an [`AccessError`] for dimension or shape mismatches and indices
/// out of bounds.
pub fn place(
    dest: &mut ArrayD<f64>,
    keyring: &Keyring,
    chunk: &ArrayD<f64>,
) -> Result<(), AccessError> {
    let resolved = resolve_all(keyring, dest.shape())?;
    let selection = selection_shape(&resolved);
    if chunk.shape() != selection.as_slice() {
        return Err(AccessError::IncompatibleShape {
            chunk: chunk.shape().to_vec(),
            selection,
        });
    }
    log::debug!(
        "placing chunk of shape {:?} with {:?} access",
        chunk.shape(),
        AccessStrategy::decide(keyring)
    );
    place_rec(dest.view_mut(), &resolved, chunk.view());
    Ok(())
}

/// Copy the selection described by `keyring` out of `source`.
///
/// Scalar keys squeeze their axis.
///
/// # Errors
/// Returns an [`AccessError`] for dimension mismatches and indices out of
/// bounds.
pub fn extract(source: &ArrayD<f64>, keyring: &Keyring) -> Result<ArrayD<f64>, AccessError> {
    let resolved = resolve_all(keyring, source.shape())?;
    let mut out = source.to_owned();
    let mut axis = 0;
    for key in &resolved {
        match key {
            ResolvedKey::Scalar(i) => {
                out = out.index_axis(Axis(axis), *i).to_owned();
            }
            ResolvedKey::Range { start, end, step } => {
                out = out
                    .slice_axis(
                        Axis(axis),
                        Slice::new(*start as isize, Some(*end as isize), *step as isize),
                    )
                    .to_owned();
                axis += 1;
            }
            ResolvedKey::List(indices) => {
                out = out.select(Axis(axis), indices);
                axis += 1;
            }
        }
    }
    Ok(out)
}

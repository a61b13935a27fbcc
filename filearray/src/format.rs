//! File format adapters.
//!
//! A [`FileFormat`] opens files of one on-disk format and hands back
//! [`FileHandle`]s able to read rectangular chunks and, optionally, scan
//! coordinate values from inside the file. The scanning and loading machinery
//! only ever talks to files through these two traits; concrete formats
//! (NetCDF, plain binary, in-memory test stores) live in adapter crates.
//!
//! Handles are scoped: the caller opens one, uses it, and closes it on every
//! exit path. [`FileHandle::close`] exists for formats that must surface
//! close failures; dropping an unclosed handle must also release it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::coord::Value;
use crate::key::Key;

/// A rectangular block of data read from one file.
pub type Chunk = ndarray::ArrayD<f64>;

/// Reference-counted format adapter.
pub type FormatRef = Arc<dyn FileFormat>;

/// Errors crossing the format adapter boundary.
#[derive(Debug, Error)]
pub enum FormatError {
    /// An I/O failure while opening, reading, or closing.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A variable absent from the file.
    #[error("variable '{variable}' not found in '{path}'")]
    UnknownVariable {
        /// The requested variable.
        variable: String,
        /// The file read.
        path: PathBuf,
    },
    /// In-file scanning requested from a format that cannot provide it.
    #[error("this format does not support in-file coordinate scanning")]
    ScanUnsupported,
    /// Any other adapter failure.
    #[error("{0}")]
    Other(String),
}

impl From<String> for FormatError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

impl From<&str> for FormatError {
    fn from(message: &str) -> Self {
        Self::Other(message.to_string())
    }
}

/// Position of a coordinate value inside a file.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
pub enum InFileIndex {
    /// The value has no representation inside the file (one value per file,
    /// carried by the filename). The axis is treated as pre-squeezed.
    #[display("-")]
    Absent,
    /// Index along the coordinate's in-file axis.
    #[display("{_0}")]
    Index(usize),
    /// In-file name, for string coordinates (a variable's in-file name).
    #[display("'{_0}'")]
    Name(String),
}

/// One scanned coordinate value and where it sits inside the file.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanItem {
    /// The coordinate value.
    pub value: Value,
    /// Its in-file position.
    pub in_index: InFileIndex,
}

impl ScanItem {
    /// A value with an in-file axis index.
    #[must_use]
    pub fn indexed(value: impl Into<Value>, index: usize) -> Self {
        Self {
            value: value.into(),
            in_index: InFileIndex::Index(index),
        }
    }

    /// A value with no in-file representation.
    #[must_use]
    pub fn absent(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            in_index: InFileIndex::Absent,
        }
    }
}

/// The per-dimension keys of one physical read, in file axis order.
///
/// A key of [`None`] marks a dimension with no axis inside the file; the
/// adapter treats it as pre-squeezed.
pub type InFileKeys = Vec<(String, Option<Key>)>;

/// Opens files of one on-disk format.
pub trait FileFormat: Send + Sync {
    /// Open `path` for reading.
    ///
    /// # Errors
    /// Returns a [`FormatError`] if the file cannot be opened.
    fn open(&self, path: &Path) -> Result<Box<dyn FileHandle>, FormatError>;

    /// Whether one physical read can address only a single variable.
    ///
    /// When true, the load planner duplicates each command per variable.
    fn separate_variable_reads(&self) -> bool {
        false
    }
}

/// An open file.
pub trait FileHandle {
    /// Read the chunk selected by `keys` for one variable.
    ///
    /// The returned chunk has one axis per non-scalar key, in the file's own
    /// axis order. Scalar and [`None`] keys are squeezed. An in-file axis
    /// not named in `keys` is read at its first index.
    ///
    /// # Errors
    /// Returns a [`FormatError`] for unknown variables or read failures.
    fn read(&mut self, variable: &str, keys: &InFileKeys) -> Result<Chunk, FormatError>;

    /// Scan coordinate values stored inside the file.
    ///
    /// `prior` holds the items produced by earlier scan stages for this file
    /// (for instance a filename scan); implementations may refine them or
    /// return a fresh list.
    ///
    /// # Errors
    /// The default returns [`FormatError::ScanUnsupported`].
    fn scan_values(
        &mut self,
        coord: &str,
        prior: &[ScanItem],
    ) -> Result<Vec<ScanItem>, FormatError> {
        let _ = (coord, prior);
        Err(FormatError::ScanUnsupported)
    }

    /// The file's axis order for `variable`, as coordinate names.
    ///
    /// Returns [`None`] when the format does not report axis order; the
    /// planner then falls back to the filegroup's declared order.
    fn axis_order(&self, variable: &str) -> Option<Vec<String>> {
        let _ = variable;
        None
    }

    /// Release the handle, surfacing close failures.
    ///
    /// # Errors
    /// Returns a [`FormatError`] if the underlying close fails.
    fn close(self: Box<Self>) -> Result<(), FormatError> {
        Ok(())
    }
}

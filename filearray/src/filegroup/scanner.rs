//! User-supplied scan functions.
//!
//! Coordinate values are discovered by an ordered list of scan functions
//! registered per coordinate. Filename scanners work from the matcher
//! captures of the current file; in-file scanners work from an open file
//! handle. Each function sees the items produced by the functions before it
//! for the same file, and its output replaces them, so a filename scanner
//! can supply a coarse value (year and month) that an in-file scanner
//! refines (day).

use std::fmt::{Debug, Formatter};

use crate::format::{FileHandle, FormatError, ScanItem};

use super::ScanError;

/// Scan function working from filename captures.
///
/// Arguments: the captures of this coordinate's matchers for the current
/// file, and the items produced so far for this file.
pub type FilenameScanFn =
    Box<dyn Fn(&[String], &[ScanItem]) -> Result<Vec<ScanItem>, ScanError> + Send + Sync>;

/// Scan function working from an open file.
pub type InFileScanFn =
    Box<dyn Fn(&mut dyn FileHandle, &[ScanItem]) -> Result<Vec<ScanItem>, ScanError> + Send + Sync>;

/// One registered scan stage for a coordinate.
pub enum Scanner {
    /// Derives items from the filename captures.
    Filename(FilenameScanFn),
    /// Derives items from the open file.
    InFile(InFileScanFn),
}

impl Debug for Scanner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filename(_) => write!(f, "Scanner::Filename"),
            Self::InFile(_) => write!(f, "Scanner::InFile"),
        }
    }
}

impl Scanner {
    /// A filename scanner from a plain closure.
    pub fn filename(
        f: impl Fn(&[String], &[ScanItem]) -> Result<Vec<ScanItem>, ScanError> + Send + Sync + 'static,
    ) -> Self {
        Self::Filename(Box::new(f))
    }

    /// An in-file scanner from a plain closure.
    pub fn in_file(
        f: impl Fn(&mut dyn FileHandle, &[ScanItem]) -> Result<Vec<ScanItem>, ScanError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::InFile(Box::new(f))
    }

    /// An in-file scanner delegating to the format adapter's own scanning
    /// ([`FileHandle::scan_values`]) for the in-file coordinate `name`.
    #[must_use]
    pub fn in_file_values(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::InFile(Box::new(move |handle, prior| {
            handle
                .scan_values(&name, prior)
                .map_err(|source| ScanError::Format {
                    coord: name.clone(),
                    source,
                })
        }))
    }

    /// A filename scanner parsing each capture as a number.
    ///
    /// Captures of this coordinate's matchers are concatenated and parsed as
    /// one `f64`; the in-file index is left absent. Suits coordinates whose
    /// value is entirely carried by the filename, one value per file.
    #[must_use]
    pub fn filename_value() -> Self {
        Self::Filename(Box::new(|captures, _prior| {
            let text: String = captures.concat();
            let value = text
                .parse::<f64>()
                .map_err(|_| ScanError::Unparsable { text })?;
            Ok(vec![ScanItem::absent(value)])
        }))
    }

    /// Whether this stage needs an open file.
    #[must_use]
    pub fn needs_file(&self) -> bool {
        matches!(self, Self::InFile(_))
    }

    /// Run this stage.
    ///
    /// # Errors
    /// Forwards the scan function's error; an in-file stage without a handle
    /// is a configuration inconsistency reported as [`ScanError::Format`].
    pub fn run(
        &self,
        captures: &[String],
        handle: Option<&mut (dyn FileHandle + '_)>,
        prior: &[ScanItem],
    ) -> Result<Vec<ScanItem>, ScanError> {
        match self {
            Self::Filename(f) => f(captures, prior),
            Self::InFile(f) => match handle {
                Some(handle) => f(handle, prior),
                None => Err(ScanError::Format {
                    coord: String::new(),
                    source: FormatError::from("in-file scanner invoked without an open file"),
                }),
            },
        }
    }
}

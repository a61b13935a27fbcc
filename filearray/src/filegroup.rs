//! Filegroups: groups of files sharing format and layout.
//!
//! A [`Filegroup`] owns a root path, a compiled filename pattern, a format
//! adapter, and one [`CoordScan`] per dimension it covers. Scanning walks the
//! file tree, matches each relative path against the pattern, and feeds the
//! captures (and, when needed, an open file) to every coordinate's scan
//! stages. Files are discovered in sorted order so scanning is deterministic.

pub mod coord_scan;
pub mod load;
pub mod scanner;

use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

use crate::coord::Value;
use crate::format::{FileHandle, FormatError, FormatRef, InFileIndex, ScanItem};
use crate::key::{Key, KeyError};
use crate::pregex::Pregex;
use crate::VARIABLE_DIM;

use coord_scan::{CoordScan, Sharing};

/// Directory depth limit below a filegroup's root.
pub const MAX_SCAN_DEPTH: usize = 3;

/// Errors while scanning a filegroup. Fatal for the affected filegroup.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No file under the root matched the pattern.
    #[error("filegroup '{filegroup}': no file under '{root}' matches '{pattern}'")]
    NoMatchingFile {
        /// Filegroup name.
        filegroup: String,
        /// Root path walked.
        root: PathBuf,
        /// The filename pattern.
        pattern: String,
    },
    /// Two equal values for one coordinate within one filegroup.
    #[error("filegroup '{filegroup}': duplicate value {value} for coordinate '{coord}'")]
    DuplicateValue {
        /// Filegroup name.
        filegroup: String,
        /// Coordinate name.
        coord: String,
        /// The duplicated value.
        value: Value,
    },
    /// Manually set values that cannot be paired one-to-one with file
    /// matches.
    #[error(
        "filegroup '{filegroup}': coordinate '{coord}' has {values} value(s) \
         but {matches} file match(es)"
    )]
    CountMismatch {
        /// Filegroup name.
        filegroup: String,
        /// Coordinate name.
        coord: String,
        /// Number of manually set values.
        values: usize,
        /// Number of distinct file matches.
        matches: usize,
    },
    /// A selection mixing values present and absent inside files.
    #[error(
        "filegroup '{filegroup}': coordinate '{coord}' mixes values present \
         and absent inside files"
    )]
    InconsistentInFileIndex {
        /// Filegroup name.
        filegroup: String,
        /// Coordinate name.
        coord: String,
    },
    /// Text a scan stage could not parse as a number.
    #[error("cannot parse '{text}' as a number")]
    Unparsable {
        /// The captured text.
        text: String,
    },
    /// A format adapter failure during scanning.
    #[error("scanning coordinate '{coord}' failed")]
    Format {
        /// Coordinate name (empty when the failure is not tied to one).
        coord: String,
        /// The adapter failure.
        #[source]
        source: FormatError,
    },
    /// A key operation failure during scanning.
    #[error("filegroup '{filegroup}': key error on coordinate '{coord}'")]
    Key {
        /// Filegroup name.
        filegroup: String,
        /// Coordinate name.
        coord: String,
        /// The underlying key failure.
        #[source]
        source: KeyError,
    },
    /// A failure while walking the file tree.
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    /// A user scan function failure.
    #[error("{0}")]
    Custom(String),
}

/// A per-filegroup restriction applied to scanned values before
/// reconciliation.
#[derive(Clone, Debug)]
pub enum Selection {
    /// Keep the values selected by a key over the scanned order.
    ByIndex(Key),
    /// Keep the listed values (within the coordinate's tolerance).
    ByValue(Vec<Value>),
    /// Keep values in `[min, max]`.
    ByRange(f64, f64),
}

/// A named group of files sharing format and internal layout.
pub struct Filegroup {
    name: String,
    root: PathBuf,
    pregex: Pregex,
    format: FormatRef,
    coords: Vec<CoordScan>,
    selections: Vec<(String, Selection)>,
    segments: Vec<String>,
    files_matched: usize,
    max_depth: usize,
}

impl Filegroup {
    /// Create a filegroup with an already compiled pattern.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        pregex: Pregex,
        format: FormatRef,
    ) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            pregex,
            format,
            coords: Vec::new(),
            selections: Vec::new(),
            segments: Vec::new(),
            files_matched: 0,
            max_depth: MAX_SCAN_DEPTH,
        }
    }

    /// Override the directory depth limit below the root.
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Filegroup name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root path files are discovered under.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The compiled filename pattern.
    #[must_use]
    pub fn pregex(&self) -> &Pregex {
        &self.pregex
    }

    /// The format adapter.
    #[must_use]
    pub fn format(&self) -> &FormatRef {
        &self.format
    }

    /// The scanning state of every covered dimension, in dimension order.
    #[must_use]
    pub fn coords(&self) -> &[CoordScan] {
        &self.coords
    }

    /// The scanning state for `dim`, if covered.
    #[must_use]
    pub fn coord(&self, dim: &str) -> Option<&CoordScan> {
        self.coords.iter().find(|cs| cs.name() == dim)
    }

    /// Mutable scanning state for `dim`, if covered.
    pub fn coord_mut(&mut self, dim: &str) -> Option<&mut CoordScan> {
        self.coords.iter_mut().find(|cs| cs.name() == dim)
    }

    /// Add the scanning state for one dimension.
    pub fn add_coord(&mut self, cs: CoordScan) {
        self.coords.push(cs);
    }

    /// Declare the variables this filegroup provides, with their in-file
    /// names. Order is preserved.
    pub fn set_variables(&mut self, variables: &[(&str, &str)]) {
        let mut cs =
            CoordScan::new(VARIABLE_DIM, self.name.clone(), Sharing::In).with_discovery_order();
        cs.set_manual(
            variables
                .iter()
                .map(|&(name, in_file)| ScanItem {
                    value: name.into(),
                    in_index: InFileIndex::Name(in_file.to_string()),
                })
                .collect(),
        );
        self.add_coord(cs);
    }

    /// Restrict the values kept for `dim` after scanning, before
    /// reconciliation.
    pub fn select(&mut self, dim: impl Into<String>, selection: Selection) {
        self.selections.push((dim.into(), selection));
    }

    /// The alternating literal/captured pieces of the first matched file.
    ///
    /// Filenames are reconstructed from these during load planning.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of files that matched the pattern in the last scan.
    #[must_use]
    pub fn files_matched(&self) -> usize {
        self.files_matched
    }

    /// Relative paths of all files under the root, sorted, within the depth
    /// limit.
    ///
    /// # Errors
    /// Returns [`ScanError::Walk`] for unreadable directories.
    pub fn find_files(&self) -> Result<Vec<String>, ScanError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root)
            .max_depth(self.max_depth)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .unwrap_or(entry.path());
            files.push(relative.to_string_lossy().into_owned());
        }
        Ok(files)
    }

    /// Scan the file tree and freeze every coordinate's state.
    ///
    /// Files that do not match the pattern are skipped with a warning. A
    /// file is opened only when a coordinate that scans it has an in-file
    /// stage, and is closed on every exit path.
    ///
    /// # Errors
    /// Returns a [`ScanError`] when no file matches, when a scan stage or
    /// the format adapter fails, or when the frozen values are inconsistent.
    pub fn scan(&mut self) -> Result<(), ScanError> {
        for cs in &mut self.coords {
            cs.reset();
        }
        self.segments.clear();
        self.files_matched = 0;

        let files = self.find_files()?;
        log::debug!(
            "filegroup '{}': {} file(s) under '{}'",
            self.name,
            files.len(),
            self.root.display(),
        );
        for file in &files {
            let Some(captures) = self.pregex.captures(file) else {
                log::warn!(
                    "filegroup '{}': '{file}' does not match '{}', skipped",
                    self.name,
                    self.pregex.source(),
                );
                continue;
            };
            self.files_matched += 1;
            if self.segments.is_empty() {
                self.segments = self.pregex.segments(file).unwrap_or_default();
            }
            self.scan_one(file, &captures)?;
        }
        if self.files_matched == 0 {
            return Err(ScanError::NoMatchingFile {
                filegroup: self.name.clone(),
                root: self.root.clone(),
                pattern: self.pregex.source().to_string(),
            });
        }
        for cs in &mut self.coords {
            cs.finish()?;
        }
        self.apply_selections()?;
        Ok(())
    }

    /// Scan a single matched file for every coordinate that wants it.
    fn scan_one(&mut self, file: &str, captures: &[String]) -> Result<(), ScanError> {
        let first_file = self.files_matched == 1;
        let mut to_scan = Vec::new();
        for (i, cs) in self.coords.iter().enumerate() {
            let caps = self.coord_captures(cs, captures);
            let wanted = match cs.sharing() {
                Sharing::In => first_file,
                Sharing::Shared => !cs.has_match(&caps),
            };
            if wanted {
                to_scan.push((i, caps));
            }
        }
        if to_scan.is_empty() {
            return Ok(());
        }

        let needs_file = to_scan
            .iter()
            .any(|(i, _)| self.coords[*i].needs_file());
        let mut handle: Option<Box<dyn FileHandle>> = if needs_file {
            let path = self.root.join(file);
            Some(
                self.format
                    .open(&path)
                    .map_err(|source| ScanError::Format {
                        coord: String::new(),
                        source,
                    })?,
            )
        } else {
            None
        };

        let file_count = self.files_matched;
        let mut result = Ok(());
        for (i, caps) in to_scan {
            result = self.coords[i].scan_file(&caps, handle.as_deref_mut(), file_count);
            if result.is_err() {
                break;
            }
        }
        if let Some(handle) = handle.take() {
            if let Err(source) = handle.close() {
                log::warn!("filegroup '{}': closing '{file}' failed: {source}", self.name);
            }
        }
        result
    }

    /// Captures of the matchers belonging to one coordinate, in order.
    fn coord_captures(&self, cs: &CoordScan, captures: &[String]) -> Vec<String> {
        self.pregex
            .matchers_of(cs.name())
            .into_iter()
            .filter_map(|i| captures.get(i).cloned())
            .collect()
    }

    fn apply_selections(&mut self) -> Result<(), ScanError> {
        for (dim, selection) in std::mem::take(&mut self.selections) {
            let Some(cs) = self.coord_mut(&dim) else {
                log::warn!(
                    "selection on '{dim}' ignored: filegroup '{name}' does not cover it",
                    name = self.name,
                );
                continue;
            };
            let values = cs.values();
            let keep: Vec<usize> = match &selection {
                Selection::ByIndex(key) => {
                    let all: Vec<usize> = (0..values.len()).collect();
                    key.apply(&all).map_err(|source| ScanError::Key {
                        filegroup: cs.filegroup().to_string(),
                        coord: dim.clone(),
                        source,
                    })?
                }
                Selection::ByValue(wanted) => values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| {
                        wanted.iter().any(|w| w.approx_eq(v, cs.tolerance()))
                    })
                    .map(|(i, _)| i)
                    .collect(),
                Selection::ByRange(min, max) => values
                    .iter()
                    .enumerate()
                    .filter(|(_, v)| {
                        v.as_float()
                            .is_some_and(|f| f >= *min - cs.tolerance() && f <= *max + cs.tolerance())
                    })
                    .map(|(i, _)| i)
                    .collect(),
            };
            log::debug!(
                "filegroup: selection on '{dim}' keeps {}/{} value(s)",
                keep.len(),
                values.len(),
            );
            cs.restrict(&keep);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};

    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap();
    }

    #[test]
    fn find_files_is_sorted_and_depth_limited() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "b.nc");
        touch(dir.path(), "a.nc");
        touch(dir.path(), "sub/c.nc");
        touch(dir.path(), "s1/s2/s3/s4/too_deep.nc");

        let pregex = Pregex::compile(r".*\.nc").unwrap();
        let fg = Filegroup::new(
            "sst",
            dir.path(),
            pregex,
            std::sync::Arc::new(NoFiles),
        );
        let files = fg.find_files().unwrap();
        assert_eq!(files, vec!["a.nc", "b.nc", "sub/c.nc"]);
    }

    struct NoFiles;

    impl crate::format::FileFormat for NoFiles {
        fn open(
            &self,
            _path: &Path,
        ) -> Result<Box<dyn FileHandle>, FormatError> {
            Err(FormatError::from("no files here"))
        }
    }

    #[test]
    fn scan_errors_when_nothing_matches() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "unrelated.txt");
        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        assert!(matches!(
            fg.scan(),
            Err(ScanError::NoMatchingFile { .. })
        ));
    }

    #[test]
    fn filename_scan_without_opening_files() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "SSH_20070109.nc");
        touch(dir.path(), "SSH_20070101.nc");
        touch(dir.path(), "notes.txt");

        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        let mut cs = CoordScan::new("time", "ssh", Sharing::Shared);
        cs.add_scanner(scanner::Scanner::filename_value());
        fg.add_coord(cs);

        fg.scan().unwrap();
        assert_eq!(fg.files_matched(), 2);
        let cs = fg.coord("time").unwrap();
        assert_eq!(
            cs.values(),
            vec![Value::Float(20_070_101.0), Value::Float(20_070_109.0)]
        );
        assert_eq!(cs.matches().len(), 2);
        assert!(!fg.segments().is_empty());
    }

    #[test]
    fn scanning_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "SSH_20070101.nc");
        touch(dir.path(), "SSH_20070109.nc");

        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        let mut cs = CoordScan::new("time", "ssh", Sharing::Shared);
        cs.add_scanner(scanner::Scanner::filename_value());
        fg.add_coord(cs);

        fg.scan().unwrap();
        let first = fg.coord("time").unwrap().values();
        fg.scan().unwrap();
        assert_eq!(fg.coord("time").unwrap().values(), first);
        assert_eq!(fg.coord("time").unwrap().matches().len(), 2);
    }

    #[test]
    fn selection_by_range() {
        let dir = TempDir::new().unwrap();
        for day in ["01", "02", "03"] {
            touch(dir.path(), &format!("SSH_200701{day}.nc"));
        }
        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        let mut cs = CoordScan::new("time", "ssh", Sharing::Shared);
        cs.add_scanner(scanner::Scanner::filename_value());
        fg.add_coord(cs);
        fg.select("time", Selection::ByRange(20_070_102.0, 20_070_103.0));

        fg.scan().unwrap();
        assert_eq!(
            fg.coord("time").unwrap().values(),
            vec![Value::Float(20_070_102.0), Value::Float(20_070_103.0)]
        );
    }

    #[test]
    fn selection_by_index() {
        let dir = TempDir::new().unwrap();
        for day in ["01", "02", "03"] {
            touch(dir.path(), &format!("SSH_200701{day}.nc"));
        }
        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        let mut cs = CoordScan::new("time", "ssh", Sharing::Shared);
        cs.add_scanner(scanner::Scanner::filename_value());
        fg.add_coord(cs);
        fg.select("time", Selection::ByIndex(Key::indices(vec![0, 2])));

        fg.scan().unwrap();
        let cs = fg.coord("time").unwrap();
        assert_eq!(
            cs.values(),
            vec![Value::Float(20_070_101.0), Value::Float(20_070_103.0)]
        );
        assert_eq!(cs.matches().len(), 2);
    }

    #[test]
    fn selection_by_value() {
        let dir = TempDir::new().unwrap();
        for day in ["01", "02", "03"] {
            touch(dir.path(), &format!("SSH_200701{day}.nc"));
        }
        let pregex = Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
        let mut fg = Filegroup::new("ssh", dir.path(), pregex, std::sync::Arc::new(NoFiles));
        let mut cs = CoordScan::new("time", "ssh", Sharing::Shared);
        cs.add_scanner(scanner::Scanner::filename_value());
        fg.add_coord(cs);
        fg.select(
            "time",
            Selection::ByValue(vec![Value::Float(20_070_102.0)]),
        );

        fg.scan().unwrap();
        assert_eq!(
            fg.coord("time").unwrap().values(),
            vec![Value::Float(20_070_102.0)]
        );
    }
}

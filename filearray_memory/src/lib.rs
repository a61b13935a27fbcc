//! An in-memory [`FileFormat`](filearray::format::FileFormat) for
//! `filearray`.
//!
//! A [`MemoryFormat`] maps file paths to named n-dimensional arrays; opening
//! a path hands back a handle reading from those arrays. The files walked on
//! disk carry no data, only their names matter, so scanning and loading can
//! be exercised end to end without a real format library. Intended for
//! tests and examples.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use ndarray::ArrayD;

use filearray::accessor;
use filearray::format::{Chunk, FileFormat, FileHandle, FormatError, InFileKeys, ScanItem};
use filearray::key::keyring::Keyring;
use filearray::key::Key;

/// The in-memory content of one file.
#[derive(Clone, Debug, Default)]
pub struct MemoryFile {
    axes: Vec<String>,
    variables: HashMap<String, ArrayD<f64>>,
    coords: HashMap<String, Vec<f64>>,
}

impl MemoryFile {
    /// A file whose variables span `axes`, in that order.
    #[must_use]
    pub fn new(axes: &[&str]) -> Self {
        Self {
            axes: axes.iter().map(|&a| a.to_string()).collect(),
            variables: HashMap::new(),
            coords: HashMap::new(),
        }
    }

    /// Add a variable. The array must span the file's axes in order.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, data: ArrayD<f64>) -> Self {
        self.variables.insert(name.into(), data);
        self
    }

    /// Record coordinate values readable through in-file scanning.
    #[must_use]
    pub fn coord_values(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.coords.insert(name.into(), values);
        self
    }
}

/// File contents held in memory, keyed by path.
#[derive(Debug, Default)]
pub struct MemoryFormat {
    files: RwLock<HashMap<PathBuf, MemoryFile>>,
    separate_variable_reads: bool,
    opens: AtomicUsize,
}

impl MemoryFormat {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that one read addresses a single variable, so the load
    /// planner duplicates commands per variable.
    #[must_use]
    pub fn with_separate_variable_reads(mut self) -> Self {
        self.separate_variable_reads = true;
        self
    }

    /// Register the content of `path`.
    ///
    /// # Panics
    /// Panics if the lock is poisoned.
    pub fn insert(&self, path: impl Into<PathBuf>, file: MemoryFile) {
        self.files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(path.into(), file);
    }

    /// How many times a file has been opened.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }
}

impl FileFormat for MemoryFormat {
    fn open(&self, path: &Path) -> Result<Box<dyn FileHandle>, FormatError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        let files = self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let file = files
            .get(path)
            .cloned()
            .ok_or_else(|| FormatError::from(format!("no content for '{}'", path.display())))?;
        Ok(Box::new(MemoryHandle {
            path: path.to_path_buf(),
            file,
        }))
    }

    fn separate_variable_reads(&self) -> bool {
        self.separate_variable_reads
    }
}

struct MemoryHandle {
    path: PathBuf,
    file: MemoryFile,
}

impl FileHandle for MemoryHandle {
    fn read(&mut self, variable: &str, keys: &InFileKeys) -> Result<Chunk, FormatError> {
        let data = self
            .file
            .variables
            .get(variable)
            .ok_or_else(|| FormatError::UnknownVariable {
                variable: variable.to_string(),
                path: self.path.clone(),
            })?;
        let mut keyring = Keyring::new();
        for axis in &self.file.axes {
            let key = keys
                .iter()
                .find(|(name, _)| name == axis)
                .and_then(|(_, key)| key.clone())
                // axes the request does not know about read at their
                // first index
                .unwrap_or_else(|| Key::index(0));
            keyring.set(axis.clone(), key);
        }
        accessor::extract(data, &keyring).map_err(|e| FormatError::from(e.to_string()))
    }

    fn scan_values(&mut self, coord: &str, _prior: &[ScanItem]) -> Result<Vec<ScanItem>, FormatError> {
        let values = self
            .file
            .coords
            .get(coord)
            .ok_or_else(|| FormatError::from(format!("no coordinate '{coord}' in file")))?;
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, &v)| ScanItem::indexed(v, i))
            .collect())
    }

    fn axis_order(&self, _variable: &str) -> Option<Vec<String>> {
        Some(self.file.axes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn read_squeezes_scalar_and_unknown_axes() {
        let data = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![0., 1., 2., 10., 11., 12.]).unwrap();
        let format = MemoryFormat::new();
        format.insert("/d/f.nc", MemoryFile::new(&["depth", "time"]).variable("sst", data));

        let mut handle = format.open(Path::new("/d/f.nc")).unwrap();
        // depth unaddressed: read at first index
        let keys: InFileKeys = vec![("time".to_string(), Some(Key::indices(vec![2, 0])))];
        let chunk = handle.read("sst", &keys).unwrap();
        assert_eq!(chunk.shape(), &[2]);
        assert_eq!(chunk.as_slice().unwrap(), &[2., 0.]);
        assert_eq!(format.opens(), 1);
    }

    #[test]
    fn in_file_scanning_reports_indexed_values() {
        let format = MemoryFormat::new();
        format.insert(
            "/d/f.nc",
            MemoryFile::new(&["time"]).coord_values("time", vec![5.0, 6.0]),
        );
        let mut handle = format.open(Path::new("/d/f.nc")).unwrap();
        let items = handle.scan_values("time", &[]).unwrap();
        assert_eq!(items, vec![ScanItem::indexed(5.0, 0), ScanItem::indexed(6.0, 1)]);
    }
}

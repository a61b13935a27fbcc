//! The dataset: filegroups reconciled into one index space.
//!
//! A [`Dataset`] owns a set of filegroups and the coordinates of the logical
//! array they form together. After every filegroup has scanned, the
//! per-filegroup values are reconciled into the available index space:
//! by default the intersection across filegroups (trimming with a warning),
//! or the union when [`Reconcile::Union`] is selected. Requests are keyrings
//! over that space; [`Dataset::load`] plans and executes the file reads that
//! satisfy them.

use itertools::Itertools;
use ndarray::ArrayD;
use thiserror::Error;

use crate::coord::{Coord, Value};
use crate::filegroup::load::{self, CommandVariable, DimRequest, LoadError};
use crate::filegroup::{Filegroup, ScanError};
use crate::key::keyring::Keyring;
use crate::key::Key;
use crate::VARIABLE_DIM;

/// How per-filegroup coordinate values are reconciled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Reconcile {
    /// Keep values present in every filegroup; trim the rest with a warning.
    #[default]
    Intersection,
    /// Keep the union of all values; coverage may be non-convex.
    Union,
}

/// Errors while reconciling filegroups into one index space.
#[derive(Clone, Debug, Error)]
pub enum ReconcileError {
    /// No value of a coordinate is common to all filegroups.
    #[error("coordinate '{0}': no value is present in every filegroup")]
    EmptyIntersection(String),
    /// Two filegroups provide the same data points.
    #[error(
        "filegroups '{a}' and '{b}' both provide variable(s) {variables:?} \
         over overlapping coordinate values"
    )]
    DuplicateData {
        /// First filegroup.
        a: String,
        /// Second filegroup.
        b: String,
        /// The variables provided by both.
        variables: Vec<String>,
    },
}

/// Errors surfaced by [`Dataset::scan_all`].
#[derive(Debug, Error)]
pub enum DatasetError {
    /// A filegroup failed to scan.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// The scanned filegroups cannot be reconciled.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// Configures and assembles a [`Dataset`].
#[derive(Default)]
pub struct DatasetBuilder {
    coords: Vec<Coord>,
    filegroups: Vec<Filegroup>,
    mode: Reconcile,
}

impl DatasetBuilder {
    /// An empty builder with default (intersection) reconciliation.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a coordinate. Declaration order is the dataset's dimension
    /// order, after the variable dimension.
    ///
    /// Values set on the coordinate serve as the available space for
    /// dimensions no filegroup scans.
    #[must_use]
    pub fn coord(mut self, coord: Coord) -> Self {
        self.coords.push(coord);
        self
    }

    /// Register a filegroup.
    #[must_use]
    pub fn filegroup(mut self, filegroup: Filegroup) -> Self {
        self.filegroups.push(filegroup);
        self
    }

    /// Select the reconciliation mode.
    #[must_use]
    pub fn reconcile(mut self, mode: Reconcile) -> Self {
        self.mode = mode;
        self
    }

    /// Assemble the dataset. Scanning has not happened yet.
    #[must_use]
    pub fn build(self) -> Dataset {
        let mut dims = vec![VARIABLE_DIM.to_string()];
        dims.extend(self.coords.iter().map(|c| c.name().to_string()));
        let mut coords = vec![Coord::new(VARIABLE_DIM)];
        coords.extend(self.coords);
        Dataset {
            dims,
            coords,
            used_tolerances: Vec::new(),
            filegroups: self.filegroups,
            mode: self.mode,
            scanned: false,
        }
    }
}

/// A collection of filegroups addressable as one logical array.
pub struct Dataset {
    dims: Vec<String>,
    coords: Vec<Coord>,
    used_tolerances: Vec<(String, f64)>,
    filegroups: Vec<Filegroup>,
    mode: Reconcile,
    scanned: bool,
}

impl Dataset {
    /// Dimension names in memory order (the variable dimension first).
    #[must_use]
    pub fn dims(&self) -> Vec<&str> {
        self.dims.iter().map(String::as_str).collect()
    }

    /// The available values along `dim`, once scanned.
    #[must_use]
    pub fn coord(&self, dim: &str) -> Option<&Coord> {
        self.coords.iter().find(|c| c.name() == dim)
    }

    /// The registered filegroups.
    #[must_use]
    pub fn filegroups(&self) -> &[Filegroup] {
        &self.filegroups
    }

    /// The filegroup named `name`.
    #[must_use]
    pub fn filegroup(&self, name: &str) -> Option<&Filegroup> {
        self.filegroups.iter().find(|fg| fg.name() == name)
    }

    /// The float tolerance actually used to reconcile `dim` (the maximum of
    /// the contributing filegroups' tolerances).
    #[must_use]
    pub fn used_tolerance(&self, dim: &str) -> Option<f64> {
        self.used_tolerances
            .iter()
            .find(|(name, _)| name == dim)
            .map(|(_, t)| *t)
    }

    /// Shape of the available space, in dimension order.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        self.coords.iter().map(Coord::len).collect()
    }

    /// Scan every filegroup and reconcile the results into the available
    /// index space.
    ///
    /// # Errors
    /// Forwards per-filegroup [`ScanError`]s; returns a [`ReconcileError`]
    /// when the scanned value sets are inconsistent across filegroups.
    pub fn scan_all(&mut self) -> Result<(), DatasetError> {
        self.used_tolerances.clear();
        for fg in &mut self.filegroups {
            fg.scan()?;
            log::info!(
                "filegroup '{}': scanned {} file(s)",
                fg.name(),
                fg.files_matched(),
            );
        }
        self.reconcile_variables();
        for i in 1..self.dims.len() {
            self.reconcile_dim(i)?;
        }
        self.check_duplicates()?;
        self.scanned = true;
        for coord in &self.coords {
            log::info!("available '{}': {}", coord.name(), coord.extent());
        }
        Ok(())
    }

    /// The variable dimension is always a union, in discovery order.
    fn reconcile_variables(&mut self) {
        let mut values: Vec<Value> = Vec::new();
        for fg in &self.filegroups {
            let Some(cs) = fg.coord(VARIABLE_DIM) else {
                continue;
            };
            for value in cs.values() {
                if !values.iter().any(|v| v == &value) {
                    values.push(value);
                }
            }
        }
        self.coords[0].set_values(values.clone());
        for fg in &mut self.filegroups {
            if let Some(cs) = fg.coord_mut(VARIABLE_DIM) {
                cs.find_contained(&values);
            }
        }
    }

    fn reconcile_dim(&mut self, index: usize) -> Result<(), ReconcileError> {
        let dim = self.dims[index].clone();
        let contributing: Vec<&Filegroup> = self
            .filegroups
            .iter()
            .filter(|fg| fg.coord(&dim).is_some_and(|cs| !cs.is_empty()))
            .collect();
        let tolerance = contributing
            .iter()
            .filter_map(|fg| fg.coord(&dim).map(|cs| cs.tolerance()))
            .fold(self.coords[index].tolerance(), f64::max);
        self.used_tolerances.push((dim.clone(), tolerance));

        let mut values: Vec<Value> = Vec::new();
        if contributing.is_empty() {
            // no filegroup scans this dimension: the declared values stand
            values = self.coords[index].values().to_vec();
        } else {
            let mut all: Vec<Value> = contributing
                .iter()
                .flat_map(|fg| fg.coord(&dim).map(|cs| cs.values()).unwrap_or_default())
                .collect();
            all.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            for value in all {
                if !values
                    .last()
                    .is_some_and(|last| last.approx_eq(&value, tolerance))
                {
                    values.push(value);
                }
            }
            if self.mode == Reconcile::Intersection && contributing.len() > 1 {
                values = self.intersect(&dim, values, tolerance)?;
            }
        }
        self.coords[index].set_values(values.clone());
        for fg in &mut self.filegroups {
            if let Some(cs) = fg.coord_mut(&dim) {
                cs.find_contained(&values);
            }
        }
        Ok(())
    }

    /// Keep only values present in every contributing filegroup, warning
    /// about the filegroups that force trimming.
    fn intersect(
        &self,
        dim: &str,
        values: Vec<Value>,
        tolerance: f64,
    ) -> Result<Vec<Value>, ReconcileError> {
        let mut trimmed_by: Vec<&str> = Vec::new();
        let kept: Vec<Value> = values
            .into_iter()
            .filter(|value| {
                let mut keep = true;
                for fg in &self.filegroups {
                    let Some(cs) = fg.coord(dim) else { continue };
                    if cs.is_empty() {
                        continue;
                    }
                    let present = cs
                        .values()
                        .iter()
                        .any(|v| v.approx_eq(value, tolerance));
                    if !present {
                        keep = false;
                        if !trimmed_by.contains(&fg.name()) {
                            trimmed_by.push(fg.name());
                        }
                    }
                }
                keep
            })
            .collect();
        if !trimmed_by.is_empty() {
            log::warn!(
                "coordinate '{dim}': trimmed to the values common to all \
                 filegroups (missing from: {})",
                trimmed_by.iter().join(", "),
            );
        }
        if kept.is_empty() {
            return Err(ReconcileError::EmptyIntersection(dim.to_string()));
        }
        Ok(kept)
    }

    /// Two filegroups providing the same variable over overlapping values of
    /// every dimension would load the same data points twice.
    fn check_duplicates(&self) -> Result<(), ReconcileError> {
        for (a, b) in self.filegroups.iter().tuple_combinations() {
            let shared_vars = self.common_variables(a, b);
            if shared_vars.is_empty() {
                continue;
            }
            let all_overlap = self.dims[1..].iter().all(|dim| {
                let overlap = |fg: &Filegroup| -> Vec<usize> {
                    fg.coord(dim)
                        .and_then(|cs| cs.contains())
                        .map(|contains| {
                            contains
                                .iter()
                                .enumerate()
                                .filter_map(|(i, own)| own.map(|_| i))
                                .collect()
                        })
                        .unwrap_or_else(|| {
                            (0..self.coord(dim).map_or(0, Coord::len)).collect()
                        })
                };
                let in_a = overlap(a);
                overlap(b).iter().any(|i| in_a.contains(i))
            });
            if all_overlap {
                return Err(ReconcileError::DuplicateData {
                    a: a.name().to_string(),
                    b: b.name().to_string(),
                    variables: shared_vars,
                });
            }
        }
        Ok(())
    }

    fn common_variables(&self, a: &Filegroup, b: &Filegroup) -> Vec<String> {
        let names = |fg: &Filegroup| -> Vec<String> {
            fg.coord(VARIABLE_DIM)
                .map(|cs| {
                    cs.values()
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        let in_a = names(a);
        names(b).into_iter().filter(|v| in_a.contains(v)).collect()
    }

    /// A keyring selecting the whole available space.
    #[must_use]
    pub fn full_keyring(&self) -> Keyring {
        let mut keyring = Keyring::new();
        for (dim, coord) in self.dims.iter().zip(&self.coords) {
            let mut key = Key::all();
            key.set_parent_size(coord.len());
            keyring.set(dim.clone(), key);
        }
        keyring
    }

    /// Complete a request: fill missing dimensions with full keys, order by
    /// the dataset's dimensions, resolve variable names, set parent sizes.
    fn complete_request(&self, request: &Keyring) -> Result<Keyring, LoadError> {
        let mut keyring = request.clone();
        let dims = self.dims();
        for dim in request.dims() {
            if !dims.contains(&dim) {
                return Err(LoadError::UnknownDimension(dim.to_string()));
            }
        }
        keyring.make_full(&dims);
        keyring.sort_by(&dims);
        for (dim, key) in keyring.iter_mut() {
            let coord = self
                .coords
                .iter()
                .find(|c| c.name() == dim)
                .ok_or_else(|| LoadError::UnknownDimension(dim.to_string()))?;
            key.set_parent_size(coord.len());
            key.resolve_names(coord).map_err(|source| LoadError::Key {
                dim: dim.to_string(),
                source,
            })?;
        }
        Ok(keyring)
    }

    /// Plan and execute the reads satisfying `request`, writing into `dest`.
    ///
    /// `dest` must have the request's shape: one axis per non-scalar key, in
    /// dimension order. The destination is mutated only at the requested
    /// positions; per-file read failures are collected and reported together
    /// after the remaining commands have run.
    ///
    /// # Errors
    /// Returns a [`LoadError`] for malformed requests, shape mismatches, and
    /// read failures.
    pub fn load(&self, request: &Keyring, dest: &mut ArrayD<f64>) -> Result<(), LoadError> {
        let keyring = self.complete_request(request)?;
        let shape = keyring.shape().ok_or(LoadError::UndecidedShape)?;
        if dest.shape() != shape.as_slice() {
            return Err(LoadError::ShapeMismatch {
                dest: dest.shape().to_vec(),
                request: shape,
            });
        }
        let dest_dims: Vec<String> = keyring
            .iter()
            .filter(|(_, key)| !key.is_scalar())
            .map(|(dim, _)| dim.to_string())
            .collect();

        let mut failures = Vec::new();
        let mut total = 0;
        for fg in &self.filegroups {
            let Some((requests, variables)) = self.filegroup_requests(fg, &keyring)? else {
                log::debug!("filegroup '{}': nothing requested, skipped", fg.name());
                continue;
            };
            let commands = load::plan(fg, &requests, &variables)?;
            match load::execute(fg, &commands, &dest_dims, dest) {
                Ok(()) => {}
                Err(LoadError::CommandsFailed {
                    failures: mut fg_failures,
                    total: fg_total,
                }) => {
                    failures.append(&mut fg_failures);
                    total += fg_total;
                }
                Err(other) => return Err(other),
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(LoadError::CommandsFailed { failures, total })
        }
    }

    /// The part of a request one filegroup can serve, or [`None`] when it
    /// serves nothing.
    #[allow(clippy::type_complexity)]
    fn filegroup_requests(
        &self,
        fg: &Filegroup,
        keyring: &Keyring,
    ) -> Result<Option<(Vec<DimRequest>, Vec<CommandVariable>)>, LoadError> {
        let var_key = keyring
            .get(VARIABLE_DIM)
            .ok_or_else(|| LoadError::UnknownDimension(VARIABLE_DIM.to_string()))?;
        let var_indices = var_key.as_list().map_err(|source| LoadError::Key {
            dim: VARIABLE_DIM.to_string(),
            source,
        })?;
        let avail_vars = self.coords[0].values();
        let mut variables = Vec::new();
        for (memory_pos, &avail_idx) in var_indices.iter().enumerate() {
            let Some(name) = avail_vars.get(avail_idx).and_then(Value::as_str) else {
                continue;
            };
            let Some(cs) = fg.coord(VARIABLE_DIM) else { continue };
            let Some(own) = cs
                .contains()
                .and_then(|contains| contains.get(avail_idx).copied().flatten())
            else {
                continue;
            };
            let in_file = match &cs.items()[own].in_index {
                crate::format::InFileIndex::Name(n) => n.clone(),
                _ => name.to_string(),
            };
            variables.push(CommandVariable {
                name: name.to_string(),
                in_file,
                memory_pos,
            });
        }
        if variables.is_empty() {
            return Ok(None);
        }

        let mut requests = Vec::new();
        for ((dim, key), coord) in keyring.iter().zip(&self.coords) {
            if dim == VARIABLE_DIM {
                continue;
            }
            let avail_indices = key.as_list().map_err(|source| LoadError::Key {
                dim: dim.to_string(),
                source,
            })?;
            let contains = fg.coord(dim).and_then(|cs| cs.contains());
            let pairs: Vec<(usize, usize)> = avail_indices
                .iter()
                .enumerate()
                .filter_map(|(memory_pos, &avail_idx)| match contains {
                    Some(contains) => contains
                        .get(avail_idx)
                        .copied()
                        .flatten()
                        .map(|own| (own, memory_pos)),
                    // dimension unknown to this filegroup: identity
                    None => Some((avail_idx, memory_pos)),
                })
                .collect();
            if pairs.is_empty() {
                return Ok(None);
            }
            requests.push(DimRequest {
                dim: dim.to_string(),
                scalar: key.is_scalar(),
                avail_len: coord.len(),
                pairs,
            });
        }
        Ok(Some((requests, variables)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::filegroup::coord_scan::{CoordScan, Sharing};
    use crate::filegroup::scanner::Scanner;
    use crate::format::{FileFormat, FileHandle, FormatError};
    use crate::pregex::Pregex;

    struct NoOpen;

    impl FileFormat for NoOpen {
        fn open(&self, _path: &Path) -> Result<Box<dyn FileHandle>, FormatError> {
            Err(FormatError::from("not needed"))
        }
    }

    fn filegroup(dir: &Path, name: &str, variable: &str, prefix: &str, days: &[&str]) -> Filegroup {
        for day in days {
            File::create(dir.join(format!("{prefix}_200701{day}.nc"))).unwrap();
        }
        let pregex = Pregex::compile(&format!(r"{prefix}_%(time:x)\.nc")).unwrap();
        let mut fg = Filegroup::new(name, dir, pregex, Arc::new(NoOpen));
        let mut cs = CoordScan::new("time", name, Sharing::Shared);
        cs.add_scanner(Scanner::filename_value());
        fg.add_coord(cs);
        fg.set_variables(&[(variable, variable)]);
        fg
    }

    #[test]
    fn intersection_trims_with_union_of_variables() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut dataset = DatasetBuilder::new()
            .coord(Coord::new("time"))
            .filegroup(filegroup(dir_a.path(), "ssh", "ssh", "SSH", &["01", "02", "03"]))
            .filegroup(filegroup(dir_b.path(), "sst", "sst", "SST", &["02", "03", "04"]))
            .build();
        dataset.scan_all().unwrap();

        assert_eq!(dataset.dims(), vec!["var", "time"]);
        assert_eq!(
            dataset.coord("var").unwrap().values(),
            &[Value::Str("ssh".into()), Value::Str("sst".into())]
        );
        assert_eq!(
            dataset.coord("time").unwrap().values(),
            &[Value::Float(20_070_102.0), Value::Float(20_070_103.0)]
        );
        let cs = dataset.filegroup("ssh").unwrap().coord("time").unwrap();
        assert_eq!(cs.contains().unwrap(), &[Some(1), Some(2)]);
    }

    #[test]
    fn union_keeps_non_convex_coverage() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut dataset = DatasetBuilder::new()
            .coord(Coord::new("time"))
            .reconcile(Reconcile::Union)
            .filegroup(filegroup(dir_a.path(), "ssh", "ssh", "SSH", &["01", "03"]))
            .filegroup(filegroup(dir_b.path(), "sst", "sst", "SST", &["02"]))
            .build();
        dataset.scan_all().unwrap();
        assert_eq!(dataset.coord("time").unwrap().len(), 3);
        let cs = dataset.filegroup("ssh").unwrap().coord("time").unwrap();
        assert_eq!(cs.contains().unwrap(), &[Some(0), None, Some(1)]);
    }

    #[test]
    fn duplicate_data_points_are_fatal() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut dataset = DatasetBuilder::new()
            .coord(Coord::new("time"))
            .filegroup(filegroup(dir_a.path(), "a", "sst", "SST", &["01", "02"]))
            .filegroup(filegroup(dir_b.path(), "b", "sst", "SSTB", &["02", "03"]))
            .build();
        let err = dataset.scan_all().unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Reconcile(ReconcileError::DuplicateData { .. })
        ));
    }

    #[test]
    fn empty_intersection_is_fatal() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut dataset = DatasetBuilder::new()
            .coord(Coord::new("time"))
            .filegroup(filegroup(dir_a.path(), "ssh", "ssh", "SSH", &["01"]))
            .filegroup(filegroup(dir_b.path(), "sst", "sst", "SST", &["02"]))
            .build();
        let err = dataset.scan_all().unwrap_err();
        assert!(matches!(
            err,
            DatasetError::Reconcile(ReconcileError::EmptyIntersection(_))
        ));
    }

    #[test]
    fn reconciliation_tolerance_is_observable() {
        let dir = TempDir::new().unwrap();
        let fg = filegroup(dir.path(), "ssh", "ssh", "SSH", &["01"]);
        let mut dataset = DatasetBuilder::new()
            .coord(Coord::new("time").with_tolerance(1e-3))
            .filegroup(fg)
            .build();
        dataset.scan_all().unwrap();
        assert_eq!(dataset.used_tolerance("time"), Some(1e-3));

        dataset.scan_all().unwrap();
        assert_eq!(dataset.used_tolerances.len(), 1);
        assert_eq!(dataset.used_tolerance("time"), Some(1e-3));
    }
}

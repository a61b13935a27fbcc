//! Per-coordinate scanning state.
//!
//! A [`CoordScan`] accumulates, for one coordinate within one filegroup,
//! three arrays indexed in lockstep: the coordinate values, their in-file
//! indices, and (for shared coordinates) the matcher captures of the file
//! each value came from. Values are sorted ascending once scanning completes;
//! a value order running opposite to the in-file index order is handled by
//! reversing in-file keys at load time, never by reordering values.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};

use itertools::Itertools;

use crate::coord::{Value, DEFAULT_TOLERANCE};
use crate::format::{FileHandle, InFileIndex, ScanItem};
use crate::key::Key;

use super::scanner::Scanner;
use super::ScanError;

/// Scanning lifecycle of one coordinate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    /// No scanning has happened.
    Unscanned,
    /// Files are being scanned.
    Scanning,
    /// Scanning finished; arrays are frozen.
    Scanned,
    /// Values and indices were supplied manually; files are still matched to
    /// associate shared values with filenames.
    ManuallySet,
}

/// How a coordinate's values are laid out across a filegroup's files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    /// Fully present, identically arranged, in every file. Only the first
    /// file is scanned.
    In,
    /// Values scattered across files. Every file is scanned.
    Shared,
}

/// Unit conversion applied once after scanning.
pub type UnitConverter = Box<dyn Fn(f64, &str, &str) -> f64 + Send + Sync>;

/// Scanning state for one coordinate within one filegroup.
pub struct CoordScan {
    name: String,
    in_file_name: String,
    filegroup: String,
    sharing: Sharing,
    keep_order: bool,
    units: String,
    target_units: String,
    tolerance: f64,
    state: ScanState,
    items: Vec<ScanItem>,
    matches: Vec<Vec<String>>,
    scanners: Vec<Scanner>,
    fixed_in_index: Option<InFileIndex>,
    force_index_descending: bool,
    mirror_empty: bool,
    unit_converter: Option<UnitConverter>,
    contains: Option<Vec<Option<usize>>>,
}

impl Debug for CoordScan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordScan")
            .field("name", &self.name)
            .field("filegroup", &self.filegroup)
            .field("sharing", &self.sharing)
            .field("state", &self.state)
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl CoordScan {
    /// New, unscanned state for `name` within `filegroup`.
    #[must_use]
    pub fn new(name: impl Into<String>, filegroup: impl Into<String>, sharing: Sharing) -> Self {
        let name = name.into();
        Self {
            in_file_name: name.clone(),
            name,
            filegroup: filegroup.into(),
            sharing,
            keep_order: false,
            units: String::new(),
            target_units: String::new(),
            tolerance: DEFAULT_TOLERANCE,
            state: ScanState::Unscanned,
            items: Vec::new(),
            matches: Vec::new(),
            scanners: Vec::new(),
            fixed_in_index: None,
            force_index_descending: false,
            mirror_empty: false,
            unit_converter: None,
            contains: None,
        }
    }

    /// Set the coordinate's name inside files, when it differs.
    #[must_use]
    pub fn with_in_file_name(mut self, name: impl Into<String>) -> Self {
        self.in_file_name = name.into();
        self
    }

    /// Preserve discovery order instead of sorting values ascending.
    ///
    /// The variable dimension always keeps discovery order.
    #[must_use]
    pub fn with_discovery_order(mut self) -> Self {
        self.keep_order = true;
        self
    }

    /// Set the unit the scanned values are expressed in.
    #[must_use]
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    /// Set the unit values must be converted to after scanning.
    #[must_use]
    pub fn with_target_units(mut self, units: impl Into<String>) -> Self {
        self.target_units = units.into();
        self
    }

    /// Register the conversion function between units.
    ///
    /// Called as `converter(value, from, to)` once per value after scanning.
    #[must_use]
    pub fn with_unit_converter(mut self, converter: UnitConverter) -> Self {
        self.unit_converter = Some(converter);
        self
    }

    /// Set the float comparison tolerance.
    #[must_use]
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Force every scanned value to one constant in-file index.
    #[must_use]
    pub fn with_fixed_in_index(mut self, index: InFileIndex) -> Self {
        self.fixed_in_index = Some(index);
        self
    }

    /// Flag the in-file index order as opposite to value order.
    ///
    /// Normally detected from scanned indices; this forces it, and in-file
    /// keys are mirrored over the scanned length.
    #[must_use]
    pub fn with_index_descending(mut self) -> Self {
        self.force_index_descending = true;
        self
    }

    /// Mirror keys (`i -> size - 1 - i`) when this state stays empty.
    #[must_use]
    pub fn with_mirrored_empty(mut self) -> Self {
        self.mirror_empty = true;
        self
    }

    /// Append a scan stage. Stages run in registration order.
    pub fn add_scanner(&mut self, scanner: Scanner) {
        self.scanners.push(scanner);
    }

    /// Supply values and in-file indices manually, bypassing scan stages.
    ///
    /// For a shared coordinate, files are still matched during scanning to
    /// associate each value with a filename.
    pub fn set_manual(&mut self, items: Vec<ScanItem>) {
        self.items = items;
        self.state = ScanState::ManuallySet;
    }

    /// Dimension name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the coordinate inside files.
    #[must_use]
    pub fn in_file_name(&self) -> &str {
        &self.in_file_name
    }

    /// Owning filegroup name.
    #[must_use]
    pub fn filegroup(&self) -> &str {
        &self.filegroup
    }

    /// In/shared classification.
    #[must_use]
    pub fn sharing(&self) -> Sharing {
        self.sharing
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Float comparison tolerance.
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Scanned (value, in-file index) items, in value order once scanned.
    #[must_use]
    pub fn items(&self) -> &[ScanItem] {
        &self.items
    }

    /// Scanned values.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.items.iter().map(|item| item.value.clone()).collect()
    }

    /// Matcher captures per item (shared coordinates only).
    #[must_use]
    pub fn matches(&self) -> &[Vec<String>] {
        &self.matches
    }

    /// Number of scanned items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no information was found or set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether any scan stage needs an open file.
    #[must_use]
    pub fn needs_file(&self) -> bool {
        self.state != ScanState::ManuallySet && self.scanners.iter().any(Scanner::needs_file)
    }

    /// Whether this capture tuple has already been scanned.
    #[must_use]
    pub fn has_match(&self, captures: &[String]) -> bool {
        self.matches.iter().any(|m| m == captures)
    }

    /// Scan one file: run the stages in order and accumulate their output.
    ///
    /// `captures` holds the captures of this coordinate's matchers in the
    /// current file. For a manually set shared coordinate only the captures
    /// are recorded.
    ///
    /// # Errors
    /// Forwards scan stage failures.
    pub fn scan_file(
        &mut self,
        captures: &[String],
        mut handle: Option<&mut (dyn FileHandle + '_)>,
        file_count: usize,
    ) -> Result<(), ScanError> {
        if self.state == ScanState::ManuallySet {
            if self.sharing == Sharing::Shared {
                self.matches.push(captures.to_vec());
            }
            return Ok(());
        }
        self.state = ScanState::Scanning;
        let mut found: Vec<ScanItem> = Vec::new();
        for scanner in &self.scanners {
            found = scanner.run(captures, handle.as_deref_mut(), &found)?;
        }
        log::debug!(
            "filegroup '{}': coordinate '{}' found {} value(s) in file {file_count}",
            self.filegroup,
            self.name,
            found.len(),
        );
        if self.sharing == Sharing::Shared {
            self.matches
                .extend(std::iter::repeat(captures.to_vec()).take(found.len()));
        }
        self.items.extend(found);
        Ok(())
    }

    /// Freeze the state after all files were scanned.
    ///
    /// Sorts values ascending (unless discovery order is kept), carrying
    /// in-file indices and matches along, verifies strict monotonicity, and
    /// applies the unit conversion and fixed in-file index if configured.
    ///
    /// # Errors
    /// Returns [`ScanError::DuplicateValue`] for equal values within this
    /// filegroup and [`ScanError::CountMismatch`] when manually set values
    /// cannot be paired with file matches.
    pub fn finish(&mut self) -> Result<(), ScanError> {
        if self.state == ScanState::ManuallySet {
            if self.sharing == Sharing::Shared {
                self.matches.sort();
                self.matches.dedup();
                if self.matches.len() != self.items.len() {
                    return Err(ScanError::CountMismatch {
                        filegroup: self.filegroup.clone(),
                        coord: self.name.clone(),
                        values: self.items.len(),
                        matches: self.matches.len(),
                    });
                }
            }
            self.apply_fixed_index();
            return Ok(());
        }

        if !self.keep_order {
            let mut order: Vec<usize> = (0..self.items.len()).collect();
            order.sort_by(|&a, &b| cmp_values(&self.items[a].value, &self.items[b].value));
            self.items = order.iter().map(|&i| self.items[i].clone()).collect();
            if self.sharing == Sharing::Shared {
                self.matches = order.iter().map(|&i| self.matches[i].clone()).collect();
            }
        }
        for (a, b) in self.items.iter().tuple_windows() {
            if a.value.approx_eq(&b.value, self.tolerance) {
                return Err(ScanError::DuplicateValue {
                    filegroup: self.filegroup.clone(),
                    coord: self.name.clone(),
                    value: a.value.clone(),
                });
            }
        }
        self.convert_units();
        self.apply_fixed_index();
        self.state = ScanState::Scanned;
        Ok(())
    }

    fn apply_fixed_index(&mut self) {
        if let Some(fixed) = &self.fixed_in_index {
            for item in &mut self.items {
                item.in_index = fixed.clone();
            }
        }
    }

    fn convert_units(&mut self) {
        if self.units == self.target_units || self.target_units.is_empty() {
            return;
        }
        let Some(converter) = &self.unit_converter else {
            log::warn!(
                "filegroup '{}': '{}' is in '{}' but no converter to '{}' is registered",
                self.filegroup,
                self.name,
                self.units,
                self.target_units,
            );
            return;
        };
        log::info!(
            "filegroup '{}': converting '{}' from '{}' to '{}'",
            self.filegroup,
            self.name,
            self.units,
            self.target_units,
        );
        for item in &mut self.items {
            if let Value::Float(v) = &mut item.value {
                *v = converter(*v, &self.units, &self.target_units);
            }
        }
        self.units = self.target_units.clone();
    }

    /// Whether value order and in-file index order run opposite.
    ///
    /// When true the load planner reverses in-file keys for this coordinate.
    #[must_use]
    pub fn is_index_descending(&self) -> bool {
        if self.force_index_descending {
            return true;
        }
        let indices: Vec<usize> = self
            .items
            .iter()
            .filter_map(|item| match item.in_index {
                InFileIndex::Index(i) => Some(i),
                InFileIndex::Absent | InFileIndex::Name(_) => None,
            })
            .collect();
        indices.len() >= 2 && indices.windows(2).all(|w| w[1] < w[0])
    }

    /// Translate a key over this state's items into an in-file key.
    ///
    /// An empty state passes the key through unchanged (mirrored if so
    /// flagged). Returns `Ok(None)` when every selected item is absent from
    /// the file, meaning the axis is pre-squeezed.
    ///
    /// # Errors
    /// Returns [`ScanError::InconsistentInFileIndex`] when the selection
    /// mixes absent and present in-file indices.
    pub fn in_file_key(&self, key: &Key) -> Result<Option<Key>, ScanError> {
        if self.is_empty() {
            let mut key = key.clone();
            if self.mirror_empty {
                if let Some(size) = key.parent_size() {
                    key.mirror(size).map_err(|source| ScanError::Key {
                        filegroup: self.filegroup.clone(),
                        coord: self.name.clone(),
                        source,
                    })?;
                }
            }
            return Ok(Some(key));
        }
        let selected = key
            .apply(&self.items)
            .map_err(|source| ScanError::Key {
                filegroup: self.filegroup.clone(),
                coord: self.name.clone(),
                source,
            })?;
        if selected
            .iter()
            .all(|item| item.in_index == InFileIndex::Absent)
        {
            return Ok(None);
        }
        let indices = selected
            .iter()
            .map(|item| match &item.in_index {
                InFileIndex::Index(i) => Some(*i),
                InFileIndex::Absent | InFileIndex::Name(_) => None,
            })
            .collect::<Option<Vec<usize>>>()
            .ok_or_else(|| ScanError::InconsistentInFileIndex {
                filegroup: self.filegroup.clone(),
                coord: self.name.clone(),
            })?;
        let mut out = if key.is_scalar() {
            Key::index(indices[0])
        } else {
            Key::indices(indices)
        };
        if self.force_index_descending {
            out.mirror(self.items.len())
                .map_err(|source| ScanError::Key {
                    filegroup: self.filegroup.clone(),
                    coord: self.name.clone(),
                    source,
                })?;
        }
        out.simplify();
        Ok(Some(out))
    }

    /// Map each available-space value to its index in this state's values.
    ///
    /// An empty state inherits the available space unchanged, so its mapping
    /// is the identity. Stored for load planning; readable through
    /// [`CoordScan::contains`].
    pub fn find_contained(&mut self, avail: &[Value]) {
        let contains = if self.is_empty() {
            (0..avail.len()).map(Some).collect()
        } else {
            avail
                .iter()
                .map(|value| {
                    self.items
                        .iter()
                        .position(|item| item.value.approx_eq(value, self.tolerance))
                })
                .collect()
        };
        self.contains = Some(contains);
    }

    /// The available-to-own index mapping from the last
    /// [`CoordScan::find_contained`].
    #[must_use]
    pub fn contains(&self) -> Option<&[Option<usize>]> {
        self.contains.as_deref()
    }

    /// Keep only the items at `keep`, in the given order.
    ///
    /// Used by per-filegroup selections after scanning.
    pub(crate) fn restrict(&mut self, keep: &[usize]) {
        self.items = keep
            .iter()
            .filter_map(|&i| self.items.get(i).cloned())
            .collect();
        if self.sharing == Sharing::Shared {
            self.matches = keep
                .iter()
                .filter_map(|&i| self.matches.get(i).cloned())
                .collect();
        }
        self.contains = None;
    }

    /// Reset scanned state, keeping configuration.
    pub fn reset(&mut self) {
        if self.state != ScanState::ManuallySet {
            self.items.clear();
            self.state = ScanState::Unscanned;
        }
        self.matches.clear();
        self.contains = None;
    }
}

fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
        (Value::Str(a), Value::Str(b)) => a.cmp(b),
        (Value::Float(_), Value::Str(_)) => Ordering::Less,
        (Value::Str(_), Value::Float(_)) => Ordering::Greater,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanned(items: Vec<ScanItem>) -> CoordScan {
        let mut cs = CoordScan::new("time", "sst", Sharing::In);
        cs.items = items;
        cs.state = ScanState::Scanned;
        cs
    }

    #[test]
    fn sorting_carries_indices_and_matches() {
        let mut cs = CoordScan::new("time", "sst", Sharing::Shared);
        cs.add_scanner(Scanner::filename_value());
        cs.scan_file(&["20".to_string()], None, 1).unwrap();
        cs.scan_file(&["10".to_string()], None, 2).unwrap();
        cs.finish().unwrap();
        assert_eq!(cs.state(), ScanState::Scanned);
        assert_eq!(
            cs.values(),
            vec![Value::Float(10.0), Value::Float(20.0)]
        );
        assert_eq!(cs.matches(), &[vec!["10".to_string()], vec!["20".to_string()]]);
    }

    #[test]
    fn duplicate_value_is_fatal() {
        let mut cs = CoordScan::new("time", "sst", Sharing::Shared);
        cs.add_scanner(Scanner::filename_value());
        cs.scan_file(&["10".to_string()], None, 1).unwrap();
        cs.scan_file(&["10.000001".to_string()], None, 2).unwrap();
        assert!(matches!(
            cs.finish(),
            Err(ScanError::DuplicateValue { .. })
        ));
    }

    #[test]
    fn index_descending_detection() {
        let cs = scanned(vec![
            ScanItem::indexed(1.0, 2),
            ScanItem::indexed(2.0, 1),
            ScanItem::indexed(3.0, 0),
        ]);
        assert!(cs.is_index_descending());
        let key = cs.in_file_key(&Key::index(0)).unwrap();
        assert_eq!(key, Some(Key::index(2)));
    }

    #[test]
    fn forced_descending_mirrors_in_file_keys() {
        let mut cs = scanned(vec![
            ScanItem::indexed(1.0, 0),
            ScanItem::indexed(2.0, 1),
            ScanItem::indexed(3.0, 2),
        ]);
        cs.force_index_descending = true;
        assert!(cs.is_index_descending());
        assert_eq!(cs.in_file_key(&Key::index(0)).unwrap(), Some(Key::index(2)));
        let out = cs.in_file_key(&Key::indices(vec![0, 2])).unwrap().unwrap();
        assert_eq!(out.as_list().unwrap(), vec![2, 0]);
    }

    #[test]
    fn fixed_in_file_index_overrides_scanned_indices() {
        let mut cs = CoordScan::new("time", "sst", Sharing::Shared)
            .with_fixed_in_index(InFileIndex::Index(0));
        cs.add_scanner(Scanner::filename_value());
        cs.scan_file(&["10".to_string()], None, 1).unwrap();
        cs.scan_file(&["20".to_string()], None, 2).unwrap();
        cs.finish().unwrap();
        assert!(cs
            .items()
            .iter()
            .all(|item| item.in_index == InFileIndex::Index(0)));
    }

    #[test]
    fn absent_indices_squeeze_the_axis() {
        let cs = scanned(vec![ScanItem::absent(1.0), ScanItem::absent(2.0)]);
        assert_eq!(cs.in_file_key(&Key::index(1)).unwrap(), None);
    }

    #[test]
    fn mixed_presence_is_inconsistent() {
        let cs = scanned(vec![ScanItem::absent(1.0), ScanItem::indexed(2.0, 0)]);
        assert!(matches!(
            cs.in_file_key(&Key::indices(vec![0, 1])),
            Err(ScanError::InconsistentInFileIndex { .. })
        ));
    }

    #[test]
    fn empty_state_passes_key_through() {
        let cs = CoordScan::new("depth", "sst", Sharing::In);
        let key = Key::indices(vec![1, 3]);
        assert_eq!(cs.in_file_key(&key).unwrap(), Some(key.clone()));

        let mut mirrored_key = key;
        mirrored_key.set_parent_size(5);
        let cs = CoordScan::new("depth", "sst", Sharing::In).with_mirrored_empty();
        let out = cs.in_file_key(&mirrored_key).unwrap().unwrap();
        assert_eq!(out.as_list().unwrap(), vec![3, 1]);
    }

    #[test]
    fn unit_conversion_runs_once_after_scan() {
        let mut cs = CoordScan::new("time", "sst", Sharing::In)
            .with_units("hours")
            .with_target_units("days")
            .with_unit_converter(Box::new(|v, _, _| v / 24.0));
        cs.add_scanner(Scanner::filename_value());
        cs.scan_file(&["48".to_string()], None, 1).unwrap();
        cs.finish().unwrap();
        assert_eq!(cs.values(), vec![Value::Float(2.0)]);
    }

    #[test]
    fn manual_shared_values_pair_with_matches() {
        let mut cs = CoordScan::new("time", "sst", Sharing::Shared);
        cs.set_manual(vec![ScanItem::absent(1.0), ScanItem::absent(2.0)]);
        cs.scan_file(&["a".to_string()], None, 1).unwrap();
        cs.scan_file(&["b".to_string()], None, 2).unwrap();
        cs.finish().unwrap();
        assert_eq!(cs.state(), ScanState::ManuallySet);
        assert_eq!(cs.matches().len(), 2);

        let mut short = CoordScan::new("time", "sst", Sharing::Shared);
        short.set_manual(vec![ScanItem::absent(1.0)]);
        short.scan_file(&["a".to_string()], None, 1).unwrap();
        short.scan_file(&["b".to_string()], None, 2).unwrap();
        assert!(matches!(
            short.finish(),
            Err(ScanError::CountMismatch { .. })
        ));
    }

    #[test]
    fn contains_mapping() {
        let mut cs = scanned(vec![ScanItem::indexed(2.0, 0), ScanItem::indexed(3.0, 1)]);
        cs.find_contained(&[Value::Float(1.0), Value::Float(2.0), Value::Float(3.0)]);
        assert_eq!(cs.contains().unwrap(), &[None, Some(0), Some(1)]);
    }
}

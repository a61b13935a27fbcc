//! Load command planning and execution.
//!
//! A load request (a keyring over the available index space) is turned into
//! per-file [`Command`]s in three steps: expand every combination of shared
//! coordinate values into one (file, in-file index, memory index) triple,
//! group the triples by file path, then merge key sets on the same file so
//! that runs of single indices collapse into list and slice keys. Merged
//! commands are handed to the format adapter one by one; each returned chunk
//! is reordered to the destination's dimension order and written in place.
//!
//! Read failures are collected per file and reported together after the
//! remaining commands have run; only internal inconsistencies abort the
//! whole load.

use std::path::{Path, PathBuf};

use itertools::Itertools;
use ndarray::{ArrayD, Axis};
use thiserror::Error;

use crate::accessor::{self, AccessError};
use crate::format::{FileHandle, InFileIndex, InFileKeys};
use crate::key::keyring::Keyring;
use crate::key::{Key, KeyError, KeyValue};
use crate::VARIABLE_DIM;

use super::coord_scan::Sharing;
use super::{Filegroup, ScanError};

/// Errors from planning or executing a load.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Destination array shape differs from the request's shape.
    #[error("destination shape {dest:?} does not match request shape {request:?}")]
    ShapeMismatch {
        /// Destination array shape.
        dest: Vec<usize>,
        /// Shape of the requested selection.
        request: Vec<usize>,
    },
    /// The request's shape cannot be computed.
    #[error("request shape is undecidable; give open slices a parent size")]
    UndecidedShape,
    /// A requested dimension absent from the available space.
    #[error("dimension '{0}' is not part of the available space")]
    UnknownDimension(String),
    /// A key failure while planning.
    #[error("planning key for dimension '{dim}' failed")]
    Key {
        /// Dimension name.
        dim: String,
        /// The underlying key failure.
        #[source]
        source: KeyError,
    },
    /// A scan-state inconsistency discovered while planning.
    #[error(transparent)]
    Scan(#[from] ScanError),
    /// A chunk that cannot be placed into the destination.
    #[error("placing chunk from '{path}' failed")]
    Placement {
        /// The file the chunk came from.
        path: PathBuf,
        /// The placement failure.
        #[source]
        source: AccessError,
    },
    /// One or more per-file read failures, reported after the remaining
    /// commands completed.
    #[error("{} of {total} read(s) failed", failures.len())]
    CommandsFailed {
        /// The individual failures.
        failures: Vec<CommandFailure>,
        /// Total number of reads attempted.
        total: usize,
    },
}

/// One failed read, identified by file and variable.
#[derive(Debug)]
pub struct CommandFailure {
    /// The file involved.
    pub path: PathBuf,
    /// The variable read, or `*` when the file could not be opened at all.
    pub variable: String,
    /// Adapter error text.
    pub message: String,
}

/// The in-file and memory keys of one dimension within a command.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyPair {
    /// Key inside the file; [`None`] when the dimension has no in-file axis.
    pub in_file: Option<Key>,
    /// Key into the destination array.
    pub memory: Key,
}

impl KeyPair {
    /// Merge another pair into this one, concatenating selections in memory
    /// order. Pairs disagreeing on in-file presence do not merge.
    fn merge(&mut self, other: &Self) -> Result<bool, KeyError> {
        let in_file = match (&self.in_file, &other.in_file) {
            (None, None) => None,
            (Some(a), Some(b)) => Some(a.promote().expand(&b.promote())?),
            (None, Some(_)) | (Some(_), None) => return Ok(false),
        };
        self.in_file = in_file;
        self.memory = self.memory.promote().expand(&other.memory.promote())?;
        self.sort_by_memory()?;
        Ok(true)
    }

    /// Reorder both selections so memory indices ascend in lockstep.
    fn sort_by_memory(&mut self) -> Result<(), KeyError> {
        let KeyValue::Indices(memory) = self.memory.value() else {
            return Ok(());
        };
        let mut order: Vec<usize> = (0..memory.len()).collect();
        order.sort_by_key(|&i| memory[i]);
        let memory = order.iter().map(|&i| memory[i]).collect();
        if let Some(in_file) = &mut self.in_file {
            let indices = in_file.as_list()?;
            if indices.len() == order.len() {
                *in_file = Key::indices(order.iter().map(|&i| indices[i]).collect());
            }
        }
        self.memory = Key::indices(memory);
        Ok(())
    }

    fn simplify(&mut self) {
        if let Some(in_file) = &mut self.in_file {
            in_file.simplify();
        }
        self.memory.simplify();
    }
}

/// One dimension-ordered set of key pairs within a command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandKeys {
    entries: Vec<(String, KeyPair)>,
}

impl CommandKeys {
    /// The pair for `dim`, if present.
    #[must_use]
    pub fn get(&self, dim: &str) -> Option<&KeyPair> {
        self.entries
            .iter()
            .find(|(name, _)| name == dim)
            .map(|(_, pair)| pair)
    }

    /// Iterate over `(dimension, pair)` entries in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyPair)> {
        self.entries.iter().map(|(dim, pair)| (dim.as_str(), pair))
    }

    fn set(&mut self, dim: impl Into<String>, pair: KeyPair) {
        let dim = dim.into();
        match self.entries.iter_mut().find(|(name, _)| *name == dim) {
            Some((_, slot)) => *slot = pair,
            None => self.entries.push((dim, pair)),
        }
    }

    /// Whether both sets are equal on every dimension except `dim`.
    fn equal_except(&self, other: &Self, dim: &str) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(name, pair)| {
                name == dim || other.get(name) == Some(pair)
            })
    }

    fn sort_by(&mut self, order: &[&str]) {
        self.entries.sort_by_key(|(dim, _)| {
            order.iter().position(|o| o == dim).unwrap_or(usize::MAX)
        });
    }

    fn simplify(&mut self) {
        for (_, pair) in &mut self.entries {
            pair.simplify();
        }
    }

    fn squeeze_dim(&mut self, dim: &str) {
        if let Some((_, pair)) = self.entries.iter_mut().find(|(name, _)| name == dim) {
            if let Some(in_file) = &mut pair.in_file {
                in_file.squeeze();
            }
            pair.memory.squeeze();
        }
    }
}

/// One variable a command reads, with its destination position along the
/// variable axis.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandVariable {
    /// Variable name in the dataset.
    pub name: String,
    /// Variable name inside the file.
    pub in_file: String,
    /// Position along the destination's variable axis.
    pub memory_pos: usize,
}

/// One physical read instruction against one file.
#[derive(Debug)]
pub struct Command {
    path: PathBuf,
    variables: Vec<CommandVariable>,
    keys: Vec<CommandKeys>,
}

impl Command {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            variables: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// The file this command reads.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The variables read from the file.
    #[must_use]
    pub fn variables(&self) -> &[CommandVariable] {
        &self.variables
    }

    /// The key sets read from the file, one read each per variable.
    #[must_use]
    pub fn keys(&self) -> &[CommandKeys] {
        &self.keys
    }

    /// Merge key sets differing in exactly one of `dims`, one dimension at a
    /// time. Single indices collapse into lists; [`Command::simplify`]
    /// rewrites constant-stride lists as slices afterwards.
    fn merge_keys(&mut self, dims: &[&str]) -> Result<(), KeyError> {
        for dim in dims {
            let mut merged: Vec<CommandKeys> = Vec::new();
            for keyset in self.keys.drain(..) {
                let mut absorbed = false;
                for candidate in &mut merged {
                    if !candidate.equal_except(&keyset, dim) {
                        continue;
                    }
                    if let (Some(_), Some(pair)) = (candidate.get(dim), keyset.get(dim)) {
                        let slot = candidate
                            .entries
                            .iter_mut()
                            .find(|(name, _)| name == dim)
                            .map(|(_, p)| p);
                        if let Some(slot) = slot {
                            if slot.merge(pair)? {
                                absorbed = true;
                                break;
                            }
                        }
                    }
                }
                if !absorbed {
                    merged.push(keyset);
                }
            }
            self.keys = merged;
        }
        Ok(())
    }

    fn simplify(&mut self) {
        for keyset in &mut self.keys {
            keyset.simplify();
        }
    }

    fn reads(&self) -> usize {
        self.variables.len() * self.keys.len()
    }
}

/// The part of a load request falling on one filegroup, for one dimension.
#[derive(Clone, Debug)]
pub(crate) struct DimRequest {
    /// Dimension name.
    pub dim: String,
    /// Whether the request key was scalar (the destination axis is squeezed).
    pub scalar: bool,
    /// Size of the available space along this dimension.
    pub avail_len: usize,
    /// Pairs of (index into the filegroup's scanned values, position along
    /// the destination axis), in destination order.
    pub pairs: Vec<(usize, usize)>,
}

/// Build the merged command list for one filegroup.
///
/// `requests` covers every dimension except the variable one, in dataset
/// dimension order; `variables` lists the requested variables this filegroup
/// provides.
pub(crate) fn plan(
    fg: &Filegroup,
    requests: &[DimRequest],
    variables: &[CommandVariable],
) -> Result<Vec<Command>, LoadError> {
    let is_shared = |req: &DimRequest| {
        fg.coord(&req.dim)
            .is_some_and(|cs| cs.sharing() == Sharing::Shared && !cs.is_empty())
    };
    let (shared, in_dims): (Vec<&DimRequest>, Vec<&DimRequest>) =
        requests.iter().partition(|r| is_shared(r));

    let mut commands = expand_shared(fg, &shared)?;
    let shared_names: Vec<&str> = shared.iter().map(|r| r.dim.as_str()).collect();
    for command in &mut commands {
        command.merge_keys(&shared_names).map_err(|source| {
            LoadError::Key {
                dim: shared_names.join(","),
                source,
            }
        })?;
        for req in &shared {
            if req.scalar {
                for keyset in &mut command.keys {
                    keyset.squeeze_dim(&req.dim);
                }
            }
        }
    }

    let in_pairs = in_dim_pairs(fg, &in_dims)?;
    let order: Vec<&str> = requests.iter().map(|r| r.dim.as_str()).collect();
    for command in &mut commands {
        for keyset in &mut command.keys {
            for (dim, pair) in &in_pairs {
                keyset.set(dim.clone(), pair.clone());
            }
            keyset.sort_by(&order);
        }
        command.simplify();
        command.variables = variables.to_vec();
    }

    if fg.format().separate_variable_reads() && variables.len() > 1 {
        commands = commands
            .into_iter()
            .flat_map(|command| {
                command
                    .variables
                    .clone()
                    .into_iter()
                    .map(move |variable| Command {
                        path: command.path.clone(),
                        variables: vec![variable],
                        keys: command.keys.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
    }
    log::debug!(
        "filegroup '{}': planned {} command(s)",
        fg.name(),
        commands.len(),
    );
    Ok(commands)
}

/// Expand every combination of requested shared values into per-file key
/// sets, reconstructing each file path from the stored captures.
fn expand_shared(fg: &Filegroup, shared: &[&DimRequest]) -> Result<Vec<Command>, LoadError> {
    let mut commands: Vec<Command> = Vec::new();
    if shared.is_empty() {
        let path = fg
            .root()
            .join(fg.pregex().reconstruct(fg.segments(), &[]));
        let mut command = Command::new(path);
        command.keys.push(CommandKeys::default());
        return Ok(vec![command]);
    }
    for combo in shared
        .iter()
        .map(|req| req.pairs.iter())
        .multi_cartesian_product()
    {
        let mut overrides: Vec<(usize, String)> = Vec::new();
        let mut keyset = CommandKeys::default();
        for (req, &&(own, mem)) in shared.iter().zip(&combo) {
            let cs = fg
                .coord(&req.dim)
                .ok_or_else(|| LoadError::UnknownDimension(req.dim.clone()))?;
            let item = cs.items().get(own).ok_or_else(|| LoadError::Key {
                dim: req.dim.clone(),
                source: KeyError::OutOfBounds {
                    index: own,
                    len: cs.len(),
                },
            })?;
            let captures = &cs.matches()[own];
            for (slot, capture) in fg
                .pregex()
                .matchers_of(&req.dim)
                .into_iter()
                .zip(captures)
            {
                overrides.push((slot, capture.clone()));
            }
            let in_file = match &item.in_index {
                InFileIndex::Index(i) => Some(Key::index(*i)),
                InFileIndex::Absent | InFileIndex::Name(_) => None,
            };
            keyset.set(
                req.dim.clone(),
                KeyPair {
                    in_file,
                    memory: Key::index(mem),
                },
            );
        }
        let override_refs: Vec<(usize, &str)> = overrides
            .iter()
            .map(|(slot, text)| (*slot, text.as_str()))
            .collect();
        let relative = fg.pregex().reconstruct(fg.segments(), &override_refs);
        let path = fg.root().join(relative);
        match commands.iter_mut().find(|c| c.path == path) {
            Some(command) => command.keys.push(keyset),
            None => {
                let mut command = Command::new(path);
                command.keys.push(keyset);
                commands.push(command);
            }
        }
    }
    Ok(commands)
}

/// The key pairs of the non-shared dimensions, identical for every command.
fn in_dim_pairs(
    fg: &Filegroup,
    in_dims: &[&DimRequest],
) -> Result<Vec<(String, KeyPair)>, LoadError> {
    let mut pairs = Vec::new();
    for req in in_dims {
        let mut own_key = if req.scalar {
            Key::index(req.pairs[0].0)
        } else {
            let mut key = Key::indices(req.pairs.iter().map(|&(own, _)| own).collect());
            key.simplify();
            key
        };
        own_key.set_parent_size(req.avail_len);
        let in_file = match fg.coord(&req.dim) {
            Some(cs) => cs.in_file_key(&own_key)?,
            // a dimension the filegroup never scanned behaves like an
            // empty scan state: the key passes through
            None => Some(own_key),
        };
        let mut memory = if req.scalar {
            Key::index(req.pairs[0].1)
        } else {
            Key::indices(req.pairs.iter().map(|&(_, mem)| mem).collect())
        };
        memory.simplify();
        pairs.push((req.dim.clone(), KeyPair { in_file, memory }));
    }
    Ok(pairs)
}

enum ReadOutcome {
    Done,
    Failed(String),
}

/// Execute `commands` against `dest`.
///
/// `dest_dims` names the destination's axes in order (scalar-requested
/// dimensions carry no axis). Read failures are collected; placement
/// inconsistencies abort.
pub(crate) fn execute(
    fg: &Filegroup,
    commands: &[Command],
    dest_dims: &[String],
    dest: &mut ArrayD<f64>,
) -> Result<(), LoadError> {
    let mut failures = Vec::new();
    let mut total = 0;
    for command in commands {
        let mut handle = match fg.format().open(&command.path) {
            Ok(handle) => handle,
            Err(source) => {
                log::warn!("cannot open '{}': {source}", command.path.display());
                total += command.reads();
                failures.push(CommandFailure {
                    path: command.path.clone(),
                    variable: "*".to_string(),
                    message: source.to_string(),
                });
                continue;
            }
        };
        let mut result = Ok(());
        'reads: for variable in &command.variables {
            for keyset in &command.keys {
                total += 1;
                match read_one(fg, handle.as_mut(), command, variable, keyset, dest_dims, dest) {
                    Ok(ReadOutcome::Done) => {}
                    Ok(ReadOutcome::Failed(message)) => {
                        log::warn!(
                            "reading '{}' from '{}' failed: {message}",
                            variable.name,
                            command.path.display(),
                        );
                        failures.push(CommandFailure {
                            path: command.path.clone(),
                            variable: variable.name.clone(),
                            message,
                        });
                    }
                    Err(fatal) => {
                        result = Err(fatal);
                        break 'reads;
                    }
                }
            }
        }
        if let Err(source) = handle.close() {
            log::warn!("closing '{}' failed: {source}", command.path.display());
        }
        result?;
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(LoadError::CommandsFailed { failures, total })
    }
}

/// One read: fetch the chunk, reorder its axes, write it into place.
///
/// Per-file failures come back as [`ReadOutcome::Failed`]; inconsistencies
/// that would corrupt the destination are returned as hard errors.
fn read_one(
    fg: &Filegroup,
    handle: &mut dyn FileHandle,
    command: &Command,
    variable: &CommandVariable,
    keyset: &CommandKeys,
    dest_dims: &[String],
    dest: &mut ArrayD<f64>,
) -> Result<ReadOutcome, LoadError> {
    let in_file_keys: InFileKeys = keyset
        .iter()
        .map(|(dim, pair)| {
            let name = fg
                .coord(dim)
                .map_or_else(|| dim.to_string(), |cs| cs.in_file_name().to_string());
            (name, pair.in_file.clone())
        })
        .collect();
    let chunk = match handle.read(&variable.in_file, &in_file_keys) {
        Ok(chunk) => chunk,
        Err(source) => return Ok(ReadOutcome::Failed(source.to_string())),
    };

    let chunk = match reorder_chunk(fg, handle, variable, keyset, dest_dims, chunk) {
        Ok(chunk) => chunk,
        Err(message) => return Ok(ReadOutcome::Failed(message)),
    };

    let mut placement = Keyring::new();
    for dim in dest_dims {
        if dim.as_str() == VARIABLE_DIM {
            placement.set(dim.clone(), Key::index(variable.memory_pos));
        } else if let Some(pair) = keyset.get(dim) {
            placement.set(dim.clone(), pair.memory.clone());
        }
    }
    accessor::place(dest, &placement, &chunk).map_err(|source| LoadError::Placement {
        path: command.path.clone(),
        source,
    })?;
    Ok(ReadOutcome::Done)
}

/// Bring a chunk's axes into destination dimension order, inserting length-1
/// axes for dimensions with no in-file axis.
fn reorder_chunk(
    fg: &Filegroup,
    handle: &dyn FileHandle,
    variable: &CommandVariable,
    keyset: &CommandKeys,
    dest_dims: &[String],
    mut chunk: ArrayD<f64>,
) -> Result<ArrayD<f64>, String> {
    // dimensions with an axis in the chunk, in file axis order
    let mut chunk_dims: Vec<&str> = keyset
        .iter()
        .filter(|(_, pair)| pair.in_file.as_ref().is_some_and(|k| !k.is_scalar()))
        .map(|(dim, _)| dim)
        .collect();
    let file_order: Vec<String> = handle
        .axis_order(&variable.in_file)
        .map_or_else(
            || fg.coords().iter().map(|cs| cs.name().to_string()).collect(),
            |names| {
                names
                    .into_iter()
                    .map(|in_file| {
                        fg.coords()
                            .iter()
                            .find(|cs| cs.in_file_name() == in_file)
                            .map_or(in_file, |cs| cs.name().to_string())
                    })
                    .collect()
            },
        );
    chunk_dims.sort_by_key(|dim| {
        file_order
            .iter()
            .position(|o| o == dim)
            .unwrap_or(usize::MAX)
    });
    if chunk.ndim() != chunk_dims.len() {
        return Err(format!(
            "chunk has {} axes, expected {} ({})",
            chunk.ndim(),
            chunk_dims.len(),
            chunk_dims.iter().join(", "),
        ));
    }

    // destination axes this chunk spans
    let target: Vec<&str> = dest_dims
        .iter()
        .map(String::as_str)
        .filter(|dim| {
            keyset
                .get(dim)
                .is_some_and(|pair| !pair.memory.is_scalar())
        })
        .collect();

    let permutation: Vec<usize> = target
        .iter()
        .filter(|dim| chunk_dims.contains(dim))
        .map(|dim| {
            chunk_dims
                .iter()
                .position(|c| c == dim)
                .unwrap_or_default()
        })
        .collect();
    if permutation.len() != chunk.ndim() {
        return Err("chunk axes do not match the requested dimensions".to_string());
    }
    chunk = chunk.permuted_axes(permutation);

    // axes with no in-file counterpart become length-1 axes
    for (pos, dim) in target.iter().enumerate() {
        if !chunk_dims.contains(dim) {
            chunk = chunk.insert_axis(Axis(pos));
        }
    }
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_set(pairs: &[(&str, usize, usize)]) -> CommandKeys {
        let mut keys = CommandKeys::default();
        for &(dim, in_file, memory) in pairs {
            keys.set(
                dim,
                KeyPair {
                    in_file: Some(Key::index(in_file)),
                    memory: Key::index(memory),
                },
            );
        }
        keys
    }

    #[test]
    fn merge_collapses_single_indices_to_a_slice() {
        let mut command = Command::new(PathBuf::from("sst.nc"));
        command.keys = vec![
            scalar_set(&[("time", 0, 0), ("depth", 0, 0)]),
            scalar_set(&[("time", 2, 1), ("depth", 0, 0)]),
            scalar_set(&[("time", 4, 2), ("depth", 0, 0)]),
        ];
        command.merge_keys(&["time", "depth"]).unwrap();
        command.simplify();
        assert_eq!(command.keys.len(), 1);
        let pair = command.keys[0].get("time").unwrap();
        let in_file = pair.in_file.as_ref().unwrap();
        assert!(matches!(in_file.value(), KeyValue::Slice(_)));
        assert_eq!(in_file.as_list().unwrap(), vec![0, 2, 4]);
        assert_eq!(pair.memory.as_list().unwrap(), vec![0, 1, 2]);
        // depth stayed a single index
        let depth = command.keys[0].get("depth").unwrap();
        assert_eq!(depth.in_file.as_ref().unwrap().as_list().unwrap(), vec![0]);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let sets = [
            scalar_set(&[("time", 0, 0), ("depth", 0, 0)]),
            scalar_set(&[("time", 2, 1), ("depth", 0, 0)]),
            scalar_set(&[("time", 4, 2), ("depth", 0, 0)]),
        ];
        let mut forward = Command::new(PathBuf::from("a.nc"));
        forward.keys = sets.to_vec();
        forward.merge_keys(&["time", "depth"]).unwrap();
        forward.simplify();

        let mut backward = Command::new(PathBuf::from("a.nc"));
        backward.keys = sets.iter().rev().cloned().collect();
        backward.merge_keys(&["time", "depth"]).unwrap();
        backward.simplify();

        assert_eq!(forward.keys, backward.keys);
    }

    #[test]
    fn sets_differing_on_two_dims_stay_apart() {
        let mut command = Command::new(PathBuf::from("sst.nc"));
        command.keys = vec![
            scalar_set(&[("time", 0, 0), ("depth", 0, 0)]),
            scalar_set(&[("time", 1, 1), ("depth", 1, 1)]),
        ];
        command.merge_keys(&["time", "depth"]).unwrap();
        assert_eq!(command.keys.len(), 2);
    }

    #[test]
    fn absent_in_file_keys_merge_to_absent() {
        let mut command = Command::new(PathBuf::from("sst.nc"));
        let mut a = CommandKeys::default();
        a.set(
            "time",
            KeyPair {
                in_file: None,
                memory: Key::index(0),
            },
        );
        let mut b = CommandKeys::default();
        b.set(
            "time",
            KeyPair {
                in_file: None,
                memory: Key::index(1),
            },
        );
        command.keys = vec![a, b];
        command.merge_keys(&["time"]).unwrap();
        assert_eq!(command.keys.len(), 1);
        let pair = command.keys[0].get("time").unwrap();
        assert_eq!(pair.in_file, None);
        assert_eq!(pair.memory.as_list().unwrap(), vec![0, 1]);
    }

    #[test]
    fn memory_order_sorts_in_file_alongside() {
        let mut pair = KeyPair {
            in_file: Some(Key::index(5)),
            memory: Key::index(2),
        };
        let other = KeyPair {
            in_file: Some(Key::index(9)),
            memory: Key::index(0),
        };
        assert!(pair.merge(&other).unwrap());
        assert_eq!(pair.memory.as_list().unwrap(), vec![0, 2]);
        assert_eq!(pair.in_file.unwrap().as_list().unwrap(), vec![9, 5]);
    }
}

//! `filearray` indexes collections of heterogeneous, multi-file on-disk
//! datasets and addresses them as one logical multidimensional array, by
//! coordinate rather than by file.
//!
//! Three subsystems cooperate:
//! - **Scanning** discovers, from filenames and file contents, which
//!   coordinate values exist and where they physically live. Filenames are
//!   described by a typed pattern grammar ([`pregex`]); per-coordinate
//!   scanning state lives in [`filegroup::coord_scan`].
//! - **Selection** is expressed with the [`key`] algebra: per-dimension
//!   integer, list, slice, or name keys, grouped into a
//!   [`Keyring`](key::keyring::Keyring), with composition and
//!   list-to-slice simplification.
//! - **Load planning** ([`filegroup::load`]) turns a selection over the
//!   reconciled index space into the minimal set of per-file read commands,
//!   merges them, and drives a [format adapter](format) to fill the
//!   caller's destination array.
//!
//! A [`Dataset`](dataset::Dataset) ties several [`Filegroup`]s together,
//! reconciling their scanned values into one available index space
//! (intersection by default, union on request).
//!
//! ## Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use filearray::coord::Coord;
//! # use filearray::dataset::DatasetBuilder;
//! # use filearray::filegroup::coord_scan::{CoordScan, Sharing};
//! # use filearray::filegroup::scanner::Scanner;
//! # use filearray::filegroup::Filegroup;
//! # use filearray::key::Key;
//! # use filearray::key::keyring::Keyring;
//! # use filearray::pregex::Pregex;
//! # fn example(format: filearray::format::FormatRef) -> Result<(), Box<dyn std::error::Error>> {
//! let pregex = Pregex::compile(r"SSH_%(time:x)\.nc")?;
//! let mut fg = Filegroup::new("ssh", "/data/ssh", pregex, format);
//! let mut time = CoordScan::new("time", "ssh", Sharing::Shared);
//! time.add_scanner(Scanner::filename_value());
//! fg.add_coord(time);
//! fg.set_variables(&[("ssh", "sea_surface_height")]);
//!
//! let mut dataset = DatasetBuilder::new()
//!     .coord(Coord::new("time"))
//!     .filegroup(fg)
//!     .build();
//! dataset.scan_all()?;
//!
//! let request: Keyring = [("time", Key::from(0..4))].into_iter().collect();
//! let mut dest = ndarray::ArrayD::zeros(ndarray::IxDyn(&[1, 4]));
//! dataset.load(&request, &mut dest)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Licence
//! `filearray` is licensed under either of
//!  - the Apache License, Version 2.0 [LICENSE-APACHE](https://www.apache.org/licenses/LICENSE-2.0) or
//!  - the MIT license [LICENSE-MIT](https://opensource.org/licenses/MIT), at your option.

pub mod accessor;
pub mod coord;
pub mod dataset;
pub mod filegroup;
pub mod format;
pub mod key;
pub mod pregex;

pub use dataset::{Dataset, DatasetBuilder, Reconcile};
pub use filegroup::Filegroup;

/// Name of the string-valued variable dimension.
///
/// Always present in a dataset's dimension order; its values keep discovery
/// order and reconcile as a union across filegroups.
pub const VARIABLE_DIM: &str = "var";

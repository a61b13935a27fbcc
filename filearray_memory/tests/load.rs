//! End-to-end scanning and loading against the in-memory format.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};
use tempfile::TempDir;

use filearray::coord::{Coord, Value};
use filearray::dataset::DatasetBuilder;
use filearray::filegroup::coord_scan::{CoordScan, Sharing};
use filearray::filegroup::load::LoadError;
use filearray::filegroup::scanner::Scanner;
use filearray::filegroup::Filegroup;
use filearray::format::ScanItem;
use filearray::key::keyring::Keyring;
use filearray::key::Key;
use filearray_memory::{MemoryFile, MemoryFormat};

fn touch(dir: &Path, name: &str) {
    File::create(dir.join(name)).unwrap();
}

fn scalar_file(variable: &str, value: f64) -> MemoryFile {
    MemoryFile::new(&[]).variable(variable, ArrayD::from_elem(IxDyn(&[]), value))
}

/// One file per time step, the value carried only by the filename.
fn ssh_filegroup(dir: &Path, format: &Arc<MemoryFormat>) -> Filegroup {
    for (day, value) in [("01", 1.0), ("09", 9.0)] {
        let name = format!("SSH_200701{day}.nc");
        touch(dir, &name);
        format.insert(dir.join(&name), scalar_file("ssh", value));
    }
    let pregex = filearray::pregex::Pregex::compile(r"SSH_%(time:x)\.nc").unwrap();
    let mut fg = Filegroup::new("ssh", dir, pregex, format.clone());
    let mut time = CoordScan::new("time", "ssh", Sharing::Shared);
    time.add_scanner(Scanner::filename_value());
    fg.add_coord(time);
    fg.set_variables(&[("ssh", "ssh")]);
    fg
}

#[test]
fn one_value_per_file_plans_one_read() {
    let dir = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(ssh_filegroup(dir.path(), &format))
        .build();
    dataset.scan_all().unwrap();
    assert_eq!(
        dataset.coord("time").unwrap().values(),
        &[Value::Float(20_070_101.0), Value::Float(20_070_109.0)]
    );

    let request: Keyring = [("var", Key::name("ssh")), ("time", Key::index(1))]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[]));
    let before = format.opens();
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest[IxDyn(&[])], 9.0);
    // exactly one file was opened, the right one
    assert_eq!(format.opens() - before, 1);
}

#[test]
fn full_request_fills_in_file_order() {
    let dir = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(ssh_filegroup(dir.path(), &format))
        .build();
    dataset.scan_all().unwrap();

    let request: Keyring = [("var", Key::name("ssh")), ("time", Key::all())]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[2]));
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest.as_slice().unwrap(), &[1.0, 9.0]);
}

#[test]
fn strided_request_merges_into_one_read() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "tao.nc");
    let format = Arc::new(MemoryFormat::new());
    // arr[time, depth] = 10 * time + depth
    let data = ArrayD::from_shape_fn(IxDyn(&[5, 3]), |ix| 10.0 * ix[0] as f64 + ix[1] as f64);
    format.insert(
        dir.path().join("tao.nc"),
        MemoryFile::new(&["time", "depth"]).variable("temp", data),
    );

    let pregex = filearray::pregex::Pregex::compile(r"tao\.nc").unwrap();
    let mut fg = Filegroup::new("tao", dir.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "tao", Sharing::In);
    time.set_manual((0..5).map(|i| ScanItem::indexed(i as f64, i)).collect());
    fg.add_coord(time);
    let mut depth = CoordScan::new("depth", "tao", Sharing::In);
    depth.set_manual(
        (0..3)
            .map(|i| ScanItem::indexed(100.0 * i as f64, i))
            .collect(),
    );
    fg.add_coord(depth);
    fg.set_variables(&[("temp", "temp")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .coord(Coord::new("depth"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();

    let request: Keyring = [
        ("var", Key::name("temp")),
        ("time", Key::indices(vec![0, 2, 4])),
        ("depth", Key::index(0)),
    ]
    .into_iter()
    .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3]));
    let before = format.opens();
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest.as_slice().unwrap(), &[0.0, 20.0, 40.0]);
    assert_eq!(format.opens() - before, 1);
}

#[test]
fn descending_in_file_indices_read_reversed() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "rev.nc");
    let format = Arc::new(MemoryFormat::new());
    // time axis stored newest first: value 1 sits at in-file index 2
    format.insert(
        dir.path().join("rev.nc"),
        MemoryFile::new(&["time"]).variable(
            "sst",
            ArrayD::from_shape_vec(IxDyn(&[3]), vec![3.0, 2.0, 1.0]).unwrap(),
        ),
    );
    let pregex = filearray::pregex::Pregex::compile(r"rev\.nc").unwrap();
    let mut fg = Filegroup::new("rev", dir.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "rev", Sharing::In);
    time.set_manual(vec![
        ScanItem::indexed(1.0, 2),
        ScanItem::indexed(2.0, 1),
        ScanItem::indexed(3.0, 0),
    ]);
    fg.add_coord(time);
    fg.set_variables(&[("sst", "sst")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();
    assert!(dataset
        .filegroup("rev")
        .unwrap()
        .coord("time")
        .unwrap()
        .is_index_descending());

    let request: Keyring = [("var", Key::name("sst")), ("time", Key::index(0))]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[]));
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest[IxDyn(&[])], 1.0);
}

#[test]
fn chunk_axes_follow_destination_order() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "grid.nc");
    let format = Arc::new(MemoryFormat::new());
    // file stores [lat, time]; the dataset orders [time, lat]
    let data = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |ix| 100.0 * ix[0] as f64 + ix[1] as f64);
    format.insert(
        dir.path().join("grid.nc"),
        MemoryFile::new(&["lat", "time"]).variable("sst", data),
    );
    let pregex = filearray::pregex::Pregex::compile(r"grid\.nc").unwrap();
    let mut fg = Filegroup::new("grid", dir.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "grid", Sharing::In);
    time.set_manual((0..3).map(|i| ScanItem::indexed(i as f64, i)).collect());
    fg.add_coord(time);
    let mut lat = CoordScan::new("lat", "grid", Sharing::In);
    lat.set_manual((0..2).map(|i| ScanItem::indexed(10.0 * i as f64, i)).collect());
    fg.add_coord(lat);
    fg.set_variables(&[("sst", "sst")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .coord(Coord::new("lat"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();

    let request: Keyring = [
        ("var", Key::name("sst")),
        ("time", Key::all()),
        ("lat", Key::all()),
    ]
    .into_iter()
    .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3, 2]));
    dataset.load(&request, &mut dest).unwrap();
    for t in 0..3 {
        for l in 0..2 {
            assert_eq!(dest[IxDyn(&[t, l])], 100.0 * l as f64 + t as f64);
        }
    }
}

#[test]
fn destination_shape_must_match_request() {
    let dir = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(ssh_filegroup(dir.path(), &format))
        .build();
    dataset.scan_all().unwrap();

    let request: Keyring = [("var", Key::name("ssh")), ("time", Key::all())]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3]));
    assert!(matches!(
        dataset.load(&request, &mut dest),
        Err(LoadError::ShapeMismatch { .. })
    ));
}

#[test]
fn bad_file_does_not_abort_the_rest() {
    let dir = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    let fg = ssh_filegroup(dir.path(), &format);
    // drop one file's content while keeping it on disk
    touch(dir.path(), "SSH_20070120.nc");

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();
    assert_eq!(dataset.coord("time").unwrap().len(), 3);

    let request: Keyring = [("var", Key::name("ssh")), ("time", Key::all())]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3]));
    let err = dataset.load(&request, &mut dest).unwrap_err();
    match err {
        LoadError::CommandsFailed { failures, total } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(total, 3);
            assert!(failures[0].path.ends_with("SSH_20070120.nc"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // the readable files were still loaded
    assert_eq!(dest[IxDyn(&[0])], 1.0);
    assert_eq!(dest[IxDyn(&[1])], 9.0);
}

#[test]
fn two_filegroups_fill_disjoint_variables() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    let fg_ssh = ssh_filegroup(dir_a.path(), &format);

    for (day, value) in [("01", 10.0), ("09", 90.0)] {
        let name = format!("SST_200701{day}.nc");
        touch(dir_b.path(), &name);
        format.insert(dir_b.path().join(&name), scalar_file("analysed_sst", value));
    }
    let pregex = filearray::pregex::Pregex::compile(r"SST_%(time:x)\.nc").unwrap();
    let mut fg_sst = Filegroup::new("sst", dir_b.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "sst", Sharing::Shared);
    time.add_scanner(Scanner::filename_value());
    fg_sst.add_coord(time);
    fg_sst.set_variables(&[("sst", "analysed_sst")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(fg_ssh)
        .filegroup(fg_sst)
        .build();
    dataset.scan_all().unwrap();
    assert_eq!(dataset.coord("var").unwrap().len(), 2);

    let request: Keyring = [
        ("var", Key::names(vec!["ssh".into(), "sst".into()])),
        ("time", Key::all()),
    ]
    .into_iter()
    .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[2, 2]));
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest[IxDyn(&[0, 0])], 1.0);
    assert_eq!(dest[IxDyn(&[0, 1])], 9.0);
    assert_eq!(dest[IxDyn(&[1, 0])], 10.0);
    assert_eq!(dest[IxDyn(&[1, 1])], 90.0);
}

#[test]
fn two_coordinates_share_one_open_file_while_scanning() {
    let dir = TempDir::new().unwrap();
    touch(dir.path(), "prof.nc");
    let format = Arc::new(MemoryFormat::new());
    let data = ArrayD::from_shape_fn(IxDyn(&[2, 3]), |ix| 10.0 * ix[0] as f64 + ix[1] as f64);
    format.insert(
        dir.path().join("prof.nc"),
        MemoryFile::new(&["time", "depth"])
            .variable("temp", data)
            .coord_values("time", vec![1.0, 2.0])
            .coord_values("depth", vec![0.0, 100.0, 200.0]),
    );

    let pregex = filearray::pregex::Pregex::compile(r"prof\.nc").unwrap();
    let mut fg = Filegroup::new("prof", dir.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "prof", Sharing::In);
    time.add_scanner(Scanner::in_file_values("time"));
    fg.add_coord(time);
    let mut depth = CoordScan::new("depth", "prof", Sharing::In);
    depth.add_scanner(Scanner::in_file_values("depth"));
    fg.add_coord(depth);
    fg.set_variables(&[("temp", "temp")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .coord(Coord::new("depth"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();
    // both coordinates were scanned from a single open handle
    assert_eq!(format.opens(), 1);
    assert_eq!(
        dataset.coord("time").unwrap().values(),
        &[Value::Float(1.0), Value::Float(2.0)]
    );
    assert_eq!(dataset.coord("depth").unwrap().len(), 3);

    let request: Keyring = [
        ("var", Key::name("temp")),
        ("time", Key::index(1)),
        ("depth", Key::all()),
    ]
    .into_iter()
    .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3]));
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest.as_slice().unwrap(), &[10.0, 11.0, 12.0]);
}

#[test]
fn in_file_scanning_refines_filename_values() {
    let dir = TempDir::new().unwrap();
    let format = Arc::new(MemoryFormat::new());
    // two monthly files, days stored inside
    for (month, days, base) in [("01", vec![1.0, 15.0], 0.0), ("02", vec![3.0], 100.0)] {
        let name = format!("sst_2007-{month}.nc");
        touch(dir.path(), &name);
        let data = ArrayD::from_shape_fn(IxDyn(&[days.len()]), |ix| base + ix[0] as f64);
        format.insert(
            dir.path().join(&name),
            MemoryFile::new(&["time"])
                .variable("sst", data)
                .coord_values("time", days.iter().map(|d| base + d).collect()),
        );
    }
    let pregex = filearray::pregex::Pregex::compile(r"sst_%(time:Y)-%(time:mm)\.nc").unwrap();
    let mut fg = Filegroup::new("sst", dir.path(), pregex, format.clone());
    let mut time = CoordScan::new("time", "sst", Sharing::Shared);
    time.add_scanner(Scanner::in_file_values("time"));
    fg.add_coord(time);
    fg.set_variables(&[("sst", "sst")]);

    let mut dataset = DatasetBuilder::new()
        .coord(Coord::new("time"))
        .filegroup(fg)
        .build();
    dataset.scan_all().unwrap();
    assert_eq!(
        dataset.coord("time").unwrap().values(),
        &[Value::Float(1.0), Value::Float(15.0), Value::Float(103.0)]
    );

    let request: Keyring = [("var", Key::name("sst")), ("time", Key::all())]
        .into_iter()
        .collect();
    let mut dest = ArrayD::zeros(IxDyn(&[3]));
    dataset.load(&request, &mut dest).unwrap();
    assert_eq!(dest.as_slice().unwrap(), &[0.0, 1.0, 100.0]);
}

//! Saving and loading indexes through the file system.

mod common;

use common::{truth_wcs, Sky};
use quadsolve::{IndexAccess, ReferenceIndex, SolveSession, SolveStatus, SolverConfig};
use tempfile::TempDir;

#[test]
fn saved_index_loads_identically_and_solves() {
    let sky = Sky::new(truth_wcs(0.8, -0.3, 0.4, false), 160, 21);
    let index = sky.index(9);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index-9.rkyv");

    index.save_to_file(&path).unwrap();
    let loaded = ReferenceIndex::load_from_file(&path).unwrap();

    assert_eq!(loaded.to_data(), index.to_data());
    assert_eq!(loaded.properties().index_id, 9);
    assert_eq!(loaded.star_id(0), 10_000);

    // The rebuilt trees answer the same queries.
    let field = sky.field(30, 5, 0.2, 22);
    let config = SolverConfig::new(1.0, 4.0);
    let a = SolveSession::new(&config, std::slice::from_ref(&index), &field).run();
    let b = SolveSession::new(&config, std::slice::from_ref(&loaded), &field).run();
    assert_eq!(a.status, SolveStatus::Solved);
    assert_eq!(b.status, SolveStatus::Solved);
    let (a, b) = (a.best.unwrap(), b.best.unwrap());
    assert_eq!((a.quad_id, a.field), (b.quad_id, b.field));
    assert_eq!(a.log_odds, b.log_odds);
}

#[test]
fn missing_file_reports_the_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.rkyv");
    let err = ReferenceIndex::load_from_file(&path).unwrap_err();
    assert!(format!("{err:#}").contains("absent.rkyv"));
}

#[test]
fn truncated_file_is_rejected() {
    let sky = Sky::new(truth_wcs(0.8, -0.3, 0.4, false), 60, 23);
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.rkyv");
    let bytes = sky.index(1).to_rkyv_bytes().unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
    assert!(ReferenceIndex::load_from_file(&path).is_err());
}

#![allow(missing_docs)]

use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn demo_snapshot(keys: u32) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("demo.snap");
    cargo_bin_cmd!("mvbtree")
        .args(["demo", "--keys", &keys.to_string()])
        .arg(&path)
        .assert()
        .success();
    (dir, path)
}

fn json_output(args: &[&str], path: &PathBuf) -> Value {
    let output = cargo_bin_cmd!("mvbtree")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn demo_then_stats_reports_size() {
    let (_dir, path) = demo_snapshot(200);
    let json = json_output(&["stats"], &path);
    // 20 keys carry three ids, the rest one, plus three null ids
    assert_eq!(json["size"].as_u64(), Some(180 + 20 * 3 + 3));
    assert_eq!(json["null_values"].as_u64(), Some(3));
    assert_eq!(json["first_key"].as_str(), Some("0"));
    assert_eq!(json["last_key"].as_str(), Some("199"));
}

#[test]
fn verify_succeeds_on_demo_snapshot() {
    let (_dir, path) = demo_snapshot(2_000);
    let json = json_output(&["verify"], &path);
    assert_eq!(json["issues"].as_array().map(Vec::len), Some(0));
    assert_eq!(json["keys"].as_u64(), Some(2_000));
    assert!(json["depth"].as_u64().unwrap_or(0) >= 2);
}

#[test]
fn dump_honors_bounds_and_direction() {
    let (_dir, path) = demo_snapshot(100);
    let json = json_output(&["dump", "--from", "10", "--to", "12", "--descending"], &path);
    let rows = json.as_array().expect("array of rows");
    let keys: Vec<&str> = rows.iter().filter_map(|row| row["key"].as_str()).collect();
    assert_eq!(keys, vec!["12", "11", "10", "10", "10"]);
}

#[test]
fn demo_refuses_to_overwrite() {
    let (_dir, path) = demo_snapshot(10);
    cargo_bin_cmd!("mvbtree")
        .arg("demo")
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn unknown_tree_fails() {
    let (_dir, path) = demo_snapshot(10);
    cargo_bin_cmd!("mvbtree")
        .args(["stats", "--tree", "missing"])
        .arg(&path)
        .assert()
        .failure();
}

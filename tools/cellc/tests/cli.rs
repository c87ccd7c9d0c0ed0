use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn board(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../boards")
        .join(name)
}

const BROKEN_BOARD: &str = r#"{
  "hypervisor_memory": { "phys_start": "0x1f400000", "size": "0x800000" },
  "root_cell": {
    "name": "root",
    "cpus": [0],
    "memory_regions": [
      { "phys_start": "0x0", "size": "0x10000000", "flags": ["read", "write"] }
    ],
    "irqchips": [{ "address": "0xff581000", "pin_base": 0, "ranges": [25] }]
  },
  "cells": [
    {
      "name": "guest",
      "cpus": [1],
      "memory_regions": [
        { "phys_start": "0x1000000", "size": "0x1000", "flags": ["read", "write"] },
        { "virt_start": "0x80000000", "size": "0x1000", "flags": ["read", "write", "comm-region"] }
      ],
      "irqchips": [{ "address": "0xff581000", "pin_base": 0, "ranges": [25] }]
    }
  ]
}"#;

#[test]
fn compile_writes_one_file_per_cell() {
    let tmp = TempDir::new().unwrap();
    cargo_bin_cmd!("cellc")
        .args(["compile", "--out-dir"])
        .arg(tmp.path())
        .arg(board("rk3308.json"))
        .assert()
        .success();

    let system = fs::read(tmp.path().join("rk3308.cell")).unwrap();
    let guest = fs::read(tmp.path().join("rk3308-linux.cell")).unwrap();
    assert_eq!(&system[..5], b"JHSYS");
    assert_eq!(&guest[..6], b"JHCELL");
}

#[test]
fn check_reports_every_error_and_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("broken.json");
    fs::write(&path, BROKEN_BOARD).unwrap();

    cargo_bin_cmd!("cellc")
        .arg("check")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("overlaps"))
        .stderr(predicate::str::contains("interrupt 25"));

    let files: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[test]
fn one_bad_board_blocks_all_output() {
    let tmp = TempDir::new().unwrap();
    let broken = tmp.path().join("broken.json");
    fs::write(&broken, BROKEN_BOARD).unwrap();
    let out = tmp.path().join("out");

    cargo_bin_cmd!("cellc")
        .args(["compile", "--out-dir"])
        .arg(&out)
        .arg(board("rk3308.json"))
        .arg(&broken)
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 board(s) failed"));

    assert!(!out.exists());
}

#[test]
fn failed_write_leaves_no_descriptor_behind() {
    let tmp = TempDir::new().unwrap();
    fs::create_dir(tmp.path().join("rk3308-linux.cell")).unwrap();

    cargo_bin_cmd!("cellc")
        .args(["compile", "--out-dir"])
        .arg(tmp.path())
        .arg(board("rk3308.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("is a directory"));

    let names: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(names, ["rk3308-linux.cell"]);
}

#[test]
fn inspect_prints_tables() {
    let tmp = TempDir::new().unwrap();
    cargo_bin_cmd!("cellc")
        .args(["-q", "compile", "--out-dir"])
        .arg(tmp.path())
        .arg(board("rk3308.json"))
        .assert()
        .success();

    cargo_bin_cmd!("cellc")
        .arg("inspect")
        .arg(tmp.path().join("rk3308-linux.cell"))
        .assert()
        .success()
        .stdout(predicate::str::contains("cell descriptor `rk3308-linux`"))
        .stdout(predicate::str::contains("memory regions   11"))
        .stdout(predicate::str::contains("0001:00:03.0"));
}

#[test]
fn page_size_override_is_validated() {
    cargo_bin_cmd!("cellc")
        .args(["check", "--page-size", "0x1800"])
        .arg(board("rk3308.json"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("page size 0x1800"));
}

#[test]
fn inspect_rejects_garbage() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("junk.cell");
    fs::write(&path, b"not a descriptor").unwrap();

    cargo_bin_cmd!("cellc")
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid descriptor"));
}

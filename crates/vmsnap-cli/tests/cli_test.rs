//! End-to-end tests for the vmsnap binary

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Run vmsnap with `dir` as both HOME and working directory.
fn vmsnap(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vmsnap"))
        .args(args)
        .current_dir(dir)
        .env("HOME", dir)
        .env("VMSNAP_CACHE_ROOT", dir.join("cache"))
        .env_remove("VMSNAP_ENABLE_LOCAL_SNAPSHOT_SHARING")
        .env_remove("VMSNAP_CHUNK_SIZE")
        .env_remove("VMSNAP_GROUP_ID")
        .output()
        .expect("Failed to execute vmsnap")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

const KEY: [&str; 6] = [
    "--instance",
    "ci",
    "--platform",
    "OSFamily=linux",
    "--runner-id",
    "runner-1",
];

#[test]
fn test_config_path() {
    let temp = TempDir::new().unwrap();
    let output = vmsnap(temp.path(), &["config", "path"]);
    let out = stdout(&output);

    assert!(output.status.success());
    assert!(out.contains("Global:"));
    assert!(out.contains("Project:"));
}

#[test]
fn test_config_show_reflects_env() {
    let temp = TempDir::new().unwrap();
    let output = vmsnap(temp.path(), &["config", "show"]);
    assert!(output.status.success());

    let parsed: toml::Value = toml::from_str(&stdout(&output)).unwrap();
    let root = parsed["storage"]["cache_root"].as_str().unwrap();
    assert_eq!(Path::new(root), temp.path().join("cache"));
    assert_eq!(
        parsed["snapshot"]["chunk_size_bytes"].as_integer(),
        Some(4 * 1024 * 1024)
    );
}

#[test]
fn test_config_init() {
    let temp = TempDir::new().unwrap();

    let output = vmsnap(temp.path(), &["config", "init"]);
    assert!(output.status.success());
    assert!(temp.path().join(".vmsnap/config.toml").exists());

    let again = vmsnap(temp.path(), &["config", "init"]);
    assert!(!again.status.success());

    let forced = vmsnap(temp.path(), &["config", "init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn test_save_show_restore_delete() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let state = patterned(4096, 1);
    let disk = patterned(3 * 1024 * 1024 + 100, 2);
    fs::write(dir.join("vm.state"), &state).unwrap();
    fs::write(dir.join("disk.img"), &disk).unwrap();

    let mut save = vec!["save"];
    save.extend(KEY);
    save.extend([
        "--vm-state",
        "vm.state",
        "--chunked",
        "scratchfs=disk.img",
        "--chunk-size",
        "1048576",
        "--vcpus",
        "2",
        "--mem-mb",
        "512",
    ]);
    let output = vmsnap(dir, &save);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output).contains("Saved snapshot"));

    let mut show = vec!["show"];
    show.extend(KEY);
    let output = vmsnap(dir, &show);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("vm.state"));
    assert!(out.contains("scratchfs"));
    assert!(out.contains("4 chunks"));
    assert!(out.contains("2 vCPU"));

    let mut restore = vec!["restore"];
    restore.extend(KEY);
    restore.extend(["-o", "out", "--flatten"]);
    let output = vmsnap(dir, &restore);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(fs::read(dir.join("out/vm.state")).unwrap(), state);
    assert_eq!(fs::read(dir.join("out/scratchfs.img")).unwrap(), disk);
    assert!(dir.join("out/scratchfs/3145728").exists());

    let mut delete = vec!["delete"];
    delete.extend(KEY);
    let output = vmsnap(dir, &delete);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Deleted 2 of 2"));

    let output = vmsnap(dir, &show);
    assert!(!output.status.success());
}

#[test]
fn test_show_unknown_snapshot_fails() {
    let temp = TempDir::new().unwrap();
    let output = vmsnap(temp.path(), &["show", "--instance", "nope"]);
    assert!(!output.status.success());
}

#[test]
fn test_save_rejects_bad_chunked_name() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("disk.img"), b"data").unwrap();
    let output = vmsnap(temp.path(), &["save", "--chunked", "../x=disk.img"]);
    assert!(!output.status.success());
}

#[test]
fn test_image_converted_then_reused() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    let image = patterned(2 * 1024 * 1024 + 10, 9);
    fs::write(dir.join("alpine.ext4"), &image).unwrap();

    let args = |out: &'static str| {
        vec![
            "image",
            "--ref",
            "docker.io/library/alpine:3.19",
            "--path",
            "alpine.ext4",
            "-o",
            out,
            "--chunk-size",
            "1048576",
        ]
    };

    let first = vmsnap(dir, &args("out1"));
    assert!(first.status.success(), "{}", String::from_utf8_lossy(&first.stderr));
    assert!(stdout(&first).starts_with("Converted"));

    fs::remove_file(dir.join("alpine.ext4")).unwrap();
    let second = vmsnap(dir, &args("out2"));
    assert!(second.status.success(), "{}", String::from_utf8_lossy(&second.stderr));
    assert!(stdout(&second).starts_with("Reused"));
    assert!(stdout(&second).contains("3 chunks"));
    assert_eq!(
        fs::read(dir.join("out2/rootfs.ext4/2097152")).unwrap(),
        image[2 * 1024 * 1024..]
    );
}

#[test]
fn test_stats() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();

    let output = vmsnap(dir, &["stats"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("not created"));

    fs::write(dir.join("kernel"), b"vmlinux").unwrap();
    let output = vmsnap(dir, &["save", "--kernel", "kernel"]);
    assert!(output.status.success());

    let output = vmsnap(dir, &["stats"]);
    let out = stdout(&output);
    assert!(output.status.success());
    assert!(out.contains("Entries:    2"));
}

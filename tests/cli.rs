use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn lemon3(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("lemon3").unwrap();
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("XDG_CACHE_HOME", home.join("cache"))
        .env_remove("LEMON3_LOG");
    cmd
}

#[test]
fn config_path_honours_the_flag() {
    let home = tempdir().unwrap();
    let file = home.path().join("custom.yaml");
    lemon3(home.path())
        .args(["config", "path", "--config"])
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.yaml"));
}

#[test]
fn config_set_then_get() {
    let home = tempdir().unwrap();
    let file = home.path().join("lemon3.yaml");

    lemon3(home.path())
        .arg("--config")
        .arg(&file)
        .args(["config", "set", "account.fname", "@alice"])
        .assert()
        .success();
    assert!(fs::read_to_string(&file).unwrap().contains("alice"));

    lemon3(home.path())
        .arg("--config")
        .arg(&file)
        .args(["config", "get", "account.fname"])
        .assert()
        .success()
        .stdout("alice\n");
}

#[test]
fn config_ls_masks_the_private_key() {
    let home = tempdir().unwrap();
    let file = home.path().join("lemon3.yaml");
    fs::write(&file, "account:\n  private_key: deadbeef\n").unwrap();

    lemon3(home.path())
        .arg("--config")
        .arg(&file)
        .args(["config", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("account.private_key = ********"))
        .stdout(predicate::str::contains("deadbeef").not())
        .stdout(predicate::str::contains("feed.page_size = 100"));
}

#[test]
fn config_rejects_unknown_keys() {
    let home = tempdir().unwrap();
    let file = home.path().join("lemon3.yaml");
    lemon3(home.path())
        .arg("--config")
        .arg(&file)
        .args(["config", "set", "hub.colour", "blue"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown key"));
}

#[test]
fn download_rejects_malformed_references() {
    let home = tempdir().unwrap();
    lemon3(home.path())
        .arg("--config")
        .arg(home.path().join("none.yaml"))
        .args(["download", "alice-0x1234"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("@handle/0xhash"));
}

#[test]
fn upload_without_a_key_fails_before_touching_the_network() {
    let home = tempdir().unwrap();
    let track = home.path().join("track.txt");
    fs::write(&track, "la").unwrap();
    lemon3(home.path())
        .arg("--config")
        .arg(home.path().join("none.yaml"))
        .arg("upload")
        .arg(&track)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no app key configured"));
}

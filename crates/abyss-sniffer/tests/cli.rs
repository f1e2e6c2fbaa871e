use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

fn cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("abyss-sniffer"))
}

#[test]
fn help_describes_the_flags() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            contains("--interface")
                .and(contains("--port"))
                .and(contains("--list"))
                .and(contains("ws://127.0.0.1")),
        );
}

#[test]
fn version_includes_commit() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("commit").and(contains("built")));
}

#[test]
fn port_zero_is_a_usage_error() {
    cmd()
        .args(["-p", "0"])
        .assert()
        .failure()
        .stderr(contains("invalid value"));
}

#[test]
fn port_above_range_is_a_usage_error() {
    cmd()
        .args(["--port", "70000"])
        .assert()
        .failure()
        .stderr(contains("invalid value"));
}

#[test]
fn unknown_flag_is_a_usage_error() {
    cmd()
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(contains("unexpected argument"));
}

#[test]
fn missing_interface_fails_with_hint() {
    cmd()
        .args(["-i", "definitely-not-a-device0"])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error:").and(contains("hint:")));
}

#[test]
fn list_exits_cleanly() {
    cmd().arg("--list").assert().success();
}

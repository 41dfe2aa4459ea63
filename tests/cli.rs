mod common;

use common::agentbridge_bin;

#[test]
fn version_flag_prints_version() {
    agentbridge_bin()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("agentbridge"));
}

#[test]
fn help_flag_mentions_config() {
    agentbridge_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("config.toml"));
}

#[test]
fn missing_config_fails_with_a_hint() {
    let tmp = tempfile::tempdir().unwrap();
    agentbridge_bin()
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("config.toml"));
}

#[test]
fn unknown_option_is_rejected() {
    agentbridge_bin().arg("--bogus").assert().failure();
}

//! scenario_cli_help_lists_modes
//!
//! GREEN when `tlm --help` documents both run modes and the broker flags,
//! and an out-of-range `--qos` is rejected before anything connects.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn help_lists_sync_and_broker_flags() -> anyhow::Result<()> {
    let mut cmd = Command::cargo_bin("tlm")?;
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--sync"))
        .stdout(predicate::str::contains("--create"))
        .stdout(predicate::str::contains("--maxtries"))
        .stdout(predicate::str::contains("--config"));
    Ok(())
}

#[test]
fn qos_out_of_range_is_a_usage_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut cmd = Command::cargo_bin("tlm")?;
    cmd.env("LOGPATH", tmp.path()).args(["--qos", "3"]);
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--qos"));
    Ok(())
}

use assert_cmd::prelude::*; // Add methods on commands
use predicates::prelude::*; // Used for writing assertions
use std::process::Command; // Run programs

#[test]
fn spawner_without_a_subcommand_fails() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid subcommand"));

    Ok(())
}

#[test]
fn spawner_regions_lists_the_selectable_regions() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.arg("regions");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("ap-southeast-1"));

    Ok(())
}

#[test]
fn spawner_instances_prints_the_region_table() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.arg("instances").arg("us-east-1");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("t3.medium"));

    Ok(())
}

#[test]
fn spawner_instances_rejects_an_unknown_region() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.arg("instances").arg("mars-north-1");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("mars-north-1"));

    Ok(())
}

#[test]
fn spawner_spawn_rejects_a_garbled_volume() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.args(&["spawn", "bob", "t3.medium", "us-east-1", "--volume", "lots"])
        .env_remove("SPAWNER_CONFIG");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("lots is not a volume size"));

    Ok(())
}

#[test]
fn spawner_spawn_requires_a_config() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("spawner")?;

    cmd.args(&["spawn", "bob", "t3.medium", "us-east-1"])
        .env_remove("SPAWNER_CONFIG");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("SPAWNER_CONFIG"));

    Ok(())
}

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn mclauncher_cmd(config_dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mclauncher"));
    cmd.env("MCLAUNCHER_CONFIG_DIR", config_dir);
    cmd.env_remove("MCLAUNCHER_TICKET");
    cmd
}

#[test]
fn test_help_lists_commands() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("launch"))
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("cleanup-all"));
}

#[test]
fn test_config_path_honours_env() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            temp_dir.path().join("config.toml").display().to_string(),
        ));
}

#[test]
fn test_config_set_persists() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["config", "set", "download.timeout_secs", "120"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration saved"));

    let content = fs::read_to_string(temp_dir.path().join("config.toml")).unwrap();
    assert!(content.contains("timeout_secs = 120"));

    mclauncher_cmd(temp_dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("120s"));
}

#[test]
fn test_config_set_unknown_key() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["config", "set", "registry.url", "x"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("Available keys"))
        .stderr(predicate::str::contains("Configuration not changed"));

    assert!(!temp_dir.path().join("config.toml").exists());
}

#[test]
fn test_list_empty() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No versions installed."));
}

#[test]
fn test_list_shows_installed_versions() {
    let temp_dir = TempDir::new().unwrap();
    let versions = temp_dir.path().join("versions");
    fs::create_dir_all(versions.join("Minecraft-1.20.0.1")).unwrap();
    fs::create_dir_all(versions.join("Minecraft-Preview-1.21.0.20-GDK")).unwrap();
    fs::create_dir_all(versions.join("unrelated")).unwrap();
    let imported = temp_dir.path().join("imported_versions").join("Custom");
    fs::create_dir_all(&imported).unwrap();
    fs::write(imported.join("AppxManifest.xml"), b"<Package/>").unwrap();

    mclauncher_cmd(temp_dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("1.20.0.1 [archive]"))
        .stdout(predicate::str::contains("1.21.0.20 (preview) [container]"))
        .stdout(predicate::str::contains("Custom [archive]"))
        .stdout(predicate::str::contains("Total: 3 versions"))
        .stdout(predicate::str::contains("unrelated").not());
}

#[test]
fn test_download_requires_source() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["download", "1.20.0.1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--identifier"));
}

#[test]
fn test_download_rejects_unknown_channel() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["download", "1.20.0.1", "--channel", "nightly", "-i", "abc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown channel"));
}

#[test]
fn test_launch_not_installed() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["launch", "0.0.0.0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not installed"));
}

#[test]
fn test_import_missing_file() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["import"])
        .arg(temp_dir.path().join("nope.appx"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Package file not found"));
}

#[test]
fn test_completions() {
    let temp_dir = TempDir::new().unwrap();

    mclauncher_cmd(temp_dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mclauncher"));
}

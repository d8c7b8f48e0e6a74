//! Tests for the probe configuration manager

use crate::config::ConfigManager;
use std::path::PathBuf;
use tempfile::TempDir;

const PROBE_TOML: &str = r#"
monitor_port = 8765
latency_period_seconds = 60
"#;

const TESTS_TOML: &str = r#"
[[tests]]
name = "front page"
repeat = "60s"

[tests.query]
type = "http"
host = "www.example.com"

[[tests]]
name = "smtp banner"
repeat = "5m"

[tests.query]
type = "tcp"
host = "mail.example.com"
port = 25
"#;

fn write_config(dir: &TempDir, probe_toml: &str, tests_toml: &str) {
    std::fs::write(dir.path().join("probe.toml"), probe_toml).unwrap();
    std::fs::write(dir.path().join("tests.toml"), tests_toml).unwrap();
}

#[test]
fn test_missing_config_directory_is_rejected() {
    assert!(ConfigManager::new(PathBuf::from("/nonexistent/config/dir")).is_err());
}

#[test]
fn test_config_path_must_be_a_directory() {
    let temp_dir = TempDir::new().unwrap();
    let file_path = temp_dir.path().join("a-file");
    std::fs::write(&file_path, "x").unwrap();
    assert!(ConfigManager::new(file_path).is_err());
}

#[tokio::test]
async fn test_load_config() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, PROBE_TOML, TESTS_TOML);

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    manager.load_config().await.unwrap();

    let engine = manager.engine_config.as_ref().unwrap();
    assert_eq!(engine.monitor_port, Some(8765));

    let tests = manager.tests_config.as_ref().unwrap();
    assert_eq!(tests.tests.len(), 2);
    assert_eq!(tests.tests[0].name, "front page");

    assert!(manager.current_checksum.is_some());
}

#[tokio::test]
async fn test_invalid_tests_toml_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    write_config(
        &temp_dir,
        PROBE_TOML,
        r#"
        [[tests]]
        name = "broken"

        [tests.query]
        type = "gopher"
        host = "example.com"
        "#,
    );

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    assert!(manager.load_config().await.is_err());
}

#[tokio::test]
async fn test_nagios_selection_filters_tests() {
    let temp_dir = TempDir::new().unwrap();

    let objects_cache = temp_dir.path().join("objects.cache");
    std::fs::write(
        &objects_cache,
        "\
define service {
    service_description front page
    host_name web1
    }
define service {
    service_description smtp banner
    host_name mail1
    }
",
    )
    .unwrap();

    let probe_toml = format!(
        "nagios_object_file = {:?}\nnagios_host = \"web1\"\n",
        objects_cache.display().to_string()
    );
    write_config(&temp_dir, &probe_toml, TESTS_TOML);

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    manager.load_config().await.unwrap();

    // Only the service defined for web1 stays enabled.
    let tests = manager.tests_config.as_ref().unwrap();
    assert_eq!(tests.tests.len(), 1);
    assert_eq!(tests.tests[0].name, "front page");
}

#[tokio::test]
async fn test_object_file_resolves_through_nagios_main_config() {
    let temp_dir = TempDir::new().unwrap();

    let objects_cache = temp_dir.path().join("objects.cache");
    std::fs::write(
        &objects_cache,
        "\
define service {
    service_description smtp banner
    host_name mail1
    }
",
    )
    .unwrap();

    let nagios_cfg = temp_dir.path().join("nagios.cfg");
    std::fs::write(
        &nagios_cfg,
        format!("object_cache_file={}\n", objects_cache.display()),
    )
    .unwrap();

    let probe_toml = format!("nagios_config_file = {:?}\n", nagios_cfg.display().to_string());
    write_config(&temp_dir, &probe_toml, TESTS_TOML);

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    manager.load_config().await.unwrap();

    let tests = manager.tests_config.as_ref().unwrap();
    assert_eq!(tests.tests.len(), 1);
    assert_eq!(tests.tests[0].name, "smtp banner");
}

#[tokio::test]
async fn test_without_nagios_file_all_tests_run() {
    let temp_dir = TempDir::new().unwrap();
    write_config(&temp_dir, "", TESTS_TOML);

    let mut manager = ConfigManager::new(temp_dir.path().to_path_buf()).unwrap();
    manager.load_config().await.unwrap();
    assert_eq!(manager.tests_config.as_ref().unwrap().tests.len(), 2);
}

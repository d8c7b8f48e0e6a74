//! Configuration management for the probe engine
//!
//! This module handles loading and validation of the engine configuration
//! files (probe.toml and tests.toml) and the optional Nagios-seeded test
//! selection.

use anyhow::{Context, Result};
use shared::config::{EngineConfig, TestsConfig};
use shared::utils::calculate_checksum;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::nagios_objects::{ConfigParser, ObjectParser};

/// Configuration file names are defined as constants to avoid magic
/// strings and make it easier to change them in one place if needed.
const ENGINE_CONFIG_FILE: &str = "probe.toml";
const TESTS_CONFIG_FILE: &str = "tests.toml";

/// Manages probe configuration loading and validation.
pub struct ConfigManager {
    /// Directory containing configuration files.
    pub config_dir: PathBuf,
    /// Loaded engine configuration, `None` before the first load.
    pub engine_config: Option<EngineConfig>,
    /// Loaded test population, `None` before the first load.
    pub tests_config: Option<TestsConfig>,
    /// Checksum of the configuration files' content, used to detect
    /// changes without re-parsing.
    pub current_checksum: Option<String>,
}

impl ConfigManager {
    /// Create a new configuration manager.
    ///
    /// Fails early when the configuration directory is missing or not a
    /// directory, so misconfiguration surfaces at startup.
    pub fn new(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            return Err(anyhow::anyhow!(
                "Configuration directory does not exist: {}",
                config_dir.display()
            ));
        }

        if !config_dir.is_dir() {
            return Err(anyhow::anyhow!(
                "Configuration path is not a directory: {}",
                config_dir.display()
            ));
        }

        Ok(Self {
            config_dir,
            engine_config: None,
            tests_config: None,
            current_checksum: None,
        })
    }

    /// Load configuration files from disk.
    ///
    /// Reads and validates both files, applies the optional Nagios-seeded
    /// test selection, and records a checksum of the raw contents.
    pub async fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading probe configuration from {}",
            self.config_dir.display()
        );

        let engine_config_path = self.config_dir.join(ENGINE_CONFIG_FILE);
        let engine_toml_content = tokio::fs::read_to_string(&engine_config_path)
            .await
            .with_context(|| format!("Failed to read {}", engine_config_path.display()))?;

        let engine_config: EngineConfig =
            toml::from_str(&engine_toml_content).with_context(|| {
                format!(
                    "Failed to parse {} - TOML syntax error in engine configuration file",
                    engine_config_path.display()
                )
            })?;

        engine_config.validate().with_context(|| {
            format!(
                "Validation failed for engine configuration in {}",
                engine_config_path.display()
            )
        })?;

        let tests_config_path = self.config_dir.join(TESTS_CONFIG_FILE);
        let tests_toml_content = tokio::fs::read_to_string(&tests_config_path)
            .await
            .with_context(|| format!("Failed to read {}", tests_config_path.display()))?;

        let mut tests_config: TestsConfig =
            toml::from_str(&tests_toml_content).with_context(|| {
                format!(
                    "Failed to parse {} - TOML syntax error in tests configuration file",
                    tests_config_path.display()
                )
            })?;

        tests_config.validate().with_context(|| {
            format!(
                "Validation failed for tests configuration in {}",
                tests_config_path.display()
            )
        })?;

        Self::apply_nagios_selection(&engine_config, &mut tests_config).await?;

        self.current_checksum = Some(calculate_checksum(
            &engine_toml_content,
            &tests_toml_content,
        ));

        info!(
            test_count = tests_config.tests.len(),
            "Probe configuration loaded"
        );

        self.engine_config = Some(engine_config);
        self.tests_config = Some(tests_config);

        Ok(())
    }

    /// When a Nagios object file is configured, only tests matching one
    /// of its service descriptions stay enabled. The object file may be
    /// named directly or located through the `object_cache_file` entry
    /// of a Nagios main config. The optional `nagios_host` restricts the
    /// selection to that host's services.
    async fn apply_nagios_selection(
        engine_config: &EngineConfig,
        tests_config: &mut TestsConfig,
    ) -> Result<()> {
        let object_file = match (
            &engine_config.nagios_object_file,
            &engine_config.nagios_config_file,
        ) {
            (Some(object_file), _) => object_file.clone(),
            (None, Some(main_config)) => {
                let parser = ConfigParser::parse_file(std::path::Path::new(main_config))?;
                match parser.get("object_cache_file") {
                    Some(path) => path.to_string(),
                    None => {
                        return Err(anyhow::anyhow!(
                            "{main_config} does not define object_cache_file"
                        ));
                    }
                }
            }
            (None, None) => return Ok(()),
        };

        let content = tokio::fs::read_to_string(&object_file)
            .await
            .with_context(|| format!("Failed to read Nagios object file {object_file}"))?;

        let mut select = HashMap::new();
        if let Some(host) = &engine_config.nagios_host {
            select.insert("host_name".to_string(), vec![host.clone()]);
        }

        let parser = ObjectParser::parse(&content, &["service"], &select);
        let enabled: HashSet<&str> = parser
            .get("service")
            .iter()
            .filter_map(|record| record.get("service_description").map(String::as_str))
            .collect();

        let before = tests_config.tests.len();
        tests_config
            .tests
            .retain(|test| enabled.contains(test.name.as_str()));

        for test in &tests_config.tests {
            debug!("Nagios selection keeps test '{}'", test.name);
        }
        info!(
            "Nagios selection from {}: {} of {} tests enabled",
            object_file,
            tests_config.tests.len(),
            before
        );

        Ok(())
    }
}

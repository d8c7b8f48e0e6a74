//! Configuration types and validation for the probe engine
//!
//! This module defines the configuration structures loaded from
//! `probe.toml` (engine settings) and `tests.toml` (the test population),
//! including validation logic and the time-interval grammar used for
//! `repeat` and `timeout` values.

use crate::defaults::*;
use crate::ProbeError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Parse a repeat interval such as `"30s"`, `"5 min"` or `"1.5 hours"`.
///
/// `"0"`, the empty string, and whitespace-only strings all mean "no
/// repeat" and parse to a zero duration. Anything else must match
/// `N[.N] <unit>` where the unit is one of `s|sec|second(s)`,
/// `m|min|minute(s)` or `h|hour(s)`, case-insensitively.
pub fn parse_interval(value: &str) -> crate::Result<Duration> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let pattern = Regex::new(r"(?i)^(\d+(\.\d+)?)\s*(s|sec|seconds?|m|min|minutes?|h|hours?)$")
        .map_err(|e| ProbeError::Config(format!("interval pattern failed to compile: {e}")))?;

    let caps = pattern
        .captures(trimmed)
        .ok_or_else(|| ProbeError::Config(format!("Invalid time interval '{value}'")))?;

    let number: f64 = caps[1]
        .parse()
        .map_err(|e| ProbeError::Config(format!("Invalid time interval '{value}': {e}")))?;

    let seconds = match caps[3].chars().next().map(|c| c.to_ascii_lowercase()) {
        Some('s') => number,
        Some('m') => number * 60.0,
        Some('h') => number * 3600.0,
        _ => {
            return Err(ProbeError::Config(format!("Invalid time interval '{value}'")).into());
        }
    };

    Ok(Duration::from_secs_f64(seconds))
}

/// Parse a timeout value.
///
/// Accepts the same grammar as [`parse_interval`] plus bare numbers,
/// which are read as seconds. Timeouts must be positive and finite.
pub fn parse_timeout(value: &str) -> crate::Result<Duration> {
    let trimmed = value.trim();

    let duration = if let Ok(seconds) = trimmed.parse::<f64>() {
        if !seconds.is_finite() {
            return Err(ProbeError::Config(format!("Invalid timeout value '{value}'")).into());
        }
        Duration::from_secs_f64(seconds.max(0.0))
    } else {
        parse_interval(value)?
    };

    if duration.is_zero() {
        return Err(ProbeError::Config(format!("Invalid timeout value '{value}'")).into());
    }

    Ok(duration)
}

/// Main engine configuration loaded from probe.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// TCP port for the read-only monitoring endpoint (disabled if unset)
    #[serde(default)]
    pub monitor_port: Option<u16>,
    /// This node's peer id within the monitoring cluster
    #[serde(default)]
    pub peer_id: Option<u32>,
    /// Number of peers sharding the test population
    #[serde(default)]
    pub num_peers: Option<u32>,
    /// Length of the latency accounting window in seconds (default: 60)
    #[serde(default = "default_latency_period")]
    pub latency_period_seconds: u64,
    /// Buffer size of the scheduler's tick channels (default: 1000)
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
    /// Wait time for in-flight group runs during shutdown (default: 30)
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
    /// Optional Nagios object/status file used to select enabled tests
    #[serde(default)]
    pub nagios_object_file: Option<String>,
    /// Optional Nagios main config; its `object_cache_file` entry
    /// locates the object file when `nagios_object_file` is unset
    #[serde(default)]
    pub nagios_config_file: Option<String>,
    /// Restrict Nagios-seeded selection to services of this host
    #[serde(default)]
    pub nagios_host: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_port: None,
            peer_id: None,
            num_peers: None,
            latency_period_seconds: default_latency_period(),
            channel_buffer_size: default_channel_buffer_size(),
            graceful_shutdown_timeout_seconds: default_graceful_shutdown_timeout(),
            nagios_object_file: None,
            nagios_config_file: None,
            nagios_host: None,
        }
    }
}

impl EngineConfig {
    /// Semantic validation of the engine configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.latency_period_seconds == 0 {
            return Err(
                ProbeError::Validation("latency_period_seconds must be positive".into()).into(),
            );
        }

        if self.channel_buffer_size == 0 {
            return Err(
                ProbeError::Validation("channel_buffer_size must be positive".into()).into(),
            );
        }

        if let (Some(peer_id), Some(num_peers)) = (self.peer_id, self.num_peers) {
            if num_peers > 0 && peer_id >= num_peers {
                return Err(ProbeError::Validation(format!(
                    "peer_id {peer_id} is out of range for num_peers {num_peers}"
                ))
                .into());
            }
        }

        Ok(())
    }
}

/// Test population loaded from tests.toml
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TestsConfig {
    /// Array of monitoring tests to schedule
    pub tests: Vec<TestConfig>,
}

impl TestsConfig {
    /// Validates every test and checks for duplicate names.
    pub fn validate(&self) -> crate::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for test in &self.tests {
            test.validate()?;
            if !seen.insert(test.name.as_str()) {
                return Err(
                    ProbeError::Validation(format!("Duplicate test name '{}'", test.name)).into(),
                );
            }
        }
        tracing::debug!("Validated {} test definitions", self.tests.len());
        Ok(())
    }
}

/// Individual test configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TestConfig {
    /// Human-readable name for this test
    pub name: String,
    /// How often to run this test, e.g. "60s". Missing or "0" means the
    /// test runs once and is not rescheduled.
    #[serde(default)]
    pub repeat: Option<String>,
    /// Optional timeout bounding the test body
    #[serde(default)]
    pub timeout: Option<String>,
    /// Explicit shard index; defaults to the test's position in the file
    #[serde(default)]
    pub test_index: Option<u32>,
    /// Filter pipeline applied to the query result, in order
    #[serde(default)]
    pub filters: Vec<String>,
    /// The query this test is built on
    pub query: QueryConfig,
}

impl TestConfig {
    /// Semantic validation of one test entry.
    pub fn validate(&self) -> crate::Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProbeError::Validation("Test name cannot be empty".into()).into());
        }

        if let Some(repeat) = &self.repeat {
            parse_interval(repeat)?;
        }
        if let Some(timeout) = &self.timeout {
            parse_timeout(timeout)?;
        }

        self.query.validate()
    }

    /// The configured repeat interval; zero when the test is single-shot.
    pub fn repeat_interval(&self) -> crate::Result<Duration> {
        match &self.repeat {
            Some(repeat) => parse_interval(repeat),
            None => Ok(Duration::ZERO),
        }
    }
}

/// Individual query configuration
#[derive(Debug, Clone, PartialEq)]
pub struct QueryConfig {
    /// Type of query to perform
    pub query_type: QueryType,
    /// Optional timeout override (queries default to 15 seconds)
    pub timeout: Option<String>,
    /// Type-specific parameters
    pub params: QueryParams,
}

// Custom deserializer implementation for QueryConfig that uses the 'type'
// field to determine which params variant to deserialize, rather than
// relying on untagged enum field matching.
impl<'de> Deserialize<'de> for QueryConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{Error, MapAccess, Visitor};
        use std::fmt;

        struct QueryConfigVisitor;

        impl<'de> Visitor<'de> for QueryConfigVisitor {
            type Value = QueryConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a query configuration object")
            }

            fn visit_map<V>(self, mut map: V) -> Result<QueryConfig, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut query_type: Option<QueryType> = None;
                let mut timeout: Option<String> = None;
                let mut params_map = toml::map::Map::new();

                // Read all fields from the map
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => {
                            if query_type.is_some() {
                                return Err(Error::duplicate_field("type"));
                            }
                            query_type = Some(map.next_value()?);
                        }
                        "timeout" => {
                            if timeout.is_some() {
                                return Err(Error::duplicate_field("timeout"));
                            }
                            timeout = Some(map.next_value()?);
                        }
                        _ => {
                            // Collect all other fields for params deserialization
                            let value: toml::Value = map.next_value()?;
                            params_map.insert(key, value);
                        }
                    }
                }

                let query_type = query_type.ok_or_else(|| Error::missing_field("type"))?;

                // Deserialize params based on query_type (NOT based on
                // which fields are present)
                let params_value = toml::Value::Table(params_map);
                let params = match query_type {
                    QueryType::Noop => {
                        let params: NoopParams = params_value.try_into().map_err(|e| {
                            Error::custom(format!("Failed to parse noop query parameters: {e}"))
                        })?;
                        QueryParams::Noop(params)
                    }
                    QueryType::Http | QueryType::Https => {
                        let params: HttpParams = params_value.try_into().map_err(|e| {
                            Error::custom(format!("Failed to parse HTTP query parameters: {e}"))
                        })?;
                        QueryParams::Http(params)
                    }
                    QueryType::Tcp | QueryType::Ssl => {
                        let params: RawParams = params_value.try_into().map_err(|e| {
                            Error::custom(format!("Failed to parse raw query parameters: {e}"))
                        })?;
                        QueryParams::Raw(params)
                    }
                    QueryType::Subprocess => {
                        let params: SubprocessParams = params_value.try_into().map_err(|e| {
                            Error::custom(format!(
                                "Failed to parse subprocess query parameters: {e}"
                            ))
                        })?;
                        QueryParams::Subprocess(params)
                    }
                    QueryType::Snmp => {
                        let params: SnmpParams = params_value.try_into().map_err(|e| {
                            Error::custom(format!("Failed to parse SNMP query parameters: {e}"))
                        })?;
                        QueryParams::Snmp(params)
                    }
                };

                Ok(QueryConfig {
                    query_type,
                    timeout,
                    params,
                })
            }
        }

        deserializer.deserialize_map(QueryConfigVisitor)
    }
}

impl QueryConfig {
    /// Semantic validation of one query entry.
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(timeout) = &self.timeout {
            parse_timeout(timeout)?;
        }

        match &self.params {
            QueryParams::Noop(_) => Ok(()),
            QueryParams::Http(params) => params.validate(),
            QueryParams::Raw(params) => params.validate(),
            QueryParams::Subprocess(params) => params.validate(),
            QueryParams::Snmp(params) => params.validate(),
        }
    }

    /// Effective timeout of this query (defaults to 15 seconds).
    pub fn effective_timeout(&self) -> crate::Result<Duration> {
        match &self.timeout {
            Some(timeout) => parse_timeout(timeout),
            None => Ok(Duration::from_secs_f64(default_query_timeout_seconds())),
        }
    }
}

/// Different types of queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    /// Dummy query that resolves immediately with configured data
    Noop,
    /// HTTP GET or POST
    Http,
    /// HTTP GET or POST over TLS
    Https,
    /// Raw TCP exchange: write payload, read until peer close
    Tcp,
    /// Raw exchange over TLS
    Ssl,
    /// Shell command execution
    Subprocess,
    /// SNMP value retrieval
    Snmp,
}

/// Query-type-specific parameters
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParams {
    Noop(NoopParams),
    Http(HttpParams),
    Raw(RawParams),
    Subprocess(SubprocessParams),
    Snmp(SnmpParams),
}

/// Parameters for noop queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NoopParams {
    /// Literal payload the query resolves with
    #[serde(default)]
    pub data: Option<String>,
}

/// Parameters for HTTP and HTTPS queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpParams {
    /// Target host name or address
    pub host: String,
    /// Target port (defaults to 80 for http, 443 for https)
    #[serde(default)]
    pub port: Option<u16>,
    /// Request path (default: "/")
    #[serde(default = "default_http_path")]
    pub path: String,
    /// Request body; its presence switches the method from GET to POST
    #[serde(default)]
    pub data: Option<String>,
    /// Extra request headers; names are case-insensitive
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Whether to verify the server certificate (https only, default: false)
    #[serde(default)]
    pub verify_ssl: bool,
}

impl HttpParams {
    fn validate(&self) -> crate::Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProbeError::Validation("HTTP query host cannot be empty".into()).into());
        }
        Ok(())
    }
}

/// Parameters for raw TCP and SSL queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawParams {
    /// Target host name or address
    pub host: String,
    /// Target port
    pub port: u16,
    /// Payload written before the write side is closed
    #[serde(default)]
    pub data: Option<String>,
    /// Whether to verify the server certificate (ssl only, default: false)
    #[serde(default)]
    pub verify_ssl: bool,
}

impl RawParams {
    fn validate(&self) -> crate::Result<()> {
        if self.host.trim().is_empty() {
            return Err(ProbeError::Validation("Raw query host cannot be empty".into()).into());
        }
        Ok(())
    }
}

/// Parameters for subprocess queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubprocessParams {
    /// Shell command, run as `/bin/sh -c <command>`
    pub command: String,
    /// Payload written to the child's stdin before it is closed
    #[serde(default)]
    pub data: Option<String>,
    /// Environment overrides applied on top of the process environment
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Capture stderr interleaved with stdout instead of dropping it
    #[serde(default)]
    pub merge_stderr: bool,
}

impl SubprocessParams {
    fn validate(&self) -> crate::Result<()> {
        if self.command.trim().is_empty() {
            return Err(
                ProbeError::Validation("Subprocess query command cannot be empty".into()).into(),
            );
        }
        Ok(())
    }
}

/// Parameters for SNMP queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnmpParams {
    /// Target host name or address
    #[serde(default)]
    pub host: Option<String>,
    /// Target port (default: 161)
    #[serde(default = "default_snmp_port")]
    pub port: u16,
    /// Transport protocol: udp, tcp or unix (default: udp)
    #[serde(default = "default_snmp_protocol")]
    pub protocol: String,
    /// Socket path for the unix transport
    #[serde(default)]
    pub path: Option<String>,
    /// SNMP protocol version: "1" or "2c" (default: "2c")
    #[serde(default = "default_snmp_version")]
    pub version: String,
    /// Community string (required)
    #[serde(default)]
    pub community: Option<String>,
    /// Single OID to fetch
    #[serde(default)]
    pub oid: Option<String>,
    /// Table OID holding the values, for keyed lookup
    #[serde(default)]
    pub oid_base: Option<String>,
    /// Table OID holding the keys, for keyed lookup
    #[serde(default)]
    pub oid_key: Option<String>,
    /// Key value to look up in the oid_key table
    #[serde(default)]
    pub key: Option<String>,
}

impl SnmpParams {
    fn validate(&self) -> crate::Result<()> {
        if !matches!(self.protocol.as_str(), "udp" | "tcp" | "unix") {
            return Err(ProbeError::Validation(format!(
                "Invalid SNMP protocol: '{}'",
                self.protocol
            ))
            .into());
        }

        if self.protocol == "unix" {
            if self.path.as_deref().unwrap_or("").is_empty() {
                return Err(ProbeError::Validation(
                    "SNMP unix transport requires a socket path".into(),
                )
                .into());
            }
        } else if self.host.as_deref().unwrap_or("").trim().is_empty() {
            return Err(ProbeError::Validation("SNMP query host cannot be empty".into()).into());
        }

        if !matches!(self.version.as_str(), "1" | "2c") {
            return Err(ProbeError::Validation(format!(
                "Invalid SNMP version '{}'",
                self.version
            ))
            .into());
        }

        if self.community.as_deref().unwrap_or("").is_empty() {
            return Err(ProbeError::Validation("SNMP community is required".into()).into());
        }

        let keyed = [&self.oid_base, &self.oid_key, &self.key];
        if self.oid.is_some() {
            if keyed.iter().any(|field| field.is_some()) {
                return Err(ProbeError::Validation(
                    "oid cannot be used with oid_base, oid_key, and key".into(),
                )
                .into());
            }
        } else if !keyed.iter().all(|field| field.is_some()) {
            return Err(ProbeError::Validation(
                "oid or oid_base, oid_key, and key are required".into(),
            )
            .into());
        }

        Ok(())
    }
}

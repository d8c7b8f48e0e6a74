//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the
//! configuration structures. These functions are used by serde when
//! deserializing configuration files that don't specify certain optional
//! fields.

// Query defaults

/// Default query timeout (15 seconds)
pub fn default_query_timeout_seconds() -> f64 {
    15.0
}

/// Default HTTP port
pub fn default_http_port() -> u16 {
    80
}

/// Default HTTPS port
pub fn default_https_port() -> u16 {
    443
}

/// Default HTTP request path
pub fn default_http_path() -> String {
    "/".to_string()
}

/// Default SNMP port
pub fn default_snmp_port() -> u16 {
    161
}

/// Default SNMP transport protocol
pub fn default_snmp_protocol() -> String {
    "udp".to_string()
}

/// Default SNMP protocol version
pub fn default_snmp_version() -> String {
    "2c".to_string()
}

// Engine defaults

/// Default latency accounting window (60 seconds)
pub fn default_latency_period() -> u64 {
    60
}

/// Default channel buffer size for scheduler tick traffic
pub fn default_channel_buffer_size() -> usize {
    1000
}

/// Default graceful shutdown timeout (30 seconds)
pub fn default_graceful_shutdown_timeout() -> u64 {
    30
}

//! Test modules for the probe crate

mod config_tests;
mod filters_tests;
mod runnable_tests;
mod scheduler_tests;
mod test_tests;

use shared::config::{
    NoopParams, QueryConfig, QueryParams, QueryType, RawParams, SubprocessParams,
};
use std::collections::HashMap;

/// A noop query resolving with the given payload.
pub(crate) fn noop_config(data: &str) -> QueryConfig {
    QueryConfig {
        query_type: QueryType::Noop,
        timeout: None,
        params: QueryParams::Noop(NoopParams {
            data: Some(data.to_string()),
        }),
    }
}

/// A raw TCP query against a loopback port.
pub(crate) fn tcp_config(port: u16, data: Option<&str>, timeout: Option<&str>) -> QueryConfig {
    QueryConfig {
        query_type: QueryType::Tcp,
        timeout: timeout.map(str::to_string),
        params: QueryParams::Raw(RawParams {
            host: "127.0.0.1".to_string(),
            port,
            data: data.map(str::to_string),
            verify_ssl: false,
        }),
    }
}

/// A subprocess query with the ambient environment.
pub(crate) fn subprocess_config(command: &str, timeout: Option<&str>) -> QueryConfig {
    QueryConfig {
        query_type: QueryType::Subprocess,
        timeout: timeout.map(str::to_string),
        params: QueryParams::Subprocess(SubprocessParams {
            command: command.to_string(),
            data: None,
            environment: HashMap::new(),
            merge_stderr: false,
        }),
    }
}

//! Query identity, the deduplication registry, and body dispatch
//!
//! Every outbound request is described by a canonical [`QuerySpec`] built
//! from the raw configuration. The canonical form *is* the query's
//! identity: two configurations that canonicalize equally (header case,
//! default ports, equivalent OID spellings) map to the same live
//! [`Runnable`] in the [`QueryRegistry`], so any number of tests sharing
//! a request fan in on a single execution per tick.
//!
//! The registry also wires the hidden combined SNMP query: every single
//! SNMP query registers a per-host combined query as its dependency and
//! feeds its OIDs into it, so one walk per host serves all dependents.

use serde::Serialize;
use shared::config::{QueryConfig, QueryParams, QueryType};
use shared::defaults::{default_http_path, default_http_port, default_https_port};
use shared::status::Outcome;
use shared::utils::truncate_string;
use shared::ProbeError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::query_snmp::{self, parse_oid, Oid};
use crate::runnable::{lock, Runnable, RunnableKind};
use crate::{query_http, query_raw, query_subprocess};

/// Queries default to a 15 second timeout unless configured otherwise.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// SNMP protocol versions supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SnmpVersion {
    V1,
    V2c,
}

/// Canonical HTTP/HTTPS request description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpSpec {
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub data: Option<String>,
    /// Header names lowercased at ingest; always contains "host".
    pub headers: BTreeMap<String, String>,
    pub verify: bool,
}

impl HttpSpec {
    pub fn scheme(&self) -> &'static str {
        if self.ssl {
            "https"
        } else {
            "http"
        }
    }

    /// POST iff a body is configured, GET otherwise.
    pub fn method(&self) -> &'static str {
        if self.data.is_some() {
            "POST"
        } else {
            "GET"
        }
    }
}

/// Canonical raw TCP/SSL exchange description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawSpec {
    pub ssl: bool,
    pub host: String,
    pub port: u16,
    pub data: Option<String>,
    pub verify: bool,
}

/// Canonical subprocess description. The environment is the full child
/// environment: the process environment overlaid with configured
/// overrides, stored sorted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubprocessSpec {
    pub command: String,
    pub data: String,
    pub environment: BTreeMap<String, String>,
    pub merge_stderr: bool,
}

/// Canonical SNMP endpoint: transport address, version, community.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnmpTransport {
    /// `proto:host:port` or `unix:<path>`.
    pub addr: String,
    pub version: SnmpVersion,
    pub community: String,
}

/// What a single SNMP query extracts from the combined walk result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OidSelect {
    /// One exact OID.
    Single { oid: Oid },
    /// Locate the entry in the `oid_key` table whose value equals `key`,
    /// then read `oid_base` at the same index.
    Keyed {
        oid_base: Oid,
        oid_key: Oid,
        key: String,
    },
}

/// Canonical single SNMP query description.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnmpSpec {
    pub transport: SnmpTransport,
    pub select: OidSelect,
}

/// Canonical description of any query. Its serialized form (plus the
/// timeout) is the registry identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuerySpec {
    Noop { data: Option<String> },
    Http(HttpSpec),
    Raw(RawSpec),
    Subprocess(SubprocessSpec),
    Snmp(SnmpSpec),
    SnmpCombined(SnmpTransport),
}

impl QuerySpec {
    /// Builds the canonical spec and effective timeout from raw config.
    pub fn from_config(conf: &QueryConfig) -> shared::Result<(QuerySpec, Duration)> {
        let timeout = conf.effective_timeout()?;

        let spec = match (&conf.query_type, &conf.params) {
            (QueryType::Noop, QueryParams::Noop(params)) => QuerySpec::Noop {
                data: params.data.clone(),
            },
            (QueryType::Http, QueryParams::Http(params)) => {
                QuerySpec::Http(Self::canonical_http(params, false)?)
            }
            (QueryType::Https, QueryParams::Http(params)) => {
                QuerySpec::Http(Self::canonical_http(params, true)?)
            }
            (QueryType::Tcp, QueryParams::Raw(params)) => QuerySpec::Raw(RawSpec {
                ssl: false,
                host: params.host.clone(),
                port: params.port,
                data: params.data.clone(),
                verify: params.verify_ssl,
            }),
            (QueryType::Ssl, QueryParams::Raw(params)) => QuerySpec::Raw(RawSpec {
                ssl: true,
                host: params.host.clone(),
                port: params.port,
                data: params.data.clone(),
                verify: params.verify_ssl,
            }),
            (QueryType::Subprocess, QueryParams::Subprocess(params)) => {
                let mut environment: BTreeMap<String, String> = std::env::vars().collect();
                for (key, value) in &params.environment {
                    environment.insert(key.clone(), value.clone());
                }
                QuerySpec::Subprocess(SubprocessSpec {
                    command: params.command.clone(),
                    data: params.data.clone().unwrap_or_default(),
                    environment,
                    merge_stderr: params.merge_stderr,
                })
            }
            (QueryType::Snmp, QueryParams::Snmp(params)) => {
                let transport = Self::canonical_snmp_transport(conf)?;
                let select = if let Some(oid) = &params.oid {
                    OidSelect::Single {
                        oid: parse_oid(oid)?,
                    }
                } else {
                    match (&params.oid_base, &params.oid_key, &params.key) {
                        (Some(oid_base), Some(oid_key), Some(key)) => OidSelect::Keyed {
                            oid_base: parse_oid(oid_base)?,
                            oid_key: parse_oid(oid_key)?,
                            key: key.clone(),
                        },
                        _ => {
                            return Err(ProbeError::Config(
                                "oid or oid_base, oid_key, and key are required".into(),
                            )
                            .into());
                        }
                    }
                };
                QuerySpec::Snmp(SnmpSpec { transport, select })
            }
            _ => {
                return Err(ProbeError::Config(format!(
                    "query parameters do not match query type {:?}",
                    conf.query_type
                ))
                .into());
            }
        };

        Ok((spec, timeout))
    }

    fn canonical_http(
        params: &shared::config::HttpParams,
        ssl: bool,
    ) -> shared::Result<HttpSpec> {
        if params.host.trim().is_empty() {
            return Err(ProbeError::Config("HTTP query host cannot be empty".into()).into());
        }

        let default_port = if ssl {
            default_https_port()
        } else {
            default_http_port()
        };
        let port = params.port.unwrap_or(default_port);

        let path = if params.path.is_empty() {
            default_http_path()
        } else if params.path.starts_with('/') {
            params.path.clone()
        } else {
            format!("/{}", params.path)
        };

        // The host header is canonicalized to host[:port-if-nondefault]
        // unless the configuration overrides it. All header names are
        // lowercased so queries differing only in case are shared.
        let mut host_header = if port == default_port {
            params.host.clone()
        } else {
            format!("{}:{}", params.host, port)
        };

        let mut headers = BTreeMap::new();
        for (name, value) in &params.headers {
            let name = name.to_ascii_lowercase();
            if name == "host" {
                host_header = value.clone();
            } else {
                headers.insert(name, value.clone());
            }
        }
        headers.insert("host".to_string(), host_header);

        Ok(HttpSpec {
            ssl,
            host: params.host.clone(),
            port,
            path,
            data: params.data.clone(),
            headers,
            verify: params.verify_ssl,
        })
    }

    /// Canonical SNMP transport string for a query configuration:
    /// `proto:host:port` with the default port filled in, or
    /// `unix:<path>`. Only the udp transport has a session driver; the
    /// others are rejected at load so they cannot fail every tick.
    pub fn canonical_snmp_transport(conf: &QueryConfig) -> shared::Result<SnmpTransport> {
        let params = match &conf.params {
            QueryParams::Snmp(params) => params,
            _ => {
                return Err(ProbeError::Config("not an SNMP query".into()).into());
            }
        };

        let protocol = params.protocol.as_str();
        let addr = match protocol {
            "udp" | "tcp" => {
                let host = params.host.as_deref().unwrap_or("").trim().to_string();
                if host.is_empty() {
                    return Err(
                        ProbeError::Config("SNMP query host cannot be empty".into()).into()
                    );
                }
                format!("{}:{}:{}", protocol, host, params.port)
            }
            "unix" => match params.path.as_deref() {
                Some(path) if !path.is_empty() => format!("unix:{path}"),
                _ => {
                    return Err(ProbeError::Config(
                        "SNMP unix transport requires a socket path".into(),
                    )
                    .into());
                }
            },
            other => {
                return Err(
                    ProbeError::Config(format!("Invalid SNMP protocol: '{other}'")).into(),
                );
            }
        };

        if protocol != "udp" {
            return Err(ProbeError::Config(format!(
                "SNMP transport '{protocol}' has no session driver; use udp"
            ))
            .into());
        }

        let version = match params.version.as_str() {
            "1" => SnmpVersion::V1,
            "2c" => SnmpVersion::V2c,
            other => {
                return Err(ProbeError::Config(format!("Invalid SNMP version '{other}'")).into());
            }
        };

        let community = match params.community.as_deref() {
            Some(community) if !community.is_empty() => community.to_string(),
            _ => {
                return Err(ProbeError::Config("SNMP community is required".into()).into());
            }
        };

        Ok(SnmpTransport {
            addr,
            version,
            community,
        })
    }

    /// Short human-readable description used as the Runnable name.
    pub fn describe(&self) -> String {
        match self {
            QuerySpec::Noop { .. } => "noop".to_string(),
            QuerySpec::Http(spec) => format!(
                "{}://{}:{}{}",
                spec.scheme(),
                spec.host,
                spec.port,
                spec.path
            ),
            QuerySpec::Raw(spec) => format!(
                "{}:{}:{}",
                if spec.ssl { "ssl" } else { "tcp" },
                spec.host,
                spec.port
            ),
            QuerySpec::Subprocess(spec) => {
                format!("subprocess:{}", truncate_string(&spec.command, 60))
            }
            QuerySpec::Snmp(spec) => {
                let oid = match &spec.select {
                    OidSelect::Single { oid } => query_snmp::oid_to_string(oid),
                    OidSelect::Keyed { oid_base, .. } => query_snmp::oid_to_string(oid_base),
                };
                format!("snmp:{}:{}", spec.transport.addr, oid)
            }
            QuerySpec::SnmpCombined(transport) => format!("snmp-combined:{}", transport.addr),
        }
    }
}

#[derive(Serialize)]
struct QueryIdentity<'a> {
    timeout_ms: u128,
    spec: &'a QuerySpec,
}

/// Registry key: fingerprint of the canonical spec plus its timeout.
pub fn registry_key(spec: &QuerySpec, timeout: Duration) -> shared::Result<String> {
    shared::utils::fingerprint(&QueryIdentity {
        timeout_ms: timeout.as_millis(),
        spec,
    })
}

/// Shared driver state: HTTP clients and TLS connectors are built once
/// and reused across all queries to avoid per-request setup cost.
pub struct QueryContext {
    pub http_verify: reqwest::Client,
    pub http_no_verify: reqwest::Client,
    pub tls_verify: TlsConnector,
    pub tls_no_verify: TlsConnector,
}

impl QueryContext {
    pub fn new() -> shared::Result<Self> {
        let agent = concat!("probe/", env!("CARGO_PKG_VERSION"));

        // Redirects are surfaced as data rather than followed, and
        // connections are not reused across ticks: every tick measures a
        // fresh connection.
        let http_verify = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .user_agent(agent)
            .build()
            .map_err(|e| ProbeError::Init(format!("Failed to create HTTP client: {e}")))?;

        let http_no_verify = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .user_agent(agent)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::Init(format!("Failed to create HTTP client: {e}")))?;

        let tls_verify = query_raw::tls_connector_with_verification()?;
        let tls_no_verify = query_raw::tls_connector_without_verification()?;

        Ok(Self {
            http_verify,
            http_no_verify,
            tls_verify,
            tls_no_verify,
        })
    }
}

/// A live query: canonical spec plus the mutable runtime state that does
/// not participate in identity.
pub struct Query {
    spec: QuerySpec,
    ctx: Arc<QueryContext>,
    /// OID roots accreted by dependents; combined SNMP queries only.
    oids: Mutex<BTreeSet<Oid>>,
    /// The X-Request-Id sent with the most recent HTTP request.
    request_id: Mutex<Option<String>>,
}

impl Query {
    pub fn new(spec: QuerySpec, ctx: Arc<QueryContext>) -> Self {
        Self {
            spec,
            ctx,
            oids: Mutex::new(BTreeSet::new()),
            request_id: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    /// Update hook invoked when a new configuration reuses this query.
    /// Combined SNMP queries accrete the newcomer's OIDs into their walk
    /// set; other query types have nothing to absorb.
    pub fn update(&self, conf: &QueryConfig) {
        if !matches!(self.spec, QuerySpec::SnmpCombined(_)) {
            return;
        }
        if let QueryParams::Snmp(params) = &conf.params {
            let mut oids = lock(&self.oids);
            for field in [&params.oid, &params.oid_base, &params.oid_key] {
                if let Some(text) = field {
                    if let Ok(oid) = parse_oid(text) {
                        oids.insert(oid);
                    }
                }
            }
        }
    }

    /// Snapshot of the accreted OID roots (combined SNMP queries).
    pub fn oid_roots(&self) -> Vec<Oid> {
        lock(&self.oids).iter().cloned().collect()
    }

    /// The X-Request-Id of the most recent HTTP request, for correlation.
    pub fn last_request_id(&self) -> Option<String> {
        lock(&self.request_id).clone()
    }

    /// Runs the query body once. `partial` is the owning Runnable's
    /// partial-payload buffer, preserved into timeout failures.
    pub async fn execute(
        &self,
        timeout: Duration,
        partial: &Mutex<String>,
        deps: &[Arc<Runnable>],
    ) -> Outcome {
        match &self.spec {
            QuerySpec::Noop { data } => Ok(data.clone().unwrap_or_default()),
            QuerySpec::Http(spec) => {
                query_http::execute(&self.ctx, spec, timeout, &self.request_id).await
            }
            QuerySpec::Raw(spec) => query_raw::execute(&self.ctx, spec, timeout, partial).await,
            QuerySpec::Subprocess(spec) => query_subprocess::execute(spec, timeout, partial).await,
            QuerySpec::Snmp(spec) => query_snmp::select_result(spec, deps),
            QuerySpec::SnmpCombined(transport) => {
                query_snmp::execute_walk(transport, timeout, &self.oids).await
            }
        }
    }
}

/// Content-addressed map from canonical query identity to the single
/// live Runnable executing that query.
pub struct QueryRegistry {
    ctx: Arc<QueryContext>,
    queries: HashMap<String, Arc<Runnable>>,
}

impl QueryRegistry {
    pub fn new() -> shared::Result<Self> {
        Ok(Self {
            ctx: Arc::new(QueryContext::new()?),
            queries: HashMap::new(),
        })
    }

    /// Number of distinct live queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Creates a new query Runnable for this configuration or returns the
    /// existing instance with equal canonical identity. Reused instances
    /// receive the new configuration through their `update` hook.
    pub fn add_query(&mut self, conf: &QueryConfig) -> shared::Result<Arc<Runnable>> {
        let (spec, timeout) = QuerySpec::from_config(conf)?;
        self.add_spec(spec, timeout, conf)
    }

    fn add_spec(
        &mut self,
        spec: QuerySpec,
        timeout: Duration,
        conf: &QueryConfig,
    ) -> shared::Result<Arc<Runnable>> {
        let key = registry_key(&spec, timeout)?;

        if let Some(existing) = self.queries.get(&key) {
            debug!("Reusing query '{}'", spec.describe());
            if let RunnableKind::Query(query) = existing.kind() {
                query.update(conf);
            }
            return Ok(Arc::clone(existing));
        }

        debug!("Adding query '{}'", spec.describe());

        // Every single SNMP query delegates the wire work to one combined
        // query per host, declared here as its dependency.
        let combined = if let QuerySpec::Snmp(snmp) = &spec {
            let combined_spec = QuerySpec::SnmpCombined(snmp.transport.clone());
            Some(self.add_spec(combined_spec, timeout, conf)?)
        } else {
            None
        };

        let name = spec.describe();
        let query = Query::new(spec, Arc::clone(&self.ctx));
        query.update(conf);

        let runnable = Runnable::new(
            name,
            RunnableKind::Query(query),
            Duration::ZERO,
            Some(timeout),
        );

        if let Some(combined) = combined {
            runnable.add_dependency(&combined)?;
        }

        self.queries.insert(key, Arc::clone(&runnable));
        Ok(runnable)
    }
}

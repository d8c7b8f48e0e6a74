//! SNMP query driver
//!
//! The wire work happens in the hidden combined query: one session and
//! one walk per host per tick, covering the union of every OID any
//! dependent has registered. The walk result travels as a JSON-encoded
//! OID→value map in the payload; each single query then indexes its own
//! value out of that shared map, either directly or through the
//! `oid_base`/`oid_key`/`key` table indirection.

use shared::status::{Failure, Outcome};
use shared::ProbeError;
use snmp2::{AsyncSession, Oid as WireOid, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::queries::{OidSelect, SnmpSpec, SnmpTransport, SnmpVersion};
use crate::runnable::{lock, Runnable};

/// An OID as a numeric component sequence. Textual forms are parsed into
/// this canonical representation before hashing or comparison, so
/// `.1.3.6.1` and `1.3.6.1` are the same OID.
pub type Oid = Vec<u64>;

/// Parse an OID string into numeric components.
pub fn parse_oid(text: &str) -> shared::Result<Oid> {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix('.').unwrap_or(trimmed);

    if body.is_empty() {
        return Err(ProbeError::Config(format!("Invalid SNMP OID '{text}'")).into());
    }

    body.split('.')
        .map(|component| {
            component
                .parse::<u64>()
                .map_err(|_| ProbeError::Config(format!("Invalid SNMP OID '{text}'")).into())
        })
        .collect()
}

/// Canonical dotted form with a leading dot.
pub fn oid_to_string(oid: &[u64]) -> String {
    let mut text = String::new();
    for component in oid {
        text.push('.');
        text.push_str(&component.to_string());
    }
    text
}

/// One walk covering every registered OID root, bounded by `timeout`.
/// The session lives for exactly one tick.
pub async fn execute_walk(
    transport: &SnmpTransport,
    timeout: Duration,
    oids: &Mutex<BTreeSet<Oid>>,
) -> Outcome {
    let roots: Vec<Oid> = lock(oids).iter().cloned().collect();
    if roots.is_empty() {
        return Ok("{}".to_string());
    }

    let target = match transport.addr.strip_prefix("udp:") {
        Some(rest) => rest.to_string(),
        None => {
            return Err(Failure::critical(format!(
                "SNMP transport '{}' is not routable",
                transport.addr
            )));
        }
    };

    let addr = match tokio::net::lookup_host(&target).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                return Err(Failure::critical(format!(
                    "No addresses found for SNMP target '{target}'"
                )));
            }
        },
        Err(err) => {
            return Err(Failure::critical(format!(
                "Failed to resolve SNMP target '{target}': {err}"
            )));
        }
    };

    debug!(
        "SNMP walk of {} roots on {}",
        roots.len(),
        transport.addr
    );

    match tokio::time::timeout(timeout, walk(addr, transport, &roots)).await {
        Ok(Ok(map)) => serde_json::to_string(&map)
            .map_err(|err| Failure::unknown(format!("failed to encode SNMP result map: {err}"))),
        Ok(Err(err)) => Err(Failure::critical(format!("SNMP error: {err}"))),
        Err(_) => Err(Failure::critical("SNMP request timeout")),
    }
}

async fn walk(
    addr: SocketAddr,
    transport: &SnmpTransport,
    roots: &[Oid],
) -> shared::Result<BTreeMap<String, String>> {
    let mut session = match transport.version {
        SnmpVersion::V1 => AsyncSession::new_v1(addr, transport.community.as_bytes(), 0).await,
        SnmpVersion::V2c => AsyncSession::new_v2c(addr, transport.community.as_bytes(), 0).await,
    }
    .map_err(|err| anyhow::anyhow!("Failed to open SNMP session: {err}"))?;

    let mut map = BTreeMap::new();

    for root in roots {
        let wire_root = WireOid::from(root)
            .map_err(|err| anyhow::anyhow!("Failed to encode OID {}: {err:?}", oid_to_string(root)))?;

        // Leaf roots answer the plain get; table roots answer the walk
        // below. A get error (noSuchName on v1 agents) is not fatal.
        if let Ok(pdu) = session.get(&wire_root).await {
            let mut varbinds = pdu.varbinds;
            if let Some((oid, value)) = varbinds.next() {
                if value_is_present(&value) {
                    if let Ok(parsed) = parse_oid(&oid.to_string()) {
                        map.insert(oid_to_string(&parsed), value_to_string(&value));
                    }
                }
            }
        }

        let mut cursor = root.clone();
        loop {
            let wire_cursor = WireOid::from(&cursor).map_err(|err| {
                anyhow::anyhow!("Failed to encode OID {}: {err:?}", oid_to_string(&cursor))
            })?;

            let pdu = match session.getnext(&wire_cursor).await {
                Ok(pdu) => pdu,
                // End of the agent's MIB view, v1 style.
                Err(_) => break,
            };

            let mut varbinds = pdu.varbinds;
            let Some((oid, value)) = varbinds.next() else {
                break;
            };

            let next = match parse_oid(&oid.to_string()) {
                Ok(next) => next,
                Err(_) => break,
            };

            if next == cursor || !next.starts_with(root) {
                break;
            }
            if matches!(value, Value::EndOfMibView) {
                break;
            }

            map.insert(oid_to_string(&next), value_to_string(&value));
            cursor = next;
        }
    }

    Ok(map)
}

/// Extracts this query's value from the combined walk result published
/// by its dependency.
pub fn select_result(spec: &SnmpSpec, deps: &[Arc<Runnable>]) -> Outcome {
    let combined = match deps.first().and_then(|dep| dep.result()) {
        Some(result) => result,
        None => {
            return Err(Failure::unknown(
                "combined SNMP query has not produced a result",
            ));
        }
    };

    let payload = match combined {
        Ok(payload) => payload,
        Err(failure) => return Err(failure),
    };

    let map: BTreeMap<String, String> = match serde_json::from_str(&payload) {
        Ok(map) => map,
        Err(err) => {
            return Err(Failure::unknown(format!(
                "invalid combined SNMP payload: {err}"
            )));
        }
    };

    match &spec.select {
        OidSelect::Single { oid } => single_value(&map, oid),
        OidSelect::Keyed {
            oid_base,
            oid_key,
            key,
        } => keyed_value(&map, oid_base, oid_key, key),
    }
}

fn single_value(map: &BTreeMap<String, String>, oid: &[u64]) -> Outcome {
    map.get(&oid_to_string(oid))
        .cloned()
        .ok_or_else(|| Failure::critical("No value received"))
}

/// Locates the `oid_key` entry whose value equals `key`, then reads the
/// `oid_base` entry at the same table index.
fn keyed_value(
    map: &BTreeMap<String, String>,
    oid_base: &[u64],
    oid_key: &[u64],
    key: &str,
) -> Outcome {
    let entries_under = |root: &[u64]| -> Vec<(Oid, String)> {
        map.iter()
            .filter_map(|(text, value)| {
                let oid = parse_oid(text).ok()?;
                if oid.len() > root.len() && oid.starts_with(root) {
                    Some((oid, value.clone()))
                } else {
                    None
                }
            })
            .collect()
    };

    if entries_under(oid_base).is_empty() {
        return Err(Failure::critical("No values received for oid_base"));
    }

    let keys = entries_under(oid_key);
    if keys.is_empty() {
        return Err(Failure::critical("No values received for oid_key"));
    }

    let index = keys
        .iter()
        .find(|(_, value)| value == key)
        .map(|(oid, _)| oid[oid_key.len()..].to_vec());

    let Some(index) = index else {
        return Err(Failure::critical(format!("key not found: '{key}'")));
    };

    let mut target = oid_base.to_vec();
    target.extend(index);

    map.get(&oid_to_string(&target))
        .cloned()
        .ok_or_else(|| Failure::critical("No value received"))
}

fn value_is_present(value: &Value<'_>) -> bool {
    !matches!(
        value,
        Value::Null | Value::NoSuchObject | Value::NoSuchInstance | Value::EndOfMibView
    )
}

/// Renders an SNMP value as a string payload.
fn value_to_string(value: &Value<'_>) -> String {
    match value {
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::OctetString(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => bytes_to_hex(bytes),
        },
        Value::ObjectIdentifier(oid) => format!("{oid}"),
        Value::IpAddress(ip) => format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
        Value::Counter32(c) => c.to_string(),
        Value::Unsigned32(u) => u.to_string(),
        Value::Timeticks(t) => t.to_string(),
        Value::Counter64(c) => c.to_string(),
        Value::Opaque(bytes) => bytes_to_hex(bytes),
        other => format!("{other:?}"),
    }
}

fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

//! Read-only monitoring endpoint
//!
//! Serves scheduler statistics and process health as pretty-printed XML
//! over a small set of GET-only pages:
//!
//! - `/stat/ping` - minimal alive page
//! - `/stat/memory` - the `Vm*` lines of `/proc/self/status`
//! - `/stat/scheduler` - latency summary and task counts
//! - `/stat` - the children above concatenated in insertion order
//!
//! The endpoint observes the scheduler through its stats handle only; it
//! never mutates engine state.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use regex::Regex;
use shared::ProbeError;
use std::sync::Arc;
use tracing::{error, info};

use crate::scheduler::{SchedulerStats, StatsHandle};

#[derive(Clone)]
struct ApiState {
    stats: Arc<StatsHandle>,
}

/// Builds the monitoring router.
pub fn create_router(stats: Arc<StatsHandle>) -> Router {
    Router::new()
        .route("/stat", get(handle_stat))
        .route("/stat/ping", get(handle_ping))
        .route("/stat/memory", get(handle_memory))
        .route("/stat/scheduler", get(handle_scheduler))
        .with_state(ApiState { stats })
}

/// Binds the monitoring endpoint and serves it until the process exits.
pub async fn serve(port: u16, stats: Arc<StatsHandle>) -> shared::Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| {
            ProbeError::Init(format!("Failed to bind monitoring port {port}: {err}"))
        })?;

    info!("Monitoring endpoint listening on port {port}");

    axum::serve(listener, create_router(stats))
        .await
        .map_err(|err| ProbeError::Init(format!("Monitoring endpoint failed: {err}")).into())
}

async fn handle_ping() -> Response {
    xml_response(ping_xml())
}

async fn handle_memory() -> Response {
    xml_response(memory_xml())
}

async fn handle_scheduler(State(state): State<ApiState>) -> Response {
    xml_response(scheduler_xml(&state.stats.snapshot()))
}

async fn handle_stat(State(state): State<ApiState>) -> Response {
    xml_response(stat_xml(&state.stats.snapshot()))
}

fn xml_response(result: shared::Result<String>) -> Response {
    match result {
        Ok(body) => ([(header::CONTENT_TYPE, "text/xml")], body).into_response(),
        Err(err) => {
            error!("Failed to render monitoring page: {err}");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn render<F>(build: F) -> shared::Result<String>
where
    F: FnOnce(&mut Writer<Vec<u8>>) -> shared::Result<()>,
{
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    build(&mut writer)?;
    Ok(String::from_utf8(writer.into_inner())?)
}

/// `<ok version="1.0"/>`
pub fn ping_xml() -> shared::Result<String> {
    render(write_ping)
}

/// Process memory usage from the OS-provided status file.
pub fn memory_xml() -> shared::Result<String> {
    render(write_memory)
}

/// Scheduler latency and task counts.
pub fn scheduler_xml(stats: &SchedulerStats) -> shared::Result<String> {
    render(|writer| write_scheduler(writer, stats))
}

/// The index page: every child page in insertion order.
pub fn stat_xml(stats: &SchedulerStats) -> shared::Result<String> {
    render(|writer| {
        writer.write_event(Event::Start(BytesStart::new("Stat")))?;
        write_ping(writer)?;
        write_memory(writer)?;
        write_scheduler(writer, stats)?;
        writer.write_event(Event::End(BytesEnd::new("Stat")))?;
        Ok(())
    })
}

fn write_ping(writer: &mut Writer<Vec<u8>>) -> shared::Result<()> {
    let mut elem = BytesStart::new("ok");
    elem.push_attribute(("version", "1.0"));
    writer.write_event(Event::Empty(elem))?;
    Ok(())
}

fn write_memory(writer: &mut Writer<Vec<u8>>) -> shared::Result<()> {
    let mut elem = BytesStart::new("Memory");
    elem.push_attribute(("version", "1.0"));
    writer.write_event(Event::Start(elem))?;

    // Absent on non-Linux hosts; the page is then simply empty.
    let status = std::fs::read_to_string("/proc/self/status").unwrap_or_default();
    for (name, value, units) in parse_memory_lines(&status)? {
        let mut entry = BytesStart::new(name.as_str());
        entry.push_attribute(("units", units.as_str()));
        writer.write_event(Event::Start(entry))?;
        writer.write_event(Event::Text(BytesText::new(&value)))?;
        writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Memory")))?;
    Ok(())
}

/// Extracts `(name, value, units)` from the `Vm*` lines of a
/// `/proc/self/status` style document.
pub fn parse_memory_lines(status: &str) -> shared::Result<Vec<(String, String, String)>> {
    let vm_line = Regex::new(r"^(Vm\w+):\s+(\d+)\s+(\w+)$")?;

    Ok(status
        .lines()
        .filter_map(|line| {
            let caps = vm_line.captures(line.trim())?;
            Some((caps[1].to_string(), caps[2].to_string(), caps[3].to_string()))
        })
        .collect())
}

fn write_scheduler(writer: &mut Writer<Vec<u8>>, stats: &SchedulerStats) -> shared::Result<()> {
    let mut elem = BytesStart::new("Scheduler");
    elem.push_attribute(("version", "1.0"));
    writer.write_event(Event::Start(elem))?;

    let mut latency = BytesStart::new("Latency");
    let period = stats.latency.period_seconds.to_string();
    latency.push_attribute(("period", period.as_str()));
    writer.write_event(Event::Start(latency))?;
    write_text_element(writer, "Maximum", &format!("{:.6}", stats.latency.max))?;
    write_text_element(writer, "Minimum", &format!("{:.6}", stats.latency.min))?;
    write_text_element(writer, "Average", &format!("{:.6}", stats.latency.avg))?;
    writer.write_event(Event::End(BytesEnd::new("Latency")))?;

    writer.write_event(Event::Start(BytesStart::new("Tasks")))?;
    write_text_element(writer, "Groups", &stats.tasks.groups.to_string())?;
    writer.write_event(Event::End(BytesEnd::new("Tasks")))?;

    writer.write_event(Event::End(BytesEnd::new("Scheduler")))?;
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> shared::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

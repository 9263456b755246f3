//! HTTP control surface: health, readiness, status, triggers, audit
//! queries, and trash management over a synchronous `tiny_http` server.
//!
//! One accept-loop thread handles requests inline; triggered runs execute
//! on their own thread behind the shared run guard. Error responses are
//! always `{"error": "..."}` with content-type `application/json`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use crossbeam_channel as channel;
use serde::Deserialize;
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::core::errors::{Result, SageError};
use crate::daemon::runner::SharedState;
use crate::daemon::state::DaemonState;

/// Grace period for the accept loop to drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Running HTTP surface; [`shutdown`](Self::shutdown) stops it.
pub struct ControlServer {
    server: Arc<Server>,
    addr: SocketAddr,
    done_rx: channel::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Bind and start serving on `addr` (e.g. `127.0.0.1:8675`; port 0
    /// picks an ephemeral port).
    pub fn start(addr: &str, shared: Arc<SharedState>) -> Result<Self> {
        let server = Server::http(addr).map_err(|e| SageError::Runtime {
            details: format!("http bind {addr}: {e}"),
        })?;
        let server = Arc::new(server);
        let local = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| SageError::Runtime {
                details: "http server has no ip address".to_string(),
            })?;

        let (done_tx, done_rx) = channel::bounded(1);
        let accept_server = Arc::clone(&server);
        let thread = thread::spawn(move || {
            for request in accept_server.incoming_requests() {
                handle_request(request, &shared);
            }
            let _ = done_tx.send(());
        });

        Ok(Self {
            server,
            addr: local,
            done_rx,
            thread: Some(thread),
        })
    }

    /// The bound local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Unblock the accept loop and wait up to the grace period for it to
    /// exit. If the grace expires the accept thread is detached.
    pub fn shutdown(mut self) {
        self.server.unblock();
        if self.done_rx.recv_timeout(SHUTDOWN_GRACE).is_ok()
            && let Some(handle) = self.thread.take()
        {
            let _ = handle.join();
        }
    }
}

/// API keys for the external auth collaborator: `ss_` + 32 hex chars.
#[must_use]
pub fn is_valid_api_key(key: &str) -> bool {
    key.strip_prefix("ss_")
        .is_some_and(|rest| rest.len() == 32 && rest.bytes().all(|b| b.is_ascii_hexdigit()))
}

// ──────────────────── routing ────────────────────

fn handle_request(request: Request, shared: &Arc<SharedState>) {
    let url = request.url().to_string();
    let (path, params) = split_query(&url);
    let method = request.method().clone();

    // The restore handler reads the request body, so it owns the request.
    if path == "/api/trash/restore" {
        handle_trash_restore(request, &method, shared);
        return;
    }

    let (code, body) = match path {
        "/health" => handle_health(&method, shared),
        "/ready" => handle_ready(&method, shared),
        "/status" => handle_status(&method, shared),
        "/trigger" => handle_trigger(&method, shared),
        "/api/config" => handle_config(&method, shared),
        "/api/audit/query" => handle_audit_query(&method, shared, &params),
        "/api/audit/stats" => handle_audit_stats(&method, shared),
        "/api/trash" => handle_trash(&method, shared, &params),
        _ => (404, json!({"error": "not found"}).to_string()),
    };
    respond(request, code, &body);
}

fn respond(request: Request, code: u16, body: &str) {
    let mut response = Response::from_string(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
        response = response.with_header(header);
    }
    let _ = request.respond(response);
}

fn error_body(message: &str) -> String {
    json!({"error": message}).to_string()
}

fn method_not_allowed() -> (u16, String) {
    (405, error_body("method not allowed"))
}

// ──────────────────── handlers ────────────────────

fn handle_health(method: &Method, shared: &SharedState) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    (
        200,
        json!({"status": "ok", "state": shared.state.get().to_string()}).to_string(),
    )
}

fn handle_ready(method: &Method, shared: &SharedState) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    let state = shared.state.get();
    let ready = matches!(state, DaemonState::Ready | DaemonState::Running);
    let code = if ready { 200 } else { 503 };
    (
        code,
        json!({"ready": ready, "state": state.to_string()}).to_string(),
    )
}

fn handle_status(method: &Method, shared: &SharedState) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    match serde_json::to_string(&shared.status()) {
        Ok(body) => (200, body),
        Err(e) => (500, error_body(&e.to_string())),
    }
}

fn handle_trigger(method: &Method, shared: &Arc<SharedState>) -> (u16, String) {
    if *method != Method::Post {
        return method_not_allowed();
    }
    match shared.try_trigger() {
        Ok(()) => (200, json!({"triggered": true}).to_string()),
        Err(e) => (
            409,
            json!({"triggered": false, "error": e.to_string()}).to_string(),
        ),
    }
}

fn handle_config(method: &Method, shared: &SharedState) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    match serde_json::to_string(&shared.config) {
        Ok(body) => (200, body),
        Err(e) => (500, error_body(&e.to_string())),
    }
}

fn handle_audit_query(
    method: &Method,
    shared: &SharedState,
    params: &BTreeMap<String, String>,
) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    #[cfg(feature = "sqlite")]
    {
        let Some(sqlite) = &shared.sqlite else {
            return (404, error_body("no queryable auditor configured"));
        };
        let query = match build_audit_query(params) {
            Ok(q) => q,
            Err(message) => return (400, error_body(&message)),
        };
        match sqlite.query(&query) {
            Ok(records) => match serde_json::to_string(&records) {
                Ok(body) => (200, body),
                Err(e) => (500, error_body(&e.to_string())),
            },
            Err(e) => (500, error_body(&e.to_string())),
        }
    }
    #[cfg(not(feature = "sqlite"))]
    {
        let _ = (shared, params);
        (404, error_body("no queryable auditor configured"))
    }
}

fn handle_audit_stats(method: &Method, shared: &SharedState) -> (u16, String) {
    if *method != Method::Get {
        return method_not_allowed();
    }
    #[cfg(feature = "sqlite")]
    {
        let Some(sqlite) = &shared.sqlite else {
            return (404, error_body("no queryable auditor configured"));
        };
        match sqlite.stats() {
            Ok(stats) => match serde_json::to_string(&stats) {
                Ok(body) => (200, body),
                Err(e) => (500, error_body(&e.to_string())),
            },
            Err(e) => (500, error_body(&e.to_string())),
        }
    }
    #[cfg(not(feature = "sqlite"))]
    {
        let _ = shared;
        (404, error_body("no queryable auditor configured"))
    }
}

fn handle_trash(
    method: &Method,
    shared: &SharedState,
    params: &BTreeMap<String, String>,
) -> (u16, String) {
    let Some(trash) = &shared.trash else {
        return (404, error_body("trash is not enabled"));
    };
    match *method {
        Method::Get => match trash.list() {
            Ok(items) => match serde_json::to_string(&items) {
                Ok(body) => (200, body),
                Err(e) => (500, error_body(&e.to_string())),
            },
            Err(e) => (500, error_body(&e.to_string())),
        },
        Method::Delete => {
            let older_than = match params.get("older_than") {
                Some(raw) => match humantime::parse_duration(raw) {
                    Ok(d) => Some(d),
                    Err(e) => return (400, error_body(&format!("older_than: {e}"))),
                },
                None => None,
            };
            let all = params.get("all").is_some_and(|v| v == "true");
            if older_than.is_none() && !all {
                return (400, error_body("pass all=true or older_than=<duration>"));
            }
            match trash.purge(older_than) {
                Ok(deleted) => (200, json!({"deleted": deleted}).to_string()),
                Err(e) => (500, error_body(&e.to_string())),
            }
        }
        _ => method_not_allowed(),
    }
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    name: String,
}

fn handle_trash_restore(mut request: Request, method: &Method, shared: &SharedState) {
    let (code, body) = restore_response(&mut request, method, shared);
    respond(request, code, &body);
}

fn restore_response(
    request: &mut Request,
    method: &Method,
    shared: &SharedState,
) -> (u16, String) {
    if *method != Method::Post {
        return method_not_allowed();
    }
    let Some(trash) = &shared.trash else {
        return (404, error_body("trash is not enabled"));
    };

    let mut raw = String::new();
    if request.as_reader().read_to_string(&mut raw).is_err() {
        return (400, error_body("unreadable body"));
    }
    let parsed: RestoreRequest = match serde_json::from_str(&raw) {
        Ok(p) => p,
        Err(e) => return (400, error_body(&format!("bad body: {e}"))),
    };
    if parsed.name.is_empty() || parsed.name.contains('/') || parsed.name.contains("..") {
        return (400, error_body("invalid trash name"));
    }

    let trash_path = trash.root().join(&parsed.name);
    if std::fs::symlink_metadata(&trash_path).is_err() {
        return (404, error_body("no such trash entry"));
    }

    match trash.restore(&trash_path) {
        Ok(original) => (
            200,
            json!({"restored": original.to_string_lossy()}).to_string(),
        ),
        Err(SageError::RestoreDenied { reason, .. }) if reason == "destination exists" => {
            (409, error_body("destination exists"))
        }
        Err(err @ SageError::RestoreDenied { .. }) => (400, error_body(&err.to_string())),
        Err(err @ SageError::Tampering { .. }) => (409, error_body(&err.to_string())),
        Err(err) => (500, error_body(&err.to_string())),
    }
}

// ──────────────────── parameter parsing ────────────────────

#[cfg(feature = "sqlite")]
fn build_audit_query(
    params: &BTreeMap<String, String>,
) -> std::result::Result<crate::audit::AuditQuery, String> {
    use crate::audit::{AuditQuery, Level};

    let mut query = AuditQuery::default();
    let now = Utc::now();

    if let Some(raw) = params.get("since") {
        query.since =
            Some(parse_time_param(raw, now).ok_or_else(|| format!("bad since: {raw}"))?);
    }
    if let Some(raw) = params.get("until") {
        query.until =
            Some(parse_time_param(raw, now).ok_or_else(|| format!("bad until: {raw}"))?);
    }
    if let Some(raw) = params.get("action") {
        if raw != "plan" && raw != "execute" {
            return Err(format!("action must be plan or execute, got {raw}"));
        }
        query.action = Some(raw.clone());
    }
    if let Some(raw) = params.get("level") {
        query.level = Some(raw.parse::<Level>().map_err(|e| e.to_string())?);
    }
    if let Some(raw) = params.get("path") {
        query.path = Some(raw.clone());
    }
    if let Some(raw) = params.get("limit") {
        let limit: u32 = raw.parse().map_err(|_| format!("bad limit: {raw}"))?;
        if !(1..=1000).contains(&limit) {
            return Err(format!("limit must be 1..=1000, got {limit}"));
        }
        query.limit = Some(limit);
    }
    Ok(query)
}

/// Accepts RFC-3339, `YYYY-MM-DD`, or a duration suffix interpreted as
/// "that much before now".
fn parse_time_param(raw: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Ok(exact) = DateTime::parse_from_rfc3339(raw) {
        return Some(exact.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(
            date.and_hms_opt(0, 0, 0)
                .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))?,
        );
    }
    if let Ok(duration) = humantime::parse_duration(raw) {
        return Some(now - chrono::Duration::from_std(duration).ok()?);
    }
    None
}

/// Split a request URL into path and decoded query parameters.
fn split_query(url: &str) -> (&str, BTreeMap<String, String>) {
    let mut params = BTreeMap::new();
    let Some((path, query)) = url.split_once('?') else {
        return (url, params);
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key), percent_decode(value));
    }
    (path, params)
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 3 <= bytes.len() => {
                let hex = &raw[i + 1..i + 3];
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).to_string()
}

// ──────────────────── tests ────────────────────

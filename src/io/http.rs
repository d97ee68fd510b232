//! HTTP read model, trigger paths and the Prometheus endpoint
//!
//! Routes:
//! - `GET /metrics`, `GET /health`
//! - `GET /events`
//! - `GET /events/{id}/gates|bindings|thresholds`
//! - `GET /events/{id}/merges[?status=pending|approved|rejected|stale]`
//! - `GET /events/{id}/decisions[?gate=&kind=&from=&to=]`
//! - `POST /events/{id}/recompute|optimize|cancel` (queued, 202)
//! - `POST /events/{id}/merges/{suggestion}/approve|reject`

use crate::domain::decision::{DecisionKind, DecisionQuery};
use crate::domain::merge::MergeStatus;
use crate::domain::types::{EventId, GateId};
use crate::infra::metrics::Metrics;
use crate::io::audit_log::DecisionSink;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::engine::{EngineError, GateEngine};
use crate::services::scheduler::Trigger;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::Full;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Shared by every connection
pub struct HttpState {
    pub engine: Arc<GateEngine>,
    pub metrics: Arc<Metrics>,
    pub site_id: String,
    /// Absent when nothing consumes triggers (e.g. replay)
    pub triggers: Option<mpsc::Sender<Trigger>>,
    /// Audit file and MQTT stream for decisions taken over HTTP
    pub sink: DecisionSink,
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    resp
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "http_serialize_failed");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "serialization_failed")
        }
    }
}

fn error_json(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "ok": false, "error": message });
    response(status, "application/json", body.to_string())
}

fn not_found() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "text/plain", "Not Found")
}

fn engine_error(e: &EngineError) -> Response<Full<Bytes>> {
    let status = match e {
        EngineError::UnknownEvent(_) | EngineError::UnknownSuggestion { .. } => StatusCode::NOT_FOUND,
        EngineError::CycleInProgress(_)
        | EngineError::SuggestionResolved(_)
        | EngineError::SuggestionStale(_) => StatusCode::CONFLICT,
        EngineError::Thresholds(_) | EngineError::Location(_) => StatusCode::BAD_REQUEST,
    };
    error_json(status, &e.to_string())
}

/// Decode `%XX` escapes and `+` in a query component
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| percent_decode(v))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {value}: {e}"))
}

/// Build a decision filter from the query string
pub fn decision_query(query: Option<&str>) -> Result<DecisionQuery, String> {
    let kind = match query_param(query, "kind") {
        Some(k) => Some(k.parse::<DecisionKind>()?),
        None => None,
    };
    let from = query_param(query, "from").map(|v| parse_time(&v)).transpose()?;
    let to = query_param(query, "to").map(|v| parse_time(&v)).transpose()?;
    Ok(DecisionQuery { gate: query_param(query, "gate").map(GateId::from), kind, from, to })
}

fn merge_status(value: &str) -> Option<MergeStatus> {
    match value {
        "pending" => Some(MergeStatus::Pending),
        "approved" => Some(MergeStatus::Approved),
        "rejected" => Some(MergeStatus::Rejected),
        "stale" => Some(MergeStatus::Stale),
        _ => None,
    }
}

fn read_model(state: &HttpState, event: &EventId, view: &str, query: Option<&str>) -> Response<Full<Bytes>> {
    let engine = &state.engine;
    let result = match view {
        "gates" => engine.gates(event).map(|v| json(StatusCode::OK, &v)),
        "bindings" => engine.bindings(event).map(|v| json(StatusCode::OK, &v)),
        "thresholds" => engine.thresholds(event).map(|v| json(StatusCode::OK, &v)),
        "merges" => {
            let status = match query_param(query, "status") {
                Some(s) => match merge_status(&s) {
                    Some(status) => Some(status),
                    None => return error_json(StatusCode::BAD_REQUEST, &format!("unknown merge status {s}")),
                },
                None => None,
            };
            engine.merges(event, status).map(|v| json(StatusCode::OK, &v))
        }
        "decisions" => match decision_query(query) {
            Ok(q) => engine.decisions(event, &q).map(|v| json(StatusCode::OK, &v)),
            Err(e) => return error_json(StatusCode::BAD_REQUEST, &e),
        },
        _ => return not_found(),
    };
    result.unwrap_or_else(|e| engine_error(&e))
}

fn trigger(state: &HttpState, event: &EventId, action: &str) -> Response<Full<Bytes>> {
    let trigger = match action {
        "recompute" => Trigger::Recompute(event.clone()),
        "optimize" => Trigger::Optimize(event.clone()),
        "cancel" => Trigger::Cancel(event.clone()),
        _ => return not_found(),
    };
    if !state.engine.events().contains(event) {
        return engine_error(&EngineError::UnknownEvent(event.clone()));
    }
    let Some(tx) = &state.triggers else {
        return error_json(StatusCode::SERVICE_UNAVAILABLE, "scheduler_not_running");
    };
    match tx.try_send(trigger) {
        Ok(()) => {
            info!(event_id = %event, action = %action, "http_trigger_queued");
            json(StatusCode::ACCEPTED, &serde_json::json!({ "ok": true, "queued": action }))
        }
        Err(_) => error_json(StatusCode::SERVICE_UNAVAILABLE, "trigger_queue_full"),
    }
}

fn resolve_merge(state: &HttpState, event: &EventId, suggestion: &str, action: &str) -> Response<Full<Bytes>> {
    let approve = match action {
        "approve" => true,
        "reject" => false,
        _ => return not_found(),
    };
    match state.engine.resolve_merge(event, suggestion, approve, Utc::now()) {
        Ok(decisions) => {
            info!(event_id = %event, suggestion = %suggestion, action = %action, "http_merge_resolved");
            state.sink.publish(&decisions);
            json(StatusCode::OK, &decisions)
        }
        Err(e) => engine_error(&e),
    }
}

/// Route one request; no request body is read by any route
pub fn route(state: &HttpState, method: &Method, path: &str, query: Option<&str>) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    match (method, segments.as_slice()) {
        (&Method::GET, ["metrics"]) => response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&state.metrics, &state.site_id),
        ),
        (&Method::GET, ["health"]) => response(StatusCode::OK, "text/plain", "ok"),
        (&Method::GET, ["events"]) => json(StatusCode::OK, &state.engine.events()),
        (&Method::GET, ["events", event, view]) => read_model(state, &EventId::from(*event), view, query),
        (&Method::POST, ["events", event, action]) => trigger(state, &EventId::from(*event), action),
        (&Method::POST, ["events", event, "merges", suggestion, action]) => {
            resolve_merge(state, &EventId::from(*event), suggestion, action)
        }
        _ => not_found(),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    debug!(method = %req.method(), path = %req.uri().path(), "http_request");
    Ok(route(&state, req.method(), req.uri().path(), req.uri().query()))
}

/// Serve until shutdown
pub async fn start_http_server(
    port: u16,
    state: Arc<HttpState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

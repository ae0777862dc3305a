//! Admin channel — local-only control plane.
//!
//! Line-delimited JSON over a per-user Unix socket: one request object in,
//! one response object out, newline terminated. Access control is file
//! permissions (socket 0600 inside a 0700 run directory); anyone who can
//! connect is the owner.

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use uuid::Uuid;

use box_core::config::{BoxConfig, LogTarget};
use box_service::location::LocationService;
use box_store::QueueStore;

use crate::logging::LogHandle;
use crate::nat::PortMapper;

/// One request line: a verb plus optional positional arguments.
#[derive(Debug, Deserialize)]
struct AdminRequest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// Shared view of the running daemon for admin queries.
#[derive(Clone)]
pub struct AdminState {
    pub started_at: Instant,
    pub bound: SocketAddr,
    pub node_uuid: Uuid,
    pub user_uuid: Uuid,
    pub transport: &'static str,
    pub config_path: PathBuf,
    pub store: Arc<QueueStore>,
    pub location: Arc<LocationService>,
    pub log: LogHandle,
    pub mapper: Arc<dyn PortMapper>,
    pub reload_count: Arc<AtomicU64>,
    pub last_reload: Arc<Mutex<String>>,
}

/// Bind the admin socket, replacing any stale one, and restrict it to the
/// owning user.
pub fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// Accept loop. Runs until the task is aborted.
pub async fn serve(listener: UnixListener, state: AdminState) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        tracing::debug!(error = %e, "admin connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "admin accept failed");
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, state: AdminState) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AdminRequest>(&line) {
            Ok(request) => {
                tracing::debug!(command = %request.command, "admin command");
                handle_command(&state, &request.command, &request.args)
            }
            Err(e) => json!({ "status": "error", "message": format!("malformed request: {e}") }),
        };
        let mut text = response.to_string();
        text.push('\n');
        writer.write_all(text.as_bytes()).await?;
    }
    Ok(())
}

/// Execute one admin verb. Pure with respect to the connection.
pub fn handle_command(state: &AdminState, command: &str, args: &[String]) -> Value {
    match command {
        "ping" => json!({ "status": "ok", "message": "pong" }),

        "status" => {
            let metrics = match state.store.metrics() {
                Ok(m) => serde_json::to_value(m).unwrap_or(Value::Null),
                Err(e) => json!({ "error": e.to_string() }),
            };
            json!({
                "status": "ok",
                "address": state.bound.ip().to_string(),
                "port": state.bound.port(),
                "node_uuid": state.node_uuid,
                "user_uuid": state.user_uuid,
                "transport": state.transport,
                "log_target": state.log.current_target().to_string(),
                "queues": metrics,
                "uptime_secs": state.started_at.elapsed().as_secs(),
            })
        }

        "stats" => {
            let metrics = state.store.metrics().ok();
            json!({
                "status": "ok",
                "reload_count": state.reload_count.load(Ordering::Relaxed),
                "last_reload": last_reload(state),
                "queue_count": metrics.map(|m| m.queue_count),
                "object_count": metrics.map(|m| m.object_count),
                "free_bytes": metrics.map(|m| m.free_bytes),
                "uptime_secs": state.started_at.elapsed().as_secs(),
            })
        }

        "log-target" => {
            let Some(raw) = args.first() else {
                return json!({ "status": "error", "message": "log-target requires a target" });
            };
            match raw.parse::<LogTarget>() {
                Ok(target) => match state.log.set_target(target.clone()) {
                    Ok(()) => {
                        tracing::info!(target = %target, "log target switched");
                        json!({ "status": "ok", "log_target": target.to_string() })
                    }
                    Err(e) => json!({ "status": "error", "message": e.to_string() }),
                },
                Err(e) => json!({ "status": "error", "message": e.to_string() }),
            }
        }

        "reload-config" => reload_config(state),

        "nat-probe" => {
            let report = state.mapper.probe();
            match serde_json::to_value(&report) {
                Ok(mut value) => {
                    value["status"] = json!("ok");
                    value
                }
                Err(e) => json!({ "status": "error", "message": e.to_string() }),
            }
        }

        "locate" => {
            let Some(raw) = args.first() else {
                return json!({ "status": "error", "message": "locate requires a subject uuid" });
            };
            let Ok(subject) = raw.parse::<Uuid>() else {
                return json!({ "status": "error", "message": format!("not a uuid: {raw}") });
            };
            locate(state, subject)
        }

        "location-summary" => match state.location.summary() {
            Ok(summary) => match serde_json::to_value(&summary) {
                Ok(mut value) => {
                    value["status"] = json!("ok");
                    value
                }
                Err(e) => json!({ "status": "error", "message": e.to_string() }),
            },
            Err(e) => json!({ "status": "error", "message": e.to_string() }),
        },

        other => json!({ "status": "error", "message": format!("unknown command: {other}") }),
    }
}

fn locate(state: &AdminState, subject: Uuid) -> Value {
    match state.location.resolve_node(subject) {
        Ok(Some(record)) => {
            return json!({ "status": "ok", "kind": "node", "record": record });
        }
        Ok(None) => {}
        Err(e) => return json!({ "status": "error", "message": e.to_string() }),
    }
    match state.location.resolve_user(subject) {
        Ok(resolution) if !resolution.records.is_empty() => json!({
            "status": "ok",
            "kind": "user",
            "user_uuid": resolution.user_uuid,
            "node_uuids": resolution.node_uuids,
            "records": resolution.records,
        }),
        Ok(_) => json!({ "status": "error", "message": "not found" }),
        Err(e) => json!({ "status": "error", "message": e.to_string() }),
    }
}

fn reload_config(state: &AdminState) -> Value {
    state.reload_count.fetch_add(1, Ordering::Relaxed);
    match BoxConfig::load(&state.config_path) {
        Ok(config) => {
            state.log.set_level(config.server.log_level);
            let log_target = config.server.log_target.clone();
            if let Err(e) = state.log.set_target(log_target.clone()) {
                set_last_reload(state, format!("log target rejected: {e}"));
                return json!({ "status": "error", "message": e.to_string() });
            }
            if config.server.transport.to_string() != state.transport {
                tracing::warn!(
                    configured = %config.server.transport,
                    active = state.transport,
                    "transport change requires a restart"
                );
            }
            set_last_reload(state, "ok".to_owned());
            json!({
                "status": "ok",
                "log_level": config.server.log_level,
                "log_target": log_target.to_string(),
                "transport": config.server.transport.to_string(),
            })
        }
        Err(e) => {
            set_last_reload(state, e.to_string());
            json!({ "status": "error", "message": e.to_string() })
        }
    }
}

fn last_reload(state: &AdminState) -> String {
    state
        .last_reload
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}

fn set_last_reload(state: &AdminState, result: String) {
    if let Ok(mut guard) = state.last_reload.lock() {
        *guard = result;
    }
}

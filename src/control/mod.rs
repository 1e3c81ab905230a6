//! The HTTP control surface: `GET /api/v1/cluster/health` and `POST /api/v1/cluster/add-node`,
//! both wrapped in the `{status, message, data?}` envelope.

use std::io::Read as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiny_http::{Method, Response, Server};

use crate::command::{Command, CommandQueue};
use crate::health::{HealthSnapshot, HealthStatus};
use crate::state::Core;

fn status_name(status: HealthStatus) -> &'static str {
    match status {
        HealthStatus::Ok => "ok",
        HealthStatus::Warning => "warning",
        HealthStatus::Error => "error",
        HealthStatus::Critical => "critical",
    }
}

#[derive(Debug, Deserialize)]
struct AddNodeRequest {
    node_id: u32,
    #[allow(dead_code)]
    hostname: Option<String>,
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl Envelope<()> {
    fn ok(message: impl Into<String>) -> Self {
        Envelope {
            status: "ok",
            message: message.into(),
            data: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Envelope {
            status: "error",
            message: message.into(),
            data: None,
        }
    }
}

pub struct ControlServer {
    core: Arc<Core>,
    commands: Arc<CommandQueue>,
    health: Arc<Mutex<HealthSnapshot>>,
    shutdown: Arc<AtomicBool>,
}

impl ControlServer {
    pub fn new(core: Arc<Core>, commands: Arc<CommandQueue>, health: Arc<Mutex<HealthSnapshot>>) -> Self {
        ControlServer {
            core,
            commands,
            health,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Binds `addr:port` and serves requests until `shutdown_handle()` is set. Intended to be
    /// the body of a dedicated thread; `tiny_http::Server::recv` blocks with no interrupt point,
    /// so shutdown latency is bounded by `recv_timeout`.
    pub fn run(&self, addr: &str, port: u16) -> std::io::Result<()> {
        let server = Server::http((addr, port))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        info!("control surface listening on {}:{}", addr, port);

        while !self.shutdown.load(Ordering::Relaxed) {
            let request = match server.recv_timeout(std::time::Duration::from_millis(500)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => {
                    warn!("control surface recv error: {}", err);
                    continue;
                }
            };
            self.handle(request);
        }
        Ok(())
    }

    fn handle(&self, mut request: tiny_http::Request) {
        let method = request.method().clone();
        let url = request.url().to_string();

        let response_body = match (&method, url.as_str()) {
            (Method::Get, "/api/v1/cluster/health") => self.handle_health(),
            (Method::Post, "/api/v1/cluster/add-node") => {
                let mut body = String::new();
                if let Err(err) = request.as_reader().read_to_string(&mut body) {
                    serde_json::to_string(&Envelope::error(format!("failed to read body: {}", err)))
                        .unwrap()
                } else {
                    self.handle_add_node(&body)
                }
            }
            _ => serde_json::to_string(&Envelope::error("not found")).unwrap(),
        };

        let status_code = if response_body.contains("\"status\":\"ok\"") {
            200
        } else {
            400
        };
        let response = Response::from_string(response_body)
            .with_status_code(status_code)
            .with_header(
                tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
                    .expect("valid header"),
            );
        if let Err(err) = request.respond(response) {
            error!("failed to write control surface response: {}", err);
        }
    }

    fn handle_health(&self) -> String {
        let view = self.core.get_cluster_view();
        let snapshot = self.health.lock().unwrap().clone();
        let last_check = snapshot
            .last_check
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let data = json!({
            "overall_status": status_name(snapshot.status),
            "healthy_nodes": view.healthy_nodes(),
            "total_nodes": view.nodes.len(),
            "quorum": view.has_quorum(),
            "last_check": last_check,
        });
        serde_json::to_string(&Envelope {
            status: "ok",
            message: "ok".to_string(),
            data: Some(data),
        })
        .unwrap()
    }

    fn handle_add_node(&self, body: &str) -> String {
        let req: AddNodeRequest = match serde_json::from_str(body) {
            Ok(req) => req,
            Err(err) => {
                return serde_json::to_string(&Envelope::error(format!(
                    "invalid request body: {}",
                    err
                )))
                .unwrap()
            }
        };
        match self
            .commands
            .enqueue(Command::add_node(req.node_id, req.address, req.port))
        {
            Ok(_) => serde_json::to_string(&Envelope::ok(format!(
                "add-node request for node {} queued",
                req.node_id
            )))
            .unwrap(),
            Err(err) => serde_json::to_string(&Envelope::error(err.to_string())).unwrap(),
        }
    }
}

/// Spawns `server.run(addr, port)` on a dedicated thread, returning its join handle.
pub fn spawn(server: Arc<ControlServer>, addr: String, port: u16) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("control-http".to_string())
        .spawn(move || {
            if let Err(err) = server.run(&addr, port) {
                error!("control surface terminated: {}", err);
            }
        })
        .expect("spawn control-http thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::state::Node;

    fn server() -> ControlServer {
        let config = ClusterConfig::default();
        let core = Arc::new(Core::new(&config));
        core.add_node(Node::new(1, "127.0.0.1", 7001)).unwrap();
        let commands = Arc::new(CommandQueue::new());
        let health = Arc::new(Mutex::new(HealthSnapshot::default()));
        ControlServer::new(core, commands, health)
    }

    #[test]
    fn health_body_reports_node_counts() {
        let s = server();
        let body = s.handle_health();
        assert!(body.contains("\"healthy_nodes\":0"));
        assert!(body.contains("\"total_nodes\":1"));
    }

    #[test]
    fn add_node_enqueues_command() {
        let s = server();
        let body = s.handle_add_node(
            r#"{"node_id": 2, "hostname": "node2", "address": "127.0.0.1", "port": 7002}"#,
        );
        assert!(body.contains("\"status\":\"ok\""));
        assert_eq!(s.commands.len(), 1);
    }

    #[test]
    fn add_node_rejects_malformed_body() {
        let s = server();
        let body = s.handle_add_node("not json");
        assert!(body.contains("\"status\":\"error\""));
    }
}

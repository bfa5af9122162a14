//! Shared fixtures: an in-process panel and a tunnel opener without SSH

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use xk_broker::RegistrySettings;
use xk_core::config::{BackoffConfig, PanelConfig, PanelScheme};
use xk_core::error::ConnectionError;
use xk_core::traits::{Tunnel, TunnelOpener};
use xk_core::types::{Node, NodeId};
use xk_panel::{AddInboundPayload, Inbound};

/// Minimal 3x-ui panel keeping inbounds in memory
#[derive(Default)]
pub struct MockPanel {
    pub inbounds: Mutex<Vec<Inbound>>,
    next_id: AtomicI64,
    pub logins: AtomicUsize,
    pub add_client_calls: AtomicUsize,
    pub online: Mutex<Vec<String>>,
    /// Answer `addClient` with `success: false`
    pub reject_add_client: AtomicBool,
    /// Acknowledge `addClient` without storing the client
    pub drop_added_clients: AtomicBool,
    list_calls: AtomicUsize,
    /// List call (1-based) that fails and kills the given tunnel
    tunnel_drop: Mutex<Option<(usize, Arc<TunnelFlags>)>>,
}

impl MockPanel {
    /// Insert a REALITY inbound without clients and return its ID
    pub fn seed_inbound(&self, port: u16) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.inbounds.lock().unwrap().push(Inbound {
            id,
            remark: "DefaultInbound".to_string(),
            enable: true,
            port,
            protocol: "vless".to_string(),
            settings: json!({"clients": [], "decryption": "none", "fallbacks": []}).to_string(),
            stream_settings: reality_stream_settings().to_string(),
            ..Default::default()
        });
        id
    }

    /// Emails registered in an inbound's settings
    pub fn client_emails(&self, inbound_id: i64) -> Vec<String> {
        let inbounds = self.inbounds.lock().unwrap();
        inbounds
            .iter()
            .find(|i| i.id == inbound_id)
            .map(|i| {
                i.parsed_settings()
                    .unwrap()
                    .clients
                    .into_iter()
                    .map(|c| c.email)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of inbound list requests served so far
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Make list request number `call` fail as if `tunnel` died mid-request
    pub fn drop_tunnel_on_list(&self, call: usize, tunnel: Arc<TunnelFlags>) {
        *self.tunnel_drop.lock().unwrap() = Some((call, tunnel));
    }

    /// UUID of the client registered under `email`
    pub fn client_uuid(&self, inbound_id: i64, email: &str) -> Option<String> {
        let inbounds = self.inbounds.lock().unwrap();
        let inbound = inbounds.iter().find(|i| i.id == inbound_id)?;
        inbound.find_client(email).unwrap().map(|c| c.id)
    }
}

fn reality_stream_settings() -> Value {
    json!({
        "network": "tcp",
        "security": "reality",
        "realitySettings": {
            "dest": "example.com:443",
            "serverNames": ["example.com", "www.example.com"],
            "privateKey": "priv",
            "shortIds": ["ab", "abcd"],
            "settings": {"publicKey": "pub", "fingerprint": "chrome", "spiderX": "/"}
        },
        "tcpSettings": {"header": {"type": "none"}}
    })
}

fn ok(obj: Value) -> Response {
    Json(json!({"success": true, "msg": "", "obj": obj})).into_response()
}

async fn login(State(panel): State<Arc<MockPanel>>) -> Response {
    panel.logins.fetch_add(1, Ordering::SeqCst);
    (
        [(header::SET_COOKIE, "session=ok; Path=/")],
        Json(json!({"success": true, "msg": "ok"})),
    )
        .into_response()
}

async fn list(State(panel): State<Arc<MockPanel>>) -> Response {
    let call = panel.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if let Some((_, tunnel)) = panel
        .tunnel_drop
        .lock()
        .unwrap()
        .as_ref()
        .filter(|(at, _)| *at == call)
    {
        tunnel.alive.store(false, Ordering::SeqCst);
        return StatusCode::BAD_GATEWAY.into_response();
    }

    let inbounds = panel.inbounds.lock().unwrap().clone();
    ok(json!(inbounds))
}

async fn add_inbound(
    State(panel): State<Arc<MockPanel>>,
    Json(payload): Json<AddInboundPayload>,
) -> Response {
    let id = panel.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let inbound = Inbound {
        id,
        remark: payload.remark,
        enable: payload.enable,
        listen: payload.listen,
        port: payload.port,
        protocol: payload.protocol,
        settings: payload.settings,
        stream_settings: payload.stream_settings,
        sniffing: payload.sniffing,
        allocate: payload.allocate,
        ..Default::default()
    };
    panel.inbounds.lock().unwrap().push(inbound.clone());
    ok(json!(inbound))
}

async fn add_client(State(panel): State<Arc<MockPanel>>, Json(body): Json<Value>) -> Response {
    panel.add_client_calls.fetch_add(1, Ordering::SeqCst);
    if panel.reject_add_client.load(Ordering::SeqCst) {
        return Json(json!({"success": false, "msg": "duplicate email"})).into_response();
    }
    if panel.drop_added_clients.load(Ordering::SeqCst) {
        return ok(Value::Null);
    }

    let id = body["id"].as_i64().unwrap_or_default();
    let added: Value = serde_json::from_str(body["settings"].as_str().unwrap_or("{}")).unwrap();

    let mut inbounds = panel.inbounds.lock().unwrap();
    let Some(inbound) = inbounds.iter_mut().find(|i| i.id == id) else {
        return Json(json!({"success": false, "msg": "inbound not found"})).into_response();
    };

    let mut settings: Value = if inbound.settings.is_empty() {
        json!({"clients": []})
    } else {
        serde_json::from_str(&inbound.settings).unwrap()
    };
    let clients = settings["clients"].as_array_mut().unwrap();
    for client in added["clients"].as_array().cloned().unwrap_or_default() {
        clients.push(client);
    }
    inbound.settings = settings.to_string();

    ok(Value::Null)
}

async fn new_cert() -> Response {
    ok(json!({"privateKey": "generated-private", "publicKey": "generated-public"}))
}

async fn onlines(State(panel): State<Arc<MockPanel>>) -> Response {
    let online = panel.online.lock().unwrap().clone();
    ok(json!(online))
}

/// Start a mock panel and return it with its port
pub async fn spawn_panel() -> (Arc<MockPanel>, u16) {
    let panel = Arc::new(MockPanel::default());
    let app = Router::new()
        .route("/login", post(login))
        .route("/panel/inbound/list", post(list))
        .route("/panel/inbound/add", post(add_inbound))
        .route("/panel/inbound/addClient", post(add_client))
        .route("/panel/inbound/onlines", post(onlines))
        .route("/server/getNewX25519Cert", post(new_cert))
        .with_state(Arc::clone(&panel));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (panel, port)
}

/// Liveness flags of one fake tunnel, shared with the test
#[derive(Default)]
pub struct TunnelFlags {
    pub alive: AtomicBool,
    pub closed: AtomicBool,
}

struct FakeTunnel {
    port: u16,
    flags: Arc<TunnelFlags>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn is_alive(&self) -> bool {
        self.flags.alive.load(Ordering::SeqCst) && !self.flags.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.flags.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens "tunnels" that point straight at the mock panel's port
pub struct FakeOpener {
    panel_port: u16,
    delay: Duration,
    fail_remaining: AtomicUsize,
    pub opens: AtomicUsize,
    pub attempts: Mutex<Vec<Instant>>,
    pub tunnels: Mutex<Vec<Arc<TunnelFlags>>>,
}

impl FakeOpener {
    pub fn new(panel_port: u16) -> Self {
        Self::failing(panel_port, 0)
    }

    /// An opener whose first `failures` attempts are refused
    pub fn failing(panel_port: u16, failures: usize) -> Self {
        Self {
            panel_port,
            delay: Duration::from_millis(20),
            fail_remaining: AtomicUsize::new(failures),
            opens: AtomicUsize::new(0),
            attempts: Mutex::new(Vec::new()),
            tunnels: Mutex::new(Vec::new()),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Flags of the most recently opened tunnel
    pub fn last_tunnel(&self) -> Arc<TunnelFlags> {
        Arc::clone(self.tunnels.lock().unwrap().last().unwrap())
    }
}

#[async_trait]
impl TunnelOpener for FakeOpener {
    async fn open(&self, node: &Node) -> Result<Box<dyn Tunnel>, ConnectionError> {
        self.attempts.lock().unwrap().push(Instant::now());
        tokio::time::sleep(self.delay).await;

        let refused = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::ConnectFailed {
                addr: node.ssh_addr(),
                reason: "connection refused".to_string(),
            });
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let flags = Arc::new(TunnelFlags {
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.tunnels.lock().unwrap().push(Arc::clone(&flags));
        Ok(Box::new(FakeTunnel {
            port: self.panel_port,
            flags,
        }))
    }
}

pub fn test_node(id: i64, inbound_id: Option<i64>) -> Node {
    Node {
        id: NodeId(id),
        name: format!("node-{}", id),
        ip: "203.0.113.10".to_string(),
        ssh_port: 22,
        ssh_user: "root".to_string(),
        api_port: 2053,
        api_username: "admin".to_string(),
        api_password: "secret".to_string(),
        reality_cover: "example.com".to_string(),
        inbound_id,
    }
}

/// Fast timings so background loops act within a test's lifetime
pub fn test_settings() -> RegistrySettings {
    RegistrySettings {
        health_interval: Duration::from_millis(50),
        backoff: BackoffConfig {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        },
        panel: PanelConfig {
            scheme: PanelScheme::Http,
            ..Default::default()
        },
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

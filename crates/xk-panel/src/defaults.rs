//! Default inbound and client payloads
//!
//! Mirrors what the 3x-ui web UI produces for a fresh VLESS + REALITY
//! inbound and a fresh client, so nodes provisioned by x-Keeper look the
//! same as ones configured by hand.

use rand::Rng;

use crate::error::PanelError;
use crate::types::{
    AddInboundPayload, InboundClient, InboundSettings, RealityClientSettings, RealitySettings,
    StreamSettings, TcpHeader, TcpSettings, X25519Cert,
};

/// Flow assigned to new clients
pub const DEFAULT_FLOW: &str = "xtls-rprx-vision";

/// TLS fingerprint advertised to clients
pub const DEFAULT_FINGERPRINT: &str = "chrome";

/// Lengths of the generated REALITY short IDs
const SHORT_ID_LENGTHS: [usize; 8] = [2, 4, 6, 8, 10, 12, 14, 16];

const HEX_DIGITS: &[u8] = b"0123456789abcdef";

/// Parameters for a new inbound
#[derive(Debug, Clone)]
pub struct InboundTemplate<'a> {
    /// Panel remark (display name)
    pub remark: &'a str,
    /// Domain REALITY impersonates, e.g. `www.microsoft.com`
    pub cover: &'a str,
    /// Address the inbound listens on (the node's public IP)
    pub listen: &'a str,
    /// Public port
    pub port: u16,
}

/// Build a fresh client entry for `email`
///
/// The VLESS credential and subscription ID are random UUIDs.
pub fn default_client(email: &str, tg_id: i64) -> InboundClient {
    InboundClient {
        id: uuid::Uuid::new_v4().to_string(),
        flow: DEFAULT_FLOW.to_string(),
        email: email.to_string(),
        limit_ip: 0,
        total_gb: 0,
        expiry_time: 0,
        enable: true,
        tg_id: Some(tg_id),
        sub_id: uuid::Uuid::new_v4().simple().to_string(),
        reset: 0,
    }
}

/// Random hex short IDs, one per length in 2..=16 (even lengths)
pub fn generate_short_ids() -> Vec<String> {
    let mut rng = rand::thread_rng();
    SHORT_ID_LENGTHS
        .iter()
        .map(|&len| {
            (0..len)
                .map(|_| HEX_DIGITS[rng.gen_range(0..HEX_DIGITS.len())] as char)
                .collect()
        })
        .collect()
}

/// Build the payload for a VLESS + REALITY inbound with no clients
pub fn default_inbound(
    template: &InboundTemplate<'_>,
    cert: &X25519Cert,
) -> Result<AddInboundPayload, PanelError> {
    let settings = InboundSettings {
        clients: Vec::new(),
        decryption: "none".to_string(),
        fallbacks: Vec::new(),
    };

    let stream_settings = StreamSettings {
        network: "tcp".to_string(),
        security: "reality".to_string(),
        external_proxy: Vec::new(),
        reality_settings: RealitySettings {
            show: false,
            xver: 0,
            dest: format!("{}:443", template.cover),
            server_names: vec![
                template.cover.to_string(),
                format!("www.{}", template.cover),
            ],
            private_key: cert.private_key.clone(),
            short_ids: generate_short_ids(),
            settings: RealityClientSettings {
                public_key: cert.public_key.clone(),
                fingerprint: DEFAULT_FINGERPRINT.to_string(),
                server_name: String::new(),
                spider_x: "/".to_string(),
            },
        },
        tcp_settings: TcpSettings {
            accept_proxy_protocol: false,
            header: TcpHeader {
                kind: "none".to_string(),
            },
        },
    };

    let sniffing = serde_json::json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic", "fakedns"],
        "metadataOnly": false,
        "routeOnly": false,
    });

    let allocate = serde_json::json!({
        "strategy": "always",
        "refresh": 5,
        "concurrency": 3,
    });

    Ok(AddInboundPayload {
        up: 0,
        down: 0,
        total: 0,
        remark: template.remark.to_string(),
        enable: true,
        expiry_time: 0,
        listen: template.listen.to_string(),
        port: template.port,
        protocol: "vless".to_string(),
        settings: serde_json::to_string(&settings)?,
        stream_settings: serde_json::to_string(&stream_settings)?,
        sniffing: sniffing.to_string(),
        allocate: allocate.to_string(),
    })
}

//! Wire types for the 3x-ui panel API
//!
//! 3x-ui stores an inbound's client list and transport parameters as JSON
//! documents embedded in string fields (`settings`, `streamSettings`).
//! The raw strings are kept on [`Inbound`] and parsed on demand.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PanelError;

/// Envelope wrapping every panel response
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the panel accepted the request
    pub success: bool,
    /// Human-readable message (usually set on failure)
    #[serde(default)]
    pub msg: String,
    /// Payload, absent on some write endpoints
    pub obj: Option<T>,
}

/// A single inbound ("routing rule") as listed by the panel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Inbound {
    pub id: i64,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub remark: String,
    pub enable: bool,
    pub expiry_time: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub client_stats: Vec<ClientStats>,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    /// JSON document, see [`InboundSettings`]
    pub settings: String,
    /// JSON document, see [`StreamSettings`]
    pub stream_settings: String,
    pub tag: String,
    pub sniffing: String,
    pub allocate: String,
}

impl Inbound {
    /// Parse the embedded client list
    pub fn parsed_settings(&self) -> Result<InboundSettings, PanelError> {
        if self.settings.trim().is_empty() {
            return Ok(InboundSettings::default());
        }
        Ok(serde_json::from_str(&self.settings)?)
    }

    /// Parse the embedded transport parameters
    pub fn parsed_stream_settings(&self) -> Result<StreamSettings, PanelError> {
        Ok(serde_json::from_str(&self.stream_settings)?)
    }

    /// Find a client by email in the embedded client list
    pub fn find_client(&self, email: &str) -> Result<Option<InboundClient>, PanelError> {
        Ok(self
            .parsed_settings()?
            .clients
            .into_iter()
            .find(|c| c.email == email))
    }

    /// Whether a client with this email is a member of the inbound
    ///
    /// Checks the embedded client list and the traffic statistics, since
    /// either may lag the other on some panel versions.
    pub fn has_client(&self, email: &str) -> Result<bool, PanelError> {
        if self.client_stats.iter().any(|s| s.email == email) {
            return Ok(true);
        }
        Ok(self.find_client(email)?.is_some())
    }
}

/// Traffic statistics for one client of an inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientStats {
    pub id: i64,
    pub inbound_id: i64,
    pub enable: bool,
    pub email: String,
    pub up: i64,
    pub down: i64,
    pub expiry_time: i64,
    pub total: i64,
    pub reset: i64,
}

/// Parsed `settings` document of a VLESS inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundSettings {
    #[serde(deserialize_with = "null_as_default")]
    pub clients: Vec<InboundClient>,
    pub decryption: String,
    #[serde(deserialize_with = "null_as_default")]
    pub fallbacks: Vec<serde_json::Value>,
}

/// One client entry inside an inbound
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundClient {
    /// VLESS credential (UUID)
    pub id: String,
    pub flow: String,
    /// Unique identifier of the client within the panel
    pub email: String,
    pub limit_ip: i64,
    #[serde(rename = "totalGB")]
    pub total_gb: i64,
    pub expiry_time: i64,
    pub enable: bool,
    /// Telegram user ID; older panels store it as a string
    #[serde(deserialize_with = "flexible_i64", skip_serializing_if = "Option::is_none")]
    pub tg_id: Option<i64>,
    pub sub_id: String,
    pub reset: i64,
}

/// Parsed `streamSettings` document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(deserialize_with = "null_as_default")]
    pub external_proxy: Vec<serde_json::Value>,
    pub reality_settings: RealitySettings,
    pub tcp_settings: TcpSettings,
}

/// REALITY transport parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealitySettings {
    pub show: bool,
    pub xver: i64,
    pub dest: String,
    #[serde(deserialize_with = "null_as_default")]
    pub server_names: Vec<String>,
    pub private_key: String,
    #[serde(deserialize_with = "null_as_default")]
    pub short_ids: Vec<String>,
    pub settings: RealityClientSettings,
}

/// Client-facing half of the REALITY parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealityClientSettings {
    pub public_key: String,
    pub fingerprint: String,
    pub server_name: String,
    pub spider_x: String,
}

/// Raw TCP transport settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpSettings {
    pub accept_proxy_protocol: bool,
    pub header: TcpHeader,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of `POST /panel/inbound/add`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInboundPayload {
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub remark: String,
    pub enable: bool,
    pub expiry_time: i64,
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: String,
    pub stream_settings: String,
    pub sniffing: String,
    pub allocate: String,
}

/// Key pair returned by `POST /server/getNewX25519Cert`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X25519Cert {
    pub private_key: String,
    pub public_key: String,
}

/// Treat an explicit `null` like a missing field
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept an integer, a numeric string, or an empty string / null
fn flexible_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Int(i64),
        Str(String),
    }

    match Option::<Flexible>::deserialize(deserializer)? {
        Some(Flexible::Int(n)) => Ok(Some(n)),
        Some(Flexible::Str(s)) if s.trim().is_empty() => Ok(None),
        Some(Flexible::Str(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid tgId format: {}", s))),
        None => Ok(None),
    }
}

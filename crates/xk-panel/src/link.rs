//! VLESS access links
//!
//! Follows the link format the 3x-ui web UI generates:
//!
//! ```text
//! vless://<uuid>@<address>:<port>?type=tcp&security=reality&pbk=..&fp=..&sni=..&sid=..&spx=..&flow=..#<remark>-<email>
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv6Addr;

use url::form_urlencoded;
use url::Url;

use crate::error::PanelError;
use crate::types::Inbound;

const SCHEME: &str = "vless";

/// Everything a client needs to connect through one inbound client entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlessLink {
    /// Client UUID
    pub id: String,
    pub address: String,
    pub port: u16,
    /// Transport network (`tcp`, `ws`, ...)
    pub network: String,
    /// Security layer (`reality`, `tls`, `none`)
    pub security: String,
    /// Present when `security == "reality"`
    pub reality: Option<RealityParams>,
    /// Empty when the client has no flow
    pub flow: String,
    /// Human-readable fragment
    pub label: String,
}

/// REALITY parameters carried in the link query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealityParams {
    pub public_key: String,
    pub fingerprint: String,
    /// First server name of the inbound, empty if none
    pub sni: String,
    /// First short ID of the inbound, empty if none
    pub short_id: String,
    pub spider_x: String,
}

impl VlessLink {
    /// Build the link for `email` from an inbound as returned by the panel
    ///
    /// `fallback_address` is used when the inbound listens on every
    /// interface and so carries no usable address of its own.
    pub fn from_inbound(
        inbound: &Inbound,
        email: &str,
        fallback_address: &str,
    ) -> Result<Self, PanelError> {
        let client = inbound
            .find_client(email)?
            .ok_or_else(|| PanelError::ClientNotFound {
                inbound_id: inbound.id,
                email: email.to_string(),
            })?;
        let stream = inbound.parsed_stream_settings()?;

        let reality = (stream.security == "reality").then(|| {
            let reality = &stream.reality_settings;
            RealityParams {
                public_key: reality.settings.public_key.clone(),
                fingerprint: reality.settings.fingerprint.clone(),
                sni: reality.server_names.first().cloned().unwrap_or_default(),
                short_id: reality.short_ids.first().cloned().unwrap_or_default(),
                spider_x: reality.settings.spider_x.clone(),
            }
        });

        let address = match inbound.listen.trim() {
            "" | "0.0.0.0" | "::" => canonical_address(fallback_address.trim()),
            listen => canonical_address(listen),
        };

        Ok(Self {
            id: client.id,
            address,
            port: inbound.port,
            network: stream.network,
            security: stream.security,
            reality,
            flow: client.flow,
            label: format!("{}-{}", inbound.remark, client.email),
        })
    }

    /// Render the link as a URI
    pub fn render(&self) -> String {
        let host = if self.address.contains(':') {
            format!("[{}]", self.address)
        } else {
            self.address.clone()
        };

        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("type", &self.network);
        query.append_pair("security", &self.security);
        if let Some(reality) = &self.reality {
            query.append_pair("pbk", &reality.public_key);
            query.append_pair("fp", &reality.fingerprint);
            if !reality.sni.is_empty() {
                query.append_pair("sni", &reality.sni);
            }
            if !reality.short_id.is_empty() {
                query.append_pair("sid", &reality.short_id);
            }
            query.append_pair("spx", &reality.spider_x);
        }
        if !self.flow.is_empty() {
            query.append_pair("flow", &self.flow);
        }

        let label: String = form_urlencoded::byte_serialize(self.label.as_bytes()).collect();

        format!(
            "{}://{}@{}:{}?{}#{}",
            SCHEME,
            self.id,
            host,
            self.port,
            query.finish(),
            label
        )
    }

    /// Parse a link produced by [`VlessLink::render`] (or the panel UI)
    pub fn parse(link: &str) -> Result<Self, PanelError> {
        let url = Url::parse(link).map_err(|e| PanelError::InvalidLink(e.to_string()))?;
        if url.scheme() != SCHEME {
            return Err(PanelError::InvalidLink(format!(
                "unexpected scheme '{}'",
                url.scheme()
            )));
        }

        let id = url.username().to_string();
        if id.is_empty() {
            return Err(PanelError::InvalidLink("missing client id".to_string()));
        }
        let address = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| PanelError::InvalidLink("missing address".to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| PanelError::InvalidLink("missing port".to_string()))?;

        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let param = |key: &str| params.get(key).cloned().unwrap_or_default();

        let security = param("security");
        let reality = (security == "reality").then(|| RealityParams {
            public_key: param("pbk"),
            fingerprint: param("fp"),
            sni: param("sni"),
            short_id: param("sid"),
            spider_x: param("spx"),
        });

        let label = url
            .fragment()
            .and_then(|fragment| {
                form_urlencoded::parse(fragment.as_bytes())
                    .next()
                    .map(|(decoded, _)| decoded.into_owned())
            })
            .unwrap_or_default();

        Ok(Self {
            id,
            address,
            port,
            network: param("type"),
            security,
            reality,
            flow: param("flow"),
            label,
        })
    }
}

impl fmt::Display for VlessLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// IPv6 addresses in the form a parsed URL host reports them
fn canonical_address(address: &str) -> String {
    match address.parse::<Ipv6Addr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => address.to_string(),
    }
}

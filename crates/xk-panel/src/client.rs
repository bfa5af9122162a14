//! HTTP client for the 3x-ui panel
//!
//! The panel authenticates with a session cookie obtained from `/login`.
//! Sessions are refreshed proactively shortly before they expire, and a
//! request answered with 401/403 triggers one re-login followed by exactly
//! one retry of that request, so callers never see session churn.

use std::time::{Duration, Instant};

use reqwest::header::ACCEPT;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use url::Url;

use crate::error::PanelError;
use crate::types::{AddInboundPayload, ApiResponse, Inbound, InboundClient, X25519Cert};

const LOGIN_PATH: &str = "/login";
const LIST_INBOUNDS_PATH: &str = "/panel/inbound/list";
const ADD_INBOUND_PATH: &str = "/panel/inbound/add";
const ADD_CLIENT_PATH: &str = "/panel/inbound/addClient";
const ONLINE_CLIENTS_PATH: &str = "/panel/inbound/onlines";
const NEW_X25519_CERT_PATH: &str = "/server/getNewX25519Cert";

/// Panel login credentials
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Tunables for [`PanelClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-request timeout
    pub request_timeout: Duration,
    /// How long a panel session stays valid after login
    pub session_ttl: Duration,
    /// Re-login this long before the session would expire
    pub refresh_margin: Duration,
    /// Skip TLS verification (the panel is reached over loopback)
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            session_ttl: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(300),
            accept_invalid_certs: true,
        }
    }
}

/// Authenticated client for one panel
pub struct PanelClient {
    base_url: Url,
    http: reqwest::Client,
    credentials: Credentials,
    options: ClientOptions,
    /// Time of the last successful login; also serializes logins
    last_login: Mutex<Option<Instant>>,
}

impl PanelClient {
    /// Create a client for the panel at `base_url`
    ///
    /// No request is sent until the first API call.
    pub fn new(
        base_url: &str,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, PanelError> {
        let base_url = Url::parse(base_url)?;
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .timeout(options.request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            http,
            credentials,
            options,
            last_login: Mutex::new(None),
        })
    }

    /// Base URL the client talks to
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Log in and start a fresh session
    pub async fn login(&self) -> Result<(), PanelError> {
        let mut last_login = self.last_login.lock().await;
        self.login_locked(&mut last_login).await
    }

    /// List all inbounds
    pub async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        tracing::debug!("Fetching inbound list from {}", self.base_url);
        let inbounds: Option<Vec<Inbound>> = self.call(LIST_INBOUNDS_PATH, None::<&()>).await?;
        Ok(inbounds.unwrap_or_default())
    }

    /// Fetch a single inbound by ID
    pub async fn get_inbound(&self, inbound_id: i64) -> Result<Inbound, PanelError> {
        self.list_inbounds()
            .await?
            .into_iter()
            .find(|inbound| inbound.id == inbound_id)
            .ok_or(PanelError::InboundNotFound(inbound_id))
    }

    /// Create an inbound and return it with its panel-assigned ID
    pub async fn add_inbound(&self, payload: &AddInboundPayload) -> Result<Inbound, PanelError> {
        tracing::info!(
            "Adding inbound '{}' on port {} via {}",
            payload.remark,
            payload.port,
            self.base_url
        );
        let inbound: Inbound = self
            .call(ADD_INBOUND_PATH, Some(payload))
            .await?
            .ok_or_else(|| PanelError::MissingObject(ADD_INBOUND_PATH.to_string()))?;

        tracing::info!("Inbound {} added (port {})", inbound.id, inbound.port);
        Ok(inbound)
    }

    /// Add one client to an inbound
    pub async fn add_client(
        &self,
        inbound_id: i64,
        client: &InboundClient,
    ) -> Result<(), PanelError> {
        tracing::info!("Adding client {} to inbound {}", client.email, inbound_id);

        // The panel expects the client list as a JSON document inside a string
        let settings = serde_json::to_string(&serde_json::json!({ "clients": [client] }))?;
        let body = serde_json::json!({
            "id": inbound_id,
            "settings": settings,
        });

        let _: Option<serde_json::Value> = self.call(ADD_CLIENT_PATH, Some(&body)).await?;
        Ok(())
    }

    /// Ask the panel to generate a fresh X25519 key pair
    pub async fn new_x25519_cert(&self) -> Result<X25519Cert, PanelError> {
        tracing::debug!("Requesting new X25519 key pair");
        self.call(NEW_X25519_CERT_PATH, None::<&()>)
            .await?
            .ok_or_else(|| PanelError::MissingObject(NEW_X25519_CERT_PATH.to_string()))
    }

    /// Emails of clients currently online
    pub async fn online_clients(&self) -> Result<Vec<String>, PanelError> {
        let online: Option<Vec<String>> = self.call(ONLINE_CLIENTS_PATH, None::<&()>).await?;
        Ok(online.unwrap_or_default())
    }

    /// Send an authenticated API call and unwrap the response envelope
    async fn call<B, T>(&self, path: &str, body: Option<&B>) -> Result<Option<T>, PanelError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.ensure_session().await?;

        let mut response = self.send(path, body).await?;
        if is_auth_failure(response.status()) {
            tracing::info!(
                "Panel answered {} for {}, re-authenticating",
                response.status(),
                path
            );
            self.login().await?;
            response = self.send(path, body).await?;
        }

        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let text = response.text().await?;
        let envelope: ApiResponse<T> =
            serde_json::from_str(&text).map_err(|source| PanelError::Decode {
                path: path.to_string(),
                source,
            })?;

        if !envelope.success {
            tracing::warn!("Panel rejected {}: {}", path, envelope.msg);
            return Err(PanelError::Rejected {
                path: path.to_string(),
                message: envelope.msg,
            });
        }

        Ok(envelope.obj)
    }

    async fn send<B>(&self, path: &str, body: Option<&B>) -> Result<Response, PanelError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self
            .http
            .post(self.base_url.join(path)?)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Log in if there is no session or it is about to expire
    async fn ensure_session(&self) -> Result<(), PanelError> {
        let mut last_login = self.last_login.lock().await;

        let needs_login = match *last_login {
            None => true,
            Some(at) => {
                let usable = self
                    .options
                    .session_ttl
                    .saturating_sub(self.options.refresh_margin);
                at.elapsed() >= usable
            }
        };

        if needs_login {
            tracing::debug!("Panel session missing or expiring, logging in");
            self.login_locked(&mut last_login).await?;
        }
        Ok(())
    }

    async fn login_locked(&self, last_login: &mut Option<Instant>) -> Result<(), PanelError> {
        tracing::debug!(
            "Logging in to {} as '{}'",
            self.base_url,
            self.credentials.username
        );

        let response = self
            .http
            .post(self.base_url.join(LOGIN_PATH)?)
            .form(&[
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::OK {
            return Err(PanelError::LoginFailed(format!("HTTP {}: {}", status, text)));
        }

        // Panels answer bad credentials with 200 and `success: false`
        if let Ok(envelope) = serde_json::from_str::<ApiResponse<serde_json::Value>>(&text) {
            if !envelope.success {
                return Err(PanelError::LoginFailed(envelope.msg));
            }
        }

        *last_login = Some(Instant::now());
        tracing::debug!("Panel login successful");
        Ok(())
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

//! Panel error types

use thiserror::Error;

/// Errors returned by the panel client
#[derive(Error, Debug)]
pub enum PanelError {
    /// The HTTP request never produced a response
    #[error("Panel transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The request exceeded the client timeout
    #[error("Panel request timed out")]
    Timeout,

    /// Invalid base URL or request path
    #[error("Invalid panel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Non-success HTTP status
    #[error("Panel returned HTTP {status} for {path}")]
    Status { path: String, status: u16 },

    /// Login was refused
    #[error("Panel login failed: {0}")]
    LoginFailed(String),

    /// The panel answered with `success: false`
    #[error("Panel rejected {path}: {message}")]
    Rejected { path: String, message: String },

    /// The response body did not match the expected shape
    #[error("Failed to decode panel response for {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// A successful response carried no object
    #[error("Panel response for {0} carried no object")]
    MissingObject(String),

    /// Embedded JSON settings could not be (de)serialized
    #[error("Malformed inbound settings: {0}")]
    Settings(#[from] serde_json::Error),

    /// No inbound with the requested ID
    #[error("Inbound {0} not found")]
    InboundNotFound(i64),

    /// No client with the requested email in the inbound
    #[error("Client {email} not found in inbound {inbound_id}")]
    ClientNotFound { inbound_id: i64, email: String },

    /// An access link could not be parsed
    #[error("Invalid access link: {0}")]
    InvalidLink(String),
}

impl From<reqwest::Error> for PanelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PanelError::Timeout
        } else {
            PanelError::Transport(e)
        }
    }
}

impl PanelError {
    /// Whether the error happened below the API layer (connection, TLS, timeout)
    pub fn is_transport(&self) -> bool {
        matches!(self, PanelError::Transport(_) | PanelError::Timeout)
    }
}

//! HTTP presence endpoints.
//!
//! The heartbeat driver and the roster poller talk to the backend through
//! [`PresenceApi`]; [`HttpPresenceApi`] is the reqwest implementation.

use async_trait::async_trait;
use beacon_protocol::{parse_roster, ProtocolError, RosterEntry};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;

/// HTTP API errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be sent or the body could not be read.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The credential cannot be sent as a header.
    #[error("Invalid credential: {0}")]
    InvalidCredential(#[from] reqwest::header::InvalidHeaderValue),

    /// The roster body was not understood.
    #[error("Invalid roster: {0}")]
    Roster(#[from] ProtocolError),
}

/// Presence endpoints of the backend.
#[async_trait]
pub trait PresenceApi: Send + Sync {
    /// Ask the server to mark the caller online.
    async fn heartbeat(&self, credential: &str) -> Result<(), ApiError>;

    /// Fetch the full user roster.
    async fn fetch_roster(&self, credential: &str) -> Result<Vec<RosterEntry>, ApiError>;
}

/// reqwest-backed [`PresenceApi`].
#[derive(Debug, Clone)]
pub struct HttpPresenceApi {
    client: reqwest::Client,
    heartbeat_url: String,
    users_url: String,
}

impl HttpPresenceApi {
    /// Create a client for the endpoints in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder().build()?;
        let base = config.api_base_url.trim_end_matches('/');
        Ok(Self {
            client,
            heartbeat_url: format!("{base}{}", config.heartbeat_path),
            users_url: format!("{base}{}", config.users_path),
        })
    }

    fn bearer(credential: &str) -> Result<HeaderValue, ApiError> {
        let mut value = HeaderValue::from_str(&format!("Bearer {credential}"))?;
        value.set_sensitive(true);
        Ok(value)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl PresenceApi for HttpPresenceApi {
    async fn heartbeat(&self, credential: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .post(&self.heartbeat_url)
            .header(AUTHORIZATION, Self::bearer(credential)?)
            .send()
            .await?;
        Self::check(response).await?;
        debug!(url = %self.heartbeat_url, "Heartbeat accepted");
        Ok(())
    }

    async fn fetch_roster(&self, credential: &str) -> Result<Vec<RosterEntry>, ApiError> {
        let response = self
            .client
            .get(&self.users_url)
            .header(AUTHORIZATION, Self::bearer(credential)?)
            .send()
            .await?;
        let body = Self::check(response).await?.bytes().await?;
        let roster = parse_roster(&body)?;
        debug!(url = %self.users_url, users = roster.len(), "Roster fetched");
        Ok(roster)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn server_config(base: &str) -> ServerConfig {
        ServerConfig {
            ws_url: "ws://unused".into(),
            api_base_url: base.into(),
            heartbeat_path: "/api/users/heartbeat".into(),
            users_path: "/api/users".into(),
        }
    }

    #[test]
    fn test_endpoint_urls() {
        let api = HttpPresenceApi::new(&server_config("https://chat.example.com/")).unwrap();
        assert_eq!(api.heartbeat_url, "https://chat.example.com/api/users/heartbeat");
        assert_eq!(api.users_url, "https://chat.example.com/api/users");
    }

    #[test]
    fn test_bearer_header() {
        let value = HttpPresenceApi::bearer("abc").unwrap();
        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());
        assert!(HttpPresenceApi::bearer("bad\ntoken").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = HttpPresenceApi::new(&server_config(&format!("http://{addr}"))).unwrap();
        assert!(matches!(api.heartbeat("t").await, Err(ApiError::Http(_))));
        assert!(matches!(api.fetch_roster("t").await, Err(ApiError::Http(_))));
    }
}

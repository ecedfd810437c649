//! The opaque request/response channel to the server.

use async_trait::async_trait;

use hearth_core::dto::{SyncRequest, SyncResponse};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server answered {status}: {message}")]
    Status { status: u16, message: String },
}

impl TransportError {
    /// Network failures and server-side errors are worth retrying; 4xx
    /// means the request itself is wrong and a retry would just repeat it.
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Status { status, .. } => *status >= 500,
        }
    }
}

/// One sync exchange over whatever the deployment uses as a wire.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;
}

/// HTTP transport against the server's `POST /{prefix}/sync` endpoint.
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, prefix: &str) -> Self {
        let endpoint = format!("{}/{}/sync", base_url.trim_end_matches('/'), prefix);
        HttpTransport { endpoint, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn exchange(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status: status.as_u16(), message });
        }
        response
            .json()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))
    }
}

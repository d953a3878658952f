//! Background credential refresh for downstream data backends
//!
//! One long-lived task acquires a bearer token, republishes it on a fixed
//! interval and keeps the last good value available to readers at all times.
//! Callers that arrive before the first acquisition suspend until it
//! resolves; they never busy-wait and never hang forever, because a failed
//! first acquisition is published as an error.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Default interval between successful refreshes
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Default retry delay after a failed acquisition
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Errors from token acquisition and the refresh service
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("Token acquisition failed: {0}")]
    Acquisition(String),

    #[error("Token service stopped before a token was acquired")]
    ServiceStopped,
}

/// A bearer credential for one downstream backend
#[derive(Debug, Clone)]
pub struct CredentialToken {
    /// Authorization scheme, e.g. "Bearer"
    pub scheme: String,

    /// Opaque token value
    pub value: String,

    /// When this token was acquired
    pub acquired_at: SystemTime,
}

impl CredentialToken {
    /// Create a bearer token acquired now
    pub fn bearer(value: impl Into<String>) -> Self {
        Self {
            scheme: "Bearer".to_string(),
            value: value.into(),
            acquired_at: SystemTime::now(),
        }
    }

    /// Value for an `Authorization` header
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.scheme, self.value)
    }
}

/// Strategy for acquiring a fresh token; tests inject fakes
#[async_trait]
pub trait TokenAcquirer: Send + Sync {
    async fn acquire(&self) -> Result<CredentialToken, TokenError>;
}

/// Configuration for the credential refresh service
#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    /// OAuth2 token endpoint of the authority
    pub token_endpoint: String,

    /// Client id of this host's service principal
    pub client_id: String,

    /// Client secret of this host's service principal
    pub client_secret: String,

    /// Resource/audience the token is requested for
    pub resource: String,

    /// Interval between successful refreshes
    pub refresh_interval: Duration,

    /// Retry delay after a failed acquisition
    pub retry_interval: Duration,
}

impl TokenServiceConfig {
    pub fn new(
        token_endpoint: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            token_endpoint: token_endpoint.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            resource: resource.into(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// OAuth2 client-credentials acquirer
pub struct ClientCredentialAcquirer {
    config: TokenServiceConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token_type: String,
    access_token: String,
}

impl ClientCredentialAcquirer {
    pub fn new(config: TokenServiceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenAcquirer for ClientCredentialAcquirer {
    async fn acquire(&self) -> Result<CredentialToken, TokenError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("resource", self.config.resource.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| TokenError::Acquisition(e.to_string()))?
            .error_for_status()
            .map_err(|e| TokenError::Acquisition(e.to_string()))?;

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Acquisition(e.to_string()))?;

        Ok(CredentialToken {
            scheme: body.token_type,
            value: body.access_token,
            acquired_at: SystemTime::now(),
        })
    }
}

/// Published refresh state: pending until the first acquisition resolves
#[derive(Debug, Clone)]
enum TokenState {
    Pending,
    Ready(CredentialToken),
    Failed(TokenError),
}

/// Owns the background refresh loop with an explicit start/shutdown
/// lifecycle; one instance per process, created by the host's composition
/// root rather than a hidden static.
pub struct CredentialTokenService {
    state_rx: watch::Receiver<TokenState>,
    shutdown_tx: mpsc::Sender<()>,
}

impl CredentialTokenService {
    /// Start the refresh loop with the production acquirer
    pub fn start(config: TokenServiceConfig) -> Self {
        let refresh_interval = config.refresh_interval;
        let retry_interval = config.retry_interval;
        let acquirer = Arc::new(ClientCredentialAcquirer::new(config));
        Self::start_with_acquirer(refresh_interval, retry_interval, acquirer)
    }

    /// Start the refresh loop with an injected acquirer
    pub fn start_with_acquirer(
        refresh_interval: Duration,
        retry_interval: Duration,
        acquirer: Arc<dyn TokenAcquirer>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(TokenState::Pending);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            let mut acquired_once = false;
            loop {
                let delay = match acquirer.acquire().await {
                    Ok(token) => {
                        acquired_once = true;
                        tracing::debug!("Credential token refreshed");
                        let _ = state_tx.send(TokenState::Ready(token));
                        refresh_interval
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Credential token acquisition failed");
                        if !acquired_once {
                            // Unblock first-token waiters with the error;
                            // after a success the last good token stays published.
                            let _ = state_tx.send(TokenState::Failed(e));
                        }
                        retry_interval
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Credential token service shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        Self {
            state_rx,
            shutdown_tx,
        }
    }

    /// Current token, or an error if the first acquisition has not yet
    /// succeeded.
    ///
    /// Suspends (without busy-waiting) while the very first acquisition is
    /// in flight. Once a token has ever been acquired this returns the last
    /// cached value immediately, even while a refresh is in progress.
    pub async fn get_token(&self) -> Result<CredentialToken, TokenError> {
        let mut rx = self.state_rx.clone();
        let result = match rx.wait_for(|s| !matches!(s, TokenState::Pending)).await {
            Ok(state) => match &*state {
                TokenState::Ready(token) => Ok(token.clone()),
                TokenState::Failed(e) => Err(e.clone()),
                TokenState::Pending => Err(TokenError::ServiceStopped),
            },
            Err(_) => Err(TokenError::ServiceStopped),
        };
        result
    }

    /// Non-blocking peek at the last acquired token
    pub fn current(&self) -> Option<CredentialToken> {
        match &*self.state_rx.borrow() {
            TokenState::Ready(token) => Some(token.clone()),
            _ => None,
        }
    }

    /// Stop the refresh loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

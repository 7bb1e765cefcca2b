//! Remote data backend abstraction and its HTTP implementation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::config::{BackendConfig, Config};
use crate::error::SyncError;
use crate::fetch::CancelToken;

/// The part of the backend the connection monitor depends on.
#[async_trait]
pub trait Backend: Send + Sync {
  /// One cheap, always-authorized read. Any error means "not reachable",
  /// except `Unauthenticated`, which means the session must be renewed.
  async fn probe(&self) -> Result<(), SyncError>;

  /// Refresh held credentials before a reconnect attempt.
  async fn refresh_credentials(&self) -> Result<(), SyncError> {
    Ok(())
  }
}

/// JSON-over-HTTP backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpBackend {
  client: Client,
  base_url: Url,
  probe_path: String,
  request_timeout: Duration,
  token: Arc<RwLock<Option<String>>>,
}

impl HttpBackend {
  pub fn new(config: &BackendConfig) -> Result<Self, SyncError> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| SyncError::Config(format!("invalid backend url {}: {}", config.url, e)))?;

    let request_timeout = config.request_timeout();
    let client = Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      probe_path: config.probe_path.clone(),
      request_timeout,
      token: Arc::new(RwLock::new(Config::get_api_token())),
    })
  }

  /// Replace the bearer token used for subsequent requests
  pub fn set_token(&self, token: Option<String>) {
    *self.token.write().unwrap_or_else(|poison| poison.into_inner()) = token;
  }

  fn bearer(&self) -> Option<String> {
    self
      .token
      .read()
      .unwrap_or_else(|poison| poison.into_inner())
      .clone()
  }

  pub fn url(&self, path: &str) -> Result<Url, SyncError> {
    self
      .base_url
      .join(path)
      .map_err(|e| SyncError::Unknown(format!("invalid path {}: {}", path, e)))
  }

  async fn get(&self, path: &str) -> Result<reqwest::Response, SyncError> {
    let url = self.url(path)?;
    let mut request = self
      .client
      .get(url)
      .header(header::ACCEPT, "application/json");
    if let Some(token) = self.bearer() {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| SyncError::from_reqwest(e, self.request_timeout))?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(status, &body))
  }

  /// GET `path` and decode the JSON body.
  ///
  /// The request is dropped (and its connection released) as soon as `token`
  /// is cancelled.
  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    token: &CancelToken,
  ) -> Result<T, SyncError> {
    let request = async {
      let response = self.get(path).await?;
      response
        .json::<T>()
        .await
        .map_err(|e| SyncError::Unknown(format!("Invalid response from {}: {}", path, e)))
    };

    tokio::select! {
      biased;
      _ = token.cancelled() => {
        debug!(path = %path, "Request aborted");
        Err(SyncError::Cancelled)
      }
      result = request => result,
    }
  }
}

#[async_trait]
impl Backend for HttpBackend {
  async fn probe(&self) -> Result<(), SyncError> {
    self.get(&self.probe_path).await.map(|_| ())
  }

  async fn refresh_credentials(&self) -> Result<(), SyncError> {
    let token = Config::get_api_token();
    if token.is_none() {
      warn!("No API token in environment, continuing without credentials");
    }
    self.set_token(token);
    Ok(())
  }
}

impl std::fmt::Debug for HttpBackend {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpBackend")
      .field("base_url", &self.base_url.as_str())
      .field("probe_path", &self.probe_path)
      .field("request_timeout", &self.request_timeout)
      .field("authenticated", &self.bearer().is_some())
      .finish()
  }
}

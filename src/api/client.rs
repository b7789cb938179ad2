//! HTTP client with bearer injection, token refresh and force-offline
//! short-circuit.
//!
//! All requests include the `X-Client-Type: mobile` header so the backend
//! returns JWTs in the response body instead of cookies.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{watch, Mutex};

use super::auth::TokenStore;
use super::endpoints::Endpoint;
use super::error::ApiError;
use super::types::{
    CartResponse, CategoryDto, LoginRequest, LoginResponse, ProductDto, RefreshRequest,
    RefreshResponse,
};
use crate::connectivity::ConnectivityObserver;
use crate::sync::queue::{MutationDispatcher, QueueItem};

const CLIENT_TYPE_HEADER: &str = "X-Client-Type";
const CLIENT_TYPE: &str = "mobile";

/// HTTP client wrapper for storefront API communication.
///
/// Every call goes through [`ApiClient::send`], which is the single place
/// where offline short-circuit, auth header injection, 401 refresh-and-retry
/// and error classification happen.
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn TokenStore>,
    connectivity: Arc<ConnectivityObserver>,
    session_expired: watch::Sender<bool>,
    /// Serializes refreshes so a batch of concurrent 401s refreshes once.
    refresh_lock: Mutex<()>,
}

impl ApiClient {
    /// Create a new API client with the given base URL.
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenStore>,
        connectivity: Arc<ConnectivityObserver>,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        let (session_expired, _) = watch::channel(false);
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            connectivity,
            session_expired,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Underlying reqwest client (shared with the reachability probe).
    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityObserver> {
        &self.connectivity
    }

    /// Flips to `true` when a refresh fails; UI goes read-only until re-login.
    pub fn subscribe_session_expired(&self) -> watch::Receiver<bool> {
        self.session_expired.subscribe()
    }

    pub fn is_session_expired(&self) -> bool {
        *self.session_expired.borrow()
    }

    /// Send a request and decode the JSON response body.
    ///
    /// An empty success body decodes as `Value::Null`.
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        if self.connectivity.is_forced_offline() {
            return Err(ApiError::Offline);
        }

        let (resp, used_token) = self.execute(&method, path, body).await?;
        if resp.status() != StatusCode::UNAUTHORIZED || Endpoint::is_public_path(path) {
            return read_response(resp).await;
        }

        log::info!("{} {} returned 401, refreshing session", method, path);
        self.refresh_session(used_token.as_deref()).await?;

        let (retry, _) = self.execute(&method, path, body).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            self.mark_session_expired();
        }
        read_response(retry).await
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.send(Method::GET, path, None).await
    }

    pub async fn get_typed<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let value = self.get(path).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::Unknown(format!("unexpected response shape: {}", e)))
    }

    /// Log in and store the returned token pair.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let request = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| ApiError::Unknown(e.to_string()))?;
        let value = self
            .send(Method::POST, Endpoint::Login.path(), Some(&body))
            .await?;
        let login: LoginResponse = serde_json::from_value(value)
            .map_err(|e| ApiError::Unknown(format!("Failed to parse login response: {}", e)))?;

        self.tokens
            .store_tokens(&login.access, Some(&login.refresh))
            .map_err(|e| ApiError::Unknown(e.to_string()))?;
        self.session_expired.send_replace(false);
        log::info!("Login successful");
        Ok(())
    }

    /// Best-effort server logout, then local token wipe.
    pub async fn logout(&self) -> Result<(), ApiError> {
        if let Ok(Some(refresh)) = self.tokens.refresh_token() {
            let body = serde_json::json!({ "refresh": refresh });
            if let Err(e) = self
                .send(Method::POST, Endpoint::Logout.path(), Some(&body))
                .await
            {
                e.report("Logout");
            }
        }
        self.tokens
            .clear()
            .map_err(|e| ApiError::Unknown(e.to_string()))
    }

    pub async fn fetch_cart(&self) -> Result<CartResponse, ApiError> {
        self.get_typed(Endpoint::Cart.path()).await
    }

    pub async fn fetch_products(&self) -> Result<Vec<ProductDto>, ApiError> {
        self.get_typed(Endpoint::Products.path()).await
    }

    pub async fn fetch_categories(&self) -> Result<Vec<CategoryDto>, ApiError> {
        self.get_typed(Endpoint::Categories.path()).await
    }

    /// Build and send one request. Returns the response and the access token
    /// that was attached to it.
    async fn execute(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(Response, Option<String>), ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .client
            .request(method.clone(), &url)
            .header(CLIENT_TYPE_HEADER, CLIENT_TYPE);

        let token = if Endpoint::is_public_path(path) {
            None
        } else {
            self.current_access_token()
        };
        if let Some(ref t) = token {
            builder = builder.bearer_auth(t);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder.send().await?;
        Ok((resp, token))
    }

    fn current_access_token(&self) -> Option<String> {
        match self.tokens.access_token() {
            Ok(token) => token,
            Err(e) => {
                log::warn!("Failed to read access token: {}", e);
                None
            }
        }
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `stale` is the token the failed request carried; if another task has
    /// already replaced it, no second refresh is made.
    async fn refresh_session(&self, stale: Option<&str>) -> Result<(), ApiError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current_access_token();
        if current.is_some() && current.as_deref() != stale {
            log::debug!("Access token already refreshed by a concurrent request");
            return Ok(());
        }

        let refresh = match self.tokens.refresh_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.mark_session_expired();
                return Err(ApiError::Authentication {
                    status: 401,
                    body: None,
                });
            }
            Err(e) => {
                self.mark_session_expired();
                return Err(ApiError::Unknown(e.to_string()));
            }
        };

        let body = serde_json::to_value(RefreshRequest { refresh })
            .map_err(|e| ApiError::Unknown(e.to_string()))?;
        let (resp, _) = self
            .execute(&Method::POST, Endpoint::TokenRefresh.path(), Some(&body))
            .await?;

        let value = match read_response(resp).await {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Token refresh failed: {}", e);
                self.mark_session_expired();
                return Err(e);
            }
        };
        let refreshed: RefreshResponse = serde_json::from_value(value)
            .map_err(|e| ApiError::Unknown(format!("Failed to parse refresh response: {}", e)))?;

        self.tokens
            .store_tokens(&refreshed.access, refreshed.refresh.as_deref())
            .map_err(|e| ApiError::Unknown(e.to_string()))?;
        log::info!("Session refreshed");
        Ok(())
    }

    fn mark_session_expired(&self) {
        let changed = self.session_expired.send_if_modified(|expired| {
            let was = *expired;
            *expired = true;
            !was
        });
        if changed {
            log::warn!("Session expired, re-login required");
        }
    }
}

/// Decode a response into JSON, classifying non-success statuses.
async fn read_response(resp: Response) -> Result<Value, ApiError> {
    let status = resp.status();
    let text = resp.text().await?;

    if !status.is_success() {
        let body = serde_json::from_str::<Value>(&text).ok();
        return Err(ApiError::from_status(status.as_u16(), body));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| ApiError::Unknown(format!("invalid JSON response: {}", e)))
}

impl MutationDispatcher for ApiClient {
    async fn dispatch(&self, item: &QueueItem) -> Result<Value, ApiError> {
        let body = (!item.payload.is_null()).then_some(&item.payload);
        self.send(item.method.as_reqwest(), &item.endpoint, body)
            .await
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::storage::config::GoogleConfig;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to start callback listener: {0}")]
    ListenerError(std::io::Error),
    #[error("Failed to parse token: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("No refresh token available")]
    NoRefreshToken,
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("OAuth error: {0}")]
    OAuthError(String),
    #[error("Failed to decode token response: {0}")]
    DecodeError(String),
    #[error("Interactive authorization required")]
    AuthorizationRequired,
    #[error("Authorization callback failed: {0}")]
    CallbackError(String),
    #[error("Timed out waiting for the authorization callback")]
    CallbackTimeout,
}

/// The only durable OAuth state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl StoredCredential {
    pub fn new(access_token: String, expires_in_seconds: i64) -> Self {
        Self {
            access_token,
            refresh_token: None,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_seconds),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: String) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }

    pub fn needs_refresh(&self) -> bool {
        let buffer = chrono::Duration::minutes(5);
        self.expires_at <= Utc::now() + buffer
    }
}

pub struct TokenStorage {
    path: PathBuf,
}

impl TokenStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save_token(&self, token: &StoredCredential) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(token)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }

    pub fn load_token(&self) -> Result<StoredCredential, AuthError> {
        let content = std::fs::read_to_string(&self.path)?;
        let token: StoredCredential = serde_json::from_str(&content)?;
        Ok(token)
    }

    /// `None` when nothing has been persisted yet.
    pub fn load_existing(&self) -> Result<Option<StoredCredential>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        self.load_token().map(Some)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    NoToken,
    Authorizing,
    Authenticated,
    Refreshing,
}

/// Shows the authorization URL to the user (browser, terminal, ...).
pub trait AuthorizationPrompt: Send + Sync {
    fn present(&self, authorization_url: &str);
}

/// Prints the URL and tries to open it in the default browser.
pub struct BrowserPrompt;

impl AuthorizationPrompt for BrowserPrompt {
    fn present(&self, authorization_url: &str) {
        println!("\n=== Google Calendar Authentication ===\n");
        println!("Open this URL in your browser to authorize gcal-mirror:\n");
        println!("{}\n", authorization_url);

        if open::that(authorization_url).is_err() {
            println!("(Could not open a browser automatically, please copy the URL above)");
        }
    }
}

/// Anything that can hand out a bearer token for a remote call.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    refresh_token: Option<String>,
}

struct TokenCache {
    state: TokenState,
    credential: Option<StoredCredential>,
}

/// Obtains, caches, refreshes and persists OAuth credentials.
///
/// Calls are serialized on an internal lock, so concurrent callers never
/// trigger two refreshes or two authorization flows.
pub struct TokenManager {
    client_id: String,
    client_secret: String,
    redirect_port: u16,
    authorization_timeout: Duration,
    auth_endpoint: String,
    token_endpoint: String,
    storage: TokenStorage,
    client: reqwest::Client,
    prompt: Option<Arc<dyn AuthorizationPrompt>>,
    cache: Mutex<TokenCache>,
}

impl TokenManager {
    pub fn new(config: &GoogleConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_port: config.redirect_port,
            authorization_timeout: Duration::from_secs(config.authorization_timeout_secs),
            auth_endpoint: AUTH_ENDPOINT.to_string(),
            token_endpoint: TOKEN_ENDPOINT.to_string(),
            storage: TokenStorage::new(config.token_cache.clone()),
            client: reqwest::Client::new(),
            prompt: None,
            cache: Mutex::new(TokenCache {
                state: TokenState::NoToken,
                credential: None,
            }),
        }
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn AuthorizationPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_endpoints(mut self, auth_endpoint: String, token_endpoint: String) -> Self {
        self.auth_endpoint = auth_endpoint;
        self.token_endpoint = token_endpoint;
        self
    }

    pub async fn state(&self) -> TokenState {
        self.cache.lock().await.state
    }

    pub fn get_auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent&state={}",
            self.auth_endpoint,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(CALENDAR_SCOPE),
            urlencoding::encode(state)
        )
    }

    /// Runs the interactive flow even if a usable credential exists.
    pub async fn reauthorize(&self) -> Result<StoredCredential, AuthError> {
        let mut cache = self.cache.lock().await;
        cache.state = TokenState::Authorizing;
        let outcome = self.authorize().await;
        Self::settle(&mut cache, outcome)
    }

    fn settle(
        cache: &mut TokenCache,
        outcome: Result<StoredCredential, AuthError>,
    ) -> Result<StoredCredential, AuthError> {
        match outcome {
            Ok(credential) => {
                cache.state = TokenState::Authenticated;
                cache.credential = Some(credential.clone());
                Ok(credential)
            }
            Err(e) => {
                cache.state = TokenState::NoToken;
                cache.credential = None;
                Err(e)
            }
        }
    }

    async fn valid_credential(&self) -> Result<StoredCredential, AuthError> {
        let mut cache = self.cache.lock().await;

        if cache.credential.is_none() {
            cache.credential = match self.storage.load_existing() {
                Ok(credential) => credential,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable stored credential: {}", e);
                    None
                }
            };
        }

        let Some(current) = cache.credential.clone() else {
            tracing::info!("No stored credential, starting authorization");
            cache.state = TokenState::Authorizing;
            let outcome = self.authorize().await;
            return Self::settle(&mut cache, outcome);
        };

        if !current.needs_refresh() {
            cache.state = TokenState::Authenticated;
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            tracing::info!("Access token expired and no refresh token, starting authorization");
            cache.state = TokenState::Authorizing;
            let outcome = self.authorize().await;
            return Self::settle(&mut cache, outcome);
        };

        cache.state = TokenState::Refreshing;
        match self.refresh_token(&refresh_token).await {
            Err(AuthError::OAuthError(reason)) if self.prompt.is_some() => {
                tracing::warn!("Refresh rejected ({}), starting authorization", reason);
                cache.state = TokenState::Authorizing;
                let outcome = self.authorize().await;
                Self::settle(&mut cache, outcome)
            }
            outcome => Self::settle(&mut cache, outcome),
        }
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<StoredCredential, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let token_response = self.request_token(&params).await?;

        // Google only rotates the refresh token occasionally.
        let new_token = StoredCredential::new(token_response.access_token, token_response.expires_in)
            .with_refresh_token(
                token_response
                    .refresh_token
                    .unwrap_or_else(|| refresh_token.to_string()),
            );

        self.storage.save_token(&new_token)?;
        tracing::info!("Access token refreshed, valid until {}", new_token.expires_at);

        Ok(new_token)
    }

    pub async fn exchange_code_for_token(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<StoredCredential, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];

        let token_response = self.request_token(&params).await?;

        let new_token = StoredCredential::new(token_response.access_token, token_response.expires_in)
            .with_refresh_token(token_response.refresh_token.ok_or(AuthError::NoRefreshToken)?);

        self.storage.save_token(&new_token)?;
        tracing::info!("Authorization complete, credential stored");

        Ok(new_token)
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            tracing::error!("Token endpoint rejected request. Status: {}, Body: {}", status, body);
            return Err(AuthError::OAuthError(format!("Status {}: {}", status, body)));
        }

        serde_json::from_str(&body).map_err(|e| AuthError::DecodeError(e.to_string()))
    }

    async fn authorize(&self) -> Result<StoredCredential, AuthError> {
        let prompt = self.prompt.as_ref().ok_or(AuthError::AuthorizationRequired)?;

        let listener = TcpListener::bind(("127.0.0.1", self.redirect_port))
            .await
            .map_err(AuthError::ListenerError)?;
        let port = listener.local_addr().map_err(AuthError::ListenerError)?.port();
        let redirect_uri = format!("http://127.0.0.1:{}", port);
        tracing::info!("Waiting for authorization callback on {}", redirect_uri);
        let expected_state = uuid::Uuid::new_v4().to_string();

        let mut callback = tokio::spawn(wait_for_callback(listener));
        prompt.present(&self.get_auth_url(&redirect_uri, &expected_state));

        let params = match tokio::time::timeout(self.authorization_timeout, &mut callback).await {
            Ok(joined) => joined.map_err(|e| AuthError::CallbackError(e.to_string()))??,
            Err(_) => {
                callback.abort();
                return Err(AuthError::CallbackTimeout);
            }
        };

        if let Some(error) = params.get("error") {
            return Err(AuthError::OAuthError(error.clone()));
        }
        if params.get("state") != Some(&expected_state) {
            return Err(AuthError::CallbackError("state parameter mismatch".to_string()));
        }
        let code = params
            .get("code")
            .ok_or_else(|| AuthError::CallbackError("no code in callback".to_string()))?;

        self.exchange_code_for_token(code, &redirect_uri).await
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        Ok(self.valid_credential().await?.access_token)
    }
}

/// Accepts exactly one connection on `listener` and returns its query
/// parameters. The listener is closed when this returns.
async fn wait_for_callback(listener: TcpListener) -> Result<HashMap<String, String>, AuthError> {
    let (stream, _) = listener.accept().await?;
    let mut reader = BufReader::new(stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim().is_empty() {
            break;
        }
    }

    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::CallbackError("invalid HTTP request".to_string()))?;
    let url = url::Url::parse(&format!("http://localhost{}", target))
        .map_err(|e| AuthError::CallbackError(e.to_string()))?;
    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    let response = "HTTP/1.1 200 OK\r\n\
        Content-Type: text/html\r\n\
        Connection: close\r\n\
        \r\n\
        <html><body>\
        <h1>gcal-mirror is authorized</h1>\
        <p>You can close this window.</p>\
        </body></html>";

    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await.ok();

    Ok(params)
}

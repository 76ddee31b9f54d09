//! OAuth token flows: device authorization, PKCE authorization code and
//! refresh-token exchange.
//!
//! # Design
//! The authorization server answers without the `{code, msg, data}` envelope
//! and reports flow states (`authorization_pending`, `slow_down`, ...) as
//! [`OAuthError`](crate::error::OAuthError)s, so polling can branch on
//! [`CozeError::oauth_code`] alone. Token requests go through an anonymous
//! client: they must not carry the token they are about to replace.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::async_client::AsyncCozeClient;
use crate::auth::{AsyncTokenSource, Credential, TokenSource};
use crate::client::decode_json;
use crate::config::{ClientConfig, COZE_CN_BASE_URL, COZE_COM_BASE_URL};
use crate::error::{CozeError, OAuthErrorCode};
use crate::http::RequestDescriptor;
use crate::sync_client::CozeClient;

pub const DEVICE_CODE_PATH: &str = "/api/permission/oauth2/device/code";
pub const TOKEN_PATH: &str = "/api/permission/oauth2/token";
pub const AUTHORIZE_PATH: &str = "/api/permission/oauth2/authorize";
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Extra wait the server asks for with `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    /// Expiry as a unix timestamp in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
}

impl OAuthToken {
    pub fn expires_at(&self) -> Option<SystemTime> {
        let secs = u64::try_from(self.expires_in).ok().filter(|s| *s > 0)?;
        UNIX_EPOCH.checked_add(Duration::from_secs(secs))
    }

    pub fn credential(&self) -> Credential {
        Credential::new(self.access_token.clone(), self.expires_at())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceAuthCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Seconds to wait between two token polls.
    #[serde(default = "default_interval")]
    pub interval: u64,
    pub expires_in: i64,
}

fn default_interval() -> u64 {
    5
}

impl DeviceAuthCode {
    /// Page the user opens to approve the device.
    pub fn verification_url(&self) -> String {
        format!("{}?user_code={}", self.verification_uri, self.user_code)
    }
}

#[derive(Serialize)]
struct DeviceCodeBody<'a> {
    client_id: &'a str,
}

#[derive(Default, Serialize)]
struct TokenBody<'a> {
    grant_type: &'a str,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_verifier: Option<&'a str>,
}

pub fn device_code_request(client_id: &str) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post(DEVICE_CODE_PATH).json(&DeviceCodeBody { client_id })
}

pub fn device_token_request(client_id: &str, device_code: &str) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post(TOKEN_PATH).json(&TokenBody {
        grant_type: DEVICE_CODE_GRANT,
        client_id,
        device_code: Some(device_code),
        ..TokenBody::default()
    })
}

pub fn refresh_token_request(client_id: &str, refresh_token: &str) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post(TOKEN_PATH).json(&TokenBody {
        grant_type: "refresh_token",
        client_id,
        refresh_token: Some(refresh_token),
        ..TokenBody::default()
    })
}

/// The `authorization_code` grant of the PKCE flow.
pub fn authorization_code_request(
    client_id: &str,
    redirect_uri: &str,
    code: &str,
    code_verifier: &str,
) -> Result<RequestDescriptor, CozeError> {
    RequestDescriptor::post(TOKEN_PATH).json(&TokenBody {
        grant_type: "authorization_code",
        client_id,
        code: Some(code),
        redirect_uri: Some(redirect_uri),
        code_verifier: Some(code_verifier),
        ..TokenBody::default()
    })
}

/// Host serving the browser-facing authorize page for `api_base_url`.
///
/// The two public endpoints move from `api.` to `www.`; any other base
/// (a proxy, a private deployment) serves both.
pub fn www_base_url(api_base_url: &str) -> String {
    let base = api_base_url.trim_end_matches('/');
    if base == COZE_COM_BASE_URL || base == COZE_CN_BASE_URL {
        base.replacen("://api.", "://www.", 1)
    } else {
        base.to_string()
    }
}

/// The `code_challenge` sent on the authorize URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChallenge {
    pub challenge: String,
    pub method: String,
}

impl CodeChallenge {
    /// The `plain` method: the challenge is the verifier itself.
    pub fn plain(code_verifier: &str) -> Self {
        Self {
            challenge: code_verifier.to_string(),
            method: "plain".to_string(),
        }
    }

    /// A challenge derived elsewhere, e.g. `S256` over the verifier.
    pub fn new(challenge: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            challenge: challenge.into(),
            method: method.into(),
        }
    }
}

/// Browser URL that starts an authorization-code flow.
///
/// With `workspace_id` the user authorizes for that workspace only.
pub fn oauth_url(
    www_base_url: &str,
    client_id: &str,
    redirect_uri: &str,
    state: &str,
    challenge: Option<&CodeChallenge>,
    workspace_id: Option<&str>,
) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("state", state);
    if let Some(challenge) = challenge {
        query
            .append_pair("code_challenge", &challenge.challenge)
            .append_pair("code_challenge_method", &challenge.method);
    }

    let base = www_base_url.trim_end_matches('/');
    let path = match workspace_id {
        Some(id) => format!("/api/permission/oauth2/workspace_id/{id}/authorize"),
        None => AUTHORIZE_PATH.to_string(),
    };
    format!("{base}{path}?{}", query.finish())
}

/// How long to wait before polling again after `err`, or `None` to give up.
pub fn next_poll_interval(current: Duration, err: &CozeError) -> Option<Duration> {
    match err.oauth_code()? {
        OAuthErrorCode::AuthorizationPending => Some(current),
        OAuthErrorCode::SlowDown => Some(current + SLOW_DOWN_STEP),
        OAuthErrorCode::AccessDenied | OAuthErrorCode::ExpiredToken => None,
    }
}

// ---------------------------------------------------------------------------
// Blocking
// ---------------------------------------------------------------------------

/// Device authorization flow for apps without a browser.
#[derive(Debug, Clone)]
pub struct DeviceFlow {
    client: CozeClient,
    client_id: String,
}

impl DeviceFlow {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>) -> Self {
        Self {
            client: CozeClient::anonymous(config),
            client_id: client_id.into(),
        }
    }

    pub fn get_device_code(&self) -> Result<DeviceAuthCode, CozeError> {
        let desc = device_code_request(&self.client_id)?;
        Ok(self.client.execute(&desc, decode_json::<DeviceAuthCode>)?.into_data())
    }

    /// Exchange `code` for a token.
    ///
    /// Without `poll` a pending authorization is returned as an error. With
    /// `poll` the call blocks until the user approves or denies, or the code
    /// expires.
    pub fn get_access_token(&self, code: &DeviceAuthCode, poll: bool) -> Result<OAuthToken, CozeError> {
        let desc = device_token_request(&self.client_id, &code.device_code)?;
        let mut interval = Duration::from_secs(code.interval);
        loop {
            let err = match self.client.execute(&desc, decode_json::<OAuthToken>) {
                Ok(response) => return Ok(response.into_data()),
                Err(err) => err,
            };
            match next_poll_interval(interval, &err).filter(|_| poll) {
                Some(next) => {
                    interval = next;
                    debug!(interval_secs = interval.as_secs(), code = ?err.oauth_code(), "device authorization pending");
                    std::thread::sleep(interval);
                }
                None => return Err(err),
            }
        }
    }

    pub fn refresh_access_token(&self, refresh_token: &str) -> Result<OAuthToken, CozeError> {
        let desc = refresh_token_request(&self.client_id, refresh_token)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>)?.into_data())
    }
}

/// Authorization-code flow with a PKCE verifier, for public clients.
#[derive(Debug, Clone)]
pub struct PkceFlow {
    client: CozeClient,
    client_id: String,
    www_base_url: String,
}

impl PkceFlow {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>) -> Self {
        Self {
            client: CozeClient::anonymous(config),
            client_id: client_id.into(),
            www_base_url: www_base_url(config.get_base_url()),
        }
    }

    /// Override the host of the authorize page.
    pub fn with_www_base_url(mut self, url: &str) -> Self {
        self.www_base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn get_oauth_url(
        &self,
        redirect_uri: &str,
        state: &str,
        challenge: &CodeChallenge,
        workspace_id: Option<&str>,
    ) -> String {
        oauth_url(&self.www_base_url, &self.client_id, redirect_uri, state, Some(challenge), workspace_id)
    }

    /// Redeem the `code` handed to `redirect_uri`.
    pub fn get_access_token(&self, redirect_uri: &str, code: &str, code_verifier: &str) -> Result<OAuthToken, CozeError> {
        let desc = authorization_code_request(&self.client_id, redirect_uri, code, code_verifier)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>)?.into_data())
    }

    pub fn refresh_access_token(&self, refresh_token: &str) -> Result<OAuthToken, CozeError> {
        let desc = refresh_token_request(&self.client_id, refresh_token)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>)?.into_data())
    }
}

/// [`TokenSource`] backed by the refresh grant.
///
/// The server rotates the refresh token on every exchange; the newest one is
/// kept for the next call.
pub struct RefreshTokenSource {
    client: CozeClient,
    client_id: String,
    refresh_token: parking_lot::Mutex<String>,
}

impl RefreshTokenSource {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            client: CozeClient::anonymous(config),
            client_id: client_id.into(),
            refresh_token: parking_lot::Mutex::new(refresh_token.into()),
        }
    }
}

impl TokenSource for RefreshTokenSource {
    fn fetch(&self) -> Result<Credential, CozeError> {
        let current = self.refresh_token.lock().clone();
        let desc = refresh_token_request(&self.client_id, &current)?;
        let token = self.client.execute(&desc, decode_json::<OAuthToken>)?.into_data();
        if !token.refresh_token.is_empty() {
            *self.refresh_token.lock() = token.refresh_token.clone();
        }
        Ok(token.credential())
    }
}

// ---------------------------------------------------------------------------
// Async
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AsyncDeviceFlow {
    client: AsyncCozeClient,
    client_id: String,
}

impl AsyncDeviceFlow {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>) -> Result<Self, CozeError> {
        Ok(Self {
            client: AsyncCozeClient::anonymous(config)?,
            client_id: client_id.into(),
        })
    }

    pub async fn get_device_code(&self) -> Result<DeviceAuthCode, CozeError> {
        let desc = device_code_request(&self.client_id)?;
        Ok(self.client.execute(&desc, decode_json::<DeviceAuthCode>).await?.into_data())
    }

    pub async fn get_access_token(&self, code: &DeviceAuthCode, poll: bool) -> Result<OAuthToken, CozeError> {
        let desc = device_token_request(&self.client_id, &code.device_code)?;
        let mut interval = Duration::from_secs(code.interval);
        loop {
            let err = match self.client.execute(&desc, decode_json::<OAuthToken>).await {
                Ok(response) => return Ok(response.into_data()),
                Err(err) => err,
            };
            match next_poll_interval(interval, &err).filter(|_| poll) {
                Some(next) => {
                    interval = next;
                    debug!(interval_secs = interval.as_secs(), code = ?err.oauth_code(), "device authorization pending");
                    tokio::time::sleep(interval).await;
                }
                None => return Err(err),
            }
        }
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<OAuthToken, CozeError> {
        let desc = refresh_token_request(&self.client_id, refresh_token)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>).await?.into_data())
    }
}

#[derive(Debug, Clone)]
pub struct AsyncPkceFlow {
    client: AsyncCozeClient,
    client_id: String,
    www_base_url: String,
}

impl AsyncPkceFlow {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>) -> Result<Self, CozeError> {
        Ok(Self {
            client: AsyncCozeClient::anonymous(config)?,
            client_id: client_id.into(),
            www_base_url: www_base_url(config.get_base_url()),
        })
    }

    pub fn with_www_base_url(mut self, url: &str) -> Self {
        self.www_base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn get_oauth_url(
        &self,
        redirect_uri: &str,
        state: &str,
        challenge: &CodeChallenge,
        workspace_id: Option<&str>,
    ) -> String {
        oauth_url(&self.www_base_url, &self.client_id, redirect_uri, state, Some(challenge), workspace_id)
    }

    pub async fn get_access_token(&self, redirect_uri: &str, code: &str, code_verifier: &str) -> Result<OAuthToken, CozeError> {
        let desc = authorization_code_request(&self.client_id, redirect_uri, code, code_verifier)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>).await?.into_data())
    }

    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<OAuthToken, CozeError> {
        let desc = refresh_token_request(&self.client_id, refresh_token)?;
        Ok(self.client.execute(&desc, decode_json::<OAuthToken>).await?.into_data())
    }
}

/// Async counterpart of [`RefreshTokenSource`].
pub struct AsyncRefreshTokenSource {
    client: AsyncCozeClient,
    client_id: String,
    refresh_token: parking_lot::Mutex<String>,
}

impl AsyncRefreshTokenSource {
    pub fn new(config: &ClientConfig, client_id: impl Into<String>, refresh_token: impl Into<String>) -> Result<Self, CozeError> {
        Ok(Self {
            client: AsyncCozeClient::anonymous(config)?,
            client_id: client_id.into(),
            refresh_token: parking_lot::Mutex::new(refresh_token.into()),
        })
    }
}

#[async_trait]
impl AsyncTokenSource for AsyncRefreshTokenSource {
    async fn fetch(&self) -> Result<Credential, CozeError> {
        let current = self.refresh_token.lock().clone();
        let desc = refresh_token_request(&self.client_id, &current)?;
        let token = self.client.execute(&desc, decode_json::<OAuthToken>).await?.into_data();
        if !token.refresh_token.is_empty() {
            *self.refresh_token.lock() = token.refresh_token.clone();
        }
        Ok(token.credential())
    }
}

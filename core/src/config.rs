//! Client configuration: base URL and timeouts.
//!
//! # Design
//! These are the only knobs the core respects. The HTTP transport itself
//! (proxies, certificate stores, connection limits) is configured by handing
//! a pre-built `ureq::Agent` or `reqwest::Client` to the client constructors.

use std::time::Duration;

/// Base URL of the international endpoint.
pub const COZE_COM_BASE_URL: &str = "https://api.coze.com";

/// Base URL of the mainland China endpoint.
pub const COZE_CN_BASE_URL: &str = "https://api.coze.cn";

/// Environment variable read by [`ClientConfig::from_env`].
pub const BASE_URL_ENV: &str = "COZE_API_BASE";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// The two regional endpoints the API is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Com,
    Cn,
}

impl Region {
    pub fn base_url(self) -> &'static str {
        match self {
            Region::Com => COZE_COM_BASE_URL,
            Region::Cn => COZE_CN_BASE_URL,
        }
    }
}

/// Connection settings shared by the blocking and async clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    base_url: String,
    connect_timeout: Duration,
    timeout: Duration,
    user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(COZE_COM_BASE_URL)
    }
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: DEFAULT_TIMEOUT,
            user_agent: format!("coze-core/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn region(region: Region) -> Self {
        Self::new(region.base_url())
    }

    /// Read the base URL from `COZE_API_BASE`, defaulting to the `.com` endpoint.
    pub fn from_env() -> Self {
        match std::env::var(BASE_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }

    pub fn base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Total time allowed for one call, including reading a streamed body.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = agent.into();
        self
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }

    pub fn get_connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn get_user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_com_endpoint() {
        let config = ClientConfig::default();
        assert_eq!(config.get_base_url(), COZE_COM_BASE_URL);
        assert_eq!(config.get_connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.get_timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn region_selects_endpoint() {
        assert_eq!(ClientConfig::region(Region::Cn).get_base_url(), "https://api.coze.cn");
        assert_eq!(ClientConfig::region(Region::Com).get_base_url(), "https://api.coze.com");
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let config = ClientConfig::new("http://localhost:3000/");
        assert_eq!(config.get_base_url(), "http://localhost:3000");
        let config = config.base_url("http://127.0.0.1:8080//");
        assert_eq!(config.get_base_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn builder_overrides_timeouts() {
        let config = ClientConfig::default()
            .connect_timeout(Duration::from_millis(250))
            .timeout(Duration::from_secs(3));
        assert_eq!(config.get_connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.get_timeout(), Duration::from_secs(3));
    }
}

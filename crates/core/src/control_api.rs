//! Client for the engine's REST control API

use reqwest::blocking::Client;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Per-request timeout; the engine runs on loopback
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum ControlApiError {
    #[error("Control API request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Control API returned HTTP {0}")]
    Status(u16),

    #[error("Invalid control API response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineVersion {
    pub version: String,
    #[serde(default)]
    pub premium: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    #[serde(alias = "Global")]
    Global,
    #[serde(alias = "Rule")]
    Rule,
    #[serde(alias = "Direct")]
    Direct,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProxyMode::Global => "Global",
            ProxyMode::Rule => "Rule",
            ProxyMode::Direct => "Direct",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

/// Subset of `GET /configs` the tray cares about
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfigs {
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub socks_port: u16,
    #[serde(default)]
    pub mixed_port: u16,
    #[serde(default)]
    pub allow_lan: bool,
    pub mode: ProxyMode,
    pub log_level: Option<LogLevel>,
}

/// Operations the tray needs from the running engine
pub trait ControlApi: Send + Sync {
    fn get_version(&self) -> Result<EngineVersion, ControlApiError>;

    fn get_configs(&self) -> Result<EngineConfigs, ControlApiError>;

    fn update_mode(&self, mode: ProxyMode) -> Result<(), ControlApiError>;
}

/// `ControlApi` over HTTP against `http://<address>`
pub struct HttpControlApi {
    client: Client,
    base_url: String,
    secret: String,
}

impl HttpControlApi {
    pub fn new(address: &str, secret: &str) -> Result<Self, ControlApiError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("ProxyTray/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url(address),
            secret: secret.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send(&self, request: reqwest::blocking::RequestBuilder) -> Result<String, ControlApiError> {
        let request = match bearer(&self.secret) {
            Some(value) => request.header(AUTHORIZATION, value),
            None => request,
        };

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(ControlApiError::Status(status.as_u16()));
        }
        Ok(response.text()?)
    }

    fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlApiError> {
        let body = self.send(self.client.get(self.url(path)))?;
        parse(&body)
    }
}

impl ControlApi for HttpControlApi {
    fn get_version(&self) -> Result<EngineVersion, ControlApiError> {
        self.get("/version")
    }

    fn get_configs(&self) -> Result<EngineConfigs, ControlApiError> {
        self.get("/configs")
    }

    fn update_mode(&self, mode: ProxyMode) -> Result<(), ControlApiError> {
        let body = serde_json::json!({ "mode": mode });
        self.send(self.client.patch(self.url("/configs")).json(&body))?;
        Ok(())
    }
}

fn base_url(address: &str) -> String {
    let address = address.trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

fn bearer(secret: &str) -> Option<String> {
    (!secret.is_empty()).then(|| format!("Bearer {}", secret))
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, ControlApiError> {
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1:9090"), "http://127.0.0.1:9090");
        assert_eq!(base_url("http://localhost:9090/"), "http://localhost:9090");
    }

    #[test]
    fn test_bearer_only_with_secret() {
        assert_eq!(bearer(""), None);
        assert_eq!(bearer("abc").as_deref(), Some("Bearer abc"));
    }

    #[test]
    fn test_parse_version() {
        let version: EngineVersion = parse(r#"{"version":"v1.18.0"}"#).unwrap();
        assert_eq!(version.version, "v1.18.0");
        assert!(!version.premium);

        let premium: EngineVersion = parse(r#"{"premium":true,"version":"2023.08.17"}"#).unwrap();
        assert!(premium.premium);
    }

    #[test]
    fn test_parse_configs() {
        let body = r#"{
            "port": 7890, "socks-port": 7891, "mixed-port": 0, "redir-port": 0,
            "allow-lan": false, "mode": "rule", "log-level": "info", "ipv6": false
        }"#;
        let configs: EngineConfigs = parse(body).unwrap();

        assert_eq!(configs.port, 7890);
        assert_eq!(configs.socks_port, 7891);
        assert_eq!(configs.mode, ProxyMode::Rule);
        assert_eq!(configs.log_level, Some(LogLevel::Info));
    }

    #[test]
    fn test_mode_accepts_capitalized() {
        let configs: EngineConfigs = parse(r#"{"mode":"Global"}"#).unwrap();
        assert_eq!(configs.mode, ProxyMode::Global);
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        let body = serde_json::json!({ "mode": ProxyMode::Direct });
        assert_eq!(body.to_string(), r#"{"mode":"direct"}"#);
    }

    #[test]
    fn test_bad_body_is_decode_error() {
        let err = parse::<EngineVersion>("<html>").unwrap_err();
        assert!(matches!(err, ControlApiError::Decode(_)));
    }

    #[test]
    fn test_unreachable_engine_is_transport_error() {
        // Port 9 (discard) on loopback is expected to refuse connections
        let api = HttpControlApi::new("127.0.0.1:9", "").unwrap();
        assert!(matches!(api.get_version(), Err(ControlApiError::Transport(_))));
    }
}

use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

pub const DEFAULT_STREAMING_URL: &str = "ws://localhost:8080";
pub const DEFAULT_UNARY_URL: &str = "http://localhost:8080/predict";
pub const DEFAULT_UNARY_MODE: &str = "everything";

const HTTP_TIMEOUT_SECONDS_DEFAULT: u64 = 30;
const HTTP_TIMEOUT_SECONDS_MAX: u64 = 600;

/// Wire style, chosen once from the server URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One persistent websocket for the whole batch, MessagePack frames.
    Streaming,
    /// One multipart HTTP POST per item.
    Unary,
}

impl TransportKind {
    pub fn from_url(url: &Url) -> Result<Self> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self::Streaming),
            "http" | "https" => Ok(Self::Unary),
            other => bail!("unsupported server url scheme '{other}' (expected ws, wss, http or https)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Unary => "unary",
        }
    }
}

/// Per-request knobs that travel on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    pub confidence: Option<f64>,
    pub mode: String,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            confidence: None,
            mode: DEFAULT_UNARY_MODE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub url: Url,
    pub kind: TransportKind,
    pub http_timeout: Duration,
    pub request: RequestOptions,
}

impl ServerConfig {
    pub fn parse(raw_url: &str, request: RequestOptions) -> Result<Self> {
        let url = Url::parse(raw_url.trim())
            .with_context(|| format!("invalid server url '{raw_url}'"))?;
        let kind = TransportKind::from_url(&url)?;
        if let Some(confidence) = request.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                bail!("confidence must be within [0, 1], got {confidence}");
            }
        }
        Ok(Self {
            url,
            kind,
            http_timeout: http_timeout(),
            request,
        })
    }
}

fn http_timeout() -> Duration {
    let seconds = env::var("MASKRELAY_HTTP_TIMEOUT_S")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(1, HTTP_TIMEOUT_SECONDS_MAX))
        .unwrap_or(HTTP_TIMEOUT_SECONDS_DEFAULT);
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::{RequestOptions, ServerConfig, TransportKind, DEFAULT_STREAMING_URL, DEFAULT_UNARY_URL};

    #[test]
    fn scheme_selects_the_transport_variant() -> anyhow::Result<()> {
        let streaming = ServerConfig::parse(DEFAULT_STREAMING_URL, RequestOptions::default())?;
        assert_eq!(streaming.kind, TransportKind::Streaming);
        let unary = ServerConfig::parse(DEFAULT_UNARY_URL, RequestOptions::default())?;
        assert_eq!(unary.kind, TransportKind::Unary);
        let secure = ServerConfig::parse("wss://seg.example:443/ws", RequestOptions::default())?;
        assert_eq!(secure.kind, TransportKind::Streaming);
        Ok(())
    }

    #[test]
    fn unknown_scheme_is_a_configuration_error() {
        let err = ServerConfig::parse("ftp://localhost", RequestOptions::default()).unwrap_err();
        assert!(err.to_string().contains("unsupported server url scheme 'ftp'"));
        assert!(ServerConfig::parse("not a url", RequestOptions::default()).is_err());
    }

    #[test]
    fn confidence_outside_unit_range_is_rejected() {
        let options = RequestOptions {
            confidence: Some(1.5),
            ..RequestOptions::default()
        };
        assert!(ServerConfig::parse(DEFAULT_STREAMING_URL, options).is_err());
    }

    #[test]
    fn http_timeout_has_default_and_bounds() -> anyhow::Result<()> {
        let config = ServerConfig::parse(DEFAULT_UNARY_URL, RequestOptions::default())?;
        assert!(config.http_timeout.as_secs() >= 1);
        assert!(config.http_timeout.as_secs() <= 600);
        Ok(())
    }
}

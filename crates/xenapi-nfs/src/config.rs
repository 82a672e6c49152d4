//! Connection configuration for a XAPI endpoint.

use crate::error::{XenApiError, XenApiResult};

use serde::{Deserialize, Serialize};
use url::Url;

/// Configuration for connecting to a XAPI pool master / host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XenApiConfig {
    /// Endpoint URL (e.g. "https://xenserver.lab.local")
    pub url: String,
    /// Username (usually "root")
    pub username: String,
    /// Password
    pub password: String,
    /// Skip TLS certificate verification (self-signed hosts)
    #[serde(default)]
    pub insecure: bool,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 { 30 }

impl Default for XenApiConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: String::new(),
            password: String::new(),
            insecure: false,
            timeout_secs: 30,
        }
    }
}

impl XenApiConfig {
    pub fn new(
        url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Read `XENAPI_URL`, `XENAPI_USER`, `XENAPI_PASSWORD` and the optional
    /// `XENAPI_INSECURE` / `XENAPI_TIMEOUT_SECS`.
    pub fn from_env() -> XenApiResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> XenApiResult<Self> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| XenApiError::config(format!("{key} is not set")))
        };

        let mut config = Self::new(
            required("XENAPI_URL")?,
            required("XENAPI_USER")?,
            required("XENAPI_PASSWORD")?,
        );

        if let Some(raw) = lookup("XENAPI_INSECURE") {
            config.insecure = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup("XENAPI_TIMEOUT_SECS") {
            config.timeout_secs = raw.trim().parse().map_err(|e| {
                XenApiError::config(format!("XENAPI_TIMEOUT_SECS '{raw}' is not a number: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parsed endpoint URL; only http and https are accepted.
    pub fn endpoint(&self) -> XenApiResult<Url> {
        let url = Url::parse(&self.url)
            .map_err(|e| XenApiError::config(format!("Invalid XAPI url '{}': {e}", self.url)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(XenApiError::config(format!(
                "Unsupported XAPI url scheme '{other}'"
            ))),
        }
    }

    pub fn validate(&self) -> XenApiResult<()> {
        self.endpoint()?;
        if self.username.is_empty() {
            return Err(XenApiError::config("username must not be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(XenApiError::config("timeout_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XenApiErrorKind;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_from_json() {
        let cfg: XenApiConfig = serde_json::from_str(
            r#"{"url":"https://xs","username":"root","password":"pw"}"#,
        )
        .unwrap();
        assert!(!cfg.insecure);
        assert_eq!(cfg.timeout_secs, 30);
    }

    #[test]
    fn camel_case_fields() {
        let cfg: XenApiConfig = serde_json::from_str(
            r#"{"url":"https://xs","username":"root","password":"pw","insecure":true,"timeoutSecs":5}"#,
        )
        .unwrap();
        assert!(cfg.insecure);
        assert_eq!(cfg.timeout_secs, 5);
    }

    #[test]
    fn env_lookup_full() {
        let cfg = XenApiConfig::from_lookup(lookup_from(&[
            ("XENAPI_URL", "http://10.0.0.2"),
            ("XENAPI_USER", "root"),
            ("XENAPI_PASSWORD", "secret"),
            ("XENAPI_INSECURE", "true"),
            ("XENAPI_TIMEOUT_SECS", "12"),
        ]))
        .unwrap();
        assert_eq!(cfg.url, "http://10.0.0.2");
        assert!(cfg.insecure);
        assert_eq!(cfg.timeout_secs, 12);
    }

    #[test]
    fn env_lookup_missing_password() {
        let err = XenApiConfig::from_lookup(lookup_from(&[
            ("XENAPI_URL", "http://10.0.0.2"),
            ("XENAPI_USER", "root"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Config);
        assert!(err.message.contains("XENAPI_PASSWORD"));
    }

    #[test]
    fn env_lookup_bad_timeout() {
        let err = XenApiConfig::from_lookup(lookup_from(&[
            ("XENAPI_URL", "http://10.0.0.2"),
            ("XENAPI_USER", "root"),
            ("XENAPI_PASSWORD", "pw"),
            ("XENAPI_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert_eq!(err.kind, XenApiErrorKind::Config);
    }

    #[test]
    fn rejects_non_http_scheme() {
        let cfg = XenApiConfig::new("ftp://xs", "root", "pw");
        assert!(cfg.validate().is_err());
        assert!(XenApiConfig::new("not a url", "root", "pw").validate().is_err());
        assert!(XenApiConfig::new("https://xs", "root", "pw").validate().is_ok());
    }
}

//! Session configuration.
//!
//! [`SessionConfig`] is the serializable part of a session's options: target,
//! timeouts, redirect and reuse policy, request shape and buffer hints. It can
//! be built in code or loaded from JSON. Callbacks and pluggable collaborators
//! are attached separately (see [`TransferHooks`](crate::TransferHooks)).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::connection::{ClosurePolicy, SslConfig};
use crate::constants::{
    CONNECT_TIMEOUT_MS, DEFAULT_POOL_CAPACITY, DOWNLOAD_BUFFER_SIZE, HEADER_BUFFER_INITIAL,
    HEADER_CHUNK_HARD_CAP, MAX_POOL_CAPACITY, UPLOAD_BUFFER_SIZE,
};
use crate::target::Credentials;

/// Upper bound for any configured timeout (24 hours).
const MAX_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Errors from loading or validating a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds a value outside its accepted range.
    #[error("invalid config value for `{field}`: {reason}")]
    Invalid {
        /// Field name as it appears in serialized form.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The JSON document could not be parsed.
    #[error("failed to parse session config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Request kind for HTTP-family transfers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    /// Plain retrieval.
    #[default]
    Get,
    /// Headers only.
    Head,
    /// Form POST of `post_fields`.
    Post,
    /// Upload of the read-callback stream.
    Put,
    /// Arbitrary method token.
    Custom(String),
}

impl RequestMethod {
    /// Method token as sent on the request line.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Custom(token) => token,
        }
    }
}

/// HTTP proxy routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy host name.
    pub host: String,
    /// Proxy port.
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Credentials for the proxy, if it requires them.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_proxy_port() -> u16 {
    1080
}

/// FTP-specific switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpOptions {
    /// Transfer in ASCII mode instead of binary.
    pub ascii: bool,
    /// List names only (NLST) for directory URLs.
    pub list_only: bool,
    /// Append to the remote file on upload (APPE) instead of replacing it.
    pub append: bool,
}

/// Connection pool sizing and eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of slots.
    pub capacity: usize,
    /// Which idle connection to evict when the pool is full.
    pub closure_policy: ClosurePolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            closure_policy: ClosurePolicy::default(),
        }
    }
}

/// Buffer sizing hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferHints {
    /// Download buffer size in bytes.
    pub download_size: usize,
    /// Minimum (initial) upload chunk size in bytes.
    pub upload_size: usize,
    /// Initial header buffer capacity.
    pub header_initial: usize,
    /// Largest single chunk the header buffer accepts.
    pub header_hard_cap: usize,
}

impl Default for BufferHints {
    fn default() -> Self {
        Self {
            download_size: DOWNLOAD_BUFFER_SIZE,
            upload_size: UPLOAD_BUFFER_SIZE,
            header_initial: HEADER_BUFFER_INITIAL,
            header_hard_cap: HEADER_CHUNK_HARD_CAP,
        }
    }
}

/// Session-wide options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// What to transfer.
    pub url: Option<String>,
    /// Port override used when the URL carries none.
    pub port: Option<u16>,
    /// Credentials for the target host.
    pub credentials: Option<Credentials>,
    /// HTTP proxy for HTTP transfers.
    pub proxy: Option<ProxyConfig>,
    /// Encrypted-channel settings.
    pub ssl: SslConfig,

    /// Connect-phase timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Whole-transfer timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Lower speed bound in bytes per second.
    pub low_speed_limit: Option<u64>,
    /// Seconds the speed may stay below `low_speed_limit`.
    pub low_speed_time_secs: u64,

    /// Follow `Location:` redirects.
    pub follow_location: bool,
    /// Maximum redirects to follow; `None` means unlimited.
    pub max_redirects: Option<u32>,
    /// Send credentials to hosts reached through redirects as well.
    pub unrestricted_auth: bool,
    /// Set `Referer:` automatically when following redirects.
    pub auto_referer: bool,

    /// Explicit `Referer:` value.
    pub referer: Option<String>,
    /// `User-Agent:` value; a default is sent when unset.
    pub user_agent: Option<String>,
    /// Treat HTTP status >= 400 as a transfer failure.
    pub fail_on_error: bool,
    /// HTTP request kind.
    pub method: RequestMethod,
    /// Body for POST requests.
    pub post_fields: Option<String>,
    /// Extra request header lines (`Name: value`).
    pub headers: Vec<String>,
    /// Opaque `Cookie:` header value.
    pub cookie: Option<String>,
    /// Byte range (`first-last`).
    pub range: Option<String>,
    /// Resume offset in bytes.
    pub resume_from: Option<u64>,
    /// Stop after this many body bytes.
    pub max_download: Option<u64>,
    /// Skip the body (HEAD for HTTP).
    pub no_body: bool,
    /// Upload using the read callback instead of downloading.
    pub upload: bool,
    /// Size of the upload, when known in advance.
    pub upload_size: Option<u64>,
    /// Deliver response headers to the body sink as well.
    pub include_header: bool,
    /// Ask for the remote file time.
    pub get_filetime: bool,
    /// FTP switches.
    pub ftp: FtpOptions,

    /// Pool sizing and eviction.
    pub pool: PoolConfig,
    /// Never reuse an existing connection for the next transfer.
    pub reuse_fresh: bool,
    /// Close every connection after use.
    pub reuse_forbid: bool,

    /// Buffer sizing.
    pub buffers: BufferHints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: None,
            port: None,
            credentials: None,
            proxy: None,
            ssl: SslConfig::default(),
            connect_timeout_ms: Some(CONNECT_TIMEOUT_MS),
            timeout_ms: None,
            low_speed_limit: None,
            low_speed_time_secs: 0,
            follow_location: false,
            max_redirects: None,
            unrestricted_auth: false,
            auto_referer: false,
            referer: None,
            user_agent: None,
            fail_on_error: false,
            method: RequestMethod::Get,
            post_fields: None,
            headers: Vec::new(),
            cookie: None,
            range: None,
            resume_from: None,
            max_download: None,
            no_body: false,
            upload: false,
            upload_size: None,
            include_header: false,
            get_filetime: false,
            ftp: FtpOptions::default(),
            pool: PoolConfig::default(),
            reuse_fresh: false,
            reuse_forbid: false,
            buffers: BufferHints::default(),
        }
    }
}

impl SessionConfig {
    /// Creates a default configuration targeting `url`.
    #[must_use]
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_POOL_CAPACITY).contains(&self.pool.capacity) {
            return Err(ConfigError::invalid(
                "pool.capacity",
                format!("{} (expected 1..={MAX_POOL_CAPACITY})", self.pool.capacity),
            ));
        }
        validate_timeout_ms("connect_timeout_ms", self.connect_timeout_ms)?;
        validate_timeout_ms("timeout_ms", self.timeout_ms)?;

        if self.low_speed_limit.is_some() && self.low_speed_time_secs == 0 {
            return Err(ConfigError::invalid(
                "low_speed_time_secs",
                "must be > 0 when low_speed_limit is set",
            ));
        }

        let buffers = &self.buffers;
        if buffers.download_size == 0 {
            return Err(ConfigError::invalid("buffers.download_size", "must be > 0"));
        }
        if buffers.upload_size == 0 || buffers.upload_size > buffers.download_size {
            return Err(ConfigError::invalid(
                "buffers.upload_size",
                format!(
                    "{} (expected 1..={})",
                    buffers.upload_size, buffers.download_size
                ),
            ));
        }
        if buffers.header_initial == 0 || buffers.header_initial > buffers.header_hard_cap {
            return Err(ConfigError::invalid(
                "buffers.header_initial",
                format!(
                    "{} (expected 1..={})",
                    buffers.header_initial, buffers.header_hard_cap
                ),
            ));
        }

        for header in &self.headers {
            if !header.contains(':') || header.contains(['\r', '\n']) {
                return Err(ConfigError::invalid(
                    "headers",
                    format!("'{header}' is not a single `Name: value` line"),
                ));
            }
        }

        if let Some(proxy) = &self.proxy
            && proxy.host.trim().is_empty()
        {
            return Err(ConfigError::invalid("proxy.host", "must not be empty"));
        }

        Ok(())
    }

    /// Connect-phase timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Whole-transfer timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    /// Effective request method after applying `no_body` and `upload`.
    #[must_use]
    pub fn effective_method(&self) -> RequestMethod {
        if self.no_body {
            RequestMethod::Head
        } else if self.upload && self.method == RequestMethod::Get {
            RequestMethod::Put
        } else {
            self.method.clone()
        }
    }
}

fn validate_timeout_ms(field: &'static str, value: Option<u64>) -> Result<(), ConfigError> {
    if let Some(ms) = value
        && ms > MAX_TIMEOUT_MS
    {
        return Err(ConfigError::invalid(
            field,
            format!("{ms} (expected 0..={MAX_TIMEOUT_MS})"),
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pool.capacity, DEFAULT_POOL_CAPACITY);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.timeout(), None);
        assert!(!config.follow_location);
    }

    #[test]
    fn test_from_json_applies_defaults_for_missing_fields() {
        let config = SessionConfig::from_json_str(
            r#"{
                "url": "http://example.com/",
                "follow_location": true,
                "max_redirects": 3,
                "pool": { "capacity": 2, "closure_policy": "oldest" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.url.as_deref(), Some("http://example.com/"));
        assert!(config.follow_location);
        assert_eq!(config.max_redirects, Some(3));
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.pool.closure_policy, ClosurePolicy::Oldest);
        assert_eq!(config.buffers, BufferHints::default());
    }

    #[test]
    fn test_from_json_rejects_zero_capacity() {
        let error = SessionConfig::from_json_str(r#"{ "pool": { "capacity": 0 } }"#).unwrap_err();
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "pool.capacity",
                ..
            }
        ));
    }

    #[test]
    fn test_from_json_rejects_malformed_document() {
        let error = SessionConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn test_upload_size_must_not_exceed_download_size() {
        let mut config = SessionConfig::default();
        config.buffers.upload_size = config.buffers.download_size + 1;
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("buffers.upload_size"));
    }

    #[test]
    fn test_low_speed_limit_requires_window() {
        let config = SessionConfig {
            low_speed_limit: Some(100),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_header_lines_validated() {
        let config = SessionConfig {
            headers: vec!["X-Bad\r\nInjected: yes".to_string()],
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_method() {
        let mut config = SessionConfig::default();
        assert_eq!(config.effective_method(), RequestMethod::Get);
        config.upload = true;
        assert_eq!(config.effective_method(), RequestMethod::Put);
        config.no_body = true;
        assert_eq!(config.effective_method(), RequestMethod::Head);
    }

    #[test]
    fn test_custom_method_round_trips_through_json() {
        let config = SessionConfig {
            method: RequestMethod::Custom("PROPFIND".to_string()),
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed = SessionConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed.method.as_str(), "PROPFIND");
    }
}

//! HTTP transport configuration.

use std::time::Duration;

/// Configuration of an [`HttpTransport`](super::HttpTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    /// Bind address for the listener.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Path of the liveness probe.
    pub liveness_path: String,
    /// Path of the readiness probe.
    pub readiness_path: String,
    /// Serves `GET /debug/status` when set.
    pub enable_debug: bool,
    /// Maximum time to wait for a request to complete.
    pub request_timeout: Duration,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            liveness_path: "/alivez".to_string(),
            readiness_path: "/readyz".to_string(),
            enable_debug: false,
            request_timeout: Duration::from_secs(30),
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

impl HttpConfig {
    /// Fills zero and empty fields from [`HttpConfig::default`].
    ///
    /// Useful for partially specified configurations. `enable_debug` is taken as is,
    /// and a zero port becomes 8080; set the port after merging to listen on an
    /// OS-assigned port.
    #[must_use]
    pub fn merged_with_defaults(self) -> Self {
        let defaults = Self::default();
        Self {
            host: non_empty(self.host, defaults.host),
            port: if self.port == 0 {
                defaults.port
            } else {
                self.port
            },
            liveness_path: non_empty(self.liveness_path, defaults.liveness_path),
            readiness_path: non_empty(self.readiness_path, defaults.readiness_path),
            enable_debug: self.enable_debug,
            request_timeout: if self.request_timeout.is_zero() {
                defaults.request_timeout
            } else {
                self.request_timeout
            },
            max_body_bytes: if self.max_body_bytes == 0 {
                defaults.max_body_bytes
            } else {
                self.max_body_bytes
            },
        }
    }

    /// The `host:port` string the listener binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn non_empty(value: String, default: String) -> String {
    if value.is_empty() {
        default
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.liveness_path, "/alivez");
        assert_eq!(config.readiness_path, "/readyz");
        assert!(!config.enable_debug);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_body_bytes, 2_097_152);
    }

    #[test]
    fn merge_keeps_defaults_for_empty_fields() {
        let partial = HttpConfig {
            host: String::new(),
            port: 0,
            liveness_path: "/live".to_string(),
            readiness_path: String::new(),
            enable_debug: true,
            request_timeout: Duration::ZERO,
            max_body_bytes: 0,
        };

        let merged = partial.merged_with_defaults();
        assert_eq!(merged.host, "0.0.0.0");
        assert_eq!(merged.port, 8080);
        assert_eq!(merged.liveness_path, "/live");
        assert_eq!(merged.readiness_path, "/readyz");
        assert!(merged.enable_debug);
        assert_eq!(merged.request_timeout, Duration::from_secs(30));
        assert_eq!(merged.max_body_bytes, 2_097_152);
    }

    #[test]
    fn bind_address_joins_host_and_port() {
        let config = HttpConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..HttpConfig::default()
        };
        assert_eq!(config.bind_address(), "127.0.0.1:0");
    }
}

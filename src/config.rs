//! Listener Configuration
//!
//! Per-listener settings for PROXY protocol preamble processing. One
//! configuration value is built per listener and shared by reference across
//! every connection accepted on it.

use serde::Deserialize;
use std::time::Duration;

/// PROXY protocol preamble configuration for a listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyProtocolConfig {
    /// Timeout for reading the whole preamble (header plus optional preface
    /// sniff), in milliseconds. Absent means unbounded.
    pub connect_timeout_ms: Option<u64>,

    /// Settings for TLS-offloaded deployments.
    pub tls_offload: TlsOffloadConfig,

    /// Optional routing key used to label diagnostics for this listener.
    pub logger_name: Option<String>,
}

impl Default for ProxyProtocolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: None,
            tls_offload: TlsOffloadConfig::default(),
            logger_name: None,
        }
    }
}

impl ProxyProtocolConfig {
    /// Get the connect timeout as a Duration, if one is configured.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings for connections whose TLS was terminated upstream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsOffloadConfig {
    /// Mark forwarded connections as secure so downstream consumers treat
    /// them as TLS connections.
    pub enabled: bool,

    /// Detect the application protocol by examining the stream for the
    /// HTTP/2 client preface. Useful when the proxy does not send
    /// PP2_TYPE_ALPN. Only takes effect when `enabled` is true.
    pub detect_application_protocol_by_preface: bool,
}

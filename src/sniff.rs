//! Application Protocol Sniffing
//!
//! Classifies the first bytes following the PROXY header as either the
//! HTTP/2 client preface or a fallback protocol. The classification is
//! one-shot: a window is inspected exactly once and the verdict is final.

/// HTTP/2 connection preface (RFC 9113, section 3.4).
pub const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Length of the HTTP/2 client preface.
pub const H2_PREFACE_LEN: usize = H2_PREFACE.len();

/// Application protocol selected for a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppProtocol {
    /// No protocol was negotiated or sniffed.
    #[default]
    Unset,
    /// Fallback protocol for anything that is not an HTTP/2 preface.
    Http11,
    /// HTTP/2 over cleartext, identified by its client preface.
    H2,
}

impl AppProtocol {
    /// ALPN-style protocol identifier.
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            AppProtocol::Unset => b"",
            AppProtocol::Http11 => b"http/1.1",
            AppProtocol::H2 => b"h2",
        }
    }
}

impl std::fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppProtocol::Unset => f.write_str("unset"),
            AppProtocol::Http11 => f.write_str("http/1.1"),
            AppProtocol::H2 => f.write_str("h2"),
        }
    }
}

/// Classify a full-length preface window.
///
/// The window must hold at least [`H2_PREFACE_LEN`] bytes; streams that end
/// earlier are classified as [`AppProtocol::Http11`] by the caller without
/// invoking this function.
pub fn sniff_preface(window: &[u8]) -> AppProtocol {
    debug_assert!(window.len() >= H2_PREFACE_LEN);
    if &window[..H2_PREFACE_LEN] == H2_PREFACE {
        AppProtocol::H2
    } else {
        AppProtocol::Http11
    }
}

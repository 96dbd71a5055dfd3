//! Connection Metadata
//!
//! Immutable record of everything the preamble established for a connection:
//! the decoded PROXY header, the sniffed application protocol, the endpoints
//! before and after any override, and the synthetic secure flag for
//! TLS-offloaded deployments. Built once, after the preamble completes, and
//! owned by the connection for its entire lifetime.

use std::net::SocketAddr;

use crate::header::{ProxyCommand, ProxyHeader};
use crate::sniff::AppProtocol;

#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    connection_id: u64,
    header: ProxyHeader,
    application_protocol: AppProtocol,
    original_local: Option<SocketAddr>,
    original_remote: Option<SocketAddr>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    secure: bool,
}

impl ConnectionMetadata {
    pub(crate) fn new(
        connection_id: u64,
        header: ProxyHeader,
        application_protocol: AppProtocol,
        original_local: Option<SocketAddr>,
        original_remote: Option<SocketAddr>,
        tls_offload_enabled: bool,
    ) -> Self {
        let forwarded = header.command == ProxyCommand::Proxy;
        let (local, remote) = if forwarded {
            (
                header.destination.or(original_local),
                header.source.or(original_remote),
            )
        } else {
            (original_local, original_remote)
        };

        Self {
            connection_id,
            application_protocol,
            original_local,
            original_remote,
            local,
            remote,
            secure: tls_offload_enabled && forwarded,
            header,
        }
    }

    /// Identifier for log correlation only.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn header(&self) -> &ProxyHeader {
        &self.header
    }

    pub fn application_protocol(&self) -> AppProtocol {
        self.application_protocol
    }

    /// Local endpoint as observed on the socket, before any override.
    pub fn original_local_addr(&self) -> Option<SocketAddr> {
        self.original_local
    }

    /// Remote endpoint as observed on the socket, before any override.
    pub fn original_remote_addr(&self) -> Option<SocketAddr> {
        self.original_remote
    }

    /// Logical local endpoint; the header's destination for forwarded
    /// connections, otherwise the socket's.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Logical remote endpoint; the header's source for forwarded
    /// connections, otherwise the socket's.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Whether the header overrode the connection's logical endpoints.
    pub fn endpoints_overridden(&self) -> bool {
        self.header.command == ProxyCommand::Proxy
    }

    /// Whether the connection should be treated as TLS-terminated upstream.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Negotiated application protocol capability.
    ///
    /// Only exposed for secure (TLS-offloaded, forwarded) connections. A
    /// PP2_TYPE_ALPN value sent by the proxy takes precedence over the
    /// sniffed preface.
    pub fn negotiated_protocol(&self) -> Option<&[u8]> {
        if !self.secure {
            return None;
        }
        if let Some(alpn) = self.header.alpn.as_deref() {
            return Some(alpn);
        }
        match self.application_protocol {
            AppProtocol::Unset => None,
            other => Some(other.as_bytes()),
        }
    }
}

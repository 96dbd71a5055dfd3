//! PROXY Protocol Header Decoding
//!
//! Wraps the `ppp` grammar parser in a resumable decoder that can be driven
//! to completion across partial reads. The decoder reports exactly how many
//! bytes the header consumed and how far it has examined, so the caller can
//! advance its cursor without ever re-offering ruled-out bytes.

use std::net::{IpAddr, SocketAddr};

use ppp::{HeaderResult, PartialResult};

/// Maximum PROXY header size this crate will buffer.
///
/// Larger v2 length fields are rejected whether the header is still
/// incomplete or arrived whole in a single read.
pub const MAX_HEADER_SIZE: usize = 536;

/// Longest legal v1 header line, CRLF included.
const MAX_V1_HEADER_SIZE: usize = 107;

const V1_PREFIX: &[u8] = b"PROXY ";

/// PP2_TYPE_ALPN type code.
const PP2_TYPE_ALPN: u8 = 0x01;

/// Command carried by a PROXY header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Proxy-internal connection (health check, v1 UNKNOWN); endpoints are
    /// not rewritten.
    Local,
    /// Real forwarded connection on behalf of the reported source.
    Proxy,
}

/// PROXY protocol version the header was encoded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// Decoded PROXY protocol header.
///
/// Produced exactly once per connection and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    /// LOCAL or PROXY, as reported on the wire.
    pub command: ProxyCommand,
    /// Original client endpoint the proxy is forwarding for.
    pub source: Option<SocketAddr>,
    /// Endpoint the client originally connected to.
    pub destination: Option<SocketAddr>,
    /// Wire format version.
    pub version: ProxyVersion,
    /// PP2_TYPE_ALPN value, when the proxy sent one (v2 only).
    pub alpn: Option<Vec<u8>>,
}

/// Errors produced while decoding a PROXY header.
#[derive(Debug)]
pub enum HeaderDecodeError {
    /// The byte sequence is not a valid v1 or v2 header.
    Malformed(String),
    /// The header is still incomplete past the size bound.
    TooLong(usize),
}

impl std::fmt::Display for HeaderDecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HeaderDecodeError::Malformed(msg) => write!(f, "malformed PROXY header: {}", msg),
            HeaderDecodeError::TooLong(len) => {
                write!(f, "PROXY header exceeds {} bytes: {}", MAX_HEADER_SIZE, len)
            }
        }
    }
}

impl std::error::Error for HeaderDecodeError {}

/// One decoding step over the accumulated unconsumed bytes.
#[derive(Debug)]
pub enum HeaderDecode {
    /// A header was produced; `consumed` bytes belong to it.
    Complete { header: ProxyHeader, consumed: usize },
    /// More data is needed; everything up to `examined` has been ruled out.
    NeedMore { examined: usize },
}

/// Resumable PROXY header decoder.
///
/// Carries its own progress state so the read loop can hand it the growing
/// unconsumed buffer each iteration without tracking parser internals.
#[derive(Debug, Default)]
pub struct HeaderDecoder {
    examined: usize,
}

impl HeaderDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes already scanned without producing a header.
    pub fn examined(&self) -> usize {
        self.examined
    }

    /// Attempt to decode a header from the unconsumed buffer.
    ///
    /// The buffer must always start at the same stream position across
    /// calls; it only ever grows until the header completes.
    pub fn try_decode(&mut self, buf: &[u8]) -> Result<HeaderDecode, HeaderDecodeError> {
        let result = HeaderResult::parse(buf);
        if result.is_incomplete() {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(HeaderDecodeError::TooLong(buf.len()));
            }
            debug_assert!(buf.len() >= self.examined);
            self.examined = buf.len();
            return Ok(HeaderDecode::NeedMore { examined: buf.len() });
        }

        match result {
            HeaderResult::V1(Ok(header)) => {
                let consumed = header.header.len();
                let header = convert_v1(&header.addresses);
                Ok(HeaderDecode::Complete { header, consumed })
            }
            HeaderResult::V2(Ok(header)) => {
                let consumed = header.header.len();
                if consumed > MAX_HEADER_SIZE {
                    return Err(HeaderDecodeError::TooLong(consumed));
                }
                let header = convert_v2(&header);
                Ok(HeaderDecode::Complete { header, consumed })
            }
            HeaderResult::V1(Err(error)) => {
                // The grammar parser reports some unterminated v1 lines as
                // errors rather than incomplete, depending on where the
                // buffer happens to end (e.g. right after a field
                // separator). The verdict is only final once the line
                // terminator arrived or the v1 bound is exceeded.
                if unterminated_v1(buf) {
                    debug_assert!(buf.len() >= self.examined);
                    self.examined = buf.len();
                    return Ok(HeaderDecode::NeedMore { examined: buf.len() });
                }
                Err(HeaderDecodeError::Malformed(error.to_string()))
            }
            HeaderResult::V2(Err(error)) => Err(HeaderDecodeError::Malformed(error.to_string())),
        }
    }
}

fn unterminated_v1(buf: &[u8]) -> bool {
    buf.len() <= MAX_V1_HEADER_SIZE
        && buf.starts_with(V1_PREFIX)
        && !buf.windows(2).any(|window| window == b"\r\n")
}

fn convert_v1(addresses: &ppp::v1::Addresses) -> ProxyHeader {
    let (command, source, destination) = match addresses {
        ppp::v1::Addresses::Tcp4(a) => (
            ProxyCommand::Proxy,
            Some(SocketAddr::new(IpAddr::V4(a.source_address), a.source_port)),
            Some(SocketAddr::new(
                IpAddr::V4(a.destination_address),
                a.destination_port,
            )),
        ),
        ppp::v1::Addresses::Tcp6(a) => (
            ProxyCommand::Proxy,
            Some(SocketAddr::new(IpAddr::V6(a.source_address), a.source_port)),
            Some(SocketAddr::new(
                IpAddr::V6(a.destination_address),
                a.destination_port,
            )),
        ),
        // UNKNOWN carries no usable endpoints; treat like a LOCAL command.
        ppp::v1::Addresses::Unknown => (ProxyCommand::Local, None, None),
    };

    ProxyHeader {
        command,
        source,
        destination,
        version: ProxyVersion::V1,
        alpn: None,
    }
}

fn convert_v2(header: &ppp::v2::Header) -> ProxyHeader {
    let command = match header.command {
        ppp::v2::Command::Local => ProxyCommand::Local,
        ppp::v2::Command::Proxy => ProxyCommand::Proxy,
    };

    let (source, destination) = match &header.addresses {
        ppp::v2::Addresses::IPv4(a) => (
            Some(SocketAddr::new(IpAddr::V4(a.source_address), a.source_port)),
            Some(SocketAddr::new(
                IpAddr::V4(a.destination_address),
                a.destination_port,
            )),
        ),
        ppp::v2::Addresses::IPv6(a) => (
            Some(SocketAddr::new(IpAddr::V6(a.source_address), a.source_port)),
            Some(SocketAddr::new(
                IpAddr::V6(a.destination_address),
                a.destination_port,
            )),
        ),
        // Unix and unspecified addresses have no TCP endpoints to rewrite.
        ppp::v2::Addresses::Unix(_) | ppp::v2::Addresses::Unspecified => (None, None),
    };

    let mut alpn = None;
    for tlv in header.tlvs().flatten() {
        if tlv.kind == PP2_TYPE_ALPN && !tlv.value.is_empty() {
            alpn = Some(tlv.value.to_vec());
        }
    }

    ProxyHeader {
        command,
        source,
        destination,
        version: ProxyVersion::V2,
        alpn,
    }
}

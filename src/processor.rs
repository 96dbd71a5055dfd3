//! Preamble Processor
//!
//! Drives the `AwaitHeader -> AwaitPreface -> Done` state machine over an
//! accepted connection: reads bounded chunks, feeds the unconsumed bytes to
//! the header decoder until a PROXY header is produced, optionally sniffs
//! the HTTP/2 preface that follows, and hands back the connection with its
//! metadata and every byte after the header still readable.
//!
//! One processor instance is built per listener and shared across its
//! connections; all per-connection state lives in the per-call machine.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::chunk::{ChunkReader, CursorError, RewoundStream};
use crate::config::ProxyProtocolConfig;
use crate::header::{HeaderDecode, HeaderDecodeError, HeaderDecoder, ProxyHeader};
use crate::metadata::ConnectionMetadata;
use crate::sniff::{sniff_preface, AppProtocol, H2_PREFACE_LEN};

/// Fatal outcomes of preamble processing. None of these reach the
/// downstream stage; the connection is aborted where they are detected.
#[derive(Debug)]
pub enum PreambleError {
    /// The grammar parser rejected the byte sequence.
    MalformedHeader(HeaderDecodeError),
    /// The far end closed before a header completed.
    PrematureClose,
    /// The connect deadline elapsed before processing finished.
    DeadlineExceeded,
    /// The underlying stream failed.
    Io(io::Error),
    /// A cursor or state invariant was violated; indicates a bug, not
    /// attacker input.
    Invariant(&'static str),
}

impl std::fmt::Display for PreambleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreambleError::MalformedHeader(e) => {
                write!(f, "parsing PROXY protocol header failed: {}", e)
            }
            PreambleError::PrematureClose => {
                write!(f, "connection closed while reading PROXY protocol header")
            }
            PreambleError::DeadlineExceeded => {
                write!(f, "timeout while reading connection preamble")
            }
            PreambleError::Io(e) => write!(f, "preamble read failed: {}", e),
            PreambleError::Invariant(msg) => write!(f, "preamble invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for PreambleError {}

impl From<io::Error> for PreambleError {
    fn from(e: io::Error) -> Self {
        PreambleError::Io(e)
    }
}

impl From<CursorError> for PreambleError {
    fn from(e: CursorError) -> Self {
        match e {
            CursorError::DeadlineExceeded => PreambleError::DeadlineExceeded,
            CursorError::Io(e) => PreambleError::Io(e),
            CursorError::InvalidAdvance(msg) => PreambleError::Invariant(msg),
        }
    }
}

/// Successful result of preamble processing.
#[derive(Debug)]
pub enum Preamble<S> {
    /// The preamble completed; hand the connection to the next stage.
    Ready(ProxiedConnection<S>),
    /// The read was cancelled externally; stop without handing off.
    Cancelled,
}

/// Connection that finished preamble processing.
///
/// Reading resumes at the first byte after the PROXY header — the sniffed
/// preface, if any, is replayed so the downstream protocol handler sees it.
#[derive(Debug)]
pub struct ProxiedConnection<S> {
    metadata: ConnectionMetadata,
    stream: RewoundStream<S>,
}

impl<S> ProxiedConnection<S> {
    pub fn metadata(&self) -> &ConnectionMetadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (ConnectionMetadata, RewoundStream<S>) {
        (self.metadata, self.stream)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxiedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxiedConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Per-listener preamble processor.
#[derive(Debug, Clone)]
pub struct PreambleProcessor {
    connect_timeout: Option<Duration>,
    tls_offload_enabled: bool,
    detect_preface: bool,
}

impl PreambleProcessor {
    pub fn new(config: &ProxyProtocolConfig) -> Self {
        let tls = &config.tls_offload;
        Self {
            connect_timeout: config.connect_timeout(),
            tls_offload_enabled: tls.enabled,
            // Preface detection only takes effect for TLS-offloaded
            // listeners, matching the configuration contract.
            detect_preface: tls.enabled && tls.detect_application_protocol_by_preface,
        }
    }

    /// Process the preamble of one accepted connection.
    ///
    /// `original_local` and `original_remote` are the socket endpoints as
    /// accepted; they are preserved in the metadata even when the header
    /// overrides the logical endpoints.
    pub async fn process<S>(
        &self,
        connection_id: u64,
        stream: S,
        original_local: Option<SocketAddr>,
        original_remote: Option<SocketAddr>,
        closed: &CancellationToken,
    ) -> Result<Preamble<S>, PreambleError>
    where
        S: AsyncRead + Unpin,
    {
        let deadline = self.connect_timeout.map(|timeout| Instant::now() + timeout);
        match self.connect_timeout {
            Some(timeout) => debug!(
                conn = connection_id,
                timeout_ms = timeout.as_millis() as u64,
                "starting preamble processing with connect timeout"
            ),
            None => debug!(
                conn = connection_id,
                "starting preamble processing without connect timeout"
            ),
        }
        if self.detect_preface {
            debug!(
                conn = connection_id,
                "application protocol detection by h2 preface enabled"
            );
        }

        let mut reader = ChunkReader::new(stream);
        let mut machine = Machine::new(connection_id, self.detect_preface);

        loop {
            let base = reader.consumed_position();
            let step = {
                let chunk = reader.read_chunk(deadline, closed).await?;
                if chunk.is_cancelled {
                    debug!(
                        conn = connection_id,
                        "read cancelled, stopping preamble processing without handoff"
                    );
                    return Ok(Preamble::Cancelled);
                }
                machine.step(chunk.bytes, chunk.is_completed)?
            };
            reader.advance_to(base + step.consumed as u64, base + step.examined as u64)?;
            if step.done {
                break;
            }
        }

        let header = machine
            .header
            .take()
            .ok_or(PreambleError::Invariant("preamble finished without a header"))?;
        if self.detect_preface && machine.app_protocol == AppProtocol::Unset {
            return Err(PreambleError::Invariant(
                "preface detection finished without a protocol",
            ));
        }

        let metadata = ConnectionMetadata::new(
            connection_id,
            header,
            machine.app_protocol,
            original_local,
            original_remote,
            self.tls_offload_enabled,
        );
        debug!(conn = connection_id, "publishing PROXY protocol metadata");
        if metadata.endpoints_overridden() {
            debug!(
                conn = connection_id,
                remote = ?metadata.remote_addr(),
                local = ?metadata.local_addr(),
                "overriding connection endpoints from PROXY header"
            );
        }
        if metadata.is_secure() {
            match metadata.negotiated_protocol() {
                Some(protocol) => debug!(
                    conn = connection_id,
                    alpn = %String::from_utf8_lossy(protocol),
                    "publishing secure connection capability with negotiated protocol"
                ),
                None => debug!(
                    conn = connection_id,
                    "publishing secure connection capability"
                ),
            }
        }

        let (stream, leftover) = reader.into_parts();
        Ok(Preamble::Ready(ProxiedConnection {
            metadata,
            stream: RewoundStream::new(leftover, stream),
        }))
    }
}

/// Processing phase of one connection's preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHeader,
    AwaitPreface,
    Done,
}

/// Cursor instructions produced by one machine step.
#[derive(Debug, PartialEq, Eq)]
struct Step {
    done: bool,
    /// Bytes of the offered buffer to retire.
    consumed: usize,
    /// Bytes of the offered buffer that have been looked at; never less
    /// than `consumed`.
    examined: usize,
}

/// Per-connection preamble state machine, independent of any stream.
///
/// Each step is offered the full unconsumed buffer and reports exactly how
/// far the cursor may advance, which keeps the watermark discipline
/// testable without network I/O.
#[derive(Debug)]
struct Machine {
    connection_id: u64,
    detect_preface: bool,
    phase: Phase,
    decoder: HeaderDecoder,
    header: Option<ProxyHeader>,
    app_protocol: AppProtocol,
}

impl Machine {
    fn new(connection_id: u64, detect_preface: bool) -> Self {
        Self {
            connection_id,
            detect_preface,
            phase: Phase::AwaitHeader,
            decoder: HeaderDecoder::new(),
            header: None,
            app_protocol: AppProtocol::Unset,
        }
    }

    fn step(&mut self, bytes: &[u8], is_completed: bool) -> Result<Step, PreambleError> {
        let mut consumed = 0usize;

        if self.phase == Phase::AwaitHeader {
            trace!(conn = self.connection_id, buffered = bytes.len(), "parsing PROXY protocol header");
            match self.decoder.try_decode(bytes) {
                Ok(HeaderDecode::Complete { header, consumed: header_len }) => {
                    debug!(
                        conn = self.connection_id,
                        command = ?header.command,
                        version = ?header.version,
                        source = ?header.source,
                        destination = ?header.destination,
                        "PROXY protocol header parsed"
                    );
                    self.header = Some(header);
                    consumed = header_len;
                    self.phase = if self.detect_preface {
                        Phase::AwaitPreface
                    } else {
                        Phase::Done
                    };
                }
                Ok(HeaderDecode::NeedMore { examined }) => {
                    if is_completed {
                        return Err(PreambleError::PrematureClose);
                    }
                    trace!(conn = self.connection_id, "requesting more data for PROXY protocol header");
                    return Ok(Step { done: false, consumed: 0, examined });
                }
                Err(error) => return Err(PreambleError::MalformedHeader(error)),
            }
        }

        if self.phase == Phase::AwaitPreface {
            trace!(conn = self.connection_id, "detecting h2 client preface");
            let rest = &bytes[consumed..];
            if rest.len() >= H2_PREFACE_LEN {
                let protocol = sniff_preface(rest);
                debug!(conn = self.connection_id, protocol = %protocol, "application protocol detected");
                self.app_protocol = protocol;
                self.phase = Phase::Done;
                // The preface stays unconsumed so the downstream protocol
                // handler reads it itself.
                return Ok(Step {
                    done: true,
                    consumed,
                    examined: consumed + H2_PREFACE_LEN,
                });
            } else if is_completed {
                debug!(
                    conn = self.connection_id,
                    available = rest.len(),
                    "stream finished before full preface, assuming http/1.1"
                );
                self.app_protocol = AppProtocol::Http11;
                self.phase = Phase::Done;
                return Ok(Step { done: true, consumed, examined: bytes.len() });
            } else {
                trace!(conn = self.connection_id, "requesting more data for h2 preface");
                return Ok(Step { done: false, consumed, examined: bytes.len() });
            }
        }

        Ok(Step { done: true, consumed, examined: consumed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsOffloadConfig;
    use crate::header::{ProxyCommand, ProxyVersion};
    use crate::sniff::H2_PREFACE;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const V1_HEADER: &[u8] = b"PROXY TCP4 192.0.2.1 198.51.100.1 56324 443\r\n";

    fn processor(timeout_ms: Option<u64>, offload: bool, detect: bool) -> PreambleProcessor {
        PreambleProcessor::new(&ProxyProtocolConfig {
            connect_timeout_ms: timeout_ms,
            tls_offload: TlsOffloadConfig {
                enabled: offload,
                detect_application_protocol_by_preface: detect,
            },
            logger_name: None,
        })
    }

    fn originals() -> (Option<SocketAddr>, Option<SocketAddr>) {
        (
            Some("10.0.0.1:443".parse().unwrap()),
            Some("10.0.0.2:9999".parse().unwrap()),
        )
    }

    async fn ready<S: AsyncRead + Unpin>(
        processor: &PreambleProcessor,
        stream: S,
    ) -> ProxiedConnection<S> {
        let (local, remote) = originals();
        let closed = CancellationToken::new();
        match processor.process(1, stream, local, remote, &closed).await.unwrap() {
            Preamble::Ready(conn) => conn,
            Preamble::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn v1_header_with_h2_preface() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(V1_HEADER).await.unwrap();
        tx.write_all(H2_PREFACE).await.unwrap();
        tx.write_all(b"frames").await.unwrap();
        drop(tx);

        let mut conn = ready(&processor(None, true, true), rx).await;
        let meta = conn.metadata();
        assert_eq!(meta.application_protocol(), AppProtocol::H2);
        assert_eq!(meta.header().command, ProxyCommand::Proxy);
        assert_eq!(meta.remote_addr(), Some("192.0.2.1:56324".parse().unwrap()));
        assert_eq!(meta.local_addr(), Some("198.51.100.1:443".parse().unwrap()));
        assert!(meta.is_secure());
        assert_eq!(meta.negotiated_protocol(), Some(&b"h2"[..]));

        // The preface is replayed to downstream in full.
        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        let mut expected = H2_PREFACE.to_vec();
        expected.extend_from_slice(b"frames");
        assert_eq!(rest, expected);
    }

    #[tokio::test]
    async fn non_h2_bytes_fall_back_to_http11() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(V1_HEADER).await.unwrap();
        tx.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        drop(tx);

        let mut conn = ready(&processor(None, true, true), rx).await;
        assert_eq!(conn.metadata().application_protocol(), AppProtocol::Http11);
        assert_eq!(conn.metadata().negotiated_protocol(), Some(&b"http/1.1"[..]));

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    }

    #[tokio::test]
    async fn short_stream_falls_back_to_http11() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(V1_HEADER).await.unwrap();
        tx.write_all(b"PRI * HT").await.unwrap();
        drop(tx);

        let mut conn = ready(&processor(None, true, true), rx).await;
        assert_eq!(conn.metadata().application_protocol(), AppProtocol::Http11);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"PRI * HT");
    }

    #[tokio::test]
    async fn unknown_header_keeps_endpoints() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(b"PROXY UNKNOWN\r\n").await.unwrap();
        drop(tx);

        let conn = ready(&processor(None, false, false), rx).await;
        let meta = conn.metadata();
        let (local, remote) = originals();
        assert_eq!(meta.header().command, ProxyCommand::Local);
        assert!(!meta.endpoints_overridden());
        assert_eq!(meta.local_addr(), local);
        assert_eq!(meta.remote_addr(), remote);
        assert_eq!(meta.original_local_addr(), local);
        assert_eq!(meta.original_remote_addr(), remote);
    }

    #[tokio::test]
    async fn detection_disabled_consumes_nothing_past_header() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(V1_HEADER).await.unwrap();
        tx.write_all(H2_PREFACE).await.unwrap();
        drop(tx);

        // Offload on but detection off: tag resolves to Unset immediately.
        let mut conn = ready(&processor(None, true, false), rx).await;
        assert_eq!(conn.metadata().application_protocol(), AppProtocol::Unset);
        assert_eq!(conn.metadata().negotiated_protocol(), None);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, H2_PREFACE.to_vec());
    }

    #[tokio::test]
    async fn split_after_field_separator_still_parses() {
        // Chunk boundary right after the source port's trailing space, a
        // spot where a partial v1 line must not be taken for malformed.
        let mut builder = tokio_test::io::Builder::new();
        builder.read(&V1_HEADER[..40]);
        builder.read(&V1_HEADER[40..]);
        let mock = builder.build();

        let conn = ready(&processor(None, false, false), mock).await;
        let meta = conn.metadata();
        assert_eq!(meta.header().command, ProxyCommand::Proxy);
        assert_eq!(meta.remote_addr(), Some("192.0.2.1:56324".parse().unwrap()));
        assert_eq!(meta.local_addr(), Some("198.51.100.1:443".parse().unwrap()));
    }

    #[tokio::test]
    async fn byte_by_byte_delivery_matches_single_shot() {
        let mut data = V1_HEADER.to_vec();
        data.extend_from_slice(H2_PREFACE);
        data.extend_from_slice(b"tail");

        let mut builder = tokio_test::io::Builder::new();
        for byte in &data {
            builder.read(std::slice::from_ref(byte));
        }
        let mock = builder.build();

        let mut conn = ready(&processor(None, true, true), mock).await;
        let meta = conn.metadata();
        assert_eq!(meta.application_protocol(), AppProtocol::H2);
        assert_eq!(meta.header().version, ProxyVersion::V1);
        assert_eq!(meta.remote_addr(), Some("192.0.2.1:56324".parse().unwrap()));

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        let mut expected = H2_PREFACE.to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(rest, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (_tx, rx) = tokio::io::duplex(512);
        let (local, remote) = originals();
        let closed = CancellationToken::new();

        let err = processor(Some(50), false, false)
            .process(1, rx, local, remote, &closed)
            .await
            .unwrap_err();
        assert!(matches!(err, PreambleError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_preface_phase() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(V1_HEADER).await.unwrap();
        // Header arrives, preface never does.
        let (local, remote) = originals();
        let closed = CancellationToken::new();

        let err = processor(Some(50), true, true)
            .process(1, rx, local, remote, &closed)
            .await
            .unwrap_err();
        assert!(matches!(err, PreambleError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn garbage_then_close_is_fatal() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(b"abc").await.unwrap();
        drop(tx);

        let (local, remote) = originals();
        let closed = CancellationToken::new();
        let err = processor(None, false, false)
            .process(1, rx, local, remote, &closed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PreambleError::MalformedHeader(_) | PreambleError::PrematureClose
        ));
    }

    #[tokio::test]
    async fn close_mid_header_is_premature() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(b"PROXY TCP4 192.0.2.1 ").await.unwrap();
        drop(tx);

        let (local, remote) = originals();
        let closed = CancellationToken::new();
        let err = processor(None, false, false)
            .process(1, rx, local, remote, &closed)
            .await
            .unwrap_err();
        assert!(matches!(err, PreambleError::PrematureClose));
    }

    #[tokio::test]
    async fn cancellation_stops_without_error() {
        let (_tx, rx) = tokio::io::duplex(512);
        let (local, remote) = originals();
        let closed = CancellationToken::new();
        closed.cancel();

        let outcome = processor(None, false, false)
            .process(1, rx, local, remote, &closed)
            .await
            .unwrap();
        assert!(matches!(outcome, Preamble::Cancelled));
    }

    #[test]
    fn machine_reports_exact_watermarks() {
        let mut machine = Machine::new(1, true);

        // Partial header: nothing consumed, everything examined.
        let step = machine.step(&V1_HEADER[..10], false).unwrap();
        assert_eq!(step, Step { done: false, consumed: 0, examined: 10 });

        // Full header, no preface bytes yet: header consumed exactly.
        let step = machine.step(V1_HEADER, false).unwrap();
        assert_eq!(
            step,
            Step { done: false, consumed: V1_HEADER.len(), examined: V1_HEADER.len() }
        );

        // Preface arrives: examined but never consumed.
        let step = machine.step(H2_PREFACE, false).unwrap();
        assert_eq!(step, Step { done: true, consumed: 0, examined: H2_PREFACE_LEN });
        assert_eq!(machine.app_protocol, AppProtocol::H2);
    }

    #[test]
    fn machine_without_detection_stops_at_header() {
        let mut machine = Machine::new(1, false);
        let mut buf = V1_HEADER.to_vec();
        buf.extend_from_slice(H2_PREFACE);

        let step = machine.step(&buf, false).unwrap();
        assert_eq!(
            step,
            Step { done: true, consumed: V1_HEADER.len(), examined: V1_HEADER.len() }
        );
        assert_eq!(machine.app_protocol, AppProtocol::Unset);
    }

    #[test]
    fn machine_single_buffer_header_and_preface() {
        let mut machine = Machine::new(1, true);
        let mut buf = V1_HEADER.to_vec();
        buf.extend_from_slice(H2_PREFACE);
        buf.extend_from_slice(b"tail");

        let step = machine.step(&buf, false).unwrap();
        assert_eq!(
            step,
            Step {
                done: true,
                consumed: V1_HEADER.len(),
                examined: V1_HEADER.len() + H2_PREFACE_LEN,
            }
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // The final classification must not depend on how the stream was
        // chunked by the network.
        #[test]
        fn classification_is_chunking_invariant(sizes in prop::collection::vec(1usize..8, 1..24)) {
            let mut data = V1_HEADER.to_vec();
            data.extend_from_slice(H2_PREFACE);
            data.extend_from_slice(b"tail");

            let mut builder = tokio_test::io::Builder::new();
            let mut offset = 0;
            let mut index = 0;
            while offset < data.len() {
                let len = sizes[index % sizes.len()].min(data.len() - offset);
                builder.read(&data[offset..offset + len]);
                offset += len;
                index += 1;
            }
            let mock = builder.build();

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let mut conn = ready(&processor(None, true, true), mock).await;
                let meta = conn.metadata();
                assert_eq!(meta.application_protocol(), AppProtocol::H2);
                assert_eq!(meta.header().command, ProxyCommand::Proxy);
                assert_eq!(
                    meta.remote_addr(),
                    Some("192.0.2.1:56324".parse::<SocketAddr>().unwrap())
                );

                // Drain the replayed preamble and the rest of the scripted
                // stream; everything after the header must come back intact.
                let mut rest = Vec::new();
                conn.read_to_end(&mut rest).await.unwrap();
                let mut expected = H2_PREFACE.to_vec();
                expected.extend_from_slice(b"tail");
                assert_eq!(rest, expected);
            });
        }
    }
}

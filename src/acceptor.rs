//! Connection Acceptor
//!
//! Ties the preamble processor to a listener's accept loop: assigns
//! connection ids, scopes a tracing span around each connection, runs the
//! preamble, and hands successful connections to the downstream handler
//! exactly once. Failed or cancelled preambles never reach the handler.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, trace, warn, Instrument};

use crate::config::ProxyProtocolConfig;
use crate::processor::{Preamble, PreambleError, PreambleProcessor, ProxiedConnection};

/// Downstream stage that receives connections after their preamble.
#[async_trait]
pub trait ConnectionHandler<S>: Send + Sync {
    async fn handle(&self, connection: ProxiedConnection<S>) -> io::Result<()>;
}

/// Per-listener front end for PROXY protocol connections.
pub struct ProxyProtocolAcceptor {
    processor: PreambleProcessor,
    logger_name: Option<String>,
    next_connection_id: AtomicU64,
}

impl ProxyProtocolAcceptor {
    pub fn new(config: &ProxyProtocolConfig) -> Self {
        Self {
            processor: PreambleProcessor::new(config),
            logger_name: config.logger_name.clone(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Run the preamble for one accepted connection and hand it downstream.
    ///
    /// The handler is invoked at most once, and only after the preamble
    /// completed. Cancellation is a clean stop, not an error.
    pub async fn handle_connection<S, H>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        closed: CancellationToken,
        next: &H,
    ) -> Result<(), PreambleError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
        H: ConnectionHandler<S>,
    {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let span = match &self.logger_name {
            Some(name) => debug_span!("preamble", logger = %name, conn = connection_id),
            None => debug_span!("preamble", conn = connection_id),
        };

        async {
            let outcome = self
                .processor
                .process(connection_id, stream, local_addr, remote_addr, &closed)
                .await;
            match outcome {
                Ok(Preamble::Ready(connection)) => {
                    trace!(conn = connection_id, "handing connection to downstream handler");
                    if let Err(e) = next.handle(connection).await {
                        warn!(conn = connection_id, error = %e, "downstream handler failed");
                        return Err(PreambleError::Io(e));
                    }
                    Ok(())
                }
                Ok(Preamble::Cancelled) => {
                    debug!(conn = connection_id, "connection stopped by shutdown signal");
                    Ok(())
                }
                Err(e) => {
                    match &e {
                        PreambleError::DeadlineExceeded => warn!(
                            conn = connection_id,
                            "connect timeout elapsed during preamble, aborting connection"
                        ),
                        PreambleError::MalformedHeader(cause) => warn!(
                            conn = connection_id,
                            error = %cause,
                            "malformed PROXY protocol header, aborting connection"
                        ),
                        PreambleError::PrematureClose => warn!(
                            conn = connection_id,
                            "connection closed before PROXY protocol header completed"
                        ),
                        PreambleError::Io(cause) => warn!(
                            conn = connection_id,
                            error = %cause,
                            "read failed during preamble, aborting connection"
                        ),
                        PreambleError::Invariant(msg) => error!(
                            conn = connection_id,
                            "preamble invariant violated: {}", msg
                        ),
                    }
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsOffloadConfig;
    use crate::sniff::H2_PREFACE;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct CountingHandler {
        calls: AtomicUsize,
        last_payload: std::sync::Mutex<Vec<u8>>,
    }

    impl CountingHandler {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_payload: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ConnectionHandler<DuplexStream> for CountingHandler {
        async fn handle(&self, mut connection: ProxiedConnection<DuplexStream>) -> io::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut rest = Vec::new();
            connection.read_to_end(&mut rest).await?;
            *self.last_payload.lock().unwrap() = rest;
            Ok(())
        }
    }

    fn acceptor(detect: bool) -> ProxyProtocolAcceptor {
        ProxyProtocolAcceptor::new(&ProxyProtocolConfig {
            connect_timeout_ms: None,
            tls_offload: TlsOffloadConfig {
                enabled: detect,
                detect_application_protocol_by_preface: detect,
            },
            logger_name: Some("test-listener".to_string()),
        })
    }

    #[tokio::test]
    async fn hands_off_exactly_once() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(b"PROXY TCP4 192.0.2.1 198.51.100.1 56324 443\r\n")
            .await
            .unwrap();
        tx.write_all(H2_PREFACE).await.unwrap();
        drop(tx);

        let handler = CountingHandler::new();
        acceptor(true)
            .handle_connection(rx, None, None, CancellationToken::new(), &handler)
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        // Downstream saw everything after the header, preface included.
        assert_eq!(*handler.last_payload.lock().unwrap(), H2_PREFACE.to_vec());
    }

    #[tokio::test]
    async fn failed_preamble_never_reaches_handler() {
        let (mut tx, rx) = tokio::io::duplex(512);
        tx.write_all(b"NOT A PROXY HEADER\r\n").await.unwrap();
        drop(tx);

        let handler = CountingHandler::new();
        let result = acceptor(false)
            .handle_connection(rx, None, None, CancellationToken::new(), &handler)
            .await;
        assert!(result.is_err());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_preamble_is_a_clean_stop() {
        let (_tx, rx) = tokio::io::duplex(512);
        let closed = CancellationToken::new();
        closed.cancel();

        let handler = CountingHandler::new();
        acceptor(false)
            .handle_connection(rx, None, None, closed, &handler)
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connection_ids_are_distinct() {
        let acceptor = acceptor(false);
        let handler = CountingHandler::new();

        for _ in 0..2 {
            let (mut tx, rx) = tokio::io::duplex(512);
            tx.write_all(b"PROXY UNKNOWN\r\n").await.unwrap();
            drop(tx);
            acceptor
                .handle_connection(rx, None, None, CancellationToken::new(), &handler)
                .await
                .unwrap();
        }
        assert_eq!(acceptor.next_connection_id.load(Ordering::SeqCst), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }
}

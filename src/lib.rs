//! PROXY Protocol Preamble Processing
//!
//! Front end for TCP listeners that sit behind an L4 proxy speaking the
//! HAProxy PROXY protocol. Each accepted connection starts with a preamble:
//! a mandatory v1 or v2 PROXY header, optionally followed by an HTTP/2
//! client preface when the proxy terminates TLS. This crate parses the
//! header incrementally, classifies the application protocol by sniffing
//! the preface without consuming it, and hands the connection downstream
//! with the post-header bytes intact and the forwarded endpoints published
//! as [`ConnectionMetadata`].
//!
//! ```no_run
//! use std::io;
//! use async_trait::async_trait;
//! use proxy_preamble::{
//!     ConnectionHandler, ProxiedConnection, ProxyProtocolAcceptor, ProxyProtocolConfig,
//! };
//! use tokio::net::{TcpListener, TcpStream};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! #[async_trait]
//! impl ConnectionHandler<TcpStream> for Echo {
//!     async fn handle(&self, mut connection: ProxiedConnection<TcpStream>) -> io::Result<()> {
//!         println!("client: {:?}", connection.metadata().remote_addr());
//!         let (mut read, mut write) = tokio::io::split(connection);
//!         tokio::io::copy(&mut read, &mut write).await?;
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> io::Result<()> {
//!     let acceptor = ProxyProtocolAcceptor::new(&ProxyProtocolConfig::default());
//!     let listener = TcpListener::bind("0.0.0.0:1883").await?;
//!     let shutdown = CancellationToken::new();
//!     loop {
//!         let (stream, remote) = listener.accept().await?;
//!         let local = stream.local_addr().ok();
//!         let _ = acceptor
//!             .handle_connection(stream, local, Some(remote), shutdown.child_token(), &Echo)
//!             .await;
//!     }
//! }
//! ```

pub mod acceptor;
pub mod chunk;
pub mod config;
pub mod header;
pub mod metadata;
pub mod processor;
pub mod sniff;

pub use acceptor::{ConnectionHandler, ProxyProtocolAcceptor};
pub use chunk::{Chunk, ChunkReader, CursorError, RewoundStream};
pub use config::{ProxyProtocolConfig, TlsOffloadConfig};
pub use header::{HeaderDecodeError, ProxyCommand, ProxyHeader, ProxyVersion};
pub use metadata::ConnectionMetadata;
pub use processor::{Preamble, PreambleError, PreambleProcessor, ProxiedConnection};
pub use sniff::AppProtocol;

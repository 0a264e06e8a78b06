#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # vproxy
//!
//! A man-in-the-middle forward proxy. Clients point their HTTP proxy setting
//! at it; `CONNECT` tunnels are terminated locally with certificates issued
//! on the fly by a root CA the client has been made to trust, and every
//! decrypted or plain HTTP request flows through an onion-model handler
//! pipeline before being relayed to the real origin.
//!
//! - Root CA bootstrap and persistence behind a pluggable [`CertStore`]
//! - Per-domain leaf issuance, selected by SNI during the TLS handshake
//! - Ordered, short-circuitable [`Handler`] pipeline
//! - Bounded keep-alive pools toward origins
//! - Optional chaining through another HTTP proxy, re-resolved per request
//!
//! ## Running a proxy
//!
//! ```no_run
//! use vproxy::{MitmConfig, MitmProxy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let mut config = MitmConfig::default();
//!   config.install_root = true;
//!   let proxy = MitmProxy::new(config).await?;
//!   proxy.run().await?;
//!   Ok(())
//! }
//! ```
//!
//! ## Handlers
//!
//! Handlers run in registration order and wrap each other: code before
//! `ctx.next().await` sees the request on its way in, code after it runs
//! once everything inside has finished.
//!
//! ```no_run
//! use vproxy::{Handler, MitmConfig, MitmProxy, RequestContext, Result, StatusCode};
//!
//! struct BlockAds;
//!
//! #[async_trait::async_trait]
//! impl Handler for BlockAds {
//!   async fn handle(&self, ctx: &mut RequestContext<'_>) -> Result<()> {
//!     if ctx.request().host().is_some_and(|h| h.starts_with("ads.")) {
//!       ctx.abort_with_status(StatusCode::FORBIDDEN);
//!       return Ok(());
//!     }
//!     ctx.next().await
//!   }
//! }
//!
//! # async fn run() -> Result<()> {
//! let mut proxy = MitmProxy::new(MitmConfig::default()).await?;
//! proxy.add_handler(BlockAds);
//! proxy.run().await
//! # }
//! ```
//!
//! ## Optional Features
//!
//! - **gzip**: decode gzip and deflate response bodies when
//!   [`MitmConfig::decode_content`] is set.
//!
mod ca;
mod config;
mod connector;
mod context;
mod error;
mod forward;
/// HTTP/1.1 heads and bodies
pub mod http;
mod pipeline;
mod pool;
mod proxy;
mod server;
mod socket;
mod store;
mod tls;
mod tunnel;

pub use ::http::{HeaderValue, Method, StatusCode, Version};
pub use ca::{
  install_instructions, CertificateAuthority, CertificateProfile, CertificateRole, ROOT_NAME,
};
pub use config::{MitmConfig, ProxyResolver};
pub use connector::{Connector, ConnectorBuilder};
pub use context::{HandlerFuture, HeadHook, Protocol, RequestContext, ResponseSink};
pub use error::{Error, Result};
pub use forward::{ForwarderConfig, ForwarderStats, UpstreamForwarder, UpstreamTarget};
pub use pipeline::{Dispatcher, Handler, Pipeline};
pub use pool::{Checkout, ConnectionPool, PoolKey, PooledConnection};
pub use proxy::{encode_basic_auth, establish_tunnel, ConnectHandshake, HandshakeState, UpstreamProxy};
pub use server::{BoundProxy, MitmProxy, ProxyHandle};
pub use socket::{MaybeTlsStream, Socket};
pub use store::{CaEntry, CertStore, FsCertStore, MemoryCertStore};
pub use tls::{upstream_client_config, TlsFront};
pub use tunnel::{SniHints, TunnelAcceptor, TunnelPair, TunnelStats};
pub use tokio_rustls::rustls;

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

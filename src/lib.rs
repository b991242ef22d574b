//! # mmtls-client
//!
//! Client-side secure transport for the mmtls mobile messaging wire protocol.
//!
//! The crate negotiates sessions with a dual-ECDH handshake, frames and
//! encrypts every business request, persists per-account session state across
//! restarts, and optionally keeps a long-link open for server pushes.
//!
//! ## Layout
//! - [`core`]: packet header, packet codec, long-link record framing
//! - [`protocol`]: key exchange, handshake, status classification, push dispatch
//! - [`session`]: the `Session` and `AccountRecord` model
//! - [`store`]: tiered account record persistence
//! - [`service`]: HTTP transport and the request dispatcher
//! - [`transport`]: long-link connections
//! - [`utils`]: crypto, compression, logging, metrics, timeouts
//!
//! ## Example
//! ```no_run
//! use mmtls_client::config::ClientConfig;
//! use mmtls_client::service::http::ReqwestTransport;
//! use mmtls_client::service::request::{RequestDispatcher, Route, SendOptions};
//! use mmtls_client::session::AccountRecord;
//! use mmtls_client::store::SessionStore;
//! use std::sync::Arc;
//!
//! # async fn run() -> mmtls_client::error::Result<()> {
//! let config = Arc::new(ClientConfig::from_env()?);
//! let store = SessionStore::from_config(&config.store)?;
//! let transport = Arc::new(ReqwestTransport::new(&config)?);
//! let dispatcher = RequestDispatcher::new(config, store, transport)?;
//!
//! dispatcher.register_account(&AccountRecord::new("wxid_example", vec![0u8; 16]))?;
//! let route = Route::new(138, "/cgi-bin/micromsg-bin/newsync");
//! let reply = dispatcher
//!     .send("wxid_example", b"payload", &SendOptions::new(route))
//!     .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;
pub mod utils;

pub use config::ClientConfig;
pub use error::{ProtocolError, Result};
pub use service::request::{RequestDispatcher, Route, RouteResponse, SendOptions, TransportKind};
pub use session::{AccountRecord, ProxyConfig, Session};
pub use store::{SessionStore, TtlPolicy};
pub use transport::manager::{ConnectionManager, ConnectionState, LinkEvent};

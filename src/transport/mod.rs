//! # Long-Link Transport
//!
//! Persistent TCP connections used for server-pushed events and for requests
//! routed over the long-link instead of HTTP.
//!
//! ## Components
//! - **Long link**: record protection and the hello exchange
//! - **Manager**: connection lifecycle, reader tasks and the push event loop
//! - **Proxy**: direct or SOCKS5 dialing

pub mod long_link;
pub mod manager;
pub mod proxy;

//! # Request Services
//!
//! The short-link HTTP transport and the request dispatcher that feature
//! builders call into.

pub mod http;
pub mod request;

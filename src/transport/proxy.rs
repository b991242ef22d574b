//! TCP dialing for the long-link, direct or through a SOCKS5 proxy.

use crate::error::{ProtocolError, Result};
use crate::session::ProxyConfig;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

/// Open a TCP stream to `addr` (`host:port`), tunnelled through `proxy` when set
pub async fn dial(addr: &str, proxy: Option<&ProxyConfig>) -> Result<TcpStream> {
    let Some(proxy) = proxy else {
        let stream = TcpStream::connect(addr).await?;
        debug!(addr, "Dialed long-link directly");
        return Ok(stream);
    };

    let tunnel = match &proxy.auth {
        Some((username, password)) => {
            Socks5Stream::connect_with_password(proxy.address.as_str(), addr, username, password).await
        }
        None => Socks5Stream::connect(proxy.address.as_str(), addr).await,
    }
    .map_err(|e| ProtocolError::TransportError(format!("socks5 via {}: {e}", proxy.address)))?;

    debug!(addr, proxy = %proxy.address, "Dialed long-link through SOCKS5");
    Ok(tunnel.into_inner())
}

//! Timeout helpers shared by the short-link and long-link paths.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for one network round trip
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for a complete handshake attempt
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for a TCP connect plus link hello
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between long-link heartbeats
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Run a fallible future with a deadline, mapping expiry to `ProtocolError::Timeout`.
///
/// The inner future is dropped on expiry, which aborts any socket operation it owns.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let value = with_timeout_error(async { Ok(7u8) }, Duration::from_secs(1)).await;
        assert!(matches!(value, Ok(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn expires_into_timeout_error() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }
}

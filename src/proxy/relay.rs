//! Full-duplex byte relay between two established stream pairs
//!
//! Used once a CONNECT tunnel is up: bytes flow both ways until either
//! side closes. Either direction ending (EOF, reset, timeout) is a normal
//! end of the conversation, never an error to propagate.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy bytes in both directions until the streams wind down.
///
/// Exactly one task is spawned for the reverse direction and joined before
/// returning; leaking it would keep half-open sockets alive past the end
/// of the request.
pub async fn relay<AR, AW, BR, BW>(a: (AR, AW), b: (BR, BW)) -> (u64, u64)
where
    AR: AsyncRead + Unpin + Send + 'static,
    AW: AsyncWrite + Unpin + Send + 'static,
    BR: AsyncRead + Unpin + Send + 'static,
    BW: AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = a;
    let (mut b_read, mut b_write) = b;

    let reverse = tokio::spawn(async move {
        let copied = match tokio::io::copy(&mut b_read, &mut a_write).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Reverse relay direction ended: {}", e);
                0
            }
        };
        let _ = a_write.shutdown().await;
        copied
    });

    let forward = match tokio::io::copy(&mut a_read, &mut b_write).await {
        Ok(n) => n,
        Err(e) => {
            debug!("Forward relay direction ended: {}", e);
            0
        }
    };
    let _ = b_write.shutdown().await;

    let backward = reverse.await.unwrap_or_else(|e| {
        debug!("Reverse relay task failed to join: {}", e);
        0
    });

    debug!(
        bytes_forward = forward,
        bytes_backward = backward,
        "Relay finished"
    );
    (forward, backward)
}

/// Convenience for relaying a pair against a single duplex stream.
pub async fn relay_stream<AR, AW, S>(a: (AR, AW), b: S) -> (u64, u64)
where
    AR: AsyncRead + Unpin + Send + 'static,
    AW: AsyncWrite + Unpin + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    relay(a, tokio::io::split(b)).await
}

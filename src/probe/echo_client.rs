//! One-shot TCP echo probe

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Payload sent to every peer; echo servers return it verbatim
pub const PROBE_MESSAGE: &[u8] = b"Hello vantage6!\n";

/// Why a single echo round-trip failed
#[derive(Debug, Error)]
pub enum EchoError {
    #[error("connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: String, timeout_ms: u64 },

    #[error("connection to {endpoint} refused")]
    Refused { endpoint: String },

    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to send probe: {0}")]
    Write(#[source] io::Error),

    #[error("no echo within {timeout_ms}ms")]
    ReadTimeout { timeout_ms: u64 },

    #[error("failed to read echo: {0}")]
    Read(#[source] io::Error),

    #[error("echo mismatch: sent {expected} bytes, received {received_len} bytes ({received:?})")]
    Mismatch {
        expected: usize,
        received_len: usize,
        received: String,
    },
}

impl EchoError {
    /// Whether the peer was never reached at the transport level
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            EchoError::ConnectTimeout { .. } | EchoError::Refused { .. } | EchoError::Connect { .. }
        )
    }
}

/// Send `message` to `endpoint` and wait for it to come back
///
/// `timeout` bounds the connect and, separately, the send-and-receive
/// phase. Reads stop once `message.len()` bytes have arrived or the peer
/// closes. Returns the round-trip time on an exact echo.
pub async fn probe_echo(endpoint: &str, message: &[u8], timeout: Duration) -> Result<Duration, EchoError> {
    let timeout_ms = timeout.as_millis() as u64;
    let started = Instant::now();

    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
        Err(_) => {
            return Err(EchoError::ConnectTimeout {
                endpoint: endpoint.to_string(),
                timeout_ms,
            })
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Err(EchoError::Refused {
                endpoint: endpoint.to_string(),
            })
        }
        Ok(Err(e)) => {
            return Err(EchoError::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            })
        }
        Ok(Ok(stream)) => stream,
    };

    let exchange = async {
        stream.write_all(message).await.map_err(EchoError::Write)?;
        stream.flush().await.map_err(EchoError::Write)?;
        read_echo(&mut stream, message.len()).await.map_err(EchoError::Read)
    };

    let received = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| EchoError::ReadTimeout { timeout_ms })??;

    if received != message {
        return Err(EchoError::Mismatch {
            expected: message.len(),
            received_len: received.len(),
            received: String::from_utf8_lossy(&received).into_owned(),
        });
    }

    Ok(started.elapsed())
}

/// Read up to `len` bytes, stopping early at EOF
async fn read_echo<R: AsyncRead + Unpin>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;

    while filled < len {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    buf.truncate(filled);
    Ok(buf)
}

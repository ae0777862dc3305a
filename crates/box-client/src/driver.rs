//! Async UDP driver around the exchange state machine.
//!
//! One attempt per endpoint, each under its own timeout. A terminal
//! protocol outcome (remote error, version mismatch) stops the iteration;
//! anything else moves on to the next candidate.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use uuid::Uuid;

use box_core::options::ClientAction;

use crate::exchange::{ClientError, Exchange, Outcome, Step};

/// Default per-attempt budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Try the endpoints in order until one attempt completes.
pub async fn run_action(
    action: ClientAction,
    endpoints: &[SocketAddr],
    node_id: Uuid,
    user_id: Uuid,
    timeout: Duration,
) -> Result<Outcome, ClientError> {
    let mut last_error = ClientError::NoEndpoints;
    for &endpoint in endpoints {
        tracing::debug!(%endpoint, "attempting");
        match tokio::time::timeout(
            timeout,
            attempt(action.clone(), endpoint, node_id, user_id),
        )
        .await
        {
            Ok(Ok(outcome)) => return Ok(outcome),
            Ok(Err(e)) if e.is_terminal() => return Err(e),
            Ok(Err(e)) => {
                tracing::warn!(%endpoint, error = %e, "attempt failed");
                last_error = e;
            }
            Err(_) => {
                tracing::warn!(%endpoint, budget = ?timeout, "attempt timed out");
                last_error = ClientError::Timeout(timeout);
            }
        }
    }
    Err(last_error)
}

async fn attempt(
    action: ClientAction,
    endpoint: SocketAddr,
    node_id: Uuid,
    user_id: Uuid,
) -> Result<Outcome, ClientError> {
    let bind: SocketAddr = if endpoint.is_ipv6() {
        "[::]:0".parse().map_err(invalid_bind)?
    } else {
        "0.0.0.0:0".parse().map_err(invalid_bind)?
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(endpoint).await?;

    let (mut exchange, first) = Exchange::start(action, node_id, user_id)?;
    socket.send(&first).await?;

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let len = socket.recv(&mut buf).await?;
        match exchange.on_datagram(&buf[..len])? {
            Step::Send(datagram) => {
                socket.send(&datagram).await?;
            }
            Step::Continue => {}
            Step::Done(outcome) => return Ok(outcome),
        }
    }
}

fn invalid_bind(e: std::net::AddrParseError) -> ClientError {
    ClientError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

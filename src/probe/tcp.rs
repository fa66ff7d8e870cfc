//! TCP port probe implementation.
//!
//! A successful connect means the service is up; a refused connection means
//! the host answered but the port is closed, which is reported distinctly
//! from an unreachable host.

use std::io::ErrorKind as IoErrorKind;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::ProbeError;

/// Run a TCP connect probe against `address:port`.
///
/// Returns connect latency in milliseconds.
pub async fn run_tcp_probe(address: &str, port: u16, timeout: Duration) -> Result<f64, ProbeError> {
    let addr = format!("{}:{}", address, port);
    let start = Instant::now();

    let connect = TcpStream::connect(&addr);
    let stream = match tokio::time::timeout(timeout, connect).await {
        Err(_) => return Err(ProbeError::Timeout(timeout)),
        Ok(Err(e)) => return Err(classify_io_error(&addr, e)),
        Ok(Ok(stream)) => stream,
    };

    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    drop(stream);

    Ok(elapsed)
}

fn classify_io_error(addr: &str, e: std::io::Error) -> ProbeError {
    match e.kind() {
        IoErrorKind::ConnectionRefused => {
            ProbeError::Refused(format!("{}: {}", addr, e))
        }
        IoErrorKind::TimedOut => ProbeError::Timeout(Duration::ZERO),
        // connect() resolves hostnames internally; surface that separately
        _ if e.to_string().contains("failed to lookup") => {
            ProbeError::Dns(format!("{}: {}", addr, e))
        }
        _ => ProbeError::Network(format!("{}: {}", addr, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ErrorKind;
    use crate::probe::testutil::stalled_listener;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let latency = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(latency >= 0.0);
        assert!(latency < 1000.0);
    }

    #[tokio::test]
    async fn test_tcp_probe_closed_port_refused() {
        // Bind then drop to find a port that is almost certainly closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Refused(_)));
        assert_eq!(err.classify(), ErrorKind::Refused);
    }

    #[tokio::test]
    async fn test_tcp_probe_stalled_connect_times_out() {
        // A saturated accept backlog stalls the handshake locally, so the
        // test does not depend on live routing behavior.
        let (_listener, _fillers, port) = stalled_listener();

        let err = run_tcp_probe("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        assert_eq!(err.classify(), ErrorKind::Timeout);
    }
}

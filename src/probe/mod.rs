//! Probe executor for network checks.
//!
//! Supports ICMP ping, DNS, TCP port, and HTTP probes. Probe failures are
//! expected outcomes: [`run_check`] always returns a [`CheckResult`], mapping
//! timeouts and network errors to an [`ErrorKind`] classification instead of
//! propagating them.

mod dns;
mod http;
mod ping;
mod tcp;

pub use dns::run_dns_probe;
pub use http::run_http_probe;
pub use ping::run_ping_probe;
pub use tcp::run_tcp_probe;

use std::time::Duration;
use thiserror::Error;

use crate::db::{CheckKind, CheckResult, CheckSpec, ErrorKind, MonitoredTarget};

/// Internal probe error, classified into an [`ErrorKind`] at the boundary.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("dns failure: {0}")]
    Dns(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

impl ProbeError {
    fn classify(&self) -> ErrorKind {
        match self {
            ProbeError::Timeout(_) => ErrorKind::Timeout,
            ProbeError::Refused(_) => ErrorKind::Refused,
            ProbeError::Dns(_) => ErrorKind::DnsFailure,
            ProbeError::Network(_) | ProbeError::Command(_) => ErrorKind::Unreachable,
        }
    }
}

/// Default per-check timeout.
pub fn default_timeout(kind: CheckKind) -> Duration {
    match kind {
        CheckKind::Ping => Duration::from_secs(2),
        CheckKind::Tcp => Duration::from_secs(2),
        CheckKind::Dns => Duration::from_secs(5),
        CheckKind::Http => Duration::from_secs(5),
    }
}

/// Run one check against one target.
///
/// Never returns an error: timeouts and network failures become a
/// `CheckResult` with `success=false` and an error classification.
pub async fn run_check(target: &MonitoredTarget, spec: &CheckSpec, timeout: Duration) -> CheckResult {
    // Jitter to avoid a thundering herd at batch start
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let kind = spec.kind();
    let outcome = match spec {
        CheckSpec::Ping => run_ping_probe(&target.address, timeout).await,
        CheckSpec::Dns => run_dns_probe(&target.address, timeout).await,
        CheckSpec::Tcp { port } => run_tcp_probe(&target.address, *port, timeout).await,
        CheckSpec::Http => run_http_probe(&target.address, timeout).await,
    };

    match outcome {
        Ok(latency_ms) if latency_ms <= timeout.as_secs_f64() * 1000.0 => {
            CheckResult::ok(target.id, kind, latency_ms)
        }
        Ok(_) => CheckResult::failed(target.id, kind, ErrorKind::Timeout),
        Err(e) => {
            tracing::debug!("probe {} for {} failed: {}", kind.as_str(), target.name, e);
            CheckResult::failed(target.id, kind, e.classify())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ProbeError::Timeout(Duration::from_secs(1)).classify(),
            ErrorKind::Timeout
        );
        assert_eq!(
            ProbeError::Refused("x".into()).classify(),
            ErrorKind::Refused
        );
        assert_eq!(ProbeError::Dns("x".into()).classify(), ErrorKind::DnsFailure);
        assert_eq!(
            ProbeError::Network("x".into()).classify(),
            ErrorKind::Unreachable
        );
    }

    #[tokio::test]
    async fn test_run_check_never_errors() {
        // Reserved TEST-NET address: nothing listens there.
        let target = MonitoredTarget {
            id: 1,
            name: "black hole".to_string(),
            address: "192.0.2.1".to_string(),
            ..Default::default()
        };
        let result = run_check(
            &target,
            &CheckSpec::Tcp { port: 9 },
            Duration::from_millis(200),
        )
        .await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(result.latency_ms.is_none());
    }
}

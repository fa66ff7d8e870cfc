//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of network check a probe performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Ping,
    Dns,
    Tcp,
    Http,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Ping => "ping",
            CheckKind::Dns => "dns",
            CheckKind::Tcp => "tcp",
            CheckKind::Http => "http",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ping" => Some(CheckKind::Ping),
            "dns" => Some(CheckKind::Dns),
            "tcp" => Some(CheckKind::Tcp),
            "http" => Some(CheckKind::Http),
            _ => None,
        }
    }
}

/// Classification of a failed probe. Failures are values, not errors:
/// every probe outcome becomes a [`CheckResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Timeout,
    Unreachable,
    Refused,
    DnsFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Refused => "refused",
            ErrorKind::DnsFailure => "dns-failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(ErrorKind::Timeout),
            "unreachable" => Some(ErrorKind::Unreachable),
            "refused" => Some(ErrorKind::Refused),
            "dns-failure" => Some(ErrorKind::DnsFailure),
            _ => None,
        }
    }
}

/// One configured check for a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CheckSpec {
    Ping,
    Dns,
    Tcp { port: u16 },
    Http,
}

impl CheckSpec {
    pub fn kind(&self) -> CheckKind {
        match self {
            CheckSpec::Ping => CheckKind::Ping,
            CheckSpec::Dns => CheckKind::Dns,
            CheckSpec::Tcp { .. } => CheckKind::Tcp,
            CheckSpec::Http => CheckKind::Http,
        }
    }
}

/// A device on the network map that the engine monitors.
///
/// Disabled targets are kept in the store but never probed; deleting a
/// target also deletes its history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredTarget {
    pub id: i64,
    pub name: String,
    /// IP address or hostname.
    pub address: String,
    pub checks: Vec<CheckSpec>,
    pub enabled: bool,
}

impl Default for MonitoredTarget {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            checks: vec![CheckSpec::Ping],
            enabled: true,
        }
    }
}

/// One probe outcome. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    pub kind: CheckKind,
    pub success: bool,
    /// Round-trip latency in milliseconds; None on failure.
    pub latency_ms: Option<f64>,
    pub error: Option<ErrorKind>,
}

impl CheckResult {
    pub fn ok(target_id: i64, kind: CheckKind, latency_ms: f64) -> Self {
        Self {
            time: Utc::now(),
            target_id,
            kind,
            success: true,
            latency_ms: Some(latency_ms),
            error: None,
        }
    }

    pub fn failed(target_id: i64, kind: CheckKind, error: ErrorKind) -> Self {
        Self {
            time: Utc::now(),
            target_id,
            kind,
            success: false,
            latency_ms: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_spec_json_round_trip() {
        let checks = vec![CheckSpec::Ping, CheckSpec::Tcp { port: 443 }, CheckSpec::Dns];
        let json = serde_json::to_string(&checks).unwrap();
        let parsed: Vec<CheckSpec> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checks);
        assert_eq!(parsed[1].kind(), CheckKind::Tcp);
    }

    #[test]
    fn test_kind_strings() {
        for kind in [CheckKind::Ping, CheckKind::Dns, CheckKind::Tcp, CheckKind::Http] {
            assert_eq!(CheckKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CheckKind::parse("snmp"), None);

        for err in [
            ErrorKind::Timeout,
            ErrorKind::Unreachable,
            ErrorKind::Refused,
            ErrorKind::DnsFailure,
        ] {
            assert_eq!(ErrorKind::parse(err.as_str()), Some(err));
        }
    }
}

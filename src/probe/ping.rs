//! ICMP ping probe with native sockets and a ping-command fallback.
//!
//! Native mode uses blocking socket2 sockets inside spawn_blocking for
//! sub-millisecond timing. Hosts without RAW/DGRAM ICMP capability fall back
//! to the system `ping` binary.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Unique (identifier, sequence) pair so concurrent pings to the same host
/// can tell their replies apart.
fn next_ping_id() -> (u16, u16) {
    (
        rand::random(),
        PING_SEQUENCE.fetch_add(1, Ordering::Relaxed),
    )
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ping probe: native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Run a ping probe against the given address.
///
/// Returns round-trip latency in milliseconds.
pub async fn run_ping_probe(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_address(address).await?;
        let addr_str = address.to_string();

        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(latency) => return Ok(latency),
            Err(e) => {
                let text = format!("{:?}", e);
                if text.contains("Permission") || text.contains("not permitted") {
                    tracing::warn!(
                        "native ping for {} hit a permission error, falling back to command",
                        addr_str
                    );
                    return run_ping_command(&addr_str, timeout).await;
                }
                return Err(e);
            }
        }
    }

    run_ping_command(address, timeout).await
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Dns(format!("resolution failed for {}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Dns(format!("no addresses found for {}", address)))
}

/// Echo request/reply wire parameters per address family.
struct IcmpFamily {
    domain: Domain,
    protocol: Protocol,
    echo_request: u8,
    echo_reply: u8,
    /// The kernel computes the ICMPv6 checksum; v4 needs it filled in.
    needs_checksum: bool,
}

fn family_of(ip: IpAddr) -> IcmpFamily {
    match ip {
        IpAddr::V4(_) => IcmpFamily {
            domain: Domain::IPV4,
            protocol: Protocol::ICMPV4,
            echo_request: 8,
            echo_reply: 0,
            needs_checksum: true,
        },
        IpAddr::V6(_) => IcmpFamily {
            domain: Domain::IPV6,
            protocol: Protocol::ICMPV6,
            echo_request: 128,
            echo_reply: 129,
            needs_checksum: false,
        },
    }
}

/// Blocking ICMP echo with precise timing; runs inside spawn_blocking.
fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<f64, ProbeError> {
    let family = family_of(ip);

    // RAW first (privileged), then DGRAM (unprivileged)
    let socket = Socket::new(family.domain, Type::RAW, Some(family.protocol))
        .or_else(|_| Socket::new(family.domain, Type::DGRAM, Some(family.protocol)))
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let (identifier, sequence) = next_ping_id();
    let packet =
        build_echo_request(family.echo_request, identifier, sequence, family.needs_checksum);

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    // Loop until we see OUR reply or the deadline passes; other traffic on
    // the socket is ignored.
    loop {
        let mut buf: [MaybeUninit<u8>; 1500] = unsafe { MaybeUninit::uninit().assume_init() };
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock
                || e.kind() == std::io::ErrorKind::TimedOut
            {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        // RAW v4 sockets deliver the IP header too; DGRAM and v6 do not.
        let offset = if family.needs_checksum && len > 0 && buf[0] >> 4 == 4 {
            20
        } else {
            0
        };
        if len >= offset + 8 {
            let reply_type = buf[offset];
            let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
            let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);

            if reply_type == family.echo_reply && reply_id == identifier && reply_seq == sequence {
                return Ok(elapsed.as_secs_f64() * 1000.0);
            }
        }
    }
}

/// Build an ICMP(v6) echo request: 8 byte header + 56 byte payload.
fn build_echo_request(echo_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = echo_type;
    packet[1] = 0; // code
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    // Payload carries the send timestamp
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    packet[8..16].copy_from_slice(&timestamp.to_be_bytes());

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;

    while i < data.len() - 1 {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Fallback: shell out to the system ping binary.
async fn run_ping_command(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &timeout_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Err(ProbeError::Timeout(timeout));
        }
        return Err(ProbeError::Command(format!("ping failed: {}", stdout)));
    }

    parse_ping_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse ping command output for latency in milliseconds.
fn parse_ping_output(output: &str) -> Result<f64, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, some macOS)
    static RE_PACKET: OnceLock<Regex> = OnceLock::new();
    let re = RE_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());
    if let Some(ms) = re
        .captures(output)
        .and_then(|c| c.name("val"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    // Summary "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    static RE_SUMMARY: OnceLock<Regex> = OnceLock::new();
    let re = RE_SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/\w+\s*=\s*[0-9.]+/(?P<avg>[0-9.]+)/").unwrap()
    });
    if let Some(ms) = re
        .captures(output)
        .and_then(|c| c.name("avg"))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Ok(ms);
    }

    Err(ProbeError::Command(format!(
        "failed to parse ping output: {}",
        output
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_nonzero() {
        let mut packet = vec![0u8; 8];
        packet[0] = 8;
        packet[4] = 0x12;
        packet[5] = 0x34;
        packet[7] = 0x01;
        assert_ne!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_echo_request_v4() {
        let packet = build_echo_request(8, 0x1234, 0x0001, true);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
        // Checksum filled in
        assert!(packet[2] != 0 || packet[3] != 0);
    }

    #[test]
    fn test_build_echo_request_v6_leaves_checksum() {
        let packet = build_echo_request(128, 0xBEEF, 7, false);
        assert_eq!(packet[0], 128);
        assert_eq!(packet[2..4], [0, 0]);
    }

    #[test]
    fn test_parse_ping_output_per_packet() {
        let output = "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.345 ms";
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 12.345).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_macos_summary() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes

--- google.com ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let latency = parse_ping_output(output).unwrap();
        assert!((latency - 17.906).abs() < 1e-9);
    }

    #[test]
    fn test_parse_ping_output_garbage() {
        assert!(parse_ping_output("no latency here").is_err());
    }
}

//! DNS probe implementation using raw UDP packets.
//!
//! Checks that the target answers DNS queries, which is the health signal
//! for router/gateway devices running a resolver.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use super::ProbeError;

/// Run a DNS probe against the given DNS server address.
///
/// Queries for an "example.com" A record and returns latency in milliseconds.
pub async fn run_dns_probe(address: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let target_addr = if address.contains(':') {
        address.to_string()
    } else {
        format!("{}:53", address)
    };

    // The exchange uses a blocking socket with a read timeout; keep it off
    // the async worker threads.
    tokio::task::spawn_blocking(move || query_dns(&target_addr, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?
}

fn query_dns(target_addr: &str, timeout: Duration) -> Result<f64, ProbeError> {
    let packet = build_dns_query();
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    socket
        .connect(target_addr)
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 512];
    let n = socket.recv(&mut response).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut || e.kind() == std::io::ErrorKind::WouldBlock {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(format!("failed to recv: {}", e))
        }
    })?;

    let elapsed = start.elapsed().as_secs_f64() * 1000.0;

    if n < 12 {
        return Err(ProbeError::Dns(format!("response too short: {} bytes", n)));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Dns(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // RCODE is the lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Dns(format!("server returned RCODE {}", rcode)));
    }

    Ok(elapsed)
}

/// Build a minimal DNS query packet for "example.com" A record.
fn build_dns_query() -> Vec<u8> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // standard query, recursion desired

    // Header (12 bytes)
    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    // Question: example.com A IN, length-prefixed labels
    packet.extend_from_slice(&[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
    packet.extend_from_slice(&[3, b'c', b'o', b'm']);
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE: A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS: IN

    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dns_query() {
        let packet = build_dns_query();
        // 12 (header) + 13 (question name) + 4 (type/class)
        assert_eq!(packet.len(), 29);
        // Recursion desired flag set
        assert_eq!(packet[2], 0x01);
        // QDCOUNT = 1
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1);
    }
}

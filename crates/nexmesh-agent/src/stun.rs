// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

const STUN_TIMEOUT: Duration = Duration::from_secs(3);
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ADDR_FAMILY_IPV4: u8 = 0x01;
const ADDR_FAMILY_IPV6: u8 = 0x02;

/// The two distinct servers the NAT classifier compares mappings across.
pub const STUN_SERVER_1: &str = "stun.l.google.com:19302";
pub const STUN_SERVER_2: &str = "stun1.l.google.com:19302";

#[derive(Debug, Error)]
pub enum StunError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("timeout waiting for STUN response")]
	Timeout,

	#[error("invalid STUN response")]
	InvalidResponse,

	#[error("failed to resolve STUN server: {0}")]
	Resolution(String),
}

pub type Result<T> = std::result::Result<T, StunError>;

/// Outcome of the two-server probe. `symmetric` is `None` when one of the
/// probes failed and no verdict could be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatClassification {
	pub reflexive: Option<SocketAddr>,
	pub symmetric: Option<bool>,
}

/// Sends one binding request to `server` from the given local port and
/// returns the server-reflexive mapping.
#[instrument(fields(server = %server, port = local_port))]
pub async fn binding_request(server: &str, local_port: u16) -> Result<SocketAddr> {
	let server_addr = tokio::net::lookup_host(server)
		.await
		.map_err(|e| StunError::Resolution(e.to_string()))?
		.find(|a| a.is_ipv4())
		.ok_or_else(|| StunError::Resolution(server.to_string()))?;

	let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;

	let transaction_id: [u8; 12] = fastrand::u128(..).to_le_bytes()[..12]
		.try_into()
		.expect("12 bytes from 16");
	let request = build_binding_request(&transaction_id);

	socket.send_to(&request, server_addr).await?;

	let mut buf = [0u8; 1024];
	let (len, from) = timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
		.await
		.map_err(|_| StunError::Timeout)??;

	if from != server_addr {
		warn!(?from, expected = ?server_addr, "STUN response from unexpected source");
		return Err(StunError::InvalidResponse);
	}

	let addr = parse_binding_response(&buf[..len], &transaction_id)?;
	debug!(?addr, "discovered server-reflexive address");
	Ok(addr)
}

/// Probes two distinct servers and compares the mappings. A NAT that hands
/// out a different mapping per destination is symmetric and can only be
/// reached through the relay.
#[instrument(fields(port = local_port))]
pub async fn classify_nat(local_port: u16) -> NatClassification {
	let first = match binding_request(STUN_SERVER_1, local_port).await {
		Ok(addr) => Some(addr),
		Err(e) => {
			info!(error = %e, server = STUN_SERVER_1, "STUN probe failed");
			None
		}
	};
	let second = match binding_request(STUN_SERVER_2, local_port).await {
		Ok(addr) => Some(addr),
		Err(e) => {
			info!(error = %e, server = STUN_SERVER_2, "STUN probe failed");
			None
		}
	};

	let classification = nat_verdict(first, second);
	if classification.symmetric == Some(true) {
		info!("symmetric NAT detected, this node will be provisioned in relay mode only");
	}
	classification
}

/// Pure comparison of the two mappings. One failed probe leaves the verdict
/// unknown; callers treat unknown as not-symmetric.
pub fn nat_verdict(
	first: Option<SocketAddr>,
	second: Option<SocketAddr>,
) -> NatClassification {
	match (first, second) {
		(Some(a1), Some(a2)) => NatClassification {
			reflexive: Some(a1),
			symmetric: Some(a1 != a2),
		},
		(Some(a1), None) => NatClassification {
			reflexive: Some(a1),
			symmetric: None,
		},
		(None, Some(a2)) => NatClassification {
			reflexive: Some(a2),
			symmetric: None,
		},
		(None, None) => NatClassification {
			reflexive: None,
			symmetric: None,
		},
	}
}

pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
	let mut request = Vec::with_capacity(20);

	request.extend_from_slice(&0x0001u16.to_be_bytes());

	request.extend_from_slice(&0u16.to_be_bytes());

	request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

	request.extend_from_slice(transaction_id);

	request
}

pub fn parse_binding_response(
	data: &[u8],
	expected_transaction_id: &[u8; 12],
) -> Result<SocketAddr> {
	if data.len() < 20 {
		return Err(StunError::InvalidResponse);
	}

	let message_type = u16::from_be_bytes([data[0], data[1]]);
	if message_type != 0x0101 {
		return Err(StunError::InvalidResponse);
	}

	let message_length = u16::from_be_bytes([data[2], data[3]]) as usize;

	let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
	if magic != STUN_MAGIC_COOKIE {
		return Err(StunError::InvalidResponse);
	}

	if &data[8..20] != expected_transaction_id {
		return Err(StunError::InvalidResponse);
	}

	if data.len() < 20 + message_length {
		return Err(StunError::InvalidResponse);
	}

	let mut offset = 20;
	let end = 20 + message_length;

	while offset + 4 <= end {
		let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
		let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
		offset += 4;

		if offset + attr_length > end {
			return Err(StunError::InvalidResponse);
		}

		if attr_type == ATTR_XOR_MAPPED_ADDRESS || attr_type == ATTR_MAPPED_ADDRESS {
			let xor = attr_type == ATTR_XOR_MAPPED_ADDRESS;
			if let Some(addr) = parse_mapped_address(&data[offset..offset + attr_length], xor) {
				return Ok(addr);
			}
		}

		let padded_length = (attr_length + 3) & !3;
		offset += padded_length;
	}

	Err(StunError::InvalidResponse)
}

fn parse_mapped_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
	if data.len() < 4 {
		return None;
	}

	let family = data[1];
	let port = u16::from_be_bytes([data[2], data[3]]);

	let port = if xor {
		port ^ ((STUN_MAGIC_COOKIE >> 16) as u16)
	} else {
		port
	};

	match family {
		ADDR_FAMILY_IPV4 if data.len() >= 8 => {
			let mut ip_bytes = [data[4], data[5], data[6], data[7]];
			if xor {
				let magic_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
				for (i, b) in ip_bytes.iter_mut().enumerate() {
					*b ^= magic_bytes[i];
				}
			}
			let ip = Ipv4Addr::from(ip_bytes);
			Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
		}
		ADDR_FAMILY_IPV6 if data.len() >= 20 => {
			let mut ip_bytes: [u8; 16] = data[4..20].try_into().ok()?;
			if xor {
				let magic_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
				for (i, b) in ip_bytes.iter_mut().enumerate().take(4) {
					*b ^= magic_bytes[i];
				}
			}
			let ip = Ipv6Addr::from(ip_bytes);
			Some(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
		}
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(s: &str) -> SocketAddr {
		s.parse().unwrap()
	}

	#[test]
	fn binding_request_shape() {
		let transaction_id = [7u8; 12];
		let request = build_binding_request(&transaction_id);

		assert_eq!(request.len(), 20);
		assert_eq!(&request[0..2], &[0x00, 0x01]);
		assert_eq!(&request[2..4], &[0x00, 0x00]);
		assert_eq!(&request[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
		assert_eq!(&request[8..20], &transaction_id);
	}

	#[test]
	fn parse_xor_mapped_ipv4_response() {
		let mut response = Vec::new();
		response.extend_from_slice(&0x0101u16.to_be_bytes());
		response.extend_from_slice(&12u16.to_be_bytes());
		response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
		response.extend_from_slice(&[0u8; 12]);

		response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
		response.extend_from_slice(&8u16.to_be_bytes());

		response.push(0x00);
		response.push(ADDR_FAMILY_IPV4);

		let port: u16 = 41852;
		let xor_port = port ^ ((STUN_MAGIC_COOKIE >> 16) as u16);
		response.extend_from_slice(&xor_port.to_be_bytes());

		let ip = Ipv4Addr::new(198, 51, 100, 7);
		let magic_bytes = STUN_MAGIC_COOKIE.to_be_bytes();
		let ip_bytes = ip.octets();
		let xor_ip: [u8; 4] = [
			ip_bytes[0] ^ magic_bytes[0],
			ip_bytes[1] ^ magic_bytes[1],
			ip_bytes[2] ^ magic_bytes[2],
			ip_bytes[3] ^ magic_bytes[3],
		];
		response.extend_from_slice(&xor_ip);

		let result = parse_binding_response(&response, &[0u8; 12]).unwrap();
		assert_eq!(result, SocketAddr::V4(SocketAddrV4::new(ip, port)));
	}

	#[test]
	fn parse_rejects_wrong_transaction_id() {
		let mut response = Vec::new();
		response.extend_from_slice(&0x0101u16.to_be_bytes());
		response.extend_from_slice(&0u16.to_be_bytes());
		response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
		response.extend_from_slice(&[1u8; 12]);

		assert!(parse_binding_response(&response, &[0u8; 12]).is_err());
	}

	#[test]
	fn matching_mappings_are_not_symmetric() {
		let verdict = nat_verdict(
			Some(addr("203.0.113.9:41852")),
			Some(addr("203.0.113.9:41852")),
		);
		assert_eq!(verdict.symmetric, Some(false));
		assert_eq!(verdict.reflexive, Some(addr("203.0.113.9:41852")));
	}

	#[test]
	fn differing_mappings_are_symmetric() {
		let verdict = nat_verdict(
			Some(addr("203.0.113.9:41852")),
			Some(addr("203.0.113.9:41901")),
		);
		assert_eq!(verdict.symmetric, Some(true));
		// the first mapping is still recorded for the device row
		assert_eq!(verdict.reflexive, Some(addr("203.0.113.9:41852")));
	}

	#[test]
	fn one_failed_probe_leaves_verdict_unknown() {
		let verdict = nat_verdict(Some(addr("203.0.113.9:41852")), None);
		assert_eq!(verdict.symmetric, None);
		assert_eq!(verdict.reflexive, Some(addr("203.0.113.9:41852")));

		let verdict = nat_verdict(None, None);
		assert_eq!(verdict.symmetric, None);
		assert_eq!(verdict.reflexive, None);
	}
}

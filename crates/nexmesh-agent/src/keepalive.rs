// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Agent-level keepalive.
//!
//! WireGuard's own persistent keepalive is disabled on every peer; instead
//! the agent sends a small in-tunnel datagram to each cached overlay
//! address. This keeps NAT bindings warm; it is not a correctness signal,
//! so failures only show up at debug level.

use tokio::net::UdpSocket;
use tracing::{debug, instrument};

const PROBE_PORT: u16 = 51820;
const PROBE_PAYLOAD: &[u8] = b"nexmesh-keepalive";

#[instrument(skip_all, fields(peers = targets.len()))]
pub async fn probe_peers(targets: &[String]) {
	let socket = match UdpSocket::bind("0.0.0.0:0").await {
		Ok(socket) => socket,
		Err(e) => {
			debug!(error = %e, "failed to bind keepalive socket");
			return;
		}
	};

	for target in targets {
		if target.is_empty() {
			continue;
		}
		let addr = format!("{target}:{PROBE_PORT}");
		if let Err(e) = socket.send_to(PROBE_PAYLOAD, &addr).await {
			debug!(error = %e, %addr, "keepalive probe failed");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn probe_reaches_a_local_listener() {
		let listener = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let port = listener.local_addr().unwrap().port();

		let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		socket
			.send_to(PROBE_PAYLOAD, ("127.0.0.1", port))
			.await
			.unwrap();

		let mut buf = [0u8; 64];
		let (len, _) = listener.recv_from(&mut buf).await.unwrap();
		assert_eq!(&buf[..len], PROBE_PAYLOAD);
	}

	#[tokio::test]
	async fn probe_peers_tolerates_unreachable_targets() {
		// nothing is listening; the probe must not error out
		probe_peers(&["127.0.0.1".to_string(), String::new()]).await;
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};

/// Derived WireGuard peer entry. Never persisted; rebuilt from scratch on
/// every reconcile that detects a change in the device listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WgPeerConfig {
	pub public_key: String,
	/// `host:port` to dial. Ignored when the peer is configured passively
	/// on the relay side.
	pub endpoint: String,
	pub allowed_ips: Vec<String>,
	/// Always "0"; liveness is handled by the agent-level keepalive.
	pub persistent_keepalive: String,
}

impl WgPeerConfig {
	pub fn new(public_key: String, endpoint: String, allowed_ips: Vec<String>) -> Self {
		Self {
			public_key,
			endpoint,
			allowed_ips,
			persistent_keepalive: "0".to_string(),
		}
	}
}

/// Splits a textual `host:port` pair. Endpoints reported by a controller
/// mid-convergence can be empty or `(none)`; callers skip those devices for
/// the cycle rather than fail.
pub fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
	let (host, port) = endpoint.rsplit_once(':')?;
	if host.is_empty() {
		return None;
	}
	let port: u16 = port.parse().ok()?;
	Some((host, port))
}

/// Returns the address part of `ip` with any `/n` suffix removed.
pub fn strip_cidr_suffix(ip: &str) -> &str {
	match ip.split_once('/') {
		Some((host, _)) => host,
		None => ip,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_host_port_accepts_socket_pairs() {
		assert_eq!(
			split_host_port("203.0.113.5:51820"),
			Some(("203.0.113.5", 51820))
		);
	}

	#[test]
	fn split_host_port_rejects_converging_endpoints() {
		assert_eq!(split_host_port("(none)"), None);
		assert_eq!(split_host_port(""), None);
		assert_eq!(split_host_port("203.0.113.5"), None);
		assert_eq!(split_host_port(":51820"), None);
		assert_eq!(split_host_port("203.0.113.5:port"), None);
	}

	#[test]
	fn strip_cidr_suffix_handles_both_forms() {
		assert_eq!(strip_cidr_suffix("10.0.0.1/32"), "10.0.0.1");
		assert_eq!(strip_cidr_suffix("10.0.0.1"), "10.0.0.1");
	}

	#[test]
	fn peer_config_defaults_keepalive_off() {
		let peer = WgPeerConfig::new(
			"pk".to_string(),
			"1.2.3.4:51820".to_string(),
			vec!["10.0.0.2/32".to_string()],
		);
		assert_eq!(peer.persistent_keepalive, "0");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peering policy: the projection from the device cache to the WireGuard
//! peer set this node should carry.
//!
//! Kept as a pure function of `(cache, self key, self reflexive address,
//! self symmetric flag, persona)` so it is unit-testable with no network or
//! interface in scope.

use crate::config::Persona;
use ipnet::IpNet;
use nexmesh_wg_common::{split_host_port, strip_cidr_suffix, Device, DeviceId, WgPeerConfig};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PolicyError {
	/// The organization declares a supernet but no relay record carries an
	/// overlay address to anchor it on.
	#[error("no relay detected in this organization, add one by running nexrelay")]
	MissingRelay,

	#[error("invalid organization prefix {0}")]
	InvalidOrgPrefix(String),
}

/// What this node knows about itself when projecting the peer set.
#[derive(Debug, Clone)]
pub struct SelfInfo {
	pub public_key: String,
	pub reflexive_ip4: String,
	pub symmetric_nat: bool,
	pub persona: Persona,
}

/// The derived peer set plus the relay's overlay address, recorded when the
/// relay peer is built so the agent can address the relay directly.
#[derive(Debug, Clone, Default)]
pub struct PeerPlan {
	pub peers: Vec<WgPeerConfig>,
	pub relay_overlay_ip: Option<String>,
}

impl PeerPlan {
	pub fn peer_for(&self, public_key: &str) -> Option<&WgPeerConfig> {
		self.peers.iter().find(|p| p.public_key == public_key)
	}
}

/// Widens the relay's overlay address to the organization's mask, producing
/// the catch-all allowed-ip that routes the whole org through the relay.
fn org_supernet(relay_overlay: &str, org_prefix: &str) -> Result<String, PolicyError> {
	let net: IpNet = org_prefix
		.parse()
		.map_err(|_| PolicyError::InvalidOrgPrefix(org_prefix.to_string()))?;
	Ok(format!(
		"{}/{}",
		strip_cidr_suffix(relay_overlay),
		net.prefix_len()
	))
}

/// A device's allowed-ips with its child prefixes folded in once.
fn allowed_with_child_prefixes(device: &Device) -> Vec<String> {
	let mut allowed = device.allowed_ips.clone();
	allowed.extend(device.child_prefix.iter().cloned());
	allowed
}

pub fn build_peers_config(
	cache: &HashMap<DeviceId, Device>,
	self_info: &SelfInfo,
) -> Result<PeerPlan, PolicyError> {
	let mut relay_overlay: Option<String> = None;
	let mut org_prefix = String::new();
	for device in cache.values() {
		if device.relay {
			relay_overlay = device.allowed_ips.first().cloned();
			org_prefix = device.organization_prefix.clone();
		}
	}

	let supernet = if org_prefix.is_empty() {
		None
	} else {
		let overlay = relay_overlay.as_deref().ok_or(PolicyError::MissingRelay)?;
		Some(org_supernet(overlay, &org_prefix)?)
	};

	let mut plan = PeerPlan::default();

	for device in cache.values() {
		if device.public_key == self_info.public_key {
			continue;
		}
		let Some((_, peer_port)) = split_host_port(&device.local_ip) else {
			debug!(
				device = %device.id,
				endpoint = %device.local_ip,
				"unparseable endpoint, skipping device this cycle (likely still converging)"
			);
			continue;
		};

		match self_info.persona {
			Persona::Peer => {
				if device.relay {
					// every node peers with the relay over the org supernet;
					// for a symmetric-NAT node this is the only peer it gets
					let mut allowed = Vec::new();
					allowed.extend(supernet.iter().cloned());
					allowed.extend(device.child_prefix.iter().cloned());
					plan.relay_overlay_ip = relay_overlay
						.as_deref()
						.map(|ip| strip_cidr_suffix(ip).to_string());
					plan.peers.push(WgPeerConfig::new(
						device.public_key.clone(),
						device.local_ip.clone(),
						allowed,
					));
				} else if same_lan(self_info, device) {
					// same public NAT address on both sides, dial the LAN
					// address instead of hairpinning through the NAT
					let endpoint =
						format!("{}:{}", device.endpoint_local_address_ip4, peer_port);
					plan.peers.push(WgPeerConfig::new(
						device.public_key.clone(),
						endpoint,
						allowed_with_child_prefixes(device),
					));
				} else if !self_info.symmetric_nat && !device.symmetric_nat {
					plan.peers.push(WgPeerConfig::new(
						device.public_key.clone(),
						device.local_ip.clone(),
						allowed_with_child_prefixes(device),
					));
				}
				// otherwise one side is behind symmetric NAT and the relay
				// peer above mediates
			}
			Persona::Relay => {
				// the relay terminates tunnels from everyone
				plan.peers.push(WgPeerConfig::new(
					device.public_key.clone(),
					device.local_ip.clone(),
					allowed_with_child_prefixes(device),
				));
				if same_lan(self_info, device) && !device.relay {
					let endpoint =
						format!("{}:{}", device.endpoint_local_address_ip4, peer_port);
					plan.peers.push(WgPeerConfig::new(
						device.public_key.clone(),
						endpoint,
						allowed_with_child_prefixes(device),
					));
				}
			}
		}
	}

	Ok(plan)
}

fn same_lan(self_info: &SelfInfo, device: &Device) -> bool {
	!self_info.reflexive_ip4.is_empty() && self_info.reflexive_ip4 == device.reflexive_ip4
}

/// Reads the controller-assigned overlay address off this node's own entry
/// in the device listing, with any CIDR suffix removed. An empty address
/// means IPAM has not converged yet.
pub fn build_local_config(
	cache: &HashMap<DeviceId, Device>,
	self_public_key: &str,
) -> Option<String> {
	cache
		.values()
		.find(|d| d.public_key == self_public_key)
		.map(|d| strip_cidr_suffix(&d.tunnel_ip).to_string())
		.filter(|address| !address.is_empty())
}

#[cfg(test)]
mod tests {
	use super::*;
	use uuid::Uuid;

	fn device(public_key: &str, local_ip: &str, allowed_ips: &[&str]) -> Device {
		Device {
			id: DeviceId::new(),
			user_id: "user-1".to_string(),
			organization_id: Uuid::nil(),
			public_key: public_key.to_string(),
			local_ip: local_ip.to_string(),
			tunnel_ip: String::new(),
			allowed_ips: allowed_ips.iter().map(|s| s.to_string()).collect(),
			child_prefix: vec![],
			reflexive_ip4: String::new(),
			endpoint_local_address_ip4: String::new(),
			symmetric_nat: false,
			relay: false,
			hostname: String::new(),
			organization_prefix: String::new(),
		}
	}

	fn cache_of(devices: Vec<Device>) -> HashMap<DeviceId, Device> {
		devices.into_iter().map(|d| (d.id, d)).collect()
	}

	fn peer_self(public_key: &str) -> SelfInfo {
		SelfInfo {
			public_key: public_key.to_string(),
			reflexive_ip4: String::new(),
			symmetric_nat: false,
			persona: Persona::Peer,
		}
	}

	#[test]
	fn direct_peering_between_cone_nat_nodes() {
		let mut self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		self_entry.tunnel_ip = "10.0.0.1/32".to_string();
		let b = device("B", "203.0.113.5:51820", &["10.0.0.2/32"]);
		let cache = cache_of(vec![self_entry, b]);

		let plan = build_peers_config(&cache, &peer_self("A")).unwrap();

		assert_eq!(plan.peers.len(), 1);
		let peer = plan.peer_for("B").unwrap();
		assert_eq!(peer.endpoint, "203.0.113.5:51820");
		assert_eq!(peer.allowed_ips, vec!["10.0.0.2/32"]);
		assert_eq!(peer.persistent_keepalive, "0");

		assert_eq!(
			build_local_config(&cache, "A").as_deref(),
			Some("10.0.0.1")
		);
	}

	#[test]
	fn symmetric_self_gets_only_the_relay_peer() {
		let self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		let mut relay = device("R", "198.51.100.9:51820", &["10.0.0.254/32"]);
		relay.relay = true;
		relay.organization_prefix = "10.0.0.0/24".to_string();
		let c = device("C", "198.51.100.42:51820", &["10.0.0.3/32"]);

		let cache = cache_of(vec![self_entry, relay, c]);
		let mut self_info = peer_self("A");
		self_info.symmetric_nat = true;

		let plan = build_peers_config(&cache, &self_info).unwrap();

		assert_eq!(plan.peers.len(), 1);
		let peer = plan.peer_for("R").unwrap();
		assert_eq!(peer.endpoint, "198.51.100.9:51820");
		assert_eq!(peer.allowed_ips, vec!["10.0.0.254/24"]);
		assert!(plan.peer_for("C").is_none());
		assert_eq!(plan.relay_overlay_ip.as_deref(), Some("10.0.0.254"));
	}

	#[test]
	fn same_reflexive_address_short_circuits_to_the_lan() {
		let self_entry = device("A", "198.51.100.1:51820", &["10.0.0.1/32"]);
		let mut d = device("D", "198.51.100.1:41000", &["10.0.0.4/32"]);
		d.reflexive_ip4 = "198.51.100.1".to_string();
		d.endpoint_local_address_ip4 = "192.168.1.17".to_string();

		let cache = cache_of(vec![self_entry, d]);
		let mut self_info = peer_self("A");
		self_info.reflexive_ip4 = "198.51.100.1".to_string();

		let plan = build_peers_config(&cache, &self_info).unwrap();

		assert_eq!(plan.peers.len(), 1);
		let peer = plan.peer_for("D").unwrap();
		assert_eq!(peer.endpoint, "192.168.1.17:41000");
		assert_eq!(peer.allowed_ips, vec!["10.0.0.4/32"]);
	}

	#[test]
	fn symmetric_peer_gets_no_direct_entry() {
		let self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		let mut s = device("S", "203.0.113.80:44122", &["10.0.0.6/32"]);
		s.symmetric_nat = true;

		let cache = cache_of(vec![self_entry, s]);
		let plan = build_peers_config(&cache, &peer_self("A")).unwrap();

		assert!(plan.peer_for("S").is_none());
	}

	#[test]
	fn child_prefixes_are_appended_once() {
		let self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		let mut b = device("B", "203.0.113.5:51820", &["10.0.0.2/32"]);
		b.child_prefix = vec!["172.16.1.0/24".to_string()];
		// B also matches the same-LAN arm, which historically appended the
		// child prefix a second time
		b.reflexive_ip4 = "198.51.100.2".to_string();
		b.endpoint_local_address_ip4 = "192.168.1.4".to_string();

		let cache = cache_of(vec![self_entry, b]);
		let mut self_info = peer_self("A");
		self_info.reflexive_ip4 = "198.51.100.2".to_string();

		let plan = build_peers_config(&cache, &self_info).unwrap();
		let peer = plan.peer_for("B").unwrap();
		assert_eq!(
			peer.allowed_ips,
			vec!["10.0.0.2/32".to_string(), "172.16.1.0/24".to_string()]
		);
	}

	#[test]
	fn unparseable_endpoint_skips_the_device_for_the_cycle() {
		let self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		let converging = device("B", "(none)", &["10.0.0.2/32"]);

		let cache = cache_of(vec![self_entry, converging]);
		let plan = build_peers_config(&cache, &peer_self("A")).unwrap();

		assert!(plan.peers.is_empty());
	}

	#[test]
	fn org_prefix_without_relay_is_a_configuration_error() {
		// a relay record with no overlay address cannot anchor the supernet
		let self_entry = device("A", "198.51.100.2:51820", &["10.0.0.1/32"]);
		let mut broken_relay = device("R", "198.51.100.9:51820", &[]);
		broken_relay.relay = true;
		broken_relay.organization_prefix = "10.0.0.0/24".to_string();

		let cache = cache_of(vec![self_entry, broken_relay]);
		let err = build_peers_config(&cache, &peer_self("A")).unwrap_err();
		assert!(matches!(err, PolicyError::MissingRelay));
	}

	#[test]
	fn relay_persona_peers_with_everyone() {
		let self_entry = device("R", "198.51.100.9:51820", &["10.0.0.254/32"]);
		let mut symmetric = device("S", "203.0.113.80:44122", &["10.0.0.6/32"]);
		symmetric.symmetric_nat = true;
		let b = device("B", "203.0.113.5:51820", &["10.0.0.2/32"]);

		let cache = cache_of(vec![self_entry, symmetric, b]);
		let self_info = SelfInfo {
			public_key: "R".to_string(),
			reflexive_ip4: String::new(),
			symmetric_nat: false,
			persona: Persona::Relay,
		};

		let plan = build_peers_config(&cache, &self_info).unwrap();
		// even the symmetric-NAT node is terminated by the relay
		assert!(plan.peer_for("S").is_some());
		assert!(plan.peer_for("B").is_some());
		assert_eq!(plan.peers.len(), 2);
	}

	#[test]
	fn local_config_strips_the_cidr_suffix() {
		let mut self_entry = device("A", "198.51.100.2:51820", &[]);
		self_entry.tunnel_ip = "10.0.0.1/32".to_string();
		let cache = cache_of(vec![self_entry]);
		assert_eq!(
			build_local_config(&cache, "A").as_deref(),
			Some("10.0.0.1")
		);
		assert!(build_local_config(&cache, "missing").is_none());
	}

	#[test]
	fn local_config_waits_for_ipam() {
		let mut self_entry = device("A", "198.51.100.2:51820", &[]);
		self_entry.tunnel_ip = String::new();
		let cache = cache_of(vec![self_entry]);
		assert!(build_local_config(&cache, "A").is_none());
	}
}

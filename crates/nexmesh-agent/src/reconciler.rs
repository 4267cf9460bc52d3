// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation of the controller's device list against the local
//! WireGuard peer set.
//!
//! The reconciler is the single writer of the device cache, the derived
//! peer config, and the data plane. Everything else reads snapshots.

use crate::config::Persona;
use crate::error::{AgentError, Result};
use crate::platform::PlatformOps;
use crate::policy::{build_local_config, build_peers_config, PeerPlan, SelfInfo};
use crate::wg::WgControl;
use nexmesh_wg_common::keys::validate_wg_key;
use nexmesh_wg_common::{split_host_port, strip_cidr_suffix, Device, DeviceId, WgPeerConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

pub struct Reconciler {
	self_info: SelfInfo,
	tunnel_iface: String,
	listen_port: u16,
	private_key_file: PathBuf,
	cache: HashMap<DeviceId, Device>,
	plan: PeerPlan,
	local_address: Option<String>,
	platform: Arc<dyn PlatformOps>,
	wg: Arc<dyn WgControl>,
	keepalive_tx: watch::Sender<Vec<String>>,
}

impl Reconciler {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		self_info: SelfInfo,
		tunnel_iface: String,
		listen_port: u16,
		private_key_file: PathBuf,
		platform: Arc<dyn PlatformOps>,
		wg: Arc<dyn WgControl>,
		keepalive_tx: watch::Sender<Vec<String>>,
	) -> Self {
		Self {
			self_info,
			tunnel_iface,
			listen_port,
			private_key_file,
			cache: HashMap::new(),
			plan: PeerPlan::default(),
			local_address: None,
			platform,
			wg,
			keepalive_tx,
		}
	}

	pub fn cache(&self) -> &HashMap<DeviceId, Device> {
		&self.cache
	}

	pub fn local_address(&self) -> Option<&str> {
		self.local_address.as_deref()
	}

	pub fn relay_overlay_ip(&self) -> Option<&str> {
		self.plan.relay_overlay_ip.as_deref()
	}

	/// One reconcile cycle over a fetched device listing. Additions are
	/// applied before deletions so an address moving between devices never
	/// leaves a window with no route.
	#[instrument(skip_all, fields(devices = listing.len(), first_time))]
	pub fn reconcile(&mut self, listing: &[Device], first_time: bool) -> Result<()> {
		let mut new_peers: Vec<Device> = Vec::new();
		let mut changed = false;
		for device in listing {
			if self.cache.get(&device.id) != Some(device) {
				changed = true;
				self.cache.insert(device.id, device.clone());
				new_peers.push(device.clone());
			}
		}

		if changed || first_time {
			debug!("peer listing has changed, recalculating configuration");
			match build_peers_config(&self.cache, &self.self_info) {
				Ok(plan) => {
					self.plan = plan;
					self.update_local_address();
					self.deploy(&new_peers, first_time)?;
				}
				Err(e) => {
					// still-converging organization; retried next cycle
					error!(error = %e, "skipping peer config build");
				}
			}
		}

		self.handle_peer_deletes(listing);
		self.publish_keepalive_targets();

		Ok(())
	}

	/// Records the controller-assigned overlay address from our own device
	/// entry. An address change tears the interface down so the next deploy
	/// recreates it without a stale lease.
	fn update_local_address(&mut self) {
		let Some(address) = build_local_config(&self.cache, &self.self_info.public_key)
		else {
			return;
		};
		if self.local_address.as_deref() != Some(address.as_str()) {
			info!(%address, "new local WireGuard interface address assigned");
			if self.platform.interface_exists(&self.tunnel_iface) {
				if let Err(e) = self.platform.delete_interface(&self.tunnel_iface) {
					warn!(error = %e, dev = %self.tunnel_iface, "failed to delete interface");
				}
			}
		}
		self.local_address = Some(address);
	}

	fn deploy(&mut self, new_peers: &[Device], first_time: bool) -> Result<()> {
		let Some(local_address) = self.local_address.clone() else {
			// our own device row has not shown up in the listing yet
			debug!("no local address assigned yet, deferring deployment");
			return Ok(());
		};

		let current = self
			.platform
			.interface_ipv4(&self.tunnel_iface)
			.map(|ip| ip.to_string());
		if current.as_deref() != Some(local_address.as_str()) {
			self.setup_interface(&local_address)?;
		}

		if first_time {
			for peer in &self.plan.peers {
				install_peer(
					self.platform.as_ref(),
					self.wg.as_ref(),
					&self.tunnel_iface,
					peer,
					self.self_info.persona,
				);
			}
			info!("initial peer setup complete");
			return Ok(());
		}

		for new_peer in new_peers {
			if new_peer.public_key == self.self_info.public_key {
				continue;
			}
			for peer in self
				.plan
				.peers
				.iter()
				.filter(|p| p.public_key == new_peer.public_key)
			{
				install_peer(
					self.platform.as_ref(),
					self.wg.as_ref(),
					&self.tunnel_iface,
					peer,
					self.self_info.persona,
				);
			}
		}

		info!("peer setup complete");
		Ok(())
	}

	/// (Re)creates the tunnel interface and points the data plane at it.
	/// Failures here are fatal: the tunnel can never succeed without its
	/// interface.
	fn setup_interface(&self, local_address: &str) -> Result<()> {
		let dev = &self.tunnel_iface;

		if self.platform.interface_exists(dev) {
			if let Err(e) = self.platform.delete_interface(dev) {
				debug!(error = %e, dev = %dev, "failed to delete the existing interface");
			}
		}

		self.platform
			.create_interface(dev)
			.map_err(|e| AgentError::InterfaceSetup(e.to_string()))?;

		self.wg
			.setup_device(dev, self.listen_port, &self.private_key_file)
			.map_err(|e| AgentError::InterfaceSetup(e.to_string()))?;

		self.platform
			.assign_address(dev, local_address)
			.map_err(|e| AgentError::InterfaceSetup(e.to_string()))?;

		self.platform
			.link_up(dev)
			.map_err(|e| AgentError::InterfaceSetup(e.to_string()))?;

		Ok(())
	}

	/// Drops every cached device absent from the canonical listing: the
	/// WireGuard peer, its routes, and the cache entry.
	fn handle_peer_deletes(&mut self, listing: &[Device]) {
		let gone: Vec<DeviceId> = self
			.cache
			.keys()
			.filter(|id| !listing.iter().any(|d| d.id == **id))
			.copied()
			.collect();

		for id in gone {
			let Some(device) = self.cache.remove(&id) else {
				continue;
			};
			if let Err(e) = validate_wg_key(&device.public_key) {
				error!(error = %e, device = %id, "not removing peer with invalid key");
				continue;
			}
			match self.wg.remove_peer(&self.tunnel_iface, &device.public_key) {
				Ok(()) => info!(public_key = %device.public_key, "removed peer"),
				Err(e) => error!(error = %e, "failed to remove peer"),
			}
			for prefix in device
				.allowed_ips
				.iter()
				.chain(device.child_prefix.iter())
			{
				if !self.platform.route_exists(prefix) {
					continue;
				}
				if let Err(e) = self.platform.del_route(prefix, &self.tunnel_iface) {
					debug!(error = %e, prefix = %prefix, "failed to delete route");
				}
			}
		}
	}

	/// Publishes the probe targets the keepalive loop reads. Only the
	/// reconciler writes the cache; readers get a cheap snapshot.
	fn publish_keepalive_targets(&self) {
		let targets: Vec<String> = self
			.cache
			.values()
			.map(|d| strip_cidr_suffix(&d.tunnel_ip).to_string())
			.collect();
		let _ = self.keepalive_tx.send(targets);
	}
}

/// Route-before-tunnel: installs every missing allowed-ip route, then the
/// WireGuard peer entry. Route and peer failures are logged and retried on
/// a later cycle; only interface setup is fatal.
fn install_peer(
	platform: &dyn PlatformOps,
	wg: &dyn WgControl,
	dev: &str,
	peer: &WgPeerConfig,
	persona: Persona,
) {
	for prefix in &peer.allowed_ips {
		if platform.route_exists(prefix) {
			continue;
		}
		if let Err(e) = platform.add_route(prefix, dev) {
			error!(error = %e, prefix = %prefix, "route add failed");
		}
	}

	if split_host_port(&peer.endpoint).is_none() {
		debug!(
			public_key = %peer.public_key,
			"unparseable peer endpoint, skipping (likely still converging)"
		);
		return;
	}

	let passive = persona == Persona::Relay;
	if let Err(e) = wg.configure_peer(dev, peer, passive) {
		error!(error = %e, public_key = %peer.public_key, "peer tunnel addition failed");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Enrollment of this host as a device row on the controller.

use crate::config::{AgentConfig, Persona};
use crate::error::{AgentError, Result};
use crate::platform::PlatformOps;
use crate::stun::NatClassification;
use nexmesh_api_client::{AddDevice, ApiClient, ApiError, UpdateDevice};
use nexmesh_wg_common::{Device, DeviceId, KeyPair};
use std::net::SocketAddr;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// What registration leaves behind for the rest of the agent.
#[derive(Debug, Clone)]
pub struct Registration {
	pub device: Device,
	pub organization_id: Uuid,
	pub user_id: String,
	/// The advertised `host:port` other peers will dial.
	pub endpoint_socket: String,
}

/// Endpoint preference: the operator's `--local-endpoint-ip` wins, then the
/// STUN mapping (useless behind symmetric NAT, skipped when STUN is off).
/// `None` sends the caller to OS address discovery.
pub fn select_endpoint(
	user_ip: Option<&str>,
	stun_mapping: Option<SocketAddr>,
	stun_enabled: bool,
	symmetric: bool,
	listen_port: u16,
) -> Option<(String, u16)> {
	if let Some(ip) = user_ip {
		return Some((ip.to_string(), listen_port));
	}
	if stun_enabled && !symmetric {
		if let Some(mapping) = stun_mapping {
			return Some((mapping.ip().to_string(), mapping.port()));
		}
	}
	None
}

/// Scans an organization listing for a relay owned by someone else.
pub fn existing_relay(listing: &[Device], self_public_key: &str) -> Option<DeviceId> {
	listing
		.iter()
		.find(|d| d.relay && d.public_key != self_public_key)
		.map(|d| d.id)
}

#[instrument(skip_all, fields(persona = ?config.persona))]
pub async fn register_device(
	client: &ApiClient,
	config: &AgentConfig,
	keypair: &KeyPair,
	nat: &NatClassification,
	symmetric_nat: bool,
	listen_port: u16,
	platform: &dyn PlatformOps,
) -> Result<Registration> {
	let user = client.get_current_user().await?;
	if user.organizations.is_empty() {
		return Err(AgentError::Registration(
			"user does not belong to any organizations".to_string(),
		));
	}
	if user.organizations.len() != 1 {
		return Err(AgentError::Registration(
			"user being in more than one organization is not yet supported".to_string(),
		));
	}
	let organization_id = user.organizations[0];
	info!(%organization_id, "device belongs in organization");

	if config.persona == Persona::Relay {
		let listing = client.get_devices_in_organization(organization_id).await?;
		if let Some(id) = existing_relay(&listing, &keypair.public) {
			return Err(AgentError::Registration(format!(
				"the organization already contains a relay node, device {id} needs to be deleted before adding a new relay"
			)));
		}
	}

	let (local_ip, endpoint_port) = match select_endpoint(
		config.local_endpoint_ip.as_deref(),
		nat.reflexive,
		config.stun,
		symmetric_nat,
		listen_port,
	) {
		Some(endpoint) => endpoint,
		None => {
			let ip = platform.discover_local_ipv4().map_err(|e| {
				AgentError::Registration(format!(
					"unable to determine the ip address of the host, please specify using --local-endpoint-ip: {e}"
				))
			})?;
			(ip.to_string(), listen_port)
		}
	};
	let endpoint_socket = format!("{local_ip}:{endpoint_port}");

	let reflexive_ip4 = nat
		.reflexive
		.map(|a| a.ip().to_string())
		.unwrap_or_default();
	let hostname = hostname::get()
		.map(|h| h.to_string_lossy().to_string())
		.unwrap_or_default();

	let request = AddDevice {
		user_id: user.id.clone(),
		organization_id,
		public_key: keypair.public.clone(),
		local_ip: endpoint_socket.clone(),
		tunnel_ip: config.request_ip.clone().unwrap_or_default(),
		child_prefix: config.child_prefix.clone(),
		reflexive_ip4: reflexive_ip4.clone(),
		endpoint_local_address_ip4: local_ip.clone(),
		symmetric_nat,
		hostname: hostname.clone(),
		relay: config.persona == Persona::Relay,
	};

	let device = match client.create_device(&request).await {
		Ok(device) => device,
		Err(ApiError::Conflict { id }) => {
			let device_id: DeviceId = id.parse().map_err(|e| {
				AgentError::Registration(format!("error parsing conflicting device id: {e}"))
			})?;
			debug!(%device_id, "device already registered, updating");
			client
				.update_device(
					device_id,
					&UpdateDevice {
						local_ip: Some(endpoint_socket.clone()),
						child_prefix: Some(config.child_prefix.clone()),
						reflexive_ip4: Some(reflexive_ip4),
						endpoint_local_address_ip4: Some(local_ip),
						symmetric_nat: Some(symmetric_nat),
						hostname: Some(hostname),
					},
				)
				.await?
		}
		Err(e) => return Err(e.into()),
	};

	info!(device_id = %device.id, "successfully registered device");

	Ok(Registration {
		device,
		organization_id,
		user_id: user.id,
		endpoint_socket,
	})
}

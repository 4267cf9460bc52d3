// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Relay state sampling.
//!
//! The relay is the one node every peer dials, so its WireGuard session
//! table holds each peer's real reflexive `ip:port`. Republishing those
//! sockets through the controller is how cone-NAT peers discover one
//! another without a signaling exchange.

use crate::error::Result;
use crate::wg::{WgControl, WgSession};
use nexmesh_api_client::{ApiClient, UpdateDevice};
use nexmesh_wg_common::{split_host_port, Device, DeviceId};
use std::collections::HashMap;
use tracing::{debug, error, instrument};
use uuid::Uuid;

/// Pairs controller devices with the live endpoints the data plane saw.
/// Symmetric-NAT peers are skipped: their mapping is per-destination and
/// has no shared value. Sessions that have not converged report `(none)`
/// and are skipped as well.
pub fn plan_endpoint_updates(
	listing: &[Device],
	sessions: &[WgSession],
) -> Vec<(DeviceId, String)> {
	let mut by_key: HashMap<&str, &WgSession> = HashMap::new();
	for session in sessions {
		by_key.entry(session.public_key.as_str()).or_insert(session);
	}

	let mut updates = Vec::new();
	for device in listing {
		if device.symmetric_nat {
			debug!(endpoint = %device.local_ip, "skipping symmetric NAT node");
			continue;
		}
		let Some(session) = by_key.get(device.public_key.as_str()) else {
			continue;
		};
		if split_host_port(&session.endpoint).is_none() {
			debug!(
				public_key = %device.public_key,
				"session endpoint not yet established"
			);
			continue;
		}
		updates.push((device.id, session.endpoint.clone()));
	}
	updates
}

/// One sampler tick: dump the session table and overwrite each learned
/// peer's advertised endpoint on the controller. Individual update failures
/// are logged; the next tick retries.
#[instrument(skip_all, fields(dev = %dev))]
pub async fn sample_and_publish(
	client: &ApiClient,
	wg: &dyn WgControl,
	dev: &str,
	organization_id: Uuid,
) -> Result<()> {
	let listing = client.get_devices_in_organization(organization_id).await?;
	let sessions = match wg.dump_sessions(dev) {
		Ok(sessions) => sessions,
		Err(e) => {
			error!(error = %e, "error dumping wg sessions");
			return Ok(());
		}
	};

	for (device_id, endpoint) in plan_endpoint_updates(&listing, &sessions) {
		let update = UpdateDevice {
			local_ip: Some(endpoint.clone()),
			..Default::default()
		};
		if let Err(e) = client.update_device(device_id, &update).await {
			error!(error = %e, device = %device_id, "failed updating peer endpoint");
		} else {
			debug!(device = %device_id, %endpoint, "republished learned endpoint");
		}
	}

	Ok(())
}

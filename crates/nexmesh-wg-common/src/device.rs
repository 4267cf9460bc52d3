// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for DeviceId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for DeviceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for DeviceId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self(s.parse()?))
	}
}

/// The controller's authoritative record for one enrolled host.
///
/// The agent caches the last listing it saw and diffs by deep equality, so
/// every field participates in `PartialEq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
	pub id: DeviceId,
	pub user_id: String,
	pub organization_id: Uuid,
	pub public_key: String,
	/// Advertised `host:port` endpoint for dialing this device.
	pub local_ip: String,
	/// Overlay address, bare or CIDR form.
	pub tunnel_ip: String,
	#[serde(default)]
	pub allowed_ips: Vec<String>,
	#[serde(default)]
	pub child_prefix: Vec<String>,
	/// STUN-observed public address of the device.
	#[serde(default)]
	pub reflexive_ip4: String,
	/// LAN address, used for the same-NAT short circuit.
	#[serde(default)]
	pub endpoint_local_address_ip4: String,
	#[serde(default)]
	pub symmetric_nat: bool,
	#[serde(default)]
	pub relay: bool,
	#[serde(default)]
	pub hostname: String,
	/// The organization's overlay CIDR, replicated on the relay's record.
	#[serde(default)]
	pub organization_prefix: String,
}

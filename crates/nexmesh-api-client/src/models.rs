// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated user as reported by the controller. The agents require
/// membership in exactly one organization.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
	pub id: String,
	#[serde(default)]
	pub organizations: Vec<Uuid>,
}

/// Request body for enrolling this host as a device.
#[derive(Debug, Clone, Serialize)]
pub struct AddDevice {
	pub user_id: String,
	pub organization_id: Uuid,
	pub public_key: String,
	pub local_ip: String,
	pub tunnel_ip: String,
	pub child_prefix: Vec<String>,
	pub reflexive_ip4: String,
	pub endpoint_local_address_ip4: String,
	pub symmetric_nat: bool,
	pub hostname: String,
	pub relay: bool,
}

/// Mutable subset of a device record. Only the populated fields are sent,
/// so the relay sampler can overwrite `local_ip` alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateDevice {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub local_ip: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub child_prefix: Option<Vec<String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reflexive_ip4: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub endpoint_local_address_ip4: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub symmetric_nat: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub hostname: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn update_device_serializes_only_populated_fields() {
		let update = UpdateDevice {
			local_ip: Some("203.0.113.77:55512".to_string()),
			..Default::default()
		};
		let json = serde_json::to_string(&update).unwrap();
		assert_eq!(json, r#"{"local_ip":"203.0.113.77:55512"}"#);
	}

	#[test]
	fn user_tolerates_missing_organizations() {
		let user: User = serde_json::from_str(r#"{"id":"u-1"}"#).unwrap();
		assert!(user.organizations.is_empty());
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared constructors for unit tests.

use nexmesh_wg_common::{Device, DeviceId};
use uuid::Uuid;

pub fn sample_device(public_key: &str) -> Device {
	Device {
		id: DeviceId::new(),
		user_id: "user-1".to_string(),
		organization_id: Uuid::nil(),
		public_key: public_key.to_string(),
		local_ip: "203.0.113.5:51820".to_string(),
		tunnel_ip: "10.0.0.2/32".to_string(),
		allowed_ips: vec!["10.0.0.2/32".to_string()],
		child_prefix: vec![],
		reflexive_ip4: String::new(),
		endpoint_local_address_ip4: String::new(),
		symmetric_nat: false,
		relay: false,
		hostname: String::new(),
		organization_prefix: String::new(),
	}
}

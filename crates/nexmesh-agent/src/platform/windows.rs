// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{command_available, run_command, PlatformError, PlatformOps, Result};
use crate::config::Persona;
use std::net::Ipv4Addr;

const WG_CONF_DIR: &str = "C:/wireguard/";
const WG_CONFIG_FILE: &str = "C:/wireguard/wg0.conf";

pub struct WindowsPlatform;

impl PlatformOps for WindowsPlatform {
	fn default_tunnel_device(&self) -> &'static str {
		"wg0"
	}

	fn check_environment(&self, persona: Persona) -> Result<()> {
		if persona == Persona::Relay {
			return Err(PlatformError::Unsupported(
				"Windows nodes cannot be a relay, only Linux nodes".to_string(),
			));
		}
		if !command_available("wireguard") {
			return Err(PlatformError::Unsupported(
				"wireguard.exe not found, is wireguard installed?".to_string(),
			));
		}
		std::fs::create_dir_all(WG_CONF_DIR)?;
		Ok(())
	}

	fn interface_exists(&self, dev: &str) -> bool {
		match run_command("netsh", &["interface", "show", "interface", dev]) {
			Ok(out) => out.contains(dev),
			Err(_) => false,
		}
	}

	fn create_interface(&self, _dev: &str) -> Result<()> {
		run_command("wireguard", &["/installtunnelservice", WG_CONFIG_FILE])?;
		Ok(())
	}

	fn delete_interface(&self, dev: &str) -> Result<()> {
		run_command("wireguard", &["/uninstalltunnelservice", dev])?;
		Ok(())
	}

	fn interface_ipv4(&self, dev: &str) -> Option<Ipv4Addr> {
		let out = run_command("netsh", &["interface", "ip", "show", "addresses", dev]).ok()?;
		out.lines()
			.find(|l| l.trim_start().starts_with("IP Address:"))
			.and_then(|l| l.split(':').nth(1))
			.and_then(|ip| ip.trim().parse().ok())
	}

	fn assign_address(&self, dev: &str, address: &str) -> Result<()> {
		let host = nexmesh_wg_common::strip_cidr_suffix(address);
		run_command(
			"netsh",
			&[
				"interface", "ip", "set", "address", dev, "static", host,
			],
		)?;
		Ok(())
	}

	fn link_up(&self, _dev: &str) -> Result<()> {
		// the tunnel service brings the adapter up on install
		Ok(())
	}

	fn route_exists(&self, _prefix: &str) -> bool {
		false
	}

	fn add_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command("netsh", &["int", "ipv4", "add", "route", prefix, dev])?;
		Ok(())
	}

	fn del_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command("netsh", &["int", "ipv4", "del", "route", prefix, dev])?;
		Ok(())
	}

	fn enable_forwarding(&self) -> Result<()> {
		Err(PlatformError::Unsupported(
			"forwarding is relay-only and relays require Linux".to_string(),
		))
	}

	fn install_forward_rule(&self, _dev: &str) -> Result<()> {
		Err(PlatformError::Unsupported(
			"forwarding is relay-only and relays require Linux".to_string(),
		))
	}
}

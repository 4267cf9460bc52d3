// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{command_available, run_command, PlatformError, PlatformOps, Result};
use crate::config::Persona;
use std::net::Ipv4Addr;

const WG_CONF_DIR: &str = "/usr/local/etc/wireguard/";

pub struct DarwinPlatform;

impl PlatformOps for DarwinPlatform {
	fn default_tunnel_device(&self) -> &'static str {
		"utun8"
	}

	fn check_environment(&self, persona: Persona) -> Result<()> {
		if persona == Persona::Relay {
			return Err(PlatformError::Unsupported(
				"Darwin nodes cannot be a relay, only Linux nodes".to_string(),
			));
		}
		if !command_available("wg") {
			return Err(PlatformError::Unsupported(
				"wg command not found, is wireguard installed?".to_string(),
			));
		}
		if !command_available("wireguard-go") {
			return Err(PlatformError::Unsupported(
				"wireguard-go command not found, is wireguard installed?".to_string(),
			));
		}
		std::fs::create_dir_all(WG_CONF_DIR)?;
		Ok(())
	}

	fn interface_exists(&self, dev: &str) -> bool {
		run_command("ifconfig", &[dev]).is_ok()
	}

	fn create_interface(&self, dev: &str) -> Result<()> {
		// the userspace driver creates the utun device on launch
		run_command("wireguard-go", &[dev])?;
		Ok(())
	}

	fn delete_interface(&self, dev: &str) -> Result<()> {
		run_command("ifconfig", &[dev, "destroy"])?;
		Ok(())
	}

	fn interface_ipv4(&self, dev: &str) -> Option<Ipv4Addr> {
		let out = run_command("ifconfig", &[dev]).ok()?;
		let inet = out.split_whitespace().skip_while(|w| *w != "inet").nth(1)?;
		inet.parse().ok()
	}

	fn assign_address(&self, dev: &str, address: &str) -> Result<()> {
		let host = nexmesh_wg_common::strip_cidr_suffix(address);
		run_command("ifconfig", &[dev, "inet", host, host, "alias"])?;
		Ok(())
	}

	fn link_up(&self, dev: &str) -> Result<()> {
		run_command("ifconfig", &[dev, "up"])?;
		Ok(())
	}

	fn route_exists(&self, _prefix: &str) -> bool {
		false
	}

	fn add_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command(
			"route",
			&["-q", "-n", "add", "-inet", prefix, "-interface", dev],
		)?;
		Ok(())
	}

	fn del_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command(
			"route",
			&["-q", "-n", "delete", "-inet", prefix, "-interface", dev],
		)?;
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

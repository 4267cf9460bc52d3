// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use super::{command_available, run_command, PlatformError, PlatformOps, Result};
use crate::config::Persona;
use std::net::Ipv4Addr;
use tracing::debug;

const WG_CONF_DIR: &str = "/etc/wireguard/";

pub struct LinuxPlatform;

impl PlatformOps for LinuxPlatform {
	fn default_tunnel_device(&self) -> &'static str {
		"wg0"
	}

	fn check_environment(&self, _persona: Persona) -> Result<()> {
		if !command_available("wg") {
			return Err(PlatformError::Unsupported(
				"wg command not found, is wireguard installed?".to_string(),
			));
		}
		std::fs::create_dir_all(WG_CONF_DIR)?;
		Ok(())
	}

	fn interface_exists(&self, dev: &str) -> bool {
		std::path::Path::new("/sys/class/net").join(dev).exists()
	}

	fn create_interface(&self, dev: &str) -> Result<()> {
		run_command("ip", &["link", "add", dev, "type", "wireguard"])?;
		Ok(())
	}

	fn delete_interface(&self, dev: &str) -> Result<()> {
		run_command("ip", &["link", "del", dev])?;
		Ok(())
	}

	fn interface_ipv4(&self, dev: &str) -> Option<Ipv4Addr> {
		let out = run_command("ip", &["-4", "-o", "addr", "show", "dev", dev]).ok()?;
		// "2: wg0    inet 10.0.0.1/32 scope global wg0 ..."
		let inet = out.split_whitespace().skip_while(|w| *w != "inet").nth(1)?;
		inet.split('/').next()?.parse().ok()
	}

	fn assign_address(&self, dev: &str, address: &str) -> Result<()> {
		if let Err(e) = run_command("ip", &["address", "add", address, "dev", dev]) {
			// a stale lease can block the add; flush it and retry once
			debug!(error = %e, dev, "address add failed, flushing the stale address");
			if let Some(stale) = self.interface_ipv4(dev) {
				let stale = stale.to_string();
				let _ = run_command("ip", &["address", "del", stale.as_str(), "dev", dev]);
			}
			run_command("ip", &["address", "add", address, "dev", dev])?;
		}
		Ok(())
	}

	fn link_up(&self, dev: &str) -> Result<()> {
		run_command("ip", &["link", "set", dev, "up"])?;
		Ok(())
	}

	fn route_exists(&self, prefix: &str) -> bool {
		match run_command("ip", &["route", "show", prefix]) {
			Ok(out) => !out.trim().is_empty(),
			Err(_) => false,
		}
	}

	fn add_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command("ip", &["route", "add", prefix, "dev", dev])?;
		Ok(())
	}

	fn del_route(&self, prefix: &str, dev: &str) -> Result<()> {
		run_command("ip", &["route", "del", prefix, "dev", dev])?;
		Ok(())
	}

	fn enable_forwarding(&self) -> Result<()> {
		run_command("sysctl", &["-w", "net.ipv4.ip_forward=1"])?;
		Ok(())
	}

	fn install_forward_rule(&self, dev: &str) -> Result<()> {
		run_command("iptables", &["-A", "FORWARD", "-i", dev, "-j", "ACCEPT"])?;
		Ok(())
	}
}

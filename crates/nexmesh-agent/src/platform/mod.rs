// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! OS surface behind one capability trait.
//!
//! The reconciler is platform-agnostic; everything that touches links,
//! addresses, routes, or forwarding goes through [`PlatformOps`], with one
//! implementation per target OS.

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
mod windows;

use crate::config::Persona;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
	#[error("{command} failed: {detail}")]
	CommandFailed { command: String, detail: String },

	#[error("unsupported on this platform: {0}")]
	Unsupported(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

pub trait PlatformOps: Send + Sync {
	fn default_tunnel_device(&self) -> &'static str;

	/// Pre-start checks: required binaries on PATH, config directories,
	/// and whether this persona can run on this OS at all.
	fn check_environment(&self, persona: Persona) -> Result<()>;

	fn interface_exists(&self, dev: &str) -> bool;
	fn create_interface(&self, dev: &str) -> Result<()>;
	fn delete_interface(&self, dev: &str) -> Result<()>;
	fn interface_ipv4(&self, dev: &str) -> Option<Ipv4Addr>;
	fn assign_address(&self, dev: &str, address: &str) -> Result<()>;
	fn link_up(&self, dev: &str) -> Result<()>;

	fn route_exists(&self, prefix: &str) -> bool;
	fn add_route(&self, prefix: &str, dev: &str) -> Result<()>;
	fn del_route(&self, prefix: &str, dev: &str) -> Result<()>;

	/// Relay-only: turn the host into a forwarder for the overlay.
	fn enable_forwarding(&self) -> Result<()>;
	fn install_forward_rule(&self, dev: &str) -> Result<()>;

	/// Best-effort primary IPv4 of the host, used when neither the operator
	/// nor STUN supplied an endpoint address.
	fn discover_local_ipv4(&self) -> Result<Ipv4Addr> {
		let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
		socket.connect("8.8.8.8:80")?;
		match socket.local_addr()?.ip() {
			std::net::IpAddr::V4(ip) => Ok(ip),
			std::net::IpAddr::V6(_) => Err(PlatformError::Unsupported(
				"no IPv4 address on the default route".to_string(),
			)),
		}
	}
}

#[cfg(target_os = "linux")]
pub fn host_platform() -> Arc<dyn PlatformOps> {
	Arc::new(linux::LinuxPlatform)
}

#[cfg(target_os = "macos")]
pub fn host_platform() -> Arc<dyn PlatformOps> {
	Arc::new(darwin::DarwinPlatform)
}

#[cfg(target_os = "windows")]
pub fn host_platform() -> Arc<dyn PlatformOps> {
	Arc::new(windows::WindowsPlatform)
}

/// Runs a command, folding a non-zero exit into the error.
pub(crate) fn run_command(program: &str, args: &[&str]) -> Result<String> {
	let output = Command::new(program)
		.args(args)
		.output()
		.map_err(|e| PlatformError::CommandFailed {
			command: format!("{program} {}", args.join(" ")),
			detail: e.to_string(),
		})?;

	if !output.status.success() {
		return Err(PlatformError::CommandFailed {
			command: format!("{program} {}", args.join(" ")),
			detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
		});
	}

	Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// LookPath-style check for a binary on PATH.
pub(crate) fn command_available(binary: &str) -> bool {
	let Some(paths) = std::env::var_os("PATH") else {
		return false;
	};
	std::env::split_paths(&paths).any(|dir| {
		let candidate = dir.join(binary);
		candidate.is_file() || candidate.with_extension("exe").is_file()
	})
}

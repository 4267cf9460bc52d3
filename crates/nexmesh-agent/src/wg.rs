// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! WireGuard control through the system `wg` tool.
//!
//! The agent always applies peers incrementally: `wg set` adds or updates a
//! single peer and never replaces the full peer set.

use nexmesh_wg_common::WgPeerConfig;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum WgError {
	#[error("{command} failed: {detail}")]
	CommandFailed { command: String, detail: String },

	#[error("failed to parse wg dump output: {0}")]
	Dump(String),
}

pub type Result<T> = std::result::Result<T, WgError>;

/// One live session as observed by the data plane. The endpoint is what the
/// kernel learned from inbound traffic, i.e. the peer's reflexive socket.
#[derive(Debug, Clone, PartialEq)]
pub struct WgSession {
	pub public_key: String,
	pub endpoint: String,
	pub latest_handshake: u64,
}

pub trait WgControl: Send + Sync {
	/// `wg set <dev> listen-port <port> private-key <file>`.
	fn setup_device(&self, dev: &str, listen_port: u16, private_key_file: &Path) -> Result<()>;

	/// Adds or updates a single peer. Passive peers (configured on the
	/// relay side) carry no endpoint and learn it when the peer dials in.
	fn configure_peer(&self, dev: &str, peer: &WgPeerConfig, passive: bool) -> Result<()>;

	fn remove_peer(&self, dev: &str, public_key: &str) -> Result<()>;

	/// Dumps the live session table.
	fn dump_sessions(&self, dev: &str) -> Result<Vec<WgSession>>;
}

pub struct WgTool;

impl WgTool {
	fn run(&self, args: &[&str]) -> Result<String> {
		let output = std::process::Command::new("wg")
			.args(args)
			.output()
			.map_err(|e| WgError::CommandFailed {
				command: format!("wg {}", args.join(" ")),
				detail: e.to_string(),
			})?;
		if !output.status.success() {
			return Err(WgError::CommandFailed {
				command: format!("wg {}", args.join(" ")),
				detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		Ok(String::from_utf8_lossy(&output.stdout).to_string())
	}
}

impl WgControl for WgTool {
	fn setup_device(&self, dev: &str, listen_port: u16, private_key_file: &Path) -> Result<()> {
		let port = listen_port.to_string();
		let key_file = private_key_file.to_string_lossy();
		self.run(&[
			"set",
			dev,
			"listen-port",
			port.as_str(),
			"private-key",
			key_file.as_ref(),
		])?;
		Ok(())
	}

	fn configure_peer(&self, dev: &str, peer: &WgPeerConfig, passive: bool) -> Result<()> {
		let allowed = peer.allowed_ips.join(",");
		let mut args = vec!["set", dev, "peer", peer.public_key.as_str()];
		if !passive {
			args.extend_from_slice(&["endpoint", peer.endpoint.as_str()]);
		}
		args.extend_from_slice(&[
			"persistent-keepalive",
			peer.persistent_keepalive.as_str(),
			"allowed-ips",
			allowed.as_str(),
		]);
		self.run(&args)?;
		debug!(peer = %peer.public_key, passive, "configured wireguard peer");
		Ok(())
	}

	fn remove_peer(&self, dev: &str, public_key: &str) -> Result<()> {
		self.run(&["set", dev, "peer", public_key, "remove"])?;
		Ok(())
	}

	fn dump_sessions(&self, dev: &str) -> Result<Vec<WgSession>> {
		let out = self.run(&["show", dev, "dump"])?;
		parse_dump(&out)
	}
}

/// Parses `wg show <dev> dump`: one tab-separated interface line followed by
/// one line per peer. A peer with no live session reports `(none)` as its
/// endpoint; that is kept verbatim for the caller to filter.
pub fn parse_dump(out: &str) -> Result<Vec<WgSession>> {
	let mut sessions = Vec::new();
	for line in out.lines() {
		let fields: Vec<&str> = line.split('\t').collect();
		// the interface line has four fields, peer lines have eight
		if fields.len() < 8 {
			continue;
		}
		let latest_handshake = fields[4]
			.parse()
			.map_err(|_| WgError::Dump(format!("bad handshake timestamp: {}", fields[4])))?;
		sessions.push(WgSession {
			public_key: fields[0].to_string(),
			endpoint: fields[2].to_string(),
			latest_handshake,
		});
	}
	Ok(sessions)
}

#[cfg(test)]
mod tests {
	use super::*;

	const DUMP: &str = "\
privkeyAAAA=\tpubkeySELF=\t51820\toff
pubkeyK=\t(none)\t203.0.113.77:55512\t10.0.0.7/32\t1714000000\t1024\t2048\toff
pubkeyM=\t(none)\t(none)\t10.0.0.8/32\t0\t0\t0\toff
";

	#[test]
	fn parse_dump_extracts_peer_sessions() {
		let sessions = parse_dump(DUMP).unwrap();
		assert_eq!(sessions.len(), 2);

		assert_eq!(sessions[0].public_key, "pubkeyK=");
		assert_eq!(sessions[0].endpoint, "203.0.113.77:55512");
		assert_eq!(sessions[0].latest_handshake, 1714000000);

		assert_eq!(sessions[1].public_key, "pubkeyM=");
		assert_eq!(sessions[1].endpoint, "(none)");
	}

	#[test]
	fn parse_dump_skips_the_interface_line() {
		let sessions = parse_dump("privkey=\tpubkey=\t51820\toff\n").unwrap();
		assert!(sessions.is_empty());
	}

	#[test]
	fn parse_dump_tolerates_empty_output() {
		assert!(parse_dump("").unwrap().is_empty());
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::ConfigError;
use ipnet::IpNet;
use std::net::IpAddr;
use url::Url;

/// Which side of the mesh this agent plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persona {
	Peer,
	Relay,
}

/// Everything the agent needs from the CLI/environment, validated before
/// any network or interface work happens.
#[derive(Debug, Clone)]
pub struct AgentConfig {
	pub controller_url: Url,
	pub persona: Persona,
	pub username: Option<String>,
	pub password: Option<String>,
	/// 0 means pick a free UDP port at startup. The relay persona pins this
	/// to the well-known WireGuard port regardless.
	pub listen_port: u16,
	pub public_key: Option<String>,
	pub private_key: Option<String>,
	pub request_ip: Option<String>,
	pub local_endpoint_ip: Option<String>,
	pub stun: bool,
	pub insecure_skip_tls_verify: bool,
	pub child_prefix: Vec<String>,
	/// Peer persona only: provision as if behind symmetric NAT, forcing all
	/// traffic through the relay.
	pub relay_only: bool,
}

impl AgentConfig {
	/// Matrix checks of required information and constraints before the
	/// agent joins the mesh.
	pub fn validate(&mut self) -> Result<(), ConfigError> {
		if let Some(ip) = &self.local_endpoint_ip {
			if ip.parse::<IpAddr>().is_err() {
				return Err(ConfigError::InvalidIp {
					flag: "--local-endpoint-ip",
					value: ip.clone(),
				});
			}
		}
		if let Some(ip) = &self.request_ip {
			if ip.parse::<IpAddr>().is_err() {
				return Err(ConfigError::InvalidIp {
					flag: "--request-ip",
					value: ip.clone(),
				});
			}
		}
		for prefix in &self.child_prefix {
			if prefix.parse::<IpNet>().is_err() {
				return Err(ConfigError::InvalidCidr {
					flag: "--child-prefix",
					value: prefix.clone(),
				});
			}
		}

		if self.persona == Persona::Relay && self.request_ip.is_some() {
			// the relay's overlay address anchors the organization supernet,
			// so a requested address cannot be honored
			tracing::warn!(
				"request-ip is unsupported for a relay, a dynamic address will be used instead"
			);
			self.request_ip = None;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn base_config(persona: Persona) -> AgentConfig {
		AgentConfig {
			controller_url: "https://try.nexmesh.io".parse().unwrap(),
			persona,
			username: None,
			password: None,
			listen_port: 0,
			public_key: None,
			private_key: None,
			request_ip: None,
			local_endpoint_ip: None,
			stun: true,
			insecure_skip_tls_verify: false,
			child_prefix: vec![],
			relay_only: false,
		}
	}

	#[test]
	fn validate_accepts_defaults() {
		assert!(base_config(Persona::Peer).validate().is_ok());
	}

	#[test]
	fn validate_rejects_bad_endpoint_ip() {
		let mut config = base_config(Persona::Peer);
		config.local_endpoint_ip = Some("not-an-ip".to_string());
		assert!(config.validate().is_err());
	}

	#[test]
	fn validate_rejects_bad_child_prefix() {
		let mut config = base_config(Persona::Peer);
		config.child_prefix = vec!["172.16.0.0/33".to_string()];
		assert!(config.validate().is_err());
	}

	#[test]
	fn relay_drops_requested_ip() {
		let mut config = base_config(Persona::Relay);
		config.request_ip = Some("10.0.0.9".to_string());
		config.validate().unwrap();
		assert!(config.request_ip.is_none());
	}
}

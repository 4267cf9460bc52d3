// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	/// The host is missing a required binary or the persona is not
	/// supported on this OS. Reported pre-start, always fatal.
	#[error("environment error: {0}")]
	Environment(String),

	#[error("API error: {0}")]
	Api(#[from] nexmesh_api_client::ApiError),

	#[error("key material unavailable: {0}")]
	Keys(#[from] nexmesh_wg_common::KeyError),

	#[error("STUN error: {0}")]
	Stun(#[from] crate::stun::StunError),

	/// The tunnel interface could not be created or configured. The agent
	/// cannot make progress past this, so the reconcile loop treats it as
	/// fatal rather than retrying.
	#[error("interface setup error: {0}")]
	InterfaceSetup(String),

	#[error("registration error: {0}")]
	Registration(String),

	/// The token grant was rejected and cannot be refreshed in-loop.
	#[error("authorization failed: {0}")]
	Auth(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("invalid IP address in {flag}: {value}")]
	InvalidIp { flag: &'static str, value: String },

	#[error("invalid CIDR in {flag}: {value}")]
	InvalidCidr { flag: &'static str, value: String },

	#[error("{0}")]
	Other(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
	/// Errors the reconcile loop must not retry past.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			AgentError::InterfaceSetup(_) | AgentError::Environment(_) | AgentError::Config(_)
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn interface_setup_is_fatal() {
		assert!(AgentError::InterfaceSetup("ip link add failed".to_string()).is_fatal());
	}

	#[test]
	fn api_errors_are_retryable() {
		let err = AgentError::Api(nexmesh_api_client::ApiError::Api {
			status: 503,
			message: "unavailable".to_string(),
		});
		assert!(!err.is_fatal());
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Parser;
use nexmesh_agent::{Agent, AgentConfig, Persona};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Nexmesh agent that enrolls this host in a controller-managed mesh.
#[derive(Debug, Parser)]
#[command(name = "nexd", version)]
struct Cli {
	/// Controller URL, e.g. https://try.nexmesh.io
	controller: Url,

	/// Username for accessing the nexmesh service
	#[arg(long, env = "NEXD_USERNAME")]
	username: Option<String>,

	/// Password for accessing the nexmesh service
	#[arg(long, env = "NEXD_PASSWORD")]
	password: Option<String>,

	/// Port wireguard is to listen for incoming peers on (0 picks a free port)
	#[arg(long, env = "NEXD_LISTEN_PORT", default_value_t = 0)]
	listen_port: u16,

	/// Public key for the local host - the agent generates keys by default
	#[arg(long, env = "NEXD_PUB_KEY")]
	public_key: Option<String>,

	/// Private key for the local host (dev purposes only)
	#[arg(long, env = "NEXD_PRIVATE_KEY")]
	private_key: Option<String>,

	/// Request a specific overlay IP address from IPAM if available
	#[arg(long, env = "NEXD_REQUESTED_IP")]
	request_ip: Option<String>,

	/// Advertise this endpoint address instead of discovering one
	#[arg(long, env = "NEXD_LOCAL_ENDPOINT_IP")]
	local_endpoint_ip: Option<String>,

	/// Discover the public address for this host using STUN
	#[arg(long, env = "NEXD_STUN")]
	stun: bool,

	/// Do not check server certificates for validity. This makes your HTTPS connections insecure
	#[arg(long, env = "NEXD_INSECURE_SKIP_TLS_VERIFY")]
	insecure_skip_tls_verify: bool,

	/// CIDR behind this node to route through its tunnel (repeatable)
	#[arg(long = "child-prefix", env = "NEXD_CHILD_PREFIX")]
	child_prefix: Vec<String>,

	/// Provision as if behind symmetric NAT, forcing all traffic through the relay
	#[arg(long, env = "NEXD_RELAY_ONLY")]
	relay_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_env("NEXD_LOGLEVEL")
				.or_else(|_| EnvFilter::try_from_default_env())
				.unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	let config = AgentConfig {
		controller_url: cli.controller,
		persona: Persona::Peer,
		username: cli.username,
		password: cli.password,
		listen_port: cli.listen_port,
		public_key: cli.public_key,
		private_key: cli.private_key,
		request_ip: cli.request_ip,
		local_endpoint_ip: cli.local_endpoint_ip,
		stun: cli.stun,
		insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
		child_prefix: cli.child_prefix,
		relay_only: cli.relay_only,
	};

	let mut agent = Agent::new(config, env!("CARGO_PKG_VERSION").to_string())?;
	agent.run().await?;

	info!("nexd stopped");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cli_parses_flags_and_positional_controller() {
		let cli = Cli::parse_from([
			"nexd",
			"https://try.nexmesh.io",
			"--username",
			"alice",
			"--password",
			"secret",
			"--child-prefix",
			"172.16.1.0/24",
			"--child-prefix",
			"172.16.2.0/24",
			"--relay-only",
			"--stun",
		]);

		assert_eq!(cli.controller.host_str(), Some("try.nexmesh.io"));
		assert_eq!(cli.username.as_deref(), Some("alice"));
		assert_eq!(cli.listen_port, 0);
		assert_eq!(cli.child_prefix.len(), 2);
		assert!(cli.relay_only);
		assert!(cli.stun);
		assert!(!cli.insecure_skip_tls_verify);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Parser;
use nexmesh_agent::{Agent, AgentConfig, Persona};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

/// Nexmesh relay agent: the organization's hub and the fallback path for
/// peers that cannot hole-punch.
#[derive(Debug, Parser)]
#[command(name = "nexrelay", version)]
struct Cli {
	/// Controller URL, e.g. https://try.nexmesh.io
	controller: Url,

	/// Username for accessing the nexmesh service
	#[arg(long, env = "NEXRELAY_USERNAME")]
	username: Option<String>,

	/// Password for accessing the nexmesh service
	#[arg(long, env = "NEXRELAY_PASSWORD")]
	password: Option<String>,

	/// Port wireguard is to listen for incoming peers on
	#[arg(long, env = "NEXRELAY_LISTEN_PORT", default_value_t = 0)]
	listen_port: u16,

	/// Public key for the local host - the agent generates keys by default
	#[arg(long, env = "NEXRELAY_PUB_KEY")]
	public_key: Option<String>,

	/// Private key for the local host (dev purposes only)
	#[arg(long, env = "NEXRELAY_PRIVATE_KEY")]
	private_key: Option<String>,

	/// Request a specific overlay IP address from IPAM if available
	#[arg(long, env = "NEXRELAY_REQUESTED_IP")]
	request_ip: Option<String>,

	/// Advertise this endpoint address instead of discovering one
	#[arg(long, env = "NEXRELAY_LOCAL_ENDPOINT_IP")]
	local_endpoint_ip: Option<String>,

	/// Discover the public address for this host using STUN
	#[arg(long, env = "NEXRELAY_STUN")]
	stun: bool,

	/// Do not check server certificates for validity. This makes your HTTPS connections insecure
	#[arg(long, env = "NEXRELAY_INSECURE_SKIP_TLS_VERIFY")]
	insecure_skip_tls_verify: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_env("NEXRELAY_LOGLEVEL")
				.or_else(|_| EnvFilter::try_from_default_env())
				.unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	let config = AgentConfig {
		controller_url: cli.controller,
		persona: Persona::Relay,
		username: cli.username,
		password: cli.password,
		listen_port: cli.listen_port,
		public_key: cli.public_key,
		private_key: cli.private_key,
		request_ip: cli.request_ip,
		local_endpoint_ip: cli.local_endpoint_ip,
		stun: cli.stun,
		insecure_skip_tls_verify: cli.insecure_skip_tls_verify,
		child_prefix: vec![],
		relay_only: false,
	};

	let mut agent = Agent::new(config, env!("CARGO_PKG_VERSION").to_string())?;
	agent.run().await?;

	info!("nexrelay stopped");
	Ok(())
}

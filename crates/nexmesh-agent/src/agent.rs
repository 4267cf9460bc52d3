// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::{AgentConfig, Persona};
use crate::ctl::{AgentStatus, CtlServer, StatusSnapshot, NEXD_SOCKET_PATH, NEXRELAY_SOCKET_PATH};
use crate::error::{AgentError, Result};
use crate::keepalive;
use crate::periodic::run_periodically;
use crate::platform::{host_platform, PlatformOps};
use crate::policy::SelfInfo;
use crate::reconciler::Reconciler;
use crate::registration::register_device;
use crate::relay::sample_and_publish;
use crate::stun::{self, NatClassification};
use crate::wg::{WgControl, WgTool};
use nexmesh_api_client::{api_base_url, ApiClient, AuthGrant};
use nexmesh_wg_common::keys::{get_or_create_keypair, save_keypair};
use nexmesh_wg_common::{KeyFilePaths, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const RELAY_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

/// The WireGuard port every node can assume the relay listens on.
const WG_DEFAULT_PORT: u16 = 51820;

pub struct Agent {
	config: AgentConfig,
	version: String,
	platform: Arc<dyn PlatformOps>,
	wg: Arc<dyn WgControl>,
	tunnel_iface: String,
	status_tx: watch::Sender<StatusSnapshot>,
	status_rx: watch::Receiver<StatusSnapshot>,
	shutdown_tx: watch::Sender<bool>,
	shutdown_rx: watch::Receiver<bool>,
}

impl Agent {
	/// Validates the configuration and the host environment. Nothing has
	/// touched the network yet when this returns.
	pub fn new(mut config: AgentConfig, version: String) -> Result<Self> {
		let platform = host_platform();

		platform
			.check_environment(config.persona)
			.map_err(|e| AgentError::Environment(e.to_string()))?;
		config.validate()?;

		if config.persona == Persona::Relay {
			// every node must be able to reach the relay for state
			// distribution, so it sits on the well-known port
			config.listen_port = WG_DEFAULT_PORT;
		}

		let tunnel_iface = platform.default_tunnel_device().to_string();

		let (status_tx, status_rx) = watch::channel(StatusSnapshot::starting());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);

		Ok(Self {
			config,
			version,
			platform,
			wg: Arc::new(WgTool),
			tunnel_iface,
			status_tx,
			status_rx,
			shutdown_tx,
			shutdown_rx,
		})
	}

	pub fn shutdown(&self) {
		let _ = self.shutdown_tx.send(true);
	}

	fn set_status(&self, status: AgentStatus, message: &str) {
		let _ = self.status_tx.send(StatusSnapshot {
			status,
			message: message.to_string(),
		});
	}

	fn auth_grant(&self) -> Result<AuthGrant> {
		match (&self.config.username, &self.config.password) {
			(Some(username), Some(password)) => Ok(AuthGrant::Password {
				username: username.clone(),
				password: password.clone(),
			}),
			(Some(_), None) => Err(AgentError::Config(crate::error::ConfigError::Other(
				"--password is required when --username is set".to_string(),
			))),
			(None, _) => Ok(AuthGrant::DeviceFlow),
		}
	}

	#[instrument(skip(self), fields(persona = ?self.config.persona))]
	pub async fn run(&mut self) -> Result<()> {
		let socket_path = match self.config.persona {
			Persona::Peer => NEXD_SOCKET_PATH,
			Persona::Relay => NEXRELAY_SOCKET_PATH,
		};
		let ctl_handle = CtlServer::new(socket_path, self.version.clone(), self.status_rx.clone())
			.spawn(self.shutdown_rx.clone());

		// a leftover interface from a previous run would shadow this one
		if self.platform.interface_exists(&self.tunnel_iface) {
			if let Err(e) = self.platform.delete_interface(&self.tunnel_iface) {
				debug!(error = %e, dev = %self.tunnel_iface, "failed to delete existing interface");
			}
		}

		let listen_port = if self.config.listen_port == 0 {
			free_udp_port()?
		} else {
			self.config.listen_port
		};
		debug!(listen_port, "using wireguard listen port");

		let grant = self.auth_grant()?;
		let api_base = api_base_url(&self.config.controller_url)
			.map_err(AgentError::Api)?;

		let status_tx = self.status_tx.clone();
		let client = ApiClient::connect(
			api_base.clone(),
			grant.clone(),
			self.config.insecure_skip_tls_verify,
			move |msg| {
				let _ = status_tx.send(StatusSnapshot {
					status: AgentStatus::WaitingForAuth,
					message: msg.to_string(),
				});
			},
		)
		.await?;
		self.set_status(AgentStatus::Running, "");

		let key_paths = KeyFilePaths::platform_default();
		let keypair = self.load_keys(&key_paths).await?;

		let nat = self.classify_nat(listen_port).await;
		let symmetric_nat = match self.config.persona {
			// a relay is the anchor, never treated as symmetric
			Persona::Relay => false,
			Persona::Peer => {
				self.config.relay_only || nat.symmetric == Some(true)
			}
		};

		let registration = register_device(
			&client,
			&self.config,
			&keypair,
			&nat,
			symmetric_nat,
			listen_port,
			self.platform.as_ref(),
		)
		.await?;
		let organization_id = registration.organization_id;

		if self.config.persona == Persona::Relay {
			self.platform
				.enable_forwarding()
				.map_err(|e| AgentError::Environment(e.to_string()))?;
			if let Err(e) = self.platform.install_forward_rule(&self.tunnel_iface) {
				debug!(error = %e, "the relay forward rule was not added");
			}
		}

		let (keepalive_tx, keepalive_rx) = watch::channel(Vec::new());
		let self_info = SelfInfo {
			public_key: keypair.public.clone(),
			reflexive_ip4: nat
				.reflexive
				.map(|a| a.ip().to_string())
				.unwrap_or_default(),
			symmetric_nat,
			persona: self.config.persona,
		};
		let mut reconciler = Reconciler::new(
			self_info,
			self.tunnel_iface.clone(),
			listen_port,
			key_paths.private.clone(),
			self.platform.clone(),
			self.wg.clone(),
			keepalive_tx,
		);

		// the first cycle must succeed; after this, errors log and retry
		let listing = client.get_devices_in_organization(organization_id).await?;
		reconciler.reconcile(&listing, true)?;

		let client = Arc::new(RwLock::new(client));

		if self.config.persona == Persona::Peer {
			let shutdown_rx = self.shutdown_rx.clone();
			let mut keepalive_rx = keepalive_rx;
			tokio::spawn(run_periodically(
				shutdown_rx,
				KEEPALIVE_INTERVAL,
				move || {
					let targets = keepalive_rx.borrow_and_update().clone();
					async move {
						debug!("sending keepalive");
						keepalive::probe_peers(&targets).await;
					}
				},
			));
		}

		if self.config.persona == Persona::Relay {
			let shutdown_rx = self.shutdown_rx.clone();
			let client = client.clone();
			let wg = self.wg.clone();
			let dev = self.tunnel_iface.clone();
			tokio::spawn(run_periodically(
				shutdown_rx,
				RELAY_SAMPLE_INTERVAL,
				move || {
					let client = client.clone();
					let wg = wg.clone();
					let dev = dev.clone();
					async move {
						debug!("reconciling peers from relay state");
						let client = client.read().await;
						if let Err(e) =
							sample_and_publish(&client, wg.as_ref(), &dev, organization_id).await
						{
							error!(error = %e, "relay state sample failed");
						}
					}
				},
			));
		}

		let result = self
			.reconcile_loop(&client, &mut reconciler, organization_id, &grant, &api_base)
			.await;

		info!("shutting down");
		let _ = self.shutdown_tx.send(true);
		let _ = ctl_handle.await;

		result
	}

	/// The 5s poll-and-reconcile loop. Only interface setup errors and an
	/// unrecoverable token expiry propagate; everything else logs and the
	/// next cycle retries.
	async fn reconcile_loop(
		&self,
		client: &Arc<RwLock<ApiClient>>,
		reconciler: &mut Reconciler,
		organization_id: uuid::Uuid,
		grant: &AuthGrant,
		api_base: &url::Url,
	) -> Result<()> {
		let mut timer = tokio::time::interval(POLL_INTERVAL);
		timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
		let mut shutdown_rx = self.shutdown_rx.clone();

		loop {
			tokio::select! {
				biased;

				_ = shutdown_rx.changed() => {
					if *shutdown_rx.borrow() {
						return Ok(());
					}
				}

				_ = tokio::signal::ctrl_c() => {
					info!("interrupt received");
					return Ok(());
				}

				_ = timer.tick() => {
					let listing = {
						let client = client.read().await;
						client.get_devices_in_organization(organization_id).await
					};
					match listing {
						Ok(listing) => {
							if let Err(e) = reconciler.reconcile(&listing, false) {
								if e.is_fatal() {
									return Err(e);
								}
								error!(error = %e, "failed to reconcile peer state");
							}
						}
						Err(e) => {
							error!(error = %e, "failed to reconcile state with the controller");
							if e.is_invalid_grant() {
								self.recover_auth(client, grant, api_base).await?;
							}
						}
					}
				}
			}
		}
	}

	/// In-loop recovery from an expired token grant. Only the password
	/// grant can be re-issued unattended; a device-flow enrollment needs
	/// the operator, so it is fatal.
	async fn recover_auth(
		&self,
		client: &Arc<RwLock<ApiClient>>,
		grant: &AuthGrant,
		api_base: &url::Url,
	) -> Result<()> {
		if !matches!(grant, AuthGrant::Password { .. }) {
			return Err(AgentError::Auth(
				"the token grant has expired due to an extended period offline, please \
				 restart the agent for a one-time auth or login with --username --password \
				 to automatically reconnect"
					.to_string(),
			));
		}

		self.set_status(AgentStatus::WaitingForAuth, "re-authenticating with the controller");
		let status_tx = self.status_tx.clone();
		match ApiClient::connect(
			api_base.clone(),
			grant.clone(),
			self.config.insecure_skip_tls_verify,
			move |msg| {
				let _ = status_tx.send(StatusSnapshot {
					status: AgentStatus::WaitingForAuth,
					message: msg.to_string(),
				});
			},
		)
		.await
		{
			Ok(new_client) => {
				*client.write().await = new_client;
				self.set_status(AgentStatus::Running, "");
				info!("re-established a connection to the controller");
			}
			Err(e) => {
				warn!(error = %e, "failed to reconnect to the controller, retrying next cycle");
			}
		}
		Ok(())
	}

	async fn load_keys(&self, key_paths: &KeyFilePaths) -> Result<KeyPair> {
		match (&self.config.public_key, &self.config.private_key) {
			(Some(public), Some(private)) => {
				let pair = KeyPair {
					public: public.clone(),
					private: private.clone(),
				};
				// the data plane reads the private key from its file path
				save_keypair(key_paths, &pair).await?;
				Ok(pair)
			}
			_ => Ok(get_or_create_keypair(key_paths).await?),
		}
	}

	/// Both personas probe from the WireGuard listen port so the mapping
	/// matches the data plane's. The relay only needs its public address;
	/// classification is for peers.
	async fn classify_nat(&self, listen_port: u16) -> NatClassification {
		match self.config.persona {
			Persona::Peer => stun::classify_nat(listen_port).await,
			Persona::Relay => {
				if !self.config.stun {
					return NatClassification {
						reflexive: None,
						symmetric: None,
					};
				}
				match stun::binding_request(stun::STUN_SERVER_1, listen_port).await {
					Ok(addr) => NatClassification {
						reflexive: Some(addr),
						symmetric: Some(false),
					},
					Err(e) => {
						warn!(error = %e, "unable to determine the public facing address");
						NatClassification {
							reflexive: None,
							symmetric: None,
						}
					}
				}
			}
		}
	}
}

fn free_udp_port() -> Result<u16> {
	let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
	Ok(socket.local_addr()?.port())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn free_udp_port_returns_a_nonzero_port() {
		assert_ne!(free_udp_port().unwrap(), 0);
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{ApiError, Result};
use crate::models::{AddDevice, UpdateDevice, User};
use nexmesh_wg_common::{Device, DeviceId};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

/// Rewrites a controller URL to its API host: `https://try.nexmesh.io` is
/// served from `https://api.try.nexmesh.io` with an empty path.
pub fn api_base_url(controller: &Url) -> Result<Url> {
	let mut url = controller.clone();
	if let Some(host) = controller.host_str() {
		url.set_host(Some(&format!("api.{host}")))?;
	}
	url.set_path("");
	Ok(url)
}

/// How the agent obtains its bearer token.
#[derive(Debug, Clone)]
pub enum AuthGrant {
	/// OAuth password grant; recoverable in-loop when the token expires.
	Password { username: String, password: String },
	/// One-time device-authorization flow; the operator completes it in a
	/// browser and an expiry later is fatal.
	DeviceFlow,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
}

#[derive(Debug, Deserialize)]
struct DeviceStartResponse {
	device_code: String,
	verification_uri: String,
	user_code: String,
	#[serde(default = "default_poll_interval")]
	interval: u64,
}

fn default_poll_interval() -> u64 {
	5
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
	id: String,
}

#[derive(Debug)]
pub struct ApiClient {
	http: reqwest::Client,
	base_url: Url,
	token: String,
}

impl ApiClient {
	/// Authenticates against the controller and returns a ready client.
	/// `on_auth` is invoked with operator guidance while the device flow is
	/// pending, so the caller can surface a WaitingForAuth status.
	#[instrument(skip_all, fields(url = %base_url))]
	pub async fn connect<F>(
		base_url: Url,
		grant: AuthGrant,
		insecure_skip_tls_verify: bool,
		on_auth: F,
	) -> Result<Self>
	where
		F: Fn(&str),
	{
		let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
		if insecure_skip_tls_verify {
			builder = builder.danger_accept_invalid_certs(true);
		}
		let http = builder.build()?;

		let token = match &grant {
			AuthGrant::Password { username, password } => {
				password_grant(&http, &base_url, username, password).await?
			}
			AuthGrant::DeviceFlow => device_flow(&http, &base_url, &on_auth).await?,
		};

		info!("authenticated with the controller");

		Ok(Self {
			http,
			base_url,
			token,
		})
	}

	fn api_url(&self, path: &str) -> Result<Url> {
		Ok(self.base_url.join(path)?)
	}

	#[instrument(skip(self))]
	pub async fn get_current_user(&self) -> Result<User> {
		let url = self.api_url("/api/users/me")?;

		let response = self
			.http
			.get(url)
			.bearer_auth(&self.token)
			.send()
			.await?;

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = response.text().await.unwrap_or_default();
			return Err(ApiError::Api { status, message });
		}

		let user = response.json().await?;
		Ok(user)
	}

	#[instrument(skip(self), fields(org = %organization_id))]
	pub async fn get_devices_in_organization(
		&self,
		organization_id: Uuid,
	) -> Result<Vec<Device>> {
		let url = self.api_url(&format!("/api/organizations/{organization_id}/devices"))?;

		let response = self
			.http
			.get(url)
			.bearer_auth(&self.token)
			.send()
			.await?;

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = response.text().await.unwrap_or_default();
			return Err(ApiError::Api { status, message });
		}

		let devices = response.json().await?;
		Ok(devices)
	}

	/// Enrolls this host. A conflict means the public key is already
	/// registered; the existing device id is returned in the error so the
	/// caller can re-issue an update instead.
	#[instrument(skip(self, request), fields(hostname = %request.hostname))]
	pub async fn create_device(&self, request: &AddDevice) -> Result<Device> {
		let url = self.api_url("/api/devices")?;

		let response = self
			.http
			.post(url)
			.bearer_auth(&self.token)
			.json(request)
			.send()
			.await?;

		if response.status() == reqwest::StatusCode::CONFLICT {
			let body: ConflictBody = response.json().await?;
			return Err(ApiError::Conflict { id: body.id });
		}

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = response.text().await.unwrap_or_default();
			return Err(ApiError::Api { status, message });
		}

		let device = response.json().await?;
		Ok(device)
	}

	#[instrument(skip(self, request), fields(device = %device_id))]
	pub async fn update_device(
		&self,
		device_id: DeviceId,
		request: &UpdateDevice,
	) -> Result<Device> {
		let url = self.api_url(&format!("/api/devices/{device_id}"))?;

		let response = self
			.http
			.patch(url)
			.bearer_auth(&self.token)
			.json(request)
			.send()
			.await?;

		if !response.status().is_success() {
			let status = response.status().as_u16();
			let message = response.text().await.unwrap_or_default();
			return Err(ApiError::Api { status, message });
		}

		let device = response.json().await?;
		Ok(device)
	}
}

async fn password_grant(
	http: &reqwest::Client,
	base_url: &Url,
	username: &str,
	password: &str,
) -> Result<String> {
	let url = base_url.join("/api/token")?;

	debug!(%url, "requesting token via password grant");

	let response = http
		.post(url)
		.form(&[
			("grant_type", "password"),
			("username", username),
			("password", password),
		])
		.send()
		.await?;

	if !response.status().is_success() {
		let message = response.text().await.unwrap_or_default();
		return Err(ApiError::Auth(message));
	}

	let token: TokenResponse = response.json().await?;
	Ok(token.access_token)
}

async fn device_flow<F>(http: &reqwest::Client, base_url: &Url, on_auth: &F) -> Result<String>
where
	F: Fn(&str),
{
	let url = base_url.join("/api/device/start")?;

	let response = http.post(url).send().await?;
	if !response.status().is_success() {
		let message = response.text().await.unwrap_or_default();
		return Err(ApiError::Auth(message));
	}
	let start: DeviceStartResponse = response.json().await?;

	on_auth(&format!(
		"Your device must be registered with the controller.\nYour one-time code is: {}\nPlease open {} in your browser.",
		start.user_code, start.verification_uri
	));

	let token_url = base_url.join("/api/token")?;
	loop {
		tokio::time::sleep(Duration::from_secs(start.interval)).await;

		let response = http
			.post(token_url.clone())
			.form(&[
				("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
				("device_code", &start.device_code),
			])
			.send()
			.await?;

		if response.status().is_success() {
			let token: TokenResponse = response.json().await?;
			return Ok(token.access_token);
		}

		let message = response.text().await.unwrap_or_default();
		if message.contains("authorization_pending") || message.contains("slow_down") {
			debug!("device authorization still pending");
			continue;
		}
		return Err(ApiError::Auth(message));
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn api_base_url_rewrites_host_and_path() {
		let controller: Url = "https://try.nexmesh.io/some/path".parse().unwrap();
		let api = api_base_url(&controller).unwrap();
		assert_eq!(api.host_str(), Some("api.try.nexmesh.io"));
		assert_eq!(api.path(), "/");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::Engine;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument};

const WG_BINARY: &str = "wg";

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("failed to read key file: {0}")]
	Read(#[from] std::io::Error),

	#[error("invalid WireGuard key: {0}")]
	InvalidKey(String),

	#[error("key generation failed: {0}")]
	Generate(String),
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// Platform locations of the public/private key files.
#[derive(Debug, Clone)]
pub struct KeyFilePaths {
	pub public: PathBuf,
	pub private: PathBuf,
}

impl KeyFilePaths {
	#[cfg(target_os = "linux")]
	pub fn platform_default() -> Self {
		Self {
			public: PathBuf::from("/etc/wireguard/public.key"),
			private: PathBuf::from("/etc/wireguard/private.key"),
		}
	}

	#[cfg(target_os = "macos")]
	pub fn platform_default() -> Self {
		Self {
			public: PathBuf::from("/usr/local/etc/wireguard/public.key"),
			private: PathBuf::from("/usr/local/etc/wireguard/private.key"),
		}
	}

	#[cfg(target_os = "windows")]
	pub fn platform_default() -> Self {
		Self {
			public: PathBuf::from("C:/wireguard/public.key"),
			private: PathBuf::from("C:/wireguard/private.key"),
		}
	}
}

/// A WireGuard keypair in the textual form the `wg` tooling consumes.
#[derive(Debug, Clone)]
pub struct KeyPair {
	pub public: String,
	pub private: String,
}

/// Checks that `key` decodes to the 32 bytes of a Curve25519 key.
pub fn validate_wg_key(key: &str) -> Result<()> {
	let decoded = base64::engine::general_purpose::STANDARD
		.decode(key.trim())
		.map_err(|e| KeyError::InvalidKey(e.to_string()))?;
	if decoded.len() != 32 {
		return Err(KeyError::InvalidKey(format!(
			"expected 32 bytes, got {}",
			decoded.len()
		)));
	}
	Ok(())
}

/// Loads an existing keypair from disk, trimming trailing whitespace that
/// would otherwise upset the `wg` tooling.
#[instrument(skip_all, fields(public = %paths.public.display()))]
pub async fn load_keypair(paths: &KeyFilePaths) -> Result<KeyPair> {
	let public = read_key_file(&paths.public).await?;
	let private = read_key_file(&paths.private).await?;
	Ok(KeyPair { public, private })
}

async fn read_key_file(path: &Path) -> Result<String> {
	let content = fs::read_to_string(path).await?;
	Ok(content.trim().to_string())
}

/// Generates a new keypair with the WireGuard keygen utility and writes it
/// to disk (private key 0600, public key 0644). A failure here is the only
/// way key material can be unavailable; a missing file just means generate.
#[instrument(skip_all, fields(public = %paths.public.display()))]
pub async fn generate_keypair(paths: &KeyFilePaths) -> Result<KeyPair> {
	let genkey = Command::new(WG_BINARY)
		.arg("genkey")
		.output()
		.await
		.map_err(|e| KeyError::Generate(format!("wg genkey: {e}")))?;
	if !genkey.status.success() {
		return Err(KeyError::Generate(format!(
			"wg genkey exited with {}",
			genkey.status
		)));
	}
	let private = String::from_utf8_lossy(&genkey.stdout).trim().to_string();

	let mut pubkey = Command::new(WG_BINARY)
		.arg("pubkey")
		.stdin(Stdio::piped())
		.stdout(Stdio::piped())
		.spawn()
		.map_err(|e| KeyError::Generate(format!("wg pubkey: {e}")))?;
	if let Some(mut stdin) = pubkey.stdin.take() {
		stdin
			.write_all(private.as_bytes())
			.await
			.map_err(|e| KeyError::Generate(format!("wg pubkey stdin: {e}")))?;
	}
	let out = pubkey
		.wait_with_output()
		.await
		.map_err(|e| KeyError::Generate(format!("wg pubkey: {e}")))?;
	if !out.status.success() {
		return Err(KeyError::Generate(format!(
			"wg pubkey exited with {}",
			out.status
		)));
	}
	let public = String::from_utf8_lossy(&out.stdout).trim().to_string();

	write_key_file(&paths.public, &public, 0o644)
		.await
		.map_err(|e| KeyError::Generate(format!("writing public key: {e}")))?;
	write_key_file(&paths.private, &private, 0o600)
		.await
		.map_err(|e| KeyError::Generate(format!("writing private key: {e}")))?;

	info!("generated a new WireGuard keypair");

	Ok(KeyPair { public, private })
}

#[allow(unused_variables)]
async fn write_key_file(path: &Path, key: &str, mode: u32) -> std::io::Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).await?;
	}
	let content = format!("{key}\n");

	#[cfg(unix)]
	{
		use tokio::fs::OpenOptions;

		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.mode(mode)
			.open(path)
			.await?;
		file.write_all(content.as_bytes()).await?;
	}

	#[cfg(not(unix))]
	{
		fs::write(path, content).await?;
	}

	Ok(())
}

/// Writes an operator-supplied keypair to the platform key files so the
/// `wg` tooling can read the private key from its usual location.
#[instrument(skip_all, fields(public = %paths.public.display()))]
pub async fn save_keypair(paths: &KeyFilePaths, pair: &KeyPair) -> Result<()> {
	write_key_file(&paths.public, &pair.public, 0o644).await?;
	write_key_file(&paths.private, &pair.private, 0o600).await?;
	Ok(())
}

/// Locates the on-disk keypair, generating one when none exists.
#[instrument(skip_all)]
pub async fn get_or_create_keypair(paths: &KeyFilePaths) -> Result<KeyPair> {
	match load_keypair(paths).await {
		Ok(pair) => Ok(pair),
		Err(e) => {
			debug!(error = %e, "no existing keypair, generating a new one");
			generate_keypair(paths).await
		}
	}
}

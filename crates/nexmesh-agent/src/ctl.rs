// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Local admin RPC.
//!
//! A newline-delimited JSON-RPC endpoint on a unix-domain socket, queried
//! by the admin tool for the agent's version and status. The server only
//! ever reads a snapshot published by the reconciler, so the two never
//! contend on shared state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Socket the peer agent answers on.
pub const NEXD_SOCKET_PATH: &str = "/run/nexd.sock";
/// Socket the relay agent answers on.
pub const NEXRELAY_SOCKET_PATH: &str = "/run/nexrelay.sock";

/// Lifecycle of the agent as reported to the operator. Transitions are
/// monotone except `Running -> WaitingForAuth` on an auth refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
	Starting,
	WaitingForAuth,
	Running,
}

/// The value published by the agent and copied by the RPC server.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
	pub status: AgentStatus,
	pub message: String,
}

impl StatusSnapshot {
	pub fn starting() -> Self {
		Self {
			status: AgentStatus::Starting,
			message: String::new(),
		}
	}

	pub fn render(&self) -> String {
		let status = match self.status {
			AgentStatus::Starting => "Starting",
			AgentStatus::WaitingForAuth => "WaitingForAuth",
			AgentStatus::Running => "Running",
		};
		let mut out = format!("Status: {status}\n");
		if !self.message.is_empty() {
			out.push_str(&self.message);
		}
		out
	}
}

#[derive(Debug, Deserialize)]
struct Request {
	#[serde(default)]
	id: Value,
	method: String,
	#[serde(default)]
	#[allow(dead_code)]
	params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
	id: Value,
	result: Value,
	error: Value,
}

pub struct CtlServer {
	socket_path: PathBuf,
	version: String,
	status_rx: watch::Receiver<StatusSnapshot>,
}

impl CtlServer {
	pub fn new(
		socket_path: impl Into<PathBuf>,
		version: String,
		status_rx: watch::Receiver<StatusSnapshot>,
	) -> Self {
		Self {
			socket_path: socket_path.into(),
			version,
			status_rx,
		}
	}

	/// Runs the server until shutdown, restarting the accept loop on any
	/// error that was not caused by cancellation.
	pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			loop {
				match self.run(shutdown.clone()).await {
					Ok(()) => break,
					Err(e) => {
						error!(error = %e, "ctl interface error, restarting");
					}
				}
			}
		})
	}

	#[cfg(unix)]
	async fn run(&self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
		use tokio::net::UnixListener;

		// the socket is exclusively ours; a leftover file from a previous
		// run would block the bind
		if self.socket_path.exists() {
			std::fs::remove_file(&self.socket_path)?;
		}
		let listener = UnixListener::bind(&self.socket_path)?;
		debug!(path = %self.socket_path.display(), "ctl server listening");

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("stopping ctl server");
						let _ = std::fs::remove_file(&self.socket_path);
						return Ok(());
					}
				}
				accepted = listener.accept() => {
					match accepted {
						Ok((stream, _)) => {
							let version = self.version.clone();
							let status_rx = self.status_rx.clone();
							tokio::spawn(async move {
								handle_connection(stream, version, status_rx).await;
							});
						}
						Err(e) => {
							error!(error = %e, "error on accept");
							return Err(e);
						}
					}
				}
			}
		}
	}

	#[cfg(not(unix))]
	async fn run(&self, _shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
		tracing::warn!("ctl server is unsupported on this platform");
		Ok(())
	}
}

#[cfg(unix)]
async fn handle_connection(
	stream: tokio::net::UnixStream,
	version: String,
	status_rx: watch::Receiver<StatusSnapshot>,
) {
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

	let (reader, mut writer) = stream.into_split();
	let mut reader = BufReader::new(reader);
	let mut line = String::new();

	loop {
		line.clear();
		match reader.read_line(&mut line).await {
			Ok(0) => break,
			Ok(_) => {
				let trimmed = line.trim();
				if trimmed.is_empty() {
					continue;
				}
				let response = dispatch(trimmed, &version, &status_rx);
				let json = match serde_json::to_string(&response) {
					Ok(json) => json,
					Err(e) => {
						error!(error = %e, "failed to encode ctl response");
						break;
					}
				};
				if writer.write_all(json.as_bytes()).await.is_err() {
					break;
				}
				if writer.write_all(b"\n").await.is_err() {
					break;
				}
			}
			Err(e) => {
				debug!(error = %e, "ctl read error");
				break;
			}
		}
	}
}

#[cfg(unix)]
fn dispatch(line: &str, version: &str, status_rx: &watch::Receiver<StatusSnapshot>) -> Response {
	let request: Request = match serde_json::from_str(line) {
		Ok(request) => request,
		Err(e) => {
			return Response {
				id: Value::Null,
				result: Value::Null,
				error: Value::String(format!("invalid request: {e}")),
			};
		}
	};

	// method names may arrive service-qualified, e.g. "NexdCtl.Status"
	let method = request
		.method
		.rsplit('.')
		.next()
		.unwrap_or(request.method.as_str());

	match method {
		"Version" => Response {
			id: request.id,
			result: Value::String(version.to_string()),
			error: Value::Null,
		},
		"Status" => Response {
			id: request.id,
			result: Value::String(status_rx.borrow().render()),
			error: Value::Null,
		},
		other => Response {
			id: request.id,
			result: Value::Null,
			error: Value::String(format!("unknown method: {other}")),
		},
	}
}

#[cfg(all(test, unix))]
mod tests {
	use super::*;
	use tempfile::TempDir;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
	use tokio::net::UnixStream;

	async fn call(path: &std::path::Path, request: &str) -> Value {
		// the server binds asynchronously after spawn
		let stream = loop {
			match UnixStream::connect(path).await {
				Ok(stream) => break stream,
				Err(_) => tokio::time::sleep(std::time::Duration::from_millis(10)).await,
			}
		};
		let (reader, mut writer) = stream.into_split();
		writer.write_all(request.as_bytes()).await.unwrap();
		writer.write_all(b"\n").await.unwrap();

		let mut reader = BufReader::new(reader);
		let mut line = String::new();
		reader.read_line(&mut line).await.unwrap();
		serde_json::from_str(&line).unwrap()
	}

	#[tokio::test]
	async fn version_and_status_over_the_socket() {
		let dir = TempDir::new().unwrap();
		let socket = dir.path().join("nexd.sock");

		let (status_tx, status_rx) = watch::channel(StatusSnapshot::starting());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let server = CtlServer::new(&socket, "0.2.0".to_string(), status_rx);
		let handle = server.spawn(shutdown_rx);

		let response = call(&socket, r#"{"id":1,"method":"Version","params":null}"#).await;
		assert_eq!(response["result"], "0.2.0");
		assert_eq!(response["error"], Value::Null);

		status_tx
			.send(StatusSnapshot {
				status: AgentStatus::Running,
				message: String::new(),
			})
			.unwrap();
		let response =
			call(&socket, r#"{"id":2,"method":"NexdCtl.Status","params":null}"#).await;
		assert_eq!(response["result"], "Status: Running\n");

		let response = call(&socket, r#"{"id":3,"method":"Reboot","params":null}"#).await;
		assert!(response["error"].as_str().unwrap().contains("unknown method"));

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
		assert!(!socket.exists());
	}

	#[tokio::test]
	async fn stale_socket_file_is_replaced() {
		let dir = TempDir::new().unwrap();
		let socket = dir.path().join("stale.sock");
		std::fs::write(&socket, "stale").unwrap();

		let (_status_tx, status_rx) = watch::channel(StatusSnapshot::starting());
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let server = CtlServer::new(&socket, "0.2.0".to_string(), status_rx);
		let handle = server.spawn(shutdown_rx);

		let response = call(&socket, r#"{"id":1,"method":"Version"}"#).await;
		assert_eq!(response["result"], "0.2.0");

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}

	#[test]
	fn status_render_includes_the_message() {
		let snapshot = StatusSnapshot {
			status: AgentStatus::WaitingForAuth,
			message: "open https://example.test in your browser".to_string(),
		};
		assert_eq!(
			snapshot.render(),
			"Status: WaitingForAuth\nopen https://example.test in your browser"
		);
	}
}

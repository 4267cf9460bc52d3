// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
	#[error("HTTP request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("URL parse error: {0}")]
	Url(#[from] url::ParseError),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	/// The controller already holds a device with this public key; the
	/// existing device id is carried so the caller can switch to an update.
	#[error("device already exists with id {id}")]
	Conflict { id: String },

	/// The token grant was rejected. The message keeps the controller's
	/// wording (`invalid_grant`) so the agent loop can match on it.
	#[error("authorization failed: {0}")]
	Auth(String),

	#[error("API error: {status} - {message}")]
	Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
	/// True when the error indicates an expired or revoked OAuth grant.
	pub fn is_invalid_grant(&self) -> bool {
		match self {
			ApiError::Auth(msg) => msg.contains("invalid_grant"),
			ApiError::Api { message, .. } => message.contains("invalid_grant"),
			_ => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn invalid_grant_detection() {
		let err = ApiError::Auth("invalid_grant: token expired".to_string());
		assert!(err.is_invalid_grant());

		let err = ApiError::Api {
			status: 401,
			message: "invalid_grant".to_string(),
		};
		assert!(err.is_invalid_grant());

		let err = ApiError::Api {
			status: 500,
			message: "internal error".to_string(),
		};
		assert!(!err.is_invalid_grant());
	}
}

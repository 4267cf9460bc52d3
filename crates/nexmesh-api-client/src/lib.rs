// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP client for the nexmesh controller.
//!
//! The controller owns the authoritative device list; the agents only ever
//! need four operations from it (current user, list devices in an
//! organization, create device, update device) plus a bearer token obtained
//! through the OAuth password grant or the device-authorization flow.

pub mod client;
pub mod error;
pub mod models;

pub use client::{api_base_url, ApiClient, AuthGrant};
pub use error::{ApiError, Result};
pub use models::{AddDevice, UpdateDevice, User};

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared WireGuard types for the nexmesh agents.
//!
//! This crate holds everything both the peer agent (`nexd`) and the relay
//! agent (`nexrelay`) agree on: the on-disk keypair store, the controller's
//! device record, and the derived per-peer WireGuard configuration.

pub mod device;
pub mod keys;
pub mod peer;

pub use device::{Device, DeviceId};
pub use keys::{KeyError, KeyFilePaths, KeyPair};
pub use peer::{split_host_port, strip_cidr_suffix, WgPeerConfig};

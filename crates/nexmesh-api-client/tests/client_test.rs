// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

// Integration tests for `ApiClient` using wiremock.

use nexmesh_api_client::{ApiClient, ApiError, AuthGrant, UpdateDevice};
use nexmesh_wg_common::DeviceId;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup() -> (MockServer, ApiClient) {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/api/token"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"access_token": "test-token"
		})))
		.mount(&server)
		.await;

	let client = ApiClient::connect(
		server.uri().parse().unwrap(),
		AuthGrant::Password {
			username: "alice".to_string(),
			password: "secret".to_string(),
		},
		false,
		|_| {},
	)
	.await
	.unwrap();

	(server, client)
}

fn device_json(id: Uuid, public_key: &str) -> serde_json::Value {
	json!({
		"id": id,
		"user_id": "user-1",
		"organization_id": Uuid::new_v4(),
		"public_key": public_key,
		"local_ip": "203.0.113.5:51820",
		"tunnel_ip": "10.0.0.2/32",
		"allowed_ips": ["10.0.0.2/32"],
		"child_prefix": [],
		"reflexive_ip4": "203.0.113.5",
		"endpoint_local_address_ip4": "192.168.1.10",
		"symmetric_nat": false,
		"relay": false,
		"hostname": "node-b",
		"organization_prefix": ""
	})
}

#[tokio::test]
async fn get_current_user_parses_organizations() {
	let (server, client) = setup().await;

	let org = Uuid::new_v4();
	Mock::given(method("GET"))
		.and(path("/api/users/me"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "user-1",
			"organizations": [org]
		})))
		.mount(&server)
		.await;

	let user = client.get_current_user().await.unwrap();
	assert_eq!(user.id, "user-1");
	assert_eq!(user.organizations, vec![org]);
}

#[tokio::test]
async fn list_devices_in_organization() {
	let (server, client) = setup().await;

	let org = Uuid::new_v4();
	let device_id = Uuid::new_v4();
	Mock::given(method("GET"))
		.and(path(format!("/api/organizations/{org}/devices")))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(json!([device_json(device_id, "pk-b")])),
		)
		.mount(&server)
		.await;

	let devices = client.get_devices_in_organization(org).await.unwrap();
	assert_eq!(devices.len(), 1);
	assert_eq!(devices[0].id, DeviceId::from_uuid(device_id));
	assert_eq!(devices[0].public_key, "pk-b");
}

#[tokio::test]
async fn create_device_conflict_carries_existing_id() {
	let (server, client) = setup().await;

	let existing = Uuid::new_v4();
	Mock::given(method("POST"))
		.and(path("/api/devices"))
		.respond_with(ResponseTemplate::new(409).set_body_json(json!({ "id": existing })))
		.mount(&server)
		.await;

	let request = nexmesh_api_client::AddDevice {
		user_id: "user-1".to_string(),
		organization_id: Uuid::new_v4(),
		public_key: "pk-a".to_string(),
		local_ip: "198.51.100.2:51820".to_string(),
		tunnel_ip: String::new(),
		child_prefix: vec![],
		reflexive_ip4: String::new(),
		endpoint_local_address_ip4: "198.51.100.2".to_string(),
		symmetric_nat: false,
		hostname: "node-a".to_string(),
		relay: false,
	};

	let err = client.create_device(&request).await.unwrap_err();
	match err {
		ApiError::Conflict { id } => assert_eq!(id, existing.to_string()),
		other => panic!("expected Conflict, got {other:?}"),
	}
}

#[tokio::test]
async fn update_device_sends_only_populated_fields() {
	let (server, client) = setup().await;

	let device_id = Uuid::new_v4();
	Mock::given(method("PATCH"))
		.and(path(format!("/api/devices/{device_id}")))
		.and(body_json(json!({ "local_ip": "203.0.113.77:55512" })))
		.respond_with(
			ResponseTemplate::new(200).set_body_json(device_json(device_id, "pk-k")),
		)
		.mount(&server)
		.await;

	let update = UpdateDevice {
		local_ip: Some("203.0.113.77:55512".to_string()),
		..Default::default()
	};
	let device = client
		.update_device(DeviceId::from_uuid(device_id), &update)
		.await
		.unwrap();
	assert_eq!(device.public_key, "pk-k");
}

#[tokio::test]
async fn rejected_password_grant_surfaces_invalid_grant() {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/api/token"))
		.respond_with(
			ResponseTemplate::new(401).set_body_string(r#"{"error":"invalid_grant"}"#),
		)
		.mount(&server)
		.await;

	let err = ApiClient::connect(
		server.uri().parse().unwrap(),
		AuthGrant::Password {
			username: "alice".to_string(),
			password: "stale".to_string(),
		},
		false,
		|_| {},
	)
	.await
	.unwrap_err();

	assert!(err.is_invalid_grant());
}

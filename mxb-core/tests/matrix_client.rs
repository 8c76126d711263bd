//! Wire client against a mocked homeserver.

mod common;

use std::time::{Duration, Instant};

use httpmock::prelude::*;
use mxb_core::config::{LimitConfig, RateLimitConfig};
use mxb_core::matrix::{
    CreateRoomOptions, FileAttachment, GuestAccess, HistoryVisibility, ItemOutcome, MessageRequest,
    SendItem,
};
use mxb_core::{BridgeError, GhostProfile};
use serde_json::json;

use common::{client, client_with_limits, mapper};

#[tokio::test]
async fn test_reregistering_existing_ghost_succeeds() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/_matrix/client/v3/register")
                .header("authorization", "Bearer as-token")
                .json_body_partial(r#"{"type": "m.login.application_service", "username": "_mattermost_u1"}"#);
            then.status(400)
                .json_body(json!({"errcode": "M_USER_IN_USE", "error": "User ID already taken."}));
        })
        .await;
    let display_name = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path("/_matrix/client/v3/profile/@_mattermost_u1:example.com/displayname")
                .json_body(json!({"displayname": "User One"}));
            then.status(200).json_body(json!({}));
        })
        .await;

    let creation = client(&server)
        .create_ghost_user("_mattermost_u1", Some("User One"), None)
        .await
        .unwrap();
    assert_eq!(creation.user_id, "@_mattermost_u1:example.com");
    assert!(creation.already_existed);
    assert!(creation.display_name_error.is_none());
    register.assert_async().await;
    display_name.assert_async().await;
}

#[tokio::test]
async fn test_mapper_registers_ghost_once() {
    let server = MockServer::start_async().await;
    let register = server
        .mock_async(|when, then| {
            when.method(POST).path("/_matrix/client/v3/register");
            then.status(200)
                .json_body(json!({"user_id": "@_mattermost_u2:example.com"}));
        })
        .await;

    let (mapper, _) = mapper(&server);
    let profile = GhostProfile::new("u2");
    let first = mapper.get_or_create_ghost_user(&profile).await.unwrap();
    let second = mapper.get_or_create_ghost_user(&profile).await.unwrap();
    assert_eq!(first, "@_mattermost_u2:example.com");
    assert_eq!(first, second);
    register.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_send_validation_happens_before_network() {
    let server = MockServer::start_async().await;
    let any = server
        .mock_async(|when, then| {
            when.path_contains("/_matrix/");
            then.status(500);
        })
        .await;
    let client = client(&server);

    let err = client
        .send_message(&MessageRequest::new("!room:example.com", "@_mattermost_u1:example.com"))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("no message content or files to send"));

    let err = client
        .send_message(&MessageRequest::new("!room:example.com", "").with_text("hi"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ghost_user_id is required"));

    let err = client
        .send_message(
            &MessageRequest::new("!room:example.com", "@_mattermost_u1:example.com")
                .with_text("hi")
                .in_thread("$..%2e"),
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(any.hits_async().await, 0);
}

#[tokio::test]
async fn test_text_and_files_send_replies_and_metadata() {
    let server = MockServer::start_async().await;
    let upload = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/_matrix/media/v3/upload")
                .query_param("filename", "cat.png")
                .header("content-type", "image/png");
            then.status(200)
                .json_body(json!({"content_uri": "mxc://example.com/cat"}));
        })
        .await;
    let text = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains("/_matrix/client/v3/rooms/!room:example.com/send/m.room.message/")
                .query_param("user_id", "@_mattermost_u1:example.com")
                .json_body_partial(r#"{"msgtype": "m.text", "body": "look", "mattermost_post_id": "p1"}"#);
            then.status(200).json_body(json!({"event_id": "$text"}));
        })
        .await;
    let file = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains("/send/m.room.message/")
                .json_body_partial(
                    r#"{"msgtype": "m.image", "url": "mxc://example.com/cat",
                        "m.relates_to": {"m.in_reply_to": {"event_id": "$text"}}}"#,
                );
            then.status(200).json_body(json!({"event_id": "$file"}));
        })
        .await;
    let metadata = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains("/send/org.mxb.file_attachments/")
                .json_body_partial(
                    r#"{"attachments": ["$file"],
                        "m.relates_to": {"rel_type": "m.reference", "event_id": "$text"}}"#,
                );
            then.status(200).json_body(json!({"event_id": "$meta"}));
        })
        .await;

    let request = MessageRequest::new("!room:example.com", "@_mattermost_u1:example.com")
        .with_text("look")
        .with_file(FileAttachment::new("cat.png", "image/png", vec![1u8, 2, 3]))
        .with_metadata("mattermost_post_id", "p1");
    let outcome = client(&server).send_message(&request).await.unwrap();

    assert_eq!(outcome.primary_event_id, "$text");
    assert!(outcome.all_sent());
    assert_eq!(
        outcome.items,
        vec![
            ItemOutcome::Sent {
                item: SendItem::Text,
                event_id: "$text".into()
            },
            ItemOutcome::Sent {
                item: SendItem::File {
                    filename: "cat.png".into()
                },
                event_id: "$file".into()
            },
            ItemOutcome::Sent {
                item: SendItem::AttachmentMetadata,
                event_id: "$meta".into()
            },
        ]
    );
    upload.assert_async().await;
    text.assert_async().await;
    file.assert_async().await;
    metadata.assert_async().await;
}

#[tokio::test]
async fn test_failed_file_is_reported_not_fatal() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/_matrix/media/v3/upload");
            then.status(500)
                .json_body(json!({"errcode": "M_UNKNOWN", "error": "disk full"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path_contains("/send/m.room.message/");
            then.status(200).json_body(json!({"event_id": "$text"}));
        })
        .await;

    let request = MessageRequest::new("!room:example.com", "@_mattermost_u1:example.com")
        .with_text("look")
        .with_file(FileAttachment::new("a.txt", "text/plain", "abc"));
    let outcome = client(&server).send_message(&request).await.unwrap();

    assert_eq!(outcome.primary_event_id, "$text");
    assert!(!outcome.all_sent());
    assert_eq!(outcome.failures().count(), 1);
    // no metadata event when no file made it
    assert_eq!(outcome.items.len(), 2);
}

#[tokio::test]
async fn test_fourth_send_waits_for_refill() {
    let server = MockServer::start_async().await;
    let sends = server
        .mock_async(|when, then| {
            when.method(PUT).path_contains("/send/m.room.message/");
            then.status(200).json_body(json!({"event_id": "$e"}));
        })
        .await;

    let limits = RateLimitConfig {
        message: LimitConfig::token_bucket(2.0, 1.0, 3),
        ..RateLimitConfig::unlimited()
    };
    let client = client_with_limits(&server, &limits);
    let request = MessageRequest::new("!room:example.com", "@_mattermost_u1:example.com")
        .with_text("tick");

    let start = Instant::now();
    for _ in 0..4 {
        client.send_message(&request).await.unwrap();
    }
    let elapsed = start.elapsed();

    // burst covers three; the fourth needs half a second of refill
    assert!(elapsed >= Duration::from_millis(480), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "elapsed {:?}", elapsed);
    sends.assert_hits_async(4).await;
}

#[tokio::test]
async fn test_homeserver_rate_limit_is_typed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(PUT).path_contains("/send/");
            then.status(429).json_body(
                json!({"errcode": "M_LIMIT_EXCEEDED", "error": "Too many", "retry_after_ms": 1500}),
            );
        })
        .await;

    let err = client(&server)
        .send_event("!room:example.com", None, "m.room.message", &json!({"body": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::RateLimited {
            retry_after_ms: Some(1500)
        }
    ));
}

#[tokio::test]
async fn test_invalid_mxc_uris() {
    let server = MockServer::start_async().await;
    let client = client(&server);

    for uri in ["https://example.com/media", "mxc://example.com", "mxc:///id", "mxc://example.com/"] {
        let err = client.download_media(uri).await.unwrap_err();
        assert!(err.is_validation(), "{}", uri);
        assert!(
            err.to_string().contains("invalid Matrix MXC URI format"),
            "{}: {}",
            uri,
            err
        );
    }
}

#[tokio::test]
async fn test_download_falls_back_to_legacy_endpoint() {
    let server = MockServer::start_async().await;
    let authenticated = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/_matrix/client/v1/media/download/example.com/abc");
            then.status(404)
                .json_body(json!({"errcode": "M_UNRECOGNIZED", "error": "Unrecognized"}));
        })
        .await;
    let legacy = server
        .mock_async(|when, then| {
            when.method(GET).path("/_matrix/media/v3/download/example.com/abc");
            then.status(200)
                .header("content-type", "image/png")
                .body([137u8, 80, 78, 71]);
        })
        .await;

    let download = client(&server)
        .download_media("mxc://example.com/abc")
        .await
        .unwrap();
    assert_eq!(download.data.as_ref(), &[137u8, 80, 78, 71]);
    assert_eq!(download.content_type.as_deref(), Some("image/png"));
    assert_eq!(download.source, "_matrix/media/v3/download");
    authenticated.assert_async().await;
    legacy.assert_async().await;
}

#[tokio::test]
async fn test_download_rejects_json_bodies() {
    let server = MockServer::start_async().await;
    let endpoints = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/download/example.com/abc");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"errcode": "M_NOT_FOUND"}"#);
        })
        .await;

    let result = client(&server).download_media("mxc://example.com/abc").await;
    assert!(result.is_err());
    endpoints.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_download_rejects_text_and_untyped_bodies() {
    let server = MockServer::start_async().await;
    let text = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/download/example.com/txt");
            then.status(200)
                .header("content-type", "text/plain")
                .body("Not Found");
        })
        .await;
    let untyped = server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/download/example.com/raw");
            then.status(200).body([1u8, 2, 3]);
        })
        .await;

    let client = client(&server);
    assert!(client.download_media("mxc://example.com/txt").await.is_err());
    assert!(client.download_media("mxc://example.com/raw").await.is_err());
    text.assert_hits_async(3).await;
    untyped.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_download_size_limit() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/download/example.com/big");
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(vec![0u8; 64]);
        })
        .await;

    let config = mxb_core::config::MatrixConfig::new(server.base_url(), "as-token")
        .with_max_download_bytes(16);
    let client =
        mxb_core::MatrixClient::new(config, &RateLimitConfig::unlimited(), "example.com").unwrap();
    let err = client
        .download_media("mxc://example.com/big")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("download limit"), "{}", err);
}

#[tokio::test]
async fn test_room_ids_pass_through_alias_resolution() {
    let server = MockServer::start_async().await;
    let any = server
        .mock_async(|when, then| {
            when.path_contains("/directory/");
            then.status(500);
        })
        .await;
    let client = client(&server);

    assert_eq!(
        client.resolve_room_alias("!room:example.com").await.unwrap(),
        "!room:example.com"
    );
    assert_eq!(client.resolve_room_alias("plainname").await.unwrap(), "plainname");
    assert_eq!(any.hits_async().await, 0);
}

#[tokio::test]
async fn test_alias_resolution() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path_contains("/_matrix/client/v3/directory/room/")
                .path_contains("town-square:example.com");
            then.status(200)
                .json_body(json!({"room_id": "!town:example.com", "servers": ["example.com"]}));
        })
        .await;

    let room = client(&server)
        .resolve_room_alias("#town-square:example.com")
        .await
        .unwrap();
    assert_eq!(room, "!town:example.com");
}

#[tokio::test]
async fn test_create_room_carries_channel_state_and_filter_alias() {
    let server = MockServer::start_async().await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/_matrix/client/v3/createRoom")
                .json_body_partial(
                    r#"{"room_alias_name": "_mattermost_town", "visibility": "private"}"#,
                )
                .body_contains("org.mxb.channel")
                .body_contains(r#""channel_id":"c1""#)
                .body_contains(r#""history_visibility":"world_readable""#)
                .body_contains(r#""guest_access":"can_join""#);
            then.status(200).json_body(json!({"room_id": "!new:example.com"}));
        })
        .await;
    let alias = server
        .mock_async(|when, then| {
            when.method(PUT)
                .path_contains("/_matrix/client/v3/directory/room/")
                .path_contains("_mattermost_bridge_town:example.com")
                .json_body(json!({"room_id": "!new:example.com"}));
            then.status(409)
                .json_body(json!({"errcode": "M_UNKNOWN", "error": "Room alias already exists"}));
        })
        .await;

    let (mapper, _) = mapper(&server);
    let options = CreateRoomOptions::default()
        .with_name("Town Square")
        .with_alias("town")
        .with_history_visibility(HistoryVisibility::WorldReadable)
        .with_guest_access(GuestAccess::CanJoin)
        .with_filter_alias();
    let room = mapper.ensure_room_for_channel("c1", options).await.unwrap();
    assert_eq!(room, "!new:example.com");
    assert_eq!(
        mapper.channel_for_room("!new:example.com").await.unwrap().as_deref(),
        Some("c1")
    );

    // mapped now, so no second room
    let again = mapper
        .ensure_room_for_channel("c1", CreateRoomOptions::default())
        .await
        .unwrap();
    assert_eq!(again, room);
    create.assert_hits_async(1).await;
    alias.assert_hits_async(1).await;
}

#[tokio::test]
async fn test_channel_lookup_falls_back_to_room_state() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/_matrix/client/v3/rooms/!bridged:example.com/state/org.mxb.channel");
            then.status(200).json_body(json!({"channel_id": "c9"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/_matrix/client/v3/rooms/!plain:example.com/state/org.mxb.channel");
            then.status(404)
                .json_body(json!({"errcode": "M_NOT_FOUND", "error": "Event not found"}));
        })
        .await;

    let (mapper, store) = mapper(&server);
    assert_eq!(
        mapper.channel_for_room("!bridged:example.com").await.unwrap().as_deref(),
        Some("c9")
    );
    assert_eq!(mapper.channel_for_room("!plain:example.com").await.unwrap(), None);
    // the fallback never writes
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_server_version_falls_back_to_client_versions() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/_matrix/federation/v1/version");
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/_matrix/client/versions");
            then.status(200)
                .json_body(json!({"versions": ["r0.6.1", "v1.1", "v1.9"]}));
        })
        .await;

    let version = client(&server).get_server_version().await.unwrap();
    assert_eq!(version.name, "unknown");
    assert_eq!(version.version, "v1.9");
}

#[tokio::test]
async fn test_permission_probe() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path_contains("/_matrix/client/v3/profile/@_mattermost_permission_probe_");
            then.status(403)
                .json_body(json!({"errcode": "M_FORBIDDEN", "error": "Application service cannot masquerade"}));
        })
        .await;

    let err = client(&server)
        .test_appservice_permissions()
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Config(_)));
}

#[tokio::test]
async fn test_shutdown_refuses_new_calls() {
    let server = MockServer::start_async().await;
    let client = client(&server);
    client.shutdown();
    let err = client.test_connection().await.unwrap_err();
    assert!(matches!(err, BridgeError::Cancelled(_)));
}

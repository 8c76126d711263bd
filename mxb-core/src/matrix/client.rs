//! # Matrix Application-Service Client
//!
//! All calls authenticate with the application-service token. Calls made on
//! behalf of a ghost add the `user_id` query parameter. Every outbound
//! operation that counts against homeserver admission limits waits on its
//! [`OperationClass`] limiter first.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, ClientBuilder, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::discovery::ServerDiscovery;
use super::types::{
    AvatarData, CreateRoomOptions, ErrorBody, GhostUserCreation, RoomIdResponse, ServerVersion,
    WhoAmI, BRIDGE_CHANNEL_EVENT_TYPE,
};
use super::validate::{validate_path_component, ApiUrl};
use crate::config::{MatrixConfig, RateLimitConfig};
use crate::error::{BridgeError, BridgeResult};
use crate::rate_limiter::{OperationClass, RateLimiters};

/// Homeserver client shared by every bridge component
#[derive(Clone)]
pub struct MatrixClient {
    config: Arc<MatrixConfig>,
    base_url: Url,
    http: Client,
    limiters: Arc<RateLimiters>,
    server_name: Arc<str>,
    shutdown: CancellationToken,
}

impl fmt::Debug for MatrixClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatrixClient")
            .field("homeserver", &self.base_url.as_str())
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl MatrixClient {
    /// Create a client for an already-known server name
    pub fn new(
        config: MatrixConfig,
        rate_limits: &RateLimitConfig,
        server_name: impl Into<String>,
    ) -> BridgeResult<Self> {
        if config.homeserver_url.trim().is_empty() {
            return Err(BridgeError::config("homeserver URL cannot be empty"));
        }
        if config.as_token.trim().is_empty() {
            return Err(BridgeError::config("application service token cannot be empty"));
        }
        let server_name = server_name.into();
        if server_name.is_empty() {
            return Err(BridgeError::config("server name cannot be empty"));
        }

        let base_url = parse_homeserver_url(&config.homeserver_url)?;

        let http = ClientBuilder::new()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| BridgeError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config: Arc::new(config),
            base_url,
            http,
            limiters: Arc::new(RateLimiters::new(rate_limits)),
            server_name: Arc::from(server_name),
            shutdown: CancellationToken::new(),
        })
    }

    /// Resolve the server name through discovery, then create the client
    pub async fn connect(config: MatrixConfig, rate_limits: &RateLimitConfig) -> BridgeResult<Self> {
        let server_name = ServerDiscovery::new(&config)?.resolve_server_name().await;
        info!("Using Matrix server name {}", server_name);
        Self::new(config, rate_limits, server_name)
    }

    pub fn config(&self) -> &MatrixConfig {
        &self.config
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn homeserver_url(&self) -> &Url {
        &self.base_url
    }

    pub fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    /// Cancel every pending limiter wait and refuse new calls
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down Matrix client");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ==================== Request plumbing ====================

    pub(crate) fn url(&self) -> ApiUrl {
        ApiUrl::new(&self.base_url)
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn new_txn_id() -> String {
        format!("mxb{}", Uuid::new_v4().simple())
    }

    /// Wait on the class limiter, bounded by the configured wait timeout
    pub(crate) async fn acquire(&self, class: OperationClass) -> BridgeResult<()> {
        let deadline = Instant::now() + self.config.rate_wait_timeout();
        self.limiters
            .get(class)
            .wait_with_cancel(deadline, &self.shutdown)
            .await?;
        Ok(())
    }

    /// Authenticate and send; no status handling
    pub(crate) async fn send_request(
        &self,
        operation: &str,
        class: Option<OperationClass>,
        request: RequestBuilder,
    ) -> BridgeResult<Response> {
        if self.shutdown.is_cancelled() {
            return Err(BridgeError::Cancelled(format!(
                "{}: client is shut down",
                operation
            )));
        }
        if let Some(class) = class {
            self.acquire(class).await?;
        }

        debug!("Matrix request: {}", operation);
        request
            .bearer_auth(&self.config.as_token)
            .send()
            .await
            .map_err(|e| BridgeError::network(operation, e))
    }

    pub(crate) async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        class: Option<OperationClass>,
        request: RequestBuilder,
    ) -> BridgeResult<T> {
        let response = self.send_request(operation, class, request).await?;
        handle_response(operation, response).await
    }

    pub(crate) async fn call_empty(
        &self,
        operation: &str,
        class: Option<OperationClass>,
        request: RequestBuilder,
    ) -> BridgeResult<()> {
        let response = self.send_request(operation, class, request).await?;
        handle_empty_response(response).await
    }

    // ==================== Health ====================

    /// `whoami` for the application-service user
    pub async fn test_connection(&self) -> BridgeResult<WhoAmI> {
        let url = self.url().path("_matrix/client/v3/account/whoami").build();
        let whoami: WhoAmI = self.call("whoami", None, self.http.get(url)).await?;
        info!("Connected to homeserver as {}", whoami.user_id);
        Ok(whoami)
    }

    /// Probe a random ghost profile. A 404 shows the token may act in the
    /// namespace; 401/403 means the registration is wrong.
    pub async fn test_appservice_permissions(&self) -> BridgeResult<()> {
        let probe = format!(
            "@{}permission_probe_{}:{}",
            self.config.ghost_prefix,
            Uuid::new_v4().simple(),
            self.server_name
        );
        let url = self
            .url()
            .path("_matrix/client/v3/profile")
            .param("user_id", &probe)?
            .build();

        let response = self
            .send_request("permission_probe", None, self.http.get(url))
            .await?;
        let status = response.status().as_u16();
        match status {
            200..=299 | 404 => {
                debug!("Application service permission probe returned {}", status);
                Ok(())
            }
            401 | 403 => {
                let err = parse_error_response(response).await;
                Err(BridgeError::config(format!(
                    "homeserver rejected the application service token: {}",
                    err
                )))
            }
            _ => Err(parse_error_response(response).await),
        }
    }

    /// Federation version, falling back to the client versions list
    pub async fn get_server_version(&self) -> BridgeResult<ServerVersion> {
        #[derive(serde::Deserialize)]
        struct FederationVersion {
            server: ServerVersion,
        }
        #[derive(serde::Deserialize)]
        struct ClientVersions {
            #[serde(default)]
            versions: Vec<String>,
        }

        let url = self.url().path("_matrix/federation/v1/version").build();
        match self
            .call::<FederationVersion>("server_version", None, self.http.get(url))
            .await
        {
            Ok(v) => Ok(v.server),
            Err(e) => {
                debug!("Federation version lookup failed, trying client versions: {}", e);
                let url = self.url().path("_matrix/client/versions").build();
                let versions: ClientVersions =
                    self.call("client_versions", None, self.http.get(url)).await?;
                Ok(ServerVersion {
                    name: "unknown".to_string(),
                    version: versions.versions.last().cloned().unwrap_or_default(),
                })
            }
        }
    }

    // ==================== Rooms ====================

    /// Create a bridged room and return its id
    pub async fn create_room(&self, options: &CreateRoomOptions) -> BridgeResult<String> {
        let mut initial_state = vec![
            json!({
                "type": "m.room.history_visibility",
                "state_key": "",
                "content": {"history_visibility": options.history_visibility},
            }),
            json!({
                "type": "m.room.guest_access",
                "state_key": "",
                "content": {"guest_access": options.guest_access},
            }),
        ];
        if let Some(channel_id) = &options.channel_id {
            initial_state.push(json!({
                "type": BRIDGE_CHANNEL_EVENT_TYPE,
                "state_key": "",
                "content": {"channel_id": channel_id},
            }));
        }

        let mut body = json!({
            "preset": options.preset,
            "visibility": if options.publish { "public" } else { "private" },
            "initial_state": initial_state,
        });
        if let Some(name) = &options.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &options.topic {
            body["topic"] = json!(topic);
        }
        if let Some(alias_name) = &options.alias_name {
            validate_path_component("alias_name", alias_name)?;
            body["room_alias_name"] = json!(format!("{}{}", self.config.alias_prefix, alias_name));
        }
        if !options.invite.is_empty() {
            body["invite"] = json!(options.invite);
        }
        if options.is_direct {
            body["is_direct"] = json!(true);
        }

        let url = self.url().path("_matrix/client/v3/createRoom").build();
        let created: RoomIdResponse = self
            .call(
                "create_room",
                Some(OperationClass::RoomCreation),
                self.http.post(url).json(&body),
            )
            .await?;
        info!("Created room {}", created.room_id);

        if options.filter_alias {
            let name = options
                .alias_name
                .as_deref()
                .or(options.channel_id.as_deref());
            if let Some(name) = name {
                let alias = format!(
                    "#{}{}:{}",
                    self.config.filter_alias_prefix, name, self.server_name
                );
                if let Err(e) = self.create_room_alias(&alias, &created.room_id).await {
                    warn!("Failed to add bridge filter alias {}: {}", alias, e);
                }
            }
        }

        Ok(created.room_id)
    }

    /// Point `alias` at `room_id`; an existing alias is left alone
    pub async fn create_room_alias(&self, alias: &str, room_id: &str) -> BridgeResult<()> {
        validate_path_component("room_id", room_id)?;
        let url = self
            .url()
            .path("_matrix/client/v3/directory/room")
            .param("alias", alias)?
            .build();

        match self
            .call_empty(
                "create_room_alias",
                None,
                self.http.put(url).json(&json!({"room_id": room_id})),
            )
            .await
        {
            Err(e) if e.status() == Some(409) => {
                debug!("Alias {} already exists", alias);
                Ok(())
            }
            other => other,
        }
    }

    /// Alias to room id; anything without a leading `#` is returned as is
    pub async fn resolve_room_alias(&self, alias: &str) -> BridgeResult<String> {
        if !alias.starts_with('#') {
            return Ok(alias.to_string());
        }
        let url = self
            .url()
            .path("_matrix/client/v3/directory/room")
            .param("alias", alias)?
            .build();
        let resolved: RoomIdResponse = self
            .call("resolve_room_alias", None, self.http.get(url))
            .await?;
        Ok(resolved.room_id)
    }

    pub async fn set_room_directory_visibility(&self, room_id: &str, public: bool) -> BridgeResult<()> {
        let url = self
            .url()
            .path("_matrix/client/v3/directory/list/room")
            .param("room_id", room_id)?
            .build();
        let visibility = if public { "public" } else { "private" };
        self.call_empty(
            "set_room_directory_visibility",
            None,
            self.http.put(url).json(&json!({"visibility": visibility})),
        )
        .await
    }

    /// Single state event content; `Ok(None)` when the room has none
    pub async fn get_room_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
    ) -> BridgeResult<Option<Value>> {
        let mut url = self
            .url()
            .path("_matrix/client/v3/rooms")
            .param("room_id", room_id)?
            .path("state")
            .param("event_type", event_type)?;
        if !state_key.is_empty() {
            url = url.param("state_key", state_key)?;
        }

        match self
            .call::<Value>("get_room_state_event", None, self.http.get(url.build()))
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_room_public(&self, room_id: &str) -> bool {
        match self
            .get_room_state_event(room_id, "m.room.join_rules", "")
            .await
        {
            Ok(Some(content)) => content.get("join_rule").and_then(Value::as_str) == Some("public"),
            Ok(None) => false,
            Err(e) => {
                debug!("Could not read join rules of {}: {}", room_id, e);
                false
            }
        }
    }

    // ==================== Membership ====================

    pub async fn join_room(&self, room_id_or_alias: &str) -> BridgeResult<String> {
        self.join(room_id_or_alias, None).await
    }

    pub async fn join_room_as_user(&self, room_id_or_alias: &str, user_id: &str) -> BridgeResult<String> {
        self.join(room_id_or_alias, Some(user_id)).await
    }

    async fn join(&self, room_id_or_alias: &str, user_id: Option<&str>) -> BridgeResult<String> {
        let url = self
            .url()
            .path("_matrix/client/v3/join")
            .param("room_id", room_id_or_alias)?
            .query_opt("user_id", user_id)
            .build();
        let joined: RoomIdResponse = self
            .call(
                "join_room",
                Some(OperationClass::Join),
                self.http.post(url).json(&json!({})),
            )
            .await?;
        debug!(
            "{} joined {}",
            user_id.unwrap_or("bridge bot"),
            joined.room_id
        );
        Ok(joined.room_id)
    }

    pub async fn leave_room_as_user(&self, room_id: &str, user_id: &str) -> BridgeResult<()> {
        let url = self
            .url()
            .path("_matrix/client/v3/rooms")
            .param("room_id", room_id)?
            .path("leave")
            .query("user_id", user_id)
            .build();
        self.call_empty(
            "leave_room",
            Some(OperationClass::Join),
            self.http.post(url).json(&json!({})),
        )
        .await
    }

    /// Invite as the bridge bot; an existing member is not an error
    pub async fn invite_user(&self, room_id: &str, user_id: &str) -> BridgeResult<()> {
        validate_path_component("user_id", user_id)?;
        let url = self
            .url()
            .path("_matrix/client/v3/rooms")
            .param("room_id", room_id)?
            .path("invite")
            .build();

        match self
            .call_empty(
                "invite_user",
                Some(OperationClass::Invite),
                self.http.post(url).json(&json!({"user_id": user_id})),
            )
            .await
        {
            Err(e) if is_already_member(&e) => {
                debug!("{} is already in {}", user_id, room_id);
                Ok(())
            }
            other => other,
        }
    }

    /// Make `ghost_user_id` a member: invite first unless the room is public
    pub async fn invite_and_join_ghost_user(&self, room_id: &str, ghost_user_id: &str) -> BridgeResult<()> {
        if !self.is_room_public(room_id).await {
            self.invite_user(room_id, ghost_user_id).await?;
        }
        match self.join_room_as_user(room_id, ghost_user_id).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_member(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ==================== Users ====================

    /// Register `@{localpart}:{server}` in the namespace and set its profile
    pub async fn create_ghost_user(
        &self,
        localpart: &str,
        display_name: Option<&str>,
        avatar: Option<&AvatarData>,
    ) -> BridgeResult<GhostUserCreation> {
        validate_path_component("localpart", localpart)?;
        let user_id = format!("@{}:{}", localpart, self.server_name);

        let url = self.url().path("_matrix/client/v3/register").build();
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart,
            "inhibit_login": true,
        });
        let response = self
            .send_request(
                "register",
                Some(OperationClass::Registration),
                self.http.post(url).json(&body),
            )
            .await?;

        let already_existed = if response.status().is_success() {
            info!("Registered ghost user {}", user_id);
            false
        } else {
            let err = parse_error_response(response).await;
            if err.errcode() != Some("M_USER_IN_USE") {
                return Err(err);
            }
            debug!("Ghost user {} already registered", user_id);
            true
        };

        let mut creation = GhostUserCreation {
            user_id,
            already_existed,
            display_name_error: None,
            avatar_error: None,
        };

        if let Some(name) = display_name.filter(|n| !n.is_empty()) {
            if let Err(e) = self.set_display_name(&creation.user_id, name).await {
                warn!("Failed to set display name for {}: {}", creation.user_id, e);
                creation.display_name_error = Some(e.to_string());
            }
        }

        if let Some(avatar) = avatar {
            let result = match self.upload_avatar(avatar).await {
                Ok(mxc) => self.set_avatar_url(&creation.user_id, &mxc).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!("Failed to set avatar for {}: {}", creation.user_id, e);
                creation.avatar_error = Some(e.to_string());
            }
        }

        Ok(creation)
    }

    pub async fn set_display_name(&self, user_id: &str, display_name: &str) -> BridgeResult<()> {
        self.set_profile_field(user_id, "displayname", display_name).await
    }

    pub async fn set_avatar_url(&self, user_id: &str, avatar_url: &str) -> BridgeResult<()> {
        self.set_profile_field(user_id, "avatar_url", avatar_url).await
    }

    async fn set_profile_field(&self, user_id: &str, field: &str, value: &str) -> BridgeResult<()> {
        let url = self
            .url()
            .path("_matrix/client/v3/profile")
            .param("user_id", user_id)?
            .path(field)
            .query("user_id", user_id)
            .build();
        self.call_empty(
            "set_profile",
            Some(OperationClass::Registration),
            self.http.put(url).json(&json!({ field: value })),
        )
        .await
    }
}

pub(crate) fn parse_homeserver_url(raw: &str) -> BridgeResult<Url> {
    let url = Url::parse(raw.trim_end_matches('/'))
        .map_err(|e| BridgeError::config(format!("invalid homeserver URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(BridgeError::config(format!(
            "homeserver URL must be an http(s) URL with a host: {}",
            raw
        ))),
    }
}

/// "Already in the room" style rejections of invite and join
fn is_already_member(err: &BridgeError) -> bool {
    match err {
        BridgeError::Protocol { status: 403, message, .. } => {
            let message = message.to_ascii_lowercase();
            message.contains("already in the room") || message.contains("already joined")
        }
        _ => false,
    }
}

pub(crate) async fn handle_response<T: DeserializeOwned>(
    operation: &str,
    response: Response,
) -> BridgeResult<T> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| BridgeError::Serialization(format!("{}: {}", operation, e)))
    } else {
        Err(parse_error_response(response).await)
    }
}

pub(crate) async fn handle_empty_response(response: Response) -> BridgeResult<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(parse_error_response(response).await)
    }
}

pub(crate) async fn parse_error_response(response: Response) -> BridgeError {
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
    let message = body
        .error
        .or_else(|| (!text.is_empty()).then(|| text.clone()));
    BridgeError::from_response(status, body.errcode, message, body.retry_after_ms)
}

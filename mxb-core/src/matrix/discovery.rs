//! Server name discovery for ghost and alias ids.

use reqwest::{Client, ClientBuilder, Url};
use serde::Deserialize;
use tracing::debug;

use super::client::parse_homeserver_url;
use super::validate::ApiUrl;
use crate::config::MatrixConfig;
use crate::error::{BridgeError, BridgeResult};

#[derive(Debug, Deserialize)]
struct WellKnownServer {
    #[serde(rename = "m.server")]
    server: Option<String>,
}

/// Resolves the domain used in `@user:domain` ids.
///
/// Order: configured override, then `/.well-known/matrix/server`, then the
/// homeserver URL's hostname.
#[derive(Debug, Clone)]
pub struct ServerDiscovery {
    http: Client,
    homeserver_url: Url,
    override_name: Option<String>,
}

impl ServerDiscovery {
    pub fn new(config: &MatrixConfig) -> BridgeResult<Self> {
        let homeserver_url = parse_homeserver_url(&config.homeserver_url)?;
        let http = ClientBuilder::new()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BridgeError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            homeserver_url,
            override_name: config
                .server_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    pub async fn resolve_server_name(&self) -> String {
        if let Some(name) = &self.override_name {
            return name.clone();
        }

        match self.well_known().await {
            Ok(Some(name)) => return name,
            Ok(None) => debug!("Well-known server response had no usable m.server"),
            Err(e) => debug!("Well-known server lookup failed: {}", e),
        }

        self.fallback_hostname()
    }

    async fn well_known(&self) -> BridgeResult<Option<String>> {
        let url = ApiUrl::new(&self.homeserver_url)
            .path(".well-known/matrix/server")
            .build();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BridgeError::network("well_known", e))?;
        if !response.status().is_success() {
            return Err(BridgeError::from_response(
                response.status().as_u16(),
                None,
                None,
                None,
            ));
        }

        let body: WellKnownServer = response
            .json()
            .await
            .map_err(|e| BridgeError::Serialization(format!("well_known: {}", e)))?;
        Ok(body.server.as_deref().and_then(host_without_port))
    }

    fn fallback_hostname(&self) -> String {
        self.homeserver_url.host_str().unwrap_or_default().to_string()
    }
}

/// `host[:port]` to `host`; bracketed IPv6 literals keep their brackets
pub(crate) fn host_without_port(server: &str) -> Option<String> {
    let server = server.trim();
    let host = if server.starts_with('[') {
        server.find(']').map(|end| &server[..=end])?
    } else {
        server.split(':').next().unwrap_or_default()
    };
    (!host.is_empty()).then(|| host.to_string())
}

//! Path component validation and endpoint URL building.
//!
//! Every caller-supplied identifier that lands in a URL path goes through
//! [`validate_path_component`] first, then is appended as a single
//! percent-escaped segment by [`ApiUrl::param`].

use reqwest::Url;

use crate::error::{BridgeError, BridgeResult};

/// Sequences that would let a component climb out of its path position
const TRAVERSAL_PATTERNS: [&str; 4] = ["..", "%2e%2e", ".%2e", "%2e."];

/// Reject empty components and anything carrying a traversal sequence.
///
/// The check is case-insensitive and looks at every position in the value.
pub fn validate_path_component(name: &str, value: &str) -> BridgeResult<()> {
    if value.is_empty() {
        return Err(BridgeError::validation(format!("{} is required", name)));
    }

    let lowered = value.to_ascii_lowercase();
    if TRAVERSAL_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Err(BridgeError::validation(format!(
            "{} contains a path traversal sequence: {}",
            name, value
        )));
    }
    Ok(())
}

/// Endpoint URL under the homeserver base
#[derive(Debug, Clone)]
pub struct ApiUrl {
    url: Url,
}

impl ApiUrl {
    pub fn new(base: &Url) -> Self {
        Self { url: base.clone() }
    }

    /// Append fixed, trusted segments such as `_matrix/client/v3/rooms`
    pub fn path(mut self, fixed: &str) -> Self {
        if let Ok(mut segments) = self.url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(fixed.split('/').filter(|s| !s.is_empty()));
        }
        self
    }

    /// Append one validated, escaped identifier segment
    pub fn param(mut self, name: &str, value: &str) -> BridgeResult<Self> {
        validate_path_component(name, value)?;
        let mut segments = self
            .url
            .path_segments_mut()
            .map_err(|_| BridgeError::config("homeserver URL cannot be a base URL"))?;
        segments.pop_if_empty().push(value);
        drop(segments);
        Ok(self)
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.url.query_pairs_mut().append_pair(key, value);
        self
    }

    pub fn query_opt(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => self.query(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Url {
        self.url
    }
}

//! Media repository: uploads, avatar uploads, and downloads with endpoint
//! fallback.

use std::fmt;

use bytes::{Bytes, BytesMut};
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tracing::debug;

use super::client::{handle_response, parse_error_response, MatrixClient};
use super::types::{AvatarData, ContentUriResponse, MediaDownload};
use super::validate::validate_path_component;
use crate::error::{BridgeError, BridgeResult};

/// Download endpoints, newest first
const DOWNLOAD_PREFIXES: [&str; 3] = [
    "_matrix/client/v1/media/download",
    "_matrix/media/v3/download",
    "_matrix/media/r0/download",
];

const INVALID_MXC: &str = "invalid Matrix MXC URI format";

/// Parsed `mxc://{server_name}/{media_id}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxcUri {
    pub server_name: String,
    pub media_id: String,
}

impl MxcUri {
    pub fn parse(uri: &str) -> BridgeResult<Self> {
        let rest = uri
            .strip_prefix("mxc://")
            .ok_or_else(|| BridgeError::validation(INVALID_MXC))?;
        let (server_name, media_id) = rest
            .split_once('/')
            .ok_or_else(|| BridgeError::validation(INVALID_MXC))?;
        if server_name.is_empty() || media_id.is_empty() {
            return Err(BridgeError::validation(INVALID_MXC));
        }

        validate_path_component("server_name", server_name)?;
        validate_path_component("media_id", media_id)?;

        Ok(Self {
            server_name: server_name.to_string(),
            media_id: media_id.to_string(),
        })
    }
}

impl fmt::Display for MxcUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mxc://{}/{}", self.server_name, self.media_id)
    }
}

impl MatrixClient {
    /// Upload to the media repository and return the `mxc://` URI
    pub async fn upload_media(
        &self,
        data: Bytes,
        content_type: &str,
        filename: &str,
        as_user: Option<&str>,
    ) -> BridgeResult<String> {
        let url = self
            .url()
            .path("_matrix/media/v3/upload")
            .query("filename", filename)
            .query_opt("user_id", as_user)
            .build();

        let size = data.len();
        let request = self
            .http()
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(data);
        let response = self.send_request("upload_media", None, request).await?;
        let uploaded: ContentUriResponse = handle_response("upload_media", response).await?;
        debug!("Uploaded {} ({} bytes) as {}", filename, size, uploaded.content_uri);
        Ok(uploaded.content_uri)
    }

    /// Upload an avatar with a filename derived from its content type
    pub async fn upload_avatar(&self, avatar: &AvatarData) -> BridgeResult<String> {
        let filename = format!("avatar.{}", avatar_extension(&avatar.content_type));
        self.upload_media(avatar.data.clone(), &avatar.content_type, &filename, None)
            .await
    }

    /// Fetch media, trying each download endpoint until one serves a media body
    pub async fn download_media(&self, mxc_uri: &str) -> BridgeResult<MediaDownload> {
        let mxc = MxcUri::parse(mxc_uri)?;

        let mut last_error = None;
        for prefix in DOWNLOAD_PREFIXES {
            let url = self
                .url()
                .path(prefix)
                .param("server_name", &mxc.server_name)?
                .param("media_id", &mxc.media_id)?
                .build();

            match self.try_download(url).await {
                Ok((data, content_type)) => {
                    return Ok(MediaDownload {
                        data,
                        content_type,
                        source: prefix.to_string(),
                    })
                }
                Err(e) => {
                    debug!("Download of {} from {} failed: {}", mxc, prefix, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BridgeError::validation(INVALID_MXC)))
    }

    async fn try_download(&self, url: Url) -> BridgeResult<(Bytes, Option<String>)> {
        let mut response = self
            .send_request("download_media", None, self.http().get(url))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(parse_error_response(response).await);
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !content_type.as_deref().is_some_and(is_media_content_type) {
            return Err(BridgeError::from_response(
                status.as_u16(),
                None,
                Some(format!(
                    "unexpected content type for media: {}",
                    content_type.as_deref().unwrap_or("none")
                )),
                None,
            ));
        }

        let limit = self.config().max_download_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large(limit));
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| BridgeError::network("download_media", e))?
        {
            if body.len() + chunk.len() > limit {
                return Err(too_large(limit));
            }
            body.extend_from_slice(&chunk);
        }

        Ok((body.freeze(), content_type))
    }
}

fn too_large(limit: usize) -> BridgeError {
    BridgeError::validation(format!("media exceeds the {} byte download limit", limit))
}

/// Image, audio, video or binary bodies; text and structured documents are error pages
fn is_media_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let Some((kind, subtype)) = essence.split_once('/') else {
        return false;
    };
    match kind {
        "image" | "video" | "audio" | "font" => !subtype.is_empty(),
        "application" => {
            !matches!(subtype, "json" | "xml" | "xhtml+xml" | "javascript")
                && !subtype.ends_with("+json")
        }
        _ => false,
    }
}

fn avatar_extension(content_type: &str) -> &'static str {
    match content_type.to_ascii_lowercase().as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "img",
    }
}

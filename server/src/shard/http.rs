//! HTTP implementation of the shard protocol

use async_trait::async_trait;
use axum::body::Body;
use axum::http::StatusCode;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::client::{ShardClient, UpstreamResponse};
use super::types::{ColorMap, RemoteToken, Shard, ShardError, SlideDimensions, TileAddress};
use crate::config::ShardTimeouts;

/// Name of the cookie carrying the session token on every shard call
const SESSION_COOKIE: &str = "session_id";

/// `reqwest`-backed shard client with per-call timeouts
#[derive(Clone)]
pub struct HttpShardClient {
    http: reqwest::Client,
    timeouts: ShardTimeouts,
}

#[derive(Deserialize)]
struct SlideInfoBody {
    slide_dimensions: SlideDimensions,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OverlayBody {
    Number(u32),
    Object { layer_number: u32 },
}

impl HttpShardClient {
    pub fn new(timeouts: ShardTimeouts) -> Result<Self, ShardError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ShardError::Transport(e.to_string()))?;
        Ok(Self { http, timeouts })
    }

    async fn put_json(
        &self,
        shard: &Shard,
        token: &str,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<reqwest::Response, ShardError> {
        let response = self
            .http
            .put(shard.url(path))
            .header(COOKIE, session_cookie(token))
            .json(&payload)
            .timeout(self.timeouts.setup)
            .send()
            .await
            .map_err(map_transport)?;
        ensure_success(response).await
    }
}

fn session_cookie(token: &str) -> String {
    format!("{}={}", SESSION_COOKIE, token)
}

fn map_transport(e: reqwest::Error) -> ShardError {
    if e.is_timeout() {
        ShardError::Timeout
    } else {
        ShardError::Transport(e.to_string())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ShardError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ShardError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Statuses with which a shard says it does not know the session token.
/// Other client errors (throttling, request timeout) leave the session alone.
fn token_unknown(status: reqwest::StatusCode) -> bool {
    matches!(
        status,
        reqwest::StatusCode::UNAUTHORIZED
            | reqwest::StatusCode::NOT_FOUND
            | reqwest::StatusCode::GONE
    )
}

/// Extract a token from a `/session_id` response body or its `Set-Cookie`
fn parse_token(body: &str, set_cookie: Option<&str>) -> Option<RemoteToken> {
    let trimmed = body.trim();
    let from_body = if trimmed.starts_with('"') {
        serde_json::from_str::<String>(trimmed).ok()
    } else {
        Some(trimmed.to_string())
    };
    if let Some(token) = from_body.filter(|t| !t.is_empty()) {
        return Some(token);
    }
    set_cookie?
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl ShardClient for HttpShardClient {
    async fn open_session(&self, shard: &Shard) -> Result<RemoteToken, ShardError> {
        let response = self
            .http
            .get(shard.url("/session_id"))
            .timeout(self.timeouts.setup)
            .send()
            .await
            .map_err(map_transport)?;
        let response = ensure_success(response).await?;
        let set_cookie = response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(map_transport)?;
        parse_token(&body, set_cookie.as_deref())
            .ok_or_else(|| ShardError::Protocol("empty session token".to_string()))
    }

    async fn bind_slide(
        &self,
        shard: &Shard,
        token: &str,
        slide_path: &Path,
    ) -> Result<(), ShardError> {
        self.put_json(
            shard,
            token,
            "/slide",
            json!({ "slide_path": slide_path.to_string_lossy() }),
        )
        .await?;
        Ok(())
    }

    async fn register_overlay(
        &self,
        shard: &Shard,
        token: &str,
        overlay_path: &Path,
    ) -> Result<u32, ShardError> {
        let response = self
            .put_json(
                shard,
                token,
                "/overlay",
                json!({ "overlay_path": overlay_path.to_string_lossy() }),
            )
            .await?;
        let body = response.text().await.map_err(map_transport)?;
        match serde_json::from_str::<OverlayBody>(body.trim()) {
            Ok(OverlayBody::Number(n)) | Ok(OverlayBody::Object { layer_number: n }) => Ok(n),
            Err(e) => Err(ShardError::Protocol(format!(
                "invalid overlay response '{}': {}",
                body, e
            ))),
        }
    }

    async fn register_color_map(
        &self,
        shard: &Shard,
        token: &str,
        color_map: &ColorMap,
    ) -> Result<(), ShardError> {
        self.put_json(
            shard,
            token,
            "/cmap",
            json!({ "keys": color_map.keys, "values": color_map.values }),
        )
        .await?;
        Ok(())
    }

    async fn slide_dimensions(
        &self,
        shard: &Shard,
        token: &str,
    ) -> Result<SlideDimensions, ShardError> {
        let response = self
            .http
            .get(shard.url("/slide"))
            .header(COOKIE, session_cookie(token))
            .timeout(self.timeouts.setup)
            .send()
            .await
            .map_err(map_transport)?;
        if token_unknown(response.status()) {
            debug!(
                "Shard {} rejected token with HTTP {}",
                shard.id,
                response.status()
            );
            return Err(ShardError::UnknownSession);
        }
        let response = ensure_success(response).await?;
        let info: SlideInfoBody = response
            .json()
            .await
            .map_err(|e| ShardError::Protocol(format!("invalid slide info: {}", e)))?;
        Ok(info.slide_dimensions)
    }

    async fn reset(&self, shard: &Shard, token: &str) -> Result<(), ShardError> {
        let response = self
            .http
            .put(shard.url(&format!("/reset/{}", token)))
            .header(COOKIE, session_cookie(token))
            .timeout(self.timeouts.reset)
            .send()
            .await
            .map_err(map_transport)?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn fetch_tile(
        &self,
        shard: &Shard,
        token: &str,
        tile: &TileAddress,
    ) -> Result<UpstreamResponse, ShardError> {
        let response = self
            .http
            .get(shard.url(&tile.path(token)))
            .header(COOKIE, session_cookie(token))
            .timeout(self.timeouts.tile)
            .send()
            .await
            .map_err(map_transport)?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| ShardError::Protocol(e.to_string()))?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(UpstreamResponse {
            status,
            content_type,
            body: Body::from_stream(response.bytes_stream()),
        })
    }
}

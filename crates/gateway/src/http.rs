use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, instrument};

use super::RemoteGateway;
use super::error::{
    DecodeSnafu, GatewayResult, HttpSnafu, InvalidEndpointSnafu, StatusSnafu,
};
use super::ids::{MessageId, UserId};
use super::types::{Message, Peer, SendRequest};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:5001/api";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpGatewayConfig {
    pub endpoint: String,
    pub request_timeout: Option<Duration>,
}

impl Default for HttpGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: None,
        }
    }
}

impl HttpGatewayConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

/// REST client for the messaging backend.
///
/// Authentication is carried by the supplied [`reqwest::Client`] (cookie store, default
/// headers); this type only knows the routes and payload shapes.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> GatewayResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context(HttpSnafu {
            stage: "build-http-client",
        })?;

        Self::with_client(http, config.endpoint)
    }

    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>) -> GatewayResult<Self> {
        let base_url = normalize_endpoint(endpoint.into())?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Appends each segment to the base path. Ids are percent-encoded, so `/`, `?` and `#`
    /// inside an id stay part of that segment.
    fn route(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .ok()
            .context(InvalidEndpointSnafu {
                stage: "build-route",
                endpoint: self.base_url.as_str(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    #[instrument(skip_all)]
    async fn get_partners(&self) -> GatewayResult<Vec<Peer>> {
        let response = self
            .http
            .get(self.route(&["messages", "users"])?)
            .send()
            .await
            .context(HttpSnafu {
                stage: "list-partners-send",
            })?;

        decode_json(response, "list-partners").await
    }

    #[instrument(skip_all, fields(peer_id = %peer_id))]
    async fn get_history(&self, peer_id: &UserId) -> GatewayResult<Vec<Message>> {
        let response = self
            .http
            .get(self.route(&["messages", peer_id.as_str()])?)
            .send()
            .await
            .context(HttpSnafu {
                stage: "fetch-history-send",
            })?;

        let messages: Vec<Message> = decode_json(response, "fetch-history").await?;
        debug!(message_count = messages.len(), "fetched conversation history");
        Ok(messages)
    }

    #[instrument(skip_all, fields(peer_id = %peer_id, reply_to = ?request.reply_to))]
    async fn post_message(&self, peer_id: &UserId, request: SendRequest) -> GatewayResult<Message> {
        let response = self
            .http
            .post(self.route(&["messages", "send", peer_id.as_str()])?)
            .json(&request)
            .send()
            .await
            .context(HttpSnafu {
                stage: "send-message-send",
            })?;

        decode_json(response, "send-message").await
    }

    #[instrument(skip_all, fields(message_id = %message_id))]
    async fn remove_message(&self, message_id: &MessageId) -> GatewayResult<()> {
        let response = self
            .http
            .delete(self.route(&["messages", "delete", message_id.as_str()])?)
            .send()
            .await
            .context(HttpSnafu {
                stage: "delete-message-send",
            })?;

        let status = response.status();
        let body = response.text().await.context(HttpSnafu {
            stage: "delete-message-read-body",
        })?;
        ensure_success(status, &body, "delete-message-status")
    }
}

impl RemoteGateway for HttpGateway {
    fn list_conversation_partners<'a>(&'a self) -> BoxFuture<'a, GatewayResult<Vec<Peer>>> {
        self.get_partners().boxed()
    }

    fn fetch_history<'a>(
        &'a self,
        peer_id: &'a UserId,
    ) -> BoxFuture<'a, GatewayResult<Vec<Message>>> {
        self.get_history(peer_id).boxed()
    }

    fn send_message<'a>(
        &'a self,
        peer_id: &'a UserId,
        request: SendRequest,
    ) -> BoxFuture<'a, GatewayResult<Message>> {
        self.post_message(peer_id, request).boxed()
    }

    fn delete_message<'a>(&'a self, message_id: &'a MessageId) -> BoxFuture<'a, GatewayResult<()>> {
        self.remove_message(message_id).boxed()
    }
}

fn normalize_endpoint(raw: String) -> GatewayResult<Url> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).ok().context(InvalidEndpointSnafu {
        stage: "parse-endpoint",
        endpoint: raw.as_str(),
    })?;
    ensure!(
        matches!(url.scheme(), "http" | "https") && !url.cannot_be_a_base(),
        InvalidEndpointSnafu {
            stage: "normalize-endpoint",
            endpoint: raw,
        }
    );
    Ok(url)
}

async fn decode_json<T>(response: Response, stage: &'static str) -> GatewayResult<T>
where
    T: DeserializeOwned,
{
    let status = response.status();
    let body = response.text().await.context(HttpSnafu { stage })?;
    ensure_success(status, &body, stage)?;
    serde_json::from_str(&body).context(DecodeSnafu { stage })
}

fn ensure_success(status: StatusCode, body: &str, stage: &'static str) -> GatewayResult<()> {
    if status.is_success() {
        return Ok(());
    }

    StatusSnafu {
        stage,
        status: status.as_u16(),
        message: error_message(body, status),
    }
    .fail()
}

// Error bodies look like `{ "message": "..." }`; anything else falls back to the status reason.
fn error_message(body: &str, status: StatusCode) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|message| message.as_str())
                .map(str::to_string)
        })
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    #[test]
    fn endpoint_is_trimmed_and_routes_are_joined() {
        let gateway = HttpGateway::new(HttpGatewayConfig::new(" https://chat.example/api/ "))
            .expect("valid endpoint");
        assert_eq!(gateway.base_url(), "https://chat.example/api");
        let route = gateway.route(&["messages", "send", "u1"]).expect("route");
        assert_eq!(route.as_str(), "https://chat.example/api/messages/send/u1");
    }

    #[test]
    fn ids_are_escaped_inside_their_route_segment() {
        let gateway =
            HttpGateway::new(HttpGatewayConfig::new("http://localhost:5001/api")).expect("endpoint");
        let route = gateway
            .route(&["messages", "delete", "a/b?c#d"])
            .expect("route");
        assert_eq!(
            route.as_str(),
            "http://localhost:5001/api/messages/delete/a%2Fb%3Fc%23d"
        );
        assert_eq!(route.query(), None);
        assert_eq!(route.fragment(), None);
    }

    #[test]
    fn root_endpoint_routes_without_double_slash() {
        let gateway =
            HttpGateway::new(HttpGatewayConfig::new("http://chat.example/")).expect("endpoint");
        let route = gateway.route(&["messages", "users"]).expect("route");
        assert_eq!(route.as_str(), "http://chat.example/messages/users");
    }

    #[test]
    fn non_http_endpoint_is_rejected() {
        let result = HttpGateway::new(HttpGatewayConfig::new("ftp://chat.example"));
        assert!(matches!(result, Err(GatewayError::InvalidEndpoint { .. })));
    }

    #[test]
    fn error_message_prefers_backend_message_field() {
        let message = error_message(
            r#"{"message":"Unauthorized - No Token Provided"}"#,
            StatusCode::UNAUTHORIZED,
        );
        assert_eq!(message, "Unauthorized - No Token Provided");
    }

    #[test]
    fn error_message_falls_back_to_status_reason() {
        assert_eq!(
            error_message("<html>oops</html>", StatusCode::BAD_GATEWAY),
            "Bad Gateway"
        );
        assert_eq!(
            error_message(r#"{"message":""}"#, StatusCode::NOT_FOUND),
            "Not Found"
        );
    }

    #[test]
    fn non_success_status_maps_to_status_error() {
        let result = ensure_success(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"message":"Internal server error"}"#,
            "test-stage",
        );
        match result {
            Err(error @ GatewayError::Status { .. }) => {
                assert_eq!(error.status(), Some(500));
                assert!(error.to_string().contains("Internal server error"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}

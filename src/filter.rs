//! The transform filter.
//!
//! [`handle`] relays one inbound request to the backend and decides what the
//! caller gets back:
//!
//! - backend unreachable: `503 Service Unavailable`
//! - backend body unreadable: `500 Internal Server Error`
//! - body classified as a GTFS-RT feed that decodes and renders: the feed as
//!   JSON, with the backend's status and remaining headers
//! - anything else, including feeds that fail to decode or render: the
//!   backend response exactly as received
//!
//! Decode and render failures are never reported to the caller. The
//! classifier is a guess, and a body it picked up by mistake must still
//! reach the caller intact.

use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue, X_CONTENT_TYPE_OPTIONS};
use reqwest::{Method, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::classify::classify;
use crate::fetch::HttpClient;
use crate::json;
use crate::parser::{feed_timestamp, parse_feed};

pub const JSON_MEDIA_TYPE: &str = "application/json";

/// Bytes of an undecodable body shown in the debug log.
const PREVIEW_LEN: usize = 50;

/// A request as received from the caller.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    /// Absolute URL of the backend resource.
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Same method, URL, headers (every value, in order) and body.
    fn into_outbound(self) -> reqwest::Request {
        let mut req = reqwest::Request::new(self.method, self.url);
        *req.headers_mut() = self.headers;
        if !self.body.is_empty() {
            *req.body_mut() = Some(self.body.into());
        }
        req
    }
}

/// A backend response with its body read in full.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The response to write back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    /// Plain-text error with the status' reason phrase as the body.
    fn error(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        let reason = status.canonical_reason().unwrap_or("Error");

        Self {
            status,
            headers,
            body: Bytes::from(format!("{reason}\n")),
        }
    }
}

impl From<BackendResponse> for ProxyResponse {
    fn from(backend: BackendResponse) -> Self {
        Self {
            status: backend.status,
            headers: backend.headers,
            body: backend.body,
        }
    }
}

/// Failures that end an invocation before there is a body to look at.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("backend request failed: {0}")]
    BackendUnavailable(#[source] reqwest::Error),
    #[error("failed to read backend response body: {0}")]
    BodyUnreadable(#[source] reqwest::Error),
}

impl FilterError {
    pub fn status(&self) -> StatusCode {
        match self {
            FilterError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FilterError::BodyUnreadable(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FilterError> for ProxyResponse {
    fn from(err: FilterError) -> Self {
        ProxyResponse::error(err.status())
    }
}

/// What becomes of a backend response that arrived intact.
#[derive(Debug)]
pub enum Outcome {
    Passthrough(BackendResponse),
    Transcoded { backend: BackendResponse, json: Vec<u8> },
}

impl From<Outcome> for ProxyResponse {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Passthrough(backend) => backend.into(),
            Outcome::Transcoded { backend, json } => {
                // The length header would describe the protobuf body; the host
                // derives a new one from the JSON.
                let mut headers = backend.headers;
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MEDIA_TYPE));

                Self {
                    status: backend.status,
                    headers,
                    body: Bytes::from(json),
                }
            }
        }
    }
}

/// Relays `req` to the backend behind `client` and builds the response for
/// the caller. Exactly one response comes out of every call.
#[tracing::instrument(skip_all, fields(method = %req.method, url = %req.url))]
pub async fn handle<C: HttpClient + ?Sized>(client: &C, req: InboundRequest) -> ProxyResponse {
    debug!("Processing request");
    let path = req.url.path().to_string();

    match forward(client, req).await {
        Ok(backend) => transform(backend, &path).into(),
        Err(e) => {
            error!(error = %e, "Backend exchange failed");
            e.into()
        }
    }
}

/// Sends the request and reads the whole response body into memory.
pub async fn forward<C: HttpClient + ?Sized>(
    client: &C,
    req: InboundRequest,
) -> Result<BackendResponse, FilterError> {
    let resp = client
        .execute(req.into_outbound())
        .await
        .map_err(FilterError::BackendUnavailable)?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.bytes().await.map_err(FilterError::BodyUnreadable)?;

    debug!(status = status.as_u16(), bytes = body.len(), "Backend response received");
    Ok(BackendResponse {
        status,
        headers,
        body,
    })
}

/// Classifies a backend response and converts it to JSON when it is a feed.
pub fn transform(backend: BackendResponse, path: &str) -> Outcome {
    let Some(reason) = classify(&backend.headers, path) else {
        debug!("Not GTFS-RT data, passing through original response");
        return Outcome::Passthrough(backend);
    };
    debug!(%reason, "Response looks like GTFS-RT");

    let feed = match parse_feed(&backend.body) {
        Ok(feed) => feed,
        Err(e) => {
            warn!(error = %e, "Failed to decode GTFS-RT feed, passing through original response");
            let preview = &backend.body[..backend.body.len().min(PREVIEW_LEN)];
            debug!(preview = %hex::encode(preview), "Response body start");
            return Outcome::Passthrough(backend);
        }
    };

    match json::to_json(&feed) {
        Ok(json) => {
            debug!(
                entities = feed.entity.len(),
                feed_timestamp = ?feed_timestamp(&feed).map(|ts| ts.to_rfc3339()),
                bytes = json.len(),
                "Converted GTFS-RT feed to JSON"
            );
            Outcome::Transcoded { backend, json }
        }
        Err(e) => {
            warn!(error = %e, "Failed to render GTFS-RT feed as JSON, passing through original response");
            Outcome::Passthrough(backend)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, VehiclePosition};
    use async_trait::async_trait;
    use prost::Message;
    use std::sync::Mutex;

    /// What the backend saw of the outbound request.
    #[derive(Debug)]
    struct Seen {
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    }

    struct MockClient<F> {
        reply: F,
        seen: Mutex<Vec<Seen>>,
    }

    impl<F> MockClient<F>
    where
        F: Fn() -> reqwest::Response + Send + Sync,
    {
        fn new(reply: F) -> Self {
            Self {
                reply,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl<F> HttpClient for MockClient<F>
    where
        F: Fn() -> reqwest::Response + Send + Sync,
    {
        async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
            self.seen.lock().unwrap().push(Seen {
                method: req.method().clone(),
                url: req.url().clone(),
                headers: req.headers().clone(),
                body: req.body().and_then(|b| b.as_bytes()).map(<[u8]>::to_vec),
            });
            Ok((self.reply)())
        }
    }

    fn reply(status: u16, headers: &[(&str, &str)], body: Vec<u8>) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body).unwrap().into()
    }

    fn get(url: &str) -> InboundRequest {
        InboundRequest::new(Method::GET, url.parse().unwrap())
    }

    fn sample_feed() -> Vec<u8> {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(1700000000),
                incrementality: None,
                feed_version: None,
            },
            entity: vec![FeedEntity {
                id: "v1".to_string(),
                vehicle: Some(VehiclePosition {
                    timestamp: Some(1700000000),
                    ..Default::default()
                }),
                ..Default::default()
            }],
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn test_outbound_request_copies_method_url_headers_and_body() {
        let client = MockClient::new(|| reply(204, &[], vec![]));
        let mut req = InboundRequest::new(
            Method::POST,
            "http://backend.local/api/stops?route=Red".parse().unwrap(),
        );
        req.headers.append("x-trace", HeaderValue::from_static("a"));
        req.headers.append("x-trace", HeaderValue::from_static("b"));
        req.headers.insert("accept", HeaderValue::from_static("*/*"));
        req.body = Bytes::from_static(b"{\"q\":1}");

        handle(&client, req).await;

        let seen = client.seen.lock().unwrap();
        let seen = &seen[0];
        assert_eq!(seen.method, Method::POST);
        assert_eq!(seen.url.as_str(), "http://backend.local/api/stops?route=Red");
        let traces: Vec<_> = seen.headers.get_all("x-trace").iter().collect();
        assert_eq!(traces, ["a", "b"]);
        assert_eq!(seen.headers["accept"], "*/*");
        assert_eq!(seen.body.as_deref(), Some(&b"{\"q\":1}"[..]));
    }

    #[tokio::test]
    async fn test_empty_body_is_not_sent() {
        let client = MockClient::new(|| reply(200, &[], vec![]));
        handle(&client, get("http://backend.local/")).await;
        assert!(client.seen.lock().unwrap()[0].body.is_none());
    }

    #[tokio::test]
    async fn test_unclassified_response_passes_through() {
        let client = MockClient::new(|| {
            reply(
                201,
                &[("content-type", "application/json"), ("x-custom", "1")],
                b"{\"ok\":true}".to_vec(),
            )
        });

        let resp = handle(&client, get("http://backend.local/api/stops")).await;

        assert_eq!(resp.status, StatusCode::CREATED);
        assert_eq!(resp.headers["content-type"], "application/json");
        assert_eq!(resp.headers["x-custom"], "1");
        assert_eq!(resp.body, Bytes::from_static(b"{\"ok\":true}"));
    }

    #[tokio::test]
    async fn test_feed_is_transcoded() {
        let body = sample_feed();
        let len = body.len().to_string();
        let client = MockClient::new(move || {
            reply(
                200,
                &[
                    ("content-type", "application/x-protobuf"),
                    ("content-length", len.as_str()),
                    ("cache-control", "max-age=15"),
                ],
                body.clone(),
            )
        });

        let resp = handle(&client, get("http://backend.local/feeds/tripupdates")).await;

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers["content-type"], JSON_MEDIA_TYPE);
        assert_eq!(resp.headers.get_all("content-type").iter().count(), 1);
        assert!(resp.headers.get("content-length").is_none());
        assert_eq!(resp.headers["cache-control"], "max-age=15");

        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value["header"]["timestamp"], "1700000000");
        assert_eq!(value["entity"][0]["vehicle"]["timestamp"], "1700000000");
        assert!(value["header"].get("incrementality").is_none());
    }

    #[tokio::test]
    async fn test_transcode_keeps_backend_status() {
        let body = sample_feed();
        let client = MockClient::new(move || {
            reply(203, &[("content-type", "application/protobuf")], body.clone())
        });

        let resp = handle(&client, get("http://backend.local/vehicles")).await;

        assert_eq!(resp.status, StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(resp.headers["content-type"], JSON_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_undecodable_feed_passes_through() {
        let body = vec![0xFF, 0xFE, 0x00, 0x01];
        let expected = body.clone();
        let client = MockClient::new(move || {
            reply(
                200,
                &[("content-type", "application/octet-stream"), ("content-length", "4")],
                body.clone(),
            )
        });

        let resp = handle(&client, get("http://backend.local/gtfs/vehicles")).await;

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers["content-type"], "application/octet-stream");
        assert_eq!(resp.headers["content-length"], "4");
        assert_eq!(resp.body, Bytes::from(expected));
    }

    #[tokio::test]
    async fn test_empty_feed_body_passes_through() {
        // An empty body has no header, which a feed requires.
        let client = MockClient::new(|| reply(404, &[("content-type", "text/plain")], vec![]));

        let resp = handle(&client, get("http://backend.local/gtfs/missing")).await;

        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert_eq!(resp.headers["content-type"], "text/plain");
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_body_is_internal_server_error() {
        let client = MockClient::new(|| {
            let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
                Ok(Bytes::from_static(b"\x0a\x05")),
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            ];
            let body = reqwest::Body::wrap_stream(futures_util::stream::iter(chunks));
            http::Response::builder()
                .status(200)
                .header("content-type", "application/x-protobuf")
                .body(body)
                .unwrap()
                .into()
        });

        let resp = handle(&client, get("http://backend.local/gtfs")).await;

        assert_eq!(resp.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.body, Bytes::from_static(b"Internal Server Error\n"));
        assert_eq!(resp.headers["content-type"], "text/plain; charset=utf-8");
    }

    #[test]
    fn test_filter_error_statuses() {
        let resp = ProxyResponse::error(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.body, Bytes::from_static(b"Service Unavailable\n"));
        assert_eq!(resp.headers["x-content-type-options"], "nosniff");
    }

    #[test]
    fn test_transform_repeated_headers_survive_transcode() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        let backend = BackendResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(sample_feed()),
        };

        let resp: ProxyResponse = transform(backend, "/").into();

        let cookies: Vec<_> = resp.headers.get_all("set-cookie").iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(resp.headers["content-type"], JSON_MEDIA_TYPE);
    }

    #[test]
    fn test_transform_feed_missing_required_fields_passes_through() {
        // header, then an entity with no id whose vehicle has an empty position
        let body: &[u8] = &[
            0x0a, 0x05, 0x0a, 0x03, b'2', b'.', b'0', 0x12, 0x04, 0x22, 0x02, 0x12, 0x00,
        ];
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("13"));
        let backend = BackendResponse {
            status: StatusCode::OK,
            headers: headers.clone(),
            body: Bytes::copy_from_slice(body),
        };

        let outcome = transform(backend, "/gtfs");
        assert!(matches!(outcome, Outcome::Passthrough(_)));

        let resp: ProxyResponse = outcome.into();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.headers, headers);
        assert_eq!(&resp.body[..], body);
    }

    #[test]
    fn test_transform_empty_version_string_is_transcoded() {
        let feed = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: String::new(),
                timestamp: None,
                incrementality: None,
                feed_version: None,
            },
            entity: vec![],
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        let backend = BackendResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(feed.encode_to_vec()),
        };

        let resp: ProxyResponse = transform(backend, "/").into();

        assert_eq!(resp.headers["content-type"], JSON_MEDIA_TYPE);
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value, serde_json::json!({ "header": { "gtfs_realtime_version": "" } }));
    }

    struct Capture(std::sync::Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_conversion_is_logged_at_debug() {
        let captured = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || Capture(sink.clone()))
            .finish();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        let backend = BackendResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from(sample_feed()),
        };
        tracing::subscriber::with_default(subscriber, || {
            assert!(matches!(transform(backend, "/"), Outcome::Transcoded { .. }));
        });

        let text = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        let line = text
            .lines()
            .find(|l| l.contains("Converted GTFS-RT feed to JSON"))
            .unwrap();
        assert!(line.contains("DEBUG"));
        assert!(!line.contains("INFO"));
    }

    #[test]
    fn test_transform_json_output_is_not_reclassified() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_MEDIA_TYPE));
        let backend = BackendResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::from_static(b"{}"),
        };

        assert!(matches!(transform(backend, "/vehicles"), Outcome::Passthrough(_)));
    }
}

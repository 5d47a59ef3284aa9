//! HTTP host for the transform filter.
//!
//! Every request that reaches the router, whatever its method or path, is
//! rewritten onto the upstream base URL and run through [`filter::handle`].
//! The host only deals with what a hop between two HTTP connections has to:
//! connection-scoped headers and the `Host` header are dropped on the way in
//! and connection-scoped headers on the way out.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use reqwest::Url;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::fetch::HttpClient;
use crate::filter::{self, InboundRequest, ProxyResponse};

/// Headers that describe a single connection rather than the message.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

/// Shared, read-only state for the proxy handler.
pub struct AppState<C> {
    pub client: C,
    pub upstream: Url,
}

/// Builds the proxy router.
pub fn router<C: HttpClient + 'static>(client: C, upstream: Url, max_body_bytes: usize) -> Router {
    let state = Arc::new(AppState { client, upstream });

    Router::new()
        .fallback(proxy_handler::<C>)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Serves `app` on `listener` until Ctrl+C.
pub async fn serve(listener: TcpListener, app: Router) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "Proxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn proxy_handler<C: HttpClient + 'static>(
    State(state): State<Arc<AppState<C>>>,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = match upstream_url(&state.upstream, &uri) {
        Ok(url) => url,
        Err(e) => {
            warn!(uri = %uri, error = %e, "Cannot map request onto upstream");
            return (StatusCode::BAD_REQUEST, "Bad Request\n").into_response();
        }
    };

    headers.remove(header::HOST);
    strip_hop_by_hop(&mut headers);

    let req = InboundRequest {
        method,
        url,
        headers,
        body,
    };
    let mut resp = filter::handle(&state.client, req).await;
    strip_hop_by_hop(&mut resp.headers);
    resp.into_response()
}

/// Appends the path and query of `uri` to the upstream base URL.
pub fn upstream_url(upstream: &Url, uri: &Uri) -> Result<Url> {
    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let base = upstream.as_str().trim_end_matches('/');
    Ok(format!("{base}{path_and_query}").parse()?)
}

/// Removes connection-scoped headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

impl IntoResponse for ProxyResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

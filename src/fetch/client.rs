use async_trait::async_trait;
use reqwest::{Request, Response};

/// Sends a fully built request to a backend and hands back its response.
///
/// The transform filter only ever talks to a backend through this trait, so
/// tests can substitute canned responses for a live server.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}

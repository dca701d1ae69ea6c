use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};

static ORIGIN_AGENT_CLUSTER: HeaderName = HeaderName::from_static("origin-agent-cluster");

/// Playground-mode counterpart of the CSP layer.
///
/// Every response opts the playground origin into its own agent cluster,
/// which keeps the preview iframes out of the embedding site's process.
pub async fn playground_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(ORIGIN_AGENT_CLUSTER.clone(), HeaderValue::from_static("?1"));
    response
}

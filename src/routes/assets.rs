use std::path::Path;

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use tower_http::services::ServeDir;

/// Serves the static root, preferring `.br` then `.gz` siblings when the
/// client accepts them. Directories resolve to their `index.html`.
pub fn asset_service(root: &Path) -> ServeDir {
    ServeDir::new(root)
        .precompressed_br()
        .precompressed_gzip()
        .append_index_html_on_directories(true)
}

/// Fonts get a short shared cache lifetime.
pub async fn font_cache_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let is_font = request.uri().path().contains("/fonts/");
    let mut response = next.run(request).await;

    if is_font && matches!(response.status(), StatusCode::OK | StatusCode::NOT_MODIFIED) {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=3600"));
    }
    response
}

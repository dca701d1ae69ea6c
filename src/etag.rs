// Weak ETags and If-None-Match revalidation for static responses
// Tags come from size, mtime and content coding of the served file.

use std::time::UNIX_EPOCH;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode},
    middleware::Next,
};

/// Headers a 304 keeps from the full response.
const NOT_MODIFIED_HEADERS: [header::HeaderName; 7] = [
    header::CACHE_CONTROL,
    header::CONTENT_LOCATION,
    header::DATE,
    header::ETAG,
    header::EXPIRES,
    header::LAST_MODIFIED,
    header::VARY,
];

/// `W/"<size>-<mtime>[-<coding>]"`, or `None` when the response lacks the
/// headers to derive one from.
pub fn weak_etag(headers: &HeaderMap) -> Option<HeaderValue> {
    let length: u64 = headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()?;
    let modified = httpdate::parse_http_date(headers.get(header::LAST_MODIFIED)?.to_str().ok()?).ok()?;
    let seconds = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();

    let tag = match headers.get(header::CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        Some(coding) if coding.bytes().all(|b| b.is_ascii_alphanumeric()) => {
            format!("W/\"{length:x}-{seconds:x}-{coding}\"")
        }
        _ => format!("W/\"{length:x}-{seconds:x}\""),
    };
    HeaderValue::from_str(&tag).ok()
}

/// Weak comparison of an `If-None-Match` list against a tag.
pub fn if_none_match_matches(if_none_match: &HeaderValue, etag: &HeaderValue) -> bool {
    let (Ok(list), Ok(etag)) = (if_none_match.to_str(), etag.to_str()) else {
        return false;
    };
    let opaque = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let etag = opaque(etag);

    list.split(',').any(|candidate| {
        let candidate = candidate.trim();
        candidate == "*" || opaque(candidate) == etag
    })
}

/// Adds an ETag to successful GET/HEAD responses and turns them into
/// `304 Not Modified` when the client already holds that version.
pub async fn etag_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let cacheable = matches!(*request.method(), Method::GET | Method::HEAD);
    let if_none_match = request.headers().get(header::IF_NONE_MATCH).cloned();

    let mut response = next.run(request).await;
    if !cacheable || response.status() != StatusCode::OK {
        return response;
    }

    let Some(etag) = weak_etag(response.headers()) else {
        return response;
    };
    response.headers_mut().insert(header::ETAG, etag.clone());

    match if_none_match {
        Some(value) if if_none_match_matches(&value, &etag) => not_modified(&response),
        _ => response,
    }
}

fn not_modified(full: &Response<Body>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;

    let headers = response.headers_mut();
    for name in NOT_MODIFIED_HEADERS {
        if let Some(value) = full.headers().get(&name) {
            headers.insert(name, value.clone());
        }
    }
    response
}

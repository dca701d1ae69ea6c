// Redirect table, loaded once from the deployment's JSON file. Validation
// makes rule order irrelevant and keeps every redirect to a single hop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::csp::REPORT_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    #[default]
    Exact,
    /// Source must end with `/`; matches it and everything below it.
    Prefix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedirectKind {
    /// 301, for canonical URL moves.
    #[default]
    Permanent,
    /// 302, for environment-specific redirects.
    Temporary,
}

impl RedirectKind {
    pub fn status(self) -> StatusCode {
        match self {
            RedirectKind::Permanent => StatusCode::MOVED_PERMANENTLY,
            RedirectKind::Temporary => StatusCode::FOUND,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RedirectRule {
    pub from: String,
    pub to: String,
    #[serde(default, rename = "match")]
    pub match_kind: MatchKind,
    #[serde(default)]
    pub status: RedirectKind,
}

impl RedirectRule {
    pub fn exact(from: &str, to: &str, status: RedirectKind) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            match_kind: MatchKind::Exact,
            status,
        }
    }

    pub fn prefix(from: &str, to: &str, status: RedirectKind) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            match_kind: MatchKind::Prefix,
            status,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.match_kind {
            MatchKind::Exact => path == self.from,
            MatchKind::Prefix => path.starts_with(&self.from),
        }
    }

    fn is_local(&self) -> bool {
        self.to.starts_with('/') && !self.to.starts_with("//")
    }

    /// Target path with any query or fragment removed.
    fn target_path(&self) -> &str {
        self.to.split(['?', '#']).next().unwrap_or(&self.to)
    }
}

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("failed to read redirect table {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse redirect table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("redirect source {from:?} must be a normalized path starting with '/'")]
    InvalidSource { from: String },
    #[error("prefix redirect source {from:?} must end with '/'")]
    PrefixWithoutSlash { from: String },
    #[error("redirect from {from:?} has an empty target")]
    EmptyTarget { from: String },
    #[error("redirect from {from:?} has invalid target {to:?}")]
    InvalidTarget { from: String, to: String },
    #[error("redirect source {from:?} is declared twice")]
    Duplicate { from: String },
    #[error("redirect sources {first:?} and {second:?} overlap with different targets")]
    Ambiguous { first: String, second: String },
    #[error("redirect from {from:?} targets {to:?}, which is itself redirected")]
    Chain { from: String, to: String },
    #[error("redirect source {from:?} covers the reserved path {reserved}")]
    ReservedPath { from: String, reserved: &'static str },
}

#[derive(Debug, Default, Deserialize)]
struct RedirectFile {
    #[serde(default)]
    rules: Vec<RedirectRule>,
}

/// Where a matched request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    pub location: String,
    pub kind: RedirectKind,
}

/// Validated, ordered redirect rules.
#[derive(Debug, Clone, Default)]
pub struct RedirectTable {
    rules: Vec<RedirectRule>,
}

impl RedirectTable {
    pub fn new(rules: Vec<RedirectRule>) -> Result<Self, RedirectError> {
        for rule in &rules {
            validate_rule(rule)?;
            if rule.matches(REPORT_PATH) {
                return Err(RedirectError::ReservedPath {
                    from: rule.from.clone(),
                    reserved: REPORT_PATH,
                });
            }
        }

        for (i, first) in rules.iter().enumerate() {
            for second in &rules[i + 1..] {
                if !(first.matches(&second.from) || second.matches(&first.from)) {
                    continue;
                }
                if first.match_kind == MatchKind::Exact
                    && second.match_kind == MatchKind::Exact
                {
                    return Err(RedirectError::Duplicate {
                        from: first.from.clone(),
                    });
                }
                if first.to != second.to || first.status != second.status {
                    return Err(RedirectError::Ambiguous {
                        first: first.from.clone(),
                        second: second.from.clone(),
                    });
                }
            }
        }

        let table = Self { rules };
        for rule in table.rules.iter().filter(|r| r.is_local()) {
            let target = normalize_path(rule.target_path());
            if target.is_some_and(|path| table.find(&path).is_some()) {
                return Err(RedirectError::Chain {
                    from: rule.from.clone(),
                    to: rule.to.clone(),
                });
            }
        }
        Ok(table)
    }

    pub fn from_json(json: &str) -> Result<Self, RedirectError> {
        let file: RedirectFile = serde_json::from_str(json)?;
        Self::new(file.rules)
    }

    pub fn load(path: &Path) -> Result<Self, RedirectError> {
        let json = std::fs::read_to_string(path).map_err(|source| RedirectError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn rules(&self) -> &[RedirectRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn find(&self, path: &str) -> Option<&RedirectRule> {
        self.rules.iter().find(|rule| rule.matches(path))
    }

    /// First matching rule's target for a request path (no query string).
    pub fn resolve(&self, path: &str) -> Option<RedirectTarget> {
        self.find(path).map(|rule| RedirectTarget {
            location: rule.to.clone(),
            kind: rule.status,
        })
    }
}

fn validate_rule(rule: &RedirectRule) -> Result<(), RedirectError> {
    // Requests are matched after normalization, so other sources are dead.
    if !rule.from.starts_with('/') || normalize_path(&rule.from).as_deref() != Some(rule.from.as_str()) {
        return Err(RedirectError::InvalidSource {
            from: rule.from.clone(),
        });
    }
    if rule.match_kind == MatchKind::Prefix && !rule.from.ends_with('/') {
        return Err(RedirectError::PrefixWithoutSlash {
            from: rule.from.clone(),
        });
    }
    if rule.to.trim().is_empty() {
        return Err(RedirectError::EmptyTarget {
            from: rule.from.clone(),
        });
    }

    let invalid = || RedirectError::InvalidTarget {
        from: rule.from.clone(),
        to: rule.to.clone(),
    };
    if HeaderValue::from_str(&rule.to).is_err() || rule.to.contains(char::is_whitespace) {
        return Err(invalid());
    }
    if !rule.is_local() {
        let url = Url::parse(&rule.to).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Request path as the static file service resolves it: percent-decoded,
/// with empty and `.` segments dropped. A trailing slash survives. Returns
/// `None` when the decoded bytes are not UTF-8 or a segment is `..`; the
/// file service refuses those paths as well.
pub fn normalize_path(path: &str) -> Option<String> {
    let decoded = String::from_utf8(percent_decode(path.as_bytes())).ok()?;

    let mut normalized = String::with_capacity(decoded.len());
    let mut trailing_slash = false;
    for segment in decoded.split('/') {
        match segment {
            "" | "." => trailing_slash = true,
            ".." => return None,
            segment => {
                normalized.push('/');
                normalized.push_str(segment);
                trailing_slash = false;
            }
        }
    }
    if normalized.is_empty() || trailing_slash {
        normalized.push('/');
    }
    Some(normalized)
}

// Malformed escapes are kept as literal bytes.
fn percent_decode(input: &[u8]) -> Vec<u8> {
    let hex = |b: u8| (b as char).to_digit(16);
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                input.get(i + 1).and_then(|&b| hex(b)),
                input.get(i + 2).and_then(|&b| hex(b)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Redirect middleware. Runs before everything else and short-circuits on
/// a match, so redirect responses carry no policy headers. Every method is
/// redirected; the report endpoint cannot be shadowed because no rule may
/// cover it.
pub async fn redirect_middleware(
    State(table): State<Arc<RedirectTable>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let Some(path) = normalize_path(request.uri().path()) else {
        return next.run(request).await;
    };

    if let Some(target) = table.resolve(&path) {
        tracing::debug!(
            from = %path,
            method = %request.method(),
            to = %target.location,
            status = target.kind.status().as_u16(),
            "redirect"
        );
        // Targets were checked to be header-safe when the table was built.
        if let Ok(location) = HeaderValue::from_str(&target.location) {
            return (target.kind.status(), [(header::LOCATION, location)]).into_response();
        }
    }

    next.run(request).await
}

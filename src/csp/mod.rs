// Content Security Policy module
// Hashes come from the manifest the site build writes next to the pages.

pub mod manifest;
pub mod report;

pub use manifest::{InlineScriptHashes, ManifestError, MANIFEST_FILE_NAME};
pub use report::{handle_violation_report, HandledOutcome, ViolationReport, ViolationReporter};

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, header::InvalidHeaderValue, HeaderName, HeaderValue, Request, Response},
    middleware::Next,
};
use thiserror::Error;

/// Path browsers post violation reports to.
pub const REPORT_PATH: &str = "/__cspreport__";

/// Reporting API group name used by `report-to`.
pub const REPORT_GROUP: &str = "csp-endpoint";

static REPORTING_ENDPOINTS: HeaderName = HeaderName::from_static("reporting-endpoints");

#[derive(Debug, Error)]
pub enum CspError {
    #[error("assembled Content-Security-Policy is not a valid header value")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

#[derive(Debug, Clone, Default)]
pub struct CspOptions {
    pub report_violations: bool,
    /// Serialized origin the site embeds playground previews from.
    pub playground_origin: Option<String>,
}

/// Ordered directive name to source list mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CspDirectiveSet {
    directives: Vec<(&'static str, Vec<String>)>,
}

impl CspDirectiveSet {
    pub fn new(hashes: &InlineScriptHashes, options: &CspOptions) -> Self {
        let mut script_src = vec!["'self'".to_string()];
        script_src.extend(hashes.iter().map(|h| format!("'sha256-{h}'")));

        // - script-src: same origin plus the inline scripts the build hashed
        // - style-src: inline styles stay allowed (lower risk than scripts)
        // - object-src: no plugins
        // - base-uri: no <base> injection
        // - frame-ancestors: no clickjacking
        let mut directives = vec![
            ("default-src", sources(&["'self'"])),
            ("script-src", script_src),
            ("style-src", sources(&["'self'", "'unsafe-inline'"])),
            ("img-src", sources(&["'self'", "data:", "https:"])),
            ("font-src", sources(&["'self'", "data:"])),
            ("object-src", sources(&["'none'"])),
            ("base-uri", sources(&["'self'"])),
            ("form-action", sources(&["'self'"])),
            ("frame-ancestors", sources(&["'none'"])),
        ];

        if let Some(origin) = &options.playground_origin {
            directives.push(("frame-src", vec!["'self'".to_string(), origin.clone()]));
        }

        if options.report_violations {
            directives.push(("report-uri", sources(&[REPORT_PATH])));
            directives.push(("report-to", sources(&[REPORT_GROUP])));
        }

        Self { directives }
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(directive, _)| *directive == name)
            .map(|(_, tokens)| tokens.as_slice())
    }

    /// `name token token; name token; ...`
    pub fn serialize(&self) -> String {
        self.directives
            .iter()
            .map(|(name, tokens)| {
                let mut directive = name.to_string();
                for token in tokens {
                    directive.push(' ');
                    directive.push_str(token);
                }
                directive
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn sources(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

/// The policy every main-mode response carries, serialized once.
#[derive(Debug, Clone)]
pub struct ContentSecurityPolicy {
    header: HeaderValue,
    reporting_endpoints: Option<HeaderValue>,
}

impl ContentSecurityPolicy {
    pub fn header_value(&self) -> &HeaderValue {
        &self.header
    }

    pub fn as_str(&self) -> &str {
        // Built from a String, so always visible ASCII.
        self.header.to_str().unwrap_or_default()
    }

    pub fn reporting_endpoints(&self) -> Option<&HeaderValue> {
        self.reporting_endpoints.as_ref()
    }
}

/// Assembles and serializes the policy. The hash set is non-empty by
/// construction, so the result always restricts `script-src`.
pub fn build_policy_header(
    hashes: &InlineScriptHashes,
    options: &CspOptions,
) -> Result<ContentSecurityPolicy, CspError> {
    let header = HeaderValue::from_str(&CspDirectiveSet::new(hashes, options).serialize())?;
    let reporting_endpoints = if options.report_violations {
        Some(HeaderValue::from_str(&format!(
            "{REPORT_GROUP}=\"{REPORT_PATH}\""
        ))?)
    } else {
        None
    };

    Ok(ContentSecurityPolicy {
        header,
        reporting_endpoints,
    })
}

/// State owned by the CSP layer for the life of the process.
#[derive(Debug)]
pub struct CspState {
    policy: ContentSecurityPolicy,
    reporter: Option<ViolationReporter>,
}

impl CspState {
    pub fn new(policy: ContentSecurityPolicy, report_violations: bool) -> Self {
        Self {
            policy,
            reporter: report_violations.then(ViolationReporter::new),
        }
    }

    pub fn policy(&self) -> &ContentSecurityPolicy {
        &self.policy
    }

    pub fn reporter(&self) -> Option<&ViolationReporter> {
        self.reporter.as_ref()
    }
}

/// CSP middleware that adds Content-Security-Policy header to all responses
/// and answers the violation report endpoint.
pub async fn csp_middleware(
    State(state): State<Arc<CspState>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    if request.uri().path() == REPORT_PATH {
        return report::report_endpoint(request, state.reporter()).await;
    }

    let mut response = next.run(request).await;

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_SECURITY_POLICY, state.policy.header.clone());
    if let Some(endpoints) = &state.policy.reporting_endpoints {
        headers.insert(REPORTING_ENDPOINTS.clone(), endpoints.clone());
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(tokens: &[&str]) -> InlineScriptHashes {
        InlineScriptHashes::new(tokens).unwrap()
    }

    #[test]
    fn test_script_src_is_hash_restricted() {
        let policy = build_policy_header(&hashes(&["abc123"]), &CspOptions::default()).unwrap();
        assert!(policy.as_str().contains("script-src 'self' 'sha256-abc123';"));
        assert!(!policy.as_str().contains("report-uri"));
        assert!(policy.reporting_endpoints().is_none());
    }

    #[test]
    fn test_full_header_layout() {
        let policy = build_policy_header(&hashes(&["h1", "h2"]), &CspOptions::default()).unwrap();
        assert_eq!(
            policy.as_str(),
            "default-src 'self'; \
             script-src 'self' 'sha256-h1' 'sha256-h2'; \
             style-src 'self' 'unsafe-inline'; \
             img-src 'self' data: https:; \
             font-src 'self' data:; \
             object-src 'none'; \
             base-uri 'self'; \
             form-action 'self'; \
             frame-ancestors 'none'"
        );
    }

    #[test]
    fn test_every_hash_appears_exactly_once() {
        let set = hashes(&["a+b/", "c=", "a+b/", "sha256-c=", "d_e-"]);
        let directives = CspDirectiveSet::new(&set, &CspOptions::default());
        let script_src = directives.get("script-src").unwrap();

        let hash_tokens: Vec<&str> = script_src
            .iter()
            .filter(|t| t.starts_with("'sha256-"))
            .map(String::as_str)
            .collect();
        assert_eq!(hash_tokens, vec!["'sha256-a+b/'", "'sha256-c='", "'sha256-d_e-'"]);
        assert_eq!(script_src[0], "'self'");
        assert!(!script_src.iter().any(|t| t == "*" || t == "'unsafe-inline'"));
    }

    #[test]
    fn test_build_is_idempotent() {
        let set = hashes(&["x", "y", "z"]);
        let options = CspOptions {
            report_violations: true,
            playground_origin: Some("https://playground.example.dev".to_string()),
        };
        let first = build_policy_header(&set, &options).unwrap();
        let second = build_policy_header(&set, &options).unwrap();
        assert_eq!(first.header_value().as_bytes(), second.header_value().as_bytes());
    }

    #[test]
    fn test_reporting_directives() {
        let options = CspOptions {
            report_violations: true,
            playground_origin: None,
        };
        let policy = build_policy_header(&hashes(&["abc"]), &options).unwrap();
        assert!(policy
            .as_str()
            .ends_with("; report-uri /__cspreport__; report-to csp-endpoint"));
        assert_eq!(
            policy.reporting_endpoints().unwrap(),
            "csp-endpoint=\"/__cspreport__\""
        );
    }

    #[test]
    fn test_playground_origin_framed() {
        let options = CspOptions {
            report_violations: false,
            playground_origin: Some("https://playground.example.dev".to_string()),
        };
        let directives = CspDirectiveSet::new(&hashes(&["abc"]), &options);
        assert_eq!(
            directives.get("frame-src").unwrap(),
            &["'self'".to_string(), "https://playground.example.dev".to_string()]
        );
    }

    #[test]
    fn test_empty_hash_set_cannot_reach_policy() {
        let none: [&str; 0] = [];
        assert!(matches!(
            InlineScriptHashes::new(none),
            Err(ManifestError::Empty)
        ));
    }

    #[test]
    fn test_reporter_only_when_enabled() {
        let policy = build_policy_header(&hashes(&["abc"]), &CspOptions::default()).unwrap();
        assert!(CspState::new(policy.clone(), false).reporter().is_none());
        assert!(CspState::new(policy, true).reporter().is_some());
    }
}

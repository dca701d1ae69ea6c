// CSP violation reports, legacy `application/csp-report` documents or
// Reporting API batches (`application/reports+json`). The browser always
// gets a 204.

use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    body::Body,
    http::{header, Method, Request, Response, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;

/// Upper bound on a report body; browsers send a few KiB at most.
pub const MAX_REPORT_BYTES: usize = 64 * 1024;

/// One CSP violation, normalized across both payload shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViolationReport {
    pub document_uri: Option<String>,
    pub blocked_uri: Option<String>,
    pub effective_directive: Option<String>,
    pub violated_directive: Option<String>,
    pub source_file: Option<String>,
    pub line_number: Option<u64>,
    pub column_number: Option<u64>,
    pub disposition: Option<String>,
    pub sample: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LegacyEnvelope {
    csp_report: LegacyReport,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct LegacyReport {
    document_uri: Option<String>,
    blocked_uri: Option<String>,
    effective_directive: Option<String>,
    violated_directive: Option<String>,
    source_file: Option<String>,
    line_number: Option<u64>,
    column_number: Option<u64>,
    disposition: Option<String>,
    script_sample: Option<String>,
}

#[derive(Deserialize)]
struct ReportingApiReport {
    #[serde(rename = "type")]
    kind: String,
    body: Option<ReportingApiBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportingApiBody {
    #[serde(rename = "documentURL")]
    document_url: Option<String>,
    #[serde(rename = "blockedURL")]
    blocked_url: Option<String>,
    effective_directive: Option<String>,
    source_file: Option<String>,
    line_number: Option<u64>,
    column_number: Option<u64>,
    disposition: Option<String>,
    sample: Option<String>,
}

impl From<LegacyReport> for ViolationReport {
    fn from(r: LegacyReport) -> Self {
        Self {
            document_uri: r.document_uri,
            blocked_uri: r.blocked_uri,
            effective_directive: r.effective_directive,
            violated_directive: r.violated_directive,
            source_file: r.source_file,
            line_number: r.line_number,
            column_number: r.column_number,
            disposition: r.disposition,
            sample: r.script_sample,
        }
    }
}

impl From<ReportingApiBody> for ViolationReport {
    fn from(b: ReportingApiBody) -> Self {
        Self {
            document_uri: b.document_url,
            blocked_uri: b.blocked_url,
            violated_directive: b.effective_directive.clone(),
            effective_directive: b.effective_directive,
            source_file: b.source_file,
            line_number: b.line_number,
            column_number: b.column_number,
            disposition: b.disposition,
            sample: b.sample,
        }
    }
}

/// Parses a report body in either format. Batch entries are taken one at a
/// time: non-CSP entries and entries that do not parse are skipped without
/// affecting their siblings.
pub fn parse_reports(body: &[u8]) -> Result<Vec<ViolationReport>, serde_json::Error> {
    // Dispatch on the JSON shape; serde would also accept a struct in
    // sequence form, which must not pass for a legacy envelope.
    let value: serde_json::Value = serde_json::from_slice(body)?;
    if let serde_json::Value::Array(entries) = value {
        Ok(entries
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<ReportingApiReport>(entry).ok())
            .filter(|entry| entry.kind == "csp-violation")
            .filter_map(|entry| entry.body)
            .map(ViolationReport::from)
            .collect())
    } else {
        let envelope: LegacyEnvelope = serde_json::from_value(value)?;
        Ok(vec![envelope.csp_report.into()])
    }
}

/// What became of a posted report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandledOutcome {
    /// Reporting is off; the body was not looked at.
    Disabled,
    /// This many violations were logged.
    Recorded(usize),
    /// The body could not be read or held no violations.
    Ignored,
}

/// Violation counters shared by all in-flight requests.
#[derive(Debug, Default)]
pub struct ViolationReporter {
    recorded: AtomicU64,
    ignored: AtomicU64,
}

impl ViolationReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    fn record(&self, body: &[u8]) -> HandledOutcome {
        let reports = match parse_reports(body) {
            Ok(reports) if !reports.is_empty() => reports,
            Ok(_) => {
                tracing::debug!("CSP report without violations");
                return self.ignore();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Malformed CSP report");
                return self.ignore();
            }
        };

        for r in &reports {
            let total = self.recorded.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                document_uri = r.document_uri.as_deref().unwrap_or("-"),
                blocked_uri = r.blocked_uri.as_deref().unwrap_or("-"),
                effective_directive = r.effective_directive.as_deref().unwrap_or("-"),
                violated_directive = r.violated_directive.as_deref().unwrap_or("-"),
                source_file = r.source_file.as_deref().unwrap_or("-"),
                line_number = r.line_number.unwrap_or(0),
                column_number = r.column_number.unwrap_or(0),
                disposition = r.disposition.as_deref().unwrap_or("-"),
                sample = r.sample.as_deref().unwrap_or("-"),
                total,
                "CSP violation"
            );
        }
        HandledOutcome::Recorded(reports.len())
    }

    fn ignore(&self) -> HandledOutcome {
        self.ignored.fetch_add(1, Ordering::Relaxed);
        HandledOutcome::Ignored
    }
}

/// Handles one report body. With reporting disabled the body is never
/// parsed.
pub fn handle_violation_report(body: &[u8], reporter: Option<&ViolationReporter>) -> HandledOutcome {
    match reporter {
        Some(reporter) => reporter.record(body),
        None => HandledOutcome::Disabled,
    }
}

/// `POST /__cspreport__`
pub async fn report_endpoint(
    request: Request<Body>,
    reporter: Option<&ViolationReporter>,
) -> Response<Body> {
    let Some(reporter) = reporter else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if request.method() != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "POST")]).into_response();
    }

    match axum::body::to_bytes(request.into_body(), MAX_REPORT_BYTES).await {
        Ok(body) => {
            handle_violation_report(&body, Some(reporter));
        }
        Err(e) => {
            tracing::debug!(error = %e, "Unreadable CSP report body");
            reporter.ignore();
        }
    }

    StatusCode::NO_CONTENT.into_response()
}

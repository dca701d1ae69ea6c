use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::csp::MANIFEST_FILE_NAME;

/// Which tree the server fronts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The documentation site, served with a hash-restricted CSP.
    Main,
    /// Static assets of the code playground, served from a separate origin.
    Playground,
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" => Ok(Mode::Main),
            "playground" => Ok(Mode::Playground),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Main => f.write_str("main"),
            Mode::Playground => f.write_str("playground"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env must be set")]
    Missing(&'static str),
    #[error("MODE env must be \"main\" or \"playground\", was {0:?}")]
    InvalidMode(String),
    #[error("PORT env must be a port number, was {0:?}")]
    InvalidPort(String),
    #[error("PLAYGROUND_ORIGIN env must be an http(s) origin, was {value:?}: {reason}")]
    InvalidPlaygroundOrigin { value: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub port: u16,
    pub report_csp_violations: bool,
    pub static_root: PathBuf,
    pub csp_hashes_file: PathBuf,
    pub redirects_file: Option<PathBuf>,
    pub playground_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode: Mode = lookup("MODE")
            .ok_or(ConfigError::Missing("MODE"))?
            .parse()?;

        let port_raw = lookup("PORT").ok_or(ConfigError::Missing("PORT"))?;
        let port = port_raw
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(port_raw.clone()))?;

        // Anything other than the literal "true" leaves reporting off.
        let report_csp_violations = lookup("REPORT_CSP_VIOLATIONS").as_deref() == Some("true");

        let content_dir = lookup("CONTENT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("content"));

        let static_root = lookup("STATIC_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| match mode {
                Mode::Main => content_dir.join("_site"),
                Mode::Playground => content_dir.join("node_modules").join("playground-elements"),
            });

        let csp_hashes_file = lookup("CSP_HASHES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| static_root.join(MANIFEST_FILE_NAME));

        let redirects_file = lookup("REDIRECTS_FILE").map(PathBuf::from);

        let playground_origin = lookup("PLAYGROUND_ORIGIN")
            .map(|value| parse_origin(&value))
            .transpose()?;

        Ok(Self {
            mode,
            port,
            report_csp_violations,
            static_root,
            csp_hashes_file,
            redirects_file,
            playground_origin,
        })
    }
}

/// Reduces an absolute http(s) URL to its serialized origin.
fn parse_origin(value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidPlaygroundOrigin {
        value: value.to_string(),
        reason,
    };

    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    let origin = url.origin();
    if !origin.is_tuple() {
        return Err(invalid("opaque origin".to_string()));
    }
    Ok(origin.ascii_serialization())
}

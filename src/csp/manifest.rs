// Inline script hash manifest, one base64 SHA-256 digest per line
// Read once at startup; a manifest that fails to load stops the server.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

/// File name the site build writes the manifest under.
pub const MANIFEST_FILE_NAME: &str = "csp-inline-script-hashes.txt";

const ALGORITHM_PREFIX: &str = "sha256-";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("could not read file: {0}")]
    Read(#[from] std::io::Error),
    #[error("manifest contains no hashes")]
    Empty,
    #[error("entry {entry} is not a base64 hash: {token:?}")]
    InvalidToken { entry: usize, token: String },
}

/// Non-empty, de-duplicated set of base64 inline script digests, in
/// manifest order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineScriptHashes {
    hashes: Vec<String>,
}

impl InlineScriptHashes {
    pub fn new<I, S>(tokens: I) -> Result<Self, ManifestError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut hashes = Vec::new();

        for (index, token) in tokens.into_iter().enumerate() {
            let hash = normalize_token(token.as_ref()).ok_or_else(|| {
                ManifestError::InvalidToken {
                    entry: index + 1,
                    token: token.as_ref().to_string(),
                }
            })?;
            if seen.insert(hash.to_string()) {
                hashes.push(hash.to_string());
            }
        }

        if hashes.is_empty() {
            return Err(ManifestError::Empty);
        }
        Ok(Self { hashes })
    }

    /// Parses manifest text: one hash per line, surrounding whitespace and
    /// blank lines ignored.
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        Self::new(content.lines().map(str::trim).filter(|line| !line.is_empty()))
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hashes.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

/// Strips an optional `sha256-` prefix and checks the remainder only uses
/// the base64 (or base64url) alphabet.
fn normalize_token(token: &str) -> Option<&str> {
    let token = token.trim();
    let hash = token.strip_prefix(ALGORITHM_PREFIX).unwrap_or(token);
    let valid = !hash.is_empty()
        && hash
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'-' | b'_' | b'='));
    valid.then_some(hash)
}

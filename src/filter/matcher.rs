use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Filter errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
}

/// Result type for filter operations
pub type FilterResult<T> = Result<T, FilterError>;

static HOSTNAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9\-]{0,61}[a-z0-9])?)*$")
        .expect("hostname regex compiles")
});

/// Scheme plus host of a page, the unit every policy is keyed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub scheme: String,
    pub hostname: String,
    pub port: Option<u16>,
}

impl Origin {
    /// `scheme://host[:port]`
    pub fn as_origin_string(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.hostname, port),
            None => format!("{}://{}", self.scheme, self.hostname),
        }
    }
}

/// Reduce a page URL to its origin. Only http and https are accepted.
pub fn normalize_url(input: &str) -> FilterResult<Origin> {
    let raw = input.trim();
    let parsed = Url::parse(raw).map_err(|e| FilterError::InvalidUrl(format!("{}: {}", raw, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(FilterError::UnsupportedScheme(other.to_string())),
    }

    let hostname = parsed
        .host_str()
        .map(|h| h.trim_end_matches('.').to_lowercase())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| FilterError::InvalidUrl(raw.to_string()))?;

    validate_hostname(&hostname)?;

    Ok(Origin {
        scheme: parsed.scheme().to_string(),
        hostname,
        port: parsed.port(),
    })
}

/// Check that `hostname` is a plain DNS name (or dotted IPv4 literal)
pub fn validate_hostname(hostname: &str) -> FilterResult<()> {
    if hostname.len() > 253 || !HOSTNAME_REGEX.is_match(hostname) {
        return Err(FilterError::InvalidUrl(hostname.to_string()));
    }
    Ok(())
}

/// Whether a policy registered for `policy_host` covers `candidate`.
///
/// Matches the host itself and every subdomain of it, the same convention the
/// `||host^` rule filter uses, so decisions, rules and tab broadcasts agree.
pub fn host_matches(policy_host: &str, candidate: &str) -> bool {
    let policy_host = policy_host.to_lowercase();
    let candidate = candidate.trim_end_matches('.').to_lowercase();

    if candidate == policy_host {
        return true;
    }

    candidate.len() > policy_host.len()
        && candidate.ends_with(&policy_host)
        && candidate.as_bytes()[candidate.len() - policy_host.len() - 1] == b'.'
}

/// Rule filter string for a hostname
pub fn url_filter_for(hostname: &str) -> String {
    format!("||{}^", hostname)
}

/// Hostname targeted by a `||host^` filter, if the filter has that shape
pub fn hostname_from_url_filter(filter: &str) -> Option<&str> {
    filter
        .strip_prefix("||")
        .and_then(|rest| rest.strip_suffix('^'))
        .filter(|host| !host.is_empty())
}

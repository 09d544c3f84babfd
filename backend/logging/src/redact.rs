//! URL Redaction
//!
//! Module and repository URLs may carry credentials (`user:pass@host`) or
//! access tokens in the query string. Scrub both before logging.

use once_cell::sync::Lazy;
use regex::Regex;

static USERINFO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<scheme>[a-zA-Z][a-zA-Z0-9+.-]*://)[^/@]+@").unwrap());
static TOKEN_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?P<key>[?&](?:token|access_token|key|api_key|auth|sig|signature)=)[^&#]*")
        .unwrap()
});

/// Redacts credentials and token-like query parameters in a URL.
pub fn redact_url(url: &str) -> String {
    let redacted = USERINFO_RE.replace(url, "${scheme}[REDACTED]@");
    TOKEN_PARAM_RE
        .replace_all(&redacted, "${key}[REDACTED]")
        .into_owned()
}

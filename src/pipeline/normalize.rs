use url::Url;

use crate::error::SubmitError;

/// Reduce a submitted URL to `scheme://host/path`.
///
/// Scheme and host are lower-cased (the `url` crate does this while parsing),
/// query and fragment are dropped, the path is kept as given. Only http(s)
/// URLs with a host are accepted.
pub fn normalize_url(raw: &str) -> Result<String, SubmitError> {
    let raw = raw.trim();
    let invalid = |reason: &str| SubmitError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let parsed = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("only http and https URLs can be imported"));
    }
    let host = parsed.host_str().ok_or_else(|| invalid("URL has no host"))?;

    let mut normalized = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{}", port));
    }
    normalized.push_str(parsed.path());
    Ok(normalized)
}

pub mod rate_limit;

/// Get a header value as a string, if present and valid UTF-8.
pub(crate) fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

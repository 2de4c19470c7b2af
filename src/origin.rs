//! Origin validation for browser requests and WebSocket upgrades.
//!
//! The upgrade path has no other cross-origin defense, so matching is strict:
//! loopback hosts and the fixed production list, nothing else. Requests
//! without an Origin header (curl, native clients) are always accepted.

/// Origins allowed in addition to loopback.
const PRODUCTION_ORIGINS: &[&str] = &[
    "https://termlab.dev",
    "https://www.termlab.dev",
];

/// Whether a request carrying this `Origin` header value may proceed.
pub fn origin_allowed(origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if origin.is_empty() {
        return true;
    }
    if PRODUCTION_ORIGINS.contains(&origin) {
        return true;
    }
    is_loopback_origin(origin)
}

/// The origin value, if any, to echo back in `Access-Control-Allow-Origin`.
pub fn echo_origin(origin: Option<&str>) -> Option<&str> {
    match origin {
        Some(value) if !value.is_empty() && origin_allowed(Some(value)) => Some(value),
        _ => None,
    }
}

/// Exact match for `http(s)://localhost[:port]` and `http(s)://127.0.0.1[:port]`.
///
/// Anything trailing the authority (a path, a second colon, a host suffix)
/// fails the match. IPv6 loopback is deliberately not recognized.
fn is_loopback_origin(origin: &str) -> bool {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"));
    let Some(rest) = rest else {
        return false;
    };
    let host = match rest.split_once(':') {
        Some((host, port)) => {
            if port.is_empty() || port.parse::<u16>().is_err() {
                return false;
            }
            host
        }
        None => rest,
    };
    host == "localhost" || host == "127.0.0.1"
}

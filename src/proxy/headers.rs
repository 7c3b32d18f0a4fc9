use http::{HeaderMap, HeaderName, header};

/// Hop-by-hop headers that never cross the proxy in either direction.
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Whether a client request header (lowercase name) is passed to the upstream.
///
/// `Host` and the framing headers are regenerated by the proxy. `Accept-Encoding`
/// is withheld so stored bodies are always identity-encoded.
pub fn forwards_request_header(name: &str) -> bool {
    !(is_hop_by_hop(name)
        || name.starts_with("proxy-")
        || name == "host"
        || name == "content-length"
        || name == "accept-encoding")
}

/// Removes hop-by-hop headers, including any named by `Connection`, from an upstream response.
pub fn strip_response_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(name);
    }
}

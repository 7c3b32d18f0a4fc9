use http::Method;

use crate::proxy::message::ProxyRequest;

/// Methods whose requests carry `Content-Length` even when the body is empty.
fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Serializes a request for the upstream. `Host` is always the upstream authority.
pub(crate) fn build_upstream_request(request: &ProxyRequest, authority: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(256 + request.body.len());
    buffer.extend_from_slice(request.method.as_str().as_bytes());
    buffer.push(b' ');
    buffer.extend_from_slice(request.path.as_bytes());
    buffer.extend_from_slice(b" HTTP/1.1\r\n");

    buffer.extend_from_slice(b"Host: ");
    buffer.extend_from_slice(authority.as_bytes());
    buffer.extend_from_slice(b"\r\n");

    for (name, value) in request.headers.iter() {
        buffer.extend_from_slice(name.as_str().as_bytes());
        buffer.extend_from_slice(b": ");
        buffer.extend_from_slice(value.as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    if !request.body.is_empty() || expects_body(&request.method) {
        buffer.extend_from_slice(b"Content-Length: ");
        buffer.extend_from_slice(request.body.len().to_string().as_bytes());
        buffer.extend_from_slice(b"\r\n");
    }

    buffer.extend_from_slice(b"\r\n");
    buffer.extend_from_slice(&request.body);
    buffer
}

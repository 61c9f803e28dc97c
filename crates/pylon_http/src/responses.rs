//! Canned responses the proxy emits on its own behalf.

/// Build a minimal HTTP/1.1 response with a plain-text body.
pub fn error_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {len}\r\n\r\n{body}",
        len = body.len()
    )
    .into_bytes()
}

/// Sent when the client stream cannot be parsed.
pub fn bad_request() -> Vec<u8> {
    error_response(400, "Bad Request", "Invalid request")
}

/// Sent when the upstream side fails before a response was relayed.
pub fn bad_gateway() -> Vec<u8> {
    error_response(502, "Bad Gateway", "Internal error")
}

#[cfg(test)]
mod tests {
    use super::{bad_gateway, bad_request};

    #[test]
    fn bad_request_bytes_are_exact() {
        assert_eq!(
            bad_request(),
            b"HTTP/1.1 400 Bad Request\r\nContent-Length: 15\r\n\r\nInvalid request".to_vec()
        );
    }

    #[test]
    fn bad_gateway_bytes_are_exact() {
        assert_eq!(
            bad_gateway(),
            b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 14\r\n\r\nInternal error".to_vec()
        );
    }
}

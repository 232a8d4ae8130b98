//! HTTP basic authorization header values
//!
//! Clients authenticate the WebSocket upgrade with `Authorization: Basic ...`.
//! The server resolves the header to a name/secret pair before any envelope
//! is exchanged.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const SCHEME: &str = "Basic ";

/// Build the header value for `name` and `secret`
pub fn encode(name: &str, secret: &str) -> String {
    format!("{SCHEME}{}", STANDARD.encode(format!("{name}:{secret}")))
}

/// Split a header value into name and secret
///
/// Returns `None` for other schemes, invalid base64 or a missing separator.
/// The secret may itself contain `:`.
pub fn decode(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix(SCHEME)?.trim();
    let decoded = STANDARD.decode(encoded).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (name, secret) = credentials.split_once(':')?;
    Some((name.to_string(), secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_rfc7617_example() {
        assert_eq!(encode("Aladdin", "open sesame"), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn decodes_secret_containing_separator() {
        let header = encode("alice", "a:b:c");
        assert_eq!(decode(&header), Some(("alice".into(), "a:b:c".into())));
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert_eq!(decode("Bearer abc"), None);
        assert_eq!(decode("Basic !!!"), None);
        assert_eq!(decode(&format!("Basic {}", STANDARD.encode("nocolon"))), None);
    }
}

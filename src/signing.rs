// ─────────────────────────────────────────────────────────────────────────────
// signing.rs — OKX v5 Request Signing
//
// Both the REST API and the private WebSocket authenticate with the same
// construction: Base64(HMAC-SHA256(secret, prehash)). Only the timestamp
// format and the prehash components differ between the two surfaces.
// ─────────────────────────────────────────────────────────────────────────────
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Base64-encoded HMAC-SHA256 over `payload`, keyed with the API secret.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// REST prehash: `timestamp + method + requestPath(+query) + body`.
/// GET requests pass an empty body; the query string stays in the path.
pub fn rest_prehash(timestamp: &str, method: &str, request_path: &str, body: &str) -> String {
    format!("{}{}{}{}", timestamp, method, request_path, body)
}

/// REST timestamp: ISO-8601 with millisecond precision, UTC.
/// e.g. `2020-12-08T09:08:57.715Z`
pub fn rest_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// WS login timestamp: Unix epoch seconds as a decimal string.
pub fn ws_timestamp() -> String {
    Utc::now().timestamp().to_string()
}

/// WS login signature: HMAC over `timestamp + "GET" + "/users/self/verify"`.
pub fn ws_login_sign(secret: &str, timestamp: &str) -> String {
    sign(secret, &format!("{}GET/users/self/verify", timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_matches_known_hmac_vector() {
        // RFC test vector: HMAC-SHA256("key", "The quick brown fox...")
        let sig = sign("key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(sig, "97yD9DBThCSxMpjmqm+xQ+9NWaFJRhdZl0edvC0aPNg=");
    }

    #[test]
    fn sign_is_deterministic() {
        let a = sign("secret", "payload");
        let b = sign("secret", "payload");
        assert_eq!(a, b);
        assert_ne!(a, sign("secret", "other payload"));
        assert_ne!(a, sign("other secret", "payload"));
    }

    #[test]
    fn ws_login_sign_uses_verify_path() {
        let sig = ws_login_sign("SECRET", "1538054050");
        assert_eq!(sig, "gD6ujK2XAWUnyDDnLsGM0iw03T3xzw5qGtVGwp84zpw=");
        assert_eq!(sig, sign("SECRET", "1538054050GET/users/self/verify"));
    }

    #[test]
    fn rest_prehash_concatenates_in_order() {
        let prehash = rest_prehash(
            "2020-12-08T09:08:57.715Z",
            "POST",
            "/api/v5/trade/order",
            r#"{"instId":"BTC-USDT-SWAP"}"#,
        );
        assert_eq!(
            prehash,
            r#"2020-12-08T09:08:57.715ZPOST/api/v5/trade/order{"instId":"BTC-USDT-SWAP"}"#
        );
    }

    #[test]
    fn rest_timestamp_shape() {
        let ts = rest_timestamp();
        assert!(ts.ends_with('Z'));
        assert_eq!(ts.len(), "2020-12-08T09:08:57.715Z".len());
    }
}

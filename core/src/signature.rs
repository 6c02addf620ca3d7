//! HMAC-SHA256 webhook signatures.
//!
//! Signatures are lowercase hex, optionally prefixed with `sha256=`.
//! A signature carried inside the JSON body (`"signature"` field) covers
//! the body with that field removed, re-serialized with sorted keys.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const BODY_SIGNATURE_FIELD: &str = "signature";

fn mac_for(secret: &str) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length")
}

/// Compute the hex HMAC-SHA256 of `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of `signature` against `body`.
pub fn verify(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_sig = signature.trim();
    let hex_sig = hex_sig.strip_prefix("sha256=").unwrap_or(hex_sig);
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let mut mac = mac_for(secret);
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// The bytes a body-embedded signature covers, plus the signature itself.
/// Returns None when the body carries no signature field.
pub fn split_embedded(payload: &serde_json::Value) -> Option<(Vec<u8>, String)> {
    let object = payload.as_object()?;
    let signature = object.get(BODY_SIGNATURE_FIELD)?.as_str()?.to_string();
    let mut unsigned = object.clone();
    unsigned.remove(BODY_SIGNATURE_FIELD);
    let bytes = serde_json::to_vec(&serde_json::Value::Object(unsigned)).ok()?;
    Some((bytes, signature))
}

/// Sign a JSON object and embed the signature in it. Non-object
/// payloads are returned unchanged.
pub fn embed(secret: &str, payload: &serde_json::Value) -> serde_json::Result<serde_json::Value> {
    let mut signed = payload.clone();
    if let Some(object) = signed.as_object_mut() {
        object.remove(BODY_SIGNATURE_FIELD);
        let bytes = serde_json::to_vec(&*object)?;
        object.insert(
            BODY_SIGNATURE_FIELD.into(),
            serde_json::Value::String(sign(secret, &bytes)),
        );
    }
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_produces_hex_string() {
        let sig = sign("secret", b"hello world");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_prefixed_and_bare() {
        let sig = sign("secret", b"data");
        assert!(verify("secret", b"data", &sig));
        assert!(verify("secret", b"data", &format!("sha256={sig}")));
        assert!(!verify("other", b"data", &sig));
        assert!(!verify("secret", b"data", "not-hex"));
    }

    #[test]
    fn embedded_signature_round_trips() {
        let payload = serde_json::json!({"correlationId": "c-1", "status": "completed"});
        let signed = embed("secret", &payload).unwrap();
        let (bytes, sig) = split_embedded(&signed).unwrap();
        assert!(verify("secret", &bytes, &sig));
    }

    #[test]
    fn embed_replaces_a_stale_signature() {
        let payload = serde_json::json!({"correlationId": "c-1", "signature": "deadbeef"});
        let signed = embed("secret", &payload).unwrap();
        let (bytes, sig) = split_embedded(&signed).unwrap();
        assert_ne!(sig, "deadbeef");
        assert!(verify("secret", &bytes, &sig));
    }

    #[test]
    fn embed_leaves_non_objects_alone() {
        let payload = serde_json::json!(["not", "an", "object"]);
        assert_eq!(embed("secret", &payload).unwrap(), payload);
    }
}

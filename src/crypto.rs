//! Crypto primitives (§4.1): canonical signing base, Ed25519 sign/verify, timestamp-skew
//! validation, TTL parsing, seed-derived keys, webhook HMAC.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::models::Envelope;

pub const TIMESTAMP_SKEW: ChronoDuration = ChronoDuration::minutes(5);

type HmacSha256 = Hmac<Sha256>;

/// Generates a random Ed25519 keypair (legacy registration mode).
pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Builds the canonical signing base of §4.1: `timestamp`, base64(SHA-256(canonical JSON of
/// `body`)), `from`, `to`, `correlation_id` (or empty string), newline-joined.
pub fn canonical_signing_base(
    timestamp: &str,
    body: &serde_json::Value,
    from: &str,
    to: &str,
    correlation_id: Option<&str>,
) -> Result<String, String> {
    let canonical_body =
        serde_json::to_vec(body).map_err(|e| format!("cannot canonicalize body: {e}"))?;
    let body_hash = B64.encode(Sha256::digest(&canonical_body));
    Ok([
        timestamp,
        &body_hash,
        from,
        to,
        correlation_id.unwrap_or(""),
    ]
    .join("\n"))
}

/// Signs an envelope's canonical base with the given signing key. Returns base64 sig bytes.
pub fn sign_envelope(
    key: &SigningKey,
    timestamp: &str,
    body: &serde_json::Value,
    from: &str,
    to: &str,
    correlation_id: Option<&str>,
) -> Result<String, String> {
    let base = canonical_signing_base(timestamp, body, from, to, correlation_id)?;
    let sig: Signature = key.sign(base.as_bytes());
    Ok(B64.encode(sig.to_bytes()))
}

/// Verifies an envelope's signature against a candidate public key (base64, Ed25519).
pub fn verify_signature(
    public_key_b64: &str,
    timestamp: &str,
    body: &serde_json::Value,
    from: &str,
    to: &str,
    correlation_id: Option<&str>,
    sig_b64: &str,
) -> Result<bool, String> {
    let base = canonical_signing_base(timestamp, body, from, to, correlation_id)?;

    let key_bytes = B64
        .decode(public_key_b64)
        .map_err(|e| format!("invalid public key encoding: {e}"))?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|_| "public key must be 32 bytes".to_string())?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|e| format!("invalid public key: {e}"))?;

    let sig_bytes = B64
        .decode(sig_b64)
        .map_err(|e| format!("invalid signature encoding: {e}"))?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| "signature must be 64 bytes".to_string())?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(verifying_key.verify(base.as_bytes(), &signature).is_ok())
}

/// Convenience wrapper that verifies an envelope's signature field, if present, against one
/// candidate public key. Callers loop over the signer's acceptable keys (active + overlap).
pub fn verify_envelope_signature(
    envelope: &Envelope,
    public_key_b64: &str,
) -> Result<bool, String> {
    let Some(sig) = &envelope.signature else {
        return Ok(false);
    };
    verify_signature(
        public_key_b64,
        &envelope.timestamp,
        &envelope.body,
        &envelope.from,
        &envelope.to,
        envelope.correlation_id.as_deref(),
        &sig.sig,
    )
}

/// Validates that `timestamp` (RFC3339) lies within ±5 minutes of `now`.
pub fn validate_timestamp_skew(timestamp: &str, now: DateTime<Utc>) -> Result<(), String> {
    let ts = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("invalid timestamp: {e}"))?
        .with_timezone(&Utc);
    let delta = now - ts;
    if delta > TIMESTAMP_SKEW || delta < -TIMESTAMP_SKEW {
        return Err(format!(
            "timestamp {timestamp} outside +/-5 minute skew of hub clock"
        ));
    }
    Ok(())
}

/// Parses TTL syntax: a bare integer (seconds), or `<n>{s|m|h|d}`. Invalid or non-positive
/// input yields `None` so callers can apply their own default, per §4.1.
pub fn parse_ttl(input: &str) -> Option<i64> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (num_part, multiplier) = match input.chars().last() {
        Some('s') => (&input[..input.len() - 1], 1i64),
        Some('m') => (&input[..input.len() - 1], 60),
        Some('h') => (&input[..input.len() - 1], 3_600),
        Some('d') => (&input[..input.len() - 1], 86_400),
        _ => (input, 1),
    };
    let n: i64 = num_part.parse().ok()?;
    let seconds = n.checked_mul(multiplier)?;
    if seconds <= 0 {
        return None;
    }
    Some(seconds)
}

/// HKDF-SHA256 derivation context for seed-mode registration: `seedid/v1/admp:<tenant>:<agent_id>:ed25519:v<N>`.
pub fn seed_derivation_context(tenant_id: &str, agent_id: &str, version: u32) -> String {
    format!("seedid/v1/admp:{tenant_id}:{agent_id}:ed25519:v{version}")
}

/// Derives a deterministic Ed25519 signing key from a 32-byte master seed and a context
/// string, via HKDF-SHA256 with salt `"seedid/v1"`.
pub fn derive_seed_key(seed: &[u8], context: &str) -> Result<SigningKey, String> {
    let hk = Hkdf::<Sha256>::new(Some(b"seedid/v1"), seed);
    let mut okm = [0u8; 32];
    hk.expand(context.as_bytes(), &mut okm)
        .map_err(|e| format!("HKDF expand failed: {e}"))?;
    Ok(SigningKey::from_bytes(&okm))
}

/// Derives the `did:seed:<hex of first 16 bytes of SHA-256(pubkey)>` DID for a public key.
pub fn did_from_public_key(public_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    format!("did:seed:{}", hex::encode(&digest[..16]))
}

/// Computes the hex HMAC-SHA256 of `payload` (with its `signature` field nulled) keyed by
/// the agent's webhook secret, for both outbound webhook push and inbound receivers.
pub fn webhook_hmac(secret: &str, payload: &serde_json::Value) -> Result<String, String> {
    let mut nulled = payload.clone();
    if let Some(obj) = nulled.as_object_mut() {
        obj.insert("signature".to_string(), serde_json::Value::Null);
    }
    let canonical =
        serde_json::to_vec(&nulled).map_err(|e| format!("cannot canonicalize payload: {e}"))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| format!("invalid HMAC key: {e}"))?;
    mac.update(&canonical);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// SHA-256 hex digest, used for API key hashing (raw key never persisted).
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_roundtrip_and_bit_flip() {
        let key = generate_keypair();
        let pubkey_b64 = B64.encode(key.verifying_key().to_bytes());
        let body = serde_json::json!({"x": 1});
        let ts = Utc::now().to_rfc3339();
        let sig = sign_envelope(&key, &ts, &body, "agent://a", "agent://b", None).unwrap();

        assert!(verify_signature(&pubkey_b64, &ts, &body, "agent://a", "agent://b", None, &sig).unwrap());

        let other_body = serde_json::json!({"x": 2});
        assert!(!verify_signature(&pubkey_b64, &ts, &other_body, "agent://a", "agent://b", None, &sig).unwrap());
        assert!(!verify_signature(&pubkey_b64, &ts, &body, "agent://c", "agent://b", None, &sig).unwrap());
        assert!(!verify_signature(&pubkey_b64, &ts, &body, "agent://a", "agent://c", None, &sig).unwrap());
        assert!(!verify_signature(&pubkey_b64, &ts, &body, "agent://a", "agent://b", Some("corr-1"), &sig).unwrap());
    }

    #[test]
    fn seed_derivation_is_deterministic() {
        let seed = [7u8; 32];
        let ctx = seed_derivation_context("tenant-a", "agent://alice", 1);
        let k1 = derive_seed_key(&seed, &ctx).unwrap();
        let k2 = derive_seed_key(&seed, &ctx).unwrap();
        assert_eq!(k1.verifying_key().to_bytes(), k2.verifying_key().to_bytes());

        let ctx_v2 = seed_derivation_context("tenant-a", "agent://alice", 2);
        let k3 = derive_seed_key(&seed, &ctx_v2).unwrap();
        assert_ne!(k1.verifying_key().to_bytes(), k3.verifying_key().to_bytes());
    }

    #[test]
    fn ttl_parsing() {
        assert_eq!(parse_ttl("30"), Some(30));
        assert_eq!(parse_ttl("5m"), Some(300));
        assert_eq!(parse_ttl("2h"), Some(7200));
        assert_eq!(parse_ttl("1d"), Some(86_400));
        assert_eq!(parse_ttl("0"), None);
        assert_eq!(parse_ttl("-5s"), None);
        assert_eq!(parse_ttl("bogus"), None);
    }

    #[test]
    fn timestamp_skew_validation() {
        let now = Utc::now();
        assert!(validate_timestamp_skew(&now.to_rfc3339(), now).is_ok());
        let stale = now - ChronoDuration::minutes(10);
        assert!(validate_timestamp_skew(&stale.to_rfc3339(), now).is_err());
    }

    #[test]
    fn webhook_hmac_nulls_signature_field() {
        let payload = serde_json::json!({"a": 1, "signature": "whatever"});
        let h1 = webhook_hmac("secret", &payload).unwrap();
        let payload2 = serde_json::json!({"a": 1, "signature": null});
        let h2 = webhook_hmac("secret", &payload2).unwrap();
        assert_eq!(h1, h2);
    }
}

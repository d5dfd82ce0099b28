//! Signed role claims.
//!
//! A role claim is an object carrying `_name` (which role), an optional
//! `_state` (structured data the role vouches for), and `_sig`: an Ed25519
//! signature over a deterministic hash of the other two. The kernel signs
//! claims with the deployment's private key; schema adherence verifies them
//! with the public half, so a claim can be handed to clients and trusted
//! when it comes back.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::SignError;
use crate::value::Value;

/// The deployment's signing identity.
#[derive(Clone)]
pub struct RoleKeypair {
    signing: SigningKey,
}

impl RoleKeypair {
    /// Generate a fresh keypair from the system RNG.
    pub fn generate() -> Self {
        RoleKeypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its 32-byte secret.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        RoleKeypair {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The 32-byte secret, for persistence between deployments.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// The public half, handed to schema registries for verification.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

impl std::fmt::Debug for RoleKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never appears in logs.
        f.debug_struct("RoleKeypair")
            .field("verifying_key", &hex::encode(self.verifying_key().as_bytes()))
            .finish()
    }
}

/// Sign a claim object, attaching `_sig`.
///
/// The claim must be an object with a string `_name`; `_state` is included
/// in the hash when present. Any existing `_sig` is overwritten.
pub fn sign_claim(keypair: &RoleKeypair, claim: Value) -> Result<Value, SignError> {
    let mut map = match claim {
        Value::Object(map) => map,
        other => return Err(SignError::NotAnObject(other.type_name())),
    };
    let name = match map.get("_name").and_then(Value::as_str) {
        Some(n) => n.to_string(),
        None => return Err(SignError::MissingName),
    };
    let hash = claim_hash(&name, map.get("_state"));
    let sig: Signature = keypair.signing.sign(&hash);
    map.insert("_sig".to_string(), Value::String(hex::encode(sig.to_bytes())));
    Ok(Value::Object(map))
}

/// Verify a claim signature. Total: every malformed input is `false`.
pub fn verify_claim(
    key: &VerifyingKey,
    name: &str,
    state: Option<&Value>,
    sig_hex: &str,
) -> bool {
    let bytes = match hex::decode(sig_hex) {
        Ok(b) => b,
        Err(_) => return false,
    };
    let sig = match Signature::from_slice(&bytes) {
        Ok(s) => s,
        Err(_) => return false,
    };
    let hash = claim_hash(name, state);
    key.verify(&hash, &sig).is_ok()
}

/// Deterministic digest of a claim's name and state.
///
/// Objects hash in key order, so two structurally equal states always
/// produce the same digest.
pub fn claim_hash(name: &str, state: Option<&Value>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((name.len() as u64).to_le_bytes());
    hasher.update(name.as_bytes());
    match state {
        Some(v) => {
            hasher.update([1u8]);
            let mut bytes = Vec::new();
            canonical_bytes(v, &mut bytes);
            hasher.update(&bytes);
        }
        None => hasher.update([0u8]),
    }
    hasher.finalize().into()
}

fn canonical_bytes(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::None => out.push(0),
        Value::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        Value::Int(i) => {
            out.push(2);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Value::Double(d) => {
            out.push(3);
            out.extend_from_slice(&d.to_bits().to_le_bytes());
        }
        Value::String(s) => {
            out.push(4);
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            out.push(5);
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                canonical_bytes(item, out);
            }
        }
        Value::Object(map) => {
            out.push(6);
            out.extend_from_slice(&(map.len() as u64).to_le_bytes());
            for (k, v) in map {
                out.extend_from_slice(&(k.len() as u64).to_le_bytes());
                out.extend_from_slice(k.as_bytes());
                canonical_bytes(v, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(name: &str, state: Option<Value>) -> Value {
        let mut fields = vec![("_name".to_string(), Value::string(name))];
        if let Some(s) = state {
            fields.push(("_state".to_string(), s));
        }
        Value::object(fields)
    }

    #[test]
    fn test_sign_then_verify() {
        let kp = RoleKeypair::generate();
        let state = Value::object([("level".to_string(), Value::Int(3))]);
        let signed = sign_claim(&kp, claim("admin", Some(state.clone()))).unwrap();
        let sig = signed.as_object().unwrap()["_sig"].as_str().unwrap().to_string();
        assert!(verify_claim(&kp.verifying_key(), "admin", Some(&state), &sig));
    }

    #[test]
    fn test_forged_signature_fails() {
        let kp = RoleKeypair::generate();
        let forged = hex::encode([7u8; 64]);
        assert!(!verify_claim(&kp.verifying_key(), "admin", None, &forged));
        assert!(!verify_claim(&kp.verifying_key(), "admin", None, "not hex"));
    }

    #[test]
    fn test_tampered_state_fails() {
        let kp = RoleKeypair::generate();
        let state = Value::object([("level".to_string(), Value::Int(3))]);
        let signed = sign_claim(&kp, claim("admin", Some(state))).unwrap();
        let sig = signed.as_object().unwrap()["_sig"].as_str().unwrap().to_string();
        let tampered = Value::object([("level".to_string(), Value::Int(9))]);
        assert!(!verify_claim(&kp.verifying_key(), "admin", Some(&tampered), &sig));
        assert!(!verify_claim(&kp.verifying_key(), "root", None, &sig));
    }

    #[test]
    fn test_sign_requires_named_object() {
        let kp = RoleKeypair::generate();
        assert!(matches!(
            sign_claim(&kp, Value::Int(4)),
            Err(SignError::NotAnObject("int"))
        ));
        assert!(matches!(
            sign_claim(&kp, Value::object([])),
            Err(SignError::MissingName)
        ));
    }

    #[test]
    fn test_claim_hash_ignores_field_order_by_construction() {
        let a = Value::object([
            ("x".to_string(), Value::Int(1)),
            ("y".to_string(), Value::Int(2)),
        ]);
        let b = Value::object([
            ("y".to_string(), Value::Int(2)),
            ("x".to_string(), Value::Int(1)),
        ]);
        assert_eq!(claim_hash("r", Some(&a)), claim_hash("r", Some(&b)));
    }

    #[test]
    fn test_keypair_round_trip() {
        let kp = RoleKeypair::generate();
        let restored = RoleKeypair::from_bytes(&kp.to_bytes());
        let signed = sign_claim(&restored, claim("svc", None)).unwrap();
        let sig = signed.as_object().unwrap()["_sig"].as_str().unwrap().to_string();
        assert!(verify_claim(&kp.verifying_key(), "svc", None, &sig));
    }
}

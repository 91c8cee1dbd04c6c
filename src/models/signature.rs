//! Electronic signature model and integrity hash

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stored electronic signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ElectronicSignature {
    pub id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub meaning: String,
    pub record_version: i64,
    pub signed_at: DateTime<Utc>,
    pub signature_hash: String,
}

impl ElectronicSignature {
    /// Recompute the hash from the stored fields
    pub fn recompute_hash(&self) -> String {
        compute_signature_hash(&SignaturePayload {
            user_id: self.user_id,
            entity_type: &self.entity_type,
            entity_id: &self.entity_id,
            action: &self.action,
            meaning: &self.meaning,
            record_version: self.record_version,
            signed_at: self.signed_at,
        })
    }

    /// True when the stored hash matches the stored fields
    pub fn verify(&self) -> bool {
        constant_time_eq(self.recompute_hash().as_bytes(), self.signature_hash.as_bytes())
    }
}

/// Fields covered by the signature hash
#[derive(Debug, Clone, Copy)]
pub struct SignaturePayload<'a> {
    pub user_id: Uuid,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub action: &'a str,
    pub meaning: &'a str,
    pub record_version: i64,
    pub signed_at: DateTime<Utc>,
}

/// SHA-256 over `user_id|entity_type|entity_id|action|meaning|record_version|timestamp`,
/// hex encoded. The timestamp is RFC 3339 with microsecond precision.
pub fn compute_signature_hash(payload: &SignaturePayload<'_>) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}",
        payload.user_id,
        payload.entity_type,
        payload.entity_id,
        payload.action,
        payload.meaning,
        payload.record_version,
        payload.signed_at.to_rfc3339_opts(SecondsFormat::Micros, true),
    );

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Request to sign a record
#[derive(Debug, Clone)]
pub struct NewSignature {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub meaning: String,
    pub record_version: i64,
}

/// Re-authentication supplied with a signature-bearing action
#[derive(Clone, Deserialize)]
pub struct SignatureCredentials {
    pub password: String,
    pub meaning: String,
}

impl std::fmt::Debug for SignatureCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureCredentials")
            .field("password", &"[REDACTED]")
            .field("meaning", &self.meaning)
            .finish()
    }
}
